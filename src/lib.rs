//! pawscript - an embeddable shell-style scripting language
//!
//! This crate provides a lexer, parser, substitution engine, and
//! cooperative-suspension executor for the PawScript command language,
//! plus the `Engine` host API that wires them together.

pub mod engine;
pub mod errors;
pub mod executor;
pub mod lexer;
pub mod log_surface;
pub mod macros;
pub mod module_env;
pub mod object_store;
pub mod parser;
pub mod position;
pub mod sandbox;
pub mod state;
pub mod stdlib;
pub mod substitution;
pub mod token_manager;
pub mod value;

pub use engine::{Engine, EngineOptions, ExecOptions, Outcome};
pub use errors::{EngineError, ErrorCategory, ErrorKind, LogFilterConfig, LogLevel};
pub use executor::{CommandHandler, CommandRegistry, ExecResult, HandlerContext};
pub use object_store::{ObjectId, ObjectStore};
pub use sandbox::{RootKind, SandboxPolicy};
pub use token_manager::{TokenId, TokenManager};
pub use value::{ObjectKind, Value};
