//! Standard library surface (§11): a minimal reference set of commands,
//! enough to exercise and test the engine end-to-end.
//!
//! Grounded on the teacher's `commands/` tree (one file per command, a
//! shared `Command` trait, registered into a lookup table at startup) —
//! `registerStandardLibrary` plays the role of the teacher's command-table
//! bootstrap, just over `CommandHandler`/`CommandRegistry` instead of
//! `Command`/a `HashMap<&str, Box<dyn Command>>`.

pub mod core_commands;

use std::sync::Arc;

use crate::engine::Engine;

/// Register every stdlib command into `engine`'s command registry under
/// the `main` module.
pub fn register_all(engine: &Engine) {
    engine.register_command("echo", Arc::new(core_commands::EchoCommand::new(Arc::new(core_commands::StdoutSink))));
    engine.register_command("set", Arc::new(core_commands::SetCommand));
    engine.register_command("get", Arc::new(core_commands::GetCommand));
    engine.register_command("true", Arc::new(core_commands::TrueCommand));
    engine.register_command("false", Arc::new(core_commands::FalseCommand));
    engine.register_command("sleep_token", Arc::new(core_commands::SleepTokenCommand));
}
