//! Error kinds & log-filter configuration (C10).
//!
//! Mirrors the teacher's `interpreter/errors.rs`: one variant per error
//! kind, unified under a single enum. Where the teacher's control-flow
//! errors (`BreakError`, `ReturnError`, ...) carry accumulated stdout/stderr
//! because bash threads textual output through every propagation step,
//! PawScript's result slot and log sink are ambient (owned by
//! `ExecutionState` / the engine), so `EngineError` only needs to carry a
//! message, a position, and a macro chain.

use std::collections::HashMap;
use std::sync::Arc;
use thiserror::Error;

use crate::position::SourcePosition;

/// The fixed set of error kinds from `spec.md` §7.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    Parse,
    UnknownCommand,
    ArgumentValidation,
    VariableNotFound,
    Io,
    MacroNotFound,
    Timeout,
    Internal,
}

impl ErrorKind {
    /// Parse errors and unknown-command errors are always logged
    /// regardless of debug settings, per `spec.md` §7.
    pub fn always_logged(self) -> bool {
        matches!(self, ErrorKind::Parse | ErrorKind::UnknownCommand)
    }
}

/// Categories used to key per-module log filter configuration. Distinct
/// from `ErrorKind` because log categories also cover non-error debug
/// traffic (substitution tracing, token lifecycle).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorCategory {
    Parse,
    Command,
    Substitution,
    Token,
    Module,
    Macro,
    General,
}

impl From<ErrorKind> for ErrorCategory {
    fn from(kind: ErrorKind) -> Self {
        match kind {
            ErrorKind::Parse => ErrorCategory::Parse,
            ErrorKind::UnknownCommand => ErrorCategory::Command,
            ErrorKind::ArgumentValidation => ErrorCategory::Command,
            ErrorKind::VariableNotFound => ErrorCategory::Substitution,
            ErrorKind::Io => ErrorCategory::General,
            ErrorKind::MacroNotFound => ErrorCategory::Macro,
            ErrorKind::Timeout => ErrorCategory::Token,
            ErrorKind::Internal => ErrorCategory::General,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum LogLevel {
    Debug,
    Warn,
    Error,
}

/// The top-level engine error type. One variant per `ErrorKind`.
#[derive(Debug, Clone, Error)]
pub enum EngineError {
    #[error("parse error at {position}: {message}")]
    Parse { message: String, position: SourcePosition },

    #[error("unknown command '{name}' at {position}")]
    UnknownCommand { name: String, position: SourcePosition },

    #[error("argument error in '{command}' at {position}: {message}")]
    ArgumentValidation { command: String, message: String, position: SourcePosition },

    #[error("variable '{name}' not found at {position}")]
    VariableNotFound { name: String, position: SourcePosition },

    #[error("io error: {message}")]
    Io { message: String },

    #[error("macro '{name}' not found at {position}")]
    MacroNotFound { name: String, position: SourcePosition },

    #[error("token '{token}' timed out after {deadline_ms}ms")]
    Timeout { token: String, deadline_ms: u64 },

    #[error("internal error: {message}")]
    Internal { message: String },
}

impl EngineError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            EngineError::Parse { .. } => ErrorKind::Parse,
            EngineError::UnknownCommand { .. } => ErrorKind::UnknownCommand,
            EngineError::ArgumentValidation { .. } => ErrorKind::ArgumentValidation,
            EngineError::VariableNotFound { .. } => ErrorKind::VariableNotFound,
            EngineError::Io { .. } => ErrorKind::Io,
            EngineError::MacroNotFound { .. } => ErrorKind::MacroNotFound,
            EngineError::Timeout { .. } => ErrorKind::Timeout,
            EngineError::Internal { .. } => ErrorKind::Internal,
        }
    }

    pub fn position(&self) -> Option<&SourcePosition> {
        match self {
            EngineError::Parse { position, .. }
            | EngineError::UnknownCommand { position, .. }
            | EngineError::ArgumentValidation { position, .. }
            | EngineError::VariableNotFound { position, .. }
            | EngineError::MacroNotFound { position, .. } => Some(position),
            _ => None,
        }
    }
}

/// Per-category log visibility configuration for a `ModuleEnvironment`.
/// Copy-on-write: children share their parent's `Arc` until one of them
/// calls a mutating setter.
#[derive(Debug, Clone, Default)]
pub struct LogFilterConfig {
    pub default_level: Option<LogLevel>,
    pub floor: HashMap<ErrorCategory, LogLevel>,
    pub force: HashMap<ErrorCategory, LogLevel>,
}

impl LogFilterConfig {
    /// Resolve the effective minimum level for `category`, given `debug`
    /// (the engine-wide debug flag from `EngineOptions`).
    pub fn effective_level(&self, category: ErrorCategory, debug: bool) -> LogLevel {
        if let Some(level) = self.force.get(&category) {
            return *level;
        }
        if let Some(level) = self.floor.get(&category) {
            return *level;
        }
        if let Some(level) = self.default_level {
            return level;
        }
        if debug { LogLevel::Debug } else { LogLevel::Warn }
    }
}

pub type SharedLogFilter = Arc<LogFilterConfig>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn force_overrides_floor() {
        let mut cfg = LogFilterConfig::default();
        cfg.floor.insert(ErrorCategory::Command, LogLevel::Debug);
        cfg.force.insert(ErrorCategory::Command, LogLevel::Error);
        assert_eq!(cfg.effective_level(ErrorCategory::Command, false), LogLevel::Error);
    }

    #[test]
    fn default_debug_flag_used_when_unconfigured() {
        let cfg = LogFilterConfig::default();
        assert_eq!(cfg.effective_level(ErrorCategory::General, true), LogLevel::Debug);
        assert_eq!(cfg.effective_level(ErrorCategory::General, false), LogLevel::Warn);
    }

    #[test]
    fn parse_and_unknown_command_always_logged() {
        assert!(ErrorKind::Parse.always_logged());
        assert!(ErrorKind::UnknownCommand.always_logged());
        assert!(!ErrorKind::Io.always_logged());
    }
}
