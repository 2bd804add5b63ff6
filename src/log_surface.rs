//! Structured log surface (C10, ambient).
//!
//! Wraps `tracing` so every engine log call carries an `ErrorCategory` and
//! goes through `LogFilterConfig` before deciding whether to actually
//! emit. Parse errors and unknown-command errors always emit at `ERROR`,
//! per `spec.md` §7, bypassing the per-category floor.

use crate::errors::{ErrorCategory, LogLevel, LogFilterConfig};
use crate::position::SourcePosition;

/// Emit a log event for `category` at `level`, gated by `filter` unless
/// `force_error` is set (used for parse/unknown-command errors, which must
/// always surface).
pub fn log_event(
    filter: &LogFilterConfig,
    debug: bool,
    category: ErrorCategory,
    level: LogLevel,
    force_error: bool,
    position: Option<&SourcePosition>,
    message: &str,
) {
    if !force_error {
        let effective = filter.effective_level(category, debug);
        if level < effective {
            return;
        }
    }
    let cat = category_name(category);
    let pos = position.map(|p| p.to_string()).unwrap_or_default();
    match level {
        LogLevel::Debug => tracing::debug!(category = cat, position = %pos, "{}", message),
        LogLevel::Warn => tracing::warn!(category = cat, position = %pos, "{}", message),
        LogLevel::Error => tracing::error!(category = cat, position = %pos, "{}", message),
    }
}

fn category_name(category: ErrorCategory) -> &'static str {
    match category {
        ErrorCategory::Parse => "parse",
        ErrorCategory::Command => "command",
        ErrorCategory::Substitution => "substitution",
        ErrorCategory::Token => "token",
        ErrorCategory::Module => "module",
        ErrorCategory::Macro => "macro",
        ErrorCategory::General => "general",
    }
}

/// Install a `tracing_subscriber` formatter honoring `RUST_LOG`, falling
/// back to `info` (or `debug` when `debug` is set). Safe to call more than
/// once; later calls are no-ops.
pub fn init_tracing(debug: bool) {
    use tracing_subscriber::EnvFilter;

    let default_directive = if debug { "debug" } else { "info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_directive));
    let _ = tracing_subscriber::fmt().with_env_filter(filter).try_init();
}
