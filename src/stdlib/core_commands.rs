//! Core reference commands (§11): `echo`, `set`/`get`, `true`/`false`, and
//! `sleep_token`.
//!
//! Grounded on the teacher's `commands/echo/mod.rs` for the
//! join-args-with-a-space-then-append-newline shape (escape processing and
//! `-n`/`-e` flags are bash-specific and dropped — PawScript's `echo` is a
//! plain output sink per `spec.md` §8's end-to-end scenarios).

use std::sync::Arc;

use crate::executor::{CommandHandler, ExecResult, HandlerContext};
use crate::object_store::ObjectStore;
use crate::state::ExecutionState;
use crate::token_manager::TokenManager;
use crate::value::Value;

/// Where `echo` writes. A real host wires `StdoutSink`; tests wire an
/// in-memory one to assert against (`spec.md` §8: "`echo` writes to a test
/// sink").
pub trait OutputSink: Send + Sync {
    fn write_line(&self, text: &str);
}

pub struct StdoutSink;

impl OutputSink for StdoutSink {
    fn write_line(&self, text: &str) {
        println!("{text}");
    }
}

#[derive(Default)]
pub struct MemorySink {
    lines: std::sync::Mutex<Vec<String>>,
}

impl MemorySink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn lines(&self) -> Vec<String> {
        self.lines.lock().unwrap().clone()
    }
}

impl OutputSink for MemorySink {
    fn write_line(&self, text: &str) {
        self.lines.lock().unwrap().push(text.to_string());
    }
}

pub struct EchoCommand {
    sink: Arc<dyn OutputSink>,
}

impl EchoCommand {
    pub fn new(sink: Arc<dyn OutputSink>) -> Self {
        Self { sink }
    }
}

impl CommandHandler for EchoCommand {
    fn call(&self, mut ctx: HandlerContext, store: &ObjectStore, _tokens: &TokenManager) -> (ExecutionState, ExecResult) {
        let joined = ctx.args.iter().map(Value::stringify).collect::<Vec<_>>().join(" ");
        self.sink.write_line(&joined);
        ctx.set_result(store, Value::Str(joined));
        (ctx.state, ExecResult::Bool(true))
    }
}

/// `set name, value`: an ordinary command-form alternative to the native
/// `name: value` assignment syntax, for hosts that only ever dispatch
/// commands programmatically.
pub struct SetCommand;

impl CommandHandler for SetCommand {
    fn call(&self, mut ctx: HandlerContext, store: &ObjectStore, _tokens: &TokenManager) -> (ExecutionState, ExecResult) {
        let Some(name) = ctx.args.first().map(Value::stringify) else {
            return (ctx.state, ExecResult::Bool(false));
        };
        let value = ctx.args.get(1).cloned().unwrap_or(Value::Nil);
        ctx.state.set_var(store, &name, value.clone());
        ctx.set_result(store, value);
        (ctx.state, ExecResult::Bool(true))
    }
}

pub struct GetCommand;

impl CommandHandler for GetCommand {
    fn call(&self, mut ctx: HandlerContext, store: &ObjectStore, _tokens: &TokenManager) -> (ExecutionState, ExecResult) {
        let Some(name) = ctx.args.first().map(Value::stringify) else {
            return (ctx.state, ExecResult::Bool(false));
        };
        match ctx.state.get_var(&name) {
            Some(v) => {
                ctx.set_result(store, v);
                (ctx.state, ExecResult::Bool(true))
            }
            None => (ctx.state, ExecResult::Bool(false)),
        }
    }
}

pub struct TrueCommand;

impl CommandHandler for TrueCommand {
    fn call(&self, ctx: HandlerContext, _store: &ObjectStore, _tokens: &TokenManager) -> (ExecutionState, ExecResult) {
        (ctx.state, ExecResult::Bool(true))
    }
}

pub struct FalseCommand;

impl CommandHandler for FalseCommand {
    fn call(&self, ctx: HandlerContext, _store: &ObjectStore, _tokens: &TokenManager) -> (ExecutionState, ExecResult) {
        (ctx.state, ExecResult::Bool(false))
    }
}

/// A demonstration async-suspending command (C8): requests a token and
/// hands it back immediately, leaving the actual resumption to the host —
/// e.g. a `tokio::time::sleep` followed by `Engine::resume_token`, as in
/// `spec.md` §8 scenario 6. The command itself never schedules its own
/// resumption; that stays the host's responsibility, matching `spec.md`
/// §5's "the engine is driven, not self-driving."
pub struct SleepTokenCommand;

impl CommandHandler for SleepTokenCommand {
    fn call(&self, mut ctx: HandlerContext, _store: &ObjectStore, tokens: &TokenManager) -> (ExecutionState, ExecResult) {
        let token = ctx.request_token(tokens, None);
        (ctx.state, ExecResult::Token(token))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::module_env::ModuleEnvironment;
    use indexmap::IndexMap;

    fn ctx(args: Vec<Value>) -> (ObjectStore, HandlerContext) {
        let store = ObjectStore::new();
        let state = ExecutionState::new_root(ModuleEnvironment::new_root("main"));
        (
            store,
            HandlerContext {
                args,
                raw_args: Vec::new(),
                named_args: IndexMap::new(),
                position: crate::position::SourcePosition::synthetic(),
                state,
            },
        )
    }

    #[test]
    fn echo_joins_args_and_writes_to_sink() {
        let sink = Arc::new(MemorySink::new());
        let cmd = EchoCommand::new(sink.clone());
        let tokens = TokenManager::new(std::time::Duration::from_secs(1));
        let (store, c) = ctx(vec![Value::Int(7), Value::Int(3)]);
        let (_state, result) = cmd.call(c, &store, &tokens);
        assert!(matches!(result, ExecResult::Bool(true)));
        assert_eq!(sink.lines(), vec!["7 3".to_string()]);
    }

    #[test]
    fn set_then_get_round_trips_a_variable() {
        let tokens = TokenManager::new(std::time::Duration::from_secs(1));
        let (store, c) = ctx(vec![Value::Symbol("x".to_string()), Value::Int(9)]);
        let (state, result) = SetCommand.call(c, &store, &tokens);
        assert!(matches!(result, ExecResult::Bool(true)));

        let c2 = HandlerContext { args: vec![Value::Symbol("x".to_string())], raw_args: vec![], named_args: IndexMap::new(), position: crate::position::SourcePosition::synthetic(), state };
        let (_state, result) = GetCommand.call(c2, &store, &tokens);
        assert!(matches!(result, ExecResult::Bool(true)));
    }

    #[test]
    fn sleep_token_returns_a_live_token() {
        let tokens = TokenManager::new(std::time::Duration::from_secs(1));
        let (store, c) = ctx(vec![]);
        let (_state, result) = SleepTokenCommand.call(c, &store, &tokens);
        match result {
            ExecResult::Token(t) => assert!(tokens.is_alive(&t)),
            _ => panic!("expected a token"),
        }
    }
}
