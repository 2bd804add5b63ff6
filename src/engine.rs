//! Host-facing API (§6 "Engine API exposed to the host").
//!
//! Grounded on the teacher's `bash.rs::Bash` (one long-lived struct owning
//! the filesystem/state and exposing an `async fn exec`, options structs
//! for construction vs. per-call overrides). `Engine::execute` plays the
//! same "async entry point wrapping a synchronous core" role as
//! `Bash::exec`'s `tokio::task::block_in_place` bridge — PawScript's core
//! is synchronous by construction (§5: "ExecutionState is not shared
//! across interpreter threads"), so there is no actual blocking call to
//! make, but the method stays `async` so a host driving many engines
//! concurrently can `.await` it uniformly.

use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use indexmap::IndexMap;

use crate::errors::{EngineError, LogFilterConfig};
use crate::executor::{self, BoxedHandler, CommandRegistry, ExecResult, Runner};
use crate::macros;
use crate::module_env::ModuleEnvironment;
use crate::object_store::{ObjectId, ObjectStore};
use crate::position::SourcePosition;
use crate::sandbox::SandboxPolicy;
use crate::state::{ExecutionLimits, ExecutionState};
use crate::substitution::{self, SubstitutionContext};
use crate::token_manager::{CleanupFn, TokenId, TokenManager};
use crate::value::{ListData, ObjectKind, Value};

/// Construction-time options (`configure(options)`).
#[derive(Default)]
pub struct EngineOptions {
    pub debug: bool,
    pub default_token_timeout_ms: Option<u64>,
    pub enable_macros: bool,
    pub script_dir: Option<PathBuf>,
    pub read_roots: Vec<PathBuf>,
    pub write_roots: Vec<PathBuf>,
    pub exec_roots: Vec<PathBuf>,
    pub limits: ExecutionLimits,
}

/// Per-call overrides for `execute`.
#[derive(Default)]
pub struct ExecOptions {
    pub args: Vec<Value>,
    pub file_name: Option<String>,
}

/// The final outcome of a top-level `execute` call once every pending
/// suspension under it has resolved (or handed back a token the host must
/// itself resume later).
pub enum Outcome {
    Status(bool),
    Value(Value),
    Token(TokenId),
}

/// The engine's long-lived, shared state: the command registry, token
/// graph, object store, root `ModuleEnvironment`, and sandbox policy. One
/// `Engine` is meant to be driven from a single logical thread at a time
/// (§5), though its internals are `Send + Sync` so a host may still move
/// it across an executor's worker threads between calls.
pub struct Engine {
    store: ObjectStore,
    tokens: TokenManager,
    registry: CommandRegistry,
    fallback: Mutex<Option<BoxedHandler>>,
    root_env: Mutex<ModuleEnvironment>,
    sandbox: SandboxPolicy,
    enable_macros: bool,
    script_dir: Option<PathBuf>,
    debug: bool,
    limits: Arc<ExecutionLimits>,
}

impl Engine {
    pub fn new(options: EngineOptions) -> Self {
        let timeout = Duration::from_millis(options.default_token_timeout_ms.unwrap_or(300_000));
        let mut root_env = ModuleEnvironment::new_root("main");
        root_env.set_log_filter(LogFilterConfig::default());
        Self {
            store: ObjectStore::new(),
            tokens: TokenManager::new(timeout),
            registry: CommandRegistry::new(),
            fallback: Mutex::new(None),
            root_env: Mutex::new(root_env),
            sandbox: SandboxPolicy::new(options.read_roots, options.write_roots, options.exec_roots),
            enable_macros: options.enable_macros,
            script_dir: options.script_dir,
            debug: options.debug,
            limits: Arc::new(options.limits),
        }
    }

    pub fn sandbox(&self) -> &SandboxPolicy {
        &self.sandbox
    }

    pub fn script_dir(&self) -> Option<&PathBuf> {
        self.script_dir.as_ref()
    }

    pub fn object_store(&self) -> &ObjectStore {
        &self.store
    }

    pub fn tokens(&self) -> &TokenManager {
        &self.tokens
    }

    pub fn register_command(&self, name: impl Into<String>, handler: BoxedHandler) {
        self.register_command_in_module("main", name, handler);
    }

    pub fn register_command_in_module(&self, module: impl Into<String>, name: impl Into<String>, handler: BoxedHandler) {
        let module = module.into();
        let name = name.into();
        self.registry.register(module.clone(), name.clone(), handler.clone());
        self.root_env.lock().unwrap().bind_command(name.clone(), module, name);
    }

    /// Install the built-in modules (`registerStandardLibrary`). Wires a
    /// fresh `#args` list from `script_args` into the root environment so
    /// macros/blocks invoked at top level can read it via `~args`.
    pub fn register_standard_library(&self, script_args: Vec<String>) {
        crate::stdlib::register_all(self);
        let mut list = ListData::new();
        list.items = script_args.into_iter().map(Value::Str).collect();
        let id = self.store.store(crate::object_store::Payload::List(list));
        self.root_env.lock().unwrap().set_object("args", Value::Object(id, ObjectKind::List));
    }

    pub fn set_fallback_handler(&self, handler: BoxedHandler) {
        *self.fallback.lock().unwrap() = Some(handler);
    }

    fn fresh_root_state(&self) -> ExecutionState {
        let env = self.root_env.lock().unwrap().clone();
        ExecutionState::new_root_with_limits(env, self.limits.clone())
    }

    fn run_to_settled(&self, state: ExecutionState, outcome: Result<ExecResult, EngineError>) -> Result<Outcome, EngineError> {
        match outcome {
            Err(e) => Err(e),
            Ok(ExecResult::Bool(status)) => {
                if let Some(v) = state.get_result() {
                    Ok(Outcome::Value(v.clone()))
                } else {
                    Ok(Outcome::Status(status))
                }
            }
            Ok(ExecResult::EarlyReturn { status, value }) => Ok(value.map(Outcome::Value).unwrap_or(Outcome::Status(status))),
            Ok(ExecResult::Yield { value }) => Ok(Outcome::Value(value)),
            Ok(ExecResult::Suspend) => Ok(Outcome::Status(state.last_status)),
            Ok(ExecResult::Token(token)) => {
                // The top-level call itself suspended with no further
                // caller to hand the state to: this is the terminal owner,
                // so attach it and hand the token back to the host.
                self.tokens.attach_owning_state(&token, state);
                Ok(Outcome::Token(token))
            }
        }
    }

    fn runner(&self) -> Runner<'_> {
        Runner { tokens: &self.tokens, registry: &self.registry, fallback: None, debug: self.debug }
    }

    /// `execute(text, …args)`: if `options.args` is non-empty, `text` is
    /// dispatched directly as a command name, bypassing parsing — no
    /// token is allowed to escape that path (§6).
    pub async fn execute(&self, text: &str, options: ExecOptions) -> Result<Outcome, EngineError> {
        let fallback_guard = self.fallback.lock().unwrap().clone();
        let mut runner = self.runner();
        runner.fallback = fallback_guard.as_ref();

        let state = self.fresh_root_state();
        if !options.args.is_empty() {
            let named = IndexMap::new();
            let raw_args = options.args.iter().map(Value::stringify).collect();
            let (state, result) = dispatch_direct(text, options.args, raw_args, named, state, &mut runner, &self.store);
            return match result {
                Ok(ExecResult::Token(_)) => Err(EngineError::Internal {
                    message: "a direct dispatch (execute with positional args) may not return a token".to_string(),
                }),
                other => self.run_to_settled(state, other),
            };
        }

        let file = options.file_name.unwrap_or_else(|| "<script>".to_string());
        let (state, outcome) = executor::execute_top_level(text, &file, state, &mut runner, &self.store, &SubstitutionContext::empty());
        self.run_to_settled(state, outcome)
    }

    pub fn define_macro(&self, name: impl Into<String>, body: impl Into<String>) -> Result<ObjectId, EngineError> {
        if !self.enable_macros {
            return Err(EngineError::Internal { message: "macros are disabled for this engine".to_string() });
        }
        let id = macros::define(&self.store, body.into(), SourcePosition::synthetic(), None, Vec::new());
        self.root_env.lock().unwrap().bind_macro(name.into(), id);
        Ok(id)
    }

    pub async fn execute_macro(&self, name: &str) -> Result<Outcome, EngineError> {
        let macro_id = self
            .root_env
            .lock()
            .unwrap()
            .resolve_macro(name)
            .ok_or_else(|| EngineError::MacroNotFound { name: name.to_string(), position: SourcePosition::synthetic() })?;
        let fallback_guard = self.fallback.lock().unwrap().clone();
        let mut runner = self.runner();
        runner.fallback = fallback_guard.as_ref();
        let state = self.fresh_root_state();
        let (state, outcome) = macros::execute(macro_id, vec![], IndexMap::new(), state, &mut runner, &self.store, SourcePosition::synthetic());
        self.run_to_settled(state, outcome)
    }

    pub fn list_macros(&self) -> Vec<String> {
        self.root_env.lock().unwrap().bound_macro_names()
    }

    pub fn has_macro(&self, name: &str) -> bool {
        self.root_env.lock().unwrap().resolve_macro(name).is_some()
    }

    pub fn delete_macro(&self, name: &str) {
        self.root_env.lock().unwrap().remove(name);
    }

    pub fn clear_macros(&self) {
        for name in self.list_macros() {
            self.delete_macro(&name);
        }
    }

    pub fn request_token(&self, cleanup: Option<CleanupFn>, timeout: Option<Duration>) -> TokenId {
        self.tokens.request_token(None, cleanup, None, timeout)
    }

    /// `resumeToken(token, status, result?, hasResult?)`: drives the
    /// `ResumeOutcome` loop until the token chain settles into a final
    /// status, a new pending token, or an error.
    pub fn resume_token(&self, token: &TokenId, status: bool, value: Option<Value>) -> Result<Outcome, EngineError> {
        let fallback_guard = self.fallback.lock().unwrap().clone();
        let mut runner = self.runner();
        runner.fallback = fallback_guard.as_ref();

        let mut current = token.clone();
        let mut current_status = status;
        let mut current_value = value;
        loop {
            match self.tokens.resume(&current, current_status, current_value.clone()) {
                crate::token_manager::ResumeOutcome::Done { status, value } => {
                    return Ok(value.map(Outcome::Value).unwrap_or(Outcome::Status(status)));
                }
                crate::token_manager::ResumeOutcome::ChainTo { token: next, status, value } => {
                    current = next;
                    current_status = status;
                    current_value = value;
                }
                crate::token_manager::ResumeOutcome::ContinueSequence { state, sequence, status, invert } => {
                    let (state, outcome) = executor::resume_sequence(sequence, state, status, &mut runner, &self.store);
                    let outcome = outcome.map(|r| apply_sequence_invert(r, invert, &self.tokens));
                    return self.run_to_settled(state, outcome);
                }
                crate::token_manager::ResumeOutcome::ResumeBrace { state, coordinator, status: _, value } => {
                    let text = value.as_ref().map(Value::stringify).unwrap_or_default();
                    let base = coordinator.brace_position.clone();
                    let stage_a = substitution::resume_stage_a(&coordinator, &text, &state, &self.store, &mut runner, move |_| base.clone());
                    match stage_a {
                        Err(e) => return Err(e),
                        Ok(substitution::StageAOutcome::Text(spliced)) => {
                            let final_text = substitution::run_stage_b(&spliced, &SubstitutionContext::empty());
                            let trimmed = final_text.trim();
                            let parsed = crate::parser::parse_single_value(trimmed, &SourcePosition::synthetic());
                            let resolved = parsed.ok().map(|a| Value::Str(a.text)).unwrap_or(Value::Str(trimmed.to_string()));
                            let mut state = state;
                            state.set_result(&self.store, resolved.clone());
                            return Ok(Outcome::Value(resolved));
                        }
                        Ok(substitution::StageAOutcome::Suspended(new_coordinator, new_token)) => {
                            self.tokens.attach_brace_coordinator(&new_token, new_coordinator);
                            self.tokens.attach_owning_state(&new_token, state);
                            return Ok(Outcome::Token(new_token));
                        }
                    }
                }
            }
        }
    }

    pub fn force_cleanup_token(&self, token: &TokenId) {
        self.tokens.force_clean(token);
    }

    pub fn get_token_status(&self, token: &TokenId) -> bool {
        self.tokens.is_alive(token)
    }

    /// Periodically invoked by a host-driven timer to honor per-token
    /// deadlines (§5 "Timeouts apply per-token with a configurable
    /// default").
    pub fn sweep_timeouts(&self) -> Vec<TokenId> {
        self.tokens.sweep_timeouts()
    }
}

fn apply_sequence_invert(result: ExecResult, invert: bool, tokens: &TokenManager) -> ExecResult {
    if !invert {
        return result;
    }
    match result {
        ExecResult::Bool(s) => ExecResult::Bool(!s),
        ExecResult::Token(t) => {
            tokens.set_invert(&t, true);
            ExecResult::Token(t)
        }
        other => other,
    }
}

/// `execute(text, …args)` with a non-empty `args`: dispatch `text`
/// directly as a registered command name, skipping lexing/parsing
/// entirely (§6).
fn dispatch_direct(
    name: &str,
    args: Vec<Value>,
    raw_args: Vec<String>,
    named: IndexMap<String, Value>,
    state: ExecutionState,
    runner: &mut Runner,
    store: &ObjectStore,
) -> (ExecutionState, Result<ExecResult, EngineError>) {
    let default_module = state.module_env.default_module().to_string();
    let resolved = state.module_env.resolve_command(name).unwrap_or((default_module, name.to_string()));
    if let Some(handler) = runner.registry.get(&resolved.0, &resolved.1) {
        let ctx = crate::executor::HandlerContext { args, raw_args, named_args: named, position: SourcePosition::synthetic(), state };
        let (state, result) = handler.call(ctx, store, runner.tokens);
        return (state, Ok(result));
    }
    if let Some(handler) = runner.fallback {
        let ctx = crate::executor::HandlerContext { args, raw_args, named_args: named, position: SourcePosition::synthetic(), state };
        let (state, result) = handler.call(ctx, store, runner.tokens);
        return (state, Ok(result));
    }
    (state, Err(EngineError::UnknownCommand { name: name.to_string(), position: SourcePosition::synthetic() }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::executor::{CommandHandler, HandlerContext};

    struct Echo;
    impl CommandHandler for Echo {
        fn call(&self, mut ctx: HandlerContext, store: &ObjectStore, _tokens: &TokenManager) -> (ExecutionState, ExecResult) {
            let joined = ctx.args.iter().map(Value::stringify).collect::<Vec<_>>().join(" ");
            ctx.set_result(store, Value::Str(joined));
            (ctx.state, ExecResult::Bool(true))
        }
    }

    #[tokio::test]
    async fn execute_dispatches_registered_command() {
        let engine = Engine::new(EngineOptions::default());
        engine.register_command("echo", Arc::new(Echo));
        let result = engine.execute("echo \"hi\"", ExecOptions::default()).await.unwrap();
        match result {
            Outcome::Value(Value::QuotedStr(s)) | Outcome::Value(Value::Str(s)) => assert_eq!(s, "hi"),
            _ => panic!("expected a value outcome"),
        }
    }

    #[tokio::test]
    async fn execute_reports_unknown_command() {
        let engine = Engine::new(EngineOptions::default());
        let err = engine.execute("nope", ExecOptions::default()).await.unwrap_err();
        assert!(matches!(err, EngineError::UnknownCommand { .. }));
    }

    #[tokio::test]
    async fn direct_dispatch_bypasses_parsing() {
        let engine = Engine::new(EngineOptions::default());
        engine.register_command("echo", Arc::new(Echo));
        let result = engine
            .execute("echo", ExecOptions { args: vec![Value::Str("a, b".to_string())], file_name: None })
            .await
            .unwrap();
        match result {
            Outcome::Value(Value::Str(s)) => assert_eq!(s, "a, b"),
            _ => panic!("expected a value outcome"),
        }
    }

    #[test]
    fn macro_define_and_list() {
        let engine = Engine::new(EngineOptions { enable_macros: true, ..Default::default() });
        engine.define_macro("greet", "out: 1").unwrap();
        assert!(engine.has_macro("greet"));
        assert_eq!(engine.list_macros(), vec!["greet".to_string()]);
        engine.delete_macro("greet");
        assert!(!engine.has_macro("greet"));
    }
}
