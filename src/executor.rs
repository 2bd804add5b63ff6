//! Executor (C7): single-command dispatch, sequence/flow-control,
//! assignment/unpacking, inversion, suspension.
//!
//! Grounded on the teacher's `interpreter/execution_engine.rs`
//! `execute_script` → `execute_statement` → `execute_pipeline` →
//! `execute_command` chain: a top-level entry strips/parses once, a
//! sequence loop applies separator policy command-by-command, and a single
//! command's dispatch is its own function with a fixed step order. Where
//! the teacher threads an `InterpreterError` enum through early-return
//! control flow, PawScript's `ExecResult` plays the same role but as a
//! plain return value (`spec.md` §3 `Result`), since `ExecutionState` is
//! threaded by value rather than `&mut self` on an interpreter object.
//!
//! State ownership convention: every function here takes `ExecutionState`
//! by value and returns it, instead of `&mut ExecutionState`. Suspension
//! (handing the state to a token) is then an ordinary move, and the
//! compiler rejects any attempt to keep using a state that has been handed
//! away — exactly the discipline §7's "tokens take an explicit reference to
//! [their] state" invariant asks for. When a sequence genuinely suspends,
//! the state returned to the immediate caller is an empty placeholder (the
//! authoritative continuation lives inside the token); callers must treat
//! that placeholder as inert once a `Token`/`EarlyReturn` with no value has
//! been observed.

use indexmap::IndexMap;
use std::sync::Arc;

use crate::errors::EngineError;
use crate::lexer::{self, RawCommand, Separator};
use crate::module_env::{self, ModuleEnvironment};
use crate::object_store::{ObjectId, ObjectStore, Payload};
use crate::parser::{self, Arg, ArgKind, AssignTarget, CommandCall, UnpackPattern};
use crate::position::{self, SourcePosition};
use crate::state::ExecutionState;
use crate::substitution::{self, BraceRunResult, ScriptRunner, StageAOutcome, SubstitutionContext};
use crate::token_manager::{TokenId, TokenManager};
use crate::value::{ListData, ObjectKind, Value};

/// How a suspended `CommandSequence`'s tail resumes (`spec.md` §3, §4.6
/// step 4).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SequenceKind {
    Plain,
    ConditionalAnd,
    ConditionalOr,
    /// Treated identically to `Plain` on resume: the minimal standard
    /// library has no construct that distinguishes "resume the suspended
    /// caller" from "run the remaining commands," so this is a documented
    /// simplification rather than a distinct resumption algorithm.
    Generator,
}

/// The tail of a sequence attached to a token when a command suspends
/// mid-sequence (`spec.md` §3 `CommandSequence`).
#[derive(Debug, Clone)]
pub struct CommandSequence {
    pub kind: SequenceKind,
    pub remaining: Vec<RawCommand>,
    pub index: usize,
    pub source_text: String,
    pub position: SourcePosition,
    pub subst_ctx: SubstitutionContext,
}

/// `spec.md` §3 `Result`.
pub enum ExecResult {
    Bool(bool),
    Token(TokenId),
    EarlyReturn { status: bool, value: Option<Value> },
    Yield { value: Value },
    Suspend,
}

/// Handler-facing view of a single dispatched command (`spec.md` §6
/// "Handler context").
pub struct HandlerContext {
    pub args: Vec<Value>,
    pub raw_args: Vec<String>,
    pub named_args: IndexMap<String, Value>,
    pub position: SourcePosition,
    pub state: ExecutionState,
}

impl HandlerContext {
    pub fn set_result(&mut self, store: &ObjectStore, value: Value) {
        self.state.set_result(store, value);
    }

    pub fn get_result(&self) -> Option<&Value> {
        self.state.get_result()
    }

    pub fn has_result(&self) -> bool {
        self.state.has_result()
    }

    pub fn clear_result(&mut self, store: &ObjectStore) {
        self.state.clear_result(store);
    }

    /// `requestToken(cleanup?)`: allocate a token with no tail attached yet
    /// (the sequence loop attaches a continuation around it if one is
    /// needed) and hand it this handler invocation's state to own.
    pub fn request_token(&mut self, tokens: &TokenManager, cleanup: Option<crate::token_manager::CleanupFn>) -> TokenId {
        let token = tokens.request_token(None, cleanup, None, None);
        let owned = std::mem::replace(&mut self.state, ExecutionState::new_root(ModuleEnvironment::new_root("main")));
        tokens.attach_owning_state(&token, owned);
        token
    }

    pub fn log_error(&self, filter: &crate::errors::LogFilterConfig, debug: bool, category: crate::errors::ErrorCategory, message: &str) {
        crate::log_surface::log_event(filter, debug, category, crate::errors::LogLevel::Error, false, Some(&self.position), message);
    }

    pub fn log_debug(&self, filter: &crate::errors::LogFilterConfig, debug: bool, category: crate::errors::ErrorCategory, message: &str) {
        crate::log_surface::log_event(filter, debug, category, crate::errors::LogLevel::Debug, false, Some(&self.position), message);
    }
}

/// A registered native command handler (`spec.md` §6 "registerCommand").
pub trait CommandHandler: Send + Sync {
    fn call(&self, ctx: HandlerContext, store: &ObjectStore, tokens: &TokenManager) -> (ExecutionState, ExecResult);
}

pub type BoxedHandler = Arc<dyn CommandHandler>;

/// Global command table, keyed by `(module, name)`. Cloning is cheap (an
/// `Arc` bump), matching the object store's "serialize behind a lock,
/// share via Arc" shape.
#[derive(Clone, Default)]
pub struct CommandRegistry {
    inner: Arc<std::sync::RwLock<std::collections::HashMap<(String, String), BoxedHandler>>>,
}

impl CommandRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, module: impl Into<String>, name: impl Into<String>, handler: BoxedHandler) {
        self.inner.write().unwrap().insert((module.into(), name.into()), handler);
    }

    pub fn get(&self, module: &str, name: &str) -> Option<BoxedHandler> {
        self.inner.read().unwrap().get(&(module.to_string(), name.to_string())).cloned()
    }
}

/// Bundles the collaborators a running script needs at every level of
/// recursion (brace sub-scripts, blocks, macro bodies): the token graph,
/// the command table, and an optional fallback handler. Also implements
/// `ScriptRunner` so `substitution::run_stage_a` can recurse back into
/// `execute_top_level` without this module depending on a concrete
/// substitution type.
pub struct Runner<'a> {
    pub tokens: &'a TokenManager,
    pub registry: &'a CommandRegistry,
    pub fallback: Option<&'a BoxedHandler>,
    pub debug: bool,
}

impl<'a> ScriptRunner for Runner<'a> {
    fn run_brace_body(&mut self, text: &str, parent: &ExecutionState, store: &ObjectStore) -> BraceRunResult {
        if let Err(e) = parent.check_brace_depth_limit() {
            return BraceRunResult::Err(e);
        }
        let child = parent.child_for_brace();
        let subst_ctx = SubstitutionContext::empty();
        let (mut child_state, outcome) = execute_top_level(text, "<brace>", child, self, store, &subst_ctx);
        let result = match outcome {
            Ok(ExecResult::Bool(status)) => {
                let text_out = child_state.get_result().map(Value::stringify).unwrap_or_else(|| status.to_string());
                BraceRunResult::Text(text_out)
            }
            Ok(ExecResult::EarlyReturn { status, value }) => {
                let text_out = value.as_ref().map(Value::stringify).unwrap_or_else(|| status.to_string());
                BraceRunResult::Text(text_out)
            }
            Ok(ExecResult::Yield { value }) => BraceRunResult::Text(value.stringify()),
            Ok(ExecResult::Token(token)) => BraceRunResult::Suspended(token),
            Ok(ExecResult::Suspend) => {
                BraceRunResult::Err(EngineError::Internal { message: "a bare suspend inside a brace expression has no sequence tail to attach".to_string() })
            }
            Err(e) => BraceRunResult::Err(e),
        };
        child_state.release_all(store);
        result
    }
}

enum SubstOutcome {
    Text(String),
    Token(TokenId),
}

fn run_substitution(
    text: &str,
    state: &ExecutionState,
    runner: &mut Runner,
    store: &ObjectStore,
    subst_ctx: &SubstitutionContext,
    position: &SourcePosition,
) -> Result<SubstOutcome, EngineError> {
    let base = position.clone();
    match substitution::run_stage_a(text, state, store, runner, move |_| base.clone())? {
        StageAOutcome::Text(t) => Ok(SubstOutcome::Text(substitution::run_stage_b(&t, subst_ctx))),
        StageAOutcome::Suspended(coordinator, token) => {
            runner.tokens.attach_brace_coordinator(&token, coordinator);
            Ok(SubstOutcome::Token(token))
        }
    }
}

fn resolve_arg(arg: &Arg, state: &ExecutionState, store: &ObjectStore) -> Result<Value, EngineError> {
    if let Some(expr) = arg.text.strip_prefix('~') {
        return substitution::resolve_tilde(expr, state, store, &arg.position);
    }
    if let Some(expr) = arg.text.strip_prefix('?') {
        return Ok(Value::Bool(substitution::resolve_question(expr, state, store)));
    }
    if let Some((0, kind, id, _)) = crate::value::find_marker(&arg.text) {
        return Ok(Value::Object(id, kind));
    }
    Ok(match &arg.kind {
        ArgKind::QuotedString => Value::QuotedStr(arg.text.clone()),
        ArgKind::Identifier => Value::Symbol(arg.text.clone()),
        ArgKind::Integer(n) => Value::Int(*n),
        ArgKind::Float(f) => Value::Float(*f),
        ArgKind::Bool(b) => Value::Bool(*b),
        ArgKind::Bare | ArgKind::ParenGroup | ArgKind::BraceGroup => Value::Str(arg.text.clone()),
    })
}

/// Resolve a call's positional and named arguments. Per the recorded open
/// question, named keys resolve after all positional arguments, in
/// first-appearance order.
fn resolve_args(call: &CommandCall, state: &ExecutionState, store: &ObjectStore) -> Result<(Vec<Value>, IndexMap<String, Value>), EngineError> {
    let mut args = Vec::with_capacity(call.args.len());
    for a in &call.args {
        args.push(resolve_arg(a, state, store)?);
    }
    let mut named = IndexMap::new();
    for (k, v) in &call.named_args {
        let resolved = match v {
            Some(a) => resolve_arg(a, state, store)?,
            None => Value::Nil,
        };
        named.insert(k.clone(), resolved);
    }
    Ok((args, named))
}

fn build_args_list(args: &[Value], named: &IndexMap<String, Value>, store: &ObjectStore) -> ObjectId {
    let mut list = ListData::new();
    list.items = args.to_vec();
    list.named = named.clone();
    store.store(Payload::List(list))
}

/// Top-level `execute(text, …)` (`spec.md` §4.5): strip comments, lex, and
/// run the sequence. Also used for brace/block/macro sub-script bodies —
/// re-stripping already-stripped text is a no-op since it cannot contain
/// comment syntax, so this one entry point covers both.
pub fn execute_top_level(
    source: &str,
    file: &str,
    state: ExecutionState,
    runner: &mut Runner,
    store: &ObjectStore,
    subst_ctx: &SubstitutionContext,
) -> (ExecutionState, Result<ExecResult, EngineError>) {
    let (stripped, map) = position::strip_comments(source, file.to_string());
    match lexer::split_commands(&stripped, &map) {
        Ok(commands) => execute_sequence(commands, state, runner, store, subst_ctx),
        Err(e) => (state, Err(EngineError::Parse { message: e.message, position: e.position })),
    }
}

/// `executeSequence` (`spec.md` §4.5).
pub fn execute_sequence(
    commands: Vec<RawCommand>,
    mut state: ExecutionState,
    runner: &mut Runner,
    store: &ObjectStore,
    subst_ctx: &SubstitutionContext,
) -> (ExecutionState, Result<ExecResult, EngineError>) {
    let mut last_status = state.last_status;
    let mut idx = 0usize;
    while idx < commands.len() {
        let cmd = commands[idx].clone();
        let should_run = match cmd.separator {
            Separator::None | Separator::Semi => true,
            Separator::Amp => last_status,
            Separator::Pipe => !last_status,
        };
        if !should_run {
            idx += 1;
            continue;
        }

        if let Err(e) = state.check_command_limit() {
            return (state, Err(e));
        }
        let (next_state, result) = execute_single(&cmd.text, state, runner, store, subst_ctx, &cmd.position);
        state = next_state;

        match result {
            Err(e) => return (state, Err(e)),
            Ok(ExecResult::EarlyReturn { status, value }) => {
                if let Some(v) = value {
                    state.set_result(store, v);
                }
                state.last_status = status;
                return (state, Ok(ExecResult::EarlyReturn { status, value: None }));
            }
            Ok(ExecResult::Yield { value }) => return (state, Ok(ExecResult::Yield { value })),
            Ok(ExecResult::Suspend) => {
                let tail = commands[idx + 1..].to_vec();
                let token = runner.tokens.request_token(None, None, None, None);
                state.set_result(store, Value::Str(token.to_string()));
                if !tail.is_empty() {
                    runner.tokens.attach_sequence(
                        &token,
                        CommandSequence {
                            kind: SequenceKind::Generator,
                            remaining: tail,
                            index: 0,
                            source_text: String::new(),
                            position: cmd.position.clone(),
                            subst_ctx: subst_ctx.clone(),
                        },
                    );
                }
                runner.tokens.attach_owning_state(&token, state);
                return (
                    ExecutionState::new_root(ModuleEnvironment::new_root("main")),
                    Ok(ExecResult::EarlyReturn { status: true, value: None }),
                );
            }
            Ok(ExecResult::Token(token)) => {
                let tail = commands[idx + 1..].to_vec();
                if tail.is_empty() {
                    return (state, Ok(ExecResult::Token(token)));
                }
                let continuation = runner.tokens.request_token(None, None, None, None);
                runner.tokens.attach_sequence(
                    &continuation,
                    CommandSequence {
                        kind: SequenceKind::Plain,
                        remaining: tail,
                        index: 0,
                        source_text: String::new(),
                        position: cmd.position.clone(),
                        subst_ctx: subst_ctx.clone(),
                    },
                );
                runner.tokens.attach_owning_state(&continuation, state);
                runner.tokens.chain(&token, &continuation);
                return (
                    ExecutionState::new_root(ModuleEnvironment::new_root("main")),
                    Ok(ExecResult::Token(continuation)),
                );
            }
            Ok(ExecResult::Bool(status)) => {
                last_status = status;
                state.last_status = status;
                idx += 1;
            }
        }
    }
    (state, Ok(ExecResult::Bool(last_status)))
}

/// Resume a `CommandSequence` tail under its `kind`'s rules (`spec.md`
/// §4.6 step 4). `resumed_status` seeds `lastStatus` so a tail joined by
/// `&`/`|` still sees the status the suspended command eventually resolved
/// to (scenario 6).
pub fn resume_sequence(
    mut sequence: CommandSequence,
    mut state: ExecutionState,
    resumed_status: bool,
    runner: &mut Runner,
    store: &ObjectStore,
) -> (ExecutionState, Result<ExecResult, EngineError>) {
    state.last_status = resumed_status;
    let remaining = sequence.remaining.split_off(sequence.index);
    match sequence.kind {
        SequenceKind::Plain | SequenceKind::Generator => execute_sequence(remaining, state, runner, store, &sequence.subst_ctx),
        SequenceKind::ConditionalAnd => {
            let mut status = resumed_status;
            for cmd in remaining {
                if !status {
                    break;
                }
                let (next_state, result) = execute_single(&cmd.text, state, runner, store, &sequence.subst_ctx, &cmd.position);
                state = next_state;
                match result {
                    Err(e) => return (state, Err(e)),
                    Ok(ExecResult::Bool(s)) => {
                        status = s;
                        state.last_status = s;
                    }
                    Ok(other) => return (state, Ok(other)),
                }
            }
            (state, Ok(ExecResult::Bool(status)))
        }
        SequenceKind::ConditionalOr => {
            let mut status = resumed_status;
            for cmd in remaining {
                if status {
                    break;
                }
                let (next_state, result) = execute_single(&cmd.text, state, runner, store, &sequence.subst_ctx, &cmd.position);
                state = next_state;
                match result {
                    Err(e) => return (state, Err(e)),
                    Ok(ExecResult::Bool(s)) => {
                        status = s;
                        state.last_status = s;
                    }
                    Ok(other) => return (state, Ok(other)),
                }
            }
            (state, Ok(ExecResult::Bool(status)))
        }
    }
}

/// `executeSingle` (`spec.md` §4.5), steps 1 and 9 (inversion); the rest
/// is delegated to `execute_single_inner`.
pub fn execute_single(
    text: &str,
    state: ExecutionState,
    runner: &mut Runner,
    store: &ObjectStore,
    subst_ctx: &SubstitutionContext,
    position: &SourcePosition,
) -> (ExecutionState, Result<ExecResult, EngineError>) {
    let trimmed = text.trim_start();
    let (invert, body) = match trimmed.strip_prefix('!') {
        Some(rest) => (true, rest.trim_start()),
        None => (false, trimmed),
    };

    let (state, outcome) = execute_single_inner(body, state, runner, store, subst_ctx, position);
    let outcome = outcome.map(|result| apply_inversion(result, invert, runner));
    (state, outcome)
}

fn apply_inversion(result: ExecResult, invert: bool, runner: &Runner) -> ExecResult {
    if !invert {
        return result;
    }
    match result {
        ExecResult::Bool(s) => ExecResult::Bool(!s),
        ExecResult::Token(t) => {
            runner.tokens.set_invert(&t, true);
            ExecResult::Token(t)
        }
        other => other,
    }
}

fn execute_single_inner(
    body: &str,
    state: ExecutionState,
    runner: &mut Runner,
    store: &ObjectStore,
    subst_ctx: &SubstitutionContext,
    position: &SourcePosition,
) -> (ExecutionState, Result<ExecResult, EngineError>) {
    // Step 4 (tried first): an unpack/assignment target is syntactically
    // recognised on the raw text, since it determines whether a leading
    // '(' is step 2's parenthetic block or an unpack target.
    if let Some(parsed) = parser::try_parse_assignment(body, position) {
        return execute_assignment(parsed, state, runner, store, subst_ctx, position);
    }

    // Step 2: parenthetic block, same-state execution.
    if body.trim_start().starts_with('(') {
        return execute_parenthetic_block(body, state, runner, store, position);
    }

    // Step 3: sugar is recognised on the raw, unsubstituted text first
    // (`spec.md` §4.5 step 3 — "apply sugar, then substitution"), so a
    // macro-definition's `{ body }` is captured as a deferred `BraceGroup`
    // argument instead of Stage A eagerly evaluating it as a live
    // sub-script. Commands that don't match the sugar shape fall through
    // to ordinary substitution-then-parse below.
    if let Some(sugar_call) = parser::try_parse_sugar_call(body, position) {
        let call = match sugar_call {
            Ok(c) => c,
            Err(e) => return (state, Err(EngineError::Parse { message: e.message, position: e.position })),
        };
        let (args, named) = match resolve_args(&call, &state, store) {
            Ok(r) => r,
            Err(e) => return (state, Err(e)),
        };
        let raw_args = call.args.iter().map(|a| a.text.clone()).collect();
        return dispatch_command(&call.name, args, raw_args, named, position, state, runner, store);
    }

    let substituted = match run_substitution(body, &state, runner, store, subst_ctx, position) {
        Ok(SubstOutcome::Text(t)) => t,
        Ok(SubstOutcome::Token(token)) => return (state, Ok(ExecResult::Token(token))),
        Err(e) => return (state, Err(e)),
    };
    let trimmed = substituted.trim();

    // Step 5: '?' existence test / '~' implicit result assignment.
    if let Some(expr) = trimmed.strip_prefix('?') {
        return execute_question_head(expr.trim(), state, store);
    }
    if let Some(expr) = trimmed.strip_prefix('~') {
        return execute_tilde_head(expr.trim(), state, store, position);
    }

    // Step 6: object-marker macro/block dispatch.
    if let Some((0, kind, id, len)) = crate::value::find_marker(trimmed) {
        if matches!(kind, ObjectKind::Macro | ObjectKind::Block) {
            let rest = &trimmed[len..];
            return dispatch_marker(kind, id, rest, state, runner, store, position);
        }
    }

    // Step 7: parse name + args.
    let call = match parser::parse_command_call(trimmed, position) {
        Ok(c) => c,
        Err(e) => return (state, Err(EngineError::Parse { message: e.message, position: e.position })),
    };
    let (args, named) = match resolve_args(&call, &state, store) {
        Ok(r) => r,
        Err(e) => return (state, Err(e)),
    };
    let raw_args = call.args.iter().map(|a| a.text.clone()).collect();

    // Step 8: dispatch order.
    dispatch_command(&call.name, args, raw_args, named, position, state, runner, store)
}

fn execute_question_head(expr: &str, mut state: ExecutionState, store: &ObjectStore) -> (ExecutionState, Result<ExecResult, EngineError>) {
    let b = substitution::resolve_question(expr, &state, store);
    state.last_status = b;
    (state, Ok(ExecResult::Bool(b)))
}

fn execute_tilde_head(expr: &str, mut state: ExecutionState, store: &ObjectStore, position: &SourcePosition) -> (ExecutionState, Result<ExecResult, EngineError>) {
    match substitution::resolve_tilde(expr, &state, store, position) {
        Ok(v) => {
            state.set_result(store, v);
            state.last_status = true;
            (state, Ok(ExecResult::Bool(true)))
        }
        Err(e) => (state, Err(e)),
    }
}

fn dispatch_marker(
    kind: ObjectKind,
    id: ObjectId,
    rest: &str,
    mut state: ExecutionState,
    runner: &mut Runner,
    store: &ObjectStore,
    position: &SourcePosition,
) -> (ExecutionState, Result<ExecResult, EngineError>) {
    let (arg_list, named_list) = match parser::parse_arg_list(rest, position) {
        Ok(r) => r,
        Err(e) => return (state, Err(EngineError::Parse { message: e.message, position: e.position })),
    };
    let mut args = Vec::with_capacity(arg_list.len());
    for a in &arg_list {
        match resolve_arg(a, &state, store) {
            Ok(v) => args.push(v),
            Err(e) => return (state, Err(e)),
        }
    }
    let mut named = IndexMap::new();
    for (k, v) in &named_list {
        let resolved = match v {
            Some(a) => match resolve_arg(a, &state, store) {
                Ok(v) => v,
                Err(e) => return (state, Err(e)),
            },
            None => Value::Nil,
        };
        named.insert(k.clone(), resolved);
    }

    match kind {
        ObjectKind::Macro => crate::macros::execute(id, args, named, state, runner, store, position.clone()),
        ObjectKind::Block => {
            let Some(Payload::Block { command_text }) = store.get(id) else {
                return (state, Err(EngineError::Internal { message: "block object no longer alive".to_string() }));
            };
            let args_id = build_args_list(&args, &named, store);
            state.claim_owned(store, args_id);
            let block_ctx = SubstitutionContext { positional: args.iter().map(Value::stringify).collect(), args_object: Some(args_id) };
            execute_top_level(&command_text, "<block>", state, runner, store, &block_ctx)
        }
        _ => (state, Err(EngineError::Internal { message: "unexpected marker kind at command head".to_string() })),
    }
}

fn execute_parenthetic_block(
    body: &str,
    mut state: ExecutionState,
    runner: &mut Runner,
    store: &ObjectStore,
    position: &SourcePosition,
) -> (ExecutionState, Result<ExecResult, EngineError>) {
    let trimmed = body.trim_start();
    let Some(end) = parser::find_matching_paren(trimmed) else {
        return (state, Err(EngineError::Parse { message: "unbalanced '(' in parenthetic block".to_string(), position: position.clone() }));
    };
    let inner = trimmed[1..end].to_string();
    let remainder = trimmed[end + 1..].trim_start();

    let (arg_list, named_list) = match parser::parse_arg_list(remainder, position) {
        Ok(r) => r,
        Err(e) => return (state, Err(EngineError::Parse { message: e.message, position: e.position })),
    };
    let mut args = Vec::with_capacity(arg_list.len());
    for a in &arg_list {
        match resolve_arg(a, &state, store) {
            Ok(v) => args.push(v),
            Err(e) => return (state, Err(e)),
        }
    }
    let mut named = IndexMap::new();
    for (k, v) in &named_list {
        let resolved = match v {
            Some(a) => match resolve_arg(a, &state, store) {
                Ok(v) => v,
                Err(e) => return (state, Err(e)),
            },
            None => Value::Nil,
        };
        named.insert(k.clone(), resolved);
    }

    let args_id = build_args_list(&args, &named, store);
    let mut block_state = state.child_for_block();
    block_state.claim_owned(store, args_id);
    let block_ctx = SubstitutionContext { positional: args.iter().map(Value::stringify).collect(), args_object: Some(args_id) };

    let (mut block_state, outcome) = execute_top_level(&inner, "<block>", block_state, runner, store, &block_ctx);
    if let Ok(ExecResult::Bool(status)) = &outcome {
        state.last_status = *status;
        if let Some(v) = block_state.get_result() {
            let v = v.clone();
            state.set_result(store, v);
        }
    }
    block_state.release_all(store);
    (state, outcome)
}

enum TargetResolution {
    Name(String),
    Unpack(Vec<UnpackPattern>),
}

fn resolve_target(
    target: &AssignTarget,
    state: &ExecutionState,
    runner: &mut Runner,
    store: &ObjectStore,
    subst_ctx: &SubstitutionContext,
    position: &SourcePosition,
) -> Result<TargetResolution, EngineError> {
    match target {
        AssignTarget::Name(n) | AssignTarget::Literal(n) => Ok(TargetResolution::Name(n.clone())),
        AssignTarget::TildeRef(var) => {
            let v = substitution::resolve_tilde(var, state, store, position)?;
            Ok(TargetResolution::Name(v.stringify()))
        }
        AssignTarget::Brace(expr) => match run_substitution(expr, state, runner, store, subst_ctx, position)? {
            SubstOutcome::Text(t) => Ok(TargetResolution::Name(t)),
            SubstOutcome::Token(_) => Err(EngineError::Internal { message: "an async brace assignment target is not supported".to_string() }),
        },
        AssignTarget::Unpack(patterns) => Ok(TargetResolution::Unpack(patterns.clone())),
        AssignTarget::DynamicUnpack(expr) => {
            let v = substitution::resolve_tilde(expr, state, store, position)?;
            let Value::Object(id, ObjectKind::List) = v else {
                return Err(EngineError::ArgumentValidation {
                    command: "assignment".to_string(),
                    message: "a dynamic unpack target must resolve to a list".to_string(),
                    position: position.clone(),
                });
            };
            let Some(Payload::List(list)) = store.get(id) else {
                return Err(EngineError::Internal { message: "dynamic unpack target list is no longer alive".to_string() });
            };
            let patterns = list.items.iter().map(|v| UnpackPattern::Positional(v.stringify())).collect();
            Ok(TargetResolution::Unpack(patterns))
        }
    }
}

fn execute_assignment(
    parsed: Result<parser::Assignment, parser::ParseError>,
    mut state: ExecutionState,
    runner: &mut Runner,
    store: &ObjectStore,
    subst_ctx: &SubstitutionContext,
    position: &SourcePosition,
) -> (ExecutionState, Result<ExecResult, EngineError>) {
    let assignment = match parsed {
        Ok(a) => a,
        Err(e) => return (state, Err(EngineError::Parse { message: e.message, position: e.position })),
    };

    let target = match resolve_target(&assignment.target, &state, runner, store, subst_ctx, position) {
        Ok(t) => t,
        Err(e) => return (state, Err(e)),
    };

    if let TargetResolution::Unpack(patterns) = target {
        return execute_unpack(patterns, &assignment.value_text, state, runner, store, subst_ctx, position);
    }
    let TargetResolution::Name(name) = target else { unreachable!() };

    let value_text = match run_substitution(&assignment.value_text, &state, runner, store, subst_ctx, position) {
        Ok(SubstOutcome::Text(t)) => t,
        Ok(SubstOutcome::Token(token)) => return (state, Ok(ExecResult::Token(token))),
        Err(e) => return (state, Err(e)),
    };

    let parsed_arg = match parser::parse_single_value(&value_text, position) {
        Ok(a) => a,
        Err(e) => return (state, Err(EngineError::Parse { message: e.message, position: e.position })),
    };

    // `undefined` deletes the variable without touching the result slot
    // (recorded open-question decision, `DESIGN.md`).
    if parsed_arg.kind == ArgKind::Identifier && parsed_arg.text == "undefined" {
        state.remove_var(store, &name);
        state.last_status = true;
        return (state, Ok(ExecResult::Bool(true)));
    }

    let value = match resolve_arg(&parsed_arg, &state, store) {
        Ok(v) => v,
        Err(e) => return (state, Err(e)),
    };
    state.set_var(store, &name, value.clone());
    state.set_result(store, value);
    state.last_status = true;
    (state, Ok(ExecResult::Bool(true)))
}

fn materialize_list(
    value_text: &str,
    state: &ExecutionState,
    store: &ObjectStore,
    position: &SourcePosition,
) -> Result<(Vec<Value>, IndexMap<String, Value>), EngineError> {
    let arg = parser::parse_single_value(value_text, position).map_err(|e| EngineError::Parse { message: e.message, position: e.position })?;
    if arg.kind == ArgKind::ParenGroup {
        let (items, named_args) = parser::parse_arg_list(&arg.text, position).map_err(|e| EngineError::Parse { message: e.message, position: e.position })?;
        let mut values = Vec::with_capacity(items.len());
        for a in &items {
            values.push(resolve_arg(a, state, store)?);
        }
        let mut named = IndexMap::new();
        for (k, v) in &named_args {
            named.insert(k.clone(), match v {
                Some(a) => resolve_arg(a, state, store)?,
                None => Value::Nil,
            });
        }
        return Ok((values, named));
    }
    let v = resolve_arg(&arg, state, store)?;
    if let Value::Object(id, ObjectKind::List) = &v {
        if let Some(Payload::List(list)) = store.get(*id) {
            return Ok((list.items, list.named));
        }
    }
    Ok((vec![v], IndexMap::new()))
}

fn execute_unpack(
    patterns: Vec<UnpackPattern>,
    value_text: &str,
    mut state: ExecutionState,
    runner: &mut Runner,
    store: &ObjectStore,
    subst_ctx: &SubstitutionContext,
    position: &SourcePosition,
) -> (ExecutionState, Result<ExecResult, EngineError>) {
    let value_text = match run_substitution(value_text, &state, runner, store, subst_ctx, position) {
        Ok(SubstOutcome::Text(t)) => t,
        Ok(SubstOutcome::Token(token)) => return (state, Ok(ExecResult::Token(token))),
        Err(e) => return (state, Err(e)),
    };
    let (items, named) = match materialize_list(&value_text, &state, store, position) {
        Ok(v) => v,
        Err(e) => return (state, Err(e)),
    };

    let mut pos_idx = 0usize;
    for pattern in &patterns {
        match pattern {
            UnpackPattern::Positional(name) => {
                let v = items.get(pos_idx).cloned().unwrap_or(Value::Nil);
                pos_idx += 1;
                state.set_var(store, name, v);
            }
            UnpackPattern::Named { key, alias } => {
                let target = alias.clone().unwrap_or_else(|| key.clone());
                let v = named.get(key).cloned().unwrap_or(Value::Nil);
                state.set_var(store, &target, v);
            }
        }
    }

    let mut list = ListData::new();
    list.items = items;
    list.named = named;
    let id = store.store(Payload::List(list));
    state.claim_owned(store, id);
    state.set_result(store, Value::Object(id, ObjectKind::List));
    state.last_status = true;
    (state, Ok(ExecResult::Bool(true)))
}

mod super_commands {
    use super::*;

    pub fn dispatch(
        name: &str,
        args: &[Value],
        named: &IndexMap<String, Value>,
        state: &mut ExecutionState,
        store: &ObjectStore,
        position: &SourcePosition,
    ) -> Option<Result<bool, EngineError>> {
        match name {
            "MODULE" => Some(module_cmd(args, state)),
            "LIBRARY" => Some(library_cmd(args, state)),
            "IMPORT" => Some(import_cmd(args, named, state, store)),
            "REMOVE" => Some(remove_cmd(args, state)),
            "EXPORT" => Some(export_cmd(args, state)),
            "macro" => Some(macro_cmd(args, state, store, position)),
            _ => None,
        }
    }

    fn as_name(v: &Value) -> Option<String> {
        match v {
            Value::Symbol(s) | Value::Str(s) | Value::QuotedStr(s) => Some(s.clone()),
            _ => None,
        }
    }

    fn module_cmd(args: &[Value], state: &mut ExecutionState) -> Result<bool, EngineError> {
        let name = args.first().and_then(as_name).unwrap_or_else(|| "main".to_string());
        state.module_env.set_default_module(name);
        Ok(true)
    }

    fn library_cmd(args: &[Value], state: &mut ExecutionState) -> Result<bool, EngineError> {
        let Some(module) = args.first().and_then(as_name) else { return Ok(false) };
        let mut items = Vec::new();
        for v in &args[1..] {
            let Some(item_name) = as_name(v) else { continue };
            if let Some((m, o)) = state.module_env.resolve_command(&item_name) {
                items.push((item_name, module_env::LibraryItem::Command { module: m, original_name: o }));
            } else if let Some(id) = state.module_env.resolve_macro(&item_name) {
                items.push((item_name, module_env::LibraryItem::Macro(id)));
            }
        }
        state.module_env.library(module, items);
        Ok(true)
    }

    fn import_cmd(args: &[Value], named: &IndexMap<String, Value>, state: &mut ExecutionState, store: &ObjectStore) -> Result<bool, EngineError> {
        let Some(module) = args.first().and_then(as_name) else { return Ok(false) };
        let mut items: Vec<(String, Option<String>)> = args[1..].iter().filter_map(as_name).map(|n| (n, None)).collect();
        for (orig, alias) in named {
            items.push((orig.clone(), as_name(alias)));
        }
        state
            .module_env
            .import(&module, items, |id| store.claim(id))
            .map(|_| true)
            .map_err(|message| EngineError::ArgumentValidation { command: "IMPORT".to_string(), message, position: SourcePosition::synthetic() })
    }

    fn remove_cmd(args: &[Value], state: &mut ExecutionState) -> Result<bool, EngineError> {
        if let Some(name) = args.first().and_then(as_name) {
            state.module_env.remove(&name);
        }
        Ok(true)
    }

    fn export_cmd(args: &[Value], state: &mut ExecutionState) -> Result<bool, EngineError> {
        let Some(module) = args.first().and_then(as_name) else { return Ok(false) };
        let Some(name) = args.get(1).and_then(as_name) else { return Ok(false) };
        let value = args.get(2).cloned().unwrap_or(Value::Nil);
        state.module_env.export(module, name, value);
        Ok(true)
    }

    /// `macro NAME (params) { body }`, produced by the `IDENT ( … )` sugar
    /// rewrite (`spec.md` §4.2): define the macro and bind it under `NAME`
    /// in the current environment (`spec.md` §4.8 step 1).
    fn macro_cmd(args: &[Value], state: &mut ExecutionState, store: &ObjectStore, position: &SourcePosition) -> Result<bool, EngineError> {
        let name = args.first().and_then(as_name).ok_or_else(|| EngineError::ArgumentValidation {
            command: "macro".to_string(),
            message: "a macro definition requires a name".to_string(),
            position: position.clone(),
        })?;
        let params_text = args.get(1).map(Value::stringify).unwrap_or_default();
        let body = args.get(2).map(Value::stringify).unwrap_or_default();
        let params = crate::parser::parse_macro_params(&params_text)
            .map_err(|e| EngineError::Parse { message: e.message, position: e.position })?;
        let id = crate::macros::define(store, body, position.clone(), None, params);
        state.module_env.bind_macro(name, id);
        Ok(true)
    }
}

/// Step 8: super-commands → macro → command handler → fallback → unknown.
fn dispatch_command(
    name: &str,
    args: Vec<Value>,
    raw_args: Vec<String>,
    named: IndexMap<String, Value>,
    position: &SourcePosition,
    mut state: ExecutionState,
    runner: &mut Runner,
    store: &ObjectStore,
) -> (ExecutionState, Result<ExecResult, EngineError>) {
    if let Some(result) = super_commands::dispatch(name, &args, &named, &mut state, store, position) {
        return (state, result.map(ExecResult::Bool));
    }

    if let Some(macro_id) = state.module_env.resolve_macro(name) {
        return crate::macros::execute(macro_id, args, named, state, runner, store, position.clone());
    }

    let default_module = state.module_env.default_module().to_string();
    let resolved = state.module_env.resolve_command(name).or_else(|| Some((default_module.clone(), name.to_string())));
    if let Some((module, original)) = resolved {
        if let Some(handler) = runner.registry.get(&module, &original) {
            let ctx = HandlerContext { args, raw_args, named_args: named, position: position.clone(), state };
            let (state, result) = handler.call(ctx, store, runner.tokens);
            return (state, Ok(result));
        }
    }

    if let Some(handler) = runner.fallback {
        let ctx = HandlerContext { args, raw_args, named_args: named, position: position.clone(), state };
        let (state, result) = handler.call(ctx, store, runner.tokens);
        return (state, Ok(result));
    }

    (state, Err(EngineError::UnknownCommand { name: name.to_string(), position: position.clone() }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::object_store::ObjectStore;

    struct RecordingHandler {
        log: std::sync::Mutex<Vec<Vec<Value>>>,
    }

    impl CommandHandler for RecordingHandler {
        fn call(&self, mut ctx: HandlerContext, store: &ObjectStore, _tokens: &TokenManager) -> (ExecutionState, ExecResult) {
            self.log.lock().unwrap().push(ctx.args.clone());
            ctx.set_result(store, Value::Bool(true));
            (ctx.state, ExecResult::Bool(true))
        }
    }

    fn fresh() -> (ObjectStore, TokenManager, CommandRegistry, ExecutionState) {
        let store = ObjectStore::new();
        let tokens = TokenManager::new(std::time::Duration::from_secs(300));
        let registry = CommandRegistry::new();
        let state = ExecutionState::new_root(ModuleEnvironment::new_root("main"));
        (store, tokens, registry, state)
    }

    fn run(text: &str, store: &ObjectStore, tokens: &TokenManager, registry: &CommandRegistry, state: ExecutionState) -> (ExecutionState, Result<ExecResult, EngineError>) {
        let mut runner = Runner { tokens, registry, fallback: None, debug: false };
        execute_top_level(text, "t", state, &mut runner, store, &SubstitutionContext::empty())
    }

    #[test]
    fn simple_assignment_updates_variable_and_result() {
        let (store, tokens, registry, state) = fresh();
        let (state, result) = run("x: 7", &store, &tokens, &registry, state);
        assert!(matches!(result, Ok(ExecResult::Bool(true))));
        assert_eq!(state.get_var("x"), Some(Value::Int(7)));
        assert_eq!(state.get_result(), Some(&Value::Int(7)));
    }

    #[test]
    fn sequence_of_assignments_then_dispatch() {
        let (store, tokens, registry, state) = fresh();
        let handler = Arc::new(RecordingHandler { log: std::sync::Mutex::new(Vec::new()) });
        registry.register("main", "echo", handler.clone());
        let (_state, result) = run("x: 7 ; y: 3 ; echo ~x, ~y", &store, &tokens, &registry, state);
        assert!(matches!(result, Ok(ExecResult::Bool(true))));
        let calls = handler.log.lock().unwrap();
        assert_eq!(calls.len(), 1);
        assert_eq!(calls[0], vec![Value::Int(7), Value::Int(3)]);
    }

    #[test]
    fn conditional_and_or_short_circuit() {
        let (store, tokens, registry, state) = fresh();
        let should_not = Arc::new(RecordingHandler { log: std::sync::Mutex::new(Vec::new()) });
        let ran = Arc::new(RecordingHandler { log: std::sync::Mutex::new(Vec::new()) });
        registry.register("main", "should_not_run", should_not.clone());
        registry.register("main", "ran", ran.clone());
        let (_state, result) = run("false & should_not_run | ran", &store, &tokens, &registry, state);
        assert!(matches!(result, Ok(ExecResult::Bool(true))));
        assert!(should_not.log.lock().unwrap().is_empty());
        assert_eq!(ran.log.lock().unwrap().len(), 1);
    }

    #[test]
    fn tuple_unpack_assignment_binds_both_names() {
        let (store, tokens, registry, state) = fresh();
        let (state, result) = run("(a, b): (1, 2)", &store, &tokens, &registry, state);
        assert!(matches!(result, Ok(ExecResult::Bool(true))));
        assert_eq!(state.get_var("a"), Some(Value::Int(1)));
        assert_eq!(state.get_var("b"), Some(Value::Int(2)));
    }

    #[test]
    fn bang_prefix_inverts_bool_status() {
        let (store, tokens, registry, state) = fresh();
        let (_state, result) = run("!false", &store, &tokens, &registry, state);
        assert!(matches!(result, Ok(ExecResult::Bool(true))));
    }

    #[test]
    fn undefined_clears_variable_without_touching_result() {
        let (store, tokens, registry, state) = fresh();
        let (state, _) = run("x: 7", &store, &tokens, &registry, state);
        let (state, result) = run("x: undefined", &store, &tokens, &registry, state);
        assert!(matches!(result, Ok(ExecResult::Bool(true))));
        assert_eq!(state.get_var("x"), None);
    }

    #[test]
    fn brace_expression_splices_inner_result() {
        let (store, tokens, registry, state) = fresh();
        let (state, result) = run("x: { y: 5 }", &store, &tokens, &registry, state);
        assert!(matches!(result, Ok(ExecResult::Bool(true))));
        assert_eq!(state.get_var("x"), Some(Value::Int(5)));
    }

    #[test]
    fn question_mark_head_tests_existence() {
        let (store, tokens, registry, state) = fresh();
        let (state, _) = run("x: 1", &store, &tokens, &registry, state);
        let (_state, result) = run("?x", &store, &tokens, &registry, state);
        assert!(matches!(result, Ok(ExecResult::Bool(true))));
    }

    #[test]
    fn unknown_command_is_an_error() {
        let (store, tokens, registry, state) = fresh();
        let (_state, result) = run("totally_unregistered_command", &store, &tokens, &registry, state);
        assert!(matches!(result, Err(EngineError::UnknownCommand { .. })));
    }
}
