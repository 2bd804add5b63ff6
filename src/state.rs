//! Execution state (C4).
//!
//! Grounded on the teacher's `interpreter/types.rs::InterpreterState`: one
//! struct threaded through every level of execution, carrying the mutable
//! bits (variables, current status, result) plus a handle to the
//! hierarchical namespace (`ModuleEnvironment` here, the teacher's function
//! table there).
//!
//! Variable storage and its claim bookkeeping live behind `Arc<Mutex<_>>` so
//! same-scope parenthetic blocks can literally share one backing map (per
//! `spec.md` §3: "child states may share the variable map"), while macro
//! invocations get a fresh one. The mutex is uncontended in practice (the
//! engine is driven single-threaded per §5) but keeping it `Send + Sync`
//! avoids surprising a host that moves `Engine` across an executor's worker
//! threads between `.await` points.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use crate::errors::EngineError;
use crate::module_env::ModuleEnvironment;
use crate::object_store::{ObjectId, ObjectStore};
use crate::position::SourcePosition;
use crate::value::Value;

/// Runaway-recursion/loop guards (§10, generalized from the teacher's
/// `ExecutionLimits`, whose `max_iterations` has no PawScript analogue since
/// there is no shell loop construct here — unbounded macro/brace recursion is
/// the equivalent hazard).
#[derive(Debug, Clone, Copy)]
pub struct ExecutionLimits {
    pub max_recursion_depth: u32,
    pub max_command_count: u64,
    pub max_brace_depth: u32,
}

impl Default for ExecutionLimits {
    fn default() -> Self {
        Self { max_recursion_depth: 1000, max_command_count: 100_000, max_brace_depth: 64 }
    }
}

/// A link in the macro-invocation chain, used for stack traces in error
/// messages (`spec.md` §3 `MacroContext`).
#[derive(Debug, Clone)]
pub struct MacroContext {
    pub name: String,
    pub def_position: SourcePosition,
    pub invocation_position: SourcePosition,
    pub parent: Option<Arc<MacroContext>>,
}

#[derive(Debug)]
pub struct ExecutionState {
    variables: Arc<Mutex<HashMap<String, Value>>>,
    claimed_vars: Arc<Mutex<HashSet<ObjectId>>>,
    result: Option<Value>,
    result_claim: Option<ObjectId>,
    pub last_status: bool,
    pub module_env: ModuleEnvironment,
    pub macro_context: Option<Arc<MacroContext>>,
    /// Scope-local claims that don't belong to a named variable (the macro
    /// args-list object bound under `$@`, brace-evaluation temporaries).
    owned_objects: HashSet<ObjectId>,
    pub in_brace: bool,
    limits: Arc<ExecutionLimits>,
    macro_depth: u32,
    brace_depth: u32,
    command_count: Arc<AtomicU64>,
}

impl ExecutionState {
    pub fn new_root(module_env: ModuleEnvironment) -> Self {
        Self::new_root_with_limits(module_env, Arc::new(ExecutionLimits::default()))
    }

    pub fn new_root_with_limits(module_env: ModuleEnvironment, limits: Arc<ExecutionLimits>) -> Self {
        Self {
            variables: Arc::new(Mutex::new(HashMap::new())),
            claimed_vars: Arc::new(Mutex::new(HashSet::new())),
            result: None,
            result_claim: None,
            last_status: true,
            module_env,
            macro_context: None,
            owned_objects: HashSet::new(),
            in_brace: false,
            limits,
            macro_depth: 0,
            brace_depth: 0,
            command_count: Arc::new(AtomicU64::new(0)),
        }
    }

    /// A same-scope parenthetic block: shares the variable map, inherits
    /// `module_env`/`macro_context`, sets `in_brace`.
    pub fn child_for_block(&self) -> Self {
        Self {
            variables: self.variables.clone(),
            claimed_vars: self.claimed_vars.clone(),
            result: None,
            result_claim: None,
            last_status: self.last_status,
            module_env: self.module_env.clone(),
            macro_context: self.macro_context.clone(),
            owned_objects: HashSet::new(),
            in_brace: true,
            limits: self.limits.clone(),
            macro_depth: self.macro_depth,
            brace_depth: self.brace_depth,
            command_count: self.command_count.clone(),
        }
    }

    /// A macro invocation: fresh variable map, given `module_env` (a child
    /// of either the macro's captured env or the caller's, per `spec.md`
    /// §4.8), and a new macro-context frame. Callers must check
    /// `check_recursion_limit` first (`macros::execute` does).
    pub fn child_for_macro(&self, module_env: ModuleEnvironment, macro_context: Arc<MacroContext>) -> Self {
        Self {
            variables: Arc::new(Mutex::new(HashMap::new())),
            claimed_vars: Arc::new(Mutex::new(HashSet::new())),
            result: None,
            result_claim: None,
            last_status: true,
            module_env,
            macro_context: Some(macro_context),
            owned_objects: HashSet::new(),
            in_brace: false,
            limits: self.limits.clone(),
            macro_depth: self.macro_depth + 1,
            brace_depth: self.brace_depth,
            command_count: self.command_count.clone(),
        }
    }

    /// A brace sub-script shares the caller's module env and variables but
    /// gets its own result slot (Stage A evaluates it independently).
    /// Callers must check `check_brace_depth_limit` first (`executor::Runner`
    /// does, in `run_brace_body`).
    pub fn child_for_brace(&self) -> Self {
        let mut child = self.child_for_block();
        child.in_brace = true;
        child.brace_depth = self.brace_depth + 1;
        child
    }

    /// §10: reject a macro invocation once nesting exceeds
    /// `limits.max_recursion_depth`.
    pub fn check_recursion_limit(&self) -> Result<(), EngineError> {
        if self.macro_depth >= self.limits.max_recursion_depth {
            return Err(EngineError::Internal { message: format!("macro recursion depth exceeded ({})", self.limits.max_recursion_depth) });
        }
        Ok(())
    }

    /// §10: reject a brace expression once nesting exceeds
    /// `limits.max_brace_depth`.
    pub fn check_brace_depth_limit(&self) -> Result<(), EngineError> {
        if self.brace_depth >= self.limits.max_brace_depth {
            return Err(EngineError::Internal { message: format!("brace nesting depth exceeded ({})", self.limits.max_brace_depth) });
        }
        Ok(())
    }

    /// §10: count one more dispatched command against
    /// `limits.max_command_count`, shared across every state descended from
    /// the same root (block/macro/brace children all bump the same counter).
    pub fn check_command_limit(&self) -> Result<(), EngineError> {
        let count = self.command_count.fetch_add(1, Ordering::Relaxed) + 1;
        if count > self.limits.max_command_count {
            return Err(EngineError::Internal { message: format!("command count exceeded ({})", self.limits.max_command_count) });
        }
        Ok(())
    }

    pub fn get_var(&self, name: &str) -> Option<Value> {
        self.variables.lock().unwrap().get(name).cloned()
    }

    pub fn set_var(&mut self, store: &ObjectStore, name: &str, value: Value) {
        let mut vars = self.variables.lock().unwrap();
        let mut claimed = self.claimed_vars.lock().unwrap();
        if let Some(Value::Object(old_id, _)) = vars.get(name) {
            store.release(*old_id);
            claimed.remove(old_id);
        }
        if let Value::Object(id, _) = &value {
            store.claim(*id);
            claimed.insert(*id);
        }
        vars.insert(name.to_string(), value);
    }

    /// `undefined` deletes the variable without altering the current
    /// result (`spec.md` §4.7).
    pub fn remove_var(&mut self, store: &ObjectStore, name: &str) {
        let mut vars = self.variables.lock().unwrap();
        let mut claimed = self.claimed_vars.lock().unwrap();
        if let Some(Value::Object(old_id, _)) = vars.remove(name) {
            store.release(old_id);
            claimed.remove(&old_id);
        }
    }

    pub fn has_result(&self) -> bool {
        self.result.is_some()
    }

    pub fn get_result(&self) -> Option<&Value> {
        self.result.as_ref()
    }

    pub fn set_result(&mut self, store: &ObjectStore, value: Value) {
        if let Some(old) = self.result_claim.take() {
            store.release(old);
        }
        if let Value::Object(id, _) = &value {
            store.claim(*id);
            self.result_claim = Some(*id);
        }
        self.result = Some(value);
    }

    pub fn clear_result(&mut self, store: &ObjectStore) {
        if let Some(old) = self.result_claim.take() {
            store.release(old);
        }
        self.result = None;
    }

    /// Claim `id` into this scope's local (non-variable) ownership set, e.g.
    /// the args-list object bound under `$@` for a macro/block invocation.
    pub fn claim_owned(&mut self, store: &ObjectStore, id: ObjectId) {
        store.claim(id);
        self.owned_objects.insert(id);
    }

    /// Release every reference this state owns: its result, its
    /// scope-local claims, and — only if this is the last state sharing the
    /// variable map (i.e. no sibling block still holds it) — the variables
    /// themselves. Called on every exit path (`spec.md` §7 resource safety).
    pub fn release_all(&mut self, store: &ObjectStore) {
        if let Some(id) = self.result_claim.take() {
            store.release(id);
        }
        self.result = None;
        for id in self.owned_objects.drain() {
            store.release(id);
        }
        if Arc::strong_count(&self.variables) == 1 {
            let mut claimed = self.claimed_vars.lock().unwrap();
            for id in claimed.drain() {
                store.release(id);
            }
            self.variables.lock().unwrap().clear();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::object_store::Payload;

    fn store_and_root() -> (ObjectStore, ExecutionState) {
        let store = ObjectStore::new();
        let env = ModuleEnvironment::new_root("main");
        (store, ExecutionState::new_root(env))
    }

    #[test]
    fn set_result_claims_and_clear_releases() {
        let (store, mut state) = store_and_root();
        let id = store.store(Payload::Bytes(vec![1]));
        state.set_result(&store, Value::Object(id, crate::value::ObjectKind::Bytes));
        assert_eq!(store.refcount(id), 2);
        state.clear_result(&store);
        assert_eq!(store.refcount(id), 1);
    }

    #[test]
    fn block_children_share_variables() {
        let (store, mut root) = store_and_root();
        root.set_var(&store, "x", Value::Int(1));
        let child = root.child_for_block();
        assert_eq!(child.get_var("x"), Some(Value::Int(1)));
    }

    #[test]
    fn macro_children_do_not_share_variables() {
        let (store, mut root) = store_and_root();
        root.set_var(&store, "x", Value::Int(1));
        let env = root.module_env.clone();
        let ctx = Arc::new(MacroContext {
            name: "m".to_string(),
            def_position: SourcePosition::synthetic(),
            invocation_position: SourcePosition::synthetic(),
            parent: None,
        });
        let child = root.child_for_macro(env, ctx);
        assert_eq!(child.get_var("x"), None);
    }

    #[test]
    fn release_all_frees_result_and_owned() {
        let (store, mut state) = store_and_root();
        let id = store.store(Payload::Bytes(vec![]));
        state.claim_owned(&store, id);
        state.release_all(&store);
        assert!(!store.is_alive(id));
    }
}
