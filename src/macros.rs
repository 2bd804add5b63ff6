//! Macro system (C9): definition and invocation of user-defined commands.
//!
//! Grounded on the teacher's `interpreter/functions.rs` (a function value
//! is a captured environment plus a body text, invoked by pushing a fresh
//! frame and running the body through the same interpreter entry point
//! used for top-level scripts). A PawScript macro additionally merges its
//! `"exports"` library section back into the caller on return (`spec.md`
//! §4.8), which the teacher's functions have no equivalent of — that step
//! is new, not borrowed.

use indexmap::IndexMap;
use std::sync::Arc;

use crate::errors::EngineError;
use crate::executor::{self, ExecResult, Runner};
use crate::object_store::{ObjectId, ObjectStore, Payload};
use crate::position::SourcePosition;
use crate::state::{ExecutionState, MacroContext};
use crate::substitution::SubstitutionContext;
use crate::value::{ListData, ObjectKind, Value};

/// `define name, body, captured_module_env?` (`spec.md` §4.8 step 1):
/// store the macro body as a `Payload::Macro` and return its id. The
/// caller is responsible for binding the returned id under `name` in its
/// own `ModuleEnvironment`. `params` are the declared parameter names from
/// the `IDENT ( … )` sugar header, bound positionally at invocation.
pub fn define(
    store: &ObjectStore,
    command_text: String,
    def_position: SourcePosition,
    captured_env: Option<ObjectId>,
    params: Vec<String>,
) -> ObjectId {
    store.store(Payload::Macro { command_text, def_position, captured_env, params })
}

/// Invoke the macro stored at `macro_id` (`spec.md` §4.8 steps 2–7).
pub fn execute(
    macro_id: ObjectId,
    positional: Vec<Value>,
    named: IndexMap<String, Value>,
    caller_state: ExecutionState,
    runner: &mut Runner,
    store: &ObjectStore,
    invocation_position: SourcePosition,
) -> (ExecutionState, Result<ExecResult, EngineError>) {
    let Some(Payload::Macro { command_text, def_position, params, .. }) = store.get(macro_id) else {
        return (
            caller_state,
            Err(EngineError::MacroNotFound { name: format!("<macro #{}>", macro_id.get()), position: invocation_position }),
        );
    };

    if let Err(e) = caller_state.check_recursion_limit() {
        return (caller_state, Err(e));
    }

    // Step 2: chain a new `MacroContext` frame onto whatever chain the
    // caller is already inside (nested macro invocations get a full
    // stack for error messages).
    let context = Arc::new(MacroContext {
        name: format!("macro#{}", macro_id.get()),
        def_position: def_position.clone(),
        invocation_position: invocation_position.clone(),
        parent: caller_state.macro_context.clone(),
    });

    // Step 3: child module env defaults to "exports" so a bare `EXPORT`
    // inside the body (with no explicit module) lands where the caller
    // expects to merge it back from.
    let mut child_env = caller_state.module_env.child();
    child_env.set_default_module("exports");
    let mut macro_state = caller_state.child_for_macro(child_env, context);

    // Step 4: bind the args list under `$@`/positional substitution and
    // as a plain variable so handlers/macro bodies can also address it by
    // name.
    let mut list = ListData::new();
    list.items = positional.clone();
    list.named = named;
    let args_id = store.store(Payload::List(list));
    macro_state.claim_owned(store, args_id);
    macro_state.set_var(store, "args", Value::Object(args_id, ObjectKind::List));

    // Step 4 (continued): bind each declared parameter name to its
    // positional argument, so `(who)` in the sugar header makes `~who`
    // resolve inside the body, not just `$1`.
    for (i, pname) in params.iter().enumerate() {
        let v = positional.get(i).cloned().unwrap_or(Value::Nil);
        macro_state.set_var(store, pname, v);
    }

    let subst_ctx = SubstitutionContext { positional: positional.iter().map(Value::stringify).collect(), args_object: Some(args_id) };

    // Step 5: run the body through the ordinary top-level entry point.
    let (mut macro_state, outcome) = executor::execute_top_level(&command_text, "<macro>", macro_state, runner, store, &subst_ctx);

    // Step 6: merge the body's "exports" library section back into the
    // caller's inherited library, then transfer its result/status.
    let exports = macro_state.module_env.exports_for("exports");
    let mut caller_state = caller_state;
    caller_state.module_env.merge_exports("exports", exports);

    let result = match outcome {
        Ok(ExecResult::Bool(status)) => {
            caller_state.last_status = status;
            if let Some(v) = macro_state.get_result() {
                let v = v.clone();
                caller_state.set_result(store, v);
            }
            Ok(ExecResult::Bool(status))
        }
        Ok(ExecResult::EarlyReturn { status, value }) => {
            caller_state.last_status = status;
            if let Some(v) = value {
                caller_state.set_result(store, v);
            }
            Ok(ExecResult::Bool(status))
        }
        Ok(ExecResult::Yield { value }) => {
            caller_state.set_result(store, value.clone());
            Ok(ExecResult::Yield { value })
        }
        other => other,
    };

    // Step 7: release every reference the macro's own scope held; its
    // result (already copied above) and the args-list claim both go.
    macro_state.release_all(store);
    (caller_state, result)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::executor::CommandRegistry;
    use crate::module_env::ModuleEnvironment;
    use crate::token_manager::TokenManager;

    fn fresh() -> (ObjectStore, TokenManager, CommandRegistry, ExecutionState) {
        let store = ObjectStore::new();
        let tokens = TokenManager::new(std::time::Duration::from_secs(300));
        let registry = CommandRegistry::new();
        let state = ExecutionState::new_root(ModuleEnvironment::new_root("main"));
        (store, tokens, registry, state)
    }

    #[test]
    fn macro_binds_args_and_returns_result() {
        let (store, tokens, registry, state) = fresh();
        let mut runner = Runner { tokens: &tokens, registry: &registry, fallback: None, debug: false };
        let id = define(&store, "out: $1".to_string(), SourcePosition::synthetic(), None, Vec::new());
        let (state, result) = execute(id, vec![Value::Int(9)], IndexMap::new(), state, &mut runner, &store, SourcePosition::synthetic());
        assert!(matches!(result, Ok(ExecResult::Bool(true))));
        assert_eq!(state.get_result(), Some(&Value::Int(9)));
    }

    #[test]
    fn macro_binds_declared_parameter_name() {
        let (store, tokens, registry, state) = fresh();
        let mut runner = Runner { tokens: &tokens, registry: &registry, fallback: None, debug: false };
        let id = define(&store, "out: ~who".to_string(), SourcePosition::synthetic(), None, vec!["who".to_string()]);
        let (state, result) = execute(id, vec![Value::Str("world".to_string())], IndexMap::new(), state, &mut runner, &store, SourcePosition::synthetic());
        assert!(matches!(result, Ok(ExecResult::Bool(true))));
        assert_eq!(state.get_result(), Some(&Value::Str("world".to_string())));
    }

    #[test]
    fn macro_export_merges_into_caller_library() {
        let (store, tokens, registry, state) = fresh();
        let mut runner = Runner { tokens: &tokens, registry: &registry, fallback: None, debug: false };
        let id = define(&store, "EXPORT exports, total, 42".to_string(), SourcePosition::synthetic(), None, Vec::new());
        let (state, result) = execute(id, vec![], IndexMap::new(), state, &mut runner, &store, SourcePosition::synthetic());
        assert!(matches!(result, Ok(ExecResult::Bool(true))));
        let exported = state.module_env.exports_for("exports");
        assert_eq!(exported.get("total"), Some(&Value::Int(42)));
    }

    #[test]
    fn unknown_macro_id_is_an_error() {
        let (store, tokens, registry, state) = fresh();
        let mut runner = Runner { tokens: &tokens, registry: &registry, fallback: None, debug: false };
        let bogus = ObjectId::new(999_999).unwrap();
        let (_state, result) = execute(bogus, vec![], IndexMap::new(), state, &mut runner, &store, SourcePosition::synthetic());
        assert!(matches!(result, Err(EngineError::MacroNotFound { .. })));
    }
}
