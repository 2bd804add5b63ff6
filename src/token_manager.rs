//! Token manager (C8): allocation, chaining, cancellation, timeout, and
//! resumption of completion tokens.
//!
//! Grounded on the async/sync bridge in the teacher's `bash.rs::Bash::exec`
//! (`tokio::task::block_in_place` reconciling an async host call with a
//! synchronous core); PawScript generalizes that single bridge point into a
//! full suspend/resume graph, using `tokio::time` for deadlines instead of
//! the teacher's one-shot blocking call.
//!
//! `resume`/`force_clean` deliberately do not call back into `executor.rs`
//! or `substitution.rs` themselves — they return a `ResumeOutcome`
//! describing what continuation work (if any) remains, and `engine.rs`
//! drives that loop. This keeps the token graph's bookkeeping (children,
//! chaining, timeouts) independent of how a resumed sequence or brace is
//! actually re-executed.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use crate::executor::CommandSequence;
use crate::state::ExecutionState;
use crate::substitution::BraceCoordinator;
use crate::value::Value;

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct TokenId(pub Arc<str>);

impl std::fmt::Display for TokenId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

pub type CleanupFn = Box<dyn FnOnce() + Send>;

pub struct TokenData {
    pub parent: Option<TokenId>,
    pub children: HashSet<TokenId>,
    pub chained_next: Option<TokenId>,
    pub invert_status: bool,
    pub cleanup: Option<CleanupFn>,
    pub owning_state: Option<ExecutionState>,
    pub sequence: Option<CommandSequence>,
    pub brace_coordinator: Option<BraceCoordinator>,
}

/// What `resume`/the timeout sweep determined needs to happen next. The
/// bookkeeping (children force-cleaned, timeout cleared, token removed from
/// the active map) has already happened by the time this is returned.
pub enum ResumeOutcome {
    /// No sequence or brace was attached: the resolved status/value is
    /// final for this token.
    Done { status: bool, value: Option<Value> },
    /// A `CommandSequence` tail was attached; the caller must resume it
    /// (`executor::resume_sequence`) under its `kind`'s rules.
    /// `invert` must be applied by the caller to the sequence's final
    /// resolved status once it finishes executing (§4.6 step 5 runs after
    /// step 4's sequence resumption completes, not before).
    ContinueSequence { state: ExecutionState, sequence: CommandSequence, status: bool, invert: bool },
    /// A brace coordinator was attached; the caller must call
    /// `substitution::resume_stage_a` with the stringified `value`.
    ResumeBrace { state: ExecutionState, coordinator: BraceCoordinator, status: bool, value: Option<Value> },
    /// This token was chained to another; the caller should call `resume`
    /// again with `token`.
    ChainTo { token: TokenId, status: bool, value: Option<Value> },
}

struct Inner {
    tokens: HashMap<TokenId, TokenData>,
    deadlines: HashMap<TokenId, tokio::time::Instant>,
    counter: AtomicU64,
}

/// Process-wide (per-`Engine`) token table. Cheap to clone (`Arc` wrapper);
/// operations are serialized behind a single mutex, matching the
/// read-preferring-lock discipline `spec.md` §5 asks of shared engine
/// state, even though the engine itself is driven from one logical thread
/// at a time.
#[derive(Clone)]
pub struct TokenManager {
    inner: Arc<Mutex<Inner>>,
    default_timeout: Duration,
}

impl TokenManager {
    pub fn new(default_timeout: Duration) -> Self {
        Self {
            inner: Arc::new(Mutex::new(Inner { tokens: HashMap::new(), deadlines: HashMap::new(), counter: AtomicU64::new(1) })),
            default_timeout,
        }
    }

    fn fresh_id(&self) -> TokenId {
        let guard = self.inner.lock().unwrap();
        let n = guard.counter.fetch_add(1, Ordering::Relaxed);
        TokenId(Arc::from(format!("t{:x}", n)))
    }

    /// Allocate a token. `parent` adds this id to the parent's children set
    /// (§4.6). `timeout` overrides the manager's default.
    pub fn request_token(
        &self,
        owning_state: Option<ExecutionState>,
        cleanup: Option<CleanupFn>,
        parent: Option<TokenId>,
        timeout: Option<Duration>,
    ) -> TokenId {
        let id = self.fresh_id();
        let mut guard = self.inner.lock().unwrap();
        if let Some(p) = &parent {
            if let Some(parent_data) = guard.tokens.get_mut(p) {
                parent_data.children.insert(id.clone());
            }
        }
        let deadline = tokio::time::Instant::now() + timeout.unwrap_or(self.default_timeout);
        guard.deadlines.insert(id.clone(), deadline);
        guard.tokens.insert(
            id.clone(),
            TokenData {
                parent,
                children: HashSet::new(),
                chained_next: None,
                invert_status: false,
                cleanup,
                owning_state,
                sequence: None,
                brace_coordinator: None,
            },
        );
        id
    }

    pub fn attach_sequence(&self, token: &TokenId, sequence: CommandSequence) {
        if let Some(data) = self.inner.lock().unwrap().tokens.get_mut(token) {
            data.sequence = Some(sequence);
        }
    }

    pub fn attach_brace_coordinator(&self, token: &TokenId, coordinator: BraceCoordinator) {
        if let Some(data) = self.inner.lock().unwrap().tokens.get_mut(token) {
            data.brace_coordinator = Some(coordinator);
        }
    }

    /// Attach (or replace) the `ExecutionState` a token resumes into. Split
    /// out from `request_token` because the executor often needs to
    /// allocate the id first (to stringify it into a result) and only
    /// knows the final owning state afterward.
    pub fn attach_owning_state(&self, token: &TokenId, state: ExecutionState) {
        if let Some(data) = self.inner.lock().unwrap().tokens.get_mut(token) {
            data.owning_state = Some(state);
        }
    }

    pub fn set_invert(&self, token: &TokenId, invert: bool) {
        if let Some(data) = self.inner.lock().unwrap().tokens.get_mut(token) {
            data.invert_status = invert;
        }
    }

    /// `chain(first, second)`: `first.chainedNext = second`, `second.parent
    /// = first` (§4.6).
    pub fn chain(&self, first: &TokenId, second: &TokenId) {
        let mut guard = self.inner.lock().unwrap();
        if let Some(data) = guard.tokens.get_mut(first) {
            data.chained_next = Some(second.clone());
        }
        if let Some(data) = guard.tokens.get_mut(second) {
            data.parent = Some(first.clone());
        }
    }

    pub fn is_alive(&self, token: &TokenId) -> bool {
        self.inner.lock().unwrap().tokens.contains_key(token)
    }

    pub fn active_count(&self) -> usize {
        self.inner.lock().unwrap().tokens.len()
    }

    /// Resumption (§4.6 steps 1–7, bookkeeping only — see module docs).
    pub fn resume(&self, token: &TokenId, status: bool, value: Option<Value>) -> ResumeOutcome {
        // Step 1: cancel and force-clean children.
        let children = {
            let guard = self.inner.lock().unwrap();
            guard.tokens.get(token).map(|d| d.children.clone()).unwrap_or_default()
        };
        for child in &children {
            self.force_clean(child);
        }

        let mut guard = self.inner.lock().unwrap();
        // Step 2: clear timeout.
        guard.deadlines.remove(token);

        let Some(mut data) = guard.tokens.remove(token) else {
            // Already force-cleaned / removed: resumption is a no-op.
            return ResumeOutcome::Done { status, value };
        };

        // Step 6 (done early so the map mutation and the parent's children
        // set stay consistent before we drop the lock for the caller).
        if let Some(parent_id) = &data.parent {
            if let Some(parent_data) = guard.tokens.get_mut(parent_id) {
                parent_data.children.remove(token);
            }
        }
        drop(guard);

        // A sequence/brace continuation resolves its own status later; only
        // a token with neither gets inversion applied here.
        if let Some(sequence) = data.sequence.take() {
            let state = data.owning_state.take().unwrap_or_else(|| ExecutionState::new_root(crate::module_env::ModuleEnvironment::new_root("main")));
            return ResumeOutcome::ContinueSequence { state, sequence, status, invert: data.invert_status };
        }
        if let Some(coordinator) = data.brace_coordinator.take() {
            let state = data.owning_state.take().unwrap_or_else(|| ExecutionState::new_root(crate::module_env::ModuleEnvironment::new_root("main")));
            return ResumeOutcome::ResumeBrace { state, coordinator, status, value };
        }

        let resolved_status = if data.invert_status { !status } else { status };

        // Step 7: chain to next, if alive.
        if let Some(next) = data.chained_next {
            if self.is_alive(&next) {
                return ResumeOutcome::ChainTo { token: next, status: resolved_status, value };
            }
        }

        ResumeOutcome::Done { status: resolved_status, value }
    }

    /// Force-clean: invoke cleanup (catching/logging errors), cancel
    /// timeout, recurse into children, remove from map. Never re-enters
    /// `resume`.
    pub fn force_clean(&self, token: &TokenId) {
        let mut guard = self.inner.lock().unwrap();
        guard.deadlines.remove(token);
        let Some(data) = guard.tokens.remove(token) else { return };
        drop(guard);

        if let Some(cleanup) = data.cleanup {
            // `catch_unwind` mirrors "invoke cleanup, catching and logging
            // its errors" without letting a panicking handler tear down
            // the whole engine.
            let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(cleanup));
            if result.is_err() {
                crate::log_surface::log_event(
                    &crate::errors::LogFilterConfig::default(),
                    false,
                    crate::errors::ErrorCategory::Token,
                    crate::errors::LogLevel::Warn,
                    false,
                    None,
                    &format!("cleanup callback for token {} panicked", token),
                );
            }
        }
        for child in data.children {
            self.force_clean(&child);
        }
    }

    /// Sweep tokens whose deadline has passed, force-cleaning each and
    /// logging a warning (§4.6 "Timeout").
    pub fn sweep_timeouts(&self) -> Vec<TokenId> {
        let now = tokio::time::Instant::now();
        let expired: Vec<TokenId> = {
            let guard = self.inner.lock().unwrap();
            guard.deadlines.iter().filter(|(_, deadline)| **deadline <= now).map(|(id, _)| id.clone()).collect()
        };
        for id in &expired {
            self.force_clean(id);
            crate::log_surface::log_event(
                &crate::errors::LogFilterConfig::default(),
                false,
                crate::errors::ErrorCategory::Token,
                crate::errors::LogLevel::Warn,
                false,
                None,
                &format!("token {} timed out", id),
            );
        }
        expired
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn request_token_registers_with_parent() {
        let mgr = TokenManager::new(Duration::from_secs(300));
        let parent = mgr.request_token(None, None, None, None);
        let child = mgr.request_token(None, None, Some(parent.clone()), None);
        assert!(mgr.is_alive(&child));
        // Force-cleaning the parent recursively removes the child (P4).
        mgr.force_clean(&parent);
        assert!(!mgr.is_alive(&child));
    }

    #[test]
    fn resume_with_no_attachments_is_done() {
        let mgr = TokenManager::new(Duration::from_secs(300));
        let id = mgr.request_token(None, None, None, None);
        match mgr.resume(&id, true, None) {
            ResumeOutcome::Done { status, .. } => assert!(status),
            _ => panic!("expected Done"),
        }
        assert!(!mgr.is_alive(&id));
    }

    #[test]
    fn resume_applies_inversion() {
        let mgr = TokenManager::new(Duration::from_secs(300));
        let id = mgr.request_token(None, None, None, None);
        mgr.set_invert(&id, true);
        match mgr.resume(&id, true, None) {
            ResumeOutcome::Done { status, .. } => assert!(!status),
            _ => panic!("expected Done"),
        }
    }

    #[test]
    fn chained_token_resumes_into_chain_to() {
        let mgr = TokenManager::new(Duration::from_secs(300));
        let first = mgr.request_token(None, None, None, None);
        let second = mgr.request_token(None, None, None, None);
        mgr.chain(&first, &second);
        match mgr.resume(&first, true, None) {
            ResumeOutcome::ChainTo { token, status, .. } => {
                assert_eq!(token, second);
                assert!(status);
            }
            _ => panic!("expected ChainTo"),
        }
    }

    #[test]
    fn resuming_an_already_cleaned_token_is_a_noop() {
        let mgr = TokenManager::new(Duration::from_secs(300));
        let id = mgr.request_token(None, None, None, None);
        mgr.force_clean(&id);
        match mgr.resume(&id, true, None) {
            ResumeOutcome::Done { .. } => {}
            _ => panic!("expected Done"),
        }
    }
}
