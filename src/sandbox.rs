//! Sandbox policy (§6 `configure` "read/write/exec root allow-lists").
//!
//! Grounded on `sandbox/types.rs`'s options-struct-plus-gated-operation
//! shape, cut down to the root-list check `spec.md` explicitly scopes this
//! concern to ("sandboxing policies beyond a simple root-list check" are a
//! non-goal).

use std::path::{Path, PathBuf};

use crate::errors::EngineError;
use crate::position::SourcePosition;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RootKind {
    Read,
    Write,
    Exec,
}

/// Per-`Engine` allow-list policy: an empty list for a `RootKind` means
/// unrestricted (the default), matching `configure`'s optional root
/// allow-lists.
#[derive(Debug, Clone, Default)]
pub struct SandboxPolicy {
    read_roots: Vec<PathBuf>,
    write_roots: Vec<PathBuf>,
    exec_roots: Vec<PathBuf>,
}

impl SandboxPolicy {
    pub fn new(read_roots: Vec<PathBuf>, write_roots: Vec<PathBuf>, exec_roots: Vec<PathBuf>) -> Self {
        Self { read_roots, write_roots, exec_roots }
    }

    fn roots_for(&self, kind: RootKind) -> &[PathBuf] {
        match kind {
            RootKind::Read => &self.read_roots,
            RootKind::Write => &self.write_roots,
            RootKind::Exec => &self.exec_roots,
        }
    }

    /// `path` is permitted for `kind` if the allow-list for `kind` is
    /// empty, or `path` lies under one of its roots. Paths are compared
    /// without touching the filesystem (no canonicalization), matching
    /// the "simple root-list check" scope.
    pub fn check_root(&self, kind: RootKind, path: &Path) -> Result<(), EngineError> {
        let roots = self.roots_for(kind);
        if roots.is_empty() || roots.iter().any(|root| path.starts_with(root)) {
            return Ok(());
        }
        Err(EngineError::ArgumentValidation {
            command: "sandbox".to_string(),
            message: format!("path '{}' is outside the allowed {:?} roots", path.display(), kind),
            position: SourcePosition::synthetic(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_allow_list_permits_everything() {
        let policy = SandboxPolicy::default();
        assert!(policy.check_root(RootKind::Read, Path::new("/anywhere")).is_ok());
    }

    #[test]
    fn path_under_allowed_root_is_permitted() {
        let policy = SandboxPolicy::new(vec![], vec![PathBuf::from("/workspace")], vec![]);
        assert!(policy.check_root(RootKind::Write, Path::new("/workspace/out.txt")).is_ok());
    }

    #[test]
    fn path_outside_allowed_roots_is_rejected() {
        let policy = SandboxPolicy::new(vec![], vec![PathBuf::from("/workspace")], vec![]);
        assert!(policy.check_root(RootKind::Write, Path::new("/etc/passwd")).is_err());
    }

    #[test]
    fn root_kinds_are_independent() {
        let policy = SandboxPolicy::new(vec![PathBuf::from("/data")], vec![], vec![]);
        assert!(policy.check_root(RootKind::Read, Path::new("/data/in.txt")).is_ok());
        assert!(policy.check_root(RootKind::Write, Path::new("/data/in.txt")).is_err());
    }
}
