//! Module environment (C5): hierarchical, copy-on-write namespaces for
//! commands, macros, imports, exports, and per-category log filtering.
//!
//! Grounded on the teacher's `interpreter/command_resolution.rs` (name
//! resolution walking a scope chain, nearest frame wins) and
//! `interpreter/functions.rs` (a function table as a namespace layer pushed
//! per invocation). PawScript generalizes the single function table into
//! five cooperating tables (`spec.md` §3 `ModuleEnvironment`).

use std::collections::HashMap;
use std::sync::Arc;

use indexmap::IndexMap;

use crate::errors::LogFilterConfig;
use crate::object_store::ObjectId;
use crate::value::Value;

/// An entry a module exposes for `IMPORT`, or that has been merged in from
/// a macro's post-execution export step.
#[derive(Debug, Clone)]
pub enum LibraryItem {
    /// A native command registered (possibly in another module) on the
    /// engine's global registry.
    Command { module: String, original_name: String },
    /// A macro object, referenced by id in the object store.
    Macro(ObjectId),
    /// A plain exported value (the general case `EXPORT` supports).
    Data(Value),
}

#[derive(Debug, Clone)]
pub struct ItemMeta {
    pub original_name: String,
    pub origin_module: String,
}

type LibrarySection = IndexMap<String, LibraryItem>;

#[derive(Debug, Clone, Default)]
struct LocalFrame {
    /// Local command-name overrides: `Some` rebinds (usually via IMPORT),
    /// `None` is an explicit REMOVE shadowing anything inherited.
    commands: IndexMap<String, Option<(String, String)>>,
    /// Local macro bindings, same `None`-means-removed shadowing rule.
    macros: IndexMap<String, Option<ObjectId>>,
    /// Module-scoped variable-like objects (`#in`, `#out`, `#args`, …).
    objects: IndexMap<String, Value>,
    library_restricted: HashMap<String, LibrarySection>,
    library_inherited: HashMap<String, LibrarySection>,
    item_metadata: HashMap<String, ItemMeta>,
    module_exports: HashMap<String, IndexMap<String, Value>>,
    default_module: String,
    log_filter: Arc<LogFilterConfig>,
}

/// A hierarchical, parent-linked scope. Cloning a `ModuleEnvironment` is
/// cheap (an `Arc` bump for the local frame, plus a cheap clone of the
/// parent pointer); mutation clones the local frame only if it is shared
/// (`Arc::make_mut`), matching `spec.md`'s "child environments copy-on-write
/// the parts they mutate."
#[derive(Debug, Clone)]
pub struct ModuleEnvironment {
    parent: Option<Arc<ModuleEnvironment>>,
    local: Arc<LocalFrame>,
}

impl ModuleEnvironment {
    pub fn new_root(default_module: impl Into<String>) -> Self {
        let mut frame = LocalFrame::default();
        frame.default_module = default_module.into();
        Self { parent: None, local: Arc::new(frame) }
    }

    /// A fresh child frame: same visible bindings as `self` (looked up
    /// through the parent chain), empty local overrides.
    pub fn child(&self) -> Self {
        let mut frame = LocalFrame::default();
        frame.default_module = self.local.default_module.clone();
        frame.log_filter = self.local.log_filter.clone();
        Self { parent: Some(Arc::new(self.clone())), local: Arc::new(frame) }
    }

    fn local_mut(&mut self) -> &mut LocalFrame {
        Arc::make_mut(&mut self.local)
    }

    pub fn default_module(&self) -> &str {
        &self.local.default_module
    }

    pub fn set_default_module(&mut self, name: impl Into<String>) {
        self.local_mut().default_module = name.into();
    }

    /// `MODULE`/`LIBRARY`'s `module.command` resolution for native
    /// commands. Returns `None` if `name` is locally removed or not bound
    /// in any ancestor frame.
    pub fn resolve_command(&self, name: &str) -> Option<(String, String)> {
        let mut env = Some(self);
        while let Some(e) = env {
            if let Some(slot) = e.local.commands.get(name) {
                return slot.clone();
            }
            env = e.parent.as_deref();
        }
        None
    }

    pub fn resolve_macro(&self, name: &str) -> Option<ObjectId> {
        let mut env = Some(self);
        while let Some(e) = env {
            if let Some(slot) = e.local.macros.get(name) {
                return *slot;
            }
            env = e.parent.as_deref();
        }
        None
    }

    pub fn resolve_object(&self, name: &str) -> Option<Value> {
        let mut env = Some(self);
        while let Some(e) = env {
            if let Some(v) = e.local.objects.get(name) {
                return Some(v.clone());
            }
            env = e.parent.as_deref();
        }
        None
    }

    pub fn set_object(&mut self, name: impl Into<String>, value: Value) {
        self.local_mut().objects.insert(name.into(), value);
    }

    /// Bind `name` to a native command registered as `(module,
    /// original_name)` in the current frame (used directly by
    /// `registerCommandInModule`'s default-module registration, and by
    /// `IMPORT`).
    pub fn bind_command(&mut self, name: impl Into<String>, module: impl Into<String>, original_name: impl Into<String>) {
        self.local_mut().commands.insert(name.into(), Some((module.into(), original_name.into())));
    }

    pub fn bind_macro(&mut self, name: impl Into<String>, id: ObjectId) {
        self.local_mut().macros.insert(name.into(), Some(id));
    }

    /// `REMOVE name`: shadow any inherited command/macro binding with an
    /// explicit local removal (§4.9).
    pub fn remove(&mut self, name: &str) {
        let frame = self.local_mut();
        frame.commands.insert(name.to_string(), None);
        frame.macros.insert(name.to_string(), None);
    }

    /// `LIBRARY module, items…`: expose `items` (already-resolved local
    /// bindings) under `module` for later `IMPORT`.
    pub fn library(&mut self, module: impl Into<String>, items: Vec<(String, LibraryItem)>) {
        let section = self.local_mut().library_restricted.entry(module.into()).or_default();
        for (name, item) in items {
            section.insert(name, item);
        }
    }

    /// `IMPORT module, items…`: each item is `(original_name, alias)`; the
    /// alias defaults to the original name. Copies the item from
    /// `library_restricted[module]` into the current frame's command/macro
    /// tables, claiming a macro object's refcount and recording provenance.
    pub fn import(
        &mut self,
        module: &str,
        items: Vec<(String, Option<String>)>,
        claim_macro: impl Fn(ObjectId),
    ) -> Result<(), String> {
        let section = self
            .local
            .library_restricted
            .get(module)
            .cloned()
            .ok_or_else(|| format!("no library registered under module '{}'", module))?;
        for (original_name, alias) in items {
            let item = section
                .get(&original_name)
                .ok_or_else(|| format!("'{}' is not exposed by module '{}'", original_name, module))?
                .clone();
            let bound_name = alias.clone().unwrap_or_else(|| original_name.clone());
            match &item {
                LibraryItem::Command { module: m, original_name: o } => {
                    self.bind_command(bound_name.clone(), m.clone(), o.clone());
                }
                LibraryItem::Macro(id) => {
                    claim_macro(*id);
                    self.bind_macro(bound_name.clone(), *id);
                }
                LibraryItem::Data(v) => {
                    self.set_object(bound_name.clone(), v.clone());
                }
            }
            self.local_mut()
                .item_metadata
                .insert(bound_name, ItemMeta { original_name, origin_module: module.to_string() });
        }
        Ok(())
    }

    /// `EXPORT module, name, value`.
    pub fn export(&mut self, module: impl Into<String>, name: impl Into<String>, value: Value) {
        self.local_mut().module_exports.entry(module.into()).or_default().insert(name.into(), value);
    }

    pub fn exports_for(&self, module: &str) -> IndexMap<String, Value> {
        self.local.module_exports.get(module).cloned().unwrap_or_default()
    }

    /// Called after a macro invocation completes (`spec.md` §4.8 step 5):
    /// merge the child's `"exports"` section into this (the caller's)
    /// frame's inherited library under `"exports"`.
    pub fn merge_exports(&mut self, module: &str, exports: IndexMap<String, Value>) {
        let section = self.local_mut().library_inherited.entry(module.to_string()).or_default();
        for (name, value) in exports {
            section.insert(name, LibraryItem::Data(value));
        }
    }

    pub fn log_filter(&self) -> &LogFilterConfig {
        &self.local.log_filter
    }

    pub fn set_log_filter(&mut self, filter: LogFilterConfig) {
        self.local_mut().log_filter = Arc::new(filter);
    }

    pub fn item_metadata(&self, name: &str) -> Option<ItemMeta> {
        self.local.item_metadata.get(name).cloned()
    }

    /// Names with a live (non-`REMOVE`d) macro binding in this frame. Used
    /// by `listMacros`; engines only ever ask this of a root frame with no
    /// parent, so there is no need to walk the chain.
    pub fn bound_macro_names(&self) -> Vec<String> {
        self.local.macros.iter().filter(|(_, v)| v.is_some()).map(|(k, _)| k.clone()).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn remove_shadows_inherited_binding() {
        let mut root = ModuleEnvironment::new_root("main");
        root.bind_command("echo", "main", "echo");
        let mut child = root.child();
        assert!(child.resolve_command("echo").is_some());
        child.remove("echo");
        assert!(child.resolve_command("echo").is_none());
        // parent is unaffected
        assert!(root.resolve_command("echo").is_some());
    }

    #[test]
    fn import_copies_with_rename_and_claims_macro() {
        let mut root = ModuleEnvironment::new_root("main");
        let id = crate::object_store::ObjectId::new(1).unwrap();
        root.library("mathlib", vec![("square".to_string(), LibraryItem::Macro(id))]);
        let mut claims = Vec::new();
        root.import("mathlib", vec![("square".to_string(), Some("sq".to_string()))], |claimed| claims.push(claimed))
            .unwrap();
        assert_eq!(root.resolve_macro("sq"), Some(id));
        assert_eq!(claims, vec![id]);
        let meta = root.item_metadata("sq").unwrap();
        assert_eq!(meta.original_name, "square");
        assert_eq!(meta.origin_module, "mathlib");
    }

    #[test]
    fn export_then_merge_is_visible_as_library_item() {
        let mut caller = ModuleEnvironment::new_root("main");
        let mut child = caller.child();
        child.export("exports", "result", Value::Int(42));
        let exported = child.exports_for("exports");
        caller.merge_exports("exports", exported);
        assert!(caller.local.library_inherited.get("exports").unwrap().contains_key("result"));
    }

    #[test]
    fn child_frames_copy_on_write_independently() {
        let mut root = ModuleEnvironment::new_root("main");
        root.bind_command("a", "main", "a");
        let mut c1 = root.child();
        let c2 = root.child();
        c1.bind_command("b", "main", "b");
        assert!(c1.resolve_command("b").is_some());
        assert!(c2.resolve_command("b").is_none());
    }
}
