//! The refcounted object store (C3).
//!
//! Grounded on the teacher's pattern of an `Arc<dyn Trait + Send + Sync>`
//! guarding a lock-protected map (`fs::FileSystem`, `commands::registry`):
//! here the map is internal rather than behind a trait, since the object
//! store has exactly one implementation, but the same "serialize access
//! behind a lock, share via Arc" shape is kept so a host that multiplexes
//! interpreters over a thread pool is never surprised by a missing `Send`.

use std::collections::HashMap;
use std::num::NonZeroU64;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock};

use crate::value::{ListData, ObjectKind, StructData, Value};

/// A process-wide-unique object id. `NonZeroU64` so `Option<ObjectId>` is
/// free.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ObjectId(NonZeroU64);

impl ObjectId {
    pub fn new(raw: u64) -> Option<Self> {
        NonZeroU64::new(raw).map(ObjectId)
    }

    pub fn get(self) -> u64 {
        self.0.get()
    }
}

/// The payload behind a stored object id, tagged by `ObjectKind`.
#[derive(Debug, Clone)]
pub enum Payload {
    List(ListData),
    Bytes(Vec<u8>),
    Struct(StructData),
    Macro {
        command_text: String,
        def_position: crate::position::SourcePosition,
        captured_env: Option<crate::object_store::ObjectId>,
        /// Declared parameter names from the `IDENT ( … )` sugar header
        /// (`spec.md` §4.2), bound alongside `$1`/`$@` at invocation.
        params: Vec<String>,
    },
    Block { command_text: String },
    Channel,
    File { path: String },
}

impl Payload {
    pub fn kind(&self) -> ObjectKind {
        match self {
            Payload::List(_) => ObjectKind::List,
            Payload::Bytes(_) => ObjectKind::Bytes,
            Payload::Struct(_) => ObjectKind::Struct,
            Payload::Macro { .. } => ObjectKind::Macro,
            Payload::Block { .. } => ObjectKind::Block,
            Payload::Channel => ObjectKind::Channel,
            Payload::File { .. } => ObjectKind::File,
        }
    }

    /// Object ids reachable from this payload (list items/named values,
    /// struct definition id, captured macro environment), used by
    /// `release` to recursively decrement nested references (Invariant 2).
    fn nested_refs(&self) -> Vec<ObjectId> {
        let mut out = Vec::new();
        match self {
            Payload::List(list) => {
                for v in &list.items {
                    if let Value::Object(id, _) = v {
                        out.push(*id);
                    }
                }
                for v in list.named.values() {
                    if let Value::Object(id, _) = v {
                        out.push(*id);
                    }
                }
            }
            Payload::Struct(s) => {
                if let Some(id) = s.definition_id {
                    out.push(id);
                }
            }
            Payload::Macro { captured_env, .. } => {
                if let Some(id) = captured_env {
                    out.push(*id);
                }
            }
            _ => {}
        }
        out
    }
}

struct Slot {
    refcount: u64,
    payload: Payload,
}

/// Process-wide refcounted heap for composite values. Operations are
/// serialized behind a single `RwLock` (read-preferring, matching the
/// discipline `spec.md` §5 mandates for the object store).
#[derive(Clone)]
pub struct ObjectStore {
    inner: Arc<RwLock<HashMap<ObjectId, Slot>>>,
    next_id: Arc<AtomicU64>,
}

impl ObjectStore {
    pub fn new() -> Self {
        Self { inner: Arc::new(RwLock::new(HashMap::new())), next_id: Arc::new(AtomicU64::new(1)) }
    }

    /// Store `payload` with an initial refcount of 1, returning its id.
    pub fn store(&self, payload: Payload) -> ObjectId {
        let raw = self.next_id.fetch_add(1, Ordering::Relaxed);
        let id = ObjectId::new(raw).expect("counter starts at 1 and only increases");
        self.inner.write().unwrap().insert(id, Slot { refcount: 1, payload });
        id
    }

    /// Fetch a read-only clone of the payload at `id`, if alive.
    pub fn get(&self, id: ObjectId) -> Option<Payload> {
        self.inner.read().unwrap().get(&id).map(|s| s.payload.clone())
    }

    /// Replace the payload at `id` in place (used for bytes written
    /// through a file handle, or explicit in-place struct mutation).
    pub fn set(&self, id: ObjectId, payload: Payload) {
        if let Some(slot) = self.inner.write().unwrap().get_mut(&id) {
            slot.payload = payload;
        }
    }

    pub fn refcount(&self, id: ObjectId) -> u64 {
        self.inner.read().unwrap().get(&id).map(|s| s.refcount).unwrap_or(0)
    }

    pub fn is_alive(&self, id: ObjectId) -> bool {
        self.inner.read().unwrap().contains_key(&id)
    }

    /// Increment the refcount of `id`. No-op if the id is not alive
    /// (defensive: a caller racing a release should not panic).
    pub fn claim(&self, id: ObjectId) {
        if let Some(slot) = self.inner.write().unwrap().get_mut(&id) {
            slot.refcount += 1;
        }
    }

    /// Decrement the refcount of `id`; if it reaches zero, free the slot
    /// and recursively release any nested object references reachable
    /// from its payload (Invariant 2: release must be idempotent and
    /// recurse before freeing).
    pub fn release(&self, id: ObjectId) {
        let nested = {
            let mut guard = self.inner.write().unwrap();
            match guard.get_mut(&id) {
                None => return, // already freed: idempotent
                Some(slot) => {
                    slot.refcount = slot.refcount.saturating_sub(1);
                    if slot.refcount > 0 {
                        return;
                    }
                    let removed = guard.remove(&id).expect("just matched");
                    removed.payload.nested_refs()
                }
            }
        };
        for nested_id in nested {
            self.release(nested_id);
        }
    }

    pub fn len(&self) -> usize {
        self.inner.read().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for ObjectStore {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn store_and_release_frees_slot() {
        let store = ObjectStore::new();
        let id = store.store(Payload::Bytes(vec![1, 2, 3]));
        assert_eq!(store.refcount(id), 1);
        store.release(id);
        assert!(!store.is_alive(id));
    }

    #[test]
    fn claim_keeps_object_alive_across_one_release() {
        let store = ObjectStore::new();
        let id = store.store(Payload::Bytes(vec![]));
        store.claim(id);
        assert_eq!(store.refcount(id), 2);
        store.release(id);
        assert!(store.is_alive(id));
        store.release(id);
        assert!(!store.is_alive(id));
    }

    #[test]
    fn releasing_list_recursively_releases_nested_objects() {
        let store = ObjectStore::new();
        let inner = store.store(Payload::Bytes(vec![9]));
        let mut list = ListData::new();
        list.items.push(Value::Object(inner, ObjectKind::Bytes));
        let outer = store.store(Payload::List(list));
        store.release(outer);
        assert!(!store.is_alive(outer));
        assert!(!store.is_alive(inner));
    }

    #[test]
    fn release_on_dead_id_is_idempotent_noop() {
        let store = ObjectStore::new();
        let id = store.store(Payload::Bytes(vec![]));
        store.release(id);
        store.release(id); // must not panic
        assert!(!store.is_alive(id));
    }
}
