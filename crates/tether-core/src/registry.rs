//! The handle registry: stable integer identities for reflected entities.
//!
//! A growable slot table whose index is the handle, with a side map from
//! (stable identity hash, owning module) to index so registration is
//! idempotent. Slots are tombstoned when their owning module unloads and
//! never recycled, so a stale handle resolves to not-found instead of
//! aliasing a new entity.

use rustc_hash::FxHashMap;

use crate::error::ResolveError;
use crate::handle::{Handle, ModuleId};
use crate::stable_hash::StableHash;
use crate::value::Callable;

/// Index into the engine's type table.
pub type TypeIndex = u32;

/// A reflected entity reachable through a handle.
#[derive(Debug, Clone)]
pub enum Entity {
    Type(TypeIndex),
    Method { ty: TypeIndex, index: u32 },
    Field { ty: TypeIndex, index: u32 },
    Property { ty: TypeIndex, index: u32 },
    Attribute { ty: TypeIndex, index: u32 },
    Callable(Callable),
}

/// One live registry entry.
#[derive(Debug, Clone)]
pub struct Entry {
    pub module: ModuleId,
    pub key: StableHash,
    pub entity: Entity,
}

/// Process-wide handle table. Callers wrap it in a lock; `register` is an
/// insert-if-absent so concurrent first registrations converge on one
/// handle.
#[derive(Default)]
pub struct HandleTable {
    slots: Vec<Option<Entry>>,
    by_key: FxHashMap<(StableHash, ModuleId), u32>,
}

impl HandleTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register an entity, returning its stable handle. Registering the
    /// same (key, module) again returns the existing handle untouched.
    pub fn register(&mut self, module: ModuleId, key: StableHash, entity: Entity) -> Handle {
        if let Some(&index) = self.by_key.get(&(key, module)) {
            return Handle::from_index(index);
        }
        let index = self.slots.len() as u32;
        self.slots.push(Some(Entry {
            module,
            key,
            entity,
        }));
        self.by_key.insert((key, module), index);
        Handle::from_index(index)
    }

    /// Resolve a handle to its entry.
    pub fn resolve(&self, handle: Handle) -> Result<&Entry, ResolveError> {
        let index = handle
            .index()
            .ok_or(ResolveError::UnknownHandle(handle))?;
        self.slots
            .get(index as usize)
            .and_then(Option::as_ref)
            .ok_or(ResolveError::UnknownHandle(handle))
    }

    /// Look up the handle previously issued for (key, module).
    pub fn lookup(&self, module: ModuleId, key: StableHash) -> Option<Handle> {
        self.by_key
            .get(&(key, module))
            .map(|&index| Handle::from_index(index))
    }

    /// Look up a key across all modules. Used for name-based resolution
    /// where the caller does not know the owning module.
    pub fn lookup_any(&self, key: StableHash) -> Option<Handle> {
        self.by_key
            .iter()
            .find(|((k, _), _)| *k == key)
            .map(|(_, &index)| Handle::from_index(index))
    }

    /// Tombstone every entry owned by `module`. Returns how many were
    /// invalidated.
    pub fn invalidate_module(&mut self, module: ModuleId) -> usize {
        let mut removed = 0;
        for slot in &mut self.slots {
            if slot.as_ref().is_some_and(|e| e.module == module) {
                *slot = None;
                removed += 1;
            }
        }
        self.by_key.retain(|&(_, m), _| m != module);
        removed
    }

    /// Handles of every live entry owned by `module` matching `filter`.
    pub fn handles_for_module(
        &self,
        module: ModuleId,
        filter: impl Fn(&Entity) -> bool,
    ) -> Vec<Handle> {
        self.slots
            .iter()
            .enumerate()
            .filter_map(|(i, slot)| {
                let entry = slot.as_ref()?;
                (entry.module == module && filter(&entry.entity))
                    .then(|| Handle::from_index(i as u32))
            })
            .collect()
    }

    pub fn len(&self) -> usize {
        self.slots.iter().filter(|s| s.is_some()).count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn module(n: u64) -> ModuleId {
        ModuleId::from_raw(n)
    }

    #[test]
    fn register_is_idempotent() {
        let mut table = HandleTable::new();
        let key = StableHash::of_type("Player");
        let a = table.register(module(1), key, Entity::Type(0));
        let b = table.register(module(1), key, Entity::Type(0));
        assert_eq!(a, b);
        assert_eq!(table.len(), 1);
    }

    #[test]
    fn same_key_different_module_is_distinct() {
        let mut table = HandleTable::new();
        let key = StableHash::of_type("Player");
        let a = table.register(module(1), key, Entity::Type(0));
        let b = table.register(module(2), key, Entity::Type(1));
        assert_ne!(a, b);
    }

    #[test]
    fn resolve_round_trip() {
        let mut table = HandleTable::new();
        let key = StableHash::of_type("Player");
        let handle = table.register(module(1), key, Entity::Type(7));
        let entry = table.resolve(handle).unwrap();
        assert!(matches!(entry.entity, Entity::Type(7)));
        assert_eq!(entry.module, module(1));
    }

    #[test]
    fn resolve_null_and_unknown() {
        let table = HandleTable::new();
        assert!(table.resolve(Handle::NULL).is_err());
        assert!(table.resolve(Handle::from_raw(500)).is_err());
    }

    #[test]
    fn invalidate_module_tombstones() {
        let mut table = HandleTable::new();
        let a = table.register(module(1), StableHash::of_type("A"), Entity::Type(0));
        let b = table.register(module(2), StableHash::of_type("B"), Entity::Type(1));
        assert_eq!(table.invalidate_module(module(1)), 1);
        assert!(table.resolve(a).is_err());
        assert!(table.resolve(b).is_ok());

        // A fresh registration of the same key gets a fresh slot, so the
        // stale handle stays dead.
        let a2 = table.register(module(1), StableHash::of_type("A"), Entity::Type(0));
        assert_ne!(a, a2);
        assert!(table.resolve(a).is_err());
    }
}
