// ABOUTME: Per-kind concurrent registry mapping 32-bit connection-scoped ids to shared entities
// ABOUTME: The registry lock is held only for single get/put/remove operations, never across I/O

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

/// An id-keyed map of live entities of one kind and one direction.
///
/// Entities are co-owned by the registry and by any worker task still holding
/// a reference; removal merely drops the registry's reference. Ids are never
/// reused while an owner remains, so no weak references are needed.
///
/// Lock discipline: the internal lock covers exactly one map operation per
/// call. Callers acquire entity locks only after the registry call returns,
/// preserving the registry-lock before entity-lock order.
pub(crate) struct Registry<T> {
    entries: Mutex<HashMap<u32, Arc<T>>>,
}

impl<T> Registry<T> {
    pub(crate) fn new() -> Registry<T> {
        Registry {
            entries: Mutex::new(HashMap::new()),
        }
    }

    /// Inserts `entity` under `id`. Returns false (leaving the existing entry
    /// untouched) if the id is already present.
    pub(crate) fn insert(&self, id: u32, entity: Arc<T>) -> bool {
        let mut entries = self.entries.lock().unwrap();
        if entries.contains_key(&id) {
            return false;
        }
        entries.insert(id, entity);
        true
    }

    pub(crate) fn get(&self, id: u32) -> Option<Arc<T>> {
        self.entries.lock().unwrap().get(&id).cloned()
    }

    pub(crate) fn remove(&self, id: u32) -> Option<Arc<T>> {
        self.entries.lock().unwrap().remove(&id)
    }

    /// Removes and returns every entry, for connection teardown.
    pub(crate) fn drain(&self) -> Vec<Arc<T>> {
        let mut entries = self.entries.lock().unwrap();
        entries.drain().map(|(_, entity)| entity).collect()
    }

    pub(crate) fn len(&self) -> usize {
        self.entries.lock().unwrap().len()
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.entries.lock().unwrap().is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn insert_then_get_returns_same_entity() {
        let registry: Registry<u32> = Registry::new();
        let entity = Arc::new(42u32);

        assert!(registry.insert(7, Arc::clone(&entity)));
        let found = registry.get(7).unwrap();
        assert!(Arc::ptr_eq(&found, &entity));
    }

    #[test]
    fn insert_rejects_occupied_id() {
        let registry: Registry<u32> = Registry::new();
        assert!(registry.insert(7, Arc::new(1)));
        assert!(!registry.insert(7, Arc::new(2)));

        // The original entry survives
        assert_eq!(*registry.get(7).unwrap(), 1);
    }

    #[test]
    fn remove_is_idempotent() {
        let registry: Registry<u32> = Registry::new();
        registry.insert(7, Arc::new(1));

        assert!(registry.remove(7).is_some());
        assert!(registry.remove(7).is_none());
        assert!(registry.is_empty());
    }

    #[test]
    fn drain_empties_the_registry() {
        let registry: Registry<u32> = Registry::new();
        registry.insert(1, Arc::new(10));
        registry.insert(2, Arc::new(20));

        let drained = registry.drain();
        assert_eq!(drained.len(), 2);
        assert!(registry.is_empty());
        assert_eq!(registry.len(), 0);
    }
}
