//! Process-wide memoization of schema-vertex lookups.
//!
//! The engine resolves schema entries by name and by adjacency through a
//! retrieval callback. Both lookups hit the hot path of every transaction,
//! so results are memoized here. Misses are single-flight per key: the
//! first caller holds the key's slot while fetching, and concurrent callers
//! for the same key block on that slot rather than issuing a second fetch.

use parking_lot::{Mutex, RwLock};
use rustc_hash::FxHashMap;
use std::hash::Hash;
use std::sync::Arc;

use crate::error::StorageError;

use super::schema::Direction;
use super::{EntryList, TypeId, VertexId};

/// Callback the engine supplies to resolve cache misses from storage.
pub trait SchemaRetriever: Send + Sync {
    /// The schema vertex registered under `name`, if any.
    fn retrieve_schema_by_name(&self, name: &str) -> Result<Option<VertexId>, StorageError>;

    /// The adjacency of a schema vertex for one system type and direction.
    fn retrieve_schema_relations(
        &self,
        schema_id: VertexId,
        type_id: TypeId,
        dir: Direction,
    ) -> Result<EntryList, StorageError>;
}

/// A single-flight memo map. Values are cloned out; fetches for distinct
/// keys proceed in parallel.
struct MemoMap<K, V> {
    slots: RwLock<FxHashMap<K, Arc<Mutex<Option<V>>>>>,
}

impl<K: Eq + Hash + Clone, V: Clone> Default for MemoMap<K, V> {
    fn default() -> Self {
        Self {
            slots: RwLock::default(),
        }
    }
}

impl<K: Eq + Hash + Clone, V: Clone> MemoMap<K, V> {
    fn get_or_fetch(
        &self,
        key: &K,
        fetch: impl FnOnce() -> Result<V, StorageError>,
    ) -> Result<V, StorageError> {
        let slot = {
            let slots = self.slots.read();
            slots.get(key).cloned()
        };
        let slot = match slot {
            Some(slot) => slot,
            None => {
                let mut slots = self.slots.write();
                slots.entry(key.clone()).or_default().clone()
            }
        };

        // Holding the slot (not the map) during the fetch serializes misses
        // per key while leaving other keys unobstructed.
        let mut value = slot.lock();
        if let Some(cached) = &*value {
            return Ok(cached.clone());
        }
        let fetched = fetch()?;
        *value = Some(fetched.clone());
        Ok(fetched)
    }

    fn clear(&self) {
        self.slots.write().clear();
    }
}

/// The shared schema cache. Negative name lookups are cached too.
pub struct SchemaCache {
    by_name: MemoMap<String, Option<VertexId>>,
    relations: MemoMap<(VertexId, TypeId, Direction), EntryList>,
}

impl Default for SchemaCache {
    fn default() -> Self {
        Self {
            by_name: MemoMap::default(),
            relations: MemoMap::default(),
        }
    }
}

impl SchemaCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn schema_by_name(
        &self,
        name: &str,
        retriever: &dyn SchemaRetriever,
    ) -> Result<Option<VertexId>, StorageError> {
        self.by_name
            .get_or_fetch(&name.to_owned(), || retriever.retrieve_schema_by_name(name))
    }

    pub fn schema_relations(
        &self,
        schema_id: VertexId,
        type_id: TypeId,
        dir: Direction,
        retriever: &dyn SchemaRetriever,
    ) -> Result<EntryList, StorageError> {
        self.relations.get_or_fetch(&(schema_id, type_id, dir), || {
            retriever.retrieve_schema_relations(schema_id, type_id, dir)
        })
    }

    /// Drop all memoized entries (schema change or shutdown).
    pub fn clear(&self) {
        self.by_name.clear();
        self.relations.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct CountingRetriever {
        fetches: AtomicUsize,
    }

    impl CountingRetriever {
        fn new() -> Self {
            Self {
                fetches: AtomicUsize::new(0),
            }
        }
    }

    impl SchemaRetriever for CountingRetriever {
        fn retrieve_schema_by_name(&self, name: &str) -> Result<Option<VertexId>, StorageError> {
            self.fetches.fetch_add(1, Ordering::SeqCst);
            // Make the miss window wide enough that racing threads pile up
            // on the slot.
            std::thread::sleep(std::time::Duration::from_millis(10));
            Ok(if name == "missing" {
                None
            } else {
                Some(VertexId(1))
            })
        }

        fn retrieve_schema_relations(
            &self,
            _schema_id: VertexId,
            _type_id: TypeId,
            _dir: Direction,
        ) -> Result<EntryList, StorageError> {
            self.fetches.fetch_add(1, Ordering::SeqCst);
            Ok(Vec::new())
        }
    }

    #[test]
    fn hits_skip_the_retriever() {
        let cache = SchemaCache::new();
        let retriever = CountingRetriever::new();
        for _ in 0..5 {
            assert_eq!(
                cache.schema_by_name("person", &retriever).unwrap(),
                Some(VertexId(1))
            );
        }
        assert_eq!(retriever.fetches.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn negative_lookups_are_cached() {
        let cache = SchemaCache::new();
        let retriever = CountingRetriever::new();
        for _ in 0..3 {
            assert_eq!(cache.schema_by_name("missing", &retriever).unwrap(), None);
        }
        assert_eq!(retriever.fetches.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn concurrent_misses_fetch_once_per_key() {
        let cache = Arc::new(SchemaCache::new());
        let retriever = Arc::new(CountingRetriever::new());
        let threads: Vec<_> = (0..8)
            .map(|_| {
                let cache = cache.clone();
                let retriever = retriever.clone();
                std::thread::spawn(move || {
                    cache.schema_by_name("person", retriever.as_ref()).unwrap()
                })
            })
            .collect();
        for thread in threads {
            assert_eq!(thread.join().unwrap(), Some(VertexId(1)));
        }
        assert_eq!(retriever.fetches.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn clear_forces_refetch() {
        let cache = SchemaCache::new();
        let retriever = CountingRetriever::new();
        cache.schema_by_name("person", &retriever).unwrap();
        cache.clear();
        cache.schema_by_name("person", &retriever).unwrap();
        assert_eq!(retriever.fetches.load(Ordering::SeqCst), 2);
    }
}
