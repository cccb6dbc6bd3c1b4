//! Process-level registry of open graph instances.
//!
//! Each graph registers its unique instance id on open and must release it
//! on shutdown. Registration hands back a guard; dropping the guard (or the
//! graph that owns it) releases the id even on unwinding, so a crashed open
//! cannot wedge the process.

use parking_lot::Mutex;
use rustc_hash::FxHashMap;
use std::sync::Arc;

use crate::error::GraphError;

#[derive(Default)]
struct RegistryInner {
    /// Instance id -> registration time (provider units).
    open: FxHashMap<String, i64>,
}

/// The owned registrar. Clones share one registry.
#[derive(Clone, Default)]
pub struct InstanceRegistry {
    inner: Arc<Mutex<RegistryInner>>,
}

impl InstanceRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `instance_id`, failing if it is already registered.
    pub fn register(&self, instance_id: &str, registered_at: i64) -> Result<InstanceGuard, GraphError> {
        let mut inner = self.inner.lock();
        if inner.open.contains_key(instance_id) {
            return Err(GraphError::AlreadyOpen {
                instance: instance_id.to_owned(),
            });
        }
        inner.open.insert(instance_id.to_owned(), registered_at);
        Ok(InstanceGuard {
            registry: self.clone(),
            instance_id: instance_id.to_owned(),
        })
    }

    pub fn is_registered(&self, instance_id: &str) -> bool {
        self.inner.lock().open.contains_key(instance_id)
    }

    /// Registration time of an instance, if open.
    pub fn registered_at(&self, instance_id: &str) -> Option<i64> {
        self.inner.lock().open.get(instance_id).copied()
    }

    fn unregister(&self, instance_id: &str) {
        self.inner.lock().open.remove(instance_id);
    }
}

/// Releases the instance id when dropped.
pub struct InstanceGuard {
    registry: InstanceRegistry,
    instance_id: String,
}

impl std::fmt::Debug for InstanceGuard {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InstanceGuard")
            .field("instance_id", &self.instance_id)
            .finish_non_exhaustive()
    }
}

impl InstanceGuard {
    pub fn instance_id(&self) -> &str {
        &self.instance_id
    }
}

impl Drop for InstanceGuard {
    fn drop(&mut self) {
        self.registry.unregister(&self.instance_id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn double_open_fails_fast() {
        let registry = InstanceRegistry::new();
        let _guard = registry.register("graph-a", 1).unwrap();
        match registry.register("graph-a", 2) {
            Err(GraphError::AlreadyOpen { instance }) => assert_eq!(instance, "graph-a"),
            other => panic!("expected AlreadyOpen, got {other:?}"),
        }
    }

    #[test]
    fn dropping_the_guard_releases_the_id() {
        let registry = InstanceRegistry::new();
        {
            let _guard = registry.register("graph-a", 1).unwrap();
            assert!(registry.is_registered("graph-a"));
            assert_eq!(registry.registered_at("graph-a"), Some(1));
        }
        assert!(!registry.is_registered("graph-a"));
        // Reopening after release works.
        registry.register("graph-a", 3).unwrap();
    }
}
