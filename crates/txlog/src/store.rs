use bytes::Bytes;
use parking_lot::Mutex;
use std::sync::Arc;
use thiserror::Error;

/// Error returned by [`LogStore::append`].
#[derive(Debug, Error)]
pub enum LogError {
    #[error("failed to append to log `{log}`")]
    Append {
        log: String,
        #[source]
        source: anyhow::Error,
    },
    #[error("log `{log}` is closed")]
    Closed { log: String },
}

/// An append-only log with at-least-once append semantics.
///
/// Implementations must apply appends in call order per log; duplicates on
/// retry are acceptable, reordering is not.
pub trait LogStore: Send + Sync {
    /// The log's name (used in error reporting and trigger-log routing).
    fn name(&self) -> &str;

    /// Append one entry under `key`.
    fn append(&self, key: Bytes, record: Bytes) -> Result<(), LogError>;
}

/// In-memory [`LogStore`] used by tests and the reference backend.
///
/// Appends can be forced to fail via [`MemoryLog::set_fail_appends`] to
/// exercise the commit engine's log-failure paths.
#[derive(Clone)]
pub struct MemoryLog {
    name: String,
    inner: Arc<Mutex<MemoryLogInner>>,
}

#[derive(Default)]
struct MemoryLogInner {
    entries: Vec<(Bytes, Bytes)>,
    fail_appends: bool,
}

impl MemoryLog {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            inner: Arc::default(),
        }
    }

    /// Snapshot of all appended `(key, record)` entries, in append order.
    pub fn entries(&self) -> Vec<(Bytes, Bytes)> {
        self.inner.lock().entries.clone()
    }

    pub fn len(&self) -> usize {
        self.inner.lock().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// When set, every subsequent append fails.
    pub fn set_fail_appends(&self, fail: bool) {
        self.inner.lock().fail_appends = fail;
    }
}

impl LogStore for MemoryLog {
    fn name(&self) -> &str {
        &self.name
    }

    fn append(&self, key: Bytes, record: Bytes) -> Result<(), LogError> {
        let mut inner = self.inner.lock();
        if inner.fail_appends {
            return Err(LogError::Append {
                log: self.name.clone(),
                source: anyhow::anyhow!("append failure injected"),
            });
        }
        log::trace!("log `{}`: appended {} bytes", self.name, record.len());
        inner.entries.push((key, record));
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn appends_preserve_order() {
        let log = MemoryLog::new("tx");
        for i in 0u8..4 {
            log.append(Bytes::from(vec![i]), Bytes::from(vec![i, i]))
                .unwrap();
        }
        let keys: Vec<u8> = log.entries().iter().map(|(k, _)| k[0]).collect();
        assert_eq!(keys, [0, 1, 2, 3]);
    }

    #[test]
    fn injected_failure_surfaces() {
        let log = MemoryLog::new("tx");
        log.set_fail_appends(true);
        let err = log
            .append(Bytes::from_static(b"k"), Bytes::from_static(b"r"))
            .unwrap_err();
        assert!(matches!(err, LogError::Append { .. }));
        assert!(log.is_empty());
    }
}
