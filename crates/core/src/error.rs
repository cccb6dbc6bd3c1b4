use bytes::Bytes;
use quiver_txlog::LogError;
use thiserror::Error;

use crate::db::VertexId;

/// Failures of the primary key-column-value store, including lock
/// acquisition. These are the only failures that roll the transaction back.
#[derive(Debug, Error)]
pub enum StorageError {
    #[error("store `{store}` operation failed")]
    Backend {
        store: String,
        #[source]
        source: anyhow::Error,
    },
    #[error("lock contention on ({key:?}, {column:?}) in store `{store}`")]
    LockContention { store: String, key: Bytes, column: Bytes },
    #[error("expected value mismatch on ({key:?}, {column:?}) in store `{store}`")]
    ExpectationFailed { store: String, key: Bytes, column: Bytes },
    #[error("operation not supported by backend: {0}")]
    Unsupported(&'static str),
}

/// Failures of secondary (mixed) index backends. The primary store is
/// already durable when these surface, so they never roll back.
#[derive(Debug, Error)]
pub enum IndexError {
    #[error("index backend `{index}` mutation failed")]
    Backend {
        index: String,
        #[source]
        source: anyhow::Error,
    },
    #[error("no index backend named `{0}` is configured")]
    UnknownBackend(String),
}

/// Illegal-argument / illegal-state conditions detected before any
/// persistence call.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum InvariantViolation {
    #[error("vertex id {0} is not positive; ids must be assigned before commit")]
    NonPositiveVertexId(VertexId),
    #[error("relation has no assigned id at emission time")]
    RelationIdUnassigned,
    #[error("schema mutations require acquire_locks")]
    SchemaWithoutLocks,
    #[error("schema mutations cannot run with batch loading enabled")]
    SchemaWithBatchLoading,
    #[error("explicit vertex ids are disabled by configuration")]
    SettingVertexIdDisallowed,
    #[error("id assigner is closed")]
    IdAssignerClosed,
}

/// Configuration parse/validation failures.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to parse configuration")]
    Toml(#[from] toml::de::Error),
    #[error("unique_instance_id must not be empty")]
    MissingInstanceId,
}

/// The single user-visible commit failure. Which variant is inside decides
/// whether the transaction was rolled back (`requires_rollback`).
#[derive(Debug, Error)]
pub enum CommitError {
    #[error("storage commit failed")]
    Storage(#[from] StorageError),
    #[error("index commit failed for {}", failed_index_names(.failures))]
    Index { failures: Vec<(String, IndexError)> },
    #[error("transaction log append failed")]
    Log(#[from] LogError),
    #[error(transparent)]
    Invariant(#[from] InvariantViolation),
    /// A trailer append failed after the commit itself had already failed.
    /// Both causes are preserved: the trailer error here, the commit error
    /// as the source.
    #[error("transaction log trailer append failed ({trailer}) after commit failure")]
    TrailerAfterFailure {
        trailer: LogError,
        #[source]
        source: Box<CommitError>,
    },
}

fn failed_index_names(failures: &[(String, IndexError)]) -> String {
    failures
        .iter()
        .map(|(name, _)| name.as_str())
        .collect::<Vec<_>>()
        .join(", ")
}

impl CommitError {
    /// Only storage-class failures (and pre-persistence invariant failures)
    /// roll the transaction back; index and post-storage log failures leave
    /// the durable primary state in place.
    pub fn requires_rollback(&self) -> bool {
        match self {
            CommitError::Storage(_) | CommitError::Invariant(_) => true,
            CommitError::Index { .. } | CommitError::Log(_) => false,
            CommitError::TrailerAfterFailure { source, .. } => source.requires_rollback(),
        }
    }
}

/// Top-level error for the engine's public surface.
#[derive(Debug, Error)]
pub enum GraphError {
    #[error("CommitError: {0}")]
    Commit(#[from] CommitError),
    #[error("StorageError: {0}")]
    Storage(#[from] StorageError),
    #[error("InvariantViolation: {0}")]
    Invariant(#[from] InvariantViolation),
    #[error("ConfigError: {0}")]
    Config(#[from] ConfigError),
    #[error(
        "a graph with unique instance id `{instance}` is already open in this process; \
         shut it down (or force-close the stale registration) first"
    )]
    AlreadyOpen { instance: String },
    #[error("graph has been shut down")]
    Closed,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rollback_policy_follows_error_kind() {
        let storage = CommitError::Storage(StorageError::Unsupported("scan"));
        assert!(storage.requires_rollback());

        let index = CommitError::Index {
            failures: vec![(
                "idx_text".into(),
                IndexError::Backend {
                    index: "idx_text".into(),
                    source: anyhow::anyhow!("boom"),
                },
            )],
        };
        assert!(!index.requires_rollback());

        let chained = CommitError::TrailerAfterFailure {
            trailer: LogError::Closed { log: "tx".into() },
            source: Box::new(storage),
        };
        assert!(chained.requires_rollback());
    }

    #[test]
    fn chained_trailer_error_preserves_both_causes() {
        use std::error::Error as _;
        let err = CommitError::TrailerAfterFailure {
            trailer: LogError::Closed { log: "tx".into() },
            source: Box::new(CommitError::Storage(StorageError::Unsupported("x"))),
        };
        assert!(err.to_string().contains("trailer append failed"));
        assert!(err.source().is_some());
    }
}
