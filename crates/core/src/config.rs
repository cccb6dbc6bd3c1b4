use std::sync::atomic::{AtomicI64, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};

use crate::error::ConfigError;

/// Process/global configuration of a graph instance.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct GraphConfig {
    /// Identifies this graph instance within the process registry. Opening a
    /// second instance with the same id fails.
    pub unique_instance_id: String,
    /// Permit transactions to pick vertex ids explicitly instead of having
    /// the assigner hand them out.
    pub allow_setting_vertex_id: bool,
    /// Write transaction-log records around every commit.
    pub log_transactions: bool,
    /// How many ids the assigner reserves per counter refill.
    pub id_block_size: u64,
}

impl Default for GraphConfig {
    fn default() -> Self {
        Self {
            unique_instance_id: "quiver".to_owned(),
            allow_setting_vertex_id: false,
            log_transactions: false,
            id_block_size: 10_000,
        }
    }
}

impl GraphConfig {
    pub fn from_toml_str(raw: &str) -> Result<Self, ConfigError> {
        let config: Self = toml::from_str(raw)?;
        if config.unique_instance_id.is_empty() {
            return Err(ConfigError::MissingInstanceId);
        }
        Ok(config)
    }
}

/// Per-transaction configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TxConfig {
    /// Claim optimistic locks for LOCK-consistency types and indexes.
    pub acquire_locks: bool,
    /// Bulk-loading mode: skips consistency machinery. Incompatible with
    /// schema mutations.
    pub batch_loading: bool,
    /// Assign permanent ids when relations are created rather than at commit.
    pub assign_ids_immediately: bool,
    /// Commit timestamp in provider units; stamped at commit when absent.
    pub commit_time: Option<i64>,
    /// When set, a trigger-log record is appended to the log of this name on
    /// every successful storage commit.
    pub log_identifier: Option<String>,
}

impl Default for TxConfig {
    fn default() -> Self {
        Self {
            acquire_locks: true,
            batch_loading: false,
            assign_ids_immediately: false,
            commit_time: None,
            log_identifier: None,
        }
    }
}

impl TxConfig {
    pub fn has_commit_time(&self) -> bool {
        self.commit_time.is_some()
    }
}

/// Source of commit timestamps. Implementations must be monotonic per
/// process; the engine does not order timestamps across processes.
pub trait TimestampProvider: Send + Sync {
    /// Current time in the provider's units (the reference implementation
    /// uses microseconds since the Unix epoch).
    fn time(&self) -> i64;
}

/// Wall-clock provider, forced monotonic across threads.
#[derive(Debug, Default)]
pub struct SystemClock {
    last: AtomicI64,
}

impl TimestampProvider for SystemClock {
    fn time(&self) -> i64 {
        let now = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_micros() as i64)
            .unwrap_or(0);
        // Clamp to strictly-increasing so two commits never share a stamp
        // even if the wall clock steps backwards.
        self.last
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |last| {
                Some(now.max(last + 1))
            })
            .map(|last| now.max(last + 1))
            .unwrap_or(now)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn config_defaults() {
        let config = GraphConfig::default();
        assert!(!config.log_transactions);
        assert!(config.id_block_size > 0);

        let tx = TxConfig::default();
        assert!(tx.acquire_locks);
        assert!(!tx.has_commit_time());
    }

    #[test]
    fn config_parses_from_toml() {
        let config = GraphConfig::from_toml_str(
            r#"
            unique_instance_id = "graph-a"
            log_transactions = true
            "#,
        )
        .unwrap();
        assert_eq!(config.unique_instance_id, "graph-a");
        assert!(config.log_transactions);
        // Unset fields fall back to defaults.
        assert_eq!(config.id_block_size, GraphConfig::default().id_block_size);
    }

    #[test]
    fn empty_instance_id_is_rejected() {
        let err = GraphConfig::from_toml_str(r#"unique_instance_id = """#).unwrap_err();
        assert!(matches!(err, ConfigError::MissingInstanceId));
    }

    #[test]
    fn system_clock_is_monotonic() {
        let clock = SystemClock::default();
        let mut last = clock.time();
        for _ in 0..1000 {
            let next = clock.time();
            assert!(next > last);
            last = next;
        }
    }
}
