//! Tunables for the launcher and the apply workers.

use crate::error::{ApplyError, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Test-only knob controlling how streamed transactions reach parallel appliers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StreamingDebugMode {
    /// Send changes to parallel appliers through their queues.
    #[default]
    Buffered,
    /// Never use the queues; every streamed change goes to the spool.
    Immediate,
}

/// Engine-wide configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ApplyConfig {
    /// Process-wide ceiling on worker slots.
    pub max_logical_replication_workers: usize,
    /// Concurrent tablesync workers per subscription.
    pub max_sync_workers_per_subscription: usize,
    /// Parallel appliers per subscription; half of it is kept pooled.
    pub max_parallel_apply_workers_per_subscription: usize,
    /// Backoff between worker relaunches.
    pub wal_retrieve_retry_interval_ms: u64,
    /// Upstream liveness deadline, 0 disables it.
    pub wal_receiver_timeout_ms: u64,
    /// Unsolicited feedback period.
    pub wal_receiver_status_interval_ms: u64,
    /// Launcher idle cycle.
    pub default_nap_time_ms: u64,
    /// Forces the spool path for streamed transactions.
    pub debug_logical_replication_streaming: StreamingDebugMode,
    /// Parent directory of the per-worker spool filesets.
    pub spool_dir: PathBuf,
    /// Capacity of each parallel applier's data queue.
    pub queue_size_bytes: usize,
    /// Capacity of each parallel applier's error queue.
    pub error_queue_size_bytes: usize,
    /// Overall timeout of a non-blocking send to a parallel applier.
    pub send_timeout_ms: u64,
    /// Wait between send retries.
    pub send_retry_interval_ms: u64,
    /// A launched worker that has not attached within this is reclaimed.
    pub worker_attach_timeout_ms: u64,
}

impl Default for ApplyConfig {
    fn default() -> Self {
        Self {
            max_logical_replication_workers: 4,
            max_sync_workers_per_subscription: 2,
            max_parallel_apply_workers_per_subscription: 2,
            wal_retrieve_retry_interval_ms: 5000,
            wal_receiver_timeout_ms: 60_000,
            wal_receiver_status_interval_ms: 10_000,
            default_nap_time_ms: 180_000,
            debug_logical_replication_streaming: StreamingDebugMode::Buffered,
            spool_dir: std::env::temp_dir().join("logrep-spool"),
            queue_size_bytes: 16 * 1024 * 1024,
            error_queue_size_bytes: 16 * 1024,
            send_timeout_ms: 10_000,
            send_retry_interval_ms: 1000,
            worker_attach_timeout_ms: 10_000,
        }
    }
}

impl ApplyConfig {
    /// Loads a configuration from a `.toml` or `.json` file.
    pub fn from_file(path: &Path) -> anyhow::Result<Self> {
        let contents = std::fs::read_to_string(path)?;
        let ext = path
            .extension()
            .and_then(|e| e.to_str())
            .unwrap_or_default();

        let config: ApplyConfig = match ext.to_lowercase().as_str() {
            "toml" => toml::from_str(&contents)?,
            "json" => serde_json::from_str(&contents)?,
            _ => anyhow::bail!("Unsupported config file extension: {}", ext),
        };
        config.validate()?;
        Ok(config)
    }

    /// Rejects settings the workers cannot run with.
    pub fn validate(&self) -> Result<()> {
        let invalid = |msg: &str| {
            Err(ApplyError::InvalidConfig {
                msg: msg.to_string(),
            })
        };
        if self.max_logical_replication_workers == 0 {
            return invalid("max_logical_replication_workers must be at least 1");
        }
        if self.queue_size_bytes == 0 || self.error_queue_size_bytes == 0 {
            return invalid("queue sizes must be non-zero");
        }
        if self.wal_retrieve_retry_interval_ms == 0
            || self.wal_receiver_status_interval_ms == 0
            || self.default_nap_time_ms == 0
            || self.worker_attach_timeout_ms == 0
        {
            return invalid("intervals and timeouts must be non-zero");
        }
        if self.send_retry_interval_ms == 0 || self.send_timeout_ms <= self.send_retry_interval_ms {
            return invalid("send_timeout_ms must exceed a non-zero send_retry_interval_ms");
        }
        Ok(())
    }

    /// Half the pool cap: idle parallel appliers beyond this are stopped.
    pub fn parallel_pool_retention(&self) -> usize {
        self.max_parallel_apply_workers_per_subscription / 2
    }

    /// See [`ApplyConfig::wal_retrieve_retry_interval_ms`].
    pub fn retry_interval(&self) -> Duration {
        Duration::from_millis(self.wal_retrieve_retry_interval_ms)
    }

    /// `None` when the receiver timeout is disabled.
    pub fn receiver_timeout(&self) -> Option<Duration> {
        (self.wal_receiver_timeout_ms > 0).then(|| Duration::from_millis(self.wal_receiver_timeout_ms))
    }

    /// See [`ApplyConfig::wal_receiver_status_interval_ms`].
    pub fn status_interval(&self) -> Duration {
        Duration::from_millis(self.wal_receiver_status_interval_ms)
    }

    /// See [`ApplyConfig::default_nap_time_ms`].
    pub fn nap_time(&self) -> Duration {
        Duration::from_millis(self.default_nap_time_ms)
    }

    /// See [`ApplyConfig::send_timeout_ms`].
    pub fn send_timeout(&self) -> Duration {
        Duration::from_millis(self.send_timeout_ms)
    }

    /// See [`ApplyConfig::send_retry_interval_ms`].
    pub fn send_retry_interval(&self) -> Duration {
        Duration::from_millis(self.send_retry_interval_ms)
    }

    /// See [`ApplyConfig::worker_attach_timeout_ms`].
    pub fn attach_timeout(&self) -> Duration {
        Duration::from_millis(self.worker_attach_timeout_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    #[test]
    fn test_defaults_are_valid() {
        let cfg = ApplyConfig::default();
        assert!(cfg.validate().is_ok());
        assert_eq!(cfg.queue_size_bytes, 16 * 1024 * 1024);
        assert_eq!(cfg.parallel_pool_retention(), 1);
        assert_eq!(cfg.nap_time(), Duration::from_secs(180));
    }

    #[test]
    fn test_validate_rejects_short_send_timeout() {
        let cfg = ApplyConfig {
            send_timeout_ms: 1000,
            send_retry_interval_ms: 1000,
            ..Default::default()
        };
        assert!(matches!(cfg.validate(), Err(ApplyError::InvalidConfig { .. })));
    }

    #[test]
    fn test_validate_rejects_zero_workers() {
        let cfg = ApplyConfig {
            max_logical_replication_workers: 0,
            ..Default::default()
        };
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn test_receiver_timeout_disabled_by_zero() {
        let cfg = ApplyConfig {
            wal_receiver_timeout_ms: 0,
            ..Default::default()
        };
        assert_eq!(cfg.receiver_timeout(), None);
    }

    #[test]
    fn test_from_toml_file() {
        let mut file = NamedTempFile::with_suffix(".toml").unwrap();
        writeln!(
            file,
            "max_parallel_apply_workers_per_subscription = 6\ndebug_logical_replication_streaming = \"immediate\""
        )
        .unwrap();
        let cfg = ApplyConfig::from_file(file.path()).unwrap();
        assert_eq!(cfg.max_parallel_apply_workers_per_subscription, 6);
        assert_eq!(
            cfg.debug_logical_replication_streaming,
            StreamingDebugMode::Immediate
        );
        assert_eq!(cfg.max_sync_workers_per_subscription, 2);
    }

    #[test]
    fn test_from_json_file() {
        let mut file = NamedTempFile::with_suffix(".json").unwrap();
        writeln!(file, r#"{{"send_timeout_ms": 50, "send_retry_interval_ms": 10}}"#).unwrap();
        let cfg = ApplyConfig::from_file(file.path()).unwrap();
        assert_eq!(cfg.send_timeout(), Duration::from_millis(50));
    }

    #[test]
    fn test_unknown_extension() {
        let file = NamedTempFile::with_suffix(".yaml").unwrap();
        assert!(ApplyConfig::from_file(file.path()).is_err());
    }
}
