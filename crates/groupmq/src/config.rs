//! Queue and worker configuration.

use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::worker::WorkerOptions;

/// Top-level configuration for a queue deployment.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GroupMqConfig {
    /// Redis connection configuration.
    #[serde(default)]
    pub redis: RedisConfig,

    /// Queue maintenance configuration.
    #[serde(default)]
    pub queue: QueueSettings,

    /// Worker configuration.
    #[serde(default)]
    pub worker: WorkerSettings,
}

impl Default for GroupMqConfig {
    fn default() -> Self {
        Self {
            redis: RedisConfig::default(),
            queue: QueueSettings::default(),
            worker: WorkerSettings::default(),
        }
    }
}

/// Redis connection configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RedisConfig {
    /// Redis URL.
    #[serde(default = "default_redis_url")]
    pub url: String,

    /// Connection pool size.
    #[serde(default = "default_pool_size")]
    pub pool_size: usize,

    /// Connection timeout in seconds.
    #[serde(default = "default_connect_timeout")]
    pub connect_timeout_secs: u64,

    /// Key prefix for all queue keys.
    #[serde(default = "default_key_prefix")]
    pub key_prefix: String,
}

impl Default for RedisConfig {
    fn default() -> Self {
        Self {
            url: default_redis_url(),
            pool_size: default_pool_size(),
            connect_timeout_secs: default_connect_timeout(),
            key_prefix: default_key_prefix(),
        }
    }
}

fn default_redis_url() -> String {
    "redis://127.0.0.1:6379".to_string()
}

fn default_pool_size() -> usize {
    10
}

fn default_connect_timeout() -> u64 {
    5
}

fn default_key_prefix() -> String {
    "groupmq".to_string()
}

/// Queue maintenance configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueueSettings {
    /// Jobs removed per round while deleting a group.
    #[serde(default = "default_group_delete_batch")]
    pub group_delete_batch: u32,

    /// Jobs removed per round while obliterating the queue.
    #[serde(default = "default_obliterate_batch")]
    pub obliterate_batch: u32,
}

impl Default for QueueSettings {
    fn default() -> Self {
        Self {
            group_delete_batch: default_group_delete_batch(),
            obliterate_batch: default_obliterate_batch(),
        }
    }
}

fn default_group_delete_batch() -> u32 {
    100
}

fn default_obliterate_batch() -> u32 {
    1000
}

/// Worker configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerSettings {
    /// Jobs processed concurrently by one worker.
    #[serde(default = "default_concurrency")]
    pub concurrency: usize,

    /// Lock duration in milliseconds.
    #[serde(default = "default_lock_duration")]
    pub lock_duration_ms: u64,

    /// Polling interval in milliseconds when the queue is idle.
    #[serde(default = "default_poll_interval")]
    pub poll_interval_ms: u64,

    /// Interval between stalled-job sweeps in milliseconds.
    #[serde(default = "default_stalled_interval")]
    pub stalled_interval_ms: u64,

    /// Times a job may stall before failing for good.
    #[serde(default = "default_max_stalled_count")]
    pub max_stalled_count: u32,

    /// Shutdown timeout in seconds.
    #[serde(default = "default_shutdown_timeout")]
    pub shutdown_timeout_secs: u64,
}

impl Default for WorkerSettings {
    fn default() -> Self {
        Self {
            concurrency: default_concurrency(),
            lock_duration_ms: default_lock_duration(),
            poll_interval_ms: default_poll_interval(),
            stalled_interval_ms: default_stalled_interval(),
            max_stalled_count: default_max_stalled_count(),
            shutdown_timeout_secs: default_shutdown_timeout(),
        }
    }
}

fn default_concurrency() -> usize {
    1
}

fn default_lock_duration() -> u64 {
    30_000
}

fn default_poll_interval() -> u64 {
    250
}

fn default_stalled_interval() -> u64 {
    30_000
}

fn default_max_stalled_count() -> u32 {
    1
}

fn default_shutdown_timeout() -> u64 {
    30
}

impl WorkerSettings {
    /// Returns lock duration as Duration.
    pub fn lock_duration(&self) -> Duration {
        Duration::from_millis(self.lock_duration_ms)
    }

    /// Returns poll interval as Duration.
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    /// Returns stalled sweep interval as Duration.
    pub fn stalled_interval(&self) -> Duration {
        Duration::from_millis(self.stalled_interval_ms)
    }

    /// Returns shutdown timeout as Duration.
    pub fn shutdown_timeout(&self) -> Duration {
        Duration::from_secs(self.shutdown_timeout_secs)
    }
}

impl From<&WorkerSettings> for WorkerOptions {
    fn from(settings: &WorkerSettings) -> Self {
        WorkerOptions {
            concurrency: settings.concurrency,
            lock_duration_ms: settings.lock_duration_ms,
            poll_interval_ms: settings.poll_interval_ms,
            stalled_interval_ms: settings.stalled_interval_ms,
            max_stalled_count: settings.max_stalled_count,
            shutdown_timeout_ms: settings.shutdown_timeout_secs * 1000,
            ..WorkerOptions::default()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_fill_missing_fields() {
        let config: GroupMqConfig = serde_json::from_str(r#"{"redis": {"pool_size": 4}}"#)
            .expect("config parses");
        assert_eq!(config.redis.pool_size, 4);
        assert_eq!(config.redis.url, "redis://127.0.0.1:6379");
        assert_eq!(config.redis.key_prefix, "groupmq");
        assert_eq!(config.queue.group_delete_batch, 100);
        assert_eq!(config.worker.max_stalled_count, 1);
    }

    #[test]
    fn test_worker_settings_convert_to_options() {
        let settings = WorkerSettings {
            concurrency: 8,
            shutdown_timeout_secs: 5,
            ..WorkerSettings::default()
        };
        let options = WorkerOptions::from(&settings);
        assert_eq!(options.concurrency, 8);
        assert_eq!(options.shutdown_timeout_ms, 5000);
        assert_eq!(options.lock_duration_ms, 30_000);
    }
}
