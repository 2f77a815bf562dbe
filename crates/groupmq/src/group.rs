//! Group identity, status and scheduling policy.
//!
//! A group exists implicitly: the first job carrying a group id creates it,
//! and it persists while any job references it. At any instant a group sits
//! in at most one status partition.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::{QueueError, QueueResult};

/// Scheduling status of a group.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum GroupStatus {
    /// Has a representative job claimable by workers.
    Waiting,
    /// Rate limited until an expiry timestamp.
    Limited,
    /// At its concurrency cap.
    Maxed,
    /// Cooperatively paused.
    Paused,
}

impl GroupStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Waiting => "waiting",
            Self::Limited => "limited",
            Self::Maxed => "maxed",
            Self::Paused => "paused",
        }
    }
}

impl fmt::Display for GroupStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A group id paired with its queued-job count.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GroupInfo {
    pub id: String,
    pub count: u64,
}

/// Page of group ids per status partition.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct GroupsSnapshot {
    pub waiting: Vec<String>,
    pub limited: Vec<String>,
    pub maxed: Vec<String>,
    pub paused: Vec<String>,
}

impl GroupsSnapshot {
    pub fn is_empty(&self) -> bool {
        self.waiting.is_empty()
            && self.limited.is_empty()
            && self.maxed.is_empty()
            && self.paused.is_empty()
    }
}

/// Number of groups per status partition.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct GroupCounts {
    pub waiting: u64,
    pub limited: u64,
    pub maxed: u64,
    pub paused: u64,
}

impl GroupCounts {
    pub fn total(self) -> u64 {
        self.waiting + self.limited + self.maxed + self.paused
    }

    pub fn by_status(self, status: GroupStatus) -> u64 {
        match status {
            GroupStatus::Waiting => self.waiting,
            GroupStatus::Limited => self.limited,
            GroupStatus::Maxed => self.maxed,
            GroupStatus::Paused => self.paused,
        }
    }
}

/// Windowed rate limit: at most `max` activations per `duration_ms` window.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct GroupRateLimit {
    pub max: u32,
    pub duration_ms: u64,
}

/// Group scheduling policy carried by a worker.
///
/// A rate limit and a concurrency cap are exclusive modes: one bounds
/// throughput over time, the other bounds parallelism.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct GroupPolicy {
    /// Default concurrency cap for every group this worker serves.
    /// A per-group cap persisted from job options takes precedence.
    pub concurrency: Option<u32>,

    /// Windowed rate limit applied per group.
    pub rate_limit: Option<GroupRateLimit>,
}

impl GroupPolicy {
    pub fn validate(&self) -> QueueResult<()> {
        if self.concurrency.is_some() && self.rate_limit.is_some() {
            return Err(QueueError::Validation(
                "group rate limit and concurrency cannot be used together".to_string(),
            ));
        }
        if self.concurrency == Some(0) {
            return Err(QueueError::Validation(
                "group concurrency must be at least 1".to_string(),
            ));
        }
        if let Some(limit) = &self.rate_limit {
            if limit.max == 0 || limit.duration_ms == 0 {
                return Err(QueueError::Validation(
                    "group rate limit max and duration must be positive".to_string(),
                ));
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_display() {
        assert_eq!(GroupStatus::Waiting.to_string(), "waiting");
        assert_eq!(GroupStatus::Limited.to_string(), "limited");
        assert_eq!(GroupStatus::Maxed.to_string(), "maxed");
        assert_eq!(GroupStatus::Paused.to_string(), "paused");
    }

    #[test]
    fn test_policy_rejects_limit_and_concurrency_together() {
        let policy = GroupPolicy {
            concurrency: Some(2),
            rate_limit: Some(GroupRateLimit {
                max: 10,
                duration_ms: 1_000,
            }),
        };
        let err = policy.validate().unwrap_err();
        assert!(err.to_string().contains("cannot be used together"));
    }

    #[test]
    fn test_policy_rejects_zero_values() {
        let policy = GroupPolicy {
            concurrency: Some(0),
            rate_limit: None,
        };
        assert!(policy.validate().is_err());

        let policy = GroupPolicy {
            concurrency: None,
            rate_limit: Some(GroupRateLimit {
                max: 0,
                duration_ms: 1_000,
            }),
        };
        assert!(policy.validate().is_err());
    }

    #[test]
    fn test_policy_accepts_either_mode_alone() {
        let caps = GroupPolicy {
            concurrency: Some(4),
            rate_limit: None,
        };
        assert!(caps.validate().is_ok());

        let limited = GroupPolicy {
            concurrency: None,
            rate_limit: Some(GroupRateLimit {
                max: 100,
                duration_ms: 60_000,
            }),
        };
        assert!(limited.validate().is_ok());

        assert!(GroupPolicy::default().validate().is_ok());
    }

    #[test]
    fn test_counts_total_and_by_status() {
        let counts = GroupCounts {
            waiting: 2,
            limited: 1,
            maxed: 0,
            paused: 3,
        };
        assert_eq!(counts.total(), 6);
        assert_eq!(counts.by_status(GroupStatus::Waiting), 2);
        assert_eq!(counts.by_status(GroupStatus::Maxed), 0);
        assert_eq!(counts.by_status(GroupStatus::Paused), 3);
    }
}
