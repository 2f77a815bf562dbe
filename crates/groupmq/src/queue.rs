//! Producer-side queue handle.
//!
//! A [`Queue`] adds jobs and inspects queue state; it never claims work.
//! Processing belongs to [`crate::worker::Worker`], which shares the same
//! [`JobStore`].

use std::sync::Arc;

use serde::Serialize;
use serde_json::Value;
use tokio::sync::broadcast;
use tracing::debug;

use crate::clock::SharedClock;
use crate::config::{GroupMqConfig, QueueSettings, RedisConfig};
use crate::error::{QueueError, QueueResult};
use crate::events::QueueEvent;
use crate::group::{GroupCounts, GroupInfo, GroupStatus, GroupsSnapshot};
use crate::job::{Job, JobState};
use crate::metrics::JobMetrics;
use crate::options::JobOptions;
use crate::redis::{JobPayload, JobStore};

/// Rounds of group deletion performed per [`Queue::delete_group`] call.
/// A huge group may need further calls; each one resumes where the
/// previous left off.
const MAX_GROUP_DELETE_ITER: u32 = 100;

/// Job description for [`Queue::add_bulk`].
#[derive(Debug, Clone)]
pub struct NewJob {
    pub name: String,
    pub data: Value,
    pub opts: JobOptions,
}

impl NewJob {
    pub fn new(name: impl Into<String>, data: Value) -> Self {
        Self {
            name: name.into(),
            data,
            opts: JobOptions::default(),
        }
    }

    pub fn with_opts(mut self, opts: JobOptions) -> Self {
        self.opts = opts;
        self
    }
}

/// Per-state job totals.
///
/// `waiting` covers the wait list and the prioritized set. Jobs parked in
/// group backlogs are not included; see [`Queue::get_groups_jobs_count`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct JobCounts {
    pub waiting: u64,
    pub active: u64,
    pub delayed: u64,
    pub completed: u64,
    pub failed: u64,
    pub waiting_children: u64,
}

impl JobCounts {
    pub fn total(&self) -> u64 {
        self.waiting
            + self.active
            + self.delayed
            + self.completed
            + self.failed
            + self.waiting_children
    }
}

/// Handle for adding and inspecting jobs on one queue.
pub struct Queue {
    store: Arc<JobStore>,
    settings: QueueSettings,
}

impl Queue {
    /// Connects with default settings.
    pub async fn connect(url: &str, queue_name: &str) -> QueueResult<Self> {
        let store = JobStore::connect(url, queue_name).await?;
        Ok(Self::with_store(store))
    }

    /// Connects using a full configuration, with an injectable clock.
    pub async fn connect_with(
        config: &GroupMqConfig,
        queue_name: &str,
        clock: SharedClock,
    ) -> QueueResult<Self> {
        let store = JobStore::connect_with(&config.redis, queue_name, clock).await?;
        Ok(Self::with_store(store).with_settings(config.queue.clone()))
    }

    /// Wraps an existing store. Queues, workers and job handles built over
    /// the same store share one pool, one script table and one emitter.
    pub fn with_store(store: Arc<JobStore>) -> Self {
        Self {
            store,
            settings: QueueSettings::default(),
        }
    }

    pub fn with_settings(mut self, settings: QueueSettings) -> Self {
        self.settings = settings;
        self
    }

    pub fn name(&self) -> &str {
        self.store.queue_name()
    }

    /// The shared store, e.g. for building a worker over the same pool.
    pub fn store(&self) -> &Arc<JobStore> {
        &self.store
    }

    /// Subscribe to lifecycle events observed through this store.
    pub fn subscribe(&self) -> broadcast::Receiver<QueueEvent> {
        self.store.events().subscribe()
    }

    /// Adds one job and returns its handle.
    pub async fn add(&self, name: &str, data: Value, opts: JobOptions) -> QueueResult<Job> {
        let payload = JobPayload::from_parts(name, &data, &opts)?;
        let id = self.store.add_job(&payload).await?;
        JobMetrics::job_added(self.name(), name);
        self.store
            .get_job(&id)
            .await?
            .ok_or(QueueError::JobNotFound(id))
    }

    /// Adds a batch atomically and returns the assigned ids.
    ///
    /// Nothing is added when any entry fails validation or collides with
    /// an existing id.
    pub async fn add_bulk(&self, jobs: &[NewJob]) -> QueueResult<Vec<String>> {
        if jobs.is_empty() {
            return Ok(Vec::new());
        }
        let payloads = jobs
            .iter()
            .map(|job| JobPayload::from_parts(&job.name, &job.data, &job.opts))
            .collect::<QueueResult<Vec<_>>>()?;
        let ids = self.store.add_bulk(&payloads).await?;
        for job in jobs {
            JobMetrics::job_added(self.name(), &job.name);
        }
        Ok(ids)
    }

    pub async fn get_job(&self, job_id: &str) -> QueueResult<Option<Job>> {
        self.store.get_job(job_id).await
    }

    pub async fn get_job_state(&self, job_id: &str) -> QueueResult<JobState> {
        self.store.get_job_state(job_id).await
    }

    /// Moves a delayed job ahead of its due time.
    pub async fn promote(&self, job_id: &str) -> QueueResult<()> {
        self.store.promote_job(job_id).await
    }

    /// Per-state totals across the queue.
    pub async fn get_counts(&self) -> QueueResult<JobCounts> {
        let keys = self.store.keys();
        let mut conn = self.store.conn().await?;
        let (wait, prioritized, active, delayed, completed, failed, waiting_children): (
            u64,
            u64,
            u64,
            u64,
            u64,
            u64,
            u64,
        ) = redis::pipe()
            .llen(keys.wait())
            .zcard(keys.prioritized())
            .llen(keys.active())
            .zcard(keys.delayed())
            .zcard(keys.completed())
            .zcard(keys.failed())
            .zcard(keys.waiting_children())
            .query_async(&mut *conn)
            .await?;
        Ok(JobCounts {
            waiting: wait + prioritized,
            active,
            delayed,
            completed,
            failed,
            waiting_children,
        })
    }

    /// Pauses a group: its queued jobs stop being claimable until resumed.
    /// Returns false when the group was already paused.
    pub async fn pause_group(&self, group_id: &str) -> QueueResult<bool> {
        self.store.pause_group(group_id).await
    }

    /// Resumes a paused group. Returns false when the group was not paused.
    pub async fn resume_group(&self, group_id: &str) -> QueueResult<bool> {
        self.store.resume_group(group_id).await
    }

    /// Group ids per status partition, each sliced to `[start, end]`.
    pub async fn get_groups(&self, start: i64, end: i64) -> QueueResult<GroupsSnapshot> {
        self.store.get_groups(start, end).await
    }

    /// Number of groups in each status partition.
    pub async fn get_groups_count(&self) -> QueueResult<GroupCounts> {
        let keys = self.store.keys();
        let mut conn = self.store.conn().await?;
        let (waiting, limited, maxed, paused): (u64, u64, u64, u64) = redis::pipe()
            .zcard(keys.groups())
            .zcard(keys.groups_limit())
            .zcard(keys.groups_max())
            .zcard(keys.groups_paused())
            .query_async(&mut *conn)
            .await?;
        Ok(GroupCounts {
            waiting,
            limited,
            maxed,
            paused,
        })
    }

    /// Groups in one status partition with their queued-job counts.
    pub async fn get_groups_by_status(
        &self,
        status: GroupStatus,
        start: i64,
        end: i64,
    ) -> QueueResult<Vec<GroupInfo>> {
        self.store.get_groups_by_status(status, start, end).await
    }

    /// Current status of one group, `None` when the group holds no queued
    /// jobs and carries no flag.
    pub async fn get_group_status(&self, group_id: &str) -> QueueResult<Option<GroupStatus>> {
        let keys = self.store.keys();
        let mut conn = self.store.conn().await?;
        let (waiting, limited, maxed, paused): (
            Option<f64>,
            Option<f64>,
            Option<f64>,
            Option<f64>,
        ) = redis::pipe()
            .zscore(keys.groups(), group_id)
            .zscore(keys.groups_limit(), group_id)
            .zscore(keys.groups_max(), group_id)
            .zscore(keys.groups_paused(), group_id)
            .query_async(&mut *conn)
            .await?;

        Ok(if paused.is_some() {
            Some(GroupStatus::Paused)
        } else if limited.is_some() {
            Some(GroupStatus::Limited)
        } else if maxed.is_some() {
            Some(GroupStatus::Maxed)
        } else if waiting.is_some() {
            Some(GroupStatus::Waiting)
        } else {
            None
        })
    }

    /// Queued jobs of one group in claim order: the representative first,
    /// then the backlog. `end` of -1 means the rest of the group.
    pub async fn get_group_jobs(
        &self,
        group_id: &str,
        start: i64,
        end: i64,
    ) -> QueueResult<Vec<Job>> {
        if end < -1 {
            return Err(QueueError::Validation(
                "end must be greater than -1".to_string(),
            ));
        }
        let start = start.max(0);
        self.store.get_group_jobs(group_id, start, end).await
    }

    /// Number of queued jobs in one group.
    pub async fn get_group_jobs_count(&self, group_id: &str) -> QueueResult<u64> {
        self.store.get_group_jobs_count(group_id).await
    }

    /// Total queued jobs across every group, paging over `page_size`
    /// groups at a time.
    pub async fn get_groups_jobs_count(&self, page_size: u32) -> QueueResult<u64> {
        let page_size = i64::from(page_size.max(1));
        let mut total = 0u64;
        let mut start = 0i64;
        loop {
            let (count, next) = self
                .store
                .get_groups_jobs_count_page(start, page_size)
                .await?;
            total += count;
            if next < 0 {
                return Ok(total);
            }
            start = next;
        }
    }

    /// Removes a group and its queued jobs.
    ///
    /// Deletion runs in batches; on very large groups this call may leave
    /// a remainder behind, and calling it again resumes the work. Active
    /// jobs keep running and clean themselves up when they finish.
    pub async fn delete_group(&self, group_id: &str) -> QueueResult<()> {
        let mut cursor = String::new();
        for _ in 0..MAX_GROUP_DELETE_ITER {
            cursor = self
                .store
                .delete_group_batch(group_id, &cursor, self.settings.group_delete_batch)
                .await?;
            if cursor.is_empty() {
                debug!(group = %group_id, "Deleted group");
                return Ok(());
            }
        }
        debug!(group = %group_id, "Group deletion budget spent, remainder left");
        Ok(())
    }

    /// Removes every group and their queued jobs.
    pub async fn delete_groups(&self) -> QueueResult<()> {
        let snapshot = self.store.get_groups(0, -1).await?;
        for group_id in snapshot
            .waiting
            .iter()
            .chain(&snapshot.limited)
            .chain(&snapshot.maxed)
            .chain(&snapshot.paused)
        {
            self.delete_group(group_id).await?;
        }
        Ok(())
    }

    /// Wipes the queue: jobs in every state, groups, counters and events.
    ///
    /// Fails with [`QueueError::ActiveJobsPresent`] when jobs are being
    /// processed, unless `force` is set.
    pub async fn obliterate(&self, force: bool) -> QueueResult<()> {
        loop {
            if self
                .store
                .obliterate_step(self.settings.obliterate_batch, force)
                .await?
            {
                debug!(queue = %self.name(), "Queue obliterated");
                return Ok(());
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_job_counts_total() {
        let counts = JobCounts {
            waiting: 3,
            active: 2,
            delayed: 1,
            completed: 10,
            failed: 1,
            waiting_children: 1,
        };
        assert_eq!(counts.total(), 18);
    }

    #[test]
    fn test_new_job_defaults() {
        let job = NewJob::new("resize", serde_json::json!({"width": 128}));
        assert_eq!(job.name, "resize");
        assert_eq!(job.opts.attempts, 1);

        let job = job.with_opts(JobOptions::default().in_group("tenant-1"));
        assert_eq!(job.opts.group.as_ref().map(|g| g.id.as_str()), Some("tenant-1"));
    }
}
