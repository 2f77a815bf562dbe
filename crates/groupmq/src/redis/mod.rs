//! Redis-backed job store.
//!
//! All state transitions execute server-side through the scripts in
//! [`scripts`]; this module owns the connection pool, the key schema and
//! the typed wrappers that drive those scripts. [`JobStore`] is shared by
//! queues, workers and job handles so every surface goes through the same
//! atomic operations.

pub(crate) mod scripts;

use std::collections::HashMap;
use std::sync::Arc;

use deadpool_redis::{Config, Pool, Runtime};
use redis::AsyncCommands;
use serde_json::Value;
use tracing::{debug, info};

use crate::clock::{SharedClock, SystemClock};
use crate::config::RedisConfig;
use crate::error::{QueueError, QueueResult};
use crate::events::{EventEmitter, QueueEvent};
use crate::group::{GroupInfo, GroupRateLimit, GroupStatus, GroupsSnapshot};
use crate::job::{Job, JobState};
use crate::options::JobOptions;
use scripts::Scripts;

/// Create a Redis connection pool.
pub async fn create_pool(config: &RedisConfig) -> QueueResult<Pool> {
    info!("Creating Redis connection pool...");

    let cfg = Config::from_url(&config.url);

    let pool = cfg
        .builder()
        .map_err(|e| QueueError::Configuration(format!("Invalid Redis config: {}", e)))?
        .max_size(config.pool_size)
        .runtime(Runtime::Tokio1)
        .build()
        .map_err(|e| QueueError::Configuration(format!("Failed to create pool: {}", e)))?;

    // Test connection
    let mut conn = pool.get().await?;
    redis::cmd("PING")
        .query_async::<String>(&mut *conn)
        .await?;

    info!("Redis connection pool created");

    Ok(pool)
}

/// Redis key builder for one queue.
///
/// Every key lives under `<prefix>:<queue>:`. Per-job keys append the job
/// id; per-group backlogs live under `group:<gid>` to keep group names from
/// colliding with the fixed bookkeeping keys.
#[derive(Debug, Clone)]
pub struct RedisKeys {
    prefix: String,
}

impl RedisKeys {
    pub fn new(prefix: impl Into<String>, queue: &str) -> Self {
        Self {
            prefix: format!("{}:{}:", prefix.into(), queue),
        }
    }

    /// Shared prefix, passed to every script for derived keys.
    pub fn prefix(&self) -> &str {
        &self.prefix
    }

    /// Job hash.
    pub fn job(&self, job_id: &str) -> String {
        format!("{}{}", self.prefix, job_id)
    }

    /// Lock key guarding an active job.
    pub fn lock(&self, job_id: &str) -> String {
        format!("{}{}:lock", self.prefix, job_id)
    }

    /// Pending children of a parent job (set of child ids).
    pub fn deps(&self, job_id: &str) -> String {
        format!("{}{}:deps", self.prefix, job_id)
    }

    /// Results of finished children (hash: child id -> return value).
    pub fn processed(&self, job_id: &str) -> String {
        format!("{}{}:processed", self.prefix, job_id)
    }

    /// Backlog of queued jobs for one group (sorted set by order score).
    pub fn group_backlog(&self, group_id: &str) -> String {
        format!("{}group:{}", self.prefix, group_id)
    }

    /// Claimable jobs (list; representatives and ungrouped jobs).
    pub fn wait(&self) -> String {
        self.fixed("wait")
    }

    /// Jobs currently held by workers (list).
    pub fn active(&self) -> String {
        self.fixed("active")
    }

    /// Ungrouped jobs with a non-default priority (sorted set).
    pub fn prioritized(&self) -> String {
        self.fixed("prioritized")
    }

    /// Jobs waiting for a due time (sorted set by packed score).
    pub fn delayed(&self) -> String {
        self.fixed("delayed")
    }

    pub fn completed(&self) -> String {
        self.fixed("completed")
    }

    pub fn failed(&self) -> String {
        self.fixed("failed")
    }

    /// Parents waiting for their children (sorted set).
    pub fn waiting_children(&self) -> String {
        self.fixed("waiting-children")
    }

    /// Groups with a representative in the wait list (sorted set).
    pub fn groups(&self) -> String {
        self.fixed("groups")
    }

    /// Rate limited groups (sorted set by limit expiry).
    pub fn groups_limit(&self) -> String {
        self.fixed("groups:limit")
    }

    /// Groups at their concurrency cap (sorted set).
    pub fn groups_max(&self) -> String {
        self.fixed("groups:max")
    }

    /// Paused groups (sorted set).
    pub fn groups_paused(&self) -> String {
        self.fixed("groups:paused")
    }

    /// Running jobs per group (hash: gid -> count).
    pub fn groups_active(&self) -> String {
        self.fixed("groups:active")
    }

    /// Persisted concurrency caps (hash: gid -> cap).
    pub fn groups_concurrency(&self) -> String {
        self.fixed("groups:concurrency")
    }

    /// Current representative per group (hash: gid -> job id).
    pub fn groups_rep(&self) -> String {
        self.fixed("groups:rep")
    }

    /// Rate window accounting (hash: gid -> "count:window_start").
    pub fn groups_rate(&self) -> String {
        self.fixed("groups:rate")
    }

    /// Event stream.
    pub fn events(&self) -> String {
        self.fixed("events")
    }

    /// Generated job id counter.
    pub fn id_counter(&self) -> String {
        self.fixed("id")
    }

    /// Ordering sequence counter.
    pub fn seq_counter(&self) -> String {
        self.fixed("pc")
    }

    /// Queue metadata hash.
    pub fn meta(&self) -> String {
        self.fixed("meta")
    }

    fn fixed(&self, name: &str) -> String {
        format!("{}{}", self.prefix, name)
    }

    /// The full key set handed to every script, in the order the scripts
    /// expect their KEYS table.
    pub(crate) fn canonical(&self) -> [String; 19] {
        [
            self.wait(),
            self.active(),
            self.prioritized(),
            self.delayed(),
            self.completed(),
            self.failed(),
            self.waiting_children(),
            self.groups(),
            self.groups_limit(),
            self.groups_max(),
            self.groups_paused(),
            self.groups_active(),
            self.groups_concurrency(),
            self.groups_rep(),
            self.groups_rate(),
            self.events(),
            self.id_counter(),
            self.seq_counter(),
            self.meta(),
        ]
    }
}

impl Default for RedisKeys {
    fn default() -> Self {
        Self::new("groupmq", "default")
    }
}

/// Terminal collection a finished job lands in.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum FinishTarget {
    Completed,
    Failed,
}

impl FinishTarget {
    pub(crate) fn as_str(self) -> &'static str {
        match self {
            Self::Completed => "completed",
            Self::Failed => "failed",
        }
    }
}

/// Wire-level arguments for adding one job.
pub(crate) struct JobPayload {
    pub name: String,
    pub data_json: String,
    pub opts_json: String,
    pub custom_id: Option<String>,
    pub delay: u64,
    pub priority: u32,
    pub group_id: Option<String>,
    pub group_concurrency: Option<u32>,
    pub lifo: bool,
    pub parent_id: Option<String>,
    pub fail_parent_on_failure: bool,
    pub keep_failed_count: i64,
    pub keep_failed_age_secs: Option<u64>,
}

impl JobPayload {
    pub(crate) fn from_parts(name: &str, data: &Value, opts: &JobOptions) -> QueueResult<Self> {
        opts.validate()?;
        Ok(Self {
            name: name.to_string(),
            data_json: serde_json::to_string(data)?,
            opts_json: serde_json::to_string(opts)?,
            custom_id: opts.job_id.clone(),
            delay: opts.delay,
            priority: opts.priority,
            group_id: opts.group.as_ref().map(|g| g.id.clone()),
            group_concurrency: opts.group.as_ref().and_then(|g| g.concurrency),
            lifo: opts.lifo,
            parent_id: opts.parent.as_ref().map(|p| p.id.clone()),
            fail_parent_on_failure: opts.fail_parent_on_failure,
            keep_failed_count: opts.remove_on_fail.keep_count(),
            keep_failed_age_secs: opts.remove_on_fail.max_age_secs(),
        })
    }

    fn push_args(&self, call: &mut redis::ScriptInvocation<'_>) {
        call.arg(self.custom_id.as_deref().unwrap_or(""))
            .arg(&self.name)
            .arg(&self.data_json)
            .arg(&self.opts_json)
            .arg(self.delay)
            .arg(self.priority)
            .arg(self.group_id.as_deref().unwrap_or(""))
            .arg(
                self.group_concurrency
                    .map(|c| c.to_string())
                    .unwrap_or_default(),
            )
            .arg(if self.lifo { 1 } else { 0 })
            .arg(self.parent_id.as_deref().unwrap_or(""))
            .arg(if self.fail_parent_on_failure { 1 } else { 0 })
            .arg(self.keep_failed_count)
            .arg(
                self.keep_failed_age_secs
                    .map(|a| a.to_string())
                    .unwrap_or_default(),
            );
    }
}

/// Claim parameters a worker hands to [`JobStore::claim_next`].
#[derive(Debug, Clone)]
pub(crate) struct ClaimOptions {
    pub lock_duration_ms: u64,
    pub default_concurrency: Option<u32>,
    pub rate: Option<GroupRateLimit>,
    pub promote_batch: u32,
}

/// Shared handle over one queue's Redis state.
pub struct JobStore {
    pool: Pool,
    keys: RedisKeys,
    scripts: Scripts,
    clock: SharedClock,
    events: EventEmitter,
    queue_name: String,
}

impl JobStore {
    /// Connects with defaults: `groupmq` key prefix and the system clock.
    pub async fn connect(url: &str, queue_name: &str) -> QueueResult<Arc<Self>> {
        let config = RedisConfig {
            url: url.to_string(),
            ..RedisConfig::default()
        };
        Self::connect_with(&config, queue_name, Arc::new(SystemClock::default())).await
    }

    /// Connects with an explicit config and clock. Tests inject a manual
    /// clock here to drive delayed promotion and rate windows.
    pub async fn connect_with(
        config: &RedisConfig,
        queue_name: &str,
        clock: SharedClock,
    ) -> QueueResult<Arc<Self>> {
        let pool = create_pool(config).await?;
        let store = Self {
            pool,
            keys: RedisKeys::new(config.key_prefix.clone(), queue_name),
            scripts: Scripts::new(),
            clock,
            events: EventEmitter::default(),
            queue_name: queue_name.to_string(),
        };
        store.preload_scripts().await?;

        let mut conn = store.conn().await?;
        let _: () = redis::cmd("HSETNX")
            .arg(store.keys.meta())
            .arg("version")
            .arg(env!("CARGO_PKG_VERSION"))
            .query_async(&mut *conn)
            .await?;

        debug!(queue = %queue_name, "Job store connected");
        Ok(Arc::new(store))
    }

    pub fn queue_name(&self) -> &str {
        &self.queue_name
    }

    pub fn keys(&self) -> &RedisKeys {
        &self.keys
    }

    pub(crate) fn clock(&self) -> &SharedClock {
        &self.clock
    }

    pub(crate) fn events(&self) -> &EventEmitter {
        &self.events
    }

    pub(crate) async fn conn(&self) -> QueueResult<deadpool_redis::Connection> {
        Ok(self.pool.get().await?)
    }

    /// Loads every script up front so later EVALSHA calls never miss.
    async fn preload_scripts(&self) -> QueueResult<()> {
        let mut conn = self.conn().await?;
        for (name, source) in Scripts::sources() {
            let sha: String = redis::cmd("SCRIPT")
                .arg("LOAD")
                .arg(source)
                .query_async(&mut *conn)
                .await?;
            debug!(script = name, sha = %sha, "Loaded script");
        }
        Ok(())
    }

    fn invoke<'a>(&self, script: &'a redis::Script) -> redis::ScriptInvocation<'a> {
        let mut call = script.prepare_invoke();
        for key in self.keys.canonical() {
            call.key(key);
        }
        call
    }

    pub(crate) async fn add_job(&self, payload: &JobPayload) -> QueueResult<String> {
        let mut conn = self.conn().await?;
        let now = self.clock.now_ms();
        let mut call = self.invoke(&self.scripts.add_job);
        call.arg(self.keys.prefix()).arg(now);
        payload.push_args(&mut call);
        let (code, id): (i64, String) = call.invoke_async(&mut *conn).await?;
        if code != 0 {
            return Err(QueueError::from_code(code, "add-job", &id, "waiting"));
        }

        self.events.emit(QueueEvent::Added {
            job_id: id.clone(),
            name: payload.name.clone(),
        });
        if payload.delay > 0 {
            self.events.emit(QueueEvent::Delayed {
                job_id: id.clone(),
                until_ms: now + payload.delay as i64,
            });
        } else {
            self.events.emit(QueueEvent::Waiting { job_id: id.clone() });
        }
        debug!(job_id = %id, name = %payload.name, "Added job");
        Ok(id)
    }

    pub(crate) async fn add_bulk(&self, payloads: &[JobPayload]) -> QueueResult<Vec<String>> {
        let mut conn = self.conn().await?;
        let now = self.clock.now_ms();
        let mut call = self.invoke(&self.scripts.add_bulk);
        call.arg(self.keys.prefix()).arg(now).arg(payloads.len());
        for payload in payloads {
            payload.push_args(&mut call);
        }
        let (code, ids): (i64, Vec<String>) = call.invoke_async(&mut *conn).await?;
        if code != 0 {
            let dup = ids.into_iter().next().unwrap_or_default();
            return Err(QueueError::from_code(code, "add-bulk", &dup, "waiting"));
        }

        for (payload, id) in payloads.iter().zip(&ids) {
            self.events.emit(QueueEvent::Added {
                job_id: id.clone(),
                name: payload.name.clone(),
            });
        }
        debug!(count = ids.len(), "Added jobs in bulk");
        Ok(ids)
    }

    pub(crate) async fn claim_next(
        self: &Arc<Self>,
        token: &str,
        claim: &ClaimOptions,
    ) -> QueueResult<Option<Job>> {
        let mut conn = self.conn().await?;
        let reply: Option<(String, HashMap<String, String>)> = self
            .invoke(&self.scripts.move_to_active)
            .arg(self.keys.prefix())
            .arg(self.clock.now_ms())
            .arg(token)
            .arg(claim.lock_duration_ms)
            .arg(
                claim
                    .default_concurrency
                    .map(|c| c.to_string())
                    .unwrap_or_default(),
            )
            .arg(claim.rate.map(|r| r.max.to_string()).unwrap_or_default())
            .arg(claim.rate.map(|r| r.duration_ms).unwrap_or(0))
            .arg(claim.promote_batch)
            .invoke_async(&mut *conn)
            .await?;

        match reply {
            None => Ok(None),
            Some((id, fields)) => {
                let mut job = Job::from_hash(Arc::clone(self), id, fields)?;
                job.set_token(token.to_string());
                self.events.emit(QueueEvent::Active {
                    job_id: job.id.clone(),
                });
                debug!(job_id = %job.id, group = ?job.group_id, "Claimed job");
                Ok(Some(job))
            }
        }
    }

    #[allow(clippy::too_many_arguments)]
    pub(crate) async fn finish_job(
        &self,
        job_id: &str,
        token: &str,
        target: FinishTarget,
        prop: &str,
        stacktrace: Option<&str>,
        keep_count: i64,
        max_age_secs: Option<u64>,
    ) -> QueueResult<()> {
        let mut conn = self.conn().await?;
        let code: i64 = self
            .invoke(&self.scripts.move_to_finished)
            .arg(self.keys.prefix())
            .arg(self.clock.now_ms())
            .arg(job_id)
            .arg(token)
            .arg(target.as_str())
            .arg(prop)
            .arg(stacktrace.unwrap_or(""))
            .arg(keep_count)
            .arg(max_age_secs.map(|a| a.to_string()).unwrap_or_default())
            .invoke_async(&mut *conn)
            .await?;
        if code != 0 {
            return Err(QueueError::from_code(code, "move-to-finished", job_id, "active"));
        }

        match target {
            FinishTarget::Completed => {
                let return_value = serde_json::from_str(prop).unwrap_or(Value::Null);
                self.events.emit(QueueEvent::Completed {
                    job_id: job_id.to_string(),
                    return_value,
                });
            }
            FinishTarget::Failed => {
                self.events.emit(QueueEvent::Failed {
                    job_id: job_id.to_string(),
                    reason: prop.to_string(),
                });
            }
        }
        debug!(job_id = %job_id, target = target.as_str(), "Finished job");
        Ok(())
    }

    pub(crate) async fn retry_job(
        &self,
        job_id: &str,
        token: &str,
        failed_reason: &str,
        stacktrace: &str,
    ) -> QueueResult<()> {
        let mut conn = self.conn().await?;
        let code: i64 = self
            .invoke(&self.scripts.retry_job)
            .arg(self.keys.prefix())
            .arg(self.clock.now_ms())
            .arg(job_id)
            .arg(token)
            .arg(failed_reason)
            .arg(stacktrace)
            .invoke_async(&mut *conn)
            .await?;
        if code != 0 {
            return Err(QueueError::from_code(code, "retry-job", job_id, "active"));
        }
        self.events.emit(QueueEvent::Waiting {
            job_id: job_id.to_string(),
        });
        Ok(())
    }

    pub(crate) async fn delay_job(
        &self,
        job_id: &str,
        token: &str,
        delay_ms: u64,
        failed_reason: Option<&str>,
        stacktrace: Option<&str>,
    ) -> QueueResult<()> {
        let mut conn = self.conn().await?;
        let now = self.clock.now_ms();
        let code: i64 = self
            .invoke(&self.scripts.move_to_delayed)
            .arg(self.keys.prefix())
            .arg(now)
            .arg(job_id)
            .arg(token)
            .arg(delay_ms)
            .arg(failed_reason.unwrap_or(""))
            .arg(stacktrace.unwrap_or(""))
            .invoke_async(&mut *conn)
            .await?;
        if code != 0 {
            return Err(QueueError::from_code(code, "move-to-delayed", job_id, "active"));
        }
        self.events.emit(QueueEvent::Delayed {
            job_id: job_id.to_string(),
            until_ms: now + delay_ms as i64,
        });
        Ok(())
    }

    /// Returns true when the job moved to waiting-children, false when it
    /// had no pending children and stays active.
    pub(crate) async fn move_to_waiting_children(
        &self,
        job_id: &str,
        token: &str,
    ) -> QueueResult<bool> {
        let mut conn = self.conn().await?;
        let code: i64 = self
            .invoke(&self.scripts.move_to_waiting_children)
            .arg(self.keys.prefix())
            .arg(self.clock.now_ms())
            .arg(job_id)
            .arg(token)
            .invoke_async(&mut *conn)
            .await?;
        match code {
            0 => {
                self.events.emit(QueueEvent::WaitingChildren {
                    job_id: job_id.to_string(),
                });
                Ok(true)
            }
            1 => Ok(false),
            other => Err(QueueError::from_code(
                other,
                "move-to-waiting-children",
                job_id,
                "active",
            )),
        }
    }

    pub(crate) async fn promote_job(&self, job_id: &str) -> QueueResult<()> {
        let mut conn = self.conn().await?;
        let code: i64 = self
            .invoke(&self.scripts.promote)
            .arg(self.keys.prefix())
            .arg(self.clock.now_ms())
            .arg(job_id)
            .invoke_async(&mut *conn)
            .await?;
        if code != 0 {
            return Err(QueueError::from_code(code, "promote", job_id, "delayed"));
        }
        self.events.emit(QueueEvent::Promoted {
            job_id: job_id.to_string(),
        });
        Ok(())
    }

    pub(crate) async fn extend_lock(
        &self,
        job_id: &str,
        token: &str,
        duration_ms: u64,
    ) -> QueueResult<()> {
        let mut conn = self.conn().await?;
        let code: i64 = self
            .invoke(&self.scripts.extend_lock)
            .arg(self.keys.prefix())
            .arg(job_id)
            .arg(token)
            .arg(duration_ms)
            .invoke_async(&mut *conn)
            .await?;
        if code != 0 {
            return Err(QueueError::from_code(code, "extend-lock", job_id, "active"));
        }
        Ok(())
    }

    /// Stores an intermediate or final result without changing state.
    pub(crate) async fn store_result(
        &self,
        job_id: &str,
        token: &str,
        value_json: &str,
    ) -> QueueResult<()> {
        let mut conn = self.conn().await?;
        let code: i64 = self
            .invoke(&self.scripts.store_result)
            .arg(self.keys.prefix())
            .arg(job_id)
            .arg(token)
            .arg(value_json)
            .invoke_async(&mut *conn)
            .await?;
        if code != 0 {
            return Err(QueueError::from_code(code, "store-result", job_id, "active"));
        }
        Ok(())
    }

    pub(crate) async fn get_job(self: &Arc<Self>, job_id: &str) -> QueueResult<Option<Job>> {
        let mut conn = self.conn().await?;
        let fields: HashMap<String, String> = conn.hgetall(self.keys.job(job_id)).await?;
        if fields.is_empty() {
            return Ok(None);
        }
        Ok(Some(Job::from_hash(
            Arc::clone(self),
            job_id.to_string(),
            fields,
        )?))
    }

    pub(crate) async fn get_job_state(&self, job_id: &str) -> QueueResult<JobState> {
        let mut conn = self.conn().await?;
        let state: String = self
            .invoke(&self.scripts.get_state)
            .arg(self.keys.prefix())
            .arg(job_id)
            .invoke_async(&mut *conn)
            .await?;
        Ok(JobState::from(state.as_str()))
    }

    /// Returns true when the group was newly paused.
    pub(crate) async fn pause_group(&self, group_id: &str) -> QueueResult<bool> {
        let code = self.pause_group_inner(group_id, true).await?;
        if code == 0 {
            self.events.emit(QueueEvent::GroupPaused {
                group_id: group_id.to_string(),
            });
        }
        Ok(code == 0)
    }

    /// Returns true when the group was paused and is now resumed.
    pub(crate) async fn resume_group(&self, group_id: &str) -> QueueResult<bool> {
        let code = self.pause_group_inner(group_id, false).await?;
        if code == 0 {
            self.events.emit(QueueEvent::GroupResumed {
                group_id: group_id.to_string(),
            });
        }
        Ok(code == 0)
    }

    async fn pause_group_inner(&self, group_id: &str, pause: bool) -> QueueResult<i64> {
        let mut conn = self.conn().await?;
        let code: i64 = self
            .invoke(&self.scripts.pause_group)
            .arg(self.keys.prefix())
            .arg(self.clock.now_ms())
            .arg(group_id)
            .arg(if pause { 1 } else { 0 })
            .invoke_async(&mut *conn)
            .await?;
        Ok(code)
    }

    /// Manually rate limits a group. A no-op on paused groups, returning
    /// false.
    pub(crate) async fn rate_limit_group(
        &self,
        group_id: &str,
        expire_ms: u64,
    ) -> QueueResult<bool> {
        let mut conn = self.conn().await?;
        let now = self.clock.now_ms();
        let code: i64 = self
            .invoke(&self.scripts.rate_limit_group)
            .arg(self.keys.prefix())
            .arg(now)
            .arg(group_id)
            .arg(expire_ms)
            .invoke_async(&mut *conn)
            .await?;
        if code == 0 {
            self.events.emit(QueueEvent::GroupRateLimited {
                group_id: group_id.to_string(),
                until_ms: now + expire_ms as i64,
            });
        }
        Ok(code == 0)
    }

    pub(crate) async fn get_groups(&self, start: i64, end: i64) -> QueueResult<GroupsSnapshot> {
        let mut conn = self.conn().await?;
        let (waiting, limited, maxed, paused): (Vec<String>, Vec<String>, Vec<String>, Vec<String>) =
            self.invoke(&self.scripts.get_groups)
                .arg(self.keys.prefix())
                .arg(start)
                .arg(end)
                .invoke_async(&mut *conn)
                .await?;
        Ok(GroupsSnapshot {
            waiting,
            limited,
            maxed,
            paused,
        })
    }

    pub(crate) async fn get_groups_by_status(
        &self,
        status: GroupStatus,
        start: i64,
        end: i64,
    ) -> QueueResult<Vec<GroupInfo>> {
        let mut conn = self.conn().await?;
        let pairs: Vec<(String, u64)> = self
            .invoke(&self.scripts.get_groups_by_status)
            .arg(self.keys.prefix())
            .arg(status.as_str())
            .arg(start)
            .arg(end)
            .invoke_async(&mut *conn)
            .await?;
        Ok(pairs
            .into_iter()
            .map(|(id, count)| GroupInfo { id, count })
            .collect())
    }

    pub(crate) async fn get_group_jobs(
        self: &Arc<Self>,
        group_id: &str,
        start: i64,
        end: i64,
    ) -> QueueResult<Vec<Job>> {
        let mut conn = self.conn().await?;
        let ids: Vec<String> = self
            .invoke(&self.scripts.get_group_jobs)
            .arg(self.keys.prefix())
            .arg(group_id)
            .arg(start)
            .arg(end)
            .invoke_async(&mut *conn)
            .await?;
        if ids.is_empty() {
            return Ok(Vec::new());
        }

        let mut pipe = redis::pipe();
        for id in &ids {
            pipe.hgetall(self.keys.job(id));
        }
        let rows: Vec<HashMap<String, String>> = pipe.query_async(&mut *conn).await?;

        let mut jobs = Vec::with_capacity(ids.len());
        for (id, fields) in ids.into_iter().zip(rows) {
            if fields.is_empty() {
                continue;
            }
            jobs.push(Job::from_hash(Arc::clone(self), id, fields)?);
        }
        Ok(jobs)
    }

    pub(crate) async fn get_group_jobs_count(&self, group_id: &str) -> QueueResult<u64> {
        let mut conn = self.conn().await?;
        let count: u64 = self
            .invoke(&self.scripts.get_group_jobs_count)
            .arg(self.keys.prefix())
            .arg(group_id)
            .invoke_async(&mut *conn)
            .await?;
        Ok(count)
    }

    /// One page of the queue-wide grouped-job count. `next_start` is -1
    /// when there are no further pages.
    pub(crate) async fn get_groups_jobs_count_page(
        &self,
        start: i64,
        limit: i64,
    ) -> QueueResult<(u64, i64)> {
        let mut conn = self.conn().await?;
        let page: (u64, i64) = self
            .invoke(&self.scripts.get_groups_jobs_count)
            .arg(self.keys.prefix())
            .arg(start)
            .arg(limit)
            .invoke_async(&mut *conn)
            .await?;
        Ok(page)
    }

    /// Deletes one batch of a group's queued jobs. Returns the cursor for
    /// the next batch, empty when the group is gone.
    pub(crate) async fn delete_group_batch(
        &self,
        group_id: &str,
        cursor: &str,
        batch: u32,
    ) -> QueueResult<String> {
        let mut conn = self.conn().await?;
        let next: String = self
            .invoke(&self.scripts.delete_group)
            .arg(self.keys.prefix())
            .arg(group_id)
            .arg(cursor)
            .arg(batch)
            .invoke_async(&mut *conn)
            .await?;
        Ok(next)
    }

    /// Reclaims active jobs whose lock expired. Returns the ids routed
    /// back for processing and the ids failed for stalling too often.
    pub(crate) async fn stalled_sweep(
        &self,
        max_stalled_count: u32,
    ) -> QueueResult<(Vec<String>, Vec<String>)> {
        let mut conn = self.conn().await?;
        let (stalled, failed): (Vec<String>, Vec<String>) = self
            .invoke(&self.scripts.move_stalled_jobs_to_wait)
            .arg(self.keys.prefix())
            .arg(self.clock.now_ms())
            .arg(max_stalled_count)
            .invoke_async(&mut *conn)
            .await?;

        for job_id in &stalled {
            self.events.emit(QueueEvent::Stalled {
                job_id: job_id.clone(),
            });
        }
        for job_id in &failed {
            self.events.emit(QueueEvent::Failed {
                job_id: job_id.clone(),
                reason: "job stalled more than allowable limit".to_string(),
            });
        }
        Ok((stalled, failed))
    }

    /// Removes one budget's worth of queue data. Returns true when the
    /// queue is fully gone.
    pub(crate) async fn obliterate_step(&self, count: u32, force: bool) -> QueueResult<bool> {
        let mut conn = self.conn().await?;
        let code: i64 = self
            .invoke(&self.scripts.obliterate)
            .arg(self.keys.prefix())
            .arg(count)
            .arg(if force { 1 } else { 0 })
            .invoke_async(&mut *conn)
            .await?;
        match code {
            0 => Ok(true),
            1 => Ok(false),
            other => Err(QueueError::from_code(other, "obliterate", "", "inactive")),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_redis_keys() {
        let keys = RedisKeys::new("test", "mail");

        assert_eq!(keys.wait(), "test:mail:wait");
        assert_eq!(keys.job("123"), "test:mail:123");
        assert_eq!(keys.lock("123"), "test:mail:123:lock");
        assert_eq!(keys.deps("123"), "test:mail:123:deps");
        assert_eq!(keys.group_backlog("tenant-1"), "test:mail:group:tenant-1");
        assert_eq!(keys.groups_limit(), "test:mail:groups:limit");
        assert_eq!(keys.waiting_children(), "test:mail:waiting-children");
    }

    #[test]
    fn test_canonical_key_order_is_stable() {
        let keys = RedisKeys::default();
        let canonical = keys.canonical();

        assert_eq!(canonical.len(), 19);
        assert_eq!(canonical[0], keys.wait());
        assert_eq!(canonical[7], keys.groups());
        assert_eq!(canonical[15], keys.events());
        assert_eq!(canonical[18], keys.meta());
    }

    #[test]
    fn test_group_backlog_cannot_shadow_fixed_keys() {
        let keys = RedisKeys::default();
        // A group named like a partition suffix must not collide.
        assert_ne!(keys.group_backlog("limit"), keys.groups_limit());
        assert_ne!(keys.group_backlog("paused"), keys.groups_paused());
    }
}
