//! Worker: claims jobs, runs a processor over them and settles the result.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use futures::future::BoxFuture;
use futures::stream::BoxStream;
use futures::StreamExt;
use parking_lot::Mutex;
use serde_json::Value;
use tokio::sync::{broadcast, oneshot, Semaphore};
use tokio::time::timeout;
use tracing::{debug, error, info, warn, Instrument};
use uuid::Uuid;

use crate::backoff::CustomBackoff;
use crate::error::{ProcessError, QueueError, QueueResult};
use crate::group::GroupPolicy;
use crate::job::{Job, JobState};
use crate::metrics::{GroupMetrics, JobMetrics, WorkerMetrics};
use crate::redis::{ClaimOptions, JobStore};

/// Delayed jobs and expired rate limits promoted per claim attempt.
const PROMOTE_BATCH: u32 = 256;

/// Processing deadline applied to stream emissions.
#[derive(Debug, Clone)]
pub enum TtlPolicy {
    /// One deadline for every job.
    All(u64),
    /// Deadlines per job name; unlisted names run without one.
    PerName(HashMap<String, u64>),
}

impl TtlPolicy {
    pub(crate) fn resolve(&self, job_name: &str) -> Option<u64> {
        match self {
            Self::All(ms) => Some(*ms),
            Self::PerName(map) => map.get(job_name).copied(),
        }
    }

    fn validate(&self) -> QueueResult<()> {
        let valid = match self {
            Self::All(ms) => *ms > 0,
            Self::PerName(map) => map.values().all(|ms| *ms > 0),
        };
        if !valid {
            return Err(QueueError::Validation(
                "ttl must be a positive integer".to_string(),
            ));
        }
        Ok(())
    }
}

/// Worker configuration.
#[derive(Debug, Clone)]
pub struct WorkerOptions {
    /// Jobs processed concurrently by this worker.
    pub concurrency: usize,

    /// How long a claimed job stays locked without renewal.
    pub lock_duration_ms: u64,

    /// Polling interval while the queue is idle.
    pub poll_interval_ms: u64,

    /// Interval between stalled-job sweeps.
    pub stalled_interval_ms: u64,

    /// Times a job may stall before failing for good.
    pub max_stalled_count: u32,

    /// How long `run` waits for in-flight jobs after a close signal.
    pub shutdown_timeout_ms: u64,

    /// Default concurrency and rate limit applied to groups without a
    /// persisted cap.
    pub group: GroupPolicy,

    /// Optional processing deadline for stream processors.
    pub ttl: Option<TtlPolicy>,
}

impl Default for WorkerOptions {
    fn default() -> Self {
        Self {
            concurrency: 1,
            lock_duration_ms: 30_000,
            poll_interval_ms: 250,
            stalled_interval_ms: 30_000,
            max_stalled_count: 1,
            shutdown_timeout_ms: 30_000,
            group: GroupPolicy::default(),
            ttl: None,
        }
    }
}

fn validate_options(options: &WorkerOptions) -> QueueResult<()> {
    if options.concurrency == 0 {
        return Err(QueueError::Validation(
            "concurrency must be at least 1".to_string(),
        ));
    }
    if options.lock_duration_ms == 0 {
        return Err(QueueError::Validation(
            "lock duration must be positive".to_string(),
        ));
    }
    if options.stalled_interval_ms == 0 {
        return Err(QueueError::Validation(
            "stalled interval must be positive".to_string(),
        ));
    }
    options.group.validate()?;
    if let Some(ttl) = &options.ttl {
        ttl.validate()?;
    }
    Ok(())
}

/// What a processor hands back for a finished job.
pub enum ProcessorOutput {
    /// A single return value recorded at completion.
    Value(Value),
    /// A sequence of results; each emission is persisted as the job's
    /// current result and the last one becomes the return value.
    Stream(BoxStream<'static, Result<Value, ProcessError>>),
}

impl ProcessorOutput {
    pub fn value(value: Value) -> Self {
        Self::Value(value)
    }

    pub fn stream<S>(stream: S) -> Self
    where
        S: futures::Stream<Item = Result<Value, ProcessError>> + Send + 'static,
    {
        Self::Stream(Box::pin(stream))
    }
}

/// User-supplied job logic.
#[async_trait]
pub trait JobProcessor: Send + Sync {
    async fn process(&self, job: &mut Job) -> Result<ProcessorOutput, ProcessError>;
}

type ProcessFn =
    dyn for<'a> Fn(&'a mut Job) -> BoxFuture<'a, Result<ProcessorOutput, ProcessError>>
        + Send
        + Sync;

/// Adapter turning a closure into a [`JobProcessor`].
pub struct FnProcessor {
    f: Box<ProcessFn>,
}

impl FnProcessor {
    pub fn new<F>(f: F) -> Self
    where
        F: for<'a> Fn(&'a mut Job) -> BoxFuture<'a, Result<ProcessorOutput, ProcessError>>
            + Send
            + Sync
            + 'static,
    {
        Self { f: Box::new(f) }
    }
}

#[async_trait]
impl JobProcessor for FnProcessor {
    async fn process(&self, job: &mut Job) -> Result<ProcessorOutput, ProcessError> {
        (self.f)(job).await
    }
}

/// A snapshot of one worker's counters.
#[derive(Debug, Clone)]
pub struct WorkerStats {
    pub id: String,
    pub running: bool,
    pub concurrency: usize,
    pub in_flight: usize,
    pub jobs_processed: u64,
    pub jobs_failed: u64,
}

/// Claims and processes jobs from one queue.
pub struct Worker {
    id: String,
    store: Arc<JobStore>,
    options: WorkerOptions,
    processor: Arc<dyn JobProcessor>,
    custom_backoff: Option<CustomBackoff>,
    shutdown_tx: broadcast::Sender<()>,
    running: Arc<AtomicBool>,
    in_flight: Arc<Mutex<HashSet<String>>>,
    jobs_processed: Arc<AtomicU64>,
    jobs_failed: Arc<AtomicU64>,
}

impl Worker {
    pub fn new(
        store: Arc<JobStore>,
        processor: Arc<dyn JobProcessor>,
        options: WorkerOptions,
    ) -> QueueResult<Self> {
        validate_options(&options)?;
        let (shutdown_tx, _) = broadcast::channel(1);

        Ok(Self {
            id: format!("worker-{}", Uuid::new_v4()),
            store,
            options,
            processor,
            custom_backoff: None,
            shutdown_tx,
            running: Arc::new(AtomicBool::new(false)),
            in_flight: Arc::new(Mutex::new(HashSet::new())),
            jobs_processed: Arc::new(AtomicU64::new(0)),
            jobs_failed: Arc::new(AtomicU64::new(0)),
        })
    }

    /// Installs the strategy used when a job's backoff type is `custom`.
    pub fn with_backoff_strategy(mut self, strategy: CustomBackoff) -> Self {
        self.custom_backoff = Some(strategy);
        self
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    pub fn jobs_processed(&self) -> u64 {
        self.jobs_processed.load(Ordering::Relaxed)
    }

    pub fn jobs_failed(&self) -> u64 {
        self.jobs_failed.load(Ordering::Relaxed)
    }

    /// Ids of jobs currently being processed by this worker.
    pub fn active_job_ids(&self) -> Vec<String> {
        self.in_flight.lock().iter().cloned().collect()
    }

    pub fn stats(&self) -> WorkerStats {
        WorkerStats {
            id: self.id.clone(),
            running: self.is_running(),
            concurrency: self.options.concurrency,
            in_flight: self.in_flight.lock().len(),
            jobs_processed: self.jobs_processed(),
            jobs_failed: self.jobs_failed(),
        }
    }

    fn claim_options(&self) -> ClaimOptions {
        ClaimOptions {
            lock_duration_ms: self.options.lock_duration_ms,
            default_concurrency: self.options.group.concurrency,
            rate: self.options.group.rate_limit,
            promote_batch: PROMOTE_BATCH,
        }
    }

    /// Claims the next claimable job under `token`, or `None` when the
    /// queue has nothing due. For manual processing loops; [`Worker::run`]
    /// does this internally.
    pub async fn get_next_job(&self, token: &str) -> QueueResult<Option<Job>> {
        self.store.claim_next(token, &self.claim_options()).await
    }

    /// Manually rate limits the group of `job` for `duration_ms`, e.g. on
    /// an external quota signal. Returns false when the group is paused and
    /// was left untouched.
    pub async fn rate_limit_group(&self, job: &Job, duration_ms: u64) -> QueueResult<bool> {
        if duration_ms == 0 {
            return Err(QueueError::Validation(
                "rate limit duration must be positive".to_string(),
            ));
        }
        let group_id = job
            .group_id
            .as_deref()
            .ok_or_else(|| QueueError::Validation("job does not belong to a group".to_string()))?;
        let limited = self.store.rate_limit_group(group_id, duration_ms).await?;
        if limited {
            GroupMetrics::group_rate_limited(self.store.queue_name(), group_id);
        }
        Ok(limited)
    }

    /// Runs the claim loop until [`Worker::close`] is called, then drains
    /// in-flight jobs within the shutdown timeout.
    pub async fn run(&self) -> QueueResult<()> {
        if self.running.swap(true, Ordering::SeqCst) {
            return Err(QueueError::Validation(
                "worker is already running".to_string(),
            ));
        }

        info!(
            worker_id = %self.id,
            queue = %self.store.queue_name(),
            concurrency = self.options.concurrency,
            "Starting worker"
        );
        WorkerMetrics::update_workers(&self.id, 0, self.options.concurrency);

        let semaphore = Arc::new(Semaphore::new(self.options.concurrency));
        let mut shutdown_rx = self.shutdown_tx.subscribe();
        let claim = self.claim_options();
        let poll_interval = Duration::from_millis(self.options.poll_interval_ms.max(1));

        let sweeper = self.spawn_stalled_sweeper();

        loop {
            tokio::select! {
                _ = shutdown_rx.recv() => {
                    info!(worker_id = %self.id, "Received shutdown signal");
                    break;
                }

                permit = semaphore.clone().acquire_owned() => {
                    if let Ok(permit) = permit {
                        let token = Uuid::new_v4().to_string();
                        match self.store.claim_next(&token, &claim).await {
                            Ok(Some(job)) => {
                                self.spawn_processing(job, permit);
                                // More work may be due right now.
                                continue;
                            }
                            Ok(None) => drop(permit),
                            Err(e) => {
                                error!(error = %e, "Failed to claim next job");
                                drop(permit);
                            }
                        }
                    }
                    tokio::time::sleep(poll_interval).await;
                }
            }
        }

        info!(worker_id = %self.id, "Waiting for in-flight jobs to finish...");
        let _ = timeout(
            Duration::from_millis(self.options.shutdown_timeout_ms),
            async {
                while semaphore.available_permits() < self.options.concurrency {
                    tokio::time::sleep(Duration::from_millis(50)).await;
                }
            },
        )
        .await;

        sweeper.abort();
        self.running.store(false, Ordering::SeqCst);

        info!(
            worker_id = %self.id,
            processed = self.jobs_processed(),
            failed = self.jobs_failed(),
            "Worker stopped"
        );
        Ok(())
    }

    /// Signals [`Worker::run`] to stop claiming and drain.
    pub fn close(&self) {
        info!(worker_id = %self.id, "Closing worker...");
        let _ = self.shutdown_tx.send(());
    }

    fn spawn_stalled_sweeper(&self) -> tokio::task::JoinHandle<()> {
        let store = Arc::clone(&self.store);
        let max_stalled = self.options.max_stalled_count;
        let every = Duration::from_millis(self.options.stalled_interval_ms);
        let mut shutdown_rx = self.shutdown_tx.subscribe();

        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = shutdown_rx.recv() => break,
                    _ = tokio::time::sleep(every) => {
                        match store.stalled_sweep(max_stalled).await {
                            Ok((stalled, failed)) => {
                                if !stalled.is_empty() || !failed.is_empty() {
                                    JobMetrics::jobs_stalled(
                                        store.queue_name(),
                                        (stalled.len() + failed.len()) as u64,
                                    );
                                    warn!(
                                        recovered = stalled.len(),
                                        failed = failed.len(),
                                        "Swept stalled jobs"
                                    );
                                }
                            }
                            Err(e) => error!(error = %e, "Stalled sweep failed"),
                        }
                    }
                }
            }
        })
    }

    fn spawn_processing(&self, job: Job, permit: tokio::sync::OwnedSemaphorePermit) {
        let job_id = job.id.clone();
        self.in_flight.lock().insert(job_id.clone());

        let ctx = ProcessContext {
            store: Arc::clone(&self.store),
            processor: Arc::clone(&self.processor),
            custom_backoff: self.custom_backoff.clone(),
            ttl_ms: self.options.ttl.as_ref().and_then(|t| t.resolve(&job.name)),
            lock_duration_ms: self.options.lock_duration_ms,
            in_flight: Arc::clone(&self.in_flight),
            jobs_processed: Arc::clone(&self.jobs_processed),
            jobs_failed: Arc::clone(&self.jobs_failed),
        };

        tokio::spawn(
            async move {
                ctx.process(job).await;
                drop(permit);
            }
            .instrument(tracing::info_span!("process", job_id = %job_id)),
        );
    }
}

/// Everything one processing task needs, detached from the worker.
struct ProcessContext {
    store: Arc<JobStore>,
    processor: Arc<dyn JobProcessor>,
    custom_backoff: Option<CustomBackoff>,
    ttl_ms: Option<u64>,
    lock_duration_ms: u64,
    in_flight: Arc<Mutex<HashSet<String>>>,
    jobs_processed: Arc<AtomicU64>,
    jobs_failed: Arc<AtomicU64>,
}

struct InFlightGuard {
    set: Arc<Mutex<HashSet<String>>>,
    id: String,
}

impl Drop for InFlightGuard {
    fn drop(&mut self) {
        self.set.lock().remove(&self.id);
    }
}

impl ProcessContext {
    async fn process(self, mut job: Job) {
        let _guard = InFlightGuard {
            set: Arc::clone(&self.in_flight),
            id: job.id.clone(),
        };
        let started = Instant::now();
        let queue = self.store.queue_name().to_string();
        let job_name = job.name.clone();

        let Some(token) = job.token().map(str::to_string) else {
            error!(job_id = %job.id, "Claimed job carries no lock token");
            return;
        };

        let (stop_renewal, renewal) = self.spawn_lock_renewal(&job.id, &token);
        let outcome = self.run_processor(&mut job, &token).await;
        let _ = stop_renewal.send(());
        let _ = renewal.await;

        match outcome {
            Ok(None) => {
                // The processor moved the job out itself, e.g. into
                // waiting-children. Nothing to settle here.
                debug!(job_id = %job.id, "Job released by its processor");
            }
            Ok(Some(value)) => match job.move_to_completed(value).await {
                Ok(()) => {
                    self.jobs_processed.fetch_add(1, Ordering::Relaxed);
                    JobMetrics::job_completed(&queue, &job_name, started.elapsed());
                    debug!(job_id = %job.id, "Job completed");
                }
                Err(e) => {
                    error!(job_id = %job.id, error = %e, "Failed to record completion");
                }
            },
            Err(process_error) => {
                match job
                    .move_to_failed(&process_error, self.custom_backoff.as_ref())
                    .await
                {
                    Ok(JobState::Failed) => {
                        self.jobs_failed.fetch_add(1, Ordering::Relaxed);
                        JobMetrics::job_failed(&queue, &job_name, started.elapsed());
                        warn!(
                            job_id = %job.id,
                            reason = %process_error.message(),
                            "Job failed"
                        );
                    }
                    Ok(state) => {
                        JobMetrics::job_retried(&queue, &job_name, job.attempts_made);
                        debug!(
                            job_id = %job.id,
                            state = %state,
                            attempts = job.attempts_made,
                            "Job will be retried"
                        );
                    }
                    Err(e) => {
                        error!(job_id = %job.id, error = %e, "Failed to record failure");
                    }
                }
            }
        }
    }

    /// Renews the job lock at half its duration until told to stop.
    fn spawn_lock_renewal(
        &self,
        job_id: &str,
        token: &str,
    ) -> (oneshot::Sender<()>, tokio::task::JoinHandle<()>) {
        let (stop_tx, mut stop_rx) = oneshot::channel::<()>();
        let store = Arc::clone(&self.store);
        let job_id = job_id.to_string();
        let token = token.to_string();
        let duration_ms = self.lock_duration_ms;
        let every = Duration::from_millis((duration_ms / 2).max(1));

        let handle = tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = &mut stop_rx => break,
                    _ = tokio::time::sleep(every) => {
                        if let Err(e) = store.extend_lock(&job_id, &token, duration_ms).await {
                            warn!(job_id = %job_id, error = %e, "Failed to extend job lock");
                            break;
                        }
                    }
                }
            }
        });
        (stop_tx, handle)
    }

    async fn run_processor(
        &self,
        job: &mut Job,
        token: &str,
    ) -> Result<Option<Value>, ProcessError> {
        let output = self.processor.process(job).await?;
        if job.token().is_none() {
            return Ok(None);
        }

        match output {
            ProcessorOutput::Value(value) => Ok(Some(value)),
            ProcessorOutput::Stream(mut stream) => {
                let mut last = None;
                loop {
                    let item = match self.ttl_ms {
                        Some(ms) => match timeout(Duration::from_millis(ms), stream.next()).await {
                            Ok(item) => item,
                            Err(_) => {
                                return Err(ProcessError::new(format!(
                                    "no result within the {ms}ms ttl"
                                )));
                            }
                        },
                        None => stream.next().await,
                    };
                    match item {
                        Some(Ok(value)) => {
                            let json = serde_json::to_string(&value)?;
                            self.store
                                .store_result(&job.id, token, &json)
                                .await
                                .map_err(|e| ProcessError::new(e.to_string()))?;
                            last = Some(value);
                        }
                        Some(Err(e)) => return Err(e),
                        None => break,
                    }
                }
                match last {
                    Some(value) => Ok(Some(value)),
                    None => Err(ProcessError::new(
                        "stream ended without producing a result",
                    )),
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::group::GroupRateLimit;

    #[test]
    fn test_worker_options_default() {
        let options = WorkerOptions::default();
        assert_eq!(options.concurrency, 1);
        assert_eq!(options.lock_duration_ms, 30_000);
        assert_eq!(options.max_stalled_count, 1);
        assert!(options.ttl.is_none());
    }

    #[test]
    fn test_option_validation_rejects_zero_concurrency() {
        let options = WorkerOptions {
            concurrency: 0,
            ..WorkerOptions::default()
        };
        assert!(validate_options(&options).is_err());
    }

    #[test]
    fn test_option_validation_rejects_zero_intervals() {
        let options = WorkerOptions {
            lock_duration_ms: 0,
            ..WorkerOptions::default()
        };
        assert!(validate_options(&options).is_err());

        let options = WorkerOptions {
            stalled_interval_ms: 0,
            ..WorkerOptions::default()
        };
        assert!(validate_options(&options).is_err());
    }

    #[test]
    fn test_option_validation_rejects_conflicting_group_policy() {
        let options = WorkerOptions {
            group: GroupPolicy {
                concurrency: Some(2),
                rate_limit: Some(GroupRateLimit {
                    max: 10,
                    duration_ms: 1_000,
                }),
            },
            ..WorkerOptions::default()
        };
        assert!(validate_options(&options).is_err());
    }

    #[test]
    fn test_ttl_policy_resolution() {
        let all = TtlPolicy::All(500);
        assert_eq!(all.resolve("anything"), Some(500));

        let mut per_name = HashMap::new();
        per_name.insert("transcode".to_string(), 2_000u64);
        let policy = TtlPolicy::PerName(per_name);
        assert_eq!(policy.resolve("transcode"), Some(2_000));
        assert_eq!(policy.resolve("resize"), None);
    }

    #[test]
    fn test_ttl_policy_rejects_zero() {
        assert!(TtlPolicy::All(0).validate().is_err());

        let mut per_name = HashMap::new();
        per_name.insert("resize".to_string(), 0u64);
        assert!(TtlPolicy::PerName(per_name).validate().is_err());
    }
}
