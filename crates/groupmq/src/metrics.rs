//! Prometheus metrics for queue and worker monitoring.

use metrics::{counter, describe_counter, describe_gauge, describe_histogram, gauge, histogram};
use std::time::Duration;

use crate::group::GroupCounts;
use crate::queue::JobCounts;

/// Metric names.
pub mod names {
    /// Total jobs added.
    pub const JOBS_ADDED_TOTAL: &str = "groupmq_jobs_added_total";
    /// Total jobs completed successfully.
    pub const JOBS_COMPLETED_TOTAL: &str = "groupmq_jobs_completed_total";
    /// Total jobs failed for good.
    pub const JOBS_FAILED_TOTAL: &str = "groupmq_jobs_failed_total";
    /// Total jobs scheduled for another attempt.
    pub const JOBS_RETRIED_TOTAL: &str = "groupmq_jobs_retried_total";
    /// Total jobs recovered after stalling.
    pub const JOBS_STALLED_TOTAL: &str = "groupmq_jobs_stalled_total";

    /// Current claimable jobs.
    pub const JOBS_WAITING: &str = "groupmq_jobs_waiting";
    /// Current active jobs.
    pub const JOBS_ACTIVE: &str = "groupmq_jobs_active";
    /// Current delayed jobs.
    pub const JOBS_DELAYED: &str = "groupmq_jobs_delayed";

    /// Job execution duration in seconds.
    pub const JOB_DURATION_SECONDS: &str = "groupmq_job_duration_seconds";

    /// Groups per status partition.
    pub const GROUPS: &str = "groupmq_groups";
    /// Total manual group rate limits applied.
    pub const GROUP_RATE_LIMITS_TOTAL: &str = "groupmq_group_rate_limits_total";

    /// In-flight jobs per worker.
    pub const WORKER_IN_FLIGHT: &str = "groupmq_worker_in_flight";
    /// Configured worker concurrency.
    pub const WORKER_CONCURRENCY: &str = "groupmq_worker_concurrency";
}

/// Register all metric descriptions.
pub fn register_metrics() {
    describe_counter!(names::JOBS_ADDED_TOTAL, "Total number of jobs added");
    describe_counter!(
        names::JOBS_COMPLETED_TOTAL,
        "Total number of jobs completed successfully"
    );
    describe_counter!(
        names::JOBS_FAILED_TOTAL,
        "Total number of jobs that failed for good"
    );
    describe_counter!(
        names::JOBS_RETRIED_TOTAL,
        "Total number of jobs scheduled for another attempt"
    );
    describe_counter!(
        names::JOBS_STALLED_TOTAL,
        "Total number of jobs recovered after stalling"
    );

    describe_gauge!(names::JOBS_WAITING, "Current number of claimable jobs");
    describe_gauge!(names::JOBS_ACTIVE, "Current number of active jobs");
    describe_gauge!(names::JOBS_DELAYED, "Current number of delayed jobs");

    describe_histogram!(
        names::JOB_DURATION_SECONDS,
        "Job execution duration in seconds"
    );

    describe_gauge!(names::GROUPS, "Number of groups per status partition");
    describe_counter!(
        names::GROUP_RATE_LIMITS_TOTAL,
        "Total number of manual group rate limits applied"
    );

    describe_gauge!(names::WORKER_IN_FLIGHT, "In-flight jobs per worker");
    describe_gauge!(names::WORKER_CONCURRENCY, "Configured worker concurrency");
}

/// Job metrics recorder.
#[derive(Clone)]
pub struct JobMetrics;

impl JobMetrics {
    /// Record a job added.
    pub fn job_added(queue: &str, job_name: &str) {
        counter!(
            names::JOBS_ADDED_TOTAL,
            "queue" => queue.to_string(),
            "job_name" => job_name.to_string()
        )
        .increment(1);
    }

    /// Record a job completed.
    pub fn job_completed(queue: &str, job_name: &str, duration: Duration) {
        counter!(
            names::JOBS_COMPLETED_TOTAL,
            "queue" => queue.to_string(),
            "job_name" => job_name.to_string()
        )
        .increment(1);

        histogram!(
            names::JOB_DURATION_SECONDS,
            "queue" => queue.to_string(),
            "job_name" => job_name.to_string(),
            "status" => "completed"
        )
        .record(duration.as_secs_f64());
    }

    /// Record a job failed for good.
    pub fn job_failed(queue: &str, job_name: &str, duration: Duration) {
        counter!(
            names::JOBS_FAILED_TOTAL,
            "queue" => queue.to_string(),
            "job_name" => job_name.to_string()
        )
        .increment(1);

        histogram!(
            names::JOB_DURATION_SECONDS,
            "queue" => queue.to_string(),
            "job_name" => job_name.to_string(),
            "status" => "failed"
        )
        .record(duration.as_secs_f64());
    }

    /// Record a job scheduled for another attempt.
    pub fn job_retried(queue: &str, job_name: &str, attempt: u32) {
        counter!(
            names::JOBS_RETRIED_TOTAL,
            "queue" => queue.to_string(),
            "job_name" => job_name.to_string(),
            "attempt" => attempt.to_string()
        )
        .increment(1);
    }

    /// Record jobs recovered by a stalled sweep.
    pub fn jobs_stalled(queue: &str, count: u64) {
        counter!(
            names::JOBS_STALLED_TOTAL,
            "queue" => queue.to_string()
        )
        .increment(count);
    }

    /// Update per-state size gauges.
    pub fn update_counts(queue: &str, counts: &JobCounts) {
        gauge!(
            names::JOBS_WAITING,
            "queue" => queue.to_string()
        )
        .set(counts.waiting as f64);

        gauge!(
            names::JOBS_ACTIVE,
            "queue" => queue.to_string()
        )
        .set(counts.active as f64);

        gauge!(
            names::JOBS_DELAYED,
            "queue" => queue.to_string()
        )
        .set(counts.delayed as f64);
    }
}

/// Group metrics recorder.
#[derive(Clone)]
pub struct GroupMetrics;

impl GroupMetrics {
    /// Update group partition gauges.
    pub fn update_groups(queue: &str, counts: &GroupCounts) {
        for (status, count) in [
            ("waiting", counts.waiting),
            ("limited", counts.limited),
            ("maxed", counts.maxed),
            ("paused", counts.paused),
        ] {
            gauge!(
                names::GROUPS,
                "queue" => queue.to_string(),
                "status" => status.to_string()
            )
            .set(count as f64);
        }
    }

    /// Record a manual group rate limit.
    pub fn group_rate_limited(queue: &str, group_id: &str) {
        counter!(
            names::GROUP_RATE_LIMITS_TOTAL,
            "queue" => queue.to_string(),
            "group_id" => group_id.to_string()
        )
        .increment(1);
    }
}

/// Worker metrics recorder.
#[derive(Clone)]
pub struct WorkerMetrics;

impl WorkerMetrics {
    /// Update worker gauges.
    pub fn update_workers(worker_id: &str, in_flight: u64, concurrency: usize) {
        gauge!(
            names::WORKER_IN_FLIGHT,
            "worker_id" => worker_id.to_string()
        )
        .set(in_flight as f64);

        gauge!(
            names::WORKER_CONCURRENCY,
            "worker_id" => worker_id.to_string()
        )
        .set(concurrency as f64);
    }
}
