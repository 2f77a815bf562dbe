//! Integration tests for group scheduling: fairness, concurrency caps,
//! pausing, rate limits and group administration.
//!
//! These tests run against a real Redis instance using testcontainers.
//! Requires Docker to be available on the system.

mod common;

use common::TestRedis;
use groupmq::{
    FnProcessor, GroupPolicy, GroupRateLimit, GroupStatus, Job, JobOptions, JobState, ManualClock,
    ProcessorOutput, Queue, QueueError, Worker, WorkerOptions,
};
use serde_json::{json, Value};
use std::sync::Arc;

fn claimer(queue: &Queue) -> Worker {
    claimer_with(queue, WorkerOptions::default())
}

fn claimer_with(queue: &Queue, options: WorkerOptions) -> Worker {
    let processor = Arc::new(FnProcessor::new(|_job: &mut Job| {
        Box::pin(async { Ok(ProcessorOutput::value(Value::Null)) })
    }));
    Worker::new(Arc::clone(queue.store()), processor, options).expect("Failed to build worker")
}

/// Claims and completes jobs until the queue is drained, returning
/// `(group, n)` pairs in claim order.
async fn drain_in_order(worker: &Worker) -> Vec<(String, u64)> {
    let mut order = Vec::new();
    for token in 0.. {
        let claimed = worker
            .get_next_job(&format!("token-{}", token))
            .await
            .expect("Claim failed");
        let mut job = match claimed {
            Some(job) => job,
            None => break,
        };
        let group = job.group_id.clone().unwrap_or_default();
        let n = job.data["n"].as_u64().unwrap_or(0);
        order.push((group, n));
        job.move_to_completed(Value::Null)
            .await
            .expect("Completion failed");
    }
    order
}

fn grouped(group: &str, n: u64) -> (String, u64) {
    (group.to_string(), n)
}

#[tokio::test]
async fn test_groups_rotate_round_robin() {
    let redis = TestRedis::new().await;
    let queue = redis.queue("tenants").await;
    let worker = claimer(&queue);

    // Interleaved adds: three tenants with three jobs each.
    for n in 1..=3u64 {
        for group in ["a", "b", "c"] {
            queue
                .add("work", json!({ "n": n }), JobOptions::default().in_group(group))
                .await
                .expect("Failed to add job");
        }
    }

    let order = drain_in_order(&worker).await;
    assert_eq!(
        order,
        vec![
            grouped("a", 1),
            grouped("b", 1),
            grouped("c", 1),
            grouped("a", 2),
            grouped("b", 2),
            grouped("c", 2),
            grouped("a", 3),
            grouped("b", 3),
            grouped("c", 3),
        ]
    );
}

#[tokio::test]
async fn test_group_is_serial_by_default() {
    let redis = TestRedis::new().await;
    let queue = redis.queue("tenants").await;
    let worker = claimer(&queue);

    for n in 1..=2u64 {
        queue
            .add("work", json!({ "n": n }), JobOptions::default().in_group("g"))
            .await
            .expect("Failed to add job");
    }

    let mut first = worker
        .get_next_job("token-1")
        .await
        .expect("Claim failed")
        .expect("Expected the first job");

    // One job of the group is active, so the second is not claimable.
    assert!(worker
        .get_next_job("token-2")
        .await
        .expect("Claim failed")
        .is_none());
    assert_eq!(
        queue.get_group_status("g").await.expect("Status failed"),
        Some(GroupStatus::Maxed)
    );

    first
        .move_to_completed(Value::Null)
        .await
        .expect("Completion failed");

    let second = worker
        .get_next_job("token-3")
        .await
        .expect("Claim failed")
        .expect("Expected the second job after completion");
    assert_eq!(second.data["n"], json!(2));
}

#[tokio::test]
async fn test_persisted_group_concurrency() {
    let redis = TestRedis::new().await;
    let queue = redis.queue("tenants").await;
    let worker = claimer(&queue);

    let mut opts = JobOptions::default().in_group("tenant");
    if let Some(group) = &mut opts.group {
        group.concurrency = Some(2);
    }
    for n in 1..=3u64 {
        queue
            .add("work", json!({ "n": n }), opts.clone())
            .await
            .expect("Failed to add job");
    }

    let mut first = worker
        .get_next_job("token-1")
        .await
        .expect("Claim failed")
        .expect("Expected the first job");
    let _second = worker
        .get_next_job("token-2")
        .await
        .expect("Claim failed")
        .expect("Expected a second concurrent job");

    assert!(worker
        .get_next_job("token-3")
        .await
        .expect("Claim failed")
        .is_none());
    assert_eq!(
        queue.get_group_status("tenant").await.expect("Status failed"),
        Some(GroupStatus::Maxed)
    );

    first
        .move_to_completed(Value::Null)
        .await
        .expect("Completion failed");
    let third = worker
        .get_next_job("token-4")
        .await
        .expect("Claim failed")
        .expect("Expected the third job after a slot freed up");
    assert_eq!(third.data["n"], json!(3));
}

#[tokio::test]
async fn test_worker_default_group_concurrency() {
    let redis = TestRedis::new().await;
    let queue = redis.queue("tenants").await;
    let worker = claimer_with(
        &queue,
        WorkerOptions {
            group: GroupPolicy {
                concurrency: Some(2),
                rate_limit: None,
            },
            ..WorkerOptions::default()
        },
    );

    for n in 1..=3u64 {
        queue
            .add("work", json!({ "n": n }), JobOptions::default().in_group("g"))
            .await
            .expect("Failed to add job");
    }

    assert!(worker
        .get_next_job("token-1")
        .await
        .expect("Claim failed")
        .is_some());
    assert!(worker
        .get_next_job("token-2")
        .await
        .expect("Claim failed")
        .is_some());
    assert!(worker
        .get_next_job("token-3")
        .await
        .expect("Claim failed")
        .is_none());
}

#[tokio::test]
async fn test_pause_and_resume_group() {
    let redis = TestRedis::new().await;
    let queue = redis.queue("notify").await;
    let worker = claimer(&queue);

    for n in 1..=2u64 {
        queue
            .add("email", json!({ "n": n }), JobOptions::default().in_group("g"))
            .await
            .expect("Failed to add job");
    }

    assert!(queue.pause_group("g").await.expect("Pause failed"));
    assert!(!queue.pause_group("g").await.expect("Pause failed"));
    assert_eq!(
        queue.get_group_status("g").await.expect("Status failed"),
        Some(GroupStatus::Paused)
    );

    // The evicted representative reads as paused, and nothing is claimable.
    assert_eq!(
        queue.get_job_state("1").await.expect("State query failed"),
        JobState::Paused
    );
    assert!(worker
        .get_next_job("token-1")
        .await
        .expect("Claim failed")
        .is_none());

    assert!(queue.resume_group("g").await.expect("Resume failed"));
    assert!(!queue.resume_group("g").await.expect("Resume failed"));
    assert_eq!(
        queue.get_job_state("1").await.expect("State query failed"),
        JobState::Waiting
    );

    let job = worker
        .get_next_job("token-2")
        .await
        .expect("Claim failed")
        .expect("Expected a claimable job after resume");
    assert_eq!(job.id, "1");
}

#[tokio::test]
async fn test_group_rate_limit_from_worker_policy() {
    let redis = TestRedis::new().await;
    let clock = Arc::new(ManualClock::new(1_000_000));
    let queue = redis.queue_with_clock("mail", clock.clone()).await;
    let worker = claimer_with(
        &queue,
        WorkerOptions {
            group: GroupPolicy {
                concurrency: None,
                rate_limit: Some(GroupRateLimit {
                    max: 2,
                    duration_ms: 60_000,
                }),
            },
            ..WorkerOptions::default()
        },
    );

    for n in 1..=3u64 {
        queue
            .add("send", json!({ "n": n }), JobOptions::default().in_group("g"))
            .await
            .expect("Failed to add job");
    }

    // Two activations fit in the window.
    for token in ["t1", "t2"] {
        let mut job = worker
            .get_next_job(token)
            .await
            .expect("Claim failed")
            .expect("Expected a job within the rate window");
        job.move_to_completed(Value::Null)
            .await
            .expect("Completion failed");
    }

    assert!(worker
        .get_next_job("t3")
        .await
        .expect("Claim failed")
        .is_none());
    assert_eq!(
        queue.get_group_status("g").await.expect("Status failed"),
        Some(GroupStatus::Limited)
    );

    // The window expires and the next claim reopens the group.
    clock.advance(60_001);
    let job = worker
        .get_next_job("t4")
        .await
        .expect("Claim failed")
        .expect("Expected a job after the window expired");
    assert_eq!(job.data["n"], json!(3));
}

#[tokio::test]
async fn test_manual_group_rate_limit() {
    let redis = TestRedis::new().await;
    let clock = Arc::new(ManualClock::new(1_000_000));
    let queue = redis.queue_with_clock("mail", clock.clone()).await;
    let worker = claimer(&queue);

    let job = queue
        .add("send", json!({}), JobOptions::default().in_group("g"))
        .await
        .expect("Failed to add job");

    assert!(worker
        .rate_limit_group(&job, 30_000)
        .await
        .expect("Rate limit failed"));
    assert_eq!(
        queue.get_group_status("g").await.expect("Status failed"),
        Some(GroupStatus::Limited)
    );
    assert!(worker
        .get_next_job("token-1")
        .await
        .expect("Claim failed")
        .is_none());

    // An unrelated group is unaffected by the limit.
    queue
        .add("send", json!({}), JobOptions::default().in_group("k"))
        .await
        .expect("Failed to add job");
    let other = worker
        .get_next_job("token-k")
        .await
        .expect("Claim failed")
        .expect("Expected a job from the unlimited group");
    assert_eq!(other.group_id.as_deref(), Some("k"));

    clock.advance(30_001);
    assert!(worker
        .get_next_job("token-2")
        .await
        .expect("Claim failed")
        .is_some());

    let err = worker.rate_limit_group(&job, 0).await.unwrap_err();
    assert!(matches!(err, QueueError::Validation(_)));

    let ungrouped = queue
        .add("solo", json!({}), JobOptions::default())
        .await
        .expect("Failed to add job");
    let err = worker.rate_limit_group(&ungrouped, 30_000).await.unwrap_err();
    assert!(matches!(err, QueueError::Validation(_)));

    // Paused groups are left untouched.
    let parked = queue
        .add("send", json!({}), JobOptions::default().in_group("h"))
        .await
        .expect("Failed to add job");
    assert!(queue.pause_group("h").await.expect("Pause failed"));
    assert!(!worker
        .rate_limit_group(&parked, 30_000)
        .await
        .expect("Rate limit failed"));
}

#[tokio::test]
async fn test_groups_snapshot_and_counts() {
    let redis = TestRedis::new().await;
    let queue = redis.queue("partitions").await;
    let worker = claimer(&queue);

    for group in ["alpha", "beta"] {
        queue
            .add("work", json!({}), JobOptions::default().in_group(group))
            .await
            .expect("Failed to add job");
    }
    let gamma = queue
        .add("work", json!({}), JobOptions::default().in_group("gamma"))
        .await
        .expect("Failed to add job");
    assert!(queue.pause_group("beta").await.expect("Pause failed"));
    assert!(worker
        .rate_limit_group(&gamma, 60_000)
        .await
        .expect("Rate limit failed"));

    let snapshot = queue.get_groups(0, -1).await.expect("Snapshot failed");
    assert_eq!(snapshot.waiting, vec!["alpha"]);
    assert_eq!(snapshot.limited, vec!["gamma"]);
    assert_eq!(snapshot.paused, vec!["beta"]);
    assert!(snapshot.maxed.is_empty());

    let counts = queue.get_groups_count().await.expect("Counts failed");
    assert_eq!(counts.waiting, 1);
    assert_eq!(counts.limited, 1);
    assert_eq!(counts.paused, 1);
    assert_eq!(counts.maxed, 0);
    assert_eq!(counts.total(), 3);

    let waiting = queue
        .get_groups_by_status(GroupStatus::Waiting, 0, -1)
        .await
        .expect("Listing failed");
    assert_eq!(waiting.len(), 1);
    assert_eq!(waiting[0].id, "alpha");
    assert_eq!(waiting[0].count, 1);

    assert_eq!(
        queue.get_group_status("nope").await.expect("Status failed"),
        None
    );
}

#[tokio::test]
async fn test_group_jobs_listing() {
    let redis = TestRedis::new().await;
    let queue = redis.queue("reports").await;

    for n in 1..=4u64 {
        queue
            .add(
                "report",
                json!({ "n": n }),
                JobOptions::default().in_group("reports"),
            )
            .await
            .expect("Failed to add job");
    }
    queue
        .add("audit", json!({ "n": 1 }), JobOptions::default().in_group("audit"))
        .await
        .expect("Failed to add job");
    queue
        .add("audit", json!({ "n": 2 }), JobOptions::default().in_group("audit"))
        .await
        .expect("Failed to add job");

    // The representative occupies index 0, the backlog follows in order.
    let all = queue
        .get_group_jobs("reports", 0, -1)
        .await
        .expect("Listing failed");
    let ids: Vec<&str> = all.iter().map(|j| j.id.as_str()).collect();
    assert_eq!(ids, vec!["1", "2", "3", "4"]);

    let slice = queue
        .get_group_jobs("reports", 1, 2)
        .await
        .expect("Listing failed");
    let ids: Vec<&str> = slice.iter().map(|j| j.id.as_str()).collect();
    assert_eq!(ids, vec!["2", "3"]);

    let head = queue
        .get_group_jobs("reports", 0, 0)
        .await
        .expect("Listing failed");
    assert_eq!(head.len(), 1);
    assert_eq!(head[0].id, "1");

    assert!(queue
        .get_group_jobs("nope", 0, -1)
        .await
        .expect("Listing failed")
        .is_empty());
    assert!(matches!(
        queue.get_group_jobs("reports", 0, -2).await.unwrap_err(),
        QueueError::Validation(_)
    ));

    assert_eq!(
        queue
            .get_group_jobs_count("reports")
            .await
            .expect("Count failed"),
        4
    );
    // Paging with a tiny page size still covers every group.
    assert_eq!(
        queue.get_groups_jobs_count(1).await.expect("Count failed"),
        6
    );
}

#[tokio::test]
async fn test_priority_within_group_respects_the_representative() {
    let redis = TestRedis::new().await;
    let queue = redis.queue("tenants").await;
    let worker = claimer(&queue);

    // The first add becomes the representative before the others arrive;
    // priority reorders the backlog only.
    queue
        .add(
            "work",
            json!({ "n": 1 }),
            JobOptions::default().in_group("g").with_priority(2),
        )
        .await
        .expect("Failed to add job");
    queue
        .add("work", json!({ "n": 2 }), JobOptions::default().in_group("g"))
        .await
        .expect("Failed to add job");
    queue
        .add(
            "work",
            json!({ "n": 3 }),
            JobOptions::default().in_group("g").with_priority(1),
        )
        .await
        .expect("Failed to add job");

    let order = drain_in_order(&worker).await;
    assert_eq!(order, vec![grouped("g", 1), grouped("g", 2), grouped("g", 3)]);
}

#[tokio::test]
async fn test_lifo_within_group() {
    let redis = TestRedis::new().await;
    let queue = redis.queue("tenants").await;
    let worker = claimer(&queue);

    let mut opts = JobOptions::default().in_group("g");
    opts.lifo = true;
    for n in 1..=3u64 {
        queue
            .add("work", json!({ "n": n }), opts.clone())
            .await
            .expect("Failed to add job");
    }

    // Job 1 is already committed as the representative; jobs 2 and 3
    // swap within the backlog.
    let order = drain_in_order(&worker).await;
    assert_eq!(order, vec![grouped("g", 1), grouped("g", 3), grouped("g", 2)]);
}

#[tokio::test]
async fn test_delete_group() {
    let redis = TestRedis::new().await;
    let queue = redis.queue("tenants").await;

    for n in 1..=2u64 {
        queue
            .add("work", json!({ "n": n }), JobOptions::default().in_group("g1"))
            .await
            .expect("Failed to add job");
    }
    let delayed = queue
        .add(
            "work",
            json!({ "n": 3 }),
            JobOptions::default().in_group("g1").with_delay(60_000),
        )
        .await
        .expect("Failed to add job");
    let other = queue
        .add("work", json!({}), JobOptions::default().in_group("g2"))
        .await
        .expect("Failed to add job");

    queue.delete_group("g1").await.expect("Delete failed");

    assert!(queue
        .get_group_jobs("g1", 0, -1)
        .await
        .expect("Listing failed")
        .is_empty());
    assert_eq!(
        queue.get_group_status("g1").await.expect("Status failed"),
        None
    );
    assert!(queue.get_job("1").await.expect("Fetch failed").is_none());
    assert!(queue.get_job("2").await.expect("Fetch failed").is_none());
    assert!(queue
        .get_job(&delayed.id)
        .await
        .expect("Fetch failed")
        .is_none());
    assert_eq!(queue.get_counts().await.expect("Counts failed").delayed, 0);

    // The untouched group keeps its jobs.
    assert!(queue
        .get_job(&other.id)
        .await
        .expect("Fetch failed")
        .is_some());
    assert_eq!(
        queue.get_group_jobs_count("g2").await.expect("Count failed"),
        1
    );
    let snapshot = queue.get_groups(0, -1).await.expect("Snapshot failed");
    assert_eq!(snapshot.waiting, vec!["g2"]);
}

#[tokio::test]
async fn test_delete_groups_clears_every_partition() {
    let redis = TestRedis::new().await;
    let queue = redis.queue("tenants").await;

    for group in ["g1", "g2", "g3"] {
        queue
            .add("work", json!({}), JobOptions::default().in_group(group))
            .await
            .expect("Failed to add job");
    }
    assert!(queue.pause_group("g2").await.expect("Pause failed"));

    queue.delete_groups().await.expect("Delete failed");

    let snapshot = queue.get_groups(0, -1).await.expect("Snapshot failed");
    assert!(snapshot.is_empty());
    assert_eq!(
        queue.get_groups_jobs_count(10).await.expect("Count failed"),
        0
    );
    assert_eq!(queue.get_counts().await.expect("Counts failed").total(), 0);
}

#[tokio::test]
async fn test_obliterate_refuses_active_jobs() {
    let redis = TestRedis::new().await;
    let queue = redis.queue("tenants").await;
    let worker = claimer(&queue);

    queue
        .add("work", json!({}), JobOptions::default())
        .await
        .expect("Failed to add job");
    queue
        .add("work", json!({}), JobOptions::default().with_delay(60_000))
        .await
        .expect("Failed to add job");

    let mut active = worker
        .get_next_job("token-1")
        .await
        .expect("Claim failed")
        .expect("Expected a claimable job");

    let err = queue.obliterate(false).await.unwrap_err();
    assert!(matches!(err, QueueError::ActiveJobsPresent));

    active
        .move_to_completed(Value::Null)
        .await
        .expect("Completion failed");
    queue.obliterate(false).await.expect("Obliterate failed");

    assert_eq!(queue.get_counts().await.expect("Counts failed").total(), 0);
    assert!(queue.get_job("1").await.expect("Fetch failed").is_none());
}

#[tokio::test]
async fn test_obliterate_force_drops_active_jobs() {
    let redis = TestRedis::new().await;
    let queue = redis.queue("tenants").await;
    let worker = claimer(&queue);

    queue
        .add("work", json!({}), JobOptions::default().in_group("g"))
        .await
        .expect("Failed to add job");
    let mut active = worker
        .get_next_job("token-1")
        .await
        .expect("Claim failed")
        .expect("Expected a claimable job");

    queue.obliterate(true).await.expect("Obliterate failed");

    assert_eq!(queue.get_counts().await.expect("Counts failed").total(), 0);
    let snapshot = queue.get_groups(0, -1).await.expect("Snapshot failed");
    assert!(snapshot.is_empty());

    // The orphaned handle cannot land its result anywhere.
    let err = active.move_to_completed(Value::Null).await.unwrap_err();
    assert!(matches!(err, QueueError::JobNotFound(_)));
}
