//! Integration tests against a live Redis server.
//!
//! These tests are ignored by default. Run them with:
//!
//! ```bash
//! EVAL_QUEUE_REDIS_URL=redis://localhost:6379 cargo test --test redis_integration -- --ignored
//! ```
//!
//! Each test uses its own key prefix, so runs never see each other's state.

use std::sync::Arc;
use std::time::Duration;

use eval_queue::QueueError;
use eval_queue::scheduler::{
    executor_fn, ClaimMode, EvaluationJob, EvaluationQueueConfig, EvaluationQueueManager,
    FailOutcome, JobStatus, WorkerPool, WorkerPoolConfig, WorkerConfig,
};
use serde_json::json;

fn redis_url() -> String {
    std::env::var("EVAL_QUEUE_REDIS_URL").unwrap_or_else(|_| "redis://localhost:6379".to_string())
}

fn config(test: &str) -> EvaluationQueueConfig {
    EvaluationQueueConfig::default()
        .with_redis_url(redis_url())
        .with_key_prefix(format!("evalq-test:{}:{}", test, uuid::Uuid::new_v4()))
        .with_max_concurrent_per_model(2)
        .with_max_concurrent_global(3)
}

async fn connect(test: &str) -> EvaluationQueueManager {
    EvaluationQueueManager::connect(config(test))
        .await
        .expect("Redis should be reachable at EVAL_QUEUE_REDIS_URL")
}

fn job(model: &str) -> EvaluationJob {
    EvaluationJob::new(model, json!({"benchmark_spec": {"adapter": "exact_match"}}))
}

#[tokio::test]
#[ignore = "requires Redis"]
async fn test_redis_store_uses_atomic_claims() {
    let queue = connect("atomic").await;
    assert_eq!(queue.claim_mode(), ClaimMode::Atomic);
}

#[tokio::test]
#[ignore = "requires Redis"]
async fn test_redis_priority_order_and_lifecycle() {
    let queue = connect("lifecycle").await;
    let low = queue.enqueue(job("m").with_priority(1)).await.unwrap();
    let high = queue.enqueue(job("m").with_priority(20)).await.unwrap();

    let first = queue.dequeue(Some("m")).await.unwrap().unwrap();
    assert_eq!(first.id, high);
    assert_eq!(first.status, JobStatus::Active);

    assert!(queue
        .complete(&high, json!({"accuracy": 1.0}), Some(25))
        .await
        .unwrap());
    assert_eq!(queue.get_status(&high).await.unwrap(), Some(JobStatus::Completed));

    let second = queue.dequeue(Some("m")).await.unwrap().unwrap();
    assert_eq!(second.id, low);

    let metrics = queue.get_metrics().await.unwrap();
    assert_eq!(metrics.completed_total, 1);
    assert_eq!(metrics.active, 1);
    assert_eq!(metrics.models["m"].active, 1);
}

#[tokio::test]
#[ignore = "requires Redis"]
async fn test_redis_caps_hold_under_concurrent_claims() {
    let queue = Arc::new(connect("caps").await);
    for i in 0..12 {
        let model = if i % 2 == 0 { "a" } else { "b" };
        queue.enqueue(job(model)).await.unwrap();
    }

    let handles: Vec<_> = (0..16)
        .map(|_| {
            let queue = Arc::clone(&queue);
            tokio::spawn(async move { queue.dequeue(None).await })
        })
        .collect();

    let mut claimed = 0;
    for handle in handles {
        if handle.await.unwrap().unwrap().is_some() {
            claimed += 1;
        }
    }

    assert_eq!(claimed, 3);
    assert!(queue.get_active_count(Some("a")).await.unwrap() <= 2);
    assert!(queue.get_active_count(Some("b")).await.unwrap() <= 2);
}

#[tokio::test]
#[ignore = "requires Redis"]
async fn test_redis_retry_then_dead_letter() {
    let queue = EvaluationQueueManager::connect(config("dlq").with_retry_base_delay_seconds(0))
        .await
        .unwrap();
    let id = queue.enqueue(job("m").with_max_attempts(2)).await.unwrap();

    queue.dequeue(None).await.unwrap().unwrap();
    assert!(matches!(
        queue.fail(&id, "first failure").await.unwrap(),
        Some(FailOutcome::Retrying { attempt: 1, .. })
    ));

    // A zero base delay makes the retry due immediately.
    let again = queue.dequeue(None).await.unwrap().unwrap();
    assert_eq!(again.id, id);
    assert_eq!(
        queue.fail(&id, "second failure").await.unwrap(),
        Some(FailOutcome::DeadLettered { attempts: 2 })
    );

    let dlq = queue.get_dlq_jobs(10).await.unwrap();
    assert_eq!(dlq.len(), 1);
    assert_eq!(dlq[0].error_message.as_deref(), Some("second failure"));

    assert!(queue.retry_dlq_job(&id).await.unwrap());
    assert!(queue.get_dlq_jobs(10).await.unwrap().is_empty());
    assert_eq!(queue.dequeue(None).await.unwrap().unwrap().id, id);
}

#[tokio::test]
#[ignore = "requires Redis"]
async fn test_redis_cancel_pending_only() {
    let queue = connect("cancel").await;
    let pending = queue.enqueue(job("m")).await.unwrap();
    let active = queue.enqueue(job("m").with_priority(5)).await.unwrap();
    queue.dequeue(None).await.unwrap();

    assert!(queue.cancel(&pending).await.unwrap());
    assert!(!queue.cancel(&active).await.unwrap());
    assert_eq!(queue.get_queue_depth(Some("m")).await.unwrap(), 0);
    assert_eq!(queue.get_status(&active).await.unwrap(), Some(JobStatus::Active));
}

#[tokio::test]
#[ignore = "requires Redis"]
async fn test_redis_rejects_duplicate_job_id() {
    let queue = connect("duplicate").await;
    let id = queue.enqueue(job("m").with_id("dup")).await.unwrap();
    queue.dequeue(Some("m")).await.unwrap().unwrap();

    let err = queue.enqueue(job("m").with_id("dup")).await.unwrap_err();
    assert!(matches!(err, QueueError::DuplicateJob(_)));
    assert_eq!(queue.get_status(&id).await.unwrap(), Some(JobStatus::Active));
    assert_eq!(queue.get_queue_depth(Some("m")).await.unwrap(), 0);
    assert!(queue.complete(&id, json!({}), None).await.unwrap());
}

#[tokio::test]
#[ignore = "requires Redis"]
async fn test_redis_worker_pool_drains_queue() {
    let config = config("pool").with_max_concurrent_global(4);
    let queue = Arc::new(EvaluationQueueManager::connect(config.clone()).await.unwrap());
    for i in 0..6 {
        queue.enqueue(job(&format!("model-{}", i % 2))).await.unwrap();
    }

    let executor =
        executor_fn(|job: EvaluationJob| async move { Ok(json!({"model": job.model_id})) });
    let pool_config = WorkerPoolConfig::new(3)
        .with_worker(WorkerConfig::from(&config).with_poll_interval(Duration::from_millis(20)))
        .with_shutdown_timeout(Duration::from_secs(10));
    let mut pool = WorkerPool::new(pool_config, Arc::clone(&queue), Arc::new(executor));

    pool.start().await.unwrap();
    let deadline = tokio::time::Instant::now() + Duration::from_secs(15);
    while queue.get_metrics().await.unwrap().completed_total < 6 {
        assert!(tokio::time::Instant::now() < deadline, "pool did not drain the queue");
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    pool.shutdown().await.unwrap();

    assert_eq!(pool.stats().jobs_completed, 6);
    assert_eq!(queue.get_active_count(None).await.unwrap(), 0);
}
