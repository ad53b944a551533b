use crate::testing::MemoryJobQueue;
use crate::{JobEnvelope, JobOptions, JobQueue, QueueManager, Worker};
use common::model::message::{PostCommentJob, TopicType};
use errors::{Error, ErrorKind, UpstreamError};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::broadcast;

fn envelope(id: &str, opts: &JobOptions) -> JobEnvelope {
    JobEnvelope::new(id.to_string(), &serde_json::json!({"n": 1}), opts).unwrap()
}

#[tokio::test]
async fn delayed_job_is_promoted_after_its_delay() {
    let queue = MemoryJobQueue::new();
    let (tx, mut rx) = tokio::sync::mpsc::channel(8);
    queue.subscribe("t", tx).await.unwrap();

    let opts = JobOptions::default();
    let started = Instant::now();
    queue
        .enqueue("t", envelope("job-1", &opts), Duration::from_millis(60))
        .await
        .unwrap();

    let delivery = tokio::time::timeout(Duration::from_secs(2), rx.recv())
        .await
        .expect("promotion timed out")
        .expect("channel open");
    assert!(started.elapsed() >= Duration::from_millis(60));
    assert_eq!(delivery.envelope.id, "job-1");
    delivery.ack().await.unwrap();
}

#[tokio::test]
async fn dedup_drops_second_enqueue_until_completion() {
    let queue = MemoryJobQueue::new();
    let opts = JobOptions::default().with_dedup();

    assert!(queue
        .enqueue("t", envelope("interval-9", &opts), Duration::from_secs(60))
        .await
        .unwrap());
    assert!(!queue
        .enqueue("t", envelope("interval-9", &opts), Duration::from_secs(60))
        .await
        .unwrap());

    // Cancelling the parked job releases the id.
    assert!(queue.remove_delayed("t", "interval-9").await.unwrap());
    assert!(queue
        .enqueue("t", envelope("interval-9", &opts), Duration::from_secs(60))
        .await
        .unwrap());
}

#[tokio::test]
async fn worker_retries_transient_until_dead_letter() {
    let queue = MemoryJobQueue::new();
    let (tx, rx) = tokio::sync::mpsc::channel(8);
    queue.subscribe("post-comment", tx).await.unwrap();

    let (shutdown_tx, _) = broadcast::channel(1);
    let worker = Worker::new(
        "post-comment",
        4,
        Duration::from_secs(60),
        queue.clone(),
        shutdown_tx.subscribe(),
    )
    .with_retry_base(Duration::from_millis(10));

    let calls = Arc::new(AtomicU32::new(0));
    let calls_for_handler = calls.clone();
    let handle = tokio::spawn(worker.run::<serde_json::Value, _, _>(rx, move |_job| {
        let calls = calls_for_handler.clone();
        async move {
            calls.fetch_add(1, Ordering::SeqCst);
            Err(Error::new(
                ErrorKind::Upstream,
                Some(UpstreamError::RequestFailed("connection reset".into())),
            ))
        }
    }));

    let opts = JobOptions::default().with_max_attempts(3);
    queue
        .enqueue("post-comment", envelope("job-x", &opts), Duration::ZERO)
        .await
        .unwrap();

    // 3 attempts total: initial + two retries, then the DLQ.
    tokio::time::timeout(Duration::from_secs(5), async {
        while queue.dlq_len("post-comment").await == 0 {
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    })
    .await
    .expect("job never reached the DLQ");

    assert_eq!(calls.load(Ordering::SeqCst), 3);
    let dlq = queue.read_dlq("post-comment", 10).await.unwrap();
    assert_eq!(dlq.len(), 1);
    assert_eq!(dlq[0].1.attempts, 2);

    shutdown_tx.send(()).unwrap();
    let _ = handle.await;
}

#[tokio::test]
async fn worker_dead_letters_terminal_errors_without_retry() {
    let queue = MemoryJobQueue::new();
    let (tx, rx) = tokio::sync::mpsc::channel(8);
    queue.subscribe("post-comment", tx).await.unwrap();

    let (shutdown_tx, _) = broadcast::channel(1);
    let worker = Worker::new(
        "post-comment",
        4,
        Duration::from_secs(60),
        queue.clone(),
        shutdown_tx.subscribe(),
    )
    .with_retry_base(Duration::from_millis(10));

    let calls = Arc::new(AtomicU32::new(0));
    let calls_for_handler = calls.clone();
    let handle = tokio::spawn(worker.run::<serde_json::Value, _, _>(rx, move |_job| {
        let calls = calls_for_handler.clone();
        async move {
            calls.fetch_add(1, Ordering::SeqCst);
            Err(Error::from(UpstreamError::QuotaExceeded))
        }
    }));

    let opts = JobOptions::default().with_max_attempts(3);
    queue
        .enqueue("post-comment", envelope("job-q", &opts), Duration::ZERO)
        .await
        .unwrap();

    tokio::time::timeout(Duration::from_secs(5), async {
        while queue.dlq_len("post-comment").await == 0 {
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    })
    .await
    .expect("job never reached the DLQ");

    // Classified-terminal: exactly one attempt.
    assert_eq!(calls.load(Ordering::SeqCst), 1);

    shutdown_tx.send(()).unwrap();
    let _ = handle.await;
}

#[tokio::test]
async fn manager_routes_post_comment_jobs_with_stable_ids() {
    let queue = MemoryJobQueue::new();
    let manager = QueueManager::new(queue.clone());

    let job = PostCommentJob::new(55, 9);
    assert!(manager
        .enqueue_post_comment(&job, Duration::from_secs(30))
        .await
        .unwrap());
    // Same comment id, second enqueue is suppressed.
    assert!(!manager
        .enqueue_post_comment(&job, Duration::from_secs(30))
        .await
        .unwrap());

    let parked = manager.scheduled_jobs(TopicType::PostComment).await.unwrap();
    assert_eq!(parked.len(), 1);
    assert_eq!(parked[0].id, "post-comment-55");
}
