//! Integration tests for conveyor-queue

use conveyor_queue::*;
use parking_lot::Mutex;
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;

fn manager_with(defaults: JobOptions) -> (QueueManager, Arc<dyn QueueBackend>) {
    let engine: Arc<dyn QueueBackend> = Arc::new(MemoryBackend::new());
    let config = ManagerConfig::builder()
        .connection(engine.clone())
        .prefix("it")
        .default_job_options(defaults)
        .build();
    (QueueManager::new(config).unwrap(), engine)
}

fn manager() -> QueueManager {
    manager_with(JobOptions::default()).0
}

fn fast() -> Option<WorkerOptions> {
    Some(WorkerOptions::new().with_poll_interval(Duration::from_millis(10)))
}

/// Record every event name published on `manager`.
fn record(manager: &QueueManager, kinds: &[EventKind]) -> Arc<Mutex<Vec<String>>> {
    let seen = Arc::new(Mutex::new(Vec::new()));
    for kind in kinds {
        let seen = seen.clone();
        manager.subscribe(
            *kind,
            listener(move |event| seen.lock().push(event.kind().to_string())),
        );
    }
    seen
}

async fn wait_until<F>(queue: &QueueHandle, done: F) -> JobCounts
where
    F: Fn(&JobCounts) -> bool,
{
    for _ in 0..300 {
        let counts = queue.counts().await.unwrap();
        if done(&counts) {
            return counts;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("queue {} did not reach the expected state", queue.name());
}

#[tokio::test]
async fn test_create_queue_twice_returns_same_handle() {
    let manager = manager();
    let created = record(&manager, &[EventKind::QueueCreated]);

    let first = manager.create_queue("emails", None).unwrap();
    let second = manager.create_queue("emails", None).unwrap();

    assert!(Arc::ptr_eq(&first, &second));
    assert_eq!(*created.lock(), vec!["queueCreated"]);
    assert_eq!(manager.get_all_queues().len(), 1);
}

#[tokio::test]
async fn test_create_worker_twice_returns_same_handle() {
    let manager = manager();
    let created = record(&manager, &[EventKind::WorkerCreated]);

    let first = manager
        .create_worker("emails", processor_fn(|_job| async { Ok(JobResult::done()) }), fast())
        .unwrap();
    let second = manager
        .create_worker("emails", processor_fn(|_job| async { Ok(JobResult::done()) }), fast())
        .unwrap();

    assert!(Arc::ptr_eq(&first, &second));
    assert_eq!(created.lock().len(), 1);
    assert!(manager.get_worker("emails").is_some());

    manager.close_all().await.unwrap();
}

#[tokio::test]
async fn test_add_job_merges_default_options() {
    let defaults = JobOptions::new()
        .with_attempts(3)
        .with_backoff(Backoff::exponential(2000))
        .with_priority(5);
    let (manager, _) = manager_with(defaults);
    manager.create_queue("emails", None).unwrap();

    let job = manager
        .add_job(
            "emails",
            json!({"to": "user@example.com"}),
            Some(JobOptions::new().with_priority(1)),
        )
        .await
        .unwrap();

    assert_eq!(job.name, "emails");
    assert_eq!(job.options.priority, Some(1));
    assert_eq!(job.options.attempts, Some(3));
    assert_eq!(job.options.backoff, Some(Backoff::exponential(2000)));
}

#[tokio::test]
async fn test_add_job_without_options_uses_defaults() {
    let (manager, _) = manager_with(JobOptions::new().with_attempts(2));
    manager.create_queue("emails", None).unwrap();

    let job = manager.add_job("emails", json!({}), None).await.unwrap();
    assert_eq!(job.options, JobOptions::new().with_attempts(2));
}

#[tokio::test]
async fn test_add_job_to_unknown_queue_fails_without_side_effects() {
    let (manager, engine) = manager_with(JobOptions::default());

    let err = manager.add_job("X", json!({}), None).await.unwrap_err();

    assert!(matches!(&err, QueueError::QueueNotFound(name) if name == "X"));
    assert_eq!(
        err.to_string(),
        "Queue X not found. Create it first using create_queue()"
    );
    assert!(manager.get_queue("X").is_none());
    assert_eq!(engine.counts("it", "X").await.unwrap(), JobCounts::default());
}

#[tokio::test]
async fn test_self_redirect_completes_original_and_schedules_copy() {
    let manager = manager();
    let queue = manager.create_queue("A", None).unwrap();
    manager
        .create_worker(
            "A",
            processor_fn(|_job| async {
                Ok(JobResult::failed("try later").move_to_delay(5000))
            }),
            fast(),
        )
        .unwrap();

    let original = manager
        .add_job("A", json!({"n": 1}), Some(JobOptions::new().with_attempts(4)))
        .await
        .unwrap();
    let counts = wait_until(&queue, |c| c.completed == 1).await;
    assert_eq!(counts.delayed, 1);

    let stored = queue.get_job(&original.id).await.unwrap().unwrap();
    assert_eq!(stored.state, JobState::Completed);
    let reported = stored.return_value.unwrap();
    assert_eq!(reported["success"], json!(true));
    assert_eq!(
        reported["data"],
        json!({"movedToDelay": true, "targetQueue": "A", "delay": 5000})
    );

    let copy = queue.get_job("2").await.unwrap().unwrap();
    assert_eq!(copy.data, json!({"n": 1}));
    assert_eq!(copy.options.delay, Some(5000));
    assert_eq!(copy.options.attempts, Some(4));

    let logs = queue.job_logs(&original.id).await.unwrap();
    assert_eq!(logs.len(), 1);

    manager.close_all().await.unwrap();
}

#[tokio::test]
async fn test_redirect_to_registered_queue() {
    let manager = manager();
    let source = manager.create_queue("A", None).unwrap();
    let target = manager.create_queue("B", None).unwrap();
    manager
        .create_worker(
            "A",
            processor_fn(|_job| async {
                Ok(JobResult::ok(json!({"step": 1})).move_to_queue("B", 1000))
            }),
            fast(),
        )
        .unwrap();

    manager.add_job("A", json!({"n": 1}), None).await.unwrap();
    wait_until(&source, |c| c.completed == 1).await;

    let counts = target.counts().await.unwrap();
    assert_eq!(counts.delayed, 1);
    let copy = target.get_job("1").await.unwrap().unwrap();
    assert_eq!(copy.queue, "B");
    assert_eq!(copy.name, "A");
    assert_eq!(copy.data, json!({"n": 1}));

    manager.close_all().await.unwrap();
}

#[tokio::test]
async fn test_redirected_job_runs_on_target_worker() {
    let manager = manager();
    manager.create_queue("A", None).unwrap();
    let target = manager.create_queue("B", None).unwrap();
    let seen = Arc::new(Mutex::new(Vec::new()));

    manager
        .create_worker(
            "A",
            processor_fn(|_job| async { Ok(JobResult::done().move_to_queue("B", 20)) }),
            fast(),
        )
        .unwrap();
    let log = seen.clone();
    manager
        .create_worker(
            "B",
            processor_fn(move |job| {
                let log = log.clone();
                async move {
                    log.lock().push(job.data.clone());
                    Ok(JobResult::done())
                }
            }),
            fast(),
        )
        .unwrap();

    manager.add_job("A", json!({"hop": true}), None).await.unwrap();
    wait_until(&target, |c| c.completed == 1).await;

    assert_eq!(*seen.lock(), vec![json!({"hop": true})]);
    manager.close_all().await.unwrap();
}

#[tokio::test]
async fn test_redirect_to_unknown_queue_fails_job() {
    let manager = manager();
    let source = manager.create_queue("A", None).unwrap();
    manager
        .create_worker(
            "A",
            processor_fn(|_job| async { Ok(JobResult::done().move_to_queue("B", 1000)) }),
            fast(),
        )
        .unwrap();

    let job = manager.add_job("A", json!({}), None).await.unwrap();
    wait_until(&source, |c| c.failed == 1).await;

    let stored = source.get_job(&job.id).await.unwrap().unwrap();
    assert!(
        stored
            .failed_reason
            .unwrap()
            .contains("Target queue B not found for redirection")
    );
    assert!(manager.get_queue("B").is_none());

    manager.close_all().await.unwrap();
}

#[tokio::test]
async fn test_failed_attempts_are_retried() {
    let manager = manager();
    let queue = manager.create_queue("flaky", None).unwrap();
    let calls = Arc::new(Mutex::new(0u32));
    let counter = calls.clone();
    manager
        .create_worker(
            "flaky",
            processor_fn(move |_job| {
                let counter = counter.clone();
                async move {
                    let mut calls = counter.lock();
                    *calls += 1;
                    if *calls < 3 {
                        Err(QueueError::processing("not yet"))
                    } else {
                        Ok(JobResult::done())
                    }
                }
            }),
            fast(),
        )
        .unwrap();

    let job = manager
        .add_job("flaky", json!({}), Some(JobOptions::new().with_attempts(3)))
        .await
        .unwrap();
    wait_until(&queue, |c| c.completed == 1).await;

    let stored = queue.get_job(&job.id).await.unwrap().unwrap();
    assert_eq!(stored.attempts_made, 3);
    assert_eq!(*calls.lock(), 3);

    manager.close_all().await.unwrap();
}

#[tokio::test]
async fn test_close_all_emits_closed_once_after_removals() {
    let manager = manager();
    let events = record(
        &manager,
        &[
            EventKind::QueueRemoved,
            EventKind::WorkerRemoved,
            EventKind::QueueManagerClosed,
        ],
    );

    for name in ["a", "b", "c"] {
        manager.create_queue(name, None).unwrap();
    }
    manager
        .create_worker("a", processor_fn(|_job| async { Ok(JobResult::done()) }), fast())
        .unwrap();

    manager.close_all().await.unwrap();
    manager.close_all().await.unwrap();

    let events = events.lock();
    assert_eq!(events.len(), 5);
    assert_eq!(events.last().map(String::as_str), Some("queueManagerClosed"));
    assert_eq!(
        events.iter().filter(|e| *e == "queueManagerClosed").count(),
        1
    );
    assert!(manager.get_all_queues().is_empty());
    assert!(manager.get_all_workers().is_empty());
}

#[tokio::test]
async fn test_closing_unknown_names_is_silent() {
    let manager = manager();
    let events = record(&manager, &[EventKind::QueueRemoved, EventKind::WorkerRemoved]);

    manager.close_queue("nope").await.unwrap();
    manager.close_worker("nope").await.unwrap();

    assert!(events.lock().is_empty());
}

#[tokio::test]
async fn test_concurrent_close_emits_once() {
    let manager = Arc::new(manager());
    let events = record(&manager, &[EventKind::QueueRemoved]);
    manager.create_queue("emails", None).unwrap();

    let a = manager.clone();
    let b = manager.clone();
    let (ra, rb) = tokio::join!(a.close_queue("emails"), b.close_queue("emails"));
    ra.unwrap();
    rb.unwrap();

    assert_eq!(events.lock().len(), 1);
}

#[tokio::test]
async fn test_queue_removed_carries_handle() {
    let manager = manager();
    let removed = Arc::new(Mutex::new(None));
    let slot = removed.clone();
    manager.subscribe(
        EventKind::QueueRemoved,
        listener(move |event| {
            if let ManagerEvent::QueueRemoved(queue) = event {
                *slot.lock() = Some(queue.clone());
            }
        }),
    );

    let queue = manager.create_queue("emails", None).unwrap();
    manager.close_queue("emails").await.unwrap();

    let removed = removed.lock().clone().unwrap();
    assert!(Arc::ptr_eq(&removed, &queue));
    assert!(removed.is_closed());
}

#[tokio::test]
async fn test_listener_subscription_events() {
    let manager = manager();
    let seen = record(&manager, &[EventKind::NewListener, EventKind::RemoveListener]);

    let on_closed = listener(|_| {});
    manager.subscribe(EventKind::QueueManagerClosed, on_closed.clone());
    assert!(manager.unsubscribe(EventKind::QueueManagerClosed, &on_closed));
    assert!(!manager.unsubscribe(EventKind::QueueManagerClosed, &on_closed));

    // The recorder announces its own two subscriptions as well.
    assert_eq!(
        *seen.lock(),
        vec![
            "newListener",
            "newListener",
            "newListener",
            "removeListener",
            "removeListener"
        ]
    );
}

#[tokio::test]
async fn test_listener_may_call_back_into_manager() {
    let manager = Arc::new(manager());
    let inner = Arc::downgrade(&manager);
    let seen = Arc::new(Mutex::new(0usize));
    let count = seen.clone();

    manager.subscribe(
        EventKind::QueueCreated,
        listener(move |_| {
            if let Some(manager) = inner.upgrade() {
                *count.lock() = manager.get_all_queues().len();
            }
        }),
    );
    manager.create_queue("emails", None).unwrap();

    assert_eq!(*seen.lock(), 1);
}

#[tokio::test]
async fn test_shutdown_rejects_new_entities() {
    let manager = manager();
    let queue = manager.create_queue("emails", None).unwrap();
    manager.close_all().await.unwrap();

    assert!(matches!(
        manager.create_queue("other", None),
        Err(QueueError::ConnectionClosed)
    ));
    assert!(matches!(
        manager.create_worker("other", processor_fn(|_job| async { Ok(JobResult::done()) }), None),
        Err(QueueError::ConnectionClosed)
    ));
    assert!(matches!(
        queue.add("emails", json!({}), JobOptions::default()).await,
        Err(QueueError::QueueClosed(_))
    ));
}

#[tokio::test]
async fn test_managers_sharing_an_engine_are_independent() {
    let engine: Arc<dyn QueueBackend> = Arc::new(MemoryBackend::new());
    let first = QueueManager::new(ManagerConfig::new(engine.clone())).unwrap();
    let second = QueueManager::new(ManagerConfig::new(engine.clone())).unwrap();

    first.create_queue("emails", None).unwrap();
    second.create_queue("emails", None).unwrap();
    first.add_job("emails", json!({}), None).await.unwrap();

    first.close_all().await.unwrap();

    let job = second.add_job("emails", json!({}), None).await.unwrap();
    assert_eq!(job.id, "2");
    assert!(!engine.is_closed());
}

#[tokio::test]
#[ignore = "requires Redis"]
async fn test_redirect_round_trip_against_redis() {
    let prefix = format!("conveyor-it-{}", uuid::Uuid::new_v4());
    let config = ManagerConfig::builder()
        .redis(conveyor_redis::RedisConfig::default())
        .prefix(prefix)
        .build();
    let manager = QueueManager::new(config).unwrap();

    let source = manager.create_queue("A", None).unwrap();
    let target = manager.create_queue("B", None).unwrap();
    manager
        .create_worker(
            "A",
            processor_fn(|_job| async { Ok(JobResult::done().move_to_queue("B", 60_000)) }),
            fast(),
        )
        .unwrap();

    manager.add_job("A", json!({"n": 1}), None).await.unwrap();
    wait_until(&source, |c| c.completed == 1).await;
    assert_eq!(target.counts().await.unwrap().delayed, 1);

    manager.close_all().await.unwrap();
}
