//! Tests for EventQueue, QueueManager, and EventConsumer — exercises the
//! FIFO/tap/close invariants and the literal scenarios from the core's
//! specification (S1-S7 below correspond to those named scenarios).

use std::time::Duration;

use a2a_rs::server::{
    ConsumeError, EventConsumer, EventQueue, EventQueueError, InMemoryQueueManager, QueueManager,
};
use a2a_rs::types::*;

fn status_event(task_id: &str, state: TaskState, is_final: bool) -> StreamResponse {
    StreamResponse::StatusUpdate(TaskStatusUpdateEvent {
        task_id: task_id.to_string(),
        context_id: "c1".to_string(),
        kind: "status-update".to_string(),
        status: TaskStatus {
            state,
            message: None,
            timestamp: None,
        },
        r#final: is_final,
        metadata: None,
    })
}

fn task_snapshot(id: &str, state: TaskState) -> Task {
    Task {
        id: id.to_string(),
        context_id: "c1".to_string(),
        kind: "task".to_string(),
        status: TaskStatus {
            state,
            message: None,
            timestamp: None,
        },
        artifacts: None,
        history: None,
        metadata: None,
    }
}

// ============================================================
// EventQueue — construction & boundary behaviors
// ============================================================

#[test]
fn new_rejects_zero_capacity() {
    assert!(matches!(
        EventQueue::new(0),
        Err(EventQueueError::InvalidArgument)
    ));
}

#[test]
fn new_accepts_positive_capacity() {
    assert!(EventQueue::new(1).is_ok());
}

#[tokio::test]
async fn default_capacity_queue_starts_open_and_empty() {
    let queue = EventQueue::with_default_capacity();
    assert!(!queue.is_closed());
    assert!(queue.is_empty().await);
    assert_eq!(queue.max_queue_size().await, a2a_rs::server::event_queue::DEFAULT_CAPACITY);
}

// ============================================================
// S1 — enqueue/dequeue round trip
// ============================================================

#[tokio::test]
async fn s1_enqueue_dequeue_round_trip() {
    let queue = EventQueue::new(16).unwrap();
    let message = StreamResponse::Message(Message::agent("m1", "hello"));

    queue.enqueue(message.clone()).await;
    let received = queue.dequeue(false).await.unwrap();

    match received {
        StreamResponse::Message(m) => assert_eq!(m.message_id, "m1"),
        _ => panic!("expected Message"),
    }
    assert!(queue.is_empty().await);
}

#[tokio::test]
async fn dequeue_no_wait_on_empty_queue_fails_fast() {
    let queue = EventQueue::new(16).unwrap();
    let result = queue.dequeue(true).await;
    assert!(matches!(result, Err(EventQueueError::QueueEmpty)));
}

#[tokio::test]
async fn fifo_order_preserved() {
    let queue = EventQueue::new(16).unwrap();
    queue.enqueue(status_event("t1", TaskState::Submitted, false)).await;
    queue.enqueue(status_event("t1", TaskState::Working, false)).await;
    queue.enqueue(status_event("t1", TaskState::Completed, true)).await;

    for expected in [TaskState::Submitted, TaskState::Working, TaskState::Completed] {
        match queue.dequeue(true).await.unwrap() {
            StreamResponse::StatusUpdate(u) => assert_eq!(u.status.state, expected),
            _ => panic!("expected StatusUpdate"),
        }
    }
}

// ============================================================
// S2 — tap sees only future events
// ============================================================

#[tokio::test]
async fn s2_tap_sees_only_future_events() {
    let queue = EventQueue::new(16).unwrap();

    queue.enqueue(status_event("t1", TaskState::Submitted, false)).await;
    let child = queue.tap().await;
    queue.enqueue(status_event("t1", TaskState::Working, false)).await;

    let received = child.dequeue(true).await.unwrap();
    match received {
        StreamResponse::StatusUpdate(u) => assert_eq!(u.status.state, TaskState::Working),
        _ => panic!("expected StatusUpdate"),
    }
    assert!(matches!(child.dequeue(true).await, Err(EventQueueError::QueueEmpty)));

    // The parent still has its own pre-tap event buffered.
    match queue.dequeue(true).await.unwrap() {
        StreamResponse::StatusUpdate(u) => assert_eq!(u.status.state, TaskState::Submitted),
        _ => panic!("expected StatusUpdate"),
    }
}

#[tokio::test]
async fn tap_of_closed_parent_yields_closed_child() {
    let queue = EventQueue::new(16).unwrap();
    queue.close(false).await;

    let child = queue.tap().await;
    assert!(child.is_closed());
}

#[tokio::test]
async fn recursive_tap_propagates_events() {
    let root = EventQueue::new(16).unwrap();
    let child = root.tap().await;
    let grandchild = child.tap().await;

    root.enqueue(status_event("t1", TaskState::Working, false)).await;

    assert!(grandchild.dequeue(true).await.is_ok());
    assert!(child.dequeue(true).await.is_ok());
    assert!(root.dequeue(true).await.is_ok());
}

// ============================================================
// S3 — immediate close clears and cascades
// ============================================================

#[tokio::test]
async fn s3_immediate_close_clears_and_cascades() {
    let queue = EventQueue::new(16).unwrap();
    queue.enqueue(status_event("t1", TaskState::Working, false)).await;
    let child = queue.tap().await;

    queue.close(true).await;

    assert!(queue.is_empty().await);
    assert!(queue.is_closed());
    assert!(child.is_closed());
}

#[tokio::test]
async fn non_immediate_close_leaves_buffer_for_draining() {
    let queue = EventQueue::new(16).unwrap();
    queue.enqueue(status_event("t1", TaskState::Completed, true)).await;
    queue.close(false).await;

    assert!(!queue.is_empty().await);
    assert!(queue.dequeue(true).await.is_ok());
    assert!(matches!(queue.dequeue(true).await, Err(EventQueueError::QueueEmpty)));
}

#[tokio::test]
async fn closed_queue_silently_drops_enqueue() {
    let queue = EventQueue::new(16).unwrap();
    queue.close(true).await;

    queue.enqueue(status_event("t1", TaskState::Working, false)).await;
    assert!(queue.is_empty().await);
}

#[tokio::test]
async fn children_closed_independently_do_not_affect_parent() {
    let parent = EventQueue::new(16).unwrap();
    let child = parent.tap().await;

    child.close(true).await;

    assert!(!parent.is_closed());
    parent.enqueue(status_event("t1", TaskState::Working, false)).await;
    assert!(parent.dequeue(true).await.is_ok());
}

// ============================================================
// Idempotent close
// ============================================================

#[tokio::test]
async fn close_is_idempotent() {
    let queue = EventQueue::new(16).unwrap();
    queue.enqueue(status_event("t1", TaskState::Working, false)).await;
    queue.close(false).await;
    queue.close(false).await;

    assert!(queue.is_closed());
    assert!(queue.dequeue(true).await.is_ok());
}

#[tokio::test]
async fn blocked_dequeue_unblocks_on_close() {
    let queue = EventQueue::new(16).unwrap();
    let waiter = queue.clone();

    let handle = tokio::spawn(async move { waiter.dequeue(false).await });

    tokio::time::sleep(Duration::from_millis(10)).await;
    queue.close(false).await;

    let result = tokio::time::timeout(Duration::from_secs(1), handle)
        .await
        .expect("dequeue should unblock promptly on close")
        .unwrap();
    assert!(matches!(result, Err(EventQueueError::QueueClosed)));
}

#[tokio::test]
async fn blocked_enqueue_unblocks_and_discards_on_close() {
    let queue = EventQueue::new(1).unwrap();
    queue.enqueue(status_event("t1", TaskState::Working, false)).await;

    let producer = queue.clone();
    let handle = tokio::spawn(async move {
        producer
            .enqueue(status_event("t1", TaskState::Completed, true))
            .await;
    });

    tokio::time::sleep(Duration::from_millis(10)).await;
    queue.close(true).await;

    tokio::time::timeout(Duration::from_secs(1), handle)
        .await
        .expect("blocked enqueue should unblock promptly on close")
        .unwrap();
    assert!(queue.is_empty().await);
}

#[tokio::test]
async fn clear_events_drops_only_this_queues_buffer() {
    let parent = EventQueue::new(16).unwrap();
    let child = parent.tap().await;

    parent.enqueue(status_event("t1", TaskState::Working, false)).await;
    let dropped = parent.clear_events().await;

    assert_eq!(dropped, 1);
    assert!(parent.is_empty().await);
    assert!(child.dequeue(true).await.is_ok());
}

// ============================================================
// EventConsumer
// ============================================================

#[tokio::test]
async fn consume_one_is_non_blocking() {
    let queue = EventQueue::new(16).unwrap();
    let mut consumer = EventConsumer::new(queue.clone());

    assert!(matches!(
        consumer.consume_one().await,
        Err(EventQueueError::QueueEmpty)
    ));

    queue.enqueue(status_event("t1", TaskState::Working, false)).await;
    assert!(consumer.consume_one().await.is_ok());
}

#[tokio::test]
async fn consume_all_stops_on_terminal_status_update() {
    let queue = EventQueue::new(16).unwrap();
    let mut consumer = EventConsumer::new(queue.clone());

    let producer = queue.clone();
    tokio::spawn(async move {
        producer.enqueue(status_event("t1", TaskState::Working, false)).await;
        producer.enqueue(status_event("t1", TaskState::Completed, true)).await;
    });

    let mut seen = Vec::new();
    consumer
        .consume_all(&mut |event: StreamResponse| {
            seen.push(event);
            async { Ok(()) }
        })
        .await
        .unwrap();

    assert_eq!(seen.len(), 2);
    assert!(queue.is_closed());
}

#[tokio::test]
async fn consume_all_stops_on_message() {
    let queue = EventQueue::new(16).unwrap();
    let mut consumer = EventConsumer::new(queue.clone());

    queue
        .enqueue(StreamResponse::Message(Message::agent("m1", "done")))
        .await;

    let mut count = 0;
    consumer
        .consume_all(&mut |_event: StreamResponse| {
            count += 1;
            async { Ok(()) }
        })
        .await
        .unwrap();

    assert_eq!(count, 1);
}

#[tokio::test]
async fn artifact_update_never_ends_consume_all() {
    let queue = EventQueue::new(16).unwrap();
    let mut consumer = EventConsumer::new(queue.clone());

    let producer = queue.clone();
    tokio::spawn(async move {
        let artifact_event = StreamResponse::ArtifactUpdate(TaskArtifactUpdateEvent {
            task_id: "t1".to_string(),
            context_id: "c1".to_string(),
            kind: "artifact-update".to_string(),
            artifact: Artifact {
                artifact_id: "a1".to_string(),
                parts: vec![Part::text("content")],
                name: None,
                description: None,
                metadata: None,
                extensions: None,
            },
            append: None,
            last_chunk: None,
            metadata: None,
        });
        producer.enqueue(artifact_event).await;
        producer.enqueue(status_event("t1", TaskState::Completed, true)).await;
    });

    let mut count = 0;
    consumer
        .consume_all(&mut |_event: StreamResponse| {
            count += 1;
            async { Ok(()) }
        })
        .await
        .unwrap();

    assert_eq!(count, 2);
}

#[tokio::test]
async fn consume_all_surfaces_closed_error_without_terminal_event() {
    let queue = EventQueue::new(16).unwrap();
    let mut consumer = EventConsumer::new(queue.clone());

    let producer = queue.clone();
    tokio::spawn(async move {
        producer.enqueue(status_event("t1", TaskState::Working, false)).await;
        producer.close(false).await;
    });

    let mut count = 0;
    let result = consumer
        .consume_all(&mut |_event: StreamResponse| {
            count += 1;
            async { Ok(()) }
        })
        .await;

    assert_eq!(count, 1);
    assert!(matches!(result, Err(ConsumeError::Closed)));
}

#[tokio::test]
async fn next_yields_none_on_graceful_close() {
    let queue = EventQueue::new(16).unwrap();
    let mut consumer = EventConsumer::new(queue.clone());
    queue.close(false).await;

    assert!(matches!(consumer.next().await, Ok(None)));
}

// ============================================================
// InMemoryQueueManager
// ============================================================

#[tokio::test]
async fn manager_add_and_get_round_trip() {
    let mgr = InMemoryQueueManager::new();
    let queue = EventQueue::new(16).unwrap();

    mgr.add("t1", queue).await.unwrap();
    assert!(mgr.get("t1").await.is_some());
    assert!(mgr.get("missing").await.is_none());
}

// S7 — manager uniqueness
#[tokio::test]
async fn s7_duplicate_add_produces_one_success_and_one_error() {
    let mgr = InMemoryQueueManager::new();
    mgr.add("t1", EventQueue::new(16).unwrap()).await.unwrap();

    let result = mgr.add("t1", EventQueue::new(16).unwrap()).await;
    assert!(matches!(result, Err(EventQueueError::TaskQueueExists)));
}

// S7 — uniqueness holds under concurrent interleaving too.
#[tokio::test]
async fn manager_uniqueness_holds_under_concurrency() {
    use std::sync::Arc;

    let mgr = Arc::new(InMemoryQueueManager::new());
    let mut handles = Vec::new();
    for _ in 0..8 {
        let mgr = Arc::clone(&mgr);
        handles.push(tokio::spawn(async move {
            mgr.add("shared", EventQueue::new(16).unwrap()).await
        }));
    }

    let results: Vec<_> = futures::future::join_all(handles)
        .await
        .into_iter()
        .map(|r| r.unwrap())
        .collect();

    let successes = results.iter().filter(|r| r.is_ok()).count();
    let failures = results.iter().filter(|r| r.is_err()).count();
    assert_eq!(successes, 1);
    assert_eq!(failures, 7);
}

// S7 — the error variant specifically.
#[tokio::test]
async fn manager_close_missing_task_errors() {
    let mgr = InMemoryQueueManager::new();
    let result = mgr.close("missing").await;
    assert!(matches!(result, Err(EventQueueError::NoTaskQueue)));
}

#[tokio::test]
async fn manager_close_removes_binding_and_closes_queue() {
    let mgr = InMemoryQueueManager::new();
    let queue = EventQueue::new(16).unwrap();
    let handle = queue.clone();
    mgr.add("t1", queue).await.unwrap();

    mgr.close("t1").await.unwrap();

    assert!(mgr.get("t1").await.is_none());
    assert!(handle.is_closed());
}

#[tokio::test]
async fn manager_tap_returns_distinct_siblings() {
    let mgr = InMemoryQueueManager::new();
    mgr.add("t1", EventQueue::new(16).unwrap()).await.unwrap();

    let root = mgr.get("t1").await.unwrap();
    root.enqueue(status_event("t1", TaskState::Submitted, false)).await;

    let tap1 = mgr.tap("t1").await.unwrap();
    let tap2 = mgr.tap("t1").await.unwrap();

    root.enqueue(status_event("t1", TaskState::Working, false)).await;

    // Neither tap replays the pre-tap event; both see the post-tap one.
    assert!(tap1.dequeue(true).await.is_ok());
    assert!(matches!(tap1.dequeue(true).await, Err(EventQueueError::QueueEmpty)));
    assert!(tap2.dequeue(true).await.is_ok());
}

#[tokio::test]
async fn manager_tap_of_unbound_task_is_none() {
    let mgr = InMemoryQueueManager::new();
    assert!(mgr.tap("missing").await.is_none());
}

// S4 — manager create_or_tap
#[tokio::test]
async fn s4_create_or_tap_creates_then_taps() {
    let mgr = InMemoryQueueManager::new();

    let q1 = mgr.create_or_tap("t1").await;
    let q2 = mgr.create_or_tap("t1").await;

    // q2 is a distinct tapped child of the bound root, not the root itself.
    let root = mgr.get("t1").await.unwrap();
    root.enqueue(status_event("t1", TaskState::Working, false)).await;

    assert!(q2.dequeue(true).await.is_ok());
    // q1 IS the root that was bound — it should see the same event too.
    assert!(q1.dequeue(true).await.is_ok());
}
