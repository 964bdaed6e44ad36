//! Event queue — bounded, closable, tappable event channel.
//!
//! Mirrors Python SDK's `EventQueue` from `a2a.server.events.event_queue`:
//! every `EventQueue` has exactly one logical buffer, and fan-out to
//! additional subscribers happens only through [`EventQueue::tap`], which
//! mirrors future enqueues into a fresh child queue.
//!
//! The event queue connects agent executors (producers) to request
//! handlers (consumers). Agents publish [`StreamResponse`] events; the
//! server framework drains them through an [`EventConsumer`] and forwards
//! them to SSE streams or folds them into a final result via a
//! [`ResultAggregator`](super::result_aggregator::ResultAggregator).
//!
//! Also provides [`QueueManager`] trait and [`InMemoryQueueManager`] for
//! managing per-task event queues (mirrors Python SDK's `QueueManager` and
//! `InMemoryQueueManager`), and [`EventConsumer`] for consuming events from
//! a queue (mirrors Python SDK's `EventConsumer`).

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};

use async_trait::async_trait;
use tokio::sync::{Mutex, Notify};
use tracing::{debug, warn};

use crate::types::{StreamResponse, TaskState};

/// Default buffer capacity for the event queue.
pub const DEFAULT_CAPACITY: usize = 1024;

/// Errors raised by [`EventQueue`] operations.
///
/// Mirrors Python SDK's `a2a.server.events` exceptions, consolidated into
/// a single typed enum rather than scattered unit structs.
#[derive(Debug, Clone, thiserror::Error)]
pub enum EventQueueError {
    /// `EventQueue::new` was called with a non-positive capacity.
    #[error("capacity must be greater than zero")]
    InvalidArgument,

    /// `dequeue(no_wait = true)` found nothing buffered.
    #[error("queue is empty")]
    QueueEmpty,

    /// `dequeue` found the queue empty and closed — end of stream.
    #[error("queue is closed")]
    QueueClosed,

    /// `QueueManager::add` was called for a `task_id` that already has a
    /// bound queue.
    #[error("queue already exists for this task")]
    TaskQueueExists,

    /// `QueueManager::get`/`tap`/`close` was called for an unbound
    /// `task_id`.
    #[error("no queue exists for this task")]
    NoTaskQueue,
}

/// Backwards-compatible alias kept for call sites that match on the
/// `TaskQueueExists` condition specifically.
pub type TaskQueueExists = EventQueueError;
/// Backwards-compatible alias kept for call sites that match on the
/// `NoTaskQueue` condition specifically.
pub type NoTaskQueue = EventQueueError;

impl From<EventQueueError> for crate::error::A2AError {
    fn from(err: EventQueueError) -> Self {
        match err {
            EventQueueError::InvalidArgument => crate::error::A2AError::InvalidParams {
                message: err.to_string(),
                data: None,
            },
            EventQueueError::TaskQueueExists => crate::error::A2AError::InvalidRequest {
                message: err.to_string(),
                data: None,
            },
            EventQueueError::NoTaskQueue => crate::error::A2AError::TaskNotFound {
                message: err.to_string(),
                data: None,
            },
            EventQueueError::QueueEmpty | EventQueueError::QueueClosed => {
                crate::error::A2AError::InternalError {
                    message: err.to_string(),
                    data: None,
                }
            }
        }
    }
}

struct Inner {
    buffer: VecDeque<StreamResponse>,
    capacity: usize,
    closed: bool,
    children: Vec<Weak<QueueShared>>,
}

struct QueueShared {
    inner: Mutex<Inner>,
    /// Fast lock-free read for callers that only need `is_closed`.
    closed_flag: AtomicBool,
    /// Woken whenever the buffer gains room, gains an event, or closes.
    not_full: Notify,
    not_empty: Notify,
}

/// A bounded, closable, tappable FIFO channel for A2A streaming events.
///
/// Every `EventQueue` owns a single buffer of capacity `capacity`.
/// [`enqueue`](Self::enqueue) blocks the producer while the buffer is
/// full; [`dequeue`](Self::dequeue) blocks the consumer while the buffer
/// is empty (unless `no_wait` is requested). [`tap`](Self::tap) creates a
/// child queue that mirrors every event enqueued into this queue *after*
/// the tap — not the events already buffered.
///
/// Cloning an `EventQueue` is cheap (it clones the internal `Arc`) and
/// yields a handle to the same underlying buffer, matching the Python
/// SDK's reference-counted `EventQueue` objects.
#[derive(Clone)]
pub struct EventQueue {
    shared: Arc<QueueShared>,
}

impl std::fmt::Debug for EventQueue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventQueue")
            .field("closed", &self.is_closed())
            .field("capacity", &Arc::strong_count(&self.shared))
            .finish()
    }
}

impl EventQueue {
    /// Create a new event queue with the given buffer capacity.
    ///
    /// Mirrors Python SDK's `EventQueue.__init__(max_queue_size)`. Returns
    /// [`EventQueueError::InvalidArgument`] if `capacity` is zero.
    pub fn new(capacity: usize) -> Result<Self, EventQueueError> {
        if capacity == 0 {
            return Err(EventQueueError::InvalidArgument);
        }
        Ok(Self::new_shared(capacity))
    }

    /// Create a new event queue with the default capacity (1024).
    pub fn with_default_capacity() -> Self {
        Self::new_shared(DEFAULT_CAPACITY)
    }

    fn new_shared(capacity: usize) -> Self {
        Self {
            shared: Arc::new(QueueShared {
                inner: Mutex::new(Inner {
                    buffer: VecDeque::with_capacity(capacity.min(64)),
                    capacity,
                    closed: false,
                    children: Vec::new(),
                }),
                closed_flag: AtomicBool::new(false),
                not_full: Notify::new(),
                not_empty: Notify::new(),
            }),
        }
    }

    /// Appends `event` to this queue's buffer and to every tapped child.
    ///
    /// If the queue is closed, the call is a silent no-op (it never
    /// fails — matching Python SDK behavior where a closed queue logs a
    /// warning and returns). If the buffer is at capacity, the producer
    /// is suspended until space frees up or the queue closes; on close
    /// while blocked, the event is discarded.
    ///
    /// Mirrors Python SDK's `EventQueue.enqueue_event(event)`.
    pub async fn enqueue(&self, event: StreamResponse) {
        let children = loop {
            let notified = {
                let mut inner = self.shared.inner.lock().await;

                if inner.closed {
                    warn!("Queue is closed. Event will not be enqueued.");
                    return;
                }

                if inner.buffer.len() < inner.capacity {
                    inner.buffer.push_back(event.clone());
                    debug!(len = inner.buffer.len(), "Enqueued event");
                    self.shared.not_empty.notify_waiters();

                    // Snapshot live children under the parent lock, then
                    // dispatch lock-free (per the spec's concurrency
                    // policy — parents must not hold a child's lock while
                    // holding their own).
                    inner.children.retain(|weak| weak.strong_count() > 0);
                    break inner
                        .children
                        .iter()
                        .filter_map(Weak::upgrade)
                        .collect::<Vec<_>>();
                }

                // At capacity — register intent to wait before releasing
                // the lock, so a concurrent dequeue/close can't slip a
                // wakeup past us.
                self.shared.not_full.notified()
            };

            notified.await;
        };

        // Dispatch to children sequentially, in tap order, preserving
        // this call's relative enqueue order on each child.
        for child in children {
            Box::pin(EventQueue { shared: child }.enqueue(event.clone())).await;
        }
    }

    /// Removes and returns the head of the buffer.
    ///
    /// When `no_wait` is `true`, an empty buffer fails immediately with
    /// [`EventQueueError::QueueEmpty`]. When `no_wait` is `false`, the
    /// caller suspends until an event is enqueued or the queue closes; if
    /// the queue becomes closed while empty, the caller fails with
    /// [`EventQueueError::QueueClosed`].
    pub async fn dequeue(&self, no_wait: bool) -> Result<StreamResponse, EventQueueError> {
        loop {
            let notified = {
                let mut inner = self.shared.inner.lock().await;

                if let Some(event) = inner.buffer.pop_front() {
                    self.shared.not_full.notify_waiters();
                    return Ok(event);
                }

                if no_wait {
                    return Err(EventQueueError::QueueEmpty);
                }

                if inner.closed {
                    return Err(EventQueueError::QueueClosed);
                }

                self.shared.not_empty.notified()
            };

            notified.await;
        }
    }

    /// Create a child queue that receives all future events from this
    /// queue.
    ///
    /// Mirrors Python SDK's `EventQueue.tap()`. Events enqueued into this
    /// queue after `tap` returns appear in the child; events enqueued
    /// before `tap` do NOT retroactively populate it. Tapping a closed
    /// queue yields a queue that is already closed.
    pub async fn tap(&self) -> EventQueue {
        debug!("Tapping EventQueue to create a child queue.");
        let (capacity, parent_closed) = {
            let mut inner = self.shared.inner.lock().await;
            inner.children.retain(|weak| weak.strong_count() > 0);
            (inner.capacity, inner.closed)
        };

        let child = Self::new_shared(capacity);

        if parent_closed {
            child.close(true).await;
            return child;
        }

        let mut inner = self.shared.inner.lock().await;
        if inner.closed {
            drop(inner);
            child.close(true).await;
        } else {
            inner.children.push(Arc::downgrade(&child.shared));
        }

        child
    }

    /// Close the queue, preventing future events from being enqueued.
    ///
    /// Recursively closes all current children. When `immediate` is
    /// `true`, the buffer is also cleared, matching `QueueManager::close`'s
    /// `immediate = true` semantics. A second `close` is idempotent.
    ///
    /// Mirrors Python SDK's `EventQueue.close()`.
    pub async fn close(&self, immediate: bool) {
        let children: Vec<Arc<QueueShared>> = {
            let mut inner = self.shared.inner.lock().await;

            if inner.closed {
                return;
            }

            debug!("Closing EventQueue.");
            inner.closed = true;
            self.shared.closed_flag.store(true, Ordering::Release);

            if immediate {
                inner.buffer.clear();
            }

            inner.children.iter().filter_map(Weak::upgrade).collect()
        };

        // Wake every blocked producer/consumer — both must observe the
        // closed state and unblock promptly.
        self.shared.not_empty.notify_waiters();
        self.shared.not_full.notify_waiters();

        for child in children {
            Box::pin(EventQueue { shared: child }.close(immediate)).await;
        }
    }

    /// Removes and returns the count of events dropped from the buffer.
    /// Does not affect children.
    pub async fn clear_events(&self) -> usize {
        let mut inner = self.shared.inner.lock().await;
        let dropped = inner.buffer.len();
        inner.buffer.clear();
        self.shared.not_full.notify_waiters();
        dropped
    }

    /// Returns `true` if the buffer currently holds no events.
    pub async fn is_empty(&self) -> bool {
        self.shared.inner.lock().await.buffer.is_empty()
    }

    /// Check if the queue has been closed. Lock-free.
    ///
    /// Mirrors Python SDK's `EventQueue.is_closed()`.
    pub fn is_closed(&self) -> bool {
        self.shared.closed_flag.load(Ordering::Acquire)
    }

    /// Returns this queue's configured buffer capacity.
    pub async fn max_queue_size(&self) -> usize {
        self.shared.inner.lock().await.capacity
    }
}

impl Default for EventQueue {
    fn default() -> Self {
        Self::with_default_capacity()
    }
}

// ---------------------------------------------------------------------------
// QueueManager — per-task event queue management
// ---------------------------------------------------------------------------

/// Interface for managing per-task event queue lifecycles.
///
/// Mirrors Python SDK's `QueueManager(ABC)` from
/// `a2a.server.events.queue_manager`. At most one root queue is ever bound
/// per `task_id`; a queue removed from the manager may still be held and
/// drained by an existing subscriber.
#[async_trait]
pub trait QueueManager: Send + Sync {
    /// Bind a new event queue to a task ID.
    ///
    /// Returns `Err(EventQueueError::TaskQueueExists)` if a queue already
    /// exists for this task.
    async fn add(&self, task_id: &str, queue: EventQueue) -> Result<(), EventQueueError>;

    /// Retrieve the event queue bound to a task ID, if any.
    async fn get(&self, task_id: &str) -> Option<EventQueue>;

    /// Create a child (tap) of the event queue bound to a task ID.
    ///
    /// Returns `None` if no queue is bound for the task.
    async fn tap(&self, task_id: &str) -> Option<EventQueue>;

    /// Close and unbind the event queue for a task ID (`immediate = true`
    /// semantics).
    ///
    /// Returns `Err(EventQueueError::NoTaskQueue)` if no queue is bound.
    async fn close(&self, task_id: &str) -> Result<(), EventQueueError>;

    /// Bind a new queue if none exists yet, otherwise tap the existing
    /// one. Intended for the subscribe-or-start idempotent path.
    async fn create_or_tap(&self, task_id: &str) -> EventQueue;
}

/// In-memory implementation of [`QueueManager`].
///
/// Suitable for single-instance deployments. All incoming interactions
/// for a given task ID must hit the same process.
///
/// Mirrors Python SDK's `InMemoryQueueManager` from
/// `a2a.server.events.in_memory_queue_manager`.
pub struct InMemoryQueueManager {
    queues: Mutex<HashMap<String, EventQueue>>,
}

impl InMemoryQueueManager {
    /// Create a new empty queue manager.
    pub fn new() -> Self {
        Self {
            queues: Mutex::new(HashMap::new()),
        }
    }
}

impl Default for InMemoryQueueManager {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl QueueManager for InMemoryQueueManager {
    async fn add(&self, task_id: &str, queue: EventQueue) -> Result<(), EventQueueError> {
        let mut queues = self.queues.lock().await;
        if queues.contains_key(task_id) {
            return Err(EventQueueError::TaskQueueExists);
        }
        queues.insert(task_id.to_string(), queue);
        Ok(())
    }

    async fn get(&self, task_id: &str) -> Option<EventQueue> {
        let queues = self.queues.lock().await;
        queues.get(task_id).cloned()
    }

    async fn tap(&self, task_id: &str) -> Option<EventQueue> {
        // Snapshot the bound queue under the directory lock, then tap
        // it lock-free — `tap` takes its own lock on the queue itself.
        let queue = {
            let queues = self.queues.lock().await;
            queues.get(task_id).cloned()
        };
        match queue {
            Some(queue) => Some(queue.tap().await),
            None => None,
        }
    }

    async fn close(&self, task_id: &str) -> Result<(), EventQueueError> {
        let queue = {
            let mut queues = self.queues.lock().await;
            queues.remove(task_id)
        };
        match queue {
            Some(queue) => {
                queue.close(true).await;
                Ok(())
            }
            None => Err(EventQueueError::NoTaskQueue),
        }
    }

    async fn create_or_tap(&self, task_id: &str) -> EventQueue {
        let mut queues = self.queues.lock().await;
        if let Some(existing) = queues.get(task_id) {
            existing.tap().await
        } else {
            let queue = EventQueue::with_default_capacity();
            queues.insert(task_id.to_string(), queue.clone());
            queue
        }
    }
}

// ---------------------------------------------------------------------------
// EventConsumer — pull-side driver over an EventQueue
// ---------------------------------------------------------------------------

/// Errors surfaced while driving an [`EventConsumer`].
#[derive(Debug, Clone, thiserror::Error)]
pub enum ConsumeError {
    /// The underlying queue reported an [`EventQueueError`].
    #[error(transparent)]
    Queue(#[from] EventQueueError),

    /// The queue closed without ever producing a terminal event.
    #[error("queue closed before a terminal event was produced")]
    Closed,

    /// The sink (or, via [`super::result_aggregator`], the injected
    /// `TaskManager`) failed while handling an event.
    #[error(transparent)]
    Handler(#[from] crate::error::A2AError),
}

impl From<ConsumeError> for crate::error::A2AError {
    fn from(err: ConsumeError) -> Self {
        match err {
            ConsumeError::Queue(e) => e.into(),
            ConsumeError::Closed => crate::error::A2AError::InternalError {
                message: err.to_string(),
                data: None,
            },
            ConsumeError::Handler(e) => e,
        }
    }
}

/// Sink invoked once per event by [`EventConsumer::consume_all`].
///
/// A plain `async fn(StreamResponse) -> A2AResult<()>`-shaped closure
/// satisfies this trait via the blanket implementation below, so callers
/// rarely need to name it explicitly.
#[async_trait]
pub trait EventSink: Send {
    /// Handle one event. An error aborts the consume loop; the offending
    /// event is not considered delivered.
    async fn on_event(&mut self, event: StreamResponse) -> crate::error::A2AResult<()>;
}

#[async_trait]
impl<F, Fut> EventSink for F
where
    F: FnMut(StreamResponse) -> Fut + Send,
    Fut: std::future::Future<Output = crate::error::A2AResult<()>> + Send,
{
    async fn on_event(&mut self, event: StreamResponse) -> crate::error::A2AResult<()> {
        (self)(event).await
    }
}

/// Converts an [`EventQueue`]'s close/terminal semantics into a
/// well-formed iteration protocol.
///
/// Mirrors Python SDK's `EventConsumer` from
/// `a2a.server.events.event_consumer`.
pub struct EventConsumer {
    queue: EventQueue,
}

impl EventConsumer {
    /// Create a new event consumer for the given queue.
    ///
    /// Mirrors Python SDK's `EventConsumer.__init__(queue)`.
    pub fn new(queue: EventQueue) -> Self {
        Self { queue }
    }

    /// A single non-blocking dequeue.
    ///
    /// Mirrors Python SDK's `EventConsumer.consume_one()`.
    pub async fn consume_one(&mut self) -> Result<StreamResponse, EventQueueError> {
        debug!("Attempting to consume one event.");
        self.queue.dequeue(true).await
    }

    /// Repeatedly dequeues (blocking) and invokes `sink` with each event,
    /// returning when either a terminal event has been emitted to `sink`
    /// or the queue is observed empty and closed.
    ///
    /// On queue closure with no terminal event seen, returns
    /// [`ConsumeError::Closed`], distinct from successful termination.
    ///
    /// Mirrors Python SDK's `EventConsumer.consume_all()`.
    pub async fn consume_all(&mut self, sink: &mut dyn EventSink) -> Result<(), ConsumeError> {
        debug!("Starting to consume all events from the queue.");
        loop {
            match self.queue.dequeue(false).await {
                Ok(event) => {
                    let terminal = is_terminal_event(&event);
                    sink.on_event(event).await?;
                    if terminal {
                        debug!("Terminal event observed, closing queue.");
                        self.queue.close(false).await;
                        return Ok(());
                    }
                }
                Err(EventQueueError::QueueClosed) => {
                    debug!("Queue closed without a terminal event.");
                    return Err(ConsumeError::Closed);
                }
                Err(err) => return Err(ConsumeError::Queue(err)),
            }
        }
    }

    /// Pulls the next event, blocking until one arrives or the queue
    /// closes.
    ///
    /// Returns `Ok(None)` on graceful end of stream (closed, empty) —
    /// distinct from `Err` on an underlying queue failure. Intended for
    /// transport adapters that want to forward events one at a time
    /// (e.g. an SSE stream) rather than drive the whole loop through
    /// [`consume_all`](Self::consume_all).
    pub async fn next(&mut self) -> Result<Option<StreamResponse>, EventQueueError> {
        match self.queue.dequeue(false).await {
            Ok(event) => Ok(Some(event)),
            Err(EventQueueError::QueueClosed) => Ok(None),
            Err(err) => Err(err),
        }
    }

    /// Returns `true` once the underlying queue has been closed.
    pub fn is_closed(&self) -> bool {
        self.queue.is_closed()
    }
}

/// Returns `true` if `event` is terminal per the A2A sum-type rules: any
/// `Message`, a `Task`/`TaskStatusUpdateEvent` reaching a terminal state,
/// never an artifact update.
pub fn is_terminal_event(event: &StreamResponse) -> bool {
    match event {
        StreamResponse::Message(_) => true,
        StreamResponse::Task(task) => is_terminal_state(&task.status.state),
        StreamResponse::StatusUpdate(update) => update.r#final,
        StreamResponse::ArtifactUpdate(_) => false,
    }
}

/// Returns `true` if `state` is one of the task-terminal states named in
/// the event sum type's terminality rule.
pub fn is_terminal_state(state: &TaskState) -> bool {
    matches!(
        state,
        TaskState::Completed
            | TaskState::Canceled
            | TaskState::Failed
            | TaskState::Rejected
            | TaskState::InputRequired
            | TaskState::AuthRequired
            | TaskState::Unknown
    )
}
