//! Result aggregator — folds a consumed event stream into a final result.
//!
//! Mirrors Python SDK's `ResultAggregator` from
//! `a2a.server.request_handlers.result_aggregator`. Sits downstream of an
//! [`EventConsumer`](super::event_queue::EventConsumer): it drives the
//! consumer to completion, feeds every event through a [`TaskManager`] so
//! persisted task state stays current, and tracks the latest terminal
//! `Message` (if any) so the call's return value can be computed without
//! a second pass over the stream.

use async_trait::async_trait;
use tracing::debug;

use crate::error::A2AResult;
use crate::types::{Message, StreamResponse, Task};

use super::event_queue::{ConsumeError, EventConsumer, EventSink};
use super::task_manager::TaskManager;

/// The aggregator's computed result: either the terminal `Message` an
/// agent produced, or the latest `Task` snapshot known to the
/// `TaskManager`.
///
/// Mirrors the Python SDK's `Message | Task | None` return type,
/// collapsed into a tagged enum rather than a union — there is no `nil`
/// variant because absence is expressed as `Option<AggregatedResult>`.
#[derive(Debug, Clone)]
pub enum AggregatedResult {
    /// A terminal message was observed on the stream.
    Message(Message),
    /// No message was observed; this is the task's current snapshot.
    Task(Task),
}

impl AggregatedResult {
    /// Returns the inner `Message`, if this result is a `Message`.
    pub fn as_message(&self) -> Option<&Message> {
        match self {
            AggregatedResult::Message(m) => Some(m),
            AggregatedResult::Task(_) => None,
        }
    }

    /// Returns the inner `Task`, if this result is a `Task`.
    pub fn as_task(&self) -> Option<&Task> {
        match self {
            AggregatedResult::Task(t) => Some(t),
            AggregatedResult::Message(_) => None,
        }
    }
}

/// Reduces a consumed event stream into a final result while keeping an
/// injected [`TaskManager`] current.
///
/// Mirrors Python SDK's `ResultAggregator(task_manager)`. One aggregator
/// is created per originating RPC call; it owns the `TaskManager` for
/// the duration of that call, the same lifetime the teacher's
/// `TaskManager` already assumes.
pub struct ResultAggregator {
    task_manager: TaskManager,
    /// The latest terminal `Message` observed, if any. Once set, it
    /// takes priority over the `TaskManager`'s task snapshot — mirrors
    /// the Python SDK's `self._message` slot.
    message: Option<Message>,
}

impl ResultAggregator {
    /// Create a new aggregator wrapping the given `TaskManager`.
    pub fn new(task_manager: TaskManager) -> Self {
        Self {
            task_manager,
            message: None,
        }
    }

    /// Drives `consumer` to completion, processing each event through the
    /// `TaskManager` before forwarding it to `sink`.
    ///
    /// Mirrors Python SDK's `ResultAggregator.consume_and_emit(consumer)`.
    /// `task_manager.process(event)` is always invoked and awaited before
    /// the same event reaches `sink` — forwarding never races ahead of
    /// persistence. If `process` fails, the event is not forwarded and
    /// the error is returned; the queue is left open either way (closing
    /// it is the consumer's job, driven by terminal-event detection).
    pub async fn consume_and_emit(
        &mut self,
        consumer: &mut EventConsumer,
        sink: &mut dyn EventSink,
    ) -> Result<(), ConsumeError> {
        struct Forwarding<'a, 's> {
            agg: &'a mut ResultAggregator,
            sink: &'s mut dyn EventSink,
        }

        #[async_trait]
        impl EventSink for Forwarding<'_, '_> {
            async fn on_event(&mut self, event: StreamResponse) -> A2AResult<()> {
                let event = self.agg.ingest(event).await?;
                self.sink.on_event(event).await
            }
        }

        let mut forwarding = Forwarding { agg: self, sink };
        consumer.consume_all(&mut forwarding).await
    }

    /// Drains `consumer` without re-emitting events, returning the
    /// aggregated result.
    ///
    /// If a `Message` is observed, it is remembered and returned
    /// immediately (a `Message` is always a terminal event, so the
    /// underlying `consume_all` loop ends there anyway). Otherwise,
    /// once the stream terminates, returns the `TaskManager`'s current
    /// `Task` snapshot, or `None` if it has none.
    ///
    /// Mirrors Python SDK's `ResultAggregator.consume_all(consumer)`.
    pub async fn consume_all(
        &mut self,
        consumer: &mut EventConsumer,
    ) -> Result<Option<AggregatedResult>, ConsumeError> {
        struct Capture<'a> {
            agg: &'a mut ResultAggregator,
        }

        #[async_trait]
        impl EventSink for Capture<'_> {
            async fn on_event(&mut self, event: StreamResponse) -> A2AResult<()> {
                self.agg.ingest(event).await?;
                Ok(())
            }
        }

        {
            let mut capture = Capture { agg: self };
            consumer.consume_all(&mut capture).await?;
        }

        Ok(self.current_result().await?)
    }

    /// Returns the remembered `Message` if one was observed as terminal,
    /// otherwise the `TaskManager`'s current `Task` snapshot.
    ///
    /// Mirrors Python SDK's `ResultAggregator.current_result` property.
    pub async fn current_result(&mut self) -> A2AResult<Option<AggregatedResult>> {
        if let Some(ref message) = self.message {
            return Ok(Some(AggregatedResult::Message(message.clone())));
        }

        Ok(self
            .task_manager
            .get_task()
            .await?
            .map(AggregatedResult::Task))
    }

    /// Returns a reference to the wrapped `TaskManager`.
    pub fn task_manager(&self) -> &TaskManager {
        &self.task_manager
    }

    /// Processes one event through the `TaskManager` and remembers it if
    /// it is a terminal `Message`. Returns the same event unchanged, so
    /// callers can still forward it.
    async fn ingest(&mut self, event: StreamResponse) -> A2AResult<StreamResponse> {
        if let StreamResponse::Message(ref message) = event {
            debug!(message_id = %message.message_id, "Aggregator observed terminal message");
            self.message = Some(message.clone());
        }
        self.task_manager.process(event).await
    }
}
