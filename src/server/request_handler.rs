//! Request handler — coordinates agent execution, task storage, and event delivery.
//!
//! Mirrors Python SDK's `RequestHandler(ABC)` and `DefaultRequestHandler` from
//! `a2a.server.request_handlers`.
//!
//! The [`RequestHandler`] trait defines the interface that the axum integration
//! layer calls for each JSON-RPC method. [`DefaultRequestHandler`] provides
//! the standard implementation that wires together an [`AgentExecutor`],
//! [`TaskStore`], and the event fan-out core (`QueueManager`, `EventConsumer`,
//! `ResultAggregator`).

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tracing::{debug, error};
use uuid::Uuid;

use crate::error::{A2AError, A2AResult};
use crate::types::{
    Message, Part, SendMessageResponse, StreamResponse, Task, TaskState, TaskStatus,
    TaskStatusUpdateEvent,
};

use super::agent_executor::{AgentExecutor, RequestContext};
use super::event_queue::{
    EventConsumer, EventQueue, EventSink, InMemoryQueueManager, QueueManager,
};
use super::result_aggregator::{AggregatedResult, ResultAggregator};
use super::task_manager::TaskManager;
use super::task_store::{TaskListParams, TaskListResponse, TaskStore};

/// Parameters for `message/send` and `message/stream`.
#[derive(Debug, Clone)]
pub struct SendMessageParams {
    /// The message to send to the agent.
    pub message: Message,

    /// Optional configuration for the send operation.
    pub configuration: Option<SendMessageConfiguration>,

    /// Optional metadata attached to the request.
    pub metadata: Option<serde_json::Value>,

    /// Optional tenant identifier.
    pub tenant: Option<String>,
}

/// Configuration options for message sending.
#[derive(Debug, Clone)]
pub struct SendMessageConfiguration {
    /// Accepted output MIME types / modes.
    pub accepted_output_modes: Option<Vec<String>>,

    /// If `true`, the server should block until the task completes.
    /// If `false` or `None`, the server may return immediately with a
    /// `submitted` or `working` task.
    pub blocking: Option<bool>,

    /// Maximum number of history messages to include in the response.
    pub history_length: Option<usize>,

    /// Push notification configuration.
    pub push_notification_config: Option<serde_json::Value>,
}

/// Parameters for `tasks/get`.
#[derive(Debug, Clone)]
pub struct GetTaskParams {
    /// The task ID to retrieve.
    pub id: String,

    /// Maximum number of history messages to include.
    pub history_length: Option<usize>,

    /// Optional metadata.
    pub metadata: Option<serde_json::Value>,

    /// Optional tenant identifier.
    pub tenant: Option<String>,
}

/// Parameters for `tasks/cancel`.
#[derive(Debug, Clone)]
pub struct CancelTaskParams {
    /// The task ID to cancel.
    pub id: String,

    /// Optional metadata.
    pub metadata: Option<serde_json::Value>,

    /// Optional tenant identifier.
    pub tenant: Option<String>,
}

/// Parameters for `tasks/subscribe`.
#[derive(Debug, Clone)]
pub struct SubscribeToTaskParams {
    /// The task ID to subscribe to.
    pub id: String,

    /// Optional metadata.
    pub metadata: Option<serde_json::Value>,

    /// Optional tenant identifier.
    pub tenant: Option<String>,
}

/// Trait for handling A2A JSON-RPC requests.
///
/// Each method corresponds to an A2A JSON-RPC method. The axum integration
/// layer dispatches incoming requests to these methods.
///
/// Mirrors Python SDK's `RequestHandler(ABC)` from
/// `a2a.server.request_handlers.request_handler`.
#[async_trait]
pub trait RequestHandler: Send + Sync {
    /// Handle `message/send` — execute agent logic and return the completed task or message.
    async fn on_message_send(&self, params: SendMessageParams) -> A2AResult<SendMessageResponse>;

    /// Handle `message/stream` — execute agent logic and return an event stream.
    async fn on_message_send_stream(&self, params: SendMessageParams) -> A2AResult<EventConsumer>;

    /// Handle `tasks/get` — retrieve a task by ID.
    async fn on_get_task(&self, params: GetTaskParams) -> A2AResult<Task>;

    /// Handle `tasks/list` — list tasks matching filter criteria.
    async fn on_list_tasks(&self, params: TaskListParams) -> A2AResult<TaskListResponse>;

    /// Handle `tasks/cancel` — cancel a running task.
    async fn on_cancel_task(&self, params: CancelTaskParams) -> A2AResult<Task>;

    /// Handle `tasks/resubscribe` — re-subscribe to events for a running task.
    ///
    /// Allows a client to re-attach to a running streaming task's event stream.
    /// Default implementation returns `UnsupportedOperation`.
    async fn on_resubscribe_to_task(
        &self,
        params: SubscribeToTaskParams,
    ) -> A2AResult<EventConsumer> {
        let _ = params;
        Err(A2AError::UnsupportedOperation {
            message: "tasks/resubscribe is not supported".to_string(),
            data: None,
        })
    }

    /// Handle `tasks/subscribe` — subscribe to events for an existing task.
    async fn on_subscribe_to_task(&self, params: SubscribeToTaskParams) -> A2AResult<EventConsumer>;

    /// Handle `tasks/pushNotificationConfig/set`.
    ///
    /// Default implementation returns `UnsupportedOperation`.
    async fn on_set_task_push_notification_config(
        &self,
        _params: serde_json::Value,
    ) -> A2AResult<serde_json::Value> {
        Err(A2AError::UnsupportedOperation {
            message: "Push notification config is not supported".to_string(),
            data: None,
        })
    }

    /// Handle `tasks/pushNotificationConfig/get`.
    ///
    /// Default implementation returns `UnsupportedOperation`.
    async fn on_get_task_push_notification_config(
        &self,
        _params: serde_json::Value,
    ) -> A2AResult<serde_json::Value> {
        Err(A2AError::UnsupportedOperation {
            message: "Push notification config is not supported".to_string(),
            data: None,
        })
    }

    /// Handle `tasks/pushNotificationConfig/list`.
    ///
    /// Default implementation returns `UnsupportedOperation`.
    async fn on_list_task_push_notification_config(
        &self,
        _params: serde_json::Value,
    ) -> A2AResult<serde_json::Value> {
        Err(A2AError::UnsupportedOperation {
            message: "Push notification config is not supported".to_string(),
            data: None,
        })
    }

    /// Handle `tasks/pushNotificationConfig/delete`.
    ///
    /// Default implementation returns `UnsupportedOperation`.
    async fn on_delete_task_push_notification_config(
        &self,
        _params: serde_json::Value,
    ) -> A2AResult<()> {
        Err(A2AError::UnsupportedOperation {
            message: "Push notification config is not supported".to_string(),
            data: None,
        })
    }
}

/// Tracks the spawned tokio task driving a running agent execution.
///
/// The event queue itself lives in the [`QueueManager`], not here — this
/// map exists only so `on_cancel_task` can abort the producer and so other
/// methods can tell whether a task currently has a live producer.
struct RunningAgent {
    handle: JoinHandle<()>,
}

/// Default request handler — standard implementation wiring executor, store, and events.
///
/// This is the primary implementation of [`RequestHandler`] that coordinates:
/// - An [`AgentExecutor`] for running agent logic
/// - A [`TaskStore`] for persisting task state
/// - A [`QueueManager`] handing out the per-task [`EventQueue`] to every
///   subscriber (the originating call, `tasks/subscribe`, `tasks/resubscribe`)
///
/// # Lifecycle
///
/// 1. `on_message_send` or `on_message_send_stream` creates a new task (or looks up
///    an existing one by context ID), binds a fresh `EventQueue` to the task id
///    in the `QueueManager`, and spawns the agent executor against it.
/// 2. The executor publishes events to that queue.
/// 3. For `message/send`: the queue is drained directly by an [`EventConsumer`]
///    wrapped in a [`ResultAggregator`], which folds the stream into the final
///    `Task`/`Message` while feeding every event through a [`TaskManager`] so
///    persisted state stays current.
/// 4. For `message/stream`: the aggregation happens in a background task off a
///    tapped child queue, re-emitting every event onto a fresh output queue,
///    which is handed back to the caller as an `EventConsumer` for SSE delivery.
/// 5. `on_cancel_task` calls the executor's cancel method against the queue the
///    execution is already bound to, then drains it to the cancellation's
///    terminal event via the same aggregator path.
pub struct DefaultRequestHandler {
    executor: Arc<dyn AgentExecutor>,
    task_store: Arc<dyn TaskStore>,
    queue_manager: Arc<dyn QueueManager>,
    /// Handles of in-flight agent executions, keyed by task id. Shared via
    /// `Arc` so the background task spawned by `on_message_send_stream` can
    /// remove its own entry once its stream ends.
    running_agents: Arc<Mutex<HashMap<String, RunningAgent>>>,
}

impl DefaultRequestHandler {
    /// Create a new default request handler backed by an in-memory
    /// `QueueManager`.
    pub fn new(executor: Arc<dyn AgentExecutor>, task_store: Arc<dyn TaskStore>) -> Self {
        Self::with_queue_manager(executor, task_store, Arc::new(InMemoryQueueManager::new()))
    }

    /// Create a new default request handler with an explicit `QueueManager`
    /// — useful for multi-instance deployments backed by a shared queue
    /// directory.
    pub fn with_queue_manager(
        executor: Arc<dyn AgentExecutor>,
        task_store: Arc<dyn TaskStore>,
        queue_manager: Arc<dyn QueueManager>,
    ) -> Self {
        Self {
            executor,
            task_store,
            queue_manager,
            running_agents: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// Build a `TaskManager` scoped to one task, backed by this handler's
    /// `TaskStore`.
    fn new_task_manager(&self, task_id: &str, context_id: &str) -> A2AResult<TaskManager> {
        TaskManager::new(
            Some(task_id.to_string()),
            Some(context_id.to_string()),
            Box::new(Arc::clone(&self.task_store)),
            None,
        )
    }

    /// Create or retrieve a task for the given message.
    ///
    /// Mirrors Python SDK's `_setup_message_execution` task resolution logic:
    /// 1. If `task_id` is set, look up the existing task and validate state.
    /// 2. If the task exists but is terminal, return `InvalidParams`.
    /// 3. If `task_id` is set but doesn't exist, return `TaskNotFound`.
    /// 4. Otherwise create a new task in `submitted` state.
    async fn get_or_create_task(&self, params: &SendMessageParams) -> A2AResult<Task> {
        // Check if the message references an existing task.
        if let Some(ref task_id) = params.message.task_id {
            if let Some(task) = self.task_store.get(task_id).await? {
                // Verify it's not in a terminal state (mirrors Python SDK check).
                if Self::is_terminal(&task.status.state) {
                    return Err(A2AError::InvalidParams {
                        message: format!(
                            "Task {} is in terminal state: {}",
                            task_id, task.status.state
                        ),
                        data: None,
                    });
                }
                // Add the new message to history (mirrors Python's update_with_message).
                // Python SDK moves status.message to history first, then clears it.
                let mut updated_task = task;
                if let Some(ref status_msg) = updated_task.status.message {
                    let history = updated_task.history.get_or_insert_with(Vec::new);
                    history.push(status_msg.clone());
                    updated_task.status.message = None;
                }
                let history = updated_task.history.get_or_insert_with(Vec::new);
                history.push(params.message.clone());
                self.task_store.save(updated_task.clone()).await?;
                return Ok(updated_task);
            } else {
                // task_id was specified but doesn't exist (mirrors Python SDK).
                return Err(A2AError::TaskNotFound {
                    message: format!("Task {} was specified but does not exist", task_id),
                    data: None,
                });
            }
        }

        // Create a new task.
        let task_id = Uuid::new_v4().to_string();
        let context_id = params
            .message
            .context_id
            .clone()
            .unwrap_or_else(|| Uuid::new_v4().to_string());

        let task = Task {
            id: task_id,
            context_id,
            kind: "task".to_string(),
            status: TaskStatus {
                state: TaskState::Submitted,
                message: None,
                timestamp: Some(chrono::Utc::now().to_rfc3339()),
            },
            artifacts: None,
            history: Some(vec![params.message.clone()]),
            metadata: params.metadata.clone(),
        };

        self.task_store.save(task.clone()).await?;
        debug!(task_id = %task.id, "Created new task");

        Ok(task)
    }

    /// Spawn the agent executor for a task, binding a fresh [`EventQueue`] to
    /// it in the `QueueManager`.
    ///
    /// Mirrors Python SDK's `_run_event_stream` — executes the agent and
    /// closes the queue afterwards. Does NOT auto-publish a `Working` status;
    /// that is the responsibility of the `AgentExecutor` implementation
    /// (matching the Python SDK where `_run_event_stream` just calls
    /// `execute` + `close`).
    async fn spawn_executor(
        &self,
        task: &Task,
        message: &Message,
        configuration: Option<&SendMessageConfiguration>,
    ) -> A2AResult<EventQueue> {
        let event_queue = EventQueue::with_default_capacity();
        self.queue_manager
            .add(&task.id, event_queue.clone())
            .await?;

        // Convert the request_handler's SendMessageConfiguration to the
        // types.rs SendMessageConfiguration used by RequestContext.
        let types_config = configuration.map(|c| crate::types::SendMessageConfiguration {
            accepted_output_modes: c.accepted_output_modes.clone(),
            push_notification_config: c
                .push_notification_config
                .as_ref()
                .and_then(|v| serde_json::from_value(v.clone()).ok()),
            history_length: c.history_length.map(|h| h as i32),
            blocking: c.blocking,
        });

        let context = RequestContext {
            task_id: task.id.clone(),
            context_id: task.context_id.clone(),
            message: Some(message.clone()),
            task: Some(task.clone()),
            configuration: types_config,
            related_tasks: Vec::new(),
            metadata: task.metadata.clone(),
            call_context: None,
        };

        let executor = Arc::clone(&self.executor);
        let queue_clone = event_queue.clone();
        let task_id = task.id.clone();
        let context_id = task.context_id.clone();
        let running_agents = Arc::clone(&self.running_agents);

        let handle = tokio::spawn(async move {
            // Execute the agent — state transitions (working, etc.) are the
            // agent's responsibility, matching the Python SDK pattern.
            if let Err(e) = executor.execute(context, queue_clone.clone()).await {
                error!(task_id = %task_id, error = %e, "Agent execution failed");

                // Publish a failed status (matches Python SDK behavior where
                // execution errors result in a failed task).
                let failed_event = StreamResponse::StatusUpdate(TaskStatusUpdateEvent {
                    task_id: task_id.clone(),
                    context_id: context_id.clone(),
                    kind: "status-update".to_string(),
                    status: TaskStatus {
                        state: TaskState::Failed,
                        message: Some(Message {
                            message_id: Uuid::new_v4().to_string(),
                            role: crate::types::Role::Agent,
                            kind: "message".to_string(),
                            parts: vec![Part::text(format!("Agent execution failed: {}", e))],
                            context_id: None,
                            task_id: Some(task_id.clone()),
                            metadata: None,
                            extensions: None,
                            reference_task_ids: None,
                        }),
                        timestamp: Some(chrono::Utc::now().to_rfc3339()),
                    },
                    r#final: true,
                    metadata: None,
                });
                queue_clone.enqueue(failed_event).await;
            }

            queue_clone.close(false).await;
            running_agents.lock().await.remove(&task_id);
        });

        // Track the running agent (mirrors Python's _register_producer).
        let mut running = self.running_agents.lock().await;
        running.insert(task.id.clone(), RunningAgent { handle });

        Ok(event_queue)
    }

    /// Drains `consumer` through a fresh [`ResultAggregator`] scoped to
    /// `task_id`/`context_id`, returning the final aggregated result.
    async fn aggregate(
        &self,
        task_id: &str,
        context_id: &str,
        consumer: &mut EventConsumer,
    ) -> A2AResult<Option<AggregatedResult>> {
        let task_manager = self.new_task_manager(task_id, context_id)?;
        let mut aggregator = ResultAggregator::new(task_manager);
        Ok(aggregator.consume_all(consumer).await?)
    }

    /// Check if a state is terminal.
    fn is_terminal(state: &TaskState) -> bool {
        matches!(
            state,
            TaskState::Completed | TaskState::Failed | TaskState::Canceled | TaskState::Rejected
        )
    }

    /// Trim task history to the requested length.
    ///
    /// Mirrors Python SDK's `apply_history_length`:
    /// - Only trims if `max_length` is `Some` AND > 0 AND history exists.
    /// - Keeps the most recent N messages (tail).
    fn trim_history(task: &mut Task, max_length: Option<usize>) {
        if let Some(max) = max_length {
            if max > 0 {
                if let Some(ref mut history) = task.history {
                    if history.len() > max {
                        let start = history.len() - max;
                        *history = history.split_off(start);
                    }
                }
            }
        }
    }
}

#[async_trait]
impl RequestHandler for DefaultRequestHandler {
    async fn on_message_send(&self, params: SendMessageParams) -> A2AResult<SendMessageResponse> {
        let task = self.get_or_create_task(&params).await?;
        let event_queue = self
            .spawn_executor(&task, &params.message, params.configuration.as_ref())
            .await?;

        let mut consumer = EventConsumer::new(event_queue);
        let result = self.aggregate(&task.id, &task.context_id, &mut consumer).await;

        // The consumer has fully drained the queue (terminal event or close)
        // by this point, so the binding can be released from the manager —
        // otherwise every task ever processed would leak its root queue.
        self.queue_manager.close(&task.id).await.ok();
        let result = result?;

        let history_length = params.configuration.as_ref().and_then(|c| c.history_length);

        match result {
            Some(AggregatedResult::Message(message)) => Ok(SendMessageResponse::Message(message)),
            Some(AggregatedResult::Task(mut t)) => {
                Self::trim_history(&mut t, history_length);
                Ok(SendMessageResponse::Task(t))
            }
            None => {
                // No terminal message and the TaskManager has no snapshot —
                // fall back to the task store (mirrors the aggregator's own
                // `nil` fallback, one level further down).
                let mut t = self.task_store.get(&task.id).await?.ok_or_else(|| {
                    A2AError::TaskNotFound {
                        message: task.id.clone(),
                        data: None,
                    }
                })?;
                Self::trim_history(&mut t, history_length);
                Ok(SendMessageResponse::Task(t))
            }
        }
    }

    async fn on_message_send_stream(
        &self,
        params: SendMessageParams,
    ) -> A2AResult<EventConsumer> {
        let task = self.get_or_create_task(&params).await?;
        self.spawn_executor(&task, &params.message, params.configuration.as_ref())
            .await?;

        let tap = self
            .queue_manager
            .tap(&task.id)
            .await
            .ok_or_else(|| A2AError::TaskNotFound {
                message: task.id.clone(),
                data: None,
            })?;
        let output_queue = EventQueue::with_default_capacity();

        let task_id = task.id.clone();
        let context_id = task.context_id.clone();
        let task_manager = self.new_task_manager(&task_id, &context_id)?;
        let forward_queue = output_queue.clone();
        let queue_manager = Arc::clone(&self.queue_manager);

        tokio::spawn(async move {
            struct ForwardToQueue(EventQueue);

            #[async_trait]
            impl EventSink for ForwardToQueue {
                async fn on_event(&mut self, event: StreamResponse) -> A2AResult<()> {
                    self.0.enqueue(event).await;
                    Ok(())
                }
            }

            let mut consumer = EventConsumer::new(tap);
            let mut aggregator = ResultAggregator::new(task_manager);
            let mut sink = ForwardToQueue(forward_queue.clone());
            if let Err(e) = aggregator.consume_and_emit(&mut consumer, &mut sink).await {
                error!(task_id = %task_id, error = %e, "Streaming aggregation ended with an error");
            }
            forward_queue.close(false).await;

            // The tapped stream has reached its end — release the task's
            // root queue binding so the manager doesn't hold it forever.
            queue_manager.close(&task_id).await.ok();
        });

        Ok(EventConsumer::new(output_queue))
    }

    async fn on_get_task(&self, params: GetTaskParams) -> A2AResult<Task> {
        let mut task =
            self.task_store
                .get(&params.id)
                .await?
                .ok_or_else(|| A2AError::TaskNotFound {
                    message: params.id.clone(),
                    data: None,
                })?;

        Self::trim_history(&mut task, params.history_length);
        Ok(task)
    }

    async fn on_list_tasks(&self, params: TaskListParams) -> A2AResult<TaskListResponse> {
        self.task_store.list(&params).await
    }

    async fn on_cancel_task(&self, params: CancelTaskParams) -> A2AResult<Task> {
        // Look up the task.
        let task =
            self.task_store
                .get(&params.id)
                .await?
                .ok_or_else(|| A2AError::TaskNotFound {
                    message: params.id.clone(),
                    data: None,
                })?;

        // Can't cancel a terminal task (mirrors Python SDK check).
        if Self::is_terminal(&task.status.state) {
            return Err(A2AError::TaskNotCancelable {
                message: format!(
                    "Task cannot be canceled - current state: {}",
                    task.status.state
                ),
                data: None,
            });
        }

        // Get or bind the event queue for this task.
        let is_running = self.running_agents.lock().await.contains_key(&params.id);
        let (execute_queue, consume_queue) = if is_running {
            let root = self
                .queue_manager
                .get(&params.id)
                .await
                .ok_or_else(|| A2AError::TaskNotFound {
                    message: params.id.clone(),
                    data: None,
                })?;
            let tap = self.queue_manager.tap(&params.id).await.ok_or_else(|| {
                A2AError::TaskNotFound {
                    message: params.id.clone(),
                    data: None,
                }
            })?;
            (root, tap)
        } else {
            // No running agent — create a temporary queue for the cancel
            // notification, bound so `tap`/`close` still make sense.
            let queue = EventQueue::with_default_capacity();
            self.queue_manager.add(&params.id, queue.clone()).await.ok();
            (queue.clone(), queue)
        };

        // Call the executor's cancel method.
        // Python SDK passes `None` for the request in cancel context.
        let context = RequestContext {
            task_id: task.id.clone(),
            context_id: task.context_id.clone(),
            message: None,
            task: Some(task.clone()),
            configuration: None,
            related_tasks: Vec::new(),
            metadata: params.metadata,
            call_context: None,
        };

        self.executor.cancel(context, execute_queue).await?;

        // Abort the ongoing producer task, if one exists
        // (mirrors Python SDK's `producer_task.cancel()`).
        if is_running {
            if let Some(agent) = self.running_agents.lock().await.remove(&params.id) {
                agent.handle.abort();
            }
        }

        // Consume events until terminal.
        let mut consumer = EventConsumer::new(consume_queue);
        let result = self.aggregate(&task.id, &task.context_id, &mut consumer).await;

        // Canceling always ends the task's stream — release the manager's
        // binding regardless of whether a producer was still registered.
        self.queue_manager.close(&task.id).await.ok();
        let result = result?;

        let final_task = match result {
            Some(AggregatedResult::Task(t)) => t,
            _ => self
                .task_store
                .get(&task.id)
                .await?
                .ok_or_else(|| A2AError::TaskNotFound {
                    message: task.id.clone(),
                    data: None,
                })?,
        };

        // Validate the cancel result (mirrors Python SDK).
        // Python SDK raises TaskNotCancelableError if the result state is not canceled.
        if final_task.status.state != TaskState::Canceled {
            return Err(A2AError::TaskNotCancelable {
                message: format!(
                    "Task cannot be canceled - current state: {}",
                    final_task.status.state
                ),
                data: None,
            });
        }

        Ok(final_task)
    }

    async fn on_subscribe_to_task(
        &self,
        params: SubscribeToTaskParams,
    ) -> A2AResult<EventConsumer> {
        // Verify the task exists.
        let task =
            self.task_store
                .get(&params.id)
                .await?
                .ok_or_else(|| A2AError::TaskNotFound {
                    message: params.id.clone(),
                    data: None,
                })?;

        // If the task is already terminal, return an error.
        if Self::is_terminal(&task.status.state) {
            return Err(A2AError::InvalidParams {
                message: format!(
                    "Task {} is in terminal state {:?} — cannot subscribe",
                    params.id, task.status.state
                ),
                data: None,
            });
        }

        // Tap the event queue for this running task.
        let tap = self
            .queue_manager
            .tap(&params.id)
            .await
            .ok_or_else(|| A2AError::TaskNotFound {
                message: format!(
                    "Task {} has no active agent execution — cannot subscribe",
                    params.id
                ),
                data: None,
            })?;

        Ok(EventConsumer::new(tap))
    }

    async fn on_resubscribe_to_task(
        &self,
        params: SubscribeToTaskParams,
    ) -> A2AResult<EventConsumer> {
        // Verify the task exists (mirrors Python SDK).
        let task =
            self.task_store
                .get(&params.id)
                .await?
                .ok_or_else(|| A2AError::TaskNotFound {
                    message: params.id.clone(),
                    data: None,
                })?;

        // If the task is already terminal, return an error (mirrors Python SDK).
        if Self::is_terminal(&task.status.state) {
            return Err(A2AError::InvalidParams {
                message: format!(
                    "Task {} is in terminal state: {}",
                    params.id, task.status.state
                ),
                data: None,
            });
        }

        // Tap the event queue for this running task (mirrors Python SDK's
        // `queue_manager.tap`).
        let tap = self
            .queue_manager
            .tap(&params.id)
            .await
            .ok_or_else(|| A2AError::TaskNotFound {
                message: format!("Task {} has no active agent execution", params.id),
                data: None,
            })?;

        Ok(EventConsumer::new(tap))
    }
}
