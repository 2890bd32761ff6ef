//! Event bus - named-topic pub/sub across the runtime
//!
//! Delivery is fan-out, asynchronous, and unordered across subscribers: each
//! emit spawns one task per listener. The bus has no persistence, no ack,
//! and no back-pressure; handlers that need serialization own their own
//! channels (typically an mpsc sender captured by the closure).

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;

use parking_lot::RwLock;
use serde::Serialize;

use crate::error::ErrorEvent;
use crate::reply::SuperAction;
use crate::storage::TaskState;
use crate::subagent::SubtaskEnvelope;

/// Topics used by the core.
pub mod topics {
    pub const RESPOND: &str = "respond";
    pub const STREAM: &str = "stream";
    pub const CONTROL: &str = "control";
    pub const ERRORS: &str = "errors";
    pub const COMPLETE: &str = "complete";
    pub const SUBTASK: &str = "subtask";
    pub const CHANGE: &str = "change";
    pub const WAIT_TODO: &str = "wait-todo";
    pub const MCP_REBOOT: &str = "mcp-reboot";
}

/// Typed payloads carried by bus events.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum BusPayload {
    /// A parsed LLM reply, emitted once per turn.
    Respond(Arc<SuperAction>),

    /// One streaming delta from an in-flight LLM call.
    Stream { increment_idx: u64, chunk: String },

    /// Task state changed.
    Control { task_uuid: String, state: TaskState },

    /// A control-plane error (see `ErrorKind`).
    Error(ErrorEvent),

    /// An executor reached its terminal `complete` action.
    Complete {
        task_uuid: String,
        agent_uuid: String,
        content: String,
    },

    /// A sub-agent action routed to the coordinator.
    Subtask(Arc<SubtaskEnvelope>),

    /// Filesystem mutation under a task workdir.
    Change { task_uuid: String, path: PathBuf },

    /// A reminder request for the cron collaborator.
    WaitTodo {
        task_uuid: String,
        todo_uuid: String,
        cron_expr: String,
        body: String,
    },

    /// Request to reconnect an MCP server.
    McpReboot { server: String },
}

/// One delivered event.
#[derive(Debug, Clone, Serialize)]
pub struct BusEvent {
    pub topic: String,
    pub correlation_id: String,
    pub payload: BusPayload,
}

/// Subscriber callback. Must not block; long work belongs in the handler's
/// own channel consumer.
pub type Handler = Arc<dyn Fn(BusEvent) + Send + Sync>;

struct Registration {
    handler: Handler,
    once: bool,
}

/// Process-wide named-topic pub/sub.
pub struct EventBus {
    listeners: RwLock<HashMap<String, Vec<Registration>>>,
    /// Captured at construction so emits from non-runtime threads (e.g. the
    /// file watcher callback) can still spawn deliveries.
    runtime: Option<tokio::runtime::Handle>,
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

impl EventBus {
    pub fn new() -> Self {
        Self {
            listeners: RwLock::new(HashMap::new()),
            runtime: tokio::runtime::Handle::try_current().ok(),
        }
    }

    /// Subscribe `handler` to every emit on `topic`.
    pub fn listen(&self, topic: &str, handler: Handler) {
        let mut listeners = self.listeners.write();
        listeners
            .entry(topic.to_string())
            .or_default()
            .push(Registration {
                handler,
                once: false,
            });
    }

    /// Subscribe for a single delivery. Idempotent by handler identity:
    /// registering the same `Arc` twice leaves exactly one registration.
    pub fn once(&self, topic: &str, handler: Handler) {
        let mut listeners = self.listeners.write();
        let regs = listeners.entry(topic.to_string()).or_default();
        if regs.iter().any(|r| Arc::ptr_eq(&r.handler, &handler)) {
            return;
        }
        regs.push(Registration {
            handler,
            once: true,
        });
    }

    /// Remove a previously registered handler by identity.
    pub fn remove(&self, topic: &str, handler: &Handler) {
        let mut listeners = self.listeners.write();
        if let Some(regs) = listeners.get_mut(topic) {
            regs.retain(|r| !Arc::ptr_eq(&r.handler, handler));
            if regs.is_empty() {
                listeners.remove(topic);
            }
        }
    }

    /// Emit an event to every listener of `topic`.
    ///
    /// Each handler runs on its own spawned task; ordering between
    /// subscribers is unspecified.
    pub fn emit(&self, topic: &str, correlation_id: &str, payload: BusPayload) {
        let handlers: Vec<Handler> = {
            let mut listeners = self.listeners.write();
            match listeners.get_mut(topic) {
                Some(regs) => {
                    let handlers = regs.iter().map(|r| Arc::clone(&r.handler)).collect();
                    regs.retain(|r| !r.once);
                    if regs.is_empty() {
                        listeners.remove(topic);
                    }
                    handlers
                }
                None => return,
            }
        };

        let event = BusEvent {
            topic: topic.to_string(),
            correlation_id: correlation_id.to_string(),
            payload,
        };

        let runtime = self
            .runtime
            .clone()
            .or_else(|| tokio::runtime::Handle::try_current().ok());

        for handler in handlers {
            let event = event.clone();
            match &runtime {
                Some(rt) => {
                    rt.spawn(async move { handler(event) });
                }
                // No runtime in reach: deliver inline. Only hit in
                // synchronous test setups.
                None => handler(event),
            }
        }
    }

    #[cfg(test)]
    pub(crate) fn listener_count(&self, topic: &str) -> usize {
        self.listeners
            .read()
            .get(topic)
            .map(|r| r.len())
            .unwrap_or(0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    fn counting_handler(counter: Arc<AtomicUsize>) -> Handler {
        Arc::new(move |_event| {
            counter.fetch_add(1, Ordering::SeqCst);
        })
    }

    fn dummy_payload() -> BusPayload {
        BusPayload::McpReboot {
            server: "test".to_string(),
        }
    }

    async fn settle() {
        tokio::time::sleep(Duration::from_millis(50)).await;
    }

    #[tokio::test]
    async fn two_subscribers_both_receive_every_emit() {
        let bus = EventBus::new();
        let a = Arc::new(AtomicUsize::new(0));
        let b = Arc::new(AtomicUsize::new(0));
        bus.listen(topics::ERRORS, counting_handler(a.clone()));
        bus.listen(topics::ERRORS, counting_handler(b.clone()));

        bus.emit(topics::ERRORS, "c1", dummy_payload());
        bus.emit(topics::ERRORS, "c2", dummy_payload());
        settle().await;

        assert_eq!(a.load(Ordering::SeqCst), 2);
        assert_eq!(b.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn once_is_idempotent_by_handler_identity() {
        let bus = EventBus::new();
        let counter = Arc::new(AtomicUsize::new(0));
        let handler = counting_handler(counter.clone());

        bus.once(topics::COMPLETE, handler.clone());
        bus.once(topics::COMPLETE, handler.clone());
        assert_eq!(bus.listener_count(topics::COMPLETE), 1);

        bus.emit(topics::COMPLETE, "c", dummy_payload());
        bus.emit(topics::COMPLETE, "c", dummy_payload());
        settle().await;

        // Single registration, single delivery.
        assert_eq!(counter.load(Ordering::SeqCst), 1);
        assert_eq!(bus.listener_count(topics::COMPLETE), 0);
    }

    #[tokio::test]
    async fn remove_unsubscribes_by_identity() {
        let bus = EventBus::new();
        let counter = Arc::new(AtomicUsize::new(0));
        let handler = counting_handler(counter.clone());

        bus.listen(topics::CHANGE, handler.clone());
        bus.remove(topics::CHANGE, &handler);
        bus.emit(topics::CHANGE, "c", dummy_payload());
        settle().await;

        assert_eq!(counter.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn emit_without_listeners_is_a_no_op() {
        let bus = EventBus::new();
        bus.emit("nobody-home", "c", dummy_payload());
        settle().await;
    }
}
