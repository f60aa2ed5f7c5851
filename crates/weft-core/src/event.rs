use serde::Serialize;

use crate::types::ExecutionStatus;

/// Lifecycle notifications emitted by a scope.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum RuntimeEvent {
    /// An executor produced a value.
    ExecutorResolved { executor: String },
    /// An executor's factory or one of its dependencies failed.
    ExecutorFailed { executor: String, error: String },
    /// An executor was taken off the invalidation queue and is re-resolving.
    ExecutorInvalidated { executor: String },
    /// An executor's entry was released and its cleanups ran.
    ExecutorReleased { executor: String },
    /// The invalidation drain found a cycle and stopped.
    InvalidationLoop { cycle: Vec<String> },
    /// An execution context was closed.
    ContextClosed { context: String },
    /// A flow execution changed status.
    ExecutionStatus {
        execution: String,
        flow: String,
        status: ExecutionStatus,
    },
    /// The scope finished disposing.
    ScopeDisposed,
}

/// Event bus using tokio broadcast channel.
/// All subscribers receive all events.
pub struct EventBus {
    tx: tokio::sync::broadcast::Sender<RuntimeEvent>,
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = tokio::sync::broadcast::channel(capacity.max(1));
        Self { tx }
    }

    pub fn publish(&self, event: RuntimeEvent) {
        // Ignore error if no receivers
        let _ = self.tx.send(event);
    }

    pub fn subscribe(&self) -> tokio::sync::broadcast::Receiver<RuntimeEvent> {
        self.tx.subscribe()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(256)
    }
}
