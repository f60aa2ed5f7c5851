use std::fmt;
use std::sync::Arc;

use futures::future::{BoxFuture, Shared};
use tracing::warn;

use weft_core::error::{Result, WeftError};
use weft_core::types::AnyValue;

use crate::executor::{AnyExecutor, ExecutorId};

/// Resolution state of one executor within one scope.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntryState {
    Idle,
    Resolving,
    Resolved,
    Failed,
}

impl fmt::Display for EntryState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Idle => "idle",
            Self::Resolving => "resolving",
            Self::Resolved => "resolved",
            Self::Failed => "failed",
        };
        f.write_str(s)
    }
}

/// Notification delivered to controller listeners.
#[derive(Debug, Clone)]
pub enum ControllerEvent {
    Resolving,
    Resolved,
    Failed(WeftError),
    Released,
}

/// A failure broadcast to error observers.
#[derive(Debug, Clone)]
pub struct ErrorEvent {
    pub executor: String,
    pub error: WeftError,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ListenerId(pub(crate) u64);

pub(crate) type Listener = Arc<dyn Fn(&ControllerEvent) + Send + Sync>;
pub(crate) type ErrorListener = Arc<dyn Fn(&ErrorEvent) + Send + Sync>;

/// Deferred teardown registered by a factory.
pub type Cleanup = Box<dyn FnOnce() -> BoxFuture<'static, Result<()>> + Send>;

pub(crate) type SharedResolution = Shared<BoxFuture<'static, Result<AnyValue>>>;

pub(crate) struct Entry {
    pub executor: AnyExecutor,
    pub state: EntryState,
    pub value: Option<AnyValue>,
    pub error: Option<WeftError>,
    /// Registration order; run in reverse.
    pub cleanups: Vec<Cleanup>,
    pub inflight: Option<SharedResolution>,
    /// Set when an invalidation arrives while the factory is running.
    pub pending_invalidate: bool,
    pub pending_replacement: Option<AnyValue>,
    /// Invalidation chain that led to the current resolution (excluding this executor).
    pub chain: Vec<ExecutorId>,
    pub generation: u64,
    pub settled_seq: u64,
    pub listeners: Vec<(ListenerId, Listener)>,
    pub error_listeners: Vec<(ListenerId, ErrorListener)>,
}

impl Entry {
    pub fn new(executor: AnyExecutor) -> Self {
        Self {
            executor,
            state: EntryState::Idle,
            value: None,
            error: None,
            cleanups: Vec::new(),
            inflight: None,
            pending_invalidate: false,
            pending_replacement: None,
            chain: Vec::new(),
            generation: 0,
            settled_seq: 0,
            listeners: Vec::new(),
            error_listeners: Vec::new(),
        }
    }

    pub fn listener_snapshot(&self) -> Vec<Listener> {
        self.listeners.iter().map(|(_, l)| l.clone()).collect()
    }

    pub fn error_listener_snapshot(&self) -> Vec<ErrorListener> {
        self.error_listeners.iter().map(|(_, l)| l.clone()).collect()
    }

    /// Cached outcome, for entries that have settled.
    pub fn settled(&self) -> Option<Result<AnyValue>> {
        match self.state {
            EntryState::Resolved => self.value.clone().map(Ok),
            EntryState::Failed => self.error.clone().map(Err),
            _ => None,
        }
    }
}

pub(crate) fn notify(listeners: &[Listener], event: &ControllerEvent) {
    for listener in listeners {
        listener(event);
    }
}

pub(crate) fn notify_errors(listeners: &[ErrorListener], event: &ErrorEvent) {
    for listener in listeners {
        listener(event);
    }
}

/// Run cleanups newest-first. Failures are logged; every cleanup still runs.
pub(crate) async fn run_cleanups(owner: &str, cleanups: Vec<Cleanup>) {
    for cleanup in cleanups.into_iter().rev() {
        if let Err(e) = cleanup().await {
            warn!(owner = %owner, error = %e, "Cleanup failed");
        }
    }
}
