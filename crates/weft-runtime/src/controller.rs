use std::fmt;
use std::sync::Arc;

use weft_core::error::{Result, WeftError};
use weft_core::types::{downcast, erase};

use crate::executor::Executor;
use crate::scope::{ControllerEvent, EntryState, ErrorEvent, ListenerId, Scope};

/// Per-executor handle within one scope.
pub struct Controller<T> {
    scope: Scope,
    executor: Executor<T>,
}

impl<T> Clone for Controller<T> {
    fn clone(&self) -> Self {
        Self {
            scope: self.scope.clone(),
            executor: self.executor.clone(),
        }
    }
}

impl<T> fmt::Debug for Controller<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Controller")
            .field("executor", &self.executor)
            .finish_non_exhaustive()
    }
}

impl<T: Send + Sync + 'static> Controller<T> {
    pub(crate) fn new(scope: Scope, executor: Executor<T>) -> Self {
        Self { scope, executor }
    }

    pub fn executor(&self) -> &Executor<T> {
        &self.executor
    }

    pub fn state(&self) -> EntryState {
        self.scope.entry_state(self.executor.id())
    }

    /// The cached value, if resolved. Never triggers resolution.
    pub fn peek(&self) -> Option<Arc<T>> {
        self.scope
            .entry_value(self.executor.id())
            .and_then(|v| downcast::<T>(v, self.executor.name()).ok())
    }

    /// The cached error, if failed.
    pub fn error(&self) -> Option<WeftError> {
        self.scope.entry_error(self.executor.id())
    }

    pub async fn resolve(&self) -> Result<Arc<T>> {
        self.scope.resolve(&self.executor).await
    }

    pub fn invalidate(&self) -> Result<()> {
        self.scope.invalidate(&self.executor)
    }

    /// Replace the value through the invalidation queue: cleanups run, the
    /// factory is skipped and dependents re-resolve against `value`.
    pub fn set(&self, value: T) -> Result<()> {
        self.scope
            .schedule_invalidation(self.executor.id(), Some(erase(value)))
    }

    pub async fn release(&self) -> Result<()> {
        self.scope.release(&self.executor).await
    }

    /// Listen for state transitions of this executor.
    pub fn on_change<F>(&self, listener: F) -> Result<ListenerId>
    where
        F: Fn(&ControllerEvent) + Send + Sync + 'static,
    {
        self.scope
            .add_listener(&self.executor.erased(), Arc::new(listener))
    }

    /// Listen for resolution failures of this executor.
    pub fn on_error<F>(&self, listener: F) -> Result<ListenerId>
    where
        F: Fn(&ErrorEvent) + Send + Sync + 'static,
    {
        self.scope
            .add_error_listener(&self.executor.erased(), Arc::new(listener))
    }

    pub fn remove_listener(&self, id: ListenerId) -> bool {
        self.scope.remove_listener(self.executor.id(), id)
    }
}
