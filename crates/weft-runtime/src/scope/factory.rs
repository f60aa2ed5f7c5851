use std::future::Future;
use std::sync::{Arc, Mutex, PoisonError};

use futures::FutureExt;

use weft_core::error::Result;
use weft_core::tag::Tag;

use super::entry::Cleanup;
use super::Scope;
use crate::executor::AnyExecutor;

/// Handle passed to executor factories.
#[derive(Clone)]
pub struct FactoryContext {
    scope: Scope,
    executor: AnyExecutor,
    cleanups: Arc<Mutex<Vec<Cleanup>>>,
}

impl FactoryContext {
    pub(crate) fn new(scope: Scope, executor: AnyExecutor, cleanups: Arc<Mutex<Vec<Cleanup>>>) -> Self {
        Self {
            scope,
            executor,
            cleanups,
        }
    }

    pub fn scope(&self) -> &Scope {
        &self.scope
    }

    pub fn executor_name(&self) -> &str {
        self.executor.name()
    }

    /// Register teardown for what this factory acquired. Cleanups run in
    /// reverse registration order on invalidation, release and disposal.
    pub fn cleanup<F, Fut>(&self, cleanup: F)
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = Result<()>> + Send + 'static,
    {
        let boxed: Cleanup = Box::new(move || cleanup().boxed());
        self.cleanups
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(boxed);
    }

    /// Schedule this executor for invalidation. While the factory is still
    /// running this coalesces into a single follow-up re-resolution.
    pub fn invalidate(&self) -> Result<()> {
        self.scope.schedule_invalidation(self.executor.id(), None)
    }

    /// Read a tag from this executor's metadata, then from the scope's
    /// ambient tags, then the tag default.
    pub fn tag<V: Clone + Send + Sync + 'static>(&self, tag: &Tag<V>) -> Option<V> {
        tag.lookup_in(self.executor.tags())
            .or_else(|| tag.lookup_in(self.scope.tags()))
            .or_else(|| tag.default_value().cloned())
    }
}
