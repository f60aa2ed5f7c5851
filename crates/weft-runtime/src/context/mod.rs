//! Execution contexts.
//!
//! Contexts form a forest stored in the scope's arena. A root comes from
//! [`Scope::create_context`]; every `exec` creates a child that is closed
//! when the call settles. Handles are generational indices, so using a
//! closed context fails with `ClosedContext` instead of touching a reused
//! slot.

pub(crate) mod arena;
mod exec;

use std::fmt;
use std::future::Future;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use futures::FutureExt;
use serde::Serialize;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use weft_core::error::{Result, WeftError};
use weft_core::event::RuntimeEvent;
use weft_core::tag::{Tag, TagBag, Tagged};

use crate::executor::Executor;
use crate::journal::{Journal, JournalHandle};
use crate::scope::{lock, Scope};

pub use arena::ContextId;
pub use exec::Exec;

use arena::{CloseCallback, ContextArena, ContextNode};

/// Lifecycle details of one context.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ContextDetails {
    /// Exec target name; `None` for unnamed roots.
    pub name: Option<String>,
    /// Journal key of the exec that created the context.
    pub key: Option<String>,
    pub depth: usize,
    pub started_at: DateTime<Utc>,
    /// Set when the context closes.
    pub ended_at: Option<DateTime<Utc>>,
}

/// Options for [`Scope::create_context_with`].
#[derive(Default)]
pub struct ContextOptions {
    name: Option<String>,
    tags: Vec<Tagged>,
    journal: Option<Journal>,
}

impl ContextOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    /// Seed the context's data.
    pub fn tag(mut self, tagged: Tagged) -> Self {
        self.tags.push(tagged);
        self
    }

    /// Replay journal shared by every context of this run.
    pub fn journal(mut self, journal: Journal) -> Self {
        self.journal = Some(journal);
        self
    }
}

impl Scope {
    /// Create a root execution context.
    pub fn create_context(&self) -> Result<ExecutionContext> {
        self.create_context_with(ContextOptions::default())
    }

    /// Create a root context whose keyed steps replay from `journal`.
    pub fn create_context_with_journal(&self, journal: Journal) -> Result<ExecutionContext> {
        self.create_context_with(ContextOptions::new().journal(journal))
    }

    pub fn create_context_with(&self, options: ContextOptions) -> Result<ExecutionContext> {
        self.ensure_open()?;
        let token = CancellationToken::new();
        let node = ContextNode {
            parent: None,
            children: Vec::new(),
            data: TagBag::from_tagged(options.tags),
            token: token.clone(),
            cancel_reason: None,
            close_callbacks: Vec::new(),
            details: ContextDetails {
                name: options.name,
                key: None,
                depth: 0,
                started_at: Utc::now(),
                ended_at: None,
            },
            journal: options.journal.map(JournalHandle::seeded).unwrap_or_default(),
            path: Vec::new(),
            timer: None,
        };
        let id = lock(&self.inner().contexts).insert(node);
        debug!(context = %id, "Created root context");
        Ok(ExecutionContext {
            scope: self.clone(),
            id,
            token,
        })
    }

    /// Cancel and close every live context, deepest first.
    pub(crate) async fn close_all_contexts(&self) {
        let ids = {
            let arena = lock(&self.inner().contexts);
            debug!(contexts = arena.len(), "Closing live contexts");
            arena.all()
        };
        for id in ids {
            if let Some(token) = self.context_arena(|a| a.get(id).map(|n| n.token.clone())) {
                token.cancel();
            }
            close_node(self, id).await;
        }
    }

    fn context_arena<R>(&self, f: impl FnOnce(&mut ContextArena) -> R) -> R {
        f(&mut lock(&self.inner().contexts))
    }
}

/// Node in the context tree: isolated data, a cancellation signal and the
/// run's journal.
#[derive(Clone)]
pub struct ExecutionContext {
    scope: Scope,
    id: ContextId,
    token: CancellationToken,
}

impl fmt::Debug for ExecutionContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ExecutionContext")
            .field("id", &self.id)
            .field("cancelled", &self.token.is_cancelled())
            .finish()
    }
}

impl ExecutionContext {
    pub fn id(&self) -> ContextId {
        self.id
    }

    pub fn scope(&self) -> &Scope {
        &self.scope
    }

    pub fn is_closed(&self) -> bool {
        self.scope.context_arena(|a| a.get(self.id).is_none())
    }

    fn closed(&self) -> WeftError {
        WeftError::ClosedContext {
            context: self.id.to_string(),
        }
    }

    fn with_node<R>(&self, f: impl FnOnce(&mut ContextNode) -> R) -> Result<R> {
        let mut arena = lock(&self.scope.inner().contexts);
        match arena.get_mut(self.id) {
            Some(node) => Ok(f(node)),
            None => Err(self.closed()),
        }
    }

    pub fn parent(&self) -> Result<Option<ExecutionContext>> {
        let arena = lock(&self.scope.inner().contexts);
        let node = arena.get(self.id).ok_or_else(|| self.closed())?;
        Ok(node.parent.and_then(|p| {
            arena.get(p).map(|parent| ExecutionContext {
                scope: self.scope.clone(),
                id: p,
                token: parent.token.clone(),
            })
        }))
    }

    pub fn depth(&self) -> Result<usize> {
        self.with_node(|n| n.details.depth)
    }

    pub fn details(&self) -> Result<ContextDetails> {
        self.with_node(|n| n.details.clone())
    }

    /// Cancellation signal. Cancelling a parent cancels every descendant.
    pub fn signal(&self) -> CancellationToken {
        self.token.clone()
    }

    pub fn is_cancelled(&self) -> bool {
        self.token.is_cancelled()
    }

    /// Cancel this context and its descendants. In-flight work is not
    /// interrupted; new nested work is refused.
    pub fn cancel(&self, reason: impl Into<String>) {
        let reason = reason.into();
        let _ = self.with_node(|n| {
            if n.cancel_reason.is_none() {
                n.cancel_reason = Some(reason.clone());
            }
        });
        debug!(context = %self.id, reason = %reason, "Context cancelled");
        self.token.cancel();
    }

    /// Reason recorded by the nearest cancelled context on the ancestor chain.
    pub fn cancel_reason(&self) -> Option<String> {
        if !self.token.is_cancelled() {
            return None;
        }
        let arena = lock(&self.scope.inner().contexts);
        let mut current = Some(self.id);
        while let Some(id) = current {
            let node = arena.get(id)?;
            if let Some(reason) = &node.cancel_reason {
                return Some(reason.clone());
            }
            current = node.parent;
        }
        None
    }

    pub(crate) fn cancelled_error(&self) -> WeftError {
        WeftError::cancelled(
            self.cancel_reason()
                .unwrap_or_else(|| "context cancelled".to_string()),
        )
    }

    /// Write a value into this context's own data.
    pub fn set<V: Clone + Send + Sync + 'static>(&self, tag: &Tag<V>, value: V) -> Result<()> {
        self.with_node(|n| tag.inject_to(&mut n.data, value))?
    }

    /// Local value; fails with `TagNotFound` when absent.
    pub fn get<V: Clone + Send + Sync + 'static>(&self, tag: &Tag<V>) -> Result<V> {
        self.with_node(|n| tag.extract_from(&n.data))?
    }

    /// Local value, or the tag's default when absent.
    pub fn find<V: Clone + Send + Sync + 'static>(&self, tag: &Tag<V>) -> Result<Option<V>> {
        self.with_node(|n| tag.read_from(&n.data))
    }

    /// Nearest value on the ancestor chain, starting here. Never uses the
    /// tag's default.
    pub fn seek<V: Clone + Send + Sync + 'static>(&self, tag: &Tag<V>) -> Result<Option<V>> {
        let arena = lock(&self.scope.inner().contexts);
        let mut node = arena.get(self.id).ok_or_else(|| self.closed())?;
        loop {
            if let Some(value) = tag.lookup_in(&node.data) {
                return Ok(Some(value));
            }
            match node.parent.and_then(|p| arena.get(p)) {
                Some(parent) => node = parent,
                None => return Ok(None),
            }
        }
    }

    /// Remove a local value. Returns whether one was present.
    pub fn remove<V: Clone + Send + Sync + 'static>(&self, tag: &Tag<V>) -> Result<bool> {
        self.with_node(|n| n.data.remove(tag.key()).is_some())
    }

    /// Register a callback run once when this context closes, newest first.
    pub fn on_close<F, Fut>(&self, callback: F) -> Result<()>
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = Result<()>> + Send + 'static,
    {
        let boxed: CloseCallback = Box::new(move || callback().boxed());
        self.with_node(|n| n.close_callbacks.push(boxed))
    }

    /// Resolve an executor in this context's scope.
    pub async fn resolve<T: Send + Sync + 'static>(&self, executor: &Executor<T>) -> Result<Arc<T>> {
        if self.is_closed() {
            return Err(self.closed());
        }
        self.scope.resolve(executor).await
    }

    /// Snapshot of the run's journal.
    pub fn journal(&self) -> Result<Journal> {
        self.with_node(|n| n.journal.snapshot())
    }

    pub(crate) fn journal_handle(&self) -> Result<JournalHandle> {
        self.with_node(|n| n.journal.clone())
    }

    /// Close this context and any still-open descendants. Close callbacks
    /// run newest first; their failures are logged.
    pub async fn close(&self) -> Result<ContextDetails> {
        let subtree = self.scope.context_arena(|a| a.subtree(self.id));
        if subtree.is_empty() {
            return Err(self.closed());
        }
        let mut own = None;
        for id in subtree {
            let details = close_node(&self.scope, id).await;
            if id == self.id {
                own = details;
            }
        }
        own.ok_or_else(|| self.closed())
    }
}

/// Remove one node and run its close callbacks. `None` if already closed.
async fn close_node(scope: &Scope, id: ContextId) -> Option<ContextDetails> {
    let node = scope.context_arena(|a| a.remove(id))?;
    if let Some(timer) = &node.timer {
        timer.abort();
    }

    for callback in node.close_callbacks.into_iter().rev() {
        if let Err(e) = callback().await {
            warn!(context = %id, error = %e, "Close callback failed");
        }
    }

    let mut details = node.details;
    details.ended_at = Some(Utc::now());
    debug!(context = %id, name = ?details.name, "Context closed");
    scope.events().publish(RuntimeEvent::ContextClosed {
        context: id.to_string(),
    });
    Some(details)
}

/// Closes a child context if the exec future owning it is dropped early.
pub(crate) struct CloseGuard {
    context: Option<ExecutionContext>,
}

impl CloseGuard {
    pub fn new(context: ExecutionContext) -> Self {
        Self {
            context: Some(context),
        }
    }

    pub fn disarm(mut self) {
        self.context = None;
    }
}

impl Drop for CloseGuard {
    fn drop(&mut self) {
        let Some(context) = self.context.take() else {
            return;
        };
        if let Ok(handle) = tokio::runtime::Handle::try_current() {
            handle.spawn(async move {
                let _ = context.close().await;
            });
        }
    }
}
