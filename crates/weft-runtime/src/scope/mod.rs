//! Scope: owner of resolved executor state.
//!
//! A scope keeps one [`entry::Entry`] per executor it has seen. Resolution is
//! single-flight: while an entry is resolving, every caller awaits the same
//! shared future. Invalidation is two-phase: `invalidate` only enqueues, and a
//! single drain task applies queued invalidations one executor at a time
//! (see `drain.rs`).

mod drain;
mod entry;
mod factory;
mod resolve;

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use futures::future::{BoxFuture, Shared};
use tokio::sync::OnceCell;
use tracing::{debug, info, warn};
use uuid::Uuid;

use weft_core::config::RuntimeConfig;
use weft_core::error::{Result, WeftError};
use weft_core::event::{EventBus, RuntimeEvent};
use weft_core::tag::{Tag, TagBag, Tagged};
use weft_core::types::{downcast, erase, AnyValue};

use crate::context::arena::ContextArena;
use crate::controller::Controller;
use crate::execution::ExecutionSummary;
use crate::executor::{AnyExecutor, Executor, ExecutorId};
use crate::extension::{Extension, Pipeline};

pub use entry::{Cleanup, ControllerEvent, EntryState, ErrorEvent, ListenerId};
pub use factory::FactoryContext;

pub(crate) use entry::{notify, Entry, ErrorListener, Listener};

/// Replacement for an executor inside one scope.
#[derive(Clone)]
pub(crate) enum Preset {
    Value(AnyValue),
    Executor(AnyExecutor),
}

/// Options for [`Scope::new`].
pub struct ScopeOptions {
    presets: HashMap<ExecutorId, Preset>,
    extensions: Vec<Arc<dyn Extension>>,
    tags: Vec<Tagged>,
    event_capacity: usize,
    default_timeout: Option<Duration>,
}

impl Default for ScopeOptions {
    fn default() -> Self {
        Self {
            presets: HashMap::new(),
            extensions: Vec::new(),
            tags: Vec::new(),
            event_capacity: 256,
            default_timeout: None,
        }
    }
}

impl ScopeOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_config(config: &RuntimeConfig) -> Self {
        Self {
            event_capacity: config.scope.event_capacity,
            default_timeout: config.flow.default_timeout(),
            ..Self::default()
        }
    }

    /// Use `value` instead of running the executor's factory.
    pub fn preset<T: Send + Sync + 'static>(mut self, executor: &Executor<T>, value: T) -> Self {
        self.presets.insert(executor.id(), Preset::Value(erase(value)));
        self
    }

    /// Resolve `executor` with `replacement`'s factory and dependencies.
    pub fn preset_with<T: Send + Sync + 'static>(
        mut self,
        executor: &Executor<T>,
        replacement: &Executor<T>,
    ) -> Self {
        self.presets
            .insert(executor.id(), Preset::Executor(replacement.erased()));
        self
    }

    /// Register an extension. Earlier registrations wrap later ones.
    pub fn extension(self, extension: impl Extension) -> Self {
        self.extension_arc(Arc::new(extension))
    }

    pub fn extension_arc(mut self, extension: Arc<dyn Extension>) -> Self {
        self.extensions.push(extension);
        self
    }

    /// Ambient tag available to every factory in the scope.
    pub fn tag(mut self, tagged: Tagged) -> Self {
        self.tags.push(tagged);
        self
    }

    pub fn event_capacity(mut self, capacity: usize) -> Self {
        self.event_capacity = capacity;
        self
    }

    /// Timeout for execs that do not set their own.
    pub fn default_timeout(mut self, timeout: Duration) -> Self {
        self.default_timeout = Some(timeout);
        self
    }
}

pub(crate) struct ScopeState {
    pub entries: HashMap<ExecutorId, Entry>,
    pub disposed: bool,
    pub queue: drain::InvalidationQueue,
    pub drain: Option<Shared<BoxFuture<'static, Result<()>>>>,
    /// Stamped on each resolution so stale completions can be told apart.
    pub next_generation: u64,
    pub settle_counter: u64,
}

pub(crate) struct ScopeInner {
    id: String,
    state: Mutex<ScopeState>,
    presets: HashMap<ExecutorId, Preset>,
    pipeline: Pipeline,
    tags: TagBag,
    events: EventBus,
    default_timeout: Option<Duration>,
    pub(crate) contexts: Mutex<ContextArena>,
    pub(crate) executions: Mutex<HashMap<String, ExecutionSummary>>,
    error_observers: Mutex<Vec<(ListenerId, ErrorListener)>>,
    initialized: OnceCell<Result<()>>,
    next_listener: AtomicU64,
}

/// Owner of resolved state for a set of executors; the unit of disposal.
#[derive(Clone)]
pub struct Scope {
    inner: Arc<ScopeInner>,
}

/// Create a scope.
pub fn create_scope(options: ScopeOptions) -> Scope {
    Scope::new(options)
}

impl Scope {
    pub fn new(options: ScopeOptions) -> Self {
        let id = Uuid::new_v4().to_string();
        debug!(
            scope = %id,
            extensions = options.extensions.len(),
            presets = options.presets.len(),
            "Creating scope"
        );
        Self {
            inner: Arc::new(ScopeInner {
                id,
                state: Mutex::new(ScopeState {
                    entries: HashMap::new(),
                    disposed: false,
                    queue: drain::InvalidationQueue::default(),
                    drain: None,
                    next_generation: 0,
                    settle_counter: 0,
                }),
                presets: options.presets,
                pipeline: Pipeline::compose(options.extensions),
                tags: TagBag::from_tagged(options.tags),
                events: EventBus::new(options.event_capacity),
                default_timeout: options.default_timeout,
                contexts: Mutex::new(ContextArena::default()),
                executions: Mutex::new(HashMap::new()),
                error_observers: Mutex::new(Vec::new()),
                initialized: OnceCell::new(),
                next_listener: AtomicU64::new(1),
            }),
        }
    }

    pub fn id(&self) -> &str {
        &self.inner.id
    }

    /// Ambient tags given at construction.
    pub fn tags(&self) -> &TagBag {
        &self.inner.tags
    }

    /// Read an ambient tag (default substituted when absent).
    pub fn tag<V: Clone + Send + Sync + 'static>(&self, tag: &Tag<V>) -> Option<V> {
        tag.read_from(&self.inner.tags)
    }

    pub fn subscribe(&self) -> tokio::sync::broadcast::Receiver<RuntimeEvent> {
        self.inner.events.subscribe()
    }

    pub fn is_disposed(&self) -> bool {
        self.lock_state().disposed
    }

    /// Run extension `init` hooks. Called implicitly by the first operation.
    pub async fn initialize(&self) -> Result<()> {
        let scope = self.clone();
        self.inner
            .initialized
            .get_or_init(|| async move {
                for ext in scope.inner.pipeline.extensions() {
                    debug!(extension = ext.name(), "Initializing extension");
                    ext.init(&scope).await?;
                }
                Ok(())
            })
            .await
            .clone()
    }

    /// Resolve an executor, reusing the cached value or an in-flight resolution.
    pub async fn resolve<T: Send + Sync + 'static>(&self, executor: &Executor<T>) -> Result<Arc<T>> {
        let value = self.resolve_any(executor.erased()).await?;
        downcast::<T>(value, executor.name())
    }

    /// Handle for observing and driving one executor in this scope.
    pub fn controller<T: Send + Sync + 'static>(&self, executor: &Executor<T>) -> Result<Controller<T>> {
        {
            let mut state = self.lock_state();
            if state.disposed {
                return Err(WeftError::DisposedScope);
            }
            state
                .entries
                .entry(executor.id())
                .or_insert_with(|| Entry::new(executor.erased()));
        }
        Ok(Controller::new(self.clone(), executor.clone()))
    }

    /// Current state; `Idle` when the scope has no entry for it.
    pub fn state_of<T: Send + Sync + 'static>(&self, executor: &Executor<T>) -> EntryState {
        self.entry_state(executor.id())
    }

    /// Enqueue an invalidation. Applied by the drain task; see [`Scope::flush`].
    pub fn invalidate<T: Send + Sync + 'static>(&self, executor: &Executor<T>) -> Result<()> {
        self.schedule_invalidation(executor.id(), None)
    }

    /// Release one executor: run its cleanups newest-first and drop its entry.
    pub async fn release<T: Send + Sync + 'static>(&self, executor: &Executor<T>) -> Result<()> {
        self.release_id(executor.id()).await
    }

    /// Observe every resolution failure in this scope.
    pub fn on_error<F>(&self, observer: F) -> ListenerId
    where
        F: Fn(&ErrorEvent) + Send + Sync + 'static,
    {
        let id = self.next_listener_id();
        lock(&self.inner.error_observers).push((id, Arc::new(observer)));
        id
    }

    pub fn remove_error_observer(&self, id: ListenerId) -> bool {
        let mut observers = lock(&self.inner.error_observers);
        let before = observers.len();
        observers.retain(|(lid, _)| *lid != id);
        observers.len() != before
    }

    /// Dispose the scope: release every entry (most recently settled first),
    /// close live contexts, then dispose extensions in registration order.
    /// Idempotent; every later operation fails with `DisposedScope`.
    pub async fn dispose(&self) -> Result<()> {
        let (mut entries, drain) = {
            let mut state = self.lock_state();
            if state.disposed {
                return Ok(());
            }
            state.disposed = true;
            state.queue.clear();
            let entries: Vec<Entry> = state.entries.drain().map(|(_, e)| e).collect();
            (entries, state.drain.clone())
        };
        info!(scope = %self.inner.id, entries = entries.len(), "Disposing scope");

        if let Some(drain) = drain {
            let _ = drain.await;
        }

        // In-flight resolutions settle as orphans and run their own cleanups.
        for inflight in entries.iter().filter_map(|e| e.inflight.clone()) {
            let _ = inflight.await;
        }

        entries.sort_by(|a, b| b.settled_seq.cmp(&a.settled_seq));
        for entry in entries {
            self.teardown(entry).await;
        }

        self.close_all_contexts().await;
        lock(&self.inner.executions).clear();

        // A scope that was never used still disposes its extensions; only a
        // failed init skips them.
        if !matches!(self.inner.initialized.get(), Some(Err(_))) {
            for ext in self.inner.pipeline.extensions() {
                if let Err(e) = ext.dispose(self).await {
                    warn!(extension = ext.name(), error = %e, "Extension dispose failed");
                }
            }
        }

        self.inner.events.publish(RuntimeEvent::ScopeDisposed);
        info!(scope = %self.inner.id, "Scope disposed");
        Ok(())
    }

    pub(crate) fn lock_state(&self) -> MutexGuard<'_, ScopeState> {
        lock(&self.inner.state)
    }

    pub(crate) fn ensure_open(&self) -> Result<()> {
        if self.lock_state().disposed {
            Err(WeftError::DisposedScope)
        } else {
            Ok(())
        }
    }

    pub(crate) fn events(&self) -> &EventBus {
        &self.inner.events
    }

    pub(crate) fn pipeline(&self) -> &Pipeline {
        &self.inner.pipeline
    }

    pub(crate) fn preset_for(&self, id: ExecutorId) -> Option<Preset> {
        self.inner.presets.get(&id).cloned()
    }

    pub(crate) fn default_timeout(&self) -> Option<Duration> {
        self.inner.default_timeout
    }

    pub(crate) fn next_listener_id(&self) -> ListenerId {
        ListenerId(self.inner.next_listener.fetch_add(1, Ordering::Relaxed))
    }

    pub(crate) fn error_observers(&self) -> Vec<ErrorListener> {
        lock(&self.inner.error_observers)
            .iter()
            .map(|(_, l)| l.clone())
            .collect()
    }

    pub(crate) fn inner(&self) -> &ScopeInner {
        &self.inner
    }

    pub(crate) fn entry_state(&self, id: ExecutorId) -> EntryState {
        self.lock_state()
            .entries
            .get(&id)
            .map(|e| e.state)
            .unwrap_or(EntryState::Idle)
    }

    pub(crate) fn entry_value(&self, id: ExecutorId) -> Option<AnyValue> {
        let state = self.lock_state();
        state
            .entries
            .get(&id)
            .filter(|e| e.state == EntryState::Resolved)
            .and_then(|e| e.value.clone())
    }

    pub(crate) fn entry_error(&self, id: ExecutorId) -> Option<WeftError> {
        let state = self.lock_state();
        state
            .entries
            .get(&id)
            .filter(|e| e.state == EntryState::Failed)
            .and_then(|e| e.error.clone())
    }

    pub(crate) fn add_listener(&self, executor: &AnyExecutor, listener: Listener) -> Result<ListenerId> {
        let id = self.next_listener_id();
        let mut state = self.lock_state();
        if state.disposed {
            return Err(WeftError::DisposedScope);
        }
        state
            .entries
            .entry(executor.id())
            .or_insert_with(|| Entry::new(executor.clone()))
            .listeners
            .push((id, listener));
        Ok(id)
    }

    pub(crate) fn add_error_listener(
        &self,
        executor: &AnyExecutor,
        listener: ErrorListener,
    ) -> Result<ListenerId> {
        let id = self.next_listener_id();
        let mut state = self.lock_state();
        if state.disposed {
            return Err(WeftError::DisposedScope);
        }
        state
            .entries
            .entry(executor.id())
            .or_insert_with(|| Entry::new(executor.clone()))
            .error_listeners
            .push((id, listener));
        Ok(id)
    }

    pub(crate) fn remove_listener(&self, executor: ExecutorId, id: ListenerId) -> bool {
        let mut state = self.lock_state();
        let Some(entry) = state.entries.get_mut(&executor) else {
            return false;
        };
        let before = entry.listeners.len() + entry.error_listeners.len();
        entry.listeners.retain(|(lid, _)| *lid != id);
        entry.error_listeners.retain(|(lid, _)| *lid != id);
        before != entry.listeners.len() + entry.error_listeners.len()
    }
}

/// Lock a mutex, recovering the data if a panicking holder poisoned it.
pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}
