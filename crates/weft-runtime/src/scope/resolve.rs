use std::panic::AssertUnwindSafe;
use std::sync::{Arc, Mutex};

use futures::future::{join_all, BoxFuture};
use futures::FutureExt;
use tracing::debug;

use weft_core::error::{Result, WeftError};
use weft_core::event::RuntimeEvent;
use weft_core::types::AnyValue;

use super::drain::PendingInvalidation;
use super::entry::{notify_errors, run_cleanups, SharedResolution};
use super::{
    lock, notify, ControllerEvent, Entry, EntryState, ErrorEvent, FactoryContext, Listener, Preset,
    Scope, ScopeState,
};
use crate::executor::{AnyExecutor, DependencyShape, ErasedFactory, ExecutorId, ResolvedDependencies};
use crate::extension::{Next, Operation};

impl Scope {
    /// Resolve by erased handle. Boxed so factories can resolve recursively.
    pub(crate) fn resolve_any(&self, executor: AnyExecutor) -> BoxFuture<'static, Result<AnyValue>> {
        let scope = self.clone();
        async move {
            scope.initialize().await?;

            let (resolution, listeners) = {
                let mut state = scope.lock_state();
                if state.disposed {
                    return Err(WeftError::DisposedScope);
                }
                let current = state
                    .entries
                    .entry(executor.id())
                    .or_insert_with(|| Entry::new(executor.clone()));
                match current.state {
                    EntryState::Resolved | EntryState::Failed => {
                        return current.settled().unwrap_or_else(|| {
                            Err(WeftError::Internal(format!(
                                "settled entry '{}' holds no outcome",
                                executor.name()
                            )))
                        });
                    }
                    EntryState::Resolving => match current.inflight.clone() {
                        Some(inflight) => (inflight, Vec::new()),
                        None => {
                            return Err(WeftError::Internal(format!(
                                "entry '{}' is resolving without an in-flight resolution",
                                executor.name()
                            )))
                        }
                    },
                    EntryState::Idle => scope.begin_resolution(&mut state, &executor, Vec::new(), None),
                }
            };

            notify(&listeners, &ControllerEvent::Resolving);
            resolution.await
        }
        .boxed()
    }

    /// Flip an entry to `Resolving` and set up its shared resolution. Caller
    /// holds the state lock.
    pub(crate) fn begin_resolution(
        &self,
        state: &mut ScopeState,
        executor: &AnyExecutor,
        chain: Vec<ExecutorId>,
        replacement: Option<AnyValue>,
    ) -> (SharedResolution, Vec<Listener>) {
        state.next_generation += 1;
        let generation = state.next_generation;

        let entry = state
            .entries
            .entry(executor.id())
            .or_insert_with(|| Entry::new(executor.clone()));
        entry.state = EntryState::Resolving;
        entry.value = None;
        entry.error = None;
        entry.chain = chain;
        entry.generation = generation;

        debug!(executor = %executor.name(), generation, "Resolving executor");

        // Spawned on first poll, so callers can notify `Resolving` listeners first.
        let name = executor.name().to_string();
        let run = self.clone().run_resolution(executor.clone(), generation, replacement);
        let shared = async move {
            tokio::spawn(run).await.unwrap_or_else(|e| {
                Err(WeftError::Internal(format!(
                    "resolution task for '{}' failed: {}",
                    name, e
                )))
            })
        }
        .boxed()
        .shared();

        entry.inflight = Some(shared.clone());
        (shared, entry.listener_snapshot())
    }

    async fn run_resolution(
        self,
        executor: AnyExecutor,
        generation: u64,
        replacement: Option<AnyValue>,
    ) -> Result<AnyValue> {
        let cleanups = Arc::new(Mutex::new(Vec::new()));

        let result = match (replacement, self.preset_for(executor.id())) {
            (Some(value), _) | (None, Some(Preset::Value(value))) => Ok(value),
            (None, Some(Preset::Executor(replacement))) => {
                self.produce(
                    &executor,
                    replacement.dependencies().clone(),
                    replacement.factory(),
                    cleanups.clone(),
                )
                .await
            }
            (None, None) => {
                self.produce(
                    &executor,
                    executor.dependencies().clone(),
                    executor.factory(),
                    cleanups.clone(),
                )
                .await
            }
        };

        let cleanups = std::mem::take(&mut *lock(&cleanups));
        self.settle(&executor, generation, result, cleanups).await
    }

    /// Resolve dependencies, then run the factory through the extension pipeline.
    async fn produce(
        &self,
        executor: &AnyExecutor,
        dependencies: DependencyShape,
        factory: ErasedFactory,
        cleanups: Arc<Mutex<Vec<super::Cleanup>>>,
    ) -> Result<AnyValue> {
        let resolved = self.resolve_dependencies(executor, &dependencies).await?;

        let operation = Arc::new(Operation::Resolve {
            executor: executor.clone(),
        });
        let ctx = FactoryContext::new(self.clone(), executor.clone(), cleanups);
        let core = Next::new(move || factory(resolved, ctx));

        let run = self.pipeline().run(self.clone(), operation.clone(), core);
        let result = match AssertUnwindSafe(run).catch_unwind().await {
            Ok(result) => result,
            Err(_) => Err(WeftError::msg(format!(
                "factory for '{}' panicked",
                executor.name()
            ))),
        };

        result.map_err(|e| {
            self.pipeline().report_error(self, &operation, &e);
            match e {
                WeftError::DisposedScope => e,
                e @ WeftError::DependencyResolution { .. } => e,
                e => WeftError::ExecutorResolution {
                    executor: executor.name().to_string(),
                    cause: Arc::new(e),
                },
            }
        })
    }

    /// Siblings resolve concurrently; the first failure in declaration order wins.
    async fn resolve_dependencies(
        &self,
        executor: &AnyExecutor,
        dependencies: &DependencyShape,
    ) -> Result<ResolvedDependencies> {
        let wrap = |dependency: &AnyExecutor, e: WeftError| match e {
            WeftError::DisposedScope => e,
            e => WeftError::DependencyResolution {
                executor: executor.name().to_string(),
                dependency: dependency.name().to_string(),
                cause: Arc::new(e),
            },
        };

        match dependencies {
            DependencyShape::None => Ok(ResolvedDependencies::None),
            DependencyShape::Single(dep) => self
                .resolve_any(dep.clone())
                .await
                .map(ResolvedDependencies::Single)
                .map_err(|e| wrap(dep, e)),
            DependencyShape::List(deps) => {
                let outcomes = join_all(deps.iter().map(|d| self.resolve_any(d.clone()))).await;
                let mut values = Vec::with_capacity(outcomes.len());
                for (dep, outcome) in deps.iter().zip(outcomes) {
                    values.push(outcome.map_err(|e| wrap(dep, e))?);
                }
                Ok(ResolvedDependencies::List(values))
            }
            DependencyShape::Map(deps) => {
                let outcomes = join_all(deps.values().map(|d| self.resolve_any(d.clone()))).await;
                let mut values = std::collections::BTreeMap::new();
                for ((key, dep), outcome) in deps.iter().zip(outcomes) {
                    values.insert(key.clone(), outcome.map_err(|e| wrap(dep, e))?);
                }
                Ok(ResolvedDependencies::Map(values))
            }
        }
    }

    /// Store a finished resolution. Stale completions (the entry was released
    /// or re-resolved meanwhile) run their cleanups immediately.
    async fn settle(
        &self,
        executor: &AnyExecutor,
        generation: u64,
        result: Result<AnyValue>,
        cleanups: Vec<super::Cleanup>,
    ) -> Result<AnyValue> {
        let settled = {
            let mut state = self.lock_state();
            state.settle_counter += 1;
            let seq = state.settle_counter;

            let current = state
                .entries
                .get_mut(&executor.id())
                .filter(|e| e.generation == generation);
            match current {
                None => Err(cleanups),
                Some(entry) => {
                    entry.inflight = None;
                    entry.cleanups = cleanups;
                    entry.settled_seq = seq;
                    match &result {
                        Ok(value) => {
                            entry.state = EntryState::Resolved;
                            entry.value = Some(value.clone());
                            entry.error = None;
                        }
                        Err(e) => {
                            entry.state = EntryState::Failed;
                            entry.value = None;
                            entry.error = Some(e.clone());
                        }
                    }

                    let follow_up = if entry.pending_invalidate {
                        entry.pending_invalidate = false;
                        Some(PendingInvalidation {
                            id: executor.id(),
                            chain: entry.chain.clone(),
                            replacement: entry.pending_replacement.take(),
                        })
                    } else {
                        None
                    };
                    let listeners = entry.listener_snapshot();
                    let error_listeners = entry.error_listener_snapshot();

                    let start_drain = match follow_up {
                        Some(item) => {
                            state.queue.push(item);
                            state.drain.is_none()
                        }
                        None => false,
                    };
                    Ok((listeners, error_listeners, start_drain))
                }
            }
        };

        let (listeners, error_listeners, follow_up) = match settled {
            Ok(parts) => parts,
            Err(cleanups) => {
                debug!(executor = %executor.name(), "Discarding stale resolution");
                run_cleanups(executor.name(), cleanups).await;
                return result;
            }
        };

        match &result {
            Ok(_) => {
                debug!(executor = %executor.name(), "Executor resolved");
                self.events().publish(RuntimeEvent::ExecutorResolved {
                    executor: executor.name().to_string(),
                });
                notify(&listeners, &ControllerEvent::Resolved);
            }
            Err(e) => {
                debug!(executor = %executor.name(), error = %e, "Executor failed");
                self.events().publish(RuntimeEvent::ExecutorFailed {
                    executor: executor.name().to_string(),
                    error: e.to_string(),
                });
                notify(&listeners, &ControllerEvent::Failed(e.clone()));
                let event = ErrorEvent {
                    executor: executor.name().to_string(),
                    error: e.clone(),
                };
                notify_errors(&error_listeners, &event);
                notify_errors(&self.error_observers(), &event);
            }
        }

        if follow_up {
            self.ensure_drain();
        }
        result
    }

    /// Drop one entry and run its cleanups. In-flight work settles first.
    pub(crate) async fn release_id(&self, id: ExecutorId) -> Result<()> {
        // The entry stays in the table while it resolves so concurrent
        // resolves join the in-flight call instead of starting another.
        let entry = loop {
            let inflight = {
                let mut state = self.lock_state();
                if state.disposed {
                    return Err(WeftError::DisposedScope);
                }
                let inflight = match state.entries.get(&id) {
                    None => return Ok(()),
                    Some(entry) if entry.state == EntryState::Resolving => entry.inflight.clone(),
                    Some(_) => None,
                };
                match inflight {
                    Some(inflight) => inflight,
                    None => match state.entries.remove(&id) {
                        Some(entry) => break entry,
                        None => return Ok(()),
                    },
                }
            };
            let _ = inflight.await;
        };
        self.teardown(entry).await;
        Ok(())
    }

    pub(crate) async fn teardown(&self, mut entry: Entry) {
        let name = entry.executor.name().to_string();
        let cleanups = std::mem::take(&mut entry.cleanups);
        run_cleanups(&name, cleanups).await;
        notify(&entry.listener_snapshot(), &ControllerEvent::Released);
        self.events()
            .publish(RuntimeEvent::ExecutorReleased { executor: name.clone() });
        debug!(executor = %name, "Executor released");
    }

    /// Dependencies the scope actually resolves for `executor`, honoring presets.
    pub(crate) fn effective_dependencies(&self, executor: &AnyExecutor) -> DependencyShape {
        match self.preset_for(executor.id()) {
            Some(Preset::Value(_)) => DependencyShape::None,
            Some(Preset::Executor(replacement)) => replacement.dependencies().clone(),
            None => executor.dependencies().clone(),
        }
    }
}
