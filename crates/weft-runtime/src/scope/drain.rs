//! Invalidation drain.
//!
//! `invalidate` pushes onto the queue; one drain task per cycle pops and
//! applies invalidations strictly one at a time. Each queued item carries the
//! causal chain of executors whose invalidation led to it, and an item whose
//! executor already appears in its own chain is a loop.

use std::collections::VecDeque;

use futures::FutureExt;
use tracing::{debug, error};

use weft_core::error::{Result, WeftError};
use weft_core::event::RuntimeEvent;
use weft_core::types::AnyValue;

use super::entry::run_cleanups;
use super::{notify, ControllerEvent, EntryState, Scope};
use crate::executor::ExecutorId;

pub(crate) struct PendingInvalidation {
    pub id: ExecutorId,
    /// Executors whose invalidation caused this one, oldest first.
    pub chain: Vec<ExecutorId>,
    /// Value to store instead of running the factory.
    pub replacement: Option<AnyValue>,
}

#[derive(Default)]
pub(crate) struct InvalidationQueue {
    items: VecDeque<PendingInvalidation>,
    /// Chain of the item being processed; inherited by invalidations it triggers.
    current_chain: Option<Vec<ExecutorId>>,
}

impl InvalidationQueue {
    /// Enqueue, coalescing with an item already queued for the same executor.
    /// The queued position and chain are kept; a newer replacement value wins.
    pub fn push(&mut self, item: PendingInvalidation) {
        match self.items.iter_mut().find(|p| p.id == item.id) {
            Some(existing) => {
                if item.replacement.is_some() {
                    existing.replacement = item.replacement;
                }
            }
            None => self.items.push_back(item),
        }
    }

    pub fn pop(&mut self) -> Option<PendingInvalidation> {
        self.items.pop_front()
    }

    pub fn clear(&mut self) {
        self.items.clear();
        self.current_chain = None;
    }

    /// Drop queued items for any of `ids`. Returns how many were dropped.
    pub fn discard(&mut self, ids: &[ExecutorId]) -> usize {
        let before = self.items.len();
        self.items.retain(|p| !ids.contains(&p.id));
        before - self.items.len()
    }

    #[cfg(test)]
    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn current_chain(&self) -> Vec<ExecutorId> {
        self.current_chain.clone().unwrap_or_default()
    }
}

impl Scope {
    /// Queue an invalidation for `id`. An entry that is mid-resolution
    /// coalesces it into a single follow-up instead.
    pub(crate) fn schedule_invalidation(&self, id: ExecutorId, replacement: Option<AnyValue>) -> Result<()> {
        let start_drain = {
            let mut state = self.lock_state();
            if state.disposed {
                return Err(WeftError::DisposedScope);
            }
            match state.entries.get_mut(&id) {
                None => return Ok(()),
                Some(entry) if entry.state == EntryState::Resolving => {
                    entry.pending_invalidate = true;
                    if replacement.is_some() {
                        entry.pending_replacement = replacement;
                    }
                    return Ok(());
                }
                Some(_) => {}
            }
            let chain = state.queue.current_chain();
            state.queue.push(PendingInvalidation {
                id,
                chain,
                replacement,
            });
            state.drain.is_none()
        };

        if start_drain {
            self.ensure_drain();
        }
        Ok(())
    }

    /// Start the drain task unless one is already running.
    pub(crate) fn ensure_drain(&self) {
        let mut state = self.lock_state();
        if state.drain.is_some() {
            return;
        }
        let scope = self.clone();
        let task = tokio::spawn(async move { scope.drain().await });
        let drain = async move {
            task.await
                .unwrap_or_else(|e| Err(WeftError::Internal(format!("invalidation drain failed: {}", e))))
        }
        .boxed()
        .shared();
        state.drain = Some(drain);
    }

    /// Wait until every queued invalidation, and every invalidation those
    /// trigger, has been applied. Surfaces an invalidation loop detected
    /// during the cycle.
    pub async fn flush(&self) -> Result<()> {
        let drain = {
            let state = self.lock_state();
            if state.disposed {
                return Err(WeftError::DisposedScope);
            }
            state.drain.clone()
        };
        match drain {
            Some(drain) => drain.await,
            None => Ok(()),
        }
    }

    /// A loop stops only the executors on the cycle. The rest of the queue,
    /// including dependents of the last value written, still drains and the
    /// first loop error is returned once the queue is empty.
    async fn drain(self) -> Result<()> {
        let mut processed = 0_usize;
        let mut failure = None;
        loop {
            let item = {
                let mut state = self.lock_state();
                match state.queue.pop() {
                    Some(item) => item,
                    None => {
                        state.queue.current_chain = None;
                        state.drain = None;
                        debug!(processed, "Invalidation drain settled");
                        return failure.map_or(Ok(()), Err);
                    }
                }
            };

            match self.process_invalidation(item).await {
                Ok(()) => processed += 1,
                Err(e) if failure.is_none() => failure = Some(e),
                Err(_) => {}
            }
        }
    }

    async fn process_invalidation(&self, item: PendingInvalidation) -> Result<()> {
        let PendingInvalidation {
            id,
            chain,
            replacement,
        } = item;

        if let Some(start) = chain.iter().position(|c| *c == id) {
            let cycle = {
                let mut state = self.lock_state();
                let dropped = state.queue.discard(&chain[start..]);
                if dropped > 0 {
                    debug!(dropped, "Dropped queued invalidations on the loop");
                }
                chain[start..]
                    .iter()
                    .chain(std::iter::once(&id))
                    .map(|c| {
                        state
                            .entries
                            .get(c)
                            .map(|e| e.executor.name().to_string())
                            .unwrap_or_else(|| c.to_string())
                    })
                    .collect::<Vec<_>>()
            };
            error!(cycle = %cycle.join(" -> "), "Invalidation loop detected");
            self.events()
                .publish(RuntimeEvent::InvalidationLoop { cycle: cycle.clone() });
            return Err(WeftError::InvalidationLoop { cycle });
        }

        let mut next_chain = chain;
        next_chain.push(id);

        let (executor, cleanups) = {
            let mut state = self.lock_state();
            if state.disposed {
                return Ok(());
            }
            let Some(entry) = state.entries.get_mut(&id) else {
                return Ok(());
            };
            match entry.state {
                EntryState::Resolving => {
                    entry.pending_invalidate = true;
                    if replacement.is_some() {
                        entry.pending_replacement = replacement;
                    }
                    return Ok(());
                }
                EntryState::Idle if replacement.is_none() => return Ok(()),
                _ => {}
            }
            let executor = entry.executor.clone();
            let cleanups = std::mem::take(&mut entry.cleanups);
            state.queue.current_chain = Some(next_chain.clone());
            (executor, cleanups)
        };

        debug!(executor = %executor.name(), "Invalidating executor");
        run_cleanups(executor.name(), cleanups).await;

        let (resolution, listeners) = {
            let mut state = self.lock_state();
            if state.disposed || !state.entries.contains_key(&id) {
                return Ok(());
            }
            let chain = next_chain[..next_chain.len() - 1].to_vec();
            self.begin_resolution(&mut state, &executor, chain, replacement)
        };

        self.events().publish(RuntimeEvent::ExecutorInvalidated {
            executor: executor.name().to_string(),
        });
        notify(&listeners, &ControllerEvent::Resolving);

        // Failures are cached on the entry and reported to observers.
        let _ = resolution.await;

        let mut state = self.lock_state();
        let mut dependents: Vec<ExecutorId> = Vec::new();
        for (dep_id, entry) in state.entries.iter_mut() {
            if !self.effective_dependencies(&entry.executor).contains(id) {
                continue;
            }
            match entry.state {
                EntryState::Resolved | EntryState::Failed => dependents.push(*dep_id),
                EntryState::Resolving => entry.pending_invalidate = true,
                EntryState::Idle => {}
            }
        }
        dependents.sort();
        for dependent in dependents {
            state.queue.push(PendingInvalidation {
                id: dependent,
                chain: next_chain.clone(),
                replacement: None,
            });
        }
        Ok(())
    }
}
