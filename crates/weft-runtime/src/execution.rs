//! Top-level flow executions started with [`Scope::exec`].

use std::fmt;
use std::sync::{Arc, Mutex};

use chrono::{DateTime, Utc};
use futures::future::{BoxFuture, Shared};
use futures::FutureExt;
use serde::Serialize;
use tracing::{debug, info};
use uuid::Uuid;

use weft_core::error::{Result, WeftError};
use weft_core::event::RuntimeEvent;
use weft_core::tag::Tagged;
use weft_core::types::ExecutionStatus;

use crate::context::{ContextOptions, Exec, ExecutionContext};
use crate::journal::{Journal, JournalHandle};
use crate::scope::{lock, Scope};

/// Options for [`Scope::exec_with`].
#[derive(Default)]
pub struct ScopeExecOptions {
    replay: Option<Journal>,
    tags: Vec<Tagged>,
}

impl ScopeExecOptions {
    pub fn new() -> Self {
        Self::default()
    }

    /// Resume from an earlier run: keyed steps found in `journal` are not re-run.
    pub fn replay(mut self, journal: Journal) -> Self {
        self.replay = Some(journal);
        self
    }

    /// Seed the root context's data.
    pub fn tag(mut self, tagged: Tagged) -> Self {
        self.tags.push(tagged);
        self
    }
}

/// Live-table row for a non-terminal execution.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ExecutionSummary {
    pub id: String,
    pub flow: String,
    pub status: ExecutionStatus,
    pub started_at: DateTime<Utc>,
}

type StatusCallback = Arc<dyn Fn(ExecutionStatus) + Send + Sync>;

struct StatusState {
    status: ExecutionStatus,
    callbacks: Vec<StatusCallback>,
}

struct Tracker {
    id: String,
    flow: String,
    scope: Scope,
    started_at: DateTime<Utc>,
    state: Mutex<StatusState>,
}

impl Tracker {
    fn status(&self) -> ExecutionStatus {
        lock(&self.state).status
    }

    /// Move to `status`, update the live table, then fire callbacks.
    fn transition(&self, status: ExecutionStatus) {
        let callbacks = {
            let mut state = lock(&self.state);
            if state.status.is_terminal() {
                return;
            }
            state.status = status;
            state.callbacks.clone()
        };

        {
            let mut executions = lock(&self.scope.inner().executions);
            if status.is_terminal() {
                executions.remove(&self.id);
            } else if let Some(row) = executions.get_mut(&self.id) {
                row.status = status;
            }
        }

        debug!(execution = %self.id, flow = %self.flow, status = %status, "Execution status changed");
        self.scope.events().publish(RuntimeEvent::ExecutionStatus {
            execution: self.id.clone(),
            flow: self.flow.clone(),
            status,
        });
        for callback in callbacks {
            callback(status);
        }
    }
}

/// Handle to a running top-level flow.
pub struct FlowExecution<O> {
    tracker: Arc<Tracker>,
    context: ExecutionContext,
    journal: JournalHandle,
    result: Shared<BoxFuture<'static, Result<O>>>,
}

impl<O> Clone for FlowExecution<O> {
    fn clone(&self) -> Self {
        Self {
            tracker: self.tracker.clone(),
            context: self.context.clone(),
            journal: self.journal.clone(),
            result: self.result.clone(),
        }
    }
}

impl<O> fmt::Debug for FlowExecution<O> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FlowExecution")
            .field("id", &self.tracker.id)
            .field("flow", &self.tracker.flow)
            .field("status", &self.tracker.status())
            .finish()
    }
}

impl<O: Clone + Send + Sync + 'static> FlowExecution<O> {
    pub fn id(&self) -> &str {
        &self.tracker.id
    }

    pub fn flow(&self) -> &str {
        &self.tracker.flow
    }

    pub fn status(&self) -> ExecutionStatus {
        self.tracker.status()
    }

    pub fn started_at(&self) -> DateTime<Utc> {
        self.tracker.started_at
    }

    /// Root context the flow runs under. Closed once the execution settles.
    pub fn context(&self) -> &ExecutionContext {
        &self.context
    }

    /// Call `callback` on every later status change. Registering after the
    /// execution settled calls it once with the terminal status.
    pub fn on_status<F>(&self, callback: F)
    where
        F: Fn(ExecutionStatus) + Send + Sync + 'static,
    {
        let callback: StatusCallback = Arc::new(callback);
        let settled = {
            let mut state = lock(&self.tracker.state);
            if state.status.is_terminal() {
                Some(state.status)
            } else {
                state.callbacks.push(callback.clone());
                None
            }
        };
        if let Some(status) = settled {
            callback(status);
        }
    }

    /// Cancel the run. The flow observes it at its next exec boundary.
    pub fn cancel(&self, reason: impl Into<String>) {
        self.context.cancel(reason);
    }

    pub async fn wait(&self) -> Result<O> {
        self.result.clone().await
    }

    /// Steps journaled so far, including replayed ones.
    pub fn snapshot(&self) -> Journal {
        self.journal.snapshot()
    }
}

impl Scope {
    /// Start `exec` as a top-level execution in a new root context.
    pub fn exec<O: Clone + Send + Sync + 'static>(&self, exec: Exec<O>) -> Result<FlowExecution<O>> {
        self.exec_with(exec, ScopeExecOptions::default())
    }

    pub fn exec_with<O: Clone + Send + Sync + 'static>(
        &self,
        exec: Exec<O>,
        options: ScopeExecOptions,
    ) -> Result<FlowExecution<O>> {
        let flow = exec.name().to_string();
        let mut context_options = ContextOptions::new().name(flow.clone());
        if let Some(journal) = options.replay {
            context_options = context_options.journal(journal);
        }
        for tagged in options.tags {
            context_options = context_options.tag(tagged);
        }
        let root = self.create_context_with(context_options)?;
        let journal = root.journal_handle()?;

        let tracker = Arc::new(Tracker {
            id: Uuid::new_v4().to_string(),
            flow: flow.clone(),
            scope: self.clone(),
            started_at: Utc::now(),
            state: Mutex::new(StatusState {
                status: ExecutionStatus::Pending,
                callbacks: Vec::new(),
            }),
        });
        lock(&self.inner().executions).insert(
            tracker.id.clone(),
            ExecutionSummary {
                id: tracker.id.clone(),
                flow: flow.clone(),
                status: ExecutionStatus::Pending,
                started_at: tracker.started_at,
            },
        );
        info!(execution = %tracker.id, flow = %flow, "Starting execution");

        let task = {
            let tracker = tracker.clone();
            let root = root.clone();
            tokio::spawn(async move {
                tracker.transition(ExecutionStatus::Running);
                let result = root.exec(exec).await;
                let status = match &result {
                    Ok(_) => ExecutionStatus::Completed,
                    Err(e) if e.is_cancelled() || root.is_cancelled() => ExecutionStatus::Cancelled,
                    Err(_) => ExecutionStatus::Failed,
                };
                let _ = root.close().await;
                info!(execution = %tracker.id, flow = %tracker.flow, status = %status, "Execution settled");
                tracker.transition(status);
                result
            })
        };
        let result = async move {
            task.await
                .unwrap_or_else(|e| Err(WeftError::Internal(format!("execution task failed: {}", e))))
        }
        .boxed()
        .shared();

        Ok(FlowExecution {
            tracker,
            context: root,
            journal,
            result,
        })
    }

    /// Executions that have not reached a terminal status, oldest first.
    pub fn active_executions(&self) -> Vec<ExecutionSummary> {
        let mut rows: Vec<ExecutionSummary> = lock(&self.inner().executions).values().cloned().collect();
        rows.sort_by_key(|r| r.started_at);
        rows
    }
}
