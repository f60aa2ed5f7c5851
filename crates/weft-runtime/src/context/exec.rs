use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use futures::future::{join_all, try_join_all, BoxFuture};
use futures::FutureExt;
use serde::de::DeserializeOwned;
use serde::Serialize;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use weft_core::error::{Result, WeftError};
use weft_core::tag::{TagBag, Tagged};
use weft_core::types::{downcast, erase, AnyValue};

use super::arena::ContextNode;
use super::{CloseGuard, ContextDetails, ExecutionContext};
use crate::extension::{ExecTarget, Next, Operation};
use crate::flow::Flow;
use crate::journal::{journal_key, JournalCodec, JournalHandle};
use crate::scope::lock;

type Runner<O> = Box<dyn FnOnce(ExecutionContext) -> BoxFuture<'static, Result<O>> + Send>;

/// One unit of nested work: a flow with its input, or an ad-hoc function.
///
/// ```ignore
/// let total = ctx
///     .exec(Exec::flow(&checkout, order).key("checkout").timeout(Duration::from_secs(5)))
///     .await?;
/// ```
pub struct Exec<O> {
    target: ExecTarget,
    runner: Runner<O>,
    input: Option<AnyValue>,
    key: Option<String>,
    timeout: Option<Duration>,
    tags: Vec<Tagged>,
    codec: Option<JournalCodec<O>>,
}

impl<O: Clone + Send + Sync + 'static> Exec<O> {
    /// Run `flow` with `input` in a fresh child context.
    pub fn flow<I>(flow: &Flow<I, O>, input: I) -> Self
    where
        I: Clone + Send + Sync + 'static,
    {
        let erased_input = erase(input.clone());
        let tags = flow.tags().to_vec();
        let flow = flow.clone();
        Self {
            target: ExecTarget::Flow(flow.name().to_string()),
            runner: Box::new(move |ctx| async move { flow.invoke(ctx, input).await }.boxed()),
            input: Some(erased_input),
            key: None,
            timeout: None,
            tags,
            codec: None,
        }
    }

    /// Run a function in a fresh child context. Parameters are captured by
    /// the closure.
    pub fn function<F, Fut>(name: impl Into<String>, f: F) -> Self
    where
        F: FnOnce(ExecutionContext) -> Fut + Send + 'static,
        Fut: Future<Output = Result<O>> + Send + 'static,
    {
        Self {
            target: ExecTarget::Function(name.into()),
            runner: Box::new(move |ctx| f(ctx).boxed()),
            input: None,
            key: None,
            timeout: None,
            tags: Vec::new(),
            codec: None,
        }
    }

    pub fn name(&self) -> &str {
        self.target.name()
    }

    pub fn target(&self) -> &ExecTarget {
        &self.target
    }

    /// Cancel the child context after `timeout`.
    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    /// Seed the child context's data.
    pub fn tag(mut self, tagged: Tagged) -> Self {
        self.tags.push(tagged);
        self
    }

    pub fn tags(mut self, tagged: impl IntoIterator<Item = Tagged>) -> Self {
        self.tags.extend(tagged);
        self
    }
}

impl<O> Exec<O>
where
    O: Clone + Serialize + DeserializeOwned + Send + Sync + 'static,
{
    /// Journal the outcome under `key`. A replayed run returns the recorded
    /// outcome without executing.
    pub fn key(mut self, key: impl Into<String>) -> Self {
        self.key = Some(key.into());
        self.codec = Some(JournalCodec::json());
        self
    }
}

struct ChildSpec {
    name: String,
    key: Option<String>,
    tags: Vec<Tagged>,
    timeout: Option<Duration>,
    path: Vec<String>,
    journal: JournalHandle,
}

impl ExecutionContext {
    /// Run nested work in a child context. The child is closed, running its
    /// close callbacks, before this returns.
    pub async fn exec<O: Clone + Send + Sync + 'static>(&self, exec: Exec<O>) -> Result<O> {
        self.scope.initialize().await?;
        self.scope.ensure_open()?;
        let (journal, path) = self.with_node(|n| (n.journal.clone(), n.path.clone()))?;
        if self.is_cancelled() {
            return Err(self.cancelled_error());
        }

        let Exec {
            target,
            runner,
            input,
            key,
            timeout,
            tags,
            codec,
        } = exec;

        let recorded = match (&key, &codec) {
            (Some(key), Some(codec)) => Some((journal_key(&path, key), *codec)),
            _ => None,
        };
        if let Some((full_key, codec)) = &recorded {
            if let Some(outcome) = journal.lookup(full_key) {
                debug!(key = %full_key, "Replaying journaled exec");
                return codec.replay(full_key, outcome);
            }
        }

        let mut child_path = path;
        if let Some(key) = &key {
            child_path.push(key.clone());
        }
        let child = self.spawn_child(ChildSpec {
            name: target.name().to_string(),
            key: key.clone(),
            tags,
            timeout: timeout.or(self.scope.default_timeout()),
            path: child_path,
            journal: journal.clone(),
        })?;
        let guard = CloseGuard::new(child.clone());

        let subject = target.name().to_string();
        let operation = Arc::new(Operation::Execute {
            target,
            context: child.clone(),
            key,
            input,
        });
        let core = {
            let child = child.clone();
            Next::new(move || {
                let run = runner(child);
                async move { run.await.map(erase) }.boxed()
            })
        };

        let outcome = self
            .scope
            .pipeline()
            .run(self.scope.clone(), operation.clone(), core)
            .await;
        if let Err(e) = &outcome {
            self.scope.pipeline().report_error(&self.scope, &operation, e);
        }

        guard.disarm();
        if let Err(e) = child.close().await {
            debug!(context = %child.id(), error = %e, "Child closed before its exec settled");
        }

        let result = outcome.and_then(|value| take_output::<O>(value, &subject));
        if let Some((full_key, codec)) = recorded {
            record(&journal, full_key, &codec, &result);
        }
        result
    }

    /// Run `flow` with `input` in a child context.
    pub async fn exec_flow<I, O>(&self, flow: &Flow<I, O>, input: I) -> Result<O>
    where
        I: Clone + Send + Sync + 'static,
        O: Clone + Send + Sync + 'static,
    {
        self.exec(Exec::flow(flow, input)).await
    }

    /// Run a journaled step in this context. Extensions see it as an
    /// `Execute` operation targeting `Step(key)`.
    pub async fn run<O, F, Fut>(&self, key: impl Into<String>, f: F) -> Result<O>
    where
        O: Clone + Serialize + DeserializeOwned + Send + Sync + 'static,
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = Result<O>> + Send + 'static,
    {
        self.scope.initialize().await?;
        self.scope.ensure_open()?;
        let key = key.into();
        let (journal, path) = self.with_node(|n| (n.journal.clone(), n.path.clone()))?;
        if self.is_cancelled() {
            return Err(self.cancelled_error());
        }

        let codec = JournalCodec::<O>::json();
        let full_key = journal_key(&path, &key);
        if let Some(outcome) = journal.lookup(&full_key) {
            debug!(key = %full_key, "Replaying journaled step");
            return codec.replay(&full_key, outcome);
        }

        let operation = Arc::new(Operation::Execute {
            target: ExecTarget::Step(key.clone()),
            context: self.clone(),
            key: Some(key.clone()),
            input: None,
        });
        let core = Next::new(move || async move { f().await.map(erase) }.boxed());

        let outcome = self
            .scope
            .pipeline()
            .run(self.scope.clone(), operation.clone(), core)
            .await;
        if let Err(e) = &outcome {
            self.scope.pipeline().report_error(&self.scope, &operation, e);
        }

        let result = outcome.and_then(|value| take_output::<O>(value, &key));
        record(&journal, full_key, &codec, &result);
        result
    }

    /// Run every exec concurrently, each in its own child. Fails with the
    /// first error; the remaining branches still run to completion.
    pub async fn parallel<O: Clone + Send + Sync + 'static>(&self, execs: Vec<Exec<O>>) -> Result<Vec<O>> {
        try_join_all(self.spawn_branches(execs).into_iter().map(join_branch)).await
    }

    /// Run every exec concurrently and report each outcome.
    pub async fn parallel_settled<O: Clone + Send + Sync + 'static>(
        &self,
        execs: Vec<Exec<O>>,
    ) -> Vec<Result<O>> {
        join_all(self.spawn_branches(execs).into_iter().map(join_branch)).await
    }

    fn spawn_branches<O: Clone + Send + Sync + 'static>(
        &self,
        execs: Vec<Exec<O>>,
    ) -> Vec<JoinHandle<Result<O>>> {
        execs
            .into_iter()
            .map(|exec| {
                let ctx = self.clone();
                tokio::spawn(async move { ctx.exec(exec).await })
            })
            .collect()
    }

    fn spawn_child(&self, spec: ChildSpec) -> Result<ExecutionContext> {
        let child = {
            let mut arena = lock(&self.scope.inner().contexts);
            let parent = arena.get(self.id).ok_or_else(|| self.closed())?;
            let token = parent.token.child_token();
            let depth = parent.details.depth + 1;
            let node = ContextNode {
                parent: Some(self.id),
                children: Vec::new(),
                data: TagBag::from_tagged(spec.tags),
                token: token.clone(),
                cancel_reason: None,
                close_callbacks: Vec::new(),
                details: ContextDetails {
                    name: Some(spec.name),
                    key: spec.key,
                    depth,
                    started_at: Utc::now(),
                    ended_at: None,
                },
                journal: spec.journal,
                path: spec.path,
                timer: None,
            };
            let id = arena.insert(node);
            if let Some(parent) = arena.get_mut(self.id) {
                parent.children.push(id);
            }
            ExecutionContext {
                scope: self.scope.clone(),
                id,
                token,
            }
        };
        debug!(context = %child.id, parent = %self.id, "Created child context");

        if let Some(timeout) = spec.timeout {
            let timer = tokio::spawn(cancel_after(child.clone(), timeout));
            let _ = child.with_node(|n| n.timer = Some(timer));
        }
        Ok(child)
    }
}

async fn cancel_after(ctx: ExecutionContext, timeout: Duration) {
    let token = ctx.signal();
    tokio::select! {
        _ = tokio::time::sleep(timeout) => {
            debug!(context = %ctx.id(), ?timeout, "Exec timed out");
            ctx.cancel(format!("timed out after {:?}", timeout));
        }
        _ = token.cancelled() => {}
    }
}

async fn join_branch<O>(handle: JoinHandle<Result<O>>) -> Result<O> {
    handle
        .await
        .unwrap_or_else(|e| Err(WeftError::Internal(format!("parallel branch failed: {}", e))))
}

/// Recover an owned output from the pipeline's erased value.
fn take_output<O: Clone + Send + Sync + 'static>(value: AnyValue, subject: &str) -> Result<O> {
    let value = downcast::<O>(value, subject)?;
    Ok(Arc::try_unwrap(value).unwrap_or_else(|shared| (*shared).clone()))
}

fn record<O>(journal: &JournalHandle, key: String, codec: &JournalCodec<O>, result: &Result<O>) {
    match codec.outcome(result) {
        Some(Ok(outcome)) => journal.record(key, outcome),
        Some(Err(e)) => warn!(key = %key, error = %e, "Step output could not be journaled"),
        None => {}
    }
}
