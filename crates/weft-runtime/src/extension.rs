//! Extension pipeline: ordered interceptors around every resolve/execute.
//!
//! The extension list is folded into a single handler when the scope is
//! built; the first registered extension is the outermost wrapper.

use std::fmt;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use futures::future::BoxFuture;
use futures::FutureExt;
use tracing::warn;

use weft_core::error::{Result, WeftError};
use weft_core::types::AnyValue;

use crate::context::ExecutionContext;
use crate::executor::AnyExecutor;
use crate::scope::Scope;

/// What an execute operation runs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ExecTarget {
    /// A named flow.
    Flow(String),
    /// An ad-hoc function exec.
    Function(String),
    /// A journaled step run with `ExecutionContext::run`.
    Step(String),
}

impl ExecTarget {
    pub fn name(&self) -> &str {
        match self {
            Self::Flow(n) | Self::Function(n) | Self::Step(n) => n,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OperationKind {
    Resolve,
    Execute,
}

/// The operation an extension is wrapping.
#[derive(Clone)]
pub enum Operation {
    Resolve {
        executor: AnyExecutor,
    },
    Execute {
        target: ExecTarget,
        /// The context the work runs in (the fresh child for flow/function execs).
        context: ExecutionContext,
        key: Option<String>,
        input: Option<AnyValue>,
    },
}

impl Operation {
    pub fn kind(&self) -> OperationKind {
        match self {
            Self::Resolve { .. } => OperationKind::Resolve,
            Self::Execute { .. } => OperationKind::Execute,
        }
    }

    /// Executor or exec target name.
    pub fn name(&self) -> &str {
        match self {
            Self::Resolve { executor } => executor.name(),
            Self::Execute { target, .. } => target.name(),
        }
    }
}

impl fmt::Debug for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Resolve { executor } => f
                .debug_struct("Resolve")
                .field("executor", &executor.name())
                .finish(),
            Self::Execute {
                target,
                context,
                key,
                ..
            } => f
                .debug_struct("Execute")
                .field("target", target)
                .field("context", &context.id())
                .field("key", key)
                .finish(),
        }
    }
}

/// Continuation of the pipeline. Consumed by [`Next::run`], so it can be
/// invoked at most once.
pub struct Next {
    run: Box<dyn FnOnce() -> BoxFuture<'static, Result<AnyValue>> + Send>,
}

impl Next {
    pub(crate) fn new<F>(run: F) -> Self
    where
        F: FnOnce() -> BoxFuture<'static, Result<AnyValue>> + Send + 'static,
    {
        Self { run: Box::new(run) }
    }

    /// Run the rest of the pipeline and the operation itself.
    pub fn run(self) -> BoxFuture<'static, Result<AnyValue>> {
        (self.run)()
    }
}

/// Cross-cutting interceptor.
///
/// `wrap` must call `next.run()` and pass its outcome through unless it
/// deliberately substitutes it.
pub trait Extension: Send + Sync + 'static {
    fn name(&self) -> &str;

    /// Runs once per scope, before the first operation.
    ///
    /// Must not resolve or execute through `scope`: the scope is waiting on init.
    fn init<'a>(&'a self, scope: &'a Scope) -> BoxFuture<'a, Result<()>> {
        let _ = scope;
        Box::pin(async { Ok(()) })
    }

    fn wrap<'a>(
        &'a self,
        scope: &'a Scope,
        next: Next,
        operation: &'a Operation,
    ) -> BoxFuture<'a, Result<AnyValue>> {
        let _ = (scope, operation);
        next.run()
    }

    /// Side-channel failure notification. Failures here are logged and dropped.
    fn on_error(&self, error: &WeftError, operation: &Operation, scope: &Scope) -> Result<()> {
        let _ = (error, operation, scope);
        Ok(())
    }

    /// Runs once during disposal, after every entry has been released.
    fn dispose<'a>(&'a self, scope: &'a Scope) -> BoxFuture<'a, Result<()>> {
        let _ = scope;
        Box::pin(async { Ok(()) })
    }
}

type Handler =
    Arc<dyn Fn(Scope, Arc<Operation>, Next) -> BoxFuture<'static, Result<AnyValue>> + Send + Sync>;

pub(crate) struct Pipeline {
    extensions: Vec<Arc<dyn Extension>>,
    handler: Handler,
}

impl Pipeline {
    pub(crate) fn compose(extensions: Vec<Arc<dyn Extension>>) -> Self {
        let mut handler: Handler =
            Arc::new(|_scope: Scope, _op: Arc<Operation>, core: Next| core.run());

        for ext in extensions.iter().rev() {
            let ext = ext.clone();
            let inner = handler.clone();
            handler = Arc::new(move |scope: Scope, op: Arc<Operation>, core: Next| {
                let ext = ext.clone();
                let inner = inner.clone();
                async move {
                    let next = {
                        let scope = scope.clone();
                        let op = op.clone();
                        Next::new(move || inner(scope, op, core))
                    };
                    ext.wrap(&scope, next, &op).await
                }
                .boxed()
            });
        }

        Self {
            extensions,
            handler,
        }
    }

    pub(crate) fn extensions(&self) -> &[Arc<dyn Extension>] {
        &self.extensions
    }

    pub(crate) fn run(
        &self,
        scope: Scope,
        operation: Arc<Operation>,
        core: Next,
    ) -> BoxFuture<'static, Result<AnyValue>> {
        (self.handler)(scope, operation, core)
    }

    /// Tell every extension about a failed operation.
    pub(crate) fn report_error(&self, scope: &Scope, operation: &Operation, error: &WeftError) {
        for ext in &self.extensions {
            let outcome = std::panic::catch_unwind(AssertUnwindSafe(|| {
                ext.on_error(error, operation, scope)
            }));
            match outcome {
                Ok(Ok(())) => {}
                Ok(Err(e)) => {
                    warn!(extension = ext.name(), error = %e, "Extension on_error failed")
                }
                Err(_) => warn!(extension = ext.name(), "Extension on_error panicked"),
            }
        }
    }
}
