//! Flows: named units of work run through an execution context.
//!
//! A flow's handler is itself an executor, so handlers that need
//! dependencies resolve them through the scope like any other value and are
//! cached, preset and invalidated the same way.

use std::fmt;
use std::future::Future;
use std::sync::Arc;

use futures::future::BoxFuture;
use futures::FutureExt;

use weft_core::error::Result;
use weft_core::schema::Schema;
use weft_core::tag::{Tag, Tagged};

use crate::context::ExecutionContext;
use crate::executor::{derive, provide, Dependencies, Executor};

/// Resolved form of a flow handler.
pub type FlowHandler<I, O> =
    Arc<dyn Fn(ExecutionContext, I) -> BoxFuture<'static, Result<O>> + Send + Sync>;

/// A typed unit of work with input and output contracts.
pub struct Flow<I, O> {
    name: String,
    handler: Executor<FlowHandler<I, O>>,
    input_schema: Schema<I>,
    output_schema: Schema<O>,
    tags: Vec<Tagged>,
}

impl<I, O> Clone for Flow<I, O> {
    fn clone(&self) -> Self {
        Self {
            name: self.name.clone(),
            handler: self.handler.clone(),
            input_schema: self.input_schema.clone(),
            output_schema: self.output_schema.clone(),
            tags: self.tags.clone(),
        }
    }
}

impl<I, O> fmt::Debug for Flow<I, O> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Flow")
            .field("name", &self.name)
            .field("handler", &self.handler)
            .finish_non_exhaustive()
    }
}

/// Define a flow with no dependencies.
pub fn flow<I, O, F, Fut>(name: impl Into<String>, handler: F) -> Flow<I, O>
where
    I: Send + Sync + 'static,
    O: Send + Sync + 'static,
    F: Fn(ExecutionContext, I) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<O>> + Send + 'static,
{
    let name = name.into();
    let handler: FlowHandler<I, O> = Arc::new(move |ctx, input| handler(ctx, input).boxed());
    let executor = provide(format!("{}.handler", name), move |_| {
        let handler = handler.clone();
        async move { Ok(handler) }
    });
    Flow::from_handler(name, executor)
}

impl<I, O> Flow<I, O>
where
    I: Send + Sync + 'static,
    O: Send + Sync + 'static,
{
    /// Define a flow whose handler receives resolved dependencies.
    pub fn with_deps<D, F, Fut>(name: impl Into<String>, deps: D, handler: F) -> Self
    where
        D: Dependencies,
        D::Output: Clone + Sync,
        F: Fn(D::Output, ExecutionContext, I) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<O>> + Send + 'static,
    {
        let name = name.into();
        let handler = Arc::new(handler);
        let executor = derive(format!("{}.handler", name), deps, move |resolved: D::Output, _| {
            let handler = handler.clone();
            async move {
                let bound: FlowHandler<I, O> = Arc::new(move |ctx, input| {
                    handler(resolved.clone(), ctx, input).boxed()
                });
                Ok(bound)
            }
        });
        Self::from_handler(name, executor)
    }

    fn from_handler(name: String, handler: Executor<FlowHandler<I, O>>) -> Self {
        Self {
            name,
            handler,
            input_schema: Schema::any(),
            output_schema: Schema::any(),
            tags: Vec::new(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// The executor the handler resolves through. Preset it to stub the flow.
    pub fn handler(&self) -> &Executor<FlowHandler<I, O>> {
        &self.handler
    }

    pub fn tags(&self) -> &[Tagged] {
        &self.tags
    }

    pub fn tag<V: Clone + Send + Sync + 'static>(&self, tag: &Tag<V>) -> Option<V> {
        tag.read_from(self.tags.as_slice())
    }

    /// Reject inputs the schema does not accept.
    pub fn input_schema(mut self, schema: Schema<I>) -> Self {
        self.input_schema = schema;
        self
    }

    /// Reject outputs the schema does not accept.
    pub fn output_schema(mut self, schema: Schema<O>) -> Self {
        self.output_schema = schema;
        self
    }

    /// Metadata copied into the data of every context running this flow.
    pub fn with_tag(mut self, tagged: Tagged) -> Self {
        self.tags.push(tagged);
        self
    }

    pub(crate) async fn invoke(&self, ctx: ExecutionContext, input: I) -> Result<O> {
        self.input_schema
            .validate(&format!("flow '{}' input", self.name), &input)?;
        let handler = ctx.resolve(&self.handler).await?;
        let output = (*handler)(ctx, input).await?;
        self.output_schema
            .validate(&format!("flow '{}' output", self.name), &output)?;
        Ok(output)
    }
}
