//! weft: reactive dependency resolution and flow execution.
//!
//! Executors describe how to build values; a [`Scope`] resolves and caches
//! them, re-resolving dependents when something is invalidated. Flows run
//! through a tree of [`ExecutionContext`]s with cancellation and a replayable
//! journal, and every resolve/execute passes through the scope's
//! [`Extension`] pipeline.
//!
//! ```ignore
//! use weft::{derive, provide, Scope, ScopeOptions};
//!
//! let a = provide("a", |_| async { Ok(2) });
//! let b = provide("b", |_| async { Ok(3) });
//! let sum = derive("sum", (a.clone(), b), |(x, y), _| async move { Ok(*x + *y) });
//!
//! let scope = Scope::new(ScopeOptions::new());
//! assert_eq!(*scope.resolve(&sum).await?, 5);
//!
//! scope.controller(&a)?.set(10)?;
//! scope.flush().await?;
//! assert_eq!(*scope.resolve(&sum).await?, 13);
//! ```

pub use weft_core::config::{FlowConfig, LogConfig, RuntimeConfig, ScopeConfig};
pub use weft_core::error::{Result, WeftError};
pub use weft_core::event::{EventBus, RuntimeEvent};
pub use weft_core::logging::init_tracing;
pub use weft_core::schema::Schema;
pub use weft_core::tag::{Tag, TagBag, TagKey, TagSink, TagSource, Tagged};
pub use weft_core::types::{downcast, erase, AnyValue, ExecutionStatus};

pub use weft_runtime::*;
