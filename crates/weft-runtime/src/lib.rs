pub mod context;
pub mod controller;
pub mod execution;
pub mod executor;
pub mod extension;
pub mod flow;
pub mod journal;
pub mod scope;

pub use context::{ContextDetails, ContextId, ContextOptions, Exec, ExecutionContext};
pub use controller::Controller;
pub use execution::{ExecutionSummary, FlowExecution, ScopeExecOptions};
pub use executor::{derive, provide, AnyExecutor, Dependencies, DependencyShape, Executor, ExecutorId};
pub use extension::{ExecTarget, Extension, Next, Operation, OperationKind};
pub use flow::{flow, Flow, FlowHandler};
pub use journal::{Journal, JournalEntry, StepOutcome};
pub use scope::{
    create_scope, Cleanup, ControllerEvent, EntryState, ErrorEvent, FactoryContext, ListenerId, Scope,
    ScopeOptions,
};
