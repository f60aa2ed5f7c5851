use std::any::Any;
use std::fmt;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::error::{Result, WeftError};

/// Type-erased shared value held by scopes, contexts and tag stores.
pub type AnyValue = Arc<dyn Any + Send + Sync>;

/// Erase a value.
pub fn erase<T: Send + Sync + 'static>(value: T) -> AnyValue {
    Arc::new(value)
}

/// Recover a typed handle from an erased value.
///
/// `subject` names the owner of the value for the mismatch error.
pub fn downcast<T: Send + Sync + 'static>(value: AnyValue, subject: &str) -> Result<Arc<T>> {
    value.downcast::<T>().map_err(|_| WeftError::TypeMismatch {
        subject: subject.to_string(),
        expected: std::any::type_name::<T>().to_string(),
    })
}

/// Lifecycle of a flow execution.
///
/// `Pending -> Running -> {Completed | Failed | Cancelled}`; terminal states are final.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExecutionStatus {
    Pending,
    Running,
    Completed,
    Failed,
    Cancelled,
}

impl ExecutionStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Cancelled)
    }
}

impl fmt::Display for ExecutionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Pending => "pending",
            Self::Running => "running",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
        };
        f.write_str(s)
    }
}
