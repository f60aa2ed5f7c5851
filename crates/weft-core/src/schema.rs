use std::fmt;
use std::sync::Arc;

use crate::error::{Result, WeftError};

type Check<T> = Arc<dyn Fn(&T) -> std::result::Result<(), String> + Send + Sync>;

/// Runtime validation contract attached to flow inputs/outputs and tag values.
///
/// A failing check is always surfaced as `WeftError::SchemaValidation`;
/// values are never coerced.
pub struct Schema<T: ?Sized> {
    checks: Vec<Check<T>>,
}

impl<T: ?Sized> Schema<T> {
    /// Accept every value.
    pub fn any() -> Self {
        Self { checks: Vec::new() }
    }

    /// Build a schema from a predicate returning a human-readable reason on failure.
    pub fn new<F>(check: F) -> Self
    where
        F: Fn(&T) -> std::result::Result<(), String> + Send + Sync + 'static,
    {
        Self {
            checks: vec![Arc::new(check)],
        }
    }

    /// Require both this schema and `other` to accept the value.
    pub fn and(mut self, other: Schema<T>) -> Self {
        self.checks.extend(other.checks);
        self
    }

    pub fn is_any(&self) -> bool {
        self.checks.is_empty()
    }

    /// Validate `value`; `subject` names what was being checked in the error.
    pub fn validate(&self, subject: &str, value: &T) -> Result<()> {
        for check in &self.checks {
            check(value).map_err(|message| WeftError::SchemaValidation {
                subject: subject.to_string(),
                message,
            })?;
        }
        Ok(())
    }
}

impl<T: ?Sized> Clone for Schema<T> {
    fn clone(&self) -> Self {
        Self {
            checks: self.checks.clone(),
        }
    }
}

impl<T: ?Sized> Default for Schema<T> {
    fn default() -> Self {
        Self::any()
    }
}

impl<T: ?Sized> fmt::Debug for Schema<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Schema")
            .field("checks", &self.checks.len())
            .finish()
    }
}
