use std::sync::Arc;

use thiserror::Error;

/// Error hierarchy shared by every weft crate.
///
/// Cloneable so a failed single-flight resolution can be handed to every
/// waiter; wrapped causes live behind `Arc`.
#[derive(Debug, Clone, Error)]
pub enum WeftError {
    // Resolution errors
    #[error("executor '{executor}' failed to resolve: {cause}")]
    ExecutorResolution {
        executor: String,
        #[source]
        cause: Arc<WeftError>,
    },

    #[error("executor '{executor}' failed: dependency '{dependency}' did not resolve: {cause}")]
    DependencyResolution {
        executor: String,
        dependency: String,
        #[source]
        cause: Arc<WeftError>,
    },

    #[error("invalidation loop detected: {}", cycle.join(" -> "))]
    InvalidationLoop { cycle: Vec<String> },

    #[error("value of '{subject}' is not a {expected}")]
    TypeMismatch { subject: String, expected: String },

    // Lifecycle errors
    #[error("execution context {context} is closed")]
    ClosedContext { context: String },

    #[error("scope has been disposed")]
    DisposedScope,

    #[error("cancelled: {reason}")]
    Cancelled { reason: String },

    // Contract errors
    #[error("schema validation failed for {subject}: {message}")]
    SchemaValidation { subject: String, message: String },

    #[error("tag not found: {tag}")]
    TagNotFound { tag: String },

    #[error("journaled step '{key}' failed: {message}")]
    Journaled { key: String, message: String },

    // User errors
    #[error("{0}")]
    Failed(String),

    #[error("{0}")]
    Custom(Arc<dyn std::error::Error + Send + Sync>),

    // Config errors
    #[error("Config error: {0}")]
    Config(String),

    #[error("Config file not found: {0}")]
    ConfigNotFound(String),

    // I/O errors
    #[error("I/O error: {0}")]
    Io(Arc<std::io::Error>),

    // JSON errors
    #[error("JSON error: {0}")]
    Json(Arc<serde_json::Error>),

    #[error("internal runtime error: {0}")]
    Internal(String),
}

impl WeftError {
    /// A plain user-reported failure.
    pub fn msg(message: impl Into<String>) -> Self {
        Self::Failed(message.into())
    }

    /// Wrap any foreign error.
    pub fn custom(err: impl std::error::Error + Send + Sync + 'static) -> Self {
        Self::Custom(Arc::new(err))
    }

    pub fn cancelled(reason: impl Into<String>) -> Self {
        Self::Cancelled {
            reason: reason.into(),
        }
    }

    /// The directly wrapped cause, for resolution errors.
    pub fn cause(&self) -> Option<&WeftError> {
        match self {
            Self::ExecutorResolution { cause, .. } | Self::DependencyResolution { cause, .. } => {
                Some(cause.as_ref())
            }
            _ => None,
        }
    }

    /// Follow wrapped causes to the innermost error.
    pub fn root_cause(&self) -> &WeftError {
        let mut current = self;
        while let Some(next) = current.cause() {
            current = next;
        }
        current
    }

    pub fn is_cancelled(&self) -> bool {
        matches!(self.root_cause(), Self::Cancelled { .. })
    }
}

impl From<std::io::Error> for WeftError {
    fn from(err: std::io::Error) -> Self {
        Self::Io(Arc::new(err))
    }
}

impl From<serde_json::Error> for WeftError {
    fn from(err: serde_json::Error) -> Self {
        Self::Json(Arc::new(err))
    }
}

pub type Result<T> = std::result::Result<T, WeftError>;
