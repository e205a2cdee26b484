//! Error types for the job pool.

use std::sync::Arc;
use std::time::Duration;

/// Error produced by a resolver, shared by every caller of the same job.
pub type UpstreamError = Arc<dyn std::error::Error + Send + Sync>;

/// Top-level error type for the crate.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Job error: {0}")]
    Job(#[from] JobError),
}

/// Configuration-related errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Invalid configuration value for {key}: {message}")]
    InvalidValue { key: String, message: String },
}

/// Discriminant of a [`JobError`], used wherever retry eligibility is decided.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FailureKind {
    /// The attempt exceeded its configured bound.
    Timeout,
    /// Cancellation was requested; never retried.
    Abort,
    /// The resolver rejected on its own.
    Upstream,
    /// A spawn was attempted outside of a live job invocation.
    NoContext,
}

/// Failure of a single job.
///
/// Cloneable so one settlement can be observed by every handle sharing a
/// cache entry.
#[derive(Debug, Clone, thiserror::Error)]
pub enum JobError {
    #[error("Job attempt timed out after {timeout:?}")]
    Timeout { timeout: Duration },

    #[error("Job aborted: {reason}")]
    Aborted { reason: String },

    #[error("Resolver failed: {0}")]
    Upstream(#[source] UpstreamError),

    #[error("No active job context")]
    NoContext,
}

impl JobError {
    /// Wrap a resolver failure.
    pub fn upstream(err: impl Into<Box<dyn std::error::Error + Send + Sync>>) -> Self {
        Self::Upstream(Arc::from(err.into()))
    }

    /// Build an abort failure.
    pub fn aborted(reason: impl Into<String>) -> Self {
        Self::Aborted {
            reason: reason.into(),
        }
    }

    pub fn kind(&self) -> FailureKind {
        match self {
            Self::Timeout { .. } => FailureKind::Timeout,
            Self::Aborted { .. } => FailureKind::Abort,
            Self::Upstream(_) => FailureKind::Upstream,
            Self::NoContext => FailureKind::NoContext,
        }
    }

    /// Whether another attempt may be made after this failure.
    pub fn is_retryable(&self) -> bool {
        match self.kind() {
            FailureKind::Timeout | FailureKind::Upstream => true,
            FailureKind::Abort | FailureKind::NoContext => false,
        }
    }
}

/// Result type alias for the crate.
pub type Result<T> = std::result::Result<T, Error>;
