use std::time::Duration;

use thiserror::Error;

/// An error that happens when the media platform fails to deliver a resource.
///
/// Caches never surface these to their callers. They classify them into backoff, a `Failed`
/// lifecycle event, or a silent miss.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum FetchError {
    /// The request was cancelled, either explicitly or because its owner went away.
    #[error("cancelled")]
    Cancelled,
    /// The resource is temporarily unavailable, for example because a remote store could not
    /// be reached.
    ///
    /// The attached string contains the platform's explanation.
    #[error("temporarily unavailable: {0}")]
    Unavailable(String),
    /// The platform did not answer in time.
    #[error("request timed out after {0:?}")]
    Timeout(Duration),
    /// The resource was delivered, but cannot be decoded or is otherwise unusable.
    #[error("malformed: {0}")]
    Malformed(String),
    /// An unrecoverable error inside the media platform.
    #[error("platform error: {0}")]
    Platform(String),
    /// An unexpected error in the pipeline itself.
    #[error("internal error")]
    InternalError,
}

impl FetchError {
    /// Whether a later attempt for the same resource may succeed.
    ///
    /// Only these errors put a resource into backoff.
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Unavailable(_))
    }

    /// A short, low-cardinality name used to tag metrics.
    pub fn metrics_tag(&self) -> &'static str {
        match self {
            Self::Cancelled => "cancelled",
            Self::Unavailable(_) => "unavailable",
            Self::Timeout(_) => "timeout",
            Self::Malformed(_) => "malformed",
            Self::Platform(_) => "platform",
            Self::InternalError => "internal",
        }
    }

    #[track_caller]
    pub fn from_std_error<E: std::error::Error + 'static>(e: E) -> Self {
        let dynerr: &dyn std::error::Error = &e; // tracing expects a `&dyn Error`
        tracing::error!(error = dynerr);
        Self::InternalError
    }
}

impl From<tokio::task::JoinError> for FetchError {
    #[track_caller]
    fn from(err: tokio::task::JoinError) -> Self {
        if err.is_cancelled() {
            Self::Cancelled
        } else {
            Self::from_std_error(err)
        }
    }
}

/// The outcome of a native request.
pub type FetchResult<T> = Result<T, FetchError>;
