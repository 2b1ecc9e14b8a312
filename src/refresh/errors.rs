use crate::cert::error::CertificateError;
use std::fmt;
use thiserror::Error;

type BoxError = Box<dyn std::error::Error + Send + Sync + 'static>;

/// Errors reported by a [`CertificateSource`](super::CertificateSource) implementation.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum CertificateSourceError {
    /// The issuance request could not be sent to the remote authority.
    #[error("failed to dispatch certificate request: {0}")]
    Dispatch(#[source] BoxError),

    /// Persisting or loading certificate material failed.
    #[error("certificate storage failed: {0}")]
    Storage(#[source] BoxError),

    /// The material handed to the source is unusable.
    #[error("invalid certificates: {0}")]
    Invalid(String),

    /// Certificate material could not be parsed.
    #[error(transparent)]
    Certificate(#[from] CertificateError),
}

impl CertificateSourceError {
    /// Wraps `err` as a [`CertificateSourceError::Dispatch`].
    pub fn dispatch(err: impl Into<BoxError>) -> Self {
        Self::Dispatch(err.into())
    }

    /// Wraps `err` as a [`CertificateSourceError::Storage`].
    pub fn storage(err: impl Into<BoxError>) -> Self {
        Self::Storage(err.into())
    }
}

/// Errors returned by [`CertRefresher`](super::CertRefresher) and its handles.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum RefreshError {
    /// Loading the persisted certificates at start failed.
    #[error("initial certificate load failed: {0}")]
    InitialLoad(#[source] CertificateSourceError),

    /// The refresher was stopped.
    #[error("refresher is closed")]
    Closed,

    /// The inbound queue is full; the message was not enqueued.
    #[error("refresher queue is full")]
    QueueFull,

    /// The background task did not finish within the shutdown timeout and was aborted.
    #[error("shutdown timeout exceeded")]
    ShutdownTimeout,
}

/// Error kinds for structured metrics reporting.
///
/// Use these stable, low-cardinality labels when recording metrics.
#[derive(Debug, Clone, Copy, Eq, PartialEq, Hash)]
#[non_exhaustive]
pub enum MetricsErrorKind {
    /// The initial load at start failed.
    InitialLoad,
    /// An issuance request could not be dispatched.
    Dispatch,
    /// The remote authority answered with an error.
    RemoteIssuance,
    /// No response arrived within the request window.
    RequestTimeout,
    /// An issued certificate set failed validation.
    ResultRejected,
    /// Persisting issued certificates failed.
    Store,
    /// Failed to join the background task during shutdown.
    SupervisorJoinFailed,
}

impl MetricsErrorKind {
    /// Returns a string representation of the error kind.
    ///
    /// This is useful for metrics systems that require string labels.
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::InitialLoad => "initial_load",
            Self::Dispatch => "dispatch",
            Self::RemoteIssuance => "remote_issuance",
            Self::RequestTimeout => "request_timeout",
            Self::ResultRejected => "result_rejected",
            Self::Store => "store",
            Self::SupervisorJoinFailed => "supervisor_join_failed",
        }
    }
}

impl fmt::Display for MetricsErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
