use std::time::Duration;
use thiserror::Error;

/// Why a single attempt did not produce a usable result.
#[derive(Debug, Error)]
pub enum AttemptError<E> {
    /// The source reported a failure, either while starting the attempt or as its outcome.
    #[error(transparent)]
    Failed(E),

    /// No outcome arrived within the per-attempt window.
    #[error("attempt timed out after {}ms", .0.as_millis())]
    TimedOut(Duration),

    /// The outcome arrived but the `validate` hook rejected it.
    #[error("result rejected: {0}")]
    Rejected(String),
}

impl<E> AttemptError<E> {
    /// Returns the source error, if this attempt failed at the source.
    pub fn source_error(&self) -> Option<&E> {
        match self {
            Self::Failed(e) => Some(e),
            Self::TimedOut(_) | Self::Rejected(_) => None,
        }
    }

    /// Returns `true` if the attempt was abandoned by the per-attempt timeout.
    pub const fn is_timeout(&self) -> bool {
        matches!(self, Self::TimedOut(_))
    }
}

/// Terminal outcome of [`Retrier::run`](super::Retrier::run).
#[derive(Debug, Error)]
pub enum RetryError<E> {
    /// The cancellation token fired before a result was obtained.
    #[error("retry loop cancelled")]
    Cancelled,

    /// The configured attempt budget ran out.
    #[error("giving up after {attempts} attempts: {last}")]
    Exhausted {
        /// Number of attempts made.
        attempts: u32,
        /// The error of the final attempt.
        #[source]
        last: AttemptError<E>,
    },

    /// The `retryable` classifier declared the failure final.
    #[error("non-retryable failure: {0}")]
    Permanent(#[source] AttemptError<E>),
}

impl<E> RetryError<E> {
    /// Returns the last attempt error, if the loop ended because of one.
    pub fn last_error(&self) -> Option<&AttemptError<E>> {
        match self {
            Self::Cancelled => None,
            Self::Exhausted { last, .. } | Self::Permanent(last) => Some(last),
        }
    }

    /// Consumes the error and returns the last attempt error, if any.
    pub fn into_last_error(self) -> Option<AttemptError<E>> {
        match self {
            Self::Cancelled => None,
            Self::Exhausted { last, .. } | Self::Permanent(last) => Some(last),
        }
    }
}
