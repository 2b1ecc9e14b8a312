//! Retryable source adapter.
//!
//! Turns an operation that is started without blocking and completes later (or never) into a
//! uniform retry loop governed by a [`BackoffConfig`](crate::backoff::BackoffConfig).
//!
//! The adapter does not know what it is fetching. Callers plug in:
//! - a [`RetryableSource`] that starts one attempt per [`RetryableSource::begin_fetch`] call,
//! - an optional `validate` predicate rejecting malformed results,
//! - an optional `on_error` hook observing each failed attempt and the wait that follows,
//! - an optional `retryable` classifier and attempt bound for finite retry budgets.
//!
//! [`Retrier::run`] drives the whole loop on the calling task. Message-driven callers that
//! cannot block (such as the certificate refresher) use the same policy through
//! [`Retrier::accept`] and [`Retrier::record_failure`] together with a [`RetryState`].
//!
//! # Example
//!
//! ```no_run
//! use cert_refresher::backoff::BackoffConfig;
//! use cert_refresher::retry::{from_fn, Retrier};
//! use std::time::Duration;
//! use tokio_util::sync::CancellationToken;
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let retrier = Retrier::new(BackoffConfig::default())
//!     .attempt_timeout(Duration::from_secs(5))
//!     .validate(|v: &u32| if *v > 0 { Ok(()) } else { Err("zero".into()) });
//!
//! let mut source = from_fn(|| async { Ok::<u32, std::io::Error>(7) });
//! let value = retrier.run(&CancellationToken::new(), &mut source).await?;
//! assert_eq!(value, 7);
//! # Ok(())
//! # }
//! ```

mod errors;
mod runner;
mod source;
mod tracker;

pub use errors::{AttemptError, RetryError};
pub use runner::{Retrier, RetryState};
pub use source::{from_fn, FnSource, PendingFetch, RetryableSource};

pub(crate) use tracker::{ErrorTracker, MAX_CONSECUTIVE_SAME_ERROR};
