//! Certificate refresh engine.
//!
//! [`CertRefresher`] keeps one set of service certificates valid. It loads what is persisted at
//! start, then cycles through issuance, storage and rescheduling on a background task:
//!
//! ```text
//! Idle -> Issuing -> AwaitingResponse -> Storing -> Scheduled -> Issuing -> ...
//!                         |                 |
//!                         +--> BackoffWait <+--> Issuing
//! ```
//!
//! The remote authority is reached through a [`CertificateSource`]. Its answers are fed back
//! with a [`ResponseSender`] and correlated with the outstanding request by [`RequestId`];
//! anything else is discarded. Every failure (dispatch, remote error, timeout, storage) is
//! retried with the configured [`BackoffConfig`](crate::backoff::BackoffConfig).
//!
//! # Example
//!
//! ```no_run
//! use cert_refresher::refresh::{CertRefresher, CertificateSource};
//! use std::sync::Arc;
//! use tokio_util::sync::CancellationToken;
//!
//! # async fn example(source: Arc<dyn CertificateSource>) -> Result<(), Box<dyn std::error::Error>> {
//! let refresher = CertRefresher::builder(source)
//!     .description("sensor credentials")
//!     .build();
//!
//! // Hand this to whatever receives the authority's answers.
//! let responses = refresher.response_sender();
//!
//! let token = CancellationToken::new();
//! refresher.start(&token).await?;
//!
//! let mut updates = refresher.updated();
//! let revision = updates.changed().await?;
//! println!("certificates refreshed, revision {revision}");
//!
//! refresher.shutdown_configured().await?;
//! # drop(responses);
//! # Ok(())
//! # }
//! ```

mod builder;
mod errors;
mod metrics;
mod refresher;
mod status;
mod supervisor;
mod timer;
mod types;

pub use builder::{CertRefresherBuilder, RefreshConfig, StoreFailurePolicy};
pub use errors::{CertificateSourceError, MetricsErrorKind, RefreshError};
pub use metrics::MetricsRecorder;
pub use refresher::{CertRefresher, ResponseSender};
pub use status::{RefreshPhase, RefreshStatus, RefreshUpdates};
pub use types::{CertificateSource, HandleFuture, IssueResponse, RequestId};
