#![deny(missing_docs)]
#![warn(missing_debug_implementations)]

//! Keeps cluster service mTLS certificates fresh.
//!
//! A [`CertRefresher`] loads the certificates already persisted for a set of
//! [`ServiceType`](cert::ServiceType)s, then repeatedly requests new ones from a remote
//! authority, stores what comes back, and schedules the next refresh. Every failure is retried
//! with a capped exponential [`BackoffConfig`].
//!
//! The crate is layered:
//!
//! - [`backoff`]: the wait sequence between retries,
//! - [`retry`]: a generic retry loop over attempts that complete asynchronously,
//! - [`cert`]: service types and parsed certificate material,
//! - [`refresh`]: the refresher itself and the [`CertificateSource`](refresh::CertificateSource)
//!   contract it drives,
//! - [`secrets`]: a certificate source persisting to a secret store.
//!
//! # Examples
//!
//! ```no_run
//! use cert_refresher::cert::ServiceType;
//! use cert_refresher::secrets::{
//!     InMemorySecretStore, OwnerReference, SecretCertificateSource, ServiceCertificatesRepo,
//! };
//! use cert_refresher::{BackoffConfig, CertRefresher, StoreFailurePolicy};
//! use std::error::Error;
//! use std::sync::Arc;
//! use std::time::Duration;
//! use tokio::sync::mpsc;
//! use tokio_util::sync::CancellationToken;
//!
//! # async fn some_function() -> Result<(), Box<dyn Error>> {
//! let repo = ServiceCertificatesRepo::new(
//!     Arc::new(InMemorySecretStore::new()),
//!     OwnerReference::new("Deployment", "sensor", "7f1c"),
//!     [ServiceType::Sensor, ServiceType::Collector, ServiceType::AdmissionControl],
//! );
//! let (requests, _outbound) = mpsc::channel(8);
//!
//! let refresher = CertRefresher::builder(Arc::new(SecretCertificateSource::new(repo, requests)))
//!     .description("secured cluster certificates")
//!     .backoff(BackoffConfig::default())
//!     .request_timeout(Duration::from_secs(120))
//!     .store_failure_policy(StoreFailurePolicy::RetryForever)
//!     .build();
//!
//! let token = CancellationToken::new();
//! refresher.start(&token).await?;
//!
//! // The authority's answers go through `refresher.response_sender()`.
//! println!("phase: {}", refresher.status().phase);
//!
//! refresher.shutdown_configured().await?;
//! # Ok(())
//! # }
//! ```

pub mod backoff;
pub mod cert;
pub mod refresh;
pub mod retry;
pub mod secrets;

mod observability;
mod prelude;

pub use backoff::BackoffConfig;
pub use refresh::{
    CertRefresher, CertRefresherBuilder, RefreshConfig, RefreshError, StoreFailurePolicy,
};
