//! Secret-backed [`CertificateSource`](crate::refresh::CertificateSource).
//!
//! Each managed [`ServiceType`](crate::cert::ServiceType) gets one secret named
//! `tls-cert-<service-type>` with three entries:
//!
//! | key        | content                     |
//! |------------|-----------------------------|
//! | `ca.pem`   | issuing CA certificate      |
//! | `cert.pem` | service certificate chain   |
//! | `key.pem`  | service private key         |
//!
//! All secrets carry the same owner reference and the same CA. A CA bundle sent by the
//! authority is kept in a separate `tls-ca-bundle` secret.
//!
//! Storage is abstracted by [`SecretStore`]; [`InMemorySecretStore`] serves tests and local
//! runs.
//!
//! # Example
//!
//! ```no_run
//! use cert_refresher::cert::ServiceType;
//! use cert_refresher::refresh::CertRefresher;
//! use cert_refresher::secrets::{
//!     InMemorySecretStore, OwnerReference, SecretCertificateSource, ServiceCertificatesRepo,
//! };
//! use std::sync::Arc;
//! use tokio::sync::mpsc;
//! use tokio_util::sync::CancellationToken;
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let repo = ServiceCertificatesRepo::new(
//!     Arc::new(InMemorySecretStore::new()),
//!     OwnerReference::new("Deployment", "sensor", "7f1c"),
//!     [ServiceType::Scanner, ServiceType::ScannerDb],
//! );
//! let (requests, mut outbound) = mpsc::channel(8);
//! let source = SecretCertificateSource::new(repo, requests);
//!
//! let refresher = CertRefresher::builder(Arc::new(source))
//!     .description("local scanner credentials")
//!     .build();
//! refresher.start(&CancellationToken::new()).await?;
//!
//! while let Some(request) = outbound.recv().await {
//!     // Forward `request` to the authority; deliver its answer via `refresher.response_sender()`.
//!     let _ = request.request_id;
//! }
//! # Ok(())
//! # }
//! ```

mod errors;
mod repo;
mod source;
mod store;

pub use errors::{CertRepoError, SecretStoreError};
pub use repo::{
    secret_name, ServiceCertificatesRepo, CA_BUNDLE_KEY, CA_BUNDLE_SECRET, CA_CERT_KEY, CERT_KEY,
    PRIVATE_KEY_KEY,
};
pub use source::{refresh_delay, IssueRequest, SecretCertificateSource};
pub use store::{InMemorySecretStore, OwnerReference, Secret, SecretStore, StoreFuture};
