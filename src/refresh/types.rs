use super::errors::CertificateSourceError;
use crate::cert::{CertificateSet, ServiceType};
use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::time::Duration;
use uuid::Uuid;

/// Correlation token for one issuance request.
///
/// A fresh id is minted for every dispatched request. Only the response carrying the id of the
/// currently outstanding request is acted upon; every other response is stale.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct RequestId(Uuid);

impl RequestId {
    /// Mints a new random id.
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    /// Returns the underlying UUID.
    pub const fn as_uuid(&self) -> &Uuid {
        &self.0
    }
}

impl Default for RequestId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for RequestId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(&self.0, f)
    }
}

impl From<Uuid> for RequestId {
    fn from(id: Uuid) -> Self {
        Self(id)
    }
}

/// Future returned by [`CertificateSource::handle_certificates`].
pub type HandleFuture =
    Pin<Box<dyn Future<Output = Result<Duration, CertificateSourceError>> + Send + 'static>>;

/// Collaborator that talks to the remote authority and owns persisted certificate material.
///
/// # Example
///
/// ```no_run
/// use cert_refresher::cert::CertificateSet;
/// use cert_refresher::refresh::{CertificateSource, CertificateSourceError, HandleFuture, RequestId};
/// use std::time::Duration;
///
/// #[derive(Debug)]
/// struct Fixed;
///
/// impl CertificateSource for Fixed {
///     fn request_certificates(&self, _id: RequestId) -> Result<(), CertificateSourceError> {
///         Ok(())
///     }
///
///     fn handle_certificates(&self, _set: Option<CertificateSet>) -> HandleFuture {
///         Box::pin(async { Ok(Duration::from_secs(3600)) })
///     }
/// }
/// ```
pub trait CertificateSource: Send + Sync + 'static {
    /// Starts an issuance request tagged with `request_id` and returns without waiting.
    ///
    /// The outcome is expected to come back later through a
    /// [`ResponseSender`](super::ResponseSender).
    ///
    /// # Errors
    ///
    /// Returns an error if the request could not be sent at all.
    fn request_certificates(&self, request_id: RequestId) -> Result<(), CertificateSourceError>;

    /// Persists freshly issued certificates, or with `None` inspects what is already persisted.
    ///
    /// Resolves to the time until the next refresh is due.
    fn handle_certificates(&self, certificates: Option<CertificateSet>) -> HandleFuture;

    /// Service types whose certificates this source requests, for log lines.
    ///
    /// Empty unless overridden.
    fn service_types(&self) -> Vec<ServiceType> {
        Vec::new()
    }
}

/// The remote authority's answer to one issuance request.
#[derive(Clone, Debug)]
pub struct IssueResponse {
    request_id: RequestId,
    outcome: Result<CertificateSet, String>,
}

impl IssueResponse {
    /// A successful issuance.
    pub fn success(request_id: RequestId, certificates: CertificateSet) -> Self {
        Self {
            request_id,
            outcome: Ok(certificates),
        }
    }

    /// A failed issuance, with the authority's error message.
    pub fn failure(request_id: RequestId, message: impl Into<String>) -> Self {
        Self {
            request_id,
            outcome: Err(message.into()),
        }
    }

    /// The id of the request this response answers.
    pub const fn request_id(&self) -> RequestId {
        self.request_id
    }

    /// Returns `true` for a successful issuance.
    pub const fn is_success(&self) -> bool {
        self.outcome.is_ok()
    }

    pub(super) fn into_outcome(self) -> Result<CertificateSet, String> {
        self.outcome
    }
}
