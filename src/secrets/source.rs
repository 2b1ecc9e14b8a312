use super::errors::CertRepoError;
use super::repo::ServiceCertificatesRepo;
use crate::cert::{join_service_types, CertificateSet, ServiceType};
use crate::prelude::{debug, info, warn};
use crate::refresh::{CertificateSource, CertificateSourceError, HandleFuture, RequestId};
use arc_swap::ArcSwapOption;
use std::sync::Arc;
use std::time::Duration;
use time::OffsetDateTime;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;

/// Largest share of a certificate's validity by which renewal is brought forward at random.
const MAX_JITTER_FRACTION: f64 = 0.1;

/// Issuance request handed to whatever talks to the remote authority.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct IssueRequest {
    /// Id the response must carry.
    pub request_id: RequestId,
    /// Service types to issue certificates for.
    pub service_types: Vec<ServiceType>,
    /// Fingerprint of the CA currently stored, if known.
    pub ca_fingerprint: Option<String>,
}

/// [`CertificateSource`] persisting certificates as secrets.
///
/// Issuance requests are pushed to a channel without waiting; the consumer forwards them to
/// the remote authority and feeds answers back through a
/// [`ResponseSender`](crate::refresh::ResponseSender).
///
/// Missing or unusable stored secrets trigger an immediate refresh at start. Secrets owned by
/// someone else are an error, since overwriting them would steal another component's state.
#[derive(Debug)]
pub struct SecretCertificateSource {
    shared: Arc<Shared>,
    requests: mpsc::Sender<IssueRequest>,
}

#[derive(Debug)]
struct Shared {
    repo: ServiceCertificatesRepo,
    ca_fingerprint: ArcSwapOption<String>,
}

impl SecretCertificateSource {
    /// Creates a source storing through `repo` and dispatching to `requests`.
    pub fn new(repo: ServiceCertificatesRepo, requests: mpsc::Sender<IssueRequest>) -> Self {
        Self {
            shared: Arc::new(Shared {
                repo,
                ca_fingerprint: ArcSwapOption::empty(),
            }),
            requests,
        }
    }

    /// Fingerprint of the CA of the last loaded or stored certificates.
    pub fn ca_fingerprint(&self) -> Option<String> {
        self.shared.ca_fingerprint.load_full().map(|f| (*f).clone())
    }
}

impl CertificateSource for SecretCertificateSource {
    fn request_certificates(&self, request_id: RequestId) -> Result<(), CertificateSourceError> {
        let request = IssueRequest {
            request_id,
            service_types: self.shared.repo.service_types().to_vec(),
            ca_fingerprint: self.ca_fingerprint(),
        };
        self.requests.try_send(request).map_err(|e| match e {
            TrySendError::Full(_) => {
                CertificateSourceError::dispatch("issue request channel is full")
            }
            TrySendError::Closed(_) => {
                CertificateSourceError::dispatch("issue request channel is closed")
            }
        })
    }

    fn service_types(&self) -> Vec<ServiceType> {
        self.shared.repo.service_types().to_vec()
    }

    fn handle_certificates(&self, certificates: Option<CertificateSet>) -> HandleFuture {
        let shared = Arc::clone(&self.shared);
        Box::pin(async move {
            match certificates {
                None => shared.load().await,
                Some(certificates) => shared.store(&certificates).await,
            }
        })
    }
}

impl Shared {
    async fn load(&self) -> Result<Duration, CertificateSourceError> {
        let types = join_service_types(self.repo.service_types());
        match self.repo.get_service_certificates().await {
            Ok(certificates) => {
                self.remember_ca(&certificates);
                let delay = refresh_delay(&certificates);
                debug!(
                    "Loaded stored certificates: service_types={}, refresh_in_ms={}",
                    types,
                    delay.as_millis()
                );
                Ok(delay)
            }
            Err(e) if e.needs_reissue() => {
                info!(
                    "Stored certificates unusable; refreshing now: service_types={}, reason={}",
                    types, e
                );
                Ok(Duration::ZERO)
            }
            Err(e) => Err(CertificateSourceError::storage(e)),
        }
    }

    async fn store(&self, certificates: &CertificateSet) -> Result<Duration, CertificateSourceError> {
        match self.repo.put_service_certificates(certificates).await {
            Ok(()) => {}
            Err(e @ CertRepoError::MissingServiceTypes(_)) => {
                return Err(CertificateSourceError::Invalid(e.to_string()))
            }
            Err(e) => return Err(CertificateSourceError::storage(e)),
        }
        self.remember_ca(certificates);
        Ok(refresh_delay(certificates))
    }

    fn remember_ca(&self, certificates: &CertificateSet) {
        match certificates.ca_fingerprint() {
            Ok(fingerprint) => self.ca_fingerprint.store(Some(Arc::new(fingerprint))),
            Err(e) => {
                warn!("Failed to fingerprint CA certificate; not remembering it: error={}", e);
                self.ca_fingerprint.store(None);
            }
        }
    }
}

/// Delay until `certificates` should be renewed.
///
/// Renewal is due halfway through the validity window of the certificate expiring first,
/// brought forward by a random share of up to a tenth of that window. Returns zero if that
/// point has passed or the set is empty.
pub fn refresh_delay(certificates: &CertificateSet) -> Duration {
    refresh_delay_at(certificates, OffsetDateTime::now_utc(), fastrand::f64())
}

pub(crate) fn refresh_delay_at(
    certificates: &CertificateSet,
    now: OffsetDateTime,
    jitter: f64,
) -> Duration {
    let Some((_, bundle)) = certificates.earliest_expiring() else {
        return Duration::ZERO;
    };
    let validity = bundle.not_after() - bundle.not_before();
    let jitter = if jitter.is_finite() {
        jitter.clamp(0.0, 1.0)
    } else {
        0.0
    };
    let renew_at = bundle.not_before() + validity / 2 - validity * (jitter * MAX_JITTER_FRACTION);
    Duration::try_from(renew_at - now).unwrap_or(Duration::ZERO)
}
