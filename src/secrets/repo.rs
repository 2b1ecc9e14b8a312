use super::errors::{CertRepoError, SecretStoreError};
use super::store::{OwnerReference, Secret, SecretStore};
use crate::backoff::BackoffConfig;
use crate::cert::{join_service_types, CertificateBundle, CertificateSet, ServiceType};
use crate::prelude::{debug, warn};
use crate::retry::{from_fn, AttemptError, Retrier, RetryError};
use std::fmt::Debug;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

/// Data key of the issuing CA certificate.
pub const CA_CERT_KEY: &str = "ca.pem";
/// Data key of the service certificate chain.
pub const CERT_KEY: &str = "cert.pem";
/// Data key of the service private key.
pub const PRIVATE_KEY_KEY: &str = "key.pem";
/// Name of the secret holding the CA bundle, when the authority sends one.
pub const CA_BUNDLE_SECRET: &str = "tls-ca-bundle";
/// Data key of the CA bundle.
pub const CA_BUNDLE_KEY: &str = "ca-bundle.pem";

const STORE_CALL_ATTEMPTS: u32 = 3;
const DEFAULT_CALL_TIMEOUT: Duration = Duration::from_secs(30);

/// Name of the secret holding `service`'s certificates.
pub fn secret_name(service: ServiceType) -> String {
    format!("tls-cert-{service}")
}

fn default_store_backoff() -> BackoffConfig {
    BackoffConfig {
        initial: Duration::from_millis(500),
        factor: 2.0,
        jitter: 0.1,
        cap: Duration::from_secs(5),
        max_steps: 4,
    }
}

/// Reads and writes the certificates of a fixed set of service types, one secret per type.
///
/// Every secret is created with, and expected to carry, the configured owner. Each store call
/// is retried a few times; a missing secret is reported immediately.
pub struct ServiceCertificatesRepo {
    store: Arc<dyn SecretStore>,
    owner: OwnerReference,
    service_types: Vec<ServiceType>,
    backoff: BackoffConfig,
    call_timeout: Duration,
    cancel: CancellationToken,
}

impl Debug for ServiceCertificatesRepo {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ServiceCertificatesRepo")
            .field("store", &"<SecretStore>")
            .field("owner", &self.owner)
            .field("service_types", &self.service_types)
            .field("backoff", &self.backoff)
            .field("call_timeout", &self.call_timeout)
            .finish_non_exhaustive()
    }
}

impl ServiceCertificatesRepo {
    /// Creates a repository for `service_types` in `store`, owned by `owner`.
    ///
    /// Duplicate service types are ignored.
    pub fn new(
        store: Arc<dyn SecretStore>,
        owner: OwnerReference,
        service_types: impl IntoIterator<Item = ServiceType>,
    ) -> Self {
        let mut service_types: Vec<_> = service_types.into_iter().collect();
        service_types.sort_unstable();
        service_types.dedup();
        Self {
            store,
            owner,
            service_types,
            backoff: default_store_backoff(),
            call_timeout: DEFAULT_CALL_TIMEOUT,
            cancel: CancellationToken::new(),
        }
    }

    /// Sets the backoff between retried store calls.
    #[must_use]
    pub fn backoff(mut self, backoff: BackoffConfig) -> Self {
        self.backoff = backoff.normalize();
        self
    }

    /// Bounds each individual store call.
    #[must_use]
    pub fn call_timeout(mut self, timeout: Duration) -> Self {
        if !timeout.is_zero() {
            self.call_timeout = timeout;
        }
        self
    }

    /// Aborts in-flight store calls when `token` is cancelled.
    #[must_use]
    pub fn cancel_token(mut self, token: CancellationToken) -> Self {
        self.cancel = token;
        self
    }

    /// The managed service types, sorted.
    pub fn service_types(&self) -> &[ServiceType] {
        &self.service_types
    }

    /// Loads the persisted certificates of every managed service type.
    ///
    /// The CA bundle, if one is stored, is attached to the returned set.
    ///
    /// # Errors
    ///
    /// - [`CertRepoError::NotFound`] if any secret is missing,
    /// - [`CertRepoError::UnexpectedSecretOwner`] if a secret has a different owner,
    /// - [`CertRepoError::MissingSecretData`] if a secret lacks `ca.pem`, `cert.pem` or `key.pem`,
    /// - [`CertRepoError::DifferentCaForDifferentServiceTypes`] if the CAs disagree,
    /// - [`CertRepoError::Certificate`] if stored material does not parse,
    /// - [`CertRepoError::Store`] if the store keeps failing.
    pub async fn get_service_certificates(&self) -> Result<CertificateSet, CertRepoError> {
        let mut set: Option<CertificateSet> = None;

        for &service in &self.service_types {
            let name = secret_name(service);
            let secret = self.get_secret(&name).await?;
            if secret.owner.as_ref() != Some(&self.owner) {
                return Err(CertRepoError::UnexpectedSecretOwner { name });
            }

            let ca = required(&secret, CA_CERT_KEY)?;
            let bundle = CertificateBundle::from_pem(
                required(&secret, CERT_KEY)?.to_vec(),
                required(&secret, PRIVATE_KEY_KEY)?.to_vec(),
            )?;

            match set.as_mut() {
                None => set = Some(CertificateSet::new(ca.to_vec())?.with(service, bundle)),
                Some(set) if set.ca_pem() != ca => {
                    return Err(CertRepoError::DifferentCaForDifferentServiceTypes)
                }
                Some(set) => set.insert(service, bundle),
            }
        }

        let set = set.ok_or(CertRepoError::NoServiceTypes)?;
        match self.get_secret(CA_BUNDLE_SECRET).await {
            Ok(secret) => match secret.get(CA_BUNDLE_KEY) {
                Some(bundle) => Ok(set.with_ca_bundle(bundle.to_vec())),
                None => Ok(set),
            },
            Err(CertRepoError::NotFound { .. }) => Ok(set),
            Err(e) => Err(e),
        }
    }

    /// Persists `certificates`, one secret per managed service type.
    ///
    /// Bundles for service types this repository does not manage are ignored. The CA bundle
    /// object is written when the set carries one and removed otherwise.
    ///
    /// # Errors
    ///
    /// - [`CertRepoError::MissingServiceTypes`] if a managed service type has no bundle,
    /// - [`CertRepoError::Store`] if the store keeps failing.
    pub async fn put_service_certificates(
        &self,
        certificates: &CertificateSet,
    ) -> Result<(), CertRepoError> {
        let missing: Vec<_> = certificates.missing(&self.service_types).collect();
        if !missing.is_empty() {
            return Err(CertRepoError::MissingServiceTypes(join_service_types(
                &missing,
            )));
        }

        for (service, bundle) in certificates.iter() {
            if !self.service_types.contains(&service) {
                continue;
            }
            let secret = Secret::new(secret_name(service))
                .with_owner(self.owner.clone())
                .with_data(CA_CERT_KEY, certificates.ca_pem().to_vec())
                .with_data(CERT_KEY, bundle.cert_pem().to_vec())
                .with_data(PRIVATE_KEY_KEY, bundle.key_pem().to_vec());
            self.put_secret(secret).await?;
        }

        match certificates.ca_bundle_pem() {
            Some(bundle) => {
                let secret = Secret::new(CA_BUNDLE_SECRET)
                    .with_owner(self.owner.clone())
                    .with_data(CA_BUNDLE_KEY, bundle.to_vec());
                self.put_secret(secret).await
            }
            None => match self.delete_secret(CA_BUNDLE_SECRET).await {
                Ok(()) | Err(CertRepoError::NotFound { .. }) => Ok(()),
                Err(e) => Err(e),
            },
        }
    }

    async fn get_secret(&self, name: &str) -> Result<Secret, CertRepoError> {
        let store = Arc::clone(&self.store);
        let name = name.to_string();
        self.call("get", move || {
            let store = Arc::clone(&store);
            let name = name.clone();
            async move { store.get(&name).await }
        })
        .await
    }

    async fn put_secret(&self, secret: Secret) -> Result<(), CertRepoError> {
        let store = Arc::clone(&self.store);
        self.call("put", move || {
            let store = Arc::clone(&store);
            let secret = secret.clone();
            async move { store.put(secret).await }
        })
        .await
    }

    async fn delete_secret(&self, name: &str) -> Result<(), CertRepoError> {
        let store = Arc::clone(&self.store);
        let name = name.to_string();
        self.call("delete", move || {
            let store = Arc::clone(&store);
            let name = name.clone();
            async move { store.delete(&name).await }
        })
        .await
    }

    async fn call<T, F, Fut>(&self, operation: &'static str, make: F) -> Result<T, CertRepoError>
    where
        F: FnMut() -> Fut + Send,
        Fut: Future<Output = Result<T, SecretStoreError>> + Send + 'static,
        T: Send + 'static,
    {
        let retrier = Retrier::<T, SecretStoreError>::new(self.backoff)
            .attempt_timeout(self.call_timeout)
            .max_attempts(STORE_CALL_ATTEMPTS)
            .retryable(|e| !e.source_error().is_some_and(SecretStoreError::is_not_found))
            .on_error(move |e: &AttemptError<SecretStoreError>, wait| {
                debug!(
                    "Secret store call failed; retrying: operation={}, error={}, wait_ms={}",
                    operation,
                    e,
                    wait.as_millis()
                );
            });

        let mut source = from_fn(make);
        retrier
            .run(&self.cancel, &mut source)
            .await
            .map_err(|e| {
                if !matches!(e, RetryError::Cancelled)
                    && !e
                        .last_error()
                        .and_then(AttemptError::source_error)
                        .is_some_and(SecretStoreError::is_not_found)
                {
                    warn!(
                        "Secret store call failed; giving up: operation={}, error={}",
                        operation, e
                    );
                }
                CertRepoError::from_store(e)
            })
    }
}

fn required<'a>(secret: &'a Secret, key: &'static str) -> Result<&'a [u8], CertRepoError> {
    secret.get(key).ok_or_else(|| CertRepoError::MissingSecretData {
        name: secret.name.clone(),
        key,
    })
}
