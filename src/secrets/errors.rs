use crate::cert::error::CertificateError;
use crate::retry::{AttemptError, RetryError};
use thiserror::Error;

/// Errors returned by a [`SecretStore`](super::SecretStore).
#[derive(Debug, Error, Clone, PartialEq, Eq)]
#[non_exhaustive]
pub enum SecretStoreError {
    /// No secret with that name exists.
    #[error("secret {0} not found")]
    NotFound(String),

    /// Any other failure of the backing API.
    #[error("secret store API error: {0}")]
    Api(String),
}

impl SecretStoreError {
    /// Returns `true` for [`SecretStoreError::NotFound`].
    pub const fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound(_))
    }
}

/// Errors returned by [`ServiceCertificatesRepo`](super::ServiceCertificatesRepo).
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum CertRepoError {
    /// The repository manages no service types.
    #[error("no service types configured")]
    NoServiceTypes,

    /// A managed secret does not exist.
    #[error("secret {name} not found")]
    NotFound {
        /// Secret name.
        name: String,
    },

    /// A managed secret exists but belongs to someone else.
    #[error("secret {name} is not owned by the expected owner")]
    UnexpectedSecretOwner {
        /// Secret name.
        name: String,
    },

    /// A managed secret lacks one of its data keys.
    #[error("secret {name} has no data for key {key}")]
    MissingSecretData {
        /// Secret name.
        name: String,
        /// Missing data key.
        key: &'static str,
    },

    /// The secrets of different service types carry different CA certificates.
    #[error("found different CA certificates for different service types")]
    DifferentCaForDifferentServiceTypes,

    /// A certificate set to store lacks some managed service types.
    #[error("certificates missing for service types: {0}")]
    MissingServiceTypes(String),

    /// Stored certificate material could not be parsed.
    #[error(transparent)]
    Certificate(#[from] CertificateError),

    /// A secret store call failed after retries.
    #[error("secret store call failed: {0}")]
    Store(#[source] RetryError<SecretStoreError>),
}

impl CertRepoError {
    pub(super) fn from_store(err: RetryError<SecretStoreError>) -> Self {
        let not_found = match err.last_error().and_then(AttemptError::source_error) {
            Some(SecretStoreError::NotFound(name)) => Some(name.clone()),
            _ => None,
        };
        match not_found {
            Some(name) => Self::NotFound { name },
            None => Self::Store(err),
        }
    }

    /// Returns `true` if the persisted state is absent or unusable and should simply be
    /// replaced by freshly issued certificates.
    pub const fn needs_reissue(&self) -> bool {
        matches!(
            self,
            Self::NotFound { .. }
                | Self::MissingSecretData { .. }
                | Self::DifferentCaForDifferentServiceTypes
                | Self::Certificate(_)
        )
    }
}
