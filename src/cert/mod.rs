//! Service identities and the certificate material issued for them.
//!
//! A [`CertificateSet`] is the unit exchanged with the remote authority in one issuance round:
//! the issuing CA plus one [`CertificateBundle`] per [`ServiceType`]. Bundles are validated
//! at construction time, and their validity window is derived from the leaf certificate.

use crate::cert::error::CertificateError;
use crate::cert::parsing::{check_private_key, leaf_der, leaf_validity};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;
use time::OffsetDateTime;
use zeroize::{Zeroize, ZeroizeOnDrop};

pub mod error;
pub(crate) mod parsing;

/// A logical service whose identity needs its own certificate.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ServiceType {
    /// The cluster sensor.
    Sensor,
    /// The node collector.
    Collector,
    /// The admission controller webhook.
    AdmissionControl,
    /// The image scanner.
    Scanner,
    /// The image scanner database.
    ScannerDb,
    /// The v4 scanner indexer.
    ScannerV4Indexer,
    /// The v4 scanner database.
    ScannerV4Db,
}

impl ServiceType {
    /// Every known service type, in a stable order.
    pub const ALL: [Self; 7] = [
        Self::Sensor,
        Self::Collector,
        Self::AdmissionControl,
        Self::Scanner,
        Self::ScannerDb,
        Self::ScannerV4Indexer,
        Self::ScannerV4Db,
    ];

    /// Returns a stable string representation, suitable for logs and object names.
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Sensor => "sensor",
            Self::Collector => "collector",
            Self::AdmissionControl => "admission-control",
            Self::Scanner => "scanner",
            Self::ScannerDb => "scanner-db",
            Self::ScannerV4Indexer => "scanner-v4-indexer",
            Self::ScannerV4Db => "scanner-v4-db",
        }
    }
}

impl fmt::Display for ServiceType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ServiceType {
    type Err = CertificateError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|t| t.as_str() == s)
            .ok_or_else(|| CertificateError::UnknownServiceType(s.to_string()))
    }
}

/// Formats a list of service types as `a,b,c` for log lines.
pub(crate) fn join_service_types<'a>(types: impl IntoIterator<Item = &'a ServiceType>) -> String {
    types
        .into_iter()
        .map(|t| t.as_str())
        .collect::<Vec<_>>()
        .join(",")
}

/// PEM-encoded private key material.
///
/// This type is zeroized on drop.
#[derive(Clone, Eq, PartialEq, Zeroize, ZeroizeOnDrop)]
struct PrivateKeyPem(Vec<u8>);

impl fmt::Debug for PrivateKeyPem {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PrivateKeyPem")
            .field("len", &self.0.len())
            .finish()
    }
}

/// One service's credential: certificate chain, private key, and validity window.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CertificateBundle {
    cert_pem: Vec<u8>,
    key_pem: PrivateKeyPem,
    not_before: OffsetDateTime,
    not_after: OffsetDateTime,
}

impl CertificateBundle {
    /// Builds a bundle from a PEM certificate chain (leaf first) and a PEM private key.
    ///
    /// # Errors
    ///
    /// Returns a [`CertificateError`] if the chain's first block is not a parseable X.509
    /// certificate with a non-empty validity window, or if the key is not a private key
    /// PEM block.
    pub fn from_pem(
        cert_pem: impl Into<Vec<u8>>,
        key_pem: impl Into<Vec<u8>>,
    ) -> Result<Self, CertificateError> {
        let cert_pem = cert_pem.into();
        let key_pem = PrivateKeyPem(key_pem.into());

        let validity = leaf_validity(&cert_pem)?;
        check_private_key(&key_pem.0)?;

        Ok(Self {
            cert_pem,
            key_pem,
            not_before: validity.not_before,
            not_after: validity.not_after,
        })
    }

    /// The PEM certificate chain.
    pub fn cert_pem(&self) -> &[u8] {
        &self.cert_pem
    }

    /// The PEM private key.
    pub fn key_pem(&self) -> &[u8] {
        &self.key_pem.0
    }

    /// Start of the leaf certificate's validity.
    pub const fn not_before(&self) -> OffsetDateTime {
        self.not_before
    }

    /// End of the leaf certificate's validity.
    pub const fn not_after(&self) -> OffsetDateTime {
        self.not_after
    }

    /// Returns `true` if the leaf certificate is no longer valid at `now`.
    pub fn is_expired_at(&self, now: OffsetDateTime) -> bool {
        now >= self.not_after
    }
}

/// Certificates for a set of services, all issued by the same CA.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CertificateSet {
    ca_pem: Vec<u8>,
    ca_bundle_pem: Option<Vec<u8>>,
    certs: BTreeMap<ServiceType, CertificateBundle>,
}

impl CertificateSet {
    /// Creates an empty set issued by the CA in `ca_pem`.
    ///
    /// # Errors
    ///
    /// Returns a [`CertificateError`] if `ca_pem` does not start with a parseable certificate.
    pub fn new(ca_pem: impl Into<Vec<u8>>) -> Result<Self, CertificateError> {
        let ca_pem = ca_pem.into();
        leaf_validity(&ca_pem)?;
        Ok(Self {
            ca_pem,
            ca_bundle_pem: None,
            certs: BTreeMap::new(),
        })
    }

    /// Attaches a CA bundle (the set of CAs services should trust).
    #[must_use]
    pub fn with_ca_bundle(mut self, ca_bundle_pem: impl Into<Vec<u8>>) -> Self {
        self.ca_bundle_pem = Some(ca_bundle_pem.into());
        self
    }

    /// Adds or replaces the bundle for `service`.
    pub fn insert(&mut self, service: ServiceType, bundle: CertificateBundle) {
        self.certs.insert(service, bundle);
    }

    /// Adds the bundle for `service`, builder style.
    #[must_use]
    pub fn with(mut self, service: ServiceType, bundle: CertificateBundle) -> Self {
        self.insert(service, bundle);
        self
    }

    /// The issuing CA certificate.
    pub fn ca_pem(&self) -> &[u8] {
        &self.ca_pem
    }

    /// The CA bundle, if one was issued.
    pub fn ca_bundle_pem(&self) -> Option<&[u8]> {
        self.ca_bundle_pem.as_deref()
    }

    /// Hex SHA-256 fingerprint of the issuing CA certificate's DER encoding.
    ///
    /// # Errors
    ///
    /// Returns a [`CertificateError`] if the CA PEM cannot be decoded.
    pub fn ca_fingerprint(&self) -> Result<String, CertificateError> {
        ca_fingerprint(&self.ca_pem)
    }

    /// The bundle for `service`, if present.
    pub fn get(&self, service: ServiceType) -> Option<&CertificateBundle> {
        self.certs.get(&service)
    }

    /// Iterates over the bundles in service type order.
    pub fn iter(&self) -> impl Iterator<Item = (ServiceType, &CertificateBundle)> {
        self.certs.iter().map(|(t, b)| (*t, b))
    }

    /// The service types present in this set.
    pub fn service_types(&self) -> impl Iterator<Item = ServiceType> + '_ {
        self.certs.keys().copied()
    }

    /// Number of bundles.
    pub fn len(&self) -> usize {
        self.certs.len()
    }

    /// Returns `true` if the set holds no bundle.
    pub fn is_empty(&self) -> bool {
        self.certs.is_empty()
    }

    /// Service types from `expected` that have no bundle in this set.
    pub fn missing<'a>(
        &'a self,
        expected: &'a [ServiceType],
    ) -> impl Iterator<Item = ServiceType> + 'a {
        expected
            .iter()
            .copied()
            .filter(|t| !self.certs.contains_key(t))
    }

    /// The bundle expiring first, if any.
    pub fn earliest_expiring(&self) -> Option<(ServiceType, &CertificateBundle)> {
        self.iter().min_by_key(|(_, b)| b.not_after())
    }
}

/// Hex SHA-256 fingerprint of the first certificate in `cert_pem`.
pub(crate) fn ca_fingerprint(cert_pem: &[u8]) -> Result<String, CertificateError> {
    let der = leaf_der(cert_pem)?;
    Ok(hex::encode(Sha256::digest(der)))
}
