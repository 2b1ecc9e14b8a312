//! Internal PEM / X.509 helpers.

use crate::cert::error::CertificateError;
use time::OffsetDateTime;
use x509_parser::nom::Err;
use x509_parser::pem::{parse_x509_pem, Pem};

const CERTIFICATE_LABEL: &str = "CERTIFICATE";
const PRIVATE_KEY_LABEL_SUFFIX: &str = "PRIVATE KEY";

/// Validity window of an X.509 certificate.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) struct Validity {
    pub(crate) not_before: OffsetDateTime,
    pub(crate) not_after: OffsetDateTime,
}

/// Reads the first PEM block from `input`.
fn first_pem_block(input: &[u8]) -> Result<Pem, CertificateError> {
    match parse_x509_pem(input) {
        Ok((_, pem)) => Ok(pem),
        Err(Err::Incomplete(_)) => Err(CertificateError::InvalidPem(
            "truncated PEM block".to_string(),
        )),
        Err(Err::Error(e) | Err::Failure(e)) => Err(CertificateError::InvalidPem(e.to_string())),
    }
}

/// Returns the DER bytes of the first certificate in a PEM chain.
pub(crate) fn leaf_der(cert_pem: &[u8]) -> Result<Vec<u8>, CertificateError> {
    let pem = first_pem_block(cert_pem)?;
    if pem.label != CERTIFICATE_LABEL {
        return Err(CertificateError::UnexpectedPemLabel {
            expected: CERTIFICATE_LABEL,
            found: pem.label,
        });
    }
    Ok(pem.contents)
}

/// Parses the validity window of the first certificate in a PEM chain.
pub(crate) fn leaf_validity(cert_pem: &[u8]) -> Result<Validity, CertificateError> {
    let der = leaf_der(cert_pem)?;
    let (_, cert) = x509_parser::parse_x509_certificate(&der).map_err(|e| match e {
        Err::Incomplete(_) => {
            CertificateError::ParseX509Certificate(x509_parser::error::X509Error::InvalidCertificate)
        }
        Err::Error(err) | Err::Failure(err) => CertificateError::ParseX509Certificate(err),
    })?;

    let validity = cert.validity();
    let not_before = validity.not_before.to_datetime();
    let not_after = validity.not_after.to_datetime();
    if not_after <= not_before {
        return Err(CertificateError::EmptyValidity);
    }

    Ok(Validity {
        not_before,
        not_after,
    })
}

/// Checks that `key_pem` starts with a private key PEM block.
pub(crate) fn check_private_key(key_pem: &[u8]) -> Result<(), CertificateError> {
    let pem = first_pem_block(key_pem)?;
    if !pem.label.ends_with(PRIVATE_KEY_LABEL_SUFFIX) {
        return Err(CertificateError::UnexpectedPemLabel {
            expected: PRIVATE_KEY_LABEL_SUFFIX,
            found: pem.label,
        });
    }
    Ok(())
}
