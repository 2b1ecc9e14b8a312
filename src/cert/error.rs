//! Error types for certificate material parsing and validation.

use x509_parser::error::X509Error;

/// An error that may arise parsing PEM certificate material.
#[derive(Debug, thiserror::Error, PartialEq)]
#[non_exhaustive]
pub enum CertificateError {
    /// The input does not contain a well-formed PEM block.
    #[error("invalid PEM data: {0}")]
    InvalidPem(String),

    /// The PEM block has an unexpected label.
    #[error("unexpected PEM block: expected {expected}, found {found}")]
    UnexpectedPemLabel {
        /// Label suffix that was expected.
        expected: &'static str,
        /// Label that was found.
        found: String,
    },

    /// Error returned by the X.509 parsing library.
    #[error("failed parsing X.509 certificate")]
    ParseX509Certificate(#[from] X509Error),

    /// The certificate's `notAfter` is not later than its `notBefore`.
    #[error("certificate validity window is empty")]
    EmptyValidity,

    /// A service type name is not recognized.
    #[error("unknown service type: {0}")]
    UnknownServiceType(String),
}
