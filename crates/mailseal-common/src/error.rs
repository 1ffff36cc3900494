//! Error types for MailSeal

use thiserror::Error;

/// Boxed cause attached to a failed cryptographic operation
pub type CryptoCause = Box<dyn std::error::Error + Send + Sync + 'static>;

/// Main error type for MailSeal
#[derive(Error, Debug)]
pub enum Error {
    #[error("No signing certificate found; signing was requested without one")]
    MissingSigningCertificate,

    #[error("Recipients missing trusted public keys: {}", .0.join(", "))]
    UnresolvedRecipientKeys(Vec<String>),

    #[error("Message has no recipients")]
    NoRecipients,

    #[error("No recipient certificates supplied for the envelope")]
    NoRecipientKeys,

    #[error("Cryptographic operation failed ({operation}): {source}")]
    CryptoOperationFailed {
        operation: &'static str,
        #[source]
        source: CryptoCause,
    },

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Certificate error: {0}")]
    Certificate(String),

    #[error("MIME error: {0}")]
    Mime(String),

    #[error("Verification error: {0}")]
    Verification(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

/// Result type alias for MailSeal
pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    /// Wrap the failure of a signing or enveloping step
    pub fn crypto<E>(operation: &'static str, source: E) -> Self
    where
        E: Into<CryptoCause>,
    {
        Error::CryptoOperationFailed {
            operation,
            source: source.into(),
        }
    }

    /// Returns the error code string
    pub fn code(&self) -> &'static str {
        match self {
            Error::MissingSigningCertificate => "MISSING_SIGNING_CERTIFICATE",
            Error::UnresolvedRecipientKeys(_) => "UNRESOLVED_RECIPIENT_KEYS",
            Error::NoRecipients => "NO_RECIPIENTS",
            Error::NoRecipientKeys => "NO_RECIPIENT_KEYS",
            Error::CryptoOperationFailed { .. } => "CRYPTO_OPERATION_FAILED",
            Error::Config(_) => "CONFIG_ERROR",
            Error::Certificate(_) => "CERTIFICATE_ERROR",
            Error::Mime(_) => "MIME_ERROR",
            Error::Verification(_) => "VERIFICATION_ERROR",
            Error::Io(_) => "IO_ERROR",
            Error::Other(_) => "INTERNAL_ERROR",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::error::Error as _;

    #[test]
    fn test_unresolved_message_names_addresses() {
        let err = Error::UnresolvedRecipientKeys(vec![
            "B@X.COM".to_string(),
            "C@X.COM".to_string(),
        ]);
        assert_eq!(
            err.to_string(),
            "Recipients missing trusted public keys: B@X.COM, C@X.COM"
        );
        assert_eq!(err.code(), "UNRESOLVED_RECIPIENT_KEYS");
    }

    #[test]
    fn test_crypto_error_keeps_cause() {
        let cause = std::io::Error::new(std::io::ErrorKind::Other, "bad modulus");
        let err = Error::crypto("envelope", cause);
        assert_eq!(err.code(), "CRYPTO_OPERATION_FAILED");
        assert_eq!(err.source().map(|s| s.to_string()), Some("bad modulus".to_string()));
    }
}
