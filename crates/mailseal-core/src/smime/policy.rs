//! Certificate policy validation
//!
//! Decides whether a single certificate is acceptable for a recipient under a
//! set of [`PolicyFlags`]. Local extension checks run before chain
//! verification, and evaluation stops at the first failed requirement.

use mailseal_common::types::PolicyFlags;
use thiserror::Error;

use super::certificate::SmimeCertificate;
use super::chain::{ChainError, TrustStore};

/// Reason a certificate was not accepted
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PolicyRejection {
    #[error("key usage does not include data encipherment")]
    MissingDataEncipherment,

    #[error("enhanced key usage does not include secure email")]
    MissingSecureEmail,

    #[error("certificate chain not trusted: {0}")]
    Untrusted(#[from] ChainError),
}

/// Applies policy flags to candidate certificates
#[derive(Debug, Clone, Default)]
pub struct CertificateValidator {
    trust: TrustStore,
}

impl CertificateValidator {
    pub fn new(trust: TrustStore) -> Self {
        Self { trust }
    }

    /// Check `cert` against every requirement in `policy`
    pub fn validate(
        &self,
        cert: &SmimeCertificate,
        policy: PolicyFlags,
    ) -> Result<(), PolicyRejection> {
        if policy.contains(PolicyFlags::REQUIRE_KEY_USAGE_DATA_ENCIPHERMENT)
            && !cert.allows_data_encipherment()
        {
            return Err(PolicyRejection::MissingDataEncipherment);
        }

        if policy.contains(PolicyFlags::REQUIRE_ENHANCED_KEY_USAGE_SECURE_EMAIL)
            && !cert.allows_secure_email()
        {
            return Err(PolicyRejection::MissingSecureEmail);
        }

        if policy.contains(PolicyFlags::REQUIRE_CERTIFICATE_VERIFICATION) {
            self.trust.verify(cert)?;
        }

        Ok(())
    }

    pub fn is_acceptable(&self, cert: &SmimeCertificate, policy: PolicyFlags) -> bool {
        self.validate(cert, policy).is_ok()
    }
}
