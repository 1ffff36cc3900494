//! Certificate chain verification against explicit trust anchors

use der::Encode;
use mailseal_common::{Error, Result};
use rsa::pkcs1v15::{Signature, VerifyingKey};
use rsa::signature::Verifier;
use sha2::{Sha256, Sha384, Sha512};
use std::fs::File;
use std::io::BufReader;
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;
use tracing::debug;

use super::certificate::{unix_now, SmimeCertificate};
use super::oids;

/// Longest issuer path walked before giving up
pub const MAX_CHAIN_DEPTH: usize = 8;

/// Why a certificate failed chain verification
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ChainError {
    #[error("no trusted issuer found for {0}")]
    UntrustedIssuer(String),

    #[error("certificate {0} is outside its validity period")]
    OutsideValidity(String),

    #[error("issuer {0} is not a certificate authority")]
    NotCa(String),

    #[error("unsupported signature algorithm {0}")]
    UnsupportedAlgorithm(String),

    #[error("malformed certificate {0}")]
    Malformed(String),

    #[error("chain exceeds maximum depth of {MAX_CHAIN_DEPTH}")]
    TooDeep,
}

/// Trusted roots plus intermediates available for path building
#[derive(Debug, Clone, Default)]
pub struct TrustStore {
    anchors: Vec<SmimeCertificate>,
    intermediates: Vec<SmimeCertificate>,
}

impl TrustStore {
    pub fn new(anchors: Vec<SmimeCertificate>) -> Self {
        Self {
            anchors,
            intermediates: Vec::new(),
        }
    }

    pub fn with_intermediates(mut self, intermediates: Vec<SmimeCertificate>) -> Self {
        self.intermediates = intermediates;
        self
    }

    /// Load anchors and intermediates from PEM bundles
    pub fn from_pem_files(anchors: &[PathBuf], intermediates: &[PathBuf]) -> Result<Self> {
        Ok(Self {
            anchors: load_bundles(anchors)?,
            intermediates: load_bundles(intermediates)?,
        })
    }

    pub fn anchors(&self) -> &[SmimeCertificate] {
        &self.anchors
    }

    pub fn is_empty(&self) -> bool {
        self.anchors.is_empty()
    }

    /// Verify `leaf` up to a trust anchor at the current time
    pub fn verify(&self, leaf: &SmimeCertificate) -> std::result::Result<usize, ChainError> {
        self.verify_at(leaf, &[], unix_now())
    }

    /// Verify `leaf` using `extra` as additional untrusted intermediates
    ///
    /// Returns the number of issuer links walked.
    pub fn verify_at(
        &self,
        leaf: &SmimeCertificate,
        extra: &[SmimeCertificate],
        now: Duration,
    ) -> std::result::Result<usize, ChainError> {
        check_validity(leaf, now)?;
        if self.anchors.iter().any(|a| a == leaf) {
            return Ok(0);
        }

        let mut current = leaf.clone();
        for depth in 1..=MAX_CHAIN_DEPTH {
            let mut failure = None;

            if let Some(anchor) = find_issuer(&current, self.anchors.iter(), &mut failure) {
                check_validity(anchor, now)?;
                debug!(
                    subject = %leaf.subject(),
                    anchor = %anchor.subject(),
                    depth,
                    "Certificate chain verified"
                );
                return Ok(depth);
            }

            let candidates = self.intermediates.iter().chain(extra.iter());
            let Some(issuer) = find_issuer(&current, candidates, &mut failure).cloned() else {
                return Err(failure.unwrap_or_else(|| ChainError::UntrustedIssuer(current.subject())));
            };

            if !issuer.is_ca() {
                return Err(ChainError::NotCa(issuer.subject()));
            }
            check_validity(&issuer, now)?;
            current = issuer;
        }

        Err(ChainError::TooDeep)
    }

    /// Issuers of `leaf` known to the store, nearest first
    ///
    /// Walks intermediates and anchors by name and signature, ending at the
    /// first anchor. A missing link ends the walk with the path found so far.
    pub fn issuer_chain(&self, leaf: &SmimeCertificate) -> Vec<SmimeCertificate> {
        let mut chain = Vec::new();
        let mut current = leaf.clone();
        while chain.len() < MAX_CHAIN_DEPTH && !self.anchors.contains(&current) {
            let candidates = self.intermediates.iter().chain(self.anchors.iter());
            match find_issuer(&current, candidates, &mut None).cloned() {
                Some(issuer) => {
                    chain.push(issuer.clone());
                    current = issuer;
                }
                None => break,
            }
        }
        chain
    }
}

/// First candidate named as `cert`'s issuer whose key verifies its signature
///
/// A candidate that cannot be checked at all, such as one behind an
/// unsupported algorithm, is recorded in `failure`.
fn find_issuer<'a>(
    cert: &SmimeCertificate,
    candidates: impl Iterator<Item = &'a SmimeCertificate>,
    failure: &mut Option<ChainError>,
) -> Option<&'a SmimeCertificate> {
    let issuer_name = &cert.certificate().tbs_certificate.issuer;
    for candidate in candidates {
        if candidate == cert || &candidate.certificate().tbs_certificate.subject != issuer_name {
            continue;
        }
        match verify_signed_by(cert, candidate) {
            Ok(()) => return Some(candidate),
            Err(e @ (ChainError::UnsupportedAlgorithm(_) | ChainError::Malformed(_))) => {
                *failure = Some(e)
            }
            Err(_) => {}
        }
    }
    None
}

fn load_bundles(paths: &[PathBuf]) -> Result<Vec<SmimeCertificate>> {
    let mut certs = Vec::new();
    for path in paths {
        certs.extend(load_bundle(path)?);
    }
    Ok(certs)
}

fn load_bundle(path: &Path) -> Result<Vec<SmimeCertificate>> {
    let file = File::open(path).map_err(|e| {
        Error::Certificate(format!("Failed to open {}: {}", path.display(), e))
    })?;
    SmimeCertificate::from_pem(&mut BufReader::new(file))
}

fn check_validity(cert: &SmimeCertificate, now: Duration) -> std::result::Result<(), ChainError> {
    if cert.is_valid_at(now) {
        Ok(())
    } else {
        Err(ChainError::OutsideValidity(cert.subject()))
    }
}

/// Check that `issuer`'s key produced the signature on `cert`
pub(crate) fn verify_signed_by(
    cert: &SmimeCertificate,
    issuer: &SmimeCertificate,
) -> std::result::Result<(), ChainError> {
    let inner = cert.certificate();
    let tbs = inner
        .tbs_certificate
        .to_der()
        .map_err(|_| ChainError::Malformed(cert.subject()))?;
    let key = issuer
        .rsa_public_key()
        .map_err(|_| ChainError::Malformed(issuer.subject()))?;
    let signature = Signature::try_from(inner.signature.raw_bytes())
        .map_err(|_| ChainError::Malformed(cert.subject()))?;

    let algorithm = inner.signature_algorithm.oid;
    let verified = if algorithm == oids::SHA256_WITH_RSA {
        VerifyingKey::<Sha256>::new(key).verify(&tbs, &signature)
    } else if algorithm == oids::SHA384_WITH_RSA {
        VerifyingKey::<Sha384>::new(key).verify(&tbs, &signature)
    } else if algorithm == oids::SHA512_WITH_RSA {
        VerifyingKey::<Sha512>::new(key).verify(&tbs, &signature)
    } else {
        return Err(ChainError::UnsupportedAlgorithm(algorithm.to_string()));
    };

    verified.map_err(|_| ChainError::UntrustedIssuer(cert.subject()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::smime::fixtures::{self, CertProfile, Issuer};
    use pretty_assertions::assert_eq;
    use std::io::Write;

    #[test]
    fn test_leaf_issued_by_anchor() {
        let store = TrustStore::new(vec![fixtures::root()]);
        let leaf = fixtures::leaf(CertProfile::recipient("a@x.com"));
        assert_eq!(store.verify(&leaf), Ok(1));
    }

    #[test]
    fn test_leaf_through_intermediate() {
        let leaf = fixtures::leaf(CertProfile {
            issuer: Issuer::Intermediate,
            ..CertProfile::recipient("a@x.com")
        });

        let bare = TrustStore::new(vec![fixtures::root()]);
        assert!(matches!(bare.verify(&leaf), Err(ChainError::UntrustedIssuer(_))));

        let store = bare.with_intermediates(vec![fixtures::intermediate()]);
        assert_eq!(store.verify(&leaf), Ok(2));

        let supplied = TrustStore::new(vec![fixtures::root()]);
        assert_eq!(
            supplied.verify_at(&leaf, &[fixtures::intermediate()], unix_now()),
            Ok(2)
        );
    }

    #[test]
    fn test_untrusted_root_rejected() {
        let store = TrustStore::new(vec![fixtures::root()]);
        let leaf = fixtures::leaf(CertProfile {
            issuer: Issuer::OtherRoot,
            ..CertProfile::recipient("a@x.com")
        });
        assert!(matches!(store.verify(&leaf), Err(ChainError::UntrustedIssuer(_))));
    }

    #[test]
    fn test_expired_leaf_rejected() {
        let store = TrustStore::new(vec![fixtures::root()]);
        let leaf = fixtures::leaf(CertProfile {
            expired: true,
            ..CertProfile::recipient("a@x.com")
        });
        assert!(matches!(store.verify(&leaf), Err(ChainError::OutsideValidity(_))));
    }

    #[test]
    fn test_self_signed_leaf_untrusted() {
        let issuer = fixtures::leaf(CertProfile {
            issuer: Issuer::SelfSigned,
            ..CertProfile::recipient("issuer@x.com")
        });
        let store = TrustStore::new(vec![fixtures::root()]);
        assert!(matches!(store.verify(&issuer), Err(ChainError::UntrustedIssuer(_))));
    }

    #[test]
    fn test_anchor_leaf_accepted() {
        let leaf = fixtures::leaf(CertProfile {
            issuer: Issuer::SelfSigned,
            ..CertProfile::recipient("a@x.com")
        });
        let store = TrustStore::new(vec![leaf.clone()]);
        assert_eq!(store.verify(&leaf), Ok(0));
    }

    #[test]
    fn test_issuer_without_ca_flag_rejected() {
        let store = TrustStore::new(vec![fixtures::root()])
            .with_intermediates(vec![fixtures::non_ca_intermediate()]);
        let leaf = fixtures::leaf(CertProfile {
            issuer: Issuer::NonCaIntermediate,
            ..CertProfile::recipient("a@x.com")
        });
        assert_eq!(
            store.verify(&leaf),
            Err(ChainError::NotCa(fixtures::non_ca_intermediate().subject()))
        );
    }

    #[test]
    fn test_chain_depth_limit() {
        let longest = MAX_CHAIN_DEPTH - 1;
        let store = TrustStore::new(vec![fixtures::root()])
            .with_intermediates(fixtures::ca_chain(longest));
        let leaf = fixtures::leaf(CertProfile {
            issuer: Issuer::ChainEnd(longest),
            ..CertProfile::recipient("a@x.com")
        });
        assert_eq!(store.verify(&leaf), Ok(MAX_CHAIN_DEPTH));

        let store = TrustStore::new(vec![fixtures::root()])
            .with_intermediates(fixtures::ca_chain(MAX_CHAIN_DEPTH));
        let leaf = fixtures::leaf(CertProfile {
            issuer: Issuer::ChainEnd(MAX_CHAIN_DEPTH),
            ..CertProfile::recipient("a@x.com")
        });
        assert_eq!(store.verify(&leaf), Err(ChainError::TooDeep));
    }

    #[test]
    fn test_unsupported_signature_algorithm() {
        let sha1_with_rsa = der::asn1::ObjectIdentifier::new_unwrap("1.2.840.113549.1.1.5");
        let leaf = fixtures::with_signature_algorithm(
            &fixtures::leaf(CertProfile::recipient("a@x.com")),
            sha1_with_rsa,
        );
        let store = TrustStore::new(vec![fixtures::root()]);
        assert_eq!(
            store.verify(&leaf),
            Err(ChainError::UnsupportedAlgorithm("1.2.840.113549.1.1.5".to_string()))
        );
    }

    #[test]
    fn test_issuer_chain_nearest_first() {
        let store = TrustStore::new(vec![fixtures::root()])
            .with_intermediates(vec![fixtures::intermediate()]);
        let leaf = fixtures::leaf(CertProfile {
            issuer: Issuer::Intermediate,
            ..CertProfile::recipient("a@x.com")
        });
        assert_eq!(
            store.issuer_chain(&leaf),
            vec![fixtures::intermediate(), fixtures::root()]
        );

        let stranger = fixtures::leaf(CertProfile {
            issuer: Issuer::OtherRoot,
            ..CertProfile::recipient("a@x.com")
        });
        assert!(store.issuer_chain(&stranger).is_empty());
    }

    #[test]
    fn test_from_pem_files() {
        let mut roots = tempfile::NamedTempFile::new().unwrap();
        roots.write_all(fixtures::to_pem(&fixtures::root()).as_bytes()).unwrap();
        let mut chain = tempfile::NamedTempFile::new().unwrap();
        chain
            .write_all(fixtures::to_pem(&fixtures::intermediate()).as_bytes())
            .unwrap();

        let store = TrustStore::from_pem_files(
            &[roots.path().to_path_buf()],
            &[chain.path().to_path_buf()],
        )
        .unwrap();
        assert_eq!(store.anchors().len(), 1);

        let leaf = fixtures::leaf(CertProfile {
            issuer: Issuer::Intermediate,
            ..CertProfile::recipient("a@x.com")
        });
        assert_eq!(store.verify(&leaf), Ok(2));
    }

    #[test]
    fn test_missing_bundle_is_error() {
        let err = TrustStore::from_pem_files(&[PathBuf::from("/nonexistent/roots.pem")], &[])
            .unwrap_err();
        assert_eq!(err.code(), "CERTIFICATE_ERROR");
    }
}
