//! Read-only certificate handle
//!
//! Wraps a parsed X.509 certificate together with its DER encoding so it can
//! be embedded in CMS structures, matched against recipients, and checked by
//! the policy validator without re-parsing.

use cms::cert::IssuerAndSerialNumber;
use der::oid::AssociatedOid;
use der::{Decode, Encode};
use mailseal_common::{Error, Result};
use rsa::pkcs8::DecodePublicKey;
use rsa::RsaPublicKey;
use rustls_pemfile::certs;
use sha2::{Digest, Sha256};
use std::fmt;
use std::io::BufRead;
use std::sync::Arc;
use std::time::Duration;
use x509_cert::ext::pkix::name::GeneralName;
use x509_cert::ext::pkix::{
    BasicConstraints, ExtendedKeyUsage, KeyUsage, KeyUsages, SubjectAltName,
};
use x509_cert::Certificate;

use super::address::CanonicalAddress;
use super::oids;

struct Inner {
    cert: Certificate,
    der: Vec<u8>,
    fingerprint: String,
}

/// A parsed certificate, cheap to clone
#[derive(Clone)]
pub struct SmimeCertificate {
    inner: Arc<Inner>,
}

impl SmimeCertificate {
    /// Parse a DER-encoded certificate
    pub fn from_der(der: &[u8]) -> Result<Self> {
        let cert = Certificate::from_der(der)
            .map_err(|e| Error::Certificate(format!("Failed to parse certificate: {}", e)))?;
        Ok(Self::from_parts(cert, der.to_vec()))
    }

    /// Wrap an already parsed certificate
    pub fn from_certificate(cert: Certificate) -> Result<Self> {
        let der = cert
            .to_der()
            .map_err(|e| Error::Certificate(format!("Failed to encode certificate: {}", e)))?;
        Ok(Self::from_parts(cert, der))
    }

    /// Parse every certificate in a PEM stream, in file order
    pub fn from_pem(reader: &mut dyn BufRead) -> Result<Vec<Self>> {
        certs(reader)
            .map(|item| {
                let der = item
                    .map_err(|e| Error::Certificate(format!("Failed to read PEM: {}", e)))?;
                Self::from_der(der.as_ref())
            })
            .collect()
    }

    fn from_parts(cert: Certificate, der: Vec<u8>) -> Self {
        let fingerprint = hex::encode(Sha256::digest(&der));
        Self {
            inner: Arc::new(Inner {
                cert,
                der,
                fingerprint,
            }),
        }
    }

    pub fn certificate(&self) -> &Certificate {
        &self.inner.cert
    }

    pub fn der(&self) -> &[u8] {
        &self.inner.der
    }

    /// Hex SHA-256 of the DER encoding
    pub fn fingerprint(&self) -> &str {
        &self.inner.fingerprint
    }

    pub fn subject(&self) -> String {
        self.inner.cert.tbs_certificate.subject.to_string()
    }

    pub fn issuer(&self) -> String {
        self.inner.cert.tbs_certificate.issuer.to_string()
    }

    /// Email address bound to the certificate subject
    ///
    /// Taken from the subject `emailAddress` attribute, falling back to the
    /// first rfc822Name in the subject alternative name extension.
    pub fn subject_email(&self) -> Option<CanonicalAddress> {
        let subject = &self.inner.cert.tbs_certificate.subject;
        let from_subject = subject
            .0
            .iter()
            .flat_map(|rdn| rdn.0.iter())
            .find(|atv| atv.oid == oids::EMAIL_ADDRESS)
            .and_then(|atv| std::str::from_utf8(atv.value.value()).ok())
            .map(CanonicalAddress::from_subject);

        from_subject
            .or_else(|| {
                self.extension::<SubjectAltName>().and_then(|san| {
                    san.0.iter().find_map(|name| match name {
                        GeneralName::Rfc822Name(addr) => {
                            Some(CanonicalAddress::from_subject(&addr.to_string()))
                        }
                        _ => None,
                    })
                })
            })
            .filter(|addr| !addr.is_empty())
    }

    /// Decode an extension by its associated OID
    pub fn extension<T>(&self) -> Option<T>
    where
        T: AssociatedOid + for<'a> Decode<'a>,
    {
        self.inner
            .cert
            .tbs_certificate
            .extensions
            .as_ref()?
            .iter()
            .find(|ext| ext.extn_id == T::OID)
            .and_then(|ext| T::from_der(ext.extn_value.as_bytes()).ok())
    }

    pub fn allows_data_encipherment(&self) -> bool {
        self.extension::<KeyUsage>()
            .map(|ku| ku.0.contains(KeyUsages::DataEncipherment))
            .unwrap_or(false)
    }

    pub fn allows_secure_email(&self) -> bool {
        self.extension::<ExtendedKeyUsage>()
            .map(|eku| eku.0.contains(&oids::ID_KP_EMAIL_PROTECTION))
            .unwrap_or(false)
    }

    pub fn is_ca(&self) -> bool {
        self.extension::<BasicConstraints>()
            .map(|bc| bc.ca)
            .unwrap_or(false)
    }

    /// Whether `now` (seconds since the Unix epoch) falls inside the validity window
    pub fn is_valid_at(&self, now: Duration) -> bool {
        let validity = &self.inner.cert.tbs_certificate.validity;
        validity.not_before.to_unix_duration() <= now && now <= validity.not_after.to_unix_duration()
    }

    pub fn issuer_and_serial(&self) -> IssuerAndSerialNumber {
        let tbs = &self.inner.cert.tbs_certificate;
        IssuerAndSerialNumber {
            issuer: tbs.issuer.clone(),
            serial_number: tbs.serial_number.clone(),
        }
    }

    /// Whether this certificate is the one named by an issuer-and-serial identifier
    pub fn matches(&self, id: &IssuerAndSerialNumber) -> bool {
        let tbs = &self.inner.cert.tbs_certificate;
        tbs.issuer == id.issuer && tbs.serial_number == id.serial_number
    }

    pub fn rsa_public_key(&self) -> Result<RsaPublicKey> {
        let spki = self
            .inner
            .cert
            .tbs_certificate
            .subject_public_key_info
            .to_der()
            .map_err(|e| Error::Certificate(format!("Failed to encode public key: {}", e)))?;
        RsaPublicKey::from_public_key_der(&spki)
            .map_err(|e| Error::Certificate(format!("Not an RSA public key: {}", e)))
    }
}

impl PartialEq for SmimeCertificate {
    fn eq(&self, other: &Self) -> bool {
        self.inner.der == other.inner.der
    }
}

impl Eq for SmimeCertificate {}

impl fmt::Debug for SmimeCertificate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SmimeCertificate")
            .field("subject", &self.subject())
            .field("issuer", &self.issuer())
            .field("fingerprint", &self.fingerprint())
            .finish()
    }
}

/// Current time as a duration since the Unix epoch
pub(crate) fn unix_now() -> Duration {
    Duration::from_secs(chrono::Utc::now().timestamp().max(0) as u64)
}
