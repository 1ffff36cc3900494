//! CMS detached signatures wrapped in `multipart/signed`
//!
//! The first body part is signed byte-for-byte as it appears between the
//! boundary delimiters, so a verifier can hash exactly what it receives.

use cms::builder::{SignedDataBuilder, SignerInfoBuilder};
use cms::cert::CertificateChoices;
use cms::signed_data::{EncapsulatedContentInfo, SignerIdentifier};
use der::asn1::{Any, SetOfVec, UtcTime};
use der::Encode;
use mailseal_common::{Error, Result};
use rsa::pkcs1::DecodeRsaPrivateKey;
use rsa::pkcs1v15::SigningKey;
use rsa::pkcs8::DecodePrivateKey;
use rsa::RsaPrivateKey;
use rustls_pemfile::private_key;
use sha2::{Digest, Sha256};
use std::fmt;
use std::fs::File;
use std::io::{BufRead, BufReader};
use std::path::Path;
use tracing::debug;
use x509_cert::attr::Attribute;
use x509_cert::spki::AlgorithmIdentifierOwned;
use x509_cert::time::Time;

use super::address::CanonicalAddress;
use super::certificate::{unix_now, SmimeCertificate};
use super::mime::{encode_base64_wrapped, SIGNED_PREAMBLE};
use super::oids;
use super::reader::decrypt_envelope;

/// Protocol parameter of the outer `multipart/signed` content type
pub const SIGNATURE_PROTOCOL: &str = "application/x-pkcs7-signature";
/// Message integrity check algorithm advertised alongside the signature
pub const MICALG: &str = "sha-256";

/// Certificate, chain and private key of the local mail identity
///
/// Signs outbound bodies and opens envelopes addressed to the certificate.
#[derive(Clone)]
pub struct SigningIdentity {
    certificate: SmimeCertificate,
    chain: Vec<SmimeCertificate>,
    key: RsaPrivateKey,
}

impl SigningIdentity {
    /// Pair a certificate with its private key
    ///
    /// `chain` holds the issuing certificates, nearest first.
    pub fn new(
        certificate: SmimeCertificate,
        chain: Vec<SmimeCertificate>,
        key: RsaPrivateKey,
    ) -> Result<Self> {
        if certificate.rsa_public_key()? != key.to_public_key() {
            return Err(Error::Certificate(format!(
                "Private key does not match certificate {}",
                certificate.subject()
            )));
        }
        Ok(Self {
            certificate,
            chain,
            key,
        })
    }

    /// Load from PEM: leaf certificate first then its chain, and a PKCS#8 or PKCS#1 key
    pub fn from_pem(certs: &mut dyn BufRead, key: &mut dyn BufRead) -> Result<Self> {
        let mut certs = SmimeCertificate::from_pem(certs)?.into_iter();
        let leaf = certs
            .next()
            .ok_or_else(|| Error::Certificate("No certificate found in PEM input".to_string()))?;

        let key_der = private_key(key)
            .map_err(|e| Error::Certificate(format!("Failed to read private key: {}", e)))?
            .ok_or_else(|| Error::Certificate("No private key found in PEM input".to_string()))?;
        let key = RsaPrivateKey::from_pkcs8_der(key_der.secret_der())
            .or_else(|_| RsaPrivateKey::from_pkcs1_der(key_der.secret_der()))
            .map_err(|e| Error::Certificate(format!("Unsupported private key: {}", e)))?;

        Self::new(leaf, certs.collect(), key)
    }

    pub fn from_pem_files(cert_path: &Path, key_path: &Path) -> Result<Self> {
        let open = |path: &Path| {
            File::open(path)
                .map(BufReader::new)
                .map_err(|e| Error::Certificate(format!("Failed to open {}: {}", path.display(), e)))
        };
        Self::from_pem(&mut open(cert_path)?, &mut open(key_path)?)
    }

    /// Replace the issuing certificates sent alongside signatures
    pub fn with_chain(mut self, chain: Vec<SmimeCertificate>) -> Self {
        self.chain = chain;
        self
    }

    pub fn certificate(&self) -> &SmimeCertificate {
        &self.certificate
    }

    pub fn chain(&self) -> &[SmimeCertificate] {
        &self.chain
    }

    pub fn email(&self) -> Option<CanonicalAddress> {
        self.certificate.subject_email()
    }

    /// Decrypt an envelope addressed to this identity's certificate
    pub fn decrypt(&self, envelope_der: &[u8]) -> Result<Vec<u8>> {
        decrypt_envelope(envelope_der, &self.certificate, &self.key)
    }

    /// Produce a DER `ContentInfo` holding a detached SignedData over `content`
    pub fn sign_detached(&self, content: &[u8], sign_time: bool) -> Result<Vec<u8>> {
        let fail = |e: cms::builder::Error| Error::crypto("sign", e.to_string());

        let digest = Sha256::digest(content);
        let encap = EncapsulatedContentInfo {
            econtent_type: oids::ID_DATA,
            econtent: None,
        };
        let digest_algorithm = AlgorithmIdentifierOwned {
            oid: oids::ID_SHA_256,
            parameters: None,
        };
        let signing_key = SigningKey::<Sha256>::new(self.key.clone());

        let mut signer_info = SignerInfoBuilder::new(
            &signing_key,
            SignerIdentifier::IssuerAndSerialNumber(self.certificate.issuer_and_serial()),
            digest_algorithm.clone(),
            &encap,
            Some(digest.as_slice()),
        )
        .map_err(fail)?;
        if sign_time {
            signer_info
                .add_signed_attribute(signing_time_attribute()?)
                .map_err(fail)?;
        }

        let mut builder = SignedDataBuilder::new(&encap);
        builder.add_digest_algorithm(digest_algorithm).map_err(fail)?;
        for cert in std::iter::once(&self.certificate).chain(self.chain.iter()) {
            builder
                .add_certificate(CertificateChoices::Certificate(cert.certificate().clone()))
                .map_err(fail)?;
        }
        builder
            .add_signer_info::<SigningKey<Sha256>, rsa::pkcs1v15::Signature>(signer_info)
            .map_err(fail)?;

        let content_info = builder.build().map_err(fail)?;
        content_info.to_der().map_err(|e| Error::crypto("sign", e))
    }
}

impl fmt::Debug for SigningIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SigningIdentity")
            .field("certificate", &self.certificate)
            .field("chain", &self.chain.len())
            .finish_non_exhaustive()
    }
}

fn signing_time_attribute() -> Result<Attribute> {
    let now = UtcTime::from_unix_duration(unix_now()).map_err(|e| Error::crypto("sign", e))?;
    let value = Any::encode_from(&Time::UtcTime(now)).map_err(|e| Error::crypto("sign", e))?;
    let values = SetOfVec::try_from(vec![value]).map_err(|e| Error::crypto("sign", e))?;
    Ok(Attribute {
        oid: oids::ID_SIGNING_TIME,
        values,
    })
}

/// `Content-Type` value for a `multipart/signed` body using `boundary`
pub fn multipart_signed_content_type(boundary: &str) -> String {
    format!(
        "multipart/signed; protocol=\"{}\"; micalg={}; boundary=\"{}\"",
        SIGNATURE_PROTOCOL, MICALG, boundary
    )
}

/// Headers introducing an enveloped-data body part
pub(crate) fn enveloped_part_headers() -> &'static str {
    "Content-Type: application/pkcs7-mime; smime-type=enveloped-data;\r\n\
     \tname=\"smime.p7m\"\r\n\
     Content-Transfer-Encoding: base64\r\n\
     Content-Description: \"S/MIME Cryptographic envelopedCms\"\r\n\
     Content-Disposition: attachment; filename=\"smime.p7m\"\r\n\r\n"
}

/// Sign `content` and wrap it with its signature in `multipart/signed`
///
/// With `already_encrypted` the content is a DER EnvelopedData and is
/// embedded as a base64 `smime.p7m` part; otherwise it is embedded as text.
/// Fails with [`Error::MissingSigningCertificate`] before any hashing when
/// no identity is supplied.
pub fn sign(
    content: &[u8],
    identity: Option<&SigningIdentity>,
    sign_time: bool,
    already_encrypted: bool,
    boundary: &str,
) -> Result<Vec<u8>> {
    let identity = identity.ok_or(Error::MissingSigningCertificate)?;

    let first_part = if already_encrypted {
        format!("{}{}", enveloped_part_headers(), encode_base64_wrapped(content)).into_bytes()
    } else {
        content.to_vec()
    };

    let signature = identity.sign_detached(&first_part, sign_time)?;
    debug!(
        signer = %identity.certificate().subject(),
        content_len = first_part.len(),
        signature_len = signature.len(),
        already_encrypted,
        "Created detached signature"
    );

    let mut head = String::from(SIGNED_PREAMBLE);
    head.push_str("\r\n\r\n");
    head.push_str(&format!("--{}\r\n", boundary));

    let mut tail = format!("\r\n--{}\r\n", boundary);
    tail.push_str(&format!(
        "Content-Type: {}; name=\"smime.p7s\"\r\n",
        SIGNATURE_PROTOCOL
    ));
    tail.push_str("Content-Transfer-Encoding: base64\r\n");
    tail.push_str("Content-Description: \"S/MIME Cryptographic Signature\"\r\n");
    tail.push_str("Content-Disposition: attachment; filename=\"smime.p7s\"\r\n\r\n");
    tail.push_str(&encode_base64_wrapped(&signature));
    tail.push_str(&format!("\r\n--{}--\r\n", boundary));

    let mut out = Vec::with_capacity(head.len() + first_part.len() + tail.len());
    out.extend_from_slice(head.as_bytes());
    out.extend_from_slice(&first_part);
    out.extend_from_slice(tail.as_bytes());
    Ok(out)
}

/// Header block that turns a signed body into a self-describing MIME entity
pub(crate) fn signed_entity_headers(boundary: &str) -> String {
    format!(
        "Content-Type: multipart/signed; protocol=\"{}\"; micalg={};\r\n\tboundary=\"{}\"\r\nContent-Transfer-Encoding: 7bit\r\n\r\n",
        SIGNATURE_PROTOCOL, MICALG, boundary
    )
}
