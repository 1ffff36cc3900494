//! Test certificates built at runtime
//!
//! RSA key generation is slow in debug builds, so a small pool of keys is
//! generated once per test binary and shared.

use der::asn1::{Any, ObjectIdentifier, SetOfVec, UtcTime};
use der::pem::LineEnding;
use der::{EncodePem, Tag};
use rsa::pkcs1v15::{Signature, SigningKey};
use rsa::pkcs8::EncodePrivateKey;
use rsa::RsaPrivateKey;
use sha2::Sha256;
use std::sync::atomic::{AtomicU16, Ordering};
use std::sync::OnceLock;
use std::time::Duration;
use x509_cert::attr::AttributeTypeAndValue;
use x509_cert::builder::{Builder, CertificateBuilder, Profile};
use x509_cert::ext::pkix::{BasicConstraints, ExtendedKeyUsage, KeyUsage, KeyUsages};
use x509_cert::name::{Name, RdnSequence, RelativeDistinguishedName};
use x509_cert::serial_number::SerialNumber;
use x509_cert::spki::SubjectPublicKeyInfoOwned;
use x509_cert::time::{Time, Validity};

use super::certificate::{unix_now, SmimeCertificate};
use super::oids;
use super::signer::SigningIdentity;

const ROOT_KEY: usize = 0;
const OTHER_ROOT_KEY: usize = 1;
const INTERMEDIATE_KEY: usize = 2;
const LEAF_KEYS: usize = 3;

const DAY: u64 = 24 * 60 * 60;
const CLIENT_AUTH: ObjectIdentifier = ObjectIdentifier::new_unwrap("1.3.6.1.5.5.7.3.2");

static NEXT_SERIAL: AtomicU16 = AtomicU16::new(0);

/// Who signs a generated leaf
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Issuer {
    Root,
    Intermediate,
    /// Issued by the root but lacking the CA basic constraint
    NonCaIntermediate,
    /// Bottom of a line of this many CAs built by [`ca_chain`]
    ChainEnd(usize),
    OtherRoot,
    SelfSigned,
}

/// Shape of a generated leaf certificate
#[derive(Debug, Clone)]
pub struct CertProfile {
    pub email: Option<String>,
    pub data_encipherment: bool,
    pub secure_email: bool,
    pub expired: bool,
    pub issuer: Issuer,
    /// Slot in the shared leaf key pool
    pub key: usize,
}

impl CertProfile {
    /// A fully capable recipient certificate issued by the test root
    pub fn recipient(email: &str) -> Self {
        Self {
            email: Some(email.to_string()),
            data_encipherment: true,
            secure_email: true,
            expired: false,
            issuer: Issuer::Root,
            key: 0,
        }
    }
}

/// Extensions written into a generated certificate
struct Usage {
    ca: bool,
    key_usage: KeyUsage,
    purposes: Vec<ObjectIdentifier>,
}

impl Usage {
    fn ca() -> Self {
        Self {
            ca: true,
            key_usage: KeyUsage(KeyUsages::KeyCertSign | KeyUsages::CRLSign),
            purposes: Vec::new(),
        }
    }

    fn leaf(profile: &CertProfile) -> Self {
        let key_usage = if profile.data_encipherment {
            KeyUsages::DigitalSignature | KeyUsages::KeyEncipherment | KeyUsages::DataEncipherment
        } else {
            KeyUsages::DigitalSignature | KeyUsages::KeyEncipherment
        };
        let purposes = if profile.secure_email {
            vec![oids::ID_KP_EMAIL_PROTECTION]
        } else {
            vec![CLIENT_AUTH]
        };
        Self {
            ca: false,
            key_usage: KeyUsage(key_usage),
            purposes,
        }
    }
}

fn keys() -> &'static [RsaPrivateKey] {
    static KEYS: OnceLock<Vec<RsaPrivateKey>> = OnceLock::new();
    KEYS.get_or_init(|| {
        let mut rng = rand::thread_rng();
        (0..LEAF_KEYS + 3)
            .map(|_| RsaPrivateKey::new(&mut rng, 1024).expect("generate test key"))
            .collect()
    })
}

/// Private key for a leaf key slot
pub fn leaf_key(slot: usize) -> RsaPrivateKey {
    keys()[3 + slot % LEAF_KEYS].clone()
}

pub fn root() -> SmimeCertificate {
    static ROOT: OnceLock<SmimeCertificate> = OnceLock::new();
    ROOT.get_or_init(|| {
        let name = name("MailSeal Test Root", None);
        build(1, name.clone(), name, &keys()[ROOT_KEY], &keys()[ROOT_KEY], Usage::ca(), false)
    })
    .clone()
}

pub fn other_root() -> SmimeCertificate {
    static OTHER: OnceLock<SmimeCertificate> = OnceLock::new();
    OTHER
        .get_or_init(|| {
            let name = name("Unrelated Test Root", None);
            build(
                2,
                name.clone(),
                name,
                &keys()[OTHER_ROOT_KEY],
                &keys()[OTHER_ROOT_KEY],
                Usage::ca(),
                false,
            )
        })
        .clone()
}

pub fn intermediate() -> SmimeCertificate {
    static INTERMEDIATE: OnceLock<SmimeCertificate> = OnceLock::new();
    INTERMEDIATE
        .get_or_init(|| {
            build(
                3,
                root_name(),
                name("MailSeal Test Intermediate", None),
                &keys()[INTERMEDIATE_KEY],
                &keys()[ROOT_KEY],
                Usage::ca(),
                false,
            )
        })
        .clone()
}

/// An end-entity certificate that nonetheless signs leaves
pub fn non_ca_intermediate() -> SmimeCertificate {
    static NON_CA: OnceLock<SmimeCertificate> = OnceLock::new();
    NON_CA
        .get_or_init(|| {
            let usage = Usage {
                ca: false,
                key_usage: KeyUsage(KeyUsages::DigitalSignature.into()),
                purposes: Vec::new(),
            };
            build(
                4,
                root_name(),
                name("MailSeal Test Non-CA", None),
                &keys()[INTERMEDIATE_KEY],
                &keys()[ROOT_KEY],
                usage,
                false,
            )
        })
        .clone()
}

/// A line of `length` CA certificates under the test root, root side first
pub fn ca_chain(length: usize) -> Vec<SmimeCertificate> {
    (1..=length)
        .map(|n| {
            let (issuer, issuer_key) = if n == 1 {
                (root_name(), &keys()[ROOT_KEY])
            } else {
                (chain_ca_name(n - 1), &keys()[INTERMEDIATE_KEY])
            };
            build(
                next_serial(),
                issuer,
                chain_ca_name(n),
                &keys()[INTERMEDIATE_KEY],
                issuer_key,
                Usage::ca(),
                false,
            )
        })
        .collect()
}

/// Generate a leaf certificate
pub fn leaf(profile: CertProfile) -> SmimeCertificate {
    leaf_with_key(profile).0
}

/// Generate a leaf certificate and return its private key
pub fn leaf_with_key(profile: CertProfile) -> (SmimeCertificate, RsaPrivateKey) {
    let key = leaf_key(profile.key);
    let cn = profile.email.clone().unwrap_or_else(|| "No Email".to_string());
    let subject = name(&cn, profile.email.as_deref());

    let (issuer_name, issuer_key) = match profile.issuer {
        Issuer::Root => (root_name(), keys()[ROOT_KEY].clone()),
        Issuer::Intermediate => (subject_of(&intermediate()), keys()[INTERMEDIATE_KEY].clone()),
        Issuer::NonCaIntermediate => (
            subject_of(&non_ca_intermediate()),
            keys()[INTERMEDIATE_KEY].clone(),
        ),
        Issuer::ChainEnd(length) => (chain_ca_name(length), keys()[INTERMEDIATE_KEY].clone()),
        Issuer::OtherRoot => (subject_of(&other_root()), keys()[OTHER_ROOT_KEY].clone()),
        Issuer::SelfSigned => (subject.clone(), key.clone()),
    };

    let cert = build(
        next_serial(),
        issuer_name,
        subject,
        &key,
        &issuer_key,
        Usage::leaf(&profile),
        profile.expired,
    );
    (cert, key)
}

/// The same certificate relabelled with another signature algorithm
pub fn with_signature_algorithm(cert: &SmimeCertificate, oid: ObjectIdentifier) -> SmimeCertificate {
    let mut inner = cert.certificate().clone();
    inner.signature_algorithm.oid = oid;
    SmimeCertificate::from_certificate(inner).expect("wrap certificate")
}

/// A signing identity for `email`, chained to the test root
pub fn identity(email: &str) -> SigningIdentity {
    let (cert, key) = leaf_with_key(CertProfile {
        key: 1,
        ..CertProfile::recipient(email)
    });
    SigningIdentity::new(cert, vec![root()], key).expect("identity")
}

pub fn to_pem(cert: &SmimeCertificate) -> String {
    cert.certificate()
        .to_pem(LineEnding::LF)
        .expect("encode certificate")
}

pub fn key_to_pem(key: &RsaPrivateKey) -> String {
    key.to_pkcs8_pem(LineEnding::LF).expect("encode key").to_string()
}

fn next_serial() -> u16 {
    0x1000 | (NEXT_SERIAL.fetch_add(1, Ordering::Relaxed) & 0x0fff)
}

fn subject_of(cert: &SmimeCertificate) -> Name {
    cert.certificate().tbs_certificate.subject.clone()
}

fn root_name() -> Name {
    subject_of(&root())
}

fn chain_ca_name(n: usize) -> Name {
    name(&format!("MailSeal Chain CA {}", n), None)
}

fn name(common_name: &str, email: Option<&str>) -> Name {
    let mut rdns = vec![rdn(oids::COMMON_NAME, Tag::Utf8String, common_name)];
    if let Some(email) = email {
        rdns.push(rdn(oids::EMAIL_ADDRESS, Tag::Ia5String, email));
    }
    RdnSequence(rdns)
}

fn rdn(oid: ObjectIdentifier, tag: Tag, value: &str) -> RelativeDistinguishedName {
    let atv = AttributeTypeAndValue {
        oid,
        value: Any::new(tag, value.as_bytes()).expect("attribute value"),
    };
    RelativeDistinguishedName(SetOfVec::try_from(vec![atv]).expect("rdn"))
}

fn utc(secs: u64) -> Time {
    Time::UtcTime(UtcTime::from_unix_duration(Duration::from_secs(secs)).expect("utc time"))
}

fn validity(expired: bool) -> Validity {
    let now = unix_now().as_secs();
    if expired {
        Validity {
            not_before: utc(now - 730 * DAY),
            not_after: utc(now - 365 * DAY),
        }
    } else {
        Validity {
            not_before: utc(now - DAY),
            not_after: utc(now + 365 * DAY),
        }
    }
}

fn build(
    serial: u16,
    issuer: Name,
    subject: Name,
    subject_key: &RsaPrivateKey,
    issuer_key: &RsaPrivateKey,
    usage: Usage,
    expired: bool,
) -> SmimeCertificate {
    let serial_bytes = serial.to_be_bytes();
    let serial_bytes: &[u8] = if serial_bytes[0] == 0 {
        &serial_bytes[1..]
    } else {
        &serial_bytes
    };
    let spki = SubjectPublicKeyInfoOwned::from_key(subject_key.to_public_key()).expect("spki");
    let signer = SigningKey::<Sha256>::new(issuer_key.clone());

    let mut builder = CertificateBuilder::new(
        Profile::Manual {
            issuer: Some(issuer),
        },
        SerialNumber::new(serial_bytes).expect("serial"),
        validity(expired),
        subject,
        spki,
        &signer,
    )
    .expect("certificate builder");
    builder
        .add_extension(&BasicConstraints {
            ca: usage.ca,
            path_len_constraint: None,
        })
        .expect("basic constraints");
    builder.add_extension(&usage.key_usage).expect("key usage");
    if !usage.purposes.is_empty() {
        builder
            .add_extension(&ExtendedKeyUsage(usage.purposes))
            .expect("extended key usage");
    }

    let cert = builder.build::<Signature>().expect("sign certificate");
    SmimeCertificate::from_certificate(cert).expect("wrap certificate")
}
