//! Protection pipeline orchestration
//!
//! Chooses one [`ProtectionMode`] from the requested flags, runs every
//! pre-flight check, and only then applies the signing and enveloping steps
//! in the order that mode prescribes:
//!
//! | Mode                  | Steps                                   | Outer type            | Encoding |
//! |-----------------------|-----------------------------------------|-----------------------|----------|
//! | `None`                | pass through                            | native                | native   |
//! | `Signed`              | sign                                    | `multipart/signed`    | 7bit     |
//! | `Enveloped`           | envelope                                | `application/pkcs7-mime` | base64 |
//! | `SignedThenEnveloped` | sign, envelope                          | `application/pkcs7-mime` | base64 |
//! | `TripleWrapped`       | sign, envelope, sign                    | `multipart/signed`    | 7bit     |

use mailseal_common::config::SmimeConfig;
use mailseal_common::types::{PolicyFlags, ProtectionFlags, SettingsMode, TransferEncoding};
use mailseal_common::{Error, Result};
use std::fmt;
use std::sync::Arc;
use tracing::{debug, info, warn};

use super::address::{merge_recipients, CanonicalAddress};
use super::certificate::SmimeCertificate;
use super::chain::TrustStore;
use super::envelope::envelope;
use super::mime::MessageBoundaries;
use super::policy::CertificateValidator;
use super::resolver::{RecipientCache, RecipientKeyResolver};
use super::signer::{multipart_signed_content_type, sign, signed_entity_headers, SigningIdentity};
use super::source::{CertificateSource, PemDirectorySource};

/// Outer content type of an enveloped body
pub const ENVELOPED_CONTENT_TYPE: &str =
    "application/pkcs7-mime; smime-type=enveloped-data; name=\"smime.p7m\"";

const DEFAULT_NATIVE_CONTENT_TYPE: &str = "text/plain; charset=utf-8";

/// The transform sequence applied to one message
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ProtectionMode {
    None,
    Signed,
    Enveloped,
    SignedThenEnveloped,
    TripleWrapped,
}

impl ProtectionMode {
    /// Triple wrapping overrides the individual flags
    pub fn from_flags(flags: ProtectionFlags) -> Self {
        if flags.contains(ProtectionFlags::TRIPLE_WRAPPED) {
            return ProtectionMode::TripleWrapped;
        }
        match (
            flags.contains(ProtectionFlags::SIGNED),
            flags.contains(ProtectionFlags::ENVELOPE_ENCRYPTED),
        ) {
            (false, false) => ProtectionMode::None,
            (true, false) => ProtectionMode::Signed,
            (false, true) => ProtectionMode::Enveloped,
            (true, true) => ProtectionMode::SignedThenEnveloped,
        }
    }

    pub fn signs(&self) -> bool {
        matches!(
            self,
            ProtectionMode::Signed | ProtectionMode::SignedThenEnveloped | ProtectionMode::TripleWrapped
        )
    }

    pub fn encrypts(&self) -> bool {
        matches!(
            self,
            ProtectionMode::Enveloped
                | ProtectionMode::SignedThenEnveloped
                | ProtectionMode::TripleWrapped
        )
    }

    /// Mode left after dropping every signing layer
    pub fn without_signing(self) -> Self {
        match self {
            ProtectionMode::Signed => ProtectionMode::None,
            ProtectionMode::SignedThenEnveloped | ProtectionMode::TripleWrapped => {
                ProtectionMode::Enveloped
            }
            other => other,
        }
    }

    /// Mode left after dropping the encryption layer
    pub fn without_encryption(self) -> Self {
        match self {
            ProtectionMode::Enveloped => ProtectionMode::None,
            ProtectionMode::SignedThenEnveloped | ProtectionMode::TripleWrapped => {
                ProtectionMode::Signed
            }
            other => other,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ProtectionMode::None => "none",
            ProtectionMode::Signed => "signed",
            ProtectionMode::Enveloped => "enveloped",
            ProtectionMode::SignedThenEnveloped => "signed-enveloped",
            ProtectionMode::TripleWrapped => "triple-wrapped",
        }
    }
}

impl fmt::Display for ProtectionMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A rendered message body and everything needed to protect it
#[derive(Debug, Clone)]
pub struct ProtectionRequest<'a> {
    content: &'a [u8],
    recipients: Vec<String>,
    flags: ProtectionFlags,
    policy: PolicyFlags,
    native_content_type: String,
    native_transfer_encoding: TransferEncoding,
    boundaries: MessageBoundaries,
}

impl<'a> ProtectionRequest<'a> {
    pub fn new(content: &'a [u8]) -> Self {
        Self {
            content,
            recipients: Vec::new(),
            flags: ProtectionFlags::empty(),
            policy: PolicyFlags::empty(),
            native_content_type: DEFAULT_NATIVE_CONTENT_TYPE.to_string(),
            native_transfer_encoding: TransferEncoding::SevenBit,
            boundaries: MessageBoundaries::generate(),
        }
    }

    pub fn to<I, S>(mut self, addresses: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.recipients.extend(addresses.into_iter().map(Into::into));
        self
    }

    pub fn cc<I, S>(self, addresses: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.to(addresses)
    }

    pub fn bcc<I, S>(self, addresses: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.to(addresses)
    }

    pub fn flags(mut self, flags: ProtectionFlags) -> Self {
        self.flags = flags;
        self
    }

    pub fn policy(mut self, policy: PolicyFlags) -> Self {
        self.policy = policy;
        self
    }

    /// Content type and encoding used when no protection applies
    pub fn native(mut self, content_type: impl Into<String>, encoding: TransferEncoding) -> Self {
        self.native_content_type = content_type.into();
        self.native_transfer_encoding = encoding;
        self
    }

    pub fn boundaries(mut self, boundaries: MessageBoundaries) -> Self {
        self.boundaries = boundaries;
        self
    }

    /// Merged, de-duplicated recipients in first-seen order
    pub fn recipients(&self) -> Vec<CanonicalAddress> {
        merge_recipients(self.recipients.iter().map(String::as_str))
    }

    pub fn mode(&self) -> ProtectionMode {
        ProtectionMode::from_flags(self.flags)
    }
}

/// Final body plus the outer headers describing it
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProtectedBody {
    /// Body bytes before transfer encoding
    pub bytes: Vec<u8>,
    pub content_type: String,
    pub transfer_encoding: TransferEncoding,
    pub mode: ProtectionMode,
}

/// Applies S/MIME protection to outbound messages
///
/// One instance lives for a session; its recipient cache is shared by every
/// message protected through it.
pub struct ProtectionPipeline {
    resolver: RecipientKeyResolver,
    identity: Option<SigningIdentity>,
    settings_mode: SettingsMode,
}

impl ProtectionPipeline {
    pub fn new(resolver: RecipientKeyResolver, identity: Option<SigningIdentity>) -> Self {
        Self {
            resolver,
            identity,
            settings_mode: SettingsMode::RequireExact,
        }
    }

    pub fn with_settings_mode(mut self, mode: SettingsMode) -> Self {
        self.settings_mode = mode;
        self
    }

    /// Build a pipeline from the `[smime]` configuration section
    pub fn from_config(config: &SmimeConfig) -> Result<Self> {
        let trust = TrustStore::from_pem_files(&config.trust_anchors, &config.intermediates)?;
        if config.require_certificate_verification && trust.is_empty() {
            warn!("Certificate verification required but no trust anchors configured");
        }

        let identity = match (&config.signing_certificate, &config.signing_key) {
            (Some(cert), Some(key)) => {
                let identity = SigningIdentity::from_pem_files(cert, key)?;
                if identity.chain().is_empty() {
                    let chain = trust.issuer_chain(identity.certificate());
                    debug!(
                        subject = %identity.certificate().subject(),
                        length = chain.len(),
                        "Completed signing chain from trust store"
                    );
                    Some(identity.with_chain(chain))
                } else {
                    Some(identity)
                }
            }
            (None, None) => None,
            _ => {
                return Err(Error::Config(
                    "signing_certificate and signing_key must be set together".to_string(),
                ))
            }
        };

        let source: Arc<dyn CertificateSource> =
            Arc::new(PemDirectorySource::new(config.certificate_dirs.clone()));
        let resolver = RecipientKeyResolver::new(
            source,
            CertificateValidator::new(trust),
            Arc::new(RecipientCache::new()),
        );
        Ok(Self::new(resolver, identity).with_settings_mode(config.settings_mode))
    }

    pub fn identity(&self) -> Option<&SigningIdentity> {
        self.identity.as_ref()
    }

    pub fn resolver(&self) -> &RecipientKeyResolver {
        &self.resolver
    }

    /// Protect one message
    ///
    /// Every precondition is checked before the first cryptographic step, so
    /// a failure never leaves a partially protected body behind.
    pub fn protect(&self, request: &ProtectionRequest<'_>) -> Result<ProtectedBody> {
        let recipients = request.recipients();
        if recipients.is_empty() {
            return Err(Error::NoRecipients);
        }

        let requested = request.mode();
        let mut mode = requested;

        if mode.signs() && self.identity.is_none() {
            match self.settings_mode {
                SettingsMode::RequireExact => return Err(Error::MissingSigningCertificate),
                SettingsMode::BestEffort => {
                    warn!(mode = %mode, "No signing certificate; sending without signature");
                    mode = mode.without_signing();
                }
            }
        }

        let mut certificates: Vec<SmimeCertificate> = Vec::new();
        if mode.encrypts() {
            let resolution = self.resolver.resolve(&recipients, request.policy)?;
            if resolution.is_complete() {
                certificates = resolution.certificates();
            } else {
                match self.settings_mode {
                    SettingsMode::RequireExact => {
                        return Err(Error::UnresolvedRecipientKeys(resolution.unresolved_strings()))
                    }
                    SettingsMode::BestEffort => {
                        warn!(
                            unresolved = %resolution.unresolved_strings().join(", "),
                            "Recipients without certificates; sending without encryption"
                        );
                        mode = mode.without_encryption();
                    }
                }
            }
        }

        let body = self.apply(mode, request, &certificates)?;
        info!(
            requested = %requested,
            mode = %mode,
            recipients = recipients.len(),
            size = body.bytes.len(),
            "Message protected"
        );
        Ok(body)
    }

    fn apply(
        &self,
        mode: ProtectionMode,
        request: &ProtectionRequest<'_>,
        certificates: &[SmimeCertificate],
    ) -> Result<ProtectedBody> {
        let identity = self.identity.as_ref();
        let sign_time = request.policy.contains(PolicyFlags::SIGN_TIME);
        let boundaries = &request.boundaries;

        let sign_inner = || {
            sign(
                request.content,
                identity,
                sign_time,
                false,
                &boundaries.signature,
            )
        };
        let envelope_signed = |signed: Vec<u8>| {
            let mut entity = signed_entity_headers(&boundaries.signature).into_bytes();
            entity.extend_from_slice(&signed);
            envelope(&entity, certificates)
        };

        let (bytes, content_type, transfer_encoding) = match mode {
            ProtectionMode::None => (
                request.content.to_vec(),
                request.native_content_type.clone(),
                request.native_transfer_encoding,
            ),
            ProtectionMode::Signed => (
                sign_inner()?,
                multipart_signed_content_type(&boundaries.signature),
                TransferEncoding::SevenBit,
            ),
            ProtectionMode::Enveloped => (
                envelope(request.content, certificates)?,
                ENVELOPED_CONTENT_TYPE.to_string(),
                TransferEncoding::Base64,
            ),
            ProtectionMode::SignedThenEnveloped => (
                envelope_signed(sign_inner()?)?,
                ENVELOPED_CONTENT_TYPE.to_string(),
                TransferEncoding::Base64,
            ),
            ProtectionMode::TripleWrapped => {
                let enveloped = envelope_signed(sign_inner()?)?;
                (
                    sign(
                        &enveloped,
                        identity,
                        sign_time,
                        true,
                        &boundaries.triple_signature,
                    )?,
                    multipart_signed_content_type(&boundaries.triple_signature),
                    TransferEncoding::SevenBit,
                )
            }
        };

        Ok(ProtectedBody {
            bytes,
            content_type,
            transfer_encoding,
            mode,
        })
    }
}
