//! CMS EnvelopedData with AES-256-CBC content encryption
//!
//! A fresh content-encryption key and IV are drawn from the OS RNG on every
//! call; the key is wrapped once per recipient with RSA key transport.

use cms::builder::{
    ContentEncryptionAlgorithm, EnvelopedDataBuilder, KeyEncryptionInfo,
    KeyTransRecipientInfoBuilder,
};
use cms::content_info::ContentInfo;
use cms::enveloped_data::RecipientIdentifier;
use der::asn1::Any;
use der::Encode;
use mailseal_common::{Error, Result};
use rand::rngs::OsRng;
use tracing::debug;

use super::certificate::SmimeCertificate;
use super::oids;

/// Encrypt `content` for every certificate in `recipients`
///
/// Returns a DER `ContentInfo` wrapping the EnvelopedData. Any single
/// recipient's private key can decrypt it.
pub fn envelope(content: &[u8], recipients: &[SmimeCertificate]) -> Result<Vec<u8>> {
    if recipients.is_empty() {
        return Err(Error::NoRecipientKeys);
    }
    let fail = |e: cms::builder::Error| Error::crypto("envelope", e.to_string());

    let keys = recipients
        .iter()
        .map(|cert| cert.rsa_public_key().map_err(|e| Error::crypto("envelope", e)))
        .collect::<Result<Vec<_>>>()?;

    // Each recipient builder borrows its own RNG for the builder's lifetime
    let mut rngs = vec![OsRng; recipients.len()];

    let mut builder =
        EnvelopedDataBuilder::new(None, content, ContentEncryptionAlgorithm::Aes256Cbc, None)
            .map_err(fail)?;
    for ((cert, key), rng) in recipients.iter().zip(keys).zip(rngs.iter_mut()) {
        let recipient = KeyTransRecipientInfoBuilder::new(
            RecipientIdentifier::IssuerAndSerialNumber(cert.issuer_and_serial()),
            KeyEncryptionInfo::Rsa(key),
            rng,
        )
        .map_err(fail)?;
        builder.add_recipient_info(recipient).map_err(fail)?;
    }

    let enveloped = builder.build_with_rng(&mut OsRng).map_err(fail)?;
    let content_info = ContentInfo {
        content_type: oids::ID_ENVELOPED_DATA,
        content: Any::encode_from(&enveloped).map_err(|e| Error::crypto("envelope", e))?,
    };
    let der = content_info
        .to_der()
        .map_err(|e| Error::crypto("envelope", e))?;

    debug!(
        recipients = recipients.len(),
        content_len = content.len(),
        envelope_len = der.len(),
        "Created enveloped data"
    );
    Ok(der)
}
