//! Verification and decryption of S/MIME bodies
//!
//! Inverts every layer the protection pipeline can produce: detached
//! `multipart/signed` signatures and `application/pkcs7-mime` envelopes,
//! nested in any order.

use aes::{Aes128, Aes192, Aes256};
use cbc::cipher::block_padding::Pkcs7;
use cbc::cipher::{BlockCipher, BlockDecryptMut, KeyInit, KeyIvInit};
use chrono::{DateTime, Utc};
use cms::cert::CertificateChoices;
use cms::content_info::ContentInfo;
use cms::enveloped_data::{EnvelopedData, RecipientIdentifier, RecipientInfo};
use cms::signed_data::{SignedData, SignerIdentifier};
use der::{Decode, Encode};
use mail_parser::MimeHeaders;
use mailseal_common::{Error, Result};
use rsa::pkcs1v15::{Signature, VerifyingKey};
use rsa::signature::Verifier;
use rsa::{Pkcs1v15Encrypt, RsaPrivateKey};
use sha2::{Digest, Sha256};
use tracing::debug;
use x509_cert::time::Time;

use super::certificate::SmimeCertificate;
use super::mime::{find, Entity, MediaType};
use super::oids;
use super::signer::SigningIdentity;

/// Deepest nesting of protection layers accepted by [`open`]
const MAX_LAYERS: usize = 8;

/// Result of verifying a detached signature
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SignatureInfo {
    pub signer: SmimeCertificate,
    /// Certificates embedded in the SignedData
    pub certificates: usize,
    pub signing_time: Option<DateTime<Utc>>,
}

/// One protection layer removed by [`open`], outermost first
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Layer {
    Signed(SignatureInfo),
    Enveloped { recipient: SmimeCertificate },
}

/// Innermost content plus the layers that wrapped it
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OpenedMessage {
    pub content: Vec<u8>,
    pub layers: Vec<Layer>,
}

fn mime_err(msg: &str) -> Error {
    Error::Mime(msg.to_string())
}

fn verify_err(msg: impl Into<String>) -> Error {
    Error::Verification(msg.into())
}

/// Position of a `--boundary` delimiter line, searching from `from`
///
/// The delimiter must start a line and be followed by `--`, whitespace or
/// the end of the line, so a boundary never matches a longer one.
fn find_delimiter(body: &[u8], boundary: &str, from: usize) -> Option<usize> {
    let delimiter = format!("--{}", boundary);
    let mut offset = from;
    while offset < body.len() {
        let pos = offset + find(&body[offset..], delimiter.as_bytes())?;
        let line_start = pos == 0 || body[pos - 1] == b'\n';
        let rest = &body[pos + delimiter.len()..];
        let terminated = rest.is_empty()
            || rest.starts_with(b"--")
            || rest[0].is_ascii_whitespace();
        if line_start && terminated {
            return Some(pos);
        }
        offset = pos + 1;
    }
    None
}

/// Strip the line break that belongs to the following delimiter
fn trim_delimiter_break(part: &[u8]) -> &[u8] {
    part.strip_suffix(b"\r\n")
        .or_else(|| part.strip_suffix(b"\n"))
        .unwrap_or(part)
}

/// Split a `multipart/signed` body into the signed bytes and the signature DER
///
/// The parts are located by the MIME parser. The signed part runs from its
/// first header byte to the line break before the next delimiter, unchanged.
pub fn split_signed(body: &[u8], boundary: &str) -> Result<(Vec<u8>, Vec<u8>)> {
    let mut entity = format!(
        "Content-Type: multipart/signed; boundary=\"{}\"\r\n\r\n",
        boundary
    )
    .into_bytes();
    entity.extend_from_slice(body);

    let parsed = Entity::parse(&entity)?;
    let parts = parsed.parts();
    let (content, signature) = match parts.as_slice() {
        [content, signature, ..] => (*content, *signature),
        _ => return Err(mime_err("multipart/signed needs content and signature parts")),
    };

    let start = content.raw_header_offset();
    let end = find_delimiter(&entity, boundary, start)
        .ok_or_else(|| mime_err("Signature part boundary not found"))?;
    let signed = trim_delimiter_break(&entity[start..end]);

    let signature_type = MediaType::of(signature.content_type());
    if !signature_type.is_signature() {
        return Err(Error::Mime(format!(
            "Unexpected signature part type {}",
            signature_type.essence
        )));
    }
    Ok((signed.to_vec(), signature.contents().to_vec()))
}

/// Verify a detached CMS signature over `content`
pub fn verify_detached(content: &[u8], signature_der: &[u8]) -> Result<SignatureInfo> {
    let info = ContentInfo::from_der(signature_der)
        .map_err(|e| verify_err(format!("Malformed signature: {}", e)))?;
    if info.content_type != oids::ID_SIGNED_DATA {
        return Err(verify_err("Signature is not SignedData"));
    }
    let inner = info
        .content
        .to_der()
        .map_err(|e| verify_err(format!("Malformed signature: {}", e)))?;
    let signed = SignedData::from_der(&inner)
        .map_err(|e| verify_err(format!("Malformed SignedData: {}", e)))?;

    let certificates: Vec<SmimeCertificate> = signed
        .certificates
        .iter()
        .flat_map(|set| set.0.iter())
        .filter_map(|choice| match choice {
            CertificateChoices::Certificate(cert) => {
                SmimeCertificate::from_certificate(cert.clone()).ok()
            }
            _ => None,
        })
        .collect();

    let signer_info = signed
        .signer_infos
        .0
        .iter()
        .next()
        .ok_or_else(|| verify_err("SignedData has no signer"))?;
    let signer = match &signer_info.sid {
        SignerIdentifier::IssuerAndSerialNumber(id) => certificates.iter().find(|c| c.matches(id)),
        _ => None,
    }
    .cloned()
    .ok_or_else(|| verify_err("Signer certificate not embedded"))?;

    if signer_info.digest_alg.oid != oids::ID_SHA_256 {
        return Err(verify_err(format!(
            "Unsupported digest algorithm {}",
            signer_info.digest_alg.oid
        )));
    }

    let mut signing_time = None;
    let signed_bytes = match &signer_info.signed_attrs {
        Some(attrs) => {
            let digest = Sha256::digest(content);
            let mut digest_matched = false;
            for attr in attrs.iter() {
                let Some(value) = attr.values.iter().next() else {
                    continue;
                };
                if attr.oid == oids::ID_MESSAGE_DIGEST {
                    digest_matched = value.value() == digest.as_slice();
                } else if attr.oid == oids::ID_SIGNING_TIME {
                    signing_time = value
                        .to_der()
                        .ok()
                        .and_then(|der| Time::from_der(&der).ok())
                        .and_then(|t| {
                            DateTime::<Utc>::from_timestamp(t.to_unix_duration().as_secs() as i64, 0)
                        });
                }
            }
            if !digest_matched {
                return Err(verify_err("Message digest does not match content"));
            }
            attrs
                .to_der()
                .map_err(|e| verify_err(format!("Malformed signed attributes: {}", e)))?
        }
        None => content.to_vec(),
    };

    let signature = Signature::try_from(signer_info.signature.as_bytes())
        .map_err(|e| verify_err(format!("Malformed signature value: {}", e)))?;
    VerifyingKey::<Sha256>::new(signer.rsa_public_key()?)
        .verify(&signed_bytes, &signature)
        .map_err(|_| verify_err("Signature does not verify"))?;

    debug!(signer = %signer.subject(), "Signature verified");
    Ok(SignatureInfo {
        signer,
        certificates: certificates.len(),
        signing_time,
    })
}

fn decrypt_cbc<C>(key: &[u8], iv: &[u8], data: &[u8]) -> Result<Vec<u8>>
where
    C: BlockDecryptMut + BlockCipher + KeyInit,
{
    cbc::Decryptor::<C>::new_from_slices(key, iv)
        .map_err(|_| verify_err("Invalid content key or IV length"))?
        .decrypt_padded_vec_mut::<Pkcs7>(data)
        .map_err(|_| verify_err("Content decryption failed"))
}

/// Decrypt a DER `ContentInfo` holding EnvelopedData addressed to `certificate`
pub fn decrypt_envelope(
    envelope_der: &[u8],
    certificate: &SmimeCertificate,
    key: &RsaPrivateKey,
) -> Result<Vec<u8>> {
    let info = ContentInfo::from_der(envelope_der)
        .map_err(|e| verify_err(format!("Malformed envelope: {}", e)))?;
    if info.content_type != oids::ID_ENVELOPED_DATA {
        return Err(verify_err("Content is not EnvelopedData"));
    }
    let inner = info
        .content
        .to_der()
        .map_err(|e| verify_err(format!("Malformed envelope: {}", e)))?;
    let enveloped = EnvelopedData::from_der(&inner)
        .map_err(|e| verify_err(format!("Malformed EnvelopedData: {}", e)))?;

    let wrapped_key = enveloped
        .recip_infos
        .0
        .iter()
        .find_map(|ri| match ri {
            RecipientInfo::Ktri(ktri) => match &ktri.rid {
                RecipientIdentifier::IssuerAndSerialNumber(id) if certificate.matches(id) => {
                    Some(ktri.enc_key.as_bytes())
                }
                _ => None,
            },
            _ => None,
        })
        .ok_or_else(|| verify_err("Envelope is not addressed to this certificate"))?;

    let cek = key
        .decrypt(Pkcs1v15Encrypt, wrapped_key)
        .map_err(|_| verify_err("Failed to unwrap content key"))?;

    let eci = &enveloped.encrypted_content;
    let iv = eci
        .content_enc_alg
        .parameters
        .as_ref()
        .map(|p| p.value())
        .ok_or_else(|| verify_err("Missing content encryption IV"))?;
    let ciphertext = eci
        .encrypted_content
        .as_ref()
        .map(|c| c.as_bytes())
        .ok_or_else(|| verify_err("Envelope carries no encrypted content"))?;

    let algorithm = eci.content_enc_alg.oid;
    if algorithm == oids::AES_256_CBC {
        decrypt_cbc::<Aes256>(&cek, iv, ciphertext)
    } else if algorithm == oids::AES_192_CBC {
        decrypt_cbc::<Aes192>(&cek, iv, ciphertext)
    } else if algorithm == oids::AES_128_CBC {
        decrypt_cbc::<Aes128>(&cek, iv, ciphertext)
    } else {
        Err(verify_err(format!(
            "Unsupported content encryption algorithm {}",
            algorithm
        )))
    }
}

/// Parse `data` as a nested protection layer if it is one
fn as_layer(data: &[u8]) -> Option<(MediaType, Vec<u8>)> {
    let entity = Entity::parse(data).ok()?;
    let ct = entity.content_type();
    if !(ct.is_multipart_signed() || ct.is_enveloped()) {
        return None;
    }
    Some((ct, entity.decoded_body()))
}

/// Remove every protection layer from a body
///
/// `body` is the transfer-decoded body and `content_type` its Content-Type
/// value. `identities` are tried in order against each envelope.
pub fn open(
    body: &[u8],
    content_type: &str,
    identities: &[SigningIdentity],
) -> Result<OpenedMessage> {
    let mut ct = MediaType::parse(content_type);
    let mut data = body.to_vec();
    let mut layers = Vec::new();

    for _ in 0..MAX_LAYERS {
        let inner = if ct.is_multipart_signed() {
            let boundary = ct
                .boundary()
                .ok_or_else(|| mime_err("multipart/signed without boundary"))?;
            let (signed, signature) = split_signed(&data, boundary)?;
            layers.push(Layer::Signed(verify_detached(&signed, &signature)?));
            signed
        } else if ct.is_enveloped() {
            let (plain, recipient) = identities
                .iter()
                .find_map(|identity| {
                    identity
                        .decrypt(&data)
                        .ok()
                        .map(|plain| (plain, identity.certificate().clone()))
                })
                .ok_or_else(|| verify_err("No key can decrypt the envelope"))?;
            layers.push(Layer::Enveloped { recipient });
            plain
        } else {
            return Ok(OpenedMessage {
                content: data,
                layers,
            });
        };

        match as_layer(&inner) {
            Some((next_ct, next_body)) => {
                ct = next_ct;
                data = next_body;
            }
            None => {
                return Ok(OpenedMessage {
                    content: inner,
                    layers,
                })
            }
        }
    }

    Err(mime_err("Too many nested protection layers"))
}

/// Open a complete message, headers included
pub fn open_message(message: &[u8], identities: &[SigningIdentity]) -> Result<OpenedMessage> {
    let entity = Entity::parse(message)?;
    open(
        &entity.decoded_body(),
        &entity.content_type().to_string(),
        identities,
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::smime::envelope::envelope;
    use crate::smime::fixtures::{self, CertProfile};
    use crate::smime::signer::sign;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_split_signed_rejects_missing_boundary() {
        let err = split_signed(b"no parts here", "b").unwrap_err();
        assert_eq!(err.code(), "MIME_ERROR");
    }

    #[test]
    fn test_tampered_content_fails() {
        let identity = fixtures::identity("sender@x.com");
        let out = sign(b"original text", Some(&identity), true, false, "b").unwrap();
        let (_, signature) = split_signed(&out, "b").unwrap();
        let err = verify_detached(b"altered text", &signature).unwrap_err();
        assert_eq!(err.code(), "VERIFICATION_ERROR");
    }

    #[test]
    fn test_delimiter_must_start_line() {
        let body = b"x--b\r\n--b\r\npart\r\n--b--\r\n";
        assert_eq!(find_delimiter(body, "b", 0), Some(6));
    }

    #[test]
    fn test_delimiter_ignores_longer_boundary() {
        let body = b"--bx\r\ninner\r\n--b \r\npart\r\n--b--";
        assert_eq!(find_delimiter(body, "b", 0), Some(13));
        assert_eq!(find_delimiter(body, "b", 14), Some(25));
        assert_eq!(find_delimiter(b"--bx--\r\n", "b", 0), None);
        assert_eq!(find_delimiter(b"--b", "b", 0), Some(0));
    }

    #[test]
    fn test_split_signed_skips_nested_longer_boundary() {
        let identity = fixtures::identity("sender@x.com");
        let content =
            b"Content-Type: multipart/mixed; boundary=\"bx\"\r\n\r\n--bx\r\nContent-Type: text/plain\r\n\r\nhi\r\n--bx--\r\n";
        let out = sign(content, Some(&identity), false, false, "b").unwrap();
        let (signed, signature) = split_signed(&out, "b").unwrap();
        assert_eq!(signed, content);
        verify_detached(&signed, &signature).unwrap();
    }

    #[test]
    fn test_open_message_reads_headers() {
        let identity = fixtures::identity("sender@x.com");
        let body = sign(b"Content-Type: text/plain\r\n\r\nhello\r\n", Some(&identity), true, false, "b")
            .unwrap();
        let mut message = b"Subject: test\r\nContent-Type: multipart/signed;\r\n protocol=\"application/x-pkcs7-signature\"; micalg=sha-256; boundary=\"b\"\r\n\r\n".to_vec();
        message.extend_from_slice(&body);

        let opened = open_message(&message, &[]).unwrap();
        assert_eq!(opened.content, b"Content-Type: text/plain\r\n\r\nhello\r\n");
        assert!(matches!(opened.layers.as_slice(), [Layer::Signed(info)] if info.signing_time.is_some()));
    }

    #[test]
    fn test_open_plain_passthrough() {
        let opened = open(b"hello", "text/plain", &[]).unwrap();
        assert_eq!(opened.content, b"hello");
        assert!(opened.layers.is_empty());
    }

    #[test]
    fn test_open_enveloped_without_key() {
        let a = fixtures::leaf(CertProfile::recipient("a@x.com"));
        let der = envelope(b"secret", &[a]).unwrap();
        let err = open(&der, "application/pkcs7-mime; smime-type=enveloped-data", &[]).unwrap_err();
        assert_eq!(err.code(), "VERIFICATION_ERROR");
    }
}
