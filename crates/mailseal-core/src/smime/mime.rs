//! MIME helpers shared by the signer, the pipeline and the reader
//!
//! Output is assembled as bytes; incoming entities are parsed with
//! `mail-parser`.

use base64::{engine::general_purpose::STANDARD as BASE64, Engine};
use mail_parser::{ContentType, Message, MessageParser, MessagePart, MimeHeaders, PartType};
use mailseal_common::{Error, Result};
use std::fmt;
use uuid::Uuid;

/// Maximum base64 line length, excluding CRLF
pub const BASE64_LINE_LENGTH: usize = 76;

pub const SIGNED_PREAMBLE: &str = "This is a multi-part S/MIME signed message.";

const SIGNATURE_BOUNDARY_PREFIX: &str = "=_signed_";
const TRIPLE_BOUNDARY_PREFIX: &str = "=_triple_";

/// Boundary tokens for the inner and outer `multipart/signed` passes
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MessageBoundaries {
    pub signature: String,
    pub triple_signature: String,
}

impl MessageBoundaries {
    /// Fresh random boundaries for one message
    pub fn generate() -> Self {
        Self::from_base(&Uuid::new_v4().simple().to_string())
    }

    /// Derive both boundaries from the body-part boundary of the rendered message
    ///
    /// The prefixes differ, so the two tokens can never be equal.
    pub fn from_base(base: &str) -> Self {
        Self {
            signature: format!("{}{}", SIGNATURE_BOUNDARY_PREFIX, base),
            triple_signature: format!("{}{}", TRIPLE_BOUNDARY_PREFIX, base),
        }
    }
}

impl Default for MessageBoundaries {
    fn default() -> Self {
        Self::generate()
    }
}

/// Base64 with CRLF line breaks every 76 characters
pub fn encode_base64_wrapped(data: &[u8]) -> String {
    let encoded = BASE64.encode(data);
    let mut out = String::with_capacity(encoded.len() + encoded.len() / BASE64_LINE_LENGTH * 2);
    for (i, chunk) in encoded.as_bytes().chunks(BASE64_LINE_LENGTH).enumerate() {
        if i > 0 {
            out.push_str("\r\n");
        }
        // base64 output is ASCII
        out.push_str(&String::from_utf8_lossy(chunk));
    }
    out
}

/// Content type of an entity, reduced to what layer detection needs
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MediaType {
    /// Lower-cased `type/subtype`
    pub essence: String,
    params: Vec<(String, String)>,
}

impl MediaType {
    /// Parse a bare `Content-Type` header value
    pub fn parse(value: &str) -> Self {
        let header = format!("Content-Type: {}\r\n\r\n", value);
        let message = MessageParser::default().parse(header.as_bytes());
        Self::of(message.as_ref().and_then(|m| m.content_type()))
    }

    /// Convert a parsed header, defaulting to `text/plain`
    pub(crate) fn of(ct: Option<&ContentType<'_>>) -> Self {
        let Some(ct) = ct else {
            return Self {
                essence: "text/plain".to_string(),
                params: Vec::new(),
            };
        };
        let essence = match ct.subtype() {
            Some(subtype) => format!("{}/{}", ct.ctype(), subtype),
            None => ct.ctype().to_string(),
        };
        let params = ct
            .attributes()
            .unwrap_or_default()
            .iter()
            .map(|(key, value)| (key.to_ascii_lowercase(), value.to_string()))
            .collect();
        Self {
            essence: essence.to_ascii_lowercase(),
            params,
        }
    }

    pub fn param(&self, name: &str) -> Option<&str> {
        self.params
            .iter()
            .find(|(key, _)| key.eq_ignore_ascii_case(name))
            .map(|(_, value)| value.as_str())
    }

    pub fn boundary(&self) -> Option<&str> {
        self.param("boundary")
    }

    pub fn is_multipart_signed(&self) -> bool {
        self.essence == "multipart/signed"
    }

    pub fn is_signature(&self) -> bool {
        self.essence.ends_with("pkcs7-signature")
    }

    pub fn is_enveloped(&self) -> bool {
        matches!(
            self.essence.as_str(),
            "application/pkcs7-mime" | "application/x-pkcs7-mime"
        ) && self
            .param("smime-type")
            .map_or(true, |t| t.eq_ignore_ascii_case("enveloped-data"))
    }
}

impl fmt::Display for MediaType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.essence)?;
        for (key, value) in &self.params {
            write!(f, "; {}=\"{}\"", key, value)?;
        }
        Ok(())
    }
}

/// A MIME entity parsed in place
///
/// Offsets reported by the parser index into the original bytes, so raw
/// bodies and parts can be sliced out without re-encoding.
#[derive(Debug)]
pub struct Entity<'a> {
    raw: &'a [u8],
    message: Message<'a>,
}

impl<'a> Entity<'a> {
    pub fn parse(raw: &'a [u8]) -> Result<Self> {
        let message = MessageParser::default()
            .parse(raw)
            .ok_or_else(|| Error::Mime("Unparseable MIME entity".to_string()))?;
        Ok(Self { raw, message })
    }

    /// Whether the entity declares its own Content-Type
    pub fn has_content_type(&self) -> bool {
        self.message.content_type().is_some()
    }

    pub fn content_type(&self) -> MediaType {
        MediaType::of(self.message.content_type())
    }

    pub fn is_base64(&self) -> bool {
        self.message
            .content_transfer_encoding()
            .map_or(false, |cte| cte.eq_ignore_ascii_case("base64"))
    }

    /// Body bytes exactly as they appear after the header block
    pub fn body(&self) -> &'a [u8] {
        self.slice(self.root().raw_body_offset(), self.root().raw_end_offset())
    }

    /// Body with any transfer encoding removed
    pub fn decoded_body(&self) -> Vec<u8> {
        let encoded = self
            .message
            .content_transfer_encoding()
            .map_or(false, |cte| {
                cte.eq_ignore_ascii_case("base64") || cte.eq_ignore_ascii_case("quoted-printable")
            });
        if encoded {
            self.root().contents().to_vec()
        } else {
            self.body().to_vec()
        }
    }

    /// Child parts of a multipart entity, in order
    ///
    /// `raw_header_offset` of each part indexes into the parsed bytes.
    pub fn parts(&self) -> Vec<&MessagePart<'a>> {
        match &self.root().body {
            PartType::Multipart(ids) => ids
                .iter()
                .filter_map(|id| self.message.parts.get(*id))
                .collect(),
            _ => Vec::new(),
        }
    }

    fn root(&self) -> &MessagePart<'a> {
        self.message.root_part()
    }

    fn slice(&self, start: usize, end: usize) -> &'a [u8] {
        self.raw.get(start..end.min(self.raw.len())).unwrap_or_default()
    }
}

pub(crate) fn find(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    if needle.is_empty() || haystack.len() < needle.len() {
        return None;
    }
    haystack.windows(needle.len()).position(|w| w == needle)
}
