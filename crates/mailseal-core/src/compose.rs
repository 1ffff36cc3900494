//! Final message assembly
//!
//! Combines top-level headers with a [`ProtectedBody`] into the payload handed
//! to the SMTP transport. Only the protected representation is emitted; Bcc
//! recipients appear in the envelope, never in the headers.

use base64::{engine::general_purpose::STANDARD as BASE64, Engine};
use chrono::{DateTime, Utc};
use mailseal_common::types::{EmailAddress, TransferEncoding};
use std::collections::HashSet;
use uuid::Uuid;

use crate::smime::mime::encode_base64_wrapped;
use crate::smime::ProtectedBody;

/// Top-level headers of an outbound message
#[derive(Debug, Clone)]
pub struct ComposedMessage {
    from: String,
    to: Vec<String>,
    cc: Vec<String>,
    bcc: Vec<String>,
    subject: Option<String>,
    date: DateTime<Utc>,
    message_id: String,
}

impl ComposedMessage {
    pub fn new(from: impl Into<String>) -> Self {
        let from = from.into();
        let domain = EmailAddress::parse(&from)
            .map(|a| a.domain)
            .unwrap_or_else(|| "localhost".to_string());
        Self {
            message_id: format!("<{}@{}>", Uuid::new_v4(), domain),
            from,
            to: Vec::new(),
            cc: Vec::new(),
            bcc: Vec::new(),
            subject: None,
            date: Utc::now(),
        }
    }

    pub fn to(mut self, addresses: impl IntoIterator<Item = impl Into<String>>) -> Self {
        self.to.extend(addresses.into_iter().map(Into::into));
        self
    }

    pub fn cc(mut self, addresses: impl IntoIterator<Item = impl Into<String>>) -> Self {
        self.cc.extend(addresses.into_iter().map(Into::into));
        self
    }

    pub fn bcc(mut self, addresses: impl IntoIterator<Item = impl Into<String>>) -> Self {
        self.bcc.extend(addresses.into_iter().map(Into::into));
        self
    }

    pub fn subject(mut self, subject: impl Into<String>) -> Self {
        self.subject = Some(subject.into());
        self
    }

    pub fn date(mut self, date: DateTime<Utc>) -> Self {
        self.date = date;
        self
    }

    pub fn message_id(&self) -> &str {
        &self.message_id
    }

    pub fn from_address(&self) -> Option<EmailAddress> {
        EmailAddress::parse(&self.from)
    }

    /// Every To, Cc and Bcc address, bare and de-duplicated
    pub fn envelope_recipients(&self) -> Vec<EmailAddress> {
        let mut seen = HashSet::new();
        self.to
            .iter()
            .chain(&self.cc)
            .chain(&self.bcc)
            .filter_map(|a| EmailAddress::parse(a))
            .filter(|a| seen.insert(a.to_string().to_lowercase()))
            .collect()
    }

    /// Render headers and the protected body as the DATA payload
    pub fn render(&self, body: &ProtectedBody) -> Vec<u8> {
        let mut message = String::new();

        message.push_str(&format!("From: {}\r\n", self.from));
        if !self.to.is_empty() {
            message.push_str(&format!("To: {}\r\n", self.to.join(", ")));
        }
        if !self.cc.is_empty() {
            message.push_str(&format!("Cc: {}\r\n", self.cc.join(", ")));
        }
        if let Some(ref subject) = self.subject {
            message.push_str(&format!("Subject: {}\r\n", encode_header_value(subject)));
        }
        message.push_str(&format!("Date: {}\r\n", self.date.to_rfc2822()));
        message.push_str(&format!("Message-ID: {}\r\n", self.message_id));
        message.push_str("MIME-Version: 1.0\r\n");
        message.push_str(&format!("Content-Type: {}\r\n", body.content_type));
        message.push_str(&format!(
            "Content-Transfer-Encoding: {}\r\n\r\n",
            body.transfer_encoding
        ));

        let mut out = message.into_bytes();
        match body.transfer_encoding {
            TransferEncoding::Base64 => {
                out.extend_from_slice(encode_base64_wrapped(&body.bytes).as_bytes());
                out.extend_from_slice(b"\r\n");
            }
            TransferEncoding::SevenBit => out.extend_from_slice(&body.bytes),
        }
        out
    }
}

/// RFC 2047 encoded-word for non-ASCII header text
fn encode_header_value(value: &str) -> String {
    if value.is_ascii() {
        value.to_string()
    } else {
        format!("=?UTF-8?B?{}?=", BASE64.encode(value.as_bytes()))
    }
}
