//! Common types for MailSeal

use bitflags::bitflags;
use serde::{Deserialize, Serialize};

/// Email address
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct EmailAddress {
    pub local: String,
    pub domain: String,
}

impl EmailAddress {
    /// Create a new email address
    pub fn new(local: impl Into<String>, domain: impl Into<String>) -> Self {
        Self {
            local: local.into(),
            domain: domain.into(),
        }
    }

    /// Parse an email address from a string
    ///
    /// Accepts a bare address or a display form such as `"Jane" <jane@example.com>`.
    pub fn parse(s: &str) -> Option<Self> {
        let s = s.trim();
        let addr = match (s.rfind('<'), s.rfind('>')) {
            (Some(start), Some(end)) if start < end => &s[start + 1..end],
            _ => s,
        };
        let parts: Vec<&str> = addr.trim().rsplitn(2, '@').collect();
        if parts.len() == 2 && !parts[0].is_empty() && !parts[1].is_empty() {
            Some(Self::new(parts[1], parts[0]))
        } else {
            None
        }
    }
}

impl std::fmt::Display for EmailAddress {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}@{}", self.local, self.domain)
    }
}

impl std::str::FromStr for EmailAddress {
    type Err = crate::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s).ok_or_else(|| crate::Error::Config(format!("Invalid email address: {}", s)))
    }
}

bitflags! {
    /// Protections requested for an outbound message
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct ProtectionFlags: u8 {
        const SIGNED = 0b001;
        const ENVELOPE_ENCRYPTED = 0b010;
        const TRIPLE_WRAPPED = 0b100;
    }
}

bitflags! {
    /// Certificate policy options applied to recipient certificates
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct PolicyFlags: u8 {
        const REQUIRE_CERTIFICATE_VERIFICATION = 0b0001;
        const REQUIRE_KEY_USAGE_DATA_ENCIPHERMENT = 0b0010;
        const REQUIRE_ENHANCED_KEY_USAGE_SECURE_EMAIL = 0b0100;
        const SIGN_TIME = 0b1000;
    }
}

/// How strictly requested protections are enforced
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SettingsMode {
    /// Fail the send when a requested protection cannot be applied
    #[default]
    RequireExact,
    /// Drop protections that cannot be applied and send with the rest
    BestEffort,
}

/// Content-Transfer-Encoding of the outer body handed to the transport
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TransferEncoding {
    SevenBit,
    Base64,
}

impl TransferEncoding {
    /// Header value for Content-Transfer-Encoding
    pub fn as_header_value(&self) -> &'static str {
        match self {
            TransferEncoding::SevenBit => "7bit",
            TransferEncoding::Base64 => "base64",
        }
    }
}

impl std::fmt::Display for TransferEncoding {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_header_value())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_email_address_parse() {
        let email = EmailAddress::parse("user@example.com").unwrap();
        assert_eq!(email.local, "user");
        assert_eq!(email.domain, "example.com");
        assert_eq!(email.to_string(), "user@example.com");
    }

    #[test]
    fn test_email_address_display_form() {
        let email = EmailAddress::parse("\"Jane Doe\" <Jane@Example.com>").unwrap();
        assert_eq!(email.to_string(), "Jane@Example.com");
    }

    #[test]
    fn test_email_address_invalid() {
        assert!(EmailAddress::parse("invalid").is_none());
        assert!(EmailAddress::parse("@example.com").is_none());
        assert!(EmailAddress::parse("user@").is_none());
    }

    #[test]
    fn test_transfer_encoding_header_value() {
        assert_eq!(TransferEncoding::SevenBit.to_string(), "7bit");
        assert_eq!(TransferEncoding::Base64.as_header_value(), "base64");
    }
}
