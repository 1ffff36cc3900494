//! Recipient address canonicalization
//!
//! Recipients are matched against certificate subjects by a canonical form:
//! the bare address with any display name removed, upper-cased. Subject
//! strings taken from certificates additionally lose an `E=` attribute
//! prefix and trailing distinguished-name components.

use std::collections::HashSet;
use std::fmt;

/// Attribute prefixes that may precede an address in a subject string
const SUBJECT_EMAIL_PREFIXES: [&str; 3] = ["E", "EMAIL", "EMAILADDRESS"];

/// A recipient address in canonical form
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct CanonicalAddress(String);

impl CanonicalAddress {
    /// Canonicalize a raw recipient address or display form
    pub fn new(raw: &str) -> Self {
        Self(canonicalize(raw))
    }

    /// Canonicalize an address taken from a certificate subject
    pub fn from_subject(raw: &str) -> Self {
        Self(canonicalize_subject(raw))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl fmt::Display for CanonicalAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for CanonicalAddress {
    fn from(raw: &str) -> Self {
        Self::new(raw)
    }
}

/// Reduce a recipient address to its canonical string form
///
/// Only a display name is removed; attribute syntax such as `email=` is part
/// of the address as written and never matches a certificate subject.
pub fn canonicalize(raw: &str) -> String {
    finish(bare_address(raw.trim()))
}

/// Reduce a certificate subject string to its canonical address
pub fn canonicalize_subject(raw: &str) -> String {
    let mut s = bare_address(raw.trim());

    // E=user@example.com, CN=User, O=Org
    if let Some(comma) = find_unquoted(s, ',') {
        s = &s[..comma];
    }

    if let Some((key, value)) = s.split_once('=') {
        let key = key.trim().to_ascii_uppercase();
        if SUBJECT_EMAIL_PREFIXES.contains(&key.as_str()) {
            s = value;
        }
    }

    finish(s)
}

fn finish(s: &str) -> String {
    s.trim().trim_matches('"').trim().to_uppercase()
}

/// Strip a display name, bracketed or quoted
fn bare_address(s: &str) -> &str {
    // "Display Name" <user@example.com>
    if let (Some(start), Some(end)) = (s.rfind('<'), s.rfind('>')) {
        if start < end {
            return &s[start + 1..end];
        }
    }

    // "Display Name" user@example.com
    if let Some(rest) = s.strip_prefix('"') {
        if let Some(close) = rest.find('"') {
            let tail = rest[close + 1..].trim();
            if !tail.is_empty() {
                return tail;
            }
        }
    }

    s
}

/// Byte offset of the first `needle` outside a double-quoted run
fn find_unquoted(s: &str, needle: char) -> Option<usize> {
    let mut quoted = false;
    for (i, c) in s.char_indices() {
        match c {
            '"' => quoted = !quoted,
            c if c == needle && !quoted => return Some(i),
            _ => {}
        }
    }
    None
}

/// Merge To, Cc and Bcc lists into one ordered, de-duplicated recipient list
pub fn merge_recipients<'a, I>(lists: I) -> Vec<CanonicalAddress>
where
    I: IntoIterator<Item = &'a str>,
{
    let mut seen = HashSet::new();
    lists
        .into_iter()
        .map(CanonicalAddress::new)
        .filter(|addr| !addr.is_empty())
        .filter(|addr| seen.insert(addr.clone()))
        .collect()
}
