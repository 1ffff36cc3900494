//! Recipient key resolution
//!
//! Maps canonical recipient addresses to certificates that pass the policy
//! validator. Results are kept in a [`RecipientCache`] shared by every message
//! sent through one pipeline instance, so repeated recipients never trigger a
//! second scan of the certificate source.

use mailseal_common::types::PolicyFlags;
use mailseal_common::Result;
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};
use tracing::debug;

use super::address::CanonicalAddress;
use super::certificate::SmimeCertificate;
use super::policy::CertificateValidator;
use super::source::CertificateSource;

/// Policy bits that affect which certificate is acceptable
fn requirements(policy: PolicyFlags) -> PolicyFlags {
    policy
        & (PolicyFlags::REQUIRE_CERTIFICATE_VERIFICATION
            | PolicyFlags::REQUIRE_KEY_USAGE_DATA_ENCIPHERMENT
            | PolicyFlags::REQUIRE_ENHANCED_KEY_USAGE_SECURE_EMAIL)
}

#[derive(Debug, Clone)]
struct CacheEntry {
    certificate: SmimeCertificate,
    validated_under: PolicyFlags,
}

/// Session-scoped map from recipient to validated certificate
///
/// Entries are never evicted. A cached certificate only satisfies a lookup
/// whose requirements are a subset of those it was validated under.
#[derive(Debug, Default)]
pub struct RecipientCache {
    entries: Mutex<HashMap<CanonicalAddress, CacheEntry>>,
    // Serializes miss paths so two lookups never scan for the same address at once
    scan_lock: Mutex<()>,
}

impl RecipientCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, address: &CanonicalAddress, policy: PolicyFlags) -> Option<SmimeCertificate> {
        let required = requirements(policy);
        let entries = self.entries.lock().unwrap_or_else(|e| e.into_inner());
        entries
            .get(address)
            .filter(|entry| entry.validated_under.contains(required))
            .map(|entry| entry.certificate.clone())
    }

    /// Record a validated certificate
    ///
    /// An existing entry is only replaced when it was validated under weaker
    /// requirements than the new one.
    pub fn insert(&self, address: CanonicalAddress, certificate: SmimeCertificate, policy: PolicyFlags) {
        let required = requirements(policy);
        let mut entries = self.entries.lock().unwrap_or_else(|e| e.into_inner());
        let replace = entries
            .get(&address)
            .map_or(true, |entry| !entry.validated_under.contains(required));
        if replace {
            entries.insert(
                address,
                CacheEntry {
                    certificate,
                    validated_under: required,
                },
            );
        }
    }

    pub fn len(&self) -> usize {
        self.entries.lock().unwrap_or_else(|e| e.into_inner()).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// A recipient bound to its certificate
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedRecipient {
    pub address: CanonicalAddress,
    pub certificate: SmimeCertificate,
    pub from_cache: bool,
}

/// Outcome of resolving a recipient list
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Resolution {
    /// Bound recipients, in recipient order
    pub resolved: Vec<ResolvedRecipient>,
    /// Recipients without an acceptable certificate, in recipient order
    pub unresolved: Vec<CanonicalAddress>,
}

impl Resolution {
    pub fn is_complete(&self) -> bool {
        self.unresolved.is_empty()
    }

    pub fn certificates(&self) -> Vec<SmimeCertificate> {
        self.resolved.iter().map(|r| r.certificate.clone()).collect()
    }

    pub fn get(&self, address: &CanonicalAddress) -> Option<&SmimeCertificate> {
        self.resolved
            .iter()
            .find(|r| &r.address == address)
            .map(|r| &r.certificate)
    }

    pub fn unresolved_strings(&self) -> Vec<String> {
        self.unresolved.iter().map(|a| a.to_string()).collect()
    }
}

/// Resolves recipients through the cache, falling back to one source scan
pub struct RecipientKeyResolver {
    source: Arc<dyn CertificateSource>,
    validator: CertificateValidator,
    cache: Arc<RecipientCache>,
}

impl RecipientKeyResolver {
    pub fn new(
        source: Arc<dyn CertificateSource>,
        validator: CertificateValidator,
        cache: Arc<RecipientCache>,
    ) -> Self {
        Self {
            source,
            validator,
            cache,
        }
    }

    pub fn cache(&self) -> &Arc<RecipientCache> {
        &self.cache
    }

    /// Bind each recipient to a certificate acceptable under `policy`
    ///
    /// Candidates that do not match or fail validation are skipped; the
    /// caller decides whether leftover unresolved recipients are fatal.
    pub fn resolve(&self, recipients: &[CanonicalAddress], policy: PolicyFlags) -> Result<Resolution> {
        let mut seen = HashSet::new();
        let recipients: Vec<&CanonicalAddress> = recipients
            .iter()
            .filter(|a| !a.is_empty() && seen.insert(*a))
            .collect();

        let mut bound: HashMap<CanonicalAddress, (SmimeCertificate, bool)> = HashMap::new();
        let mut pending: HashSet<CanonicalAddress> = HashSet::new();
        for address in &recipients {
            match self.cache.get(address, policy) {
                Some(cert) => {
                    debug!(recipient = %address, "Recipient certificate found in cache");
                    bound.insert((*address).clone(), (cert, true));
                }
                None => {
                    pending.insert((*address).clone());
                }
            }
        }

        if !pending.is_empty() {
            let _scan = self.cache.scan_lock.lock().unwrap_or_else(|e| e.into_inner());

            // Another lookup may have filled these while we waited
            pending.retain(|address| match self.cache.get(address, policy) {
                Some(cert) => {
                    bound.insert(address.clone(), (cert, true));
                    false
                }
                None => true,
            });

            if !pending.is_empty() {
                self.scan(&mut pending, &mut bound, policy)?;
            }
        }

        let mut resolution = Resolution::default();
        for address in recipients {
            match bound.remove(address) {
                Some((certificate, from_cache)) => resolution.resolved.push(ResolvedRecipient {
                    address: address.clone(),
                    certificate,
                    from_cache,
                }),
                None => resolution.unresolved.push(address.clone()),
            }
        }
        Ok(resolution)
    }

    fn scan(
        &self,
        pending: &mut HashSet<CanonicalAddress>,
        bound: &mut HashMap<CanonicalAddress, (SmimeCertificate, bool)>,
        policy: PolicyFlags,
    ) -> Result<()> {
        debug!(
            source = self.source.name(),
            pending = pending.len(),
            "Scanning certificate source"
        );

        for cert in self.source.scan()? {
            let Some(email) = cert.subject_email() else {
                continue;
            };
            if !pending.contains(&email) {
                continue;
            }

            match self.validator.validate(&cert, policy) {
                Ok(()) => {
                    debug!(
                        recipient = %email,
                        fingerprint = cert.fingerprint(),
                        "Recipient certificate accepted"
                    );
                    self.cache.insert(email.clone(), cert.clone(), policy);
                    pending.remove(&email);
                    bound.insert(email, (cert, false));
                    if pending.is_empty() {
                        break;
                    }
                }
                Err(reason) => {
                    debug!(
                        recipient = %email,
                        fingerprint = cert.fingerprint(),
                        reason = %reason,
                        "Recipient certificate rejected"
                    );
                }
            }
        }
        Ok(())
    }
}
