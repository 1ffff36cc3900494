//! Certificate sources consulted during recipient resolution

use mailseal_common::{Error, Result};
use std::fs::File;
use std::io::BufReader;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use tracing::{debug, warn};

use super::certificate::SmimeCertificate;

/// Enumerates candidate recipient certificates
///
/// Implementations decide their own trust scope and enumeration order; the
/// resolver binds the first acceptable certificate it sees per address.
pub trait CertificateSource: Send + Sync {
    /// Start a scan over every candidate certificate
    fn scan(&self) -> Result<Box<dyn Iterator<Item = SmimeCertificate> + '_>>;

    /// Short name used in logs
    fn name(&self) -> &str {
        "certificate-source"
    }
}

/// Explicitly supplied set of certificates
#[derive(Debug, Default)]
pub struct InMemoryCertificateSource {
    certs: Vec<SmimeCertificate>,
    scans: AtomicUsize,
}

impl InMemoryCertificateSource {
    pub fn new(certs: Vec<SmimeCertificate>) -> Self {
        Self {
            certs,
            scans: AtomicUsize::new(0),
        }
    }

    /// Number of scans started so far
    pub fn scan_count(&self) -> usize {
        self.scans.load(Ordering::SeqCst)
    }
}

impl CertificateSource for InMemoryCertificateSource {
    fn scan(&self) -> Result<Box<dyn Iterator<Item = SmimeCertificate> + '_>> {
        self.scans.fetch_add(1, Ordering::SeqCst);
        Ok(Box::new(self.certs.iter().cloned()))
    }

    fn name(&self) -> &str {
        "in-memory"
    }
}

/// PEM certificates stored in one or more directories
///
/// Files are read lazily during a scan, in sorted path order, so a scan that
/// stops early never touches the remaining files.
#[derive(Debug, Clone)]
pub struct PemDirectorySource {
    dirs: Vec<PathBuf>,
}

impl PemDirectorySource {
    pub fn new(dirs: Vec<PathBuf>) -> Self {
        Self { dirs }
    }

    fn list_files(&self) -> Result<Vec<PathBuf>> {
        let mut files = Vec::new();
        for dir in &self.dirs {
            let entries = std::fs::read_dir(dir).map_err(|e| {
                Error::Certificate(format!("Failed to read {}: {}", dir.display(), e))
            })?;
            for entry in entries {
                let path = entry?.path();
                if path.is_file() && is_certificate_file(&path) {
                    files.push(path);
                }
            }
        }
        files.sort();
        Ok(files)
    }
}

fn is_certificate_file(path: &Path) -> bool {
    matches!(
        path.extension().and_then(|e| e.to_str()),
        Some("pem") | Some("crt")
    )
}

fn read_pem_file(path: &Path) -> Vec<SmimeCertificate> {
    let parsed = File::open(path)
        .map_err(Error::from)
        .and_then(|file| SmimeCertificate::from_pem(&mut BufReader::new(file)));
    match parsed {
        Ok(certs) => {
            debug!(path = %path.display(), count = certs.len(), "Loaded certificate file");
            certs
        }
        Err(e) => {
            warn!(path = %path.display(), error = %e, "Skipping unreadable certificate file");
            Vec::new()
        }
    }
}

impl CertificateSource for PemDirectorySource {
    fn scan(&self) -> Result<Box<dyn Iterator<Item = SmimeCertificate> + '_>> {
        let files = self.list_files()?;
        Ok(Box::new(
            files.into_iter().flat_map(|path| read_pem_file(&path)),
        ))
    }

    fn name(&self) -> &str {
        "pem-directory"
    }
}
