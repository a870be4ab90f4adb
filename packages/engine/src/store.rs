//! On-disk persistence of verified OCSP responses
//!
//! A server restart should not drop staples it already holds, so the
//! fetcher writes each verified response DER beneath the store directory
//! and the engine re-verifies and reloads it when the domain's
//! certificate is installed again.

use std::fs;
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime};

use crate::errors::StaplingError;
use crate::ocsp;
use crate::types::{ManagedCertificate, VerifiedOcspResponse};

#[derive(Debug)]
pub struct ResponseStore {
    dir: PathBuf,
}

impl ResponseStore {
    /// Open (creating if needed) the store directory
    pub fn open(dir: impl Into<PathBuf>) -> Result<Self, StaplingError> {
        let dir = dir.into();
        fs::create_dir_all(&dir)?;
        Ok(Self { dir })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Persist a verified response, temp file + rename so a crash never
    /// leaves a torn file behind
    pub fn save(&self, domain: &str, response: &VerifiedOcspResponse) -> Result<(), StaplingError> {
        let path = self.path_for(domain);
        let tmp = path.with_extension("tmp");
        fs::write(&tmp, &response.der)?;
        fs::rename(&tmp, &path)?;
        tracing::debug!(domain, path = %path.display(), "ocsp response persisted");
        Ok(())
    }

    /// Reload the persisted response for a domain, re-verifying it
    /// against the current certificate. Anything that no longer verifies
    /// (expired, superseded serial, tampered file) is deleted.
    pub fn load(&self, cert: &ManagedCertificate, now: SystemTime) -> Option<VerifiedOcspResponse> {
        let path = self.path_for(&cert.domain);
        let raw = match fs::read(&path) {
            Ok(raw) => raw,
            Err(_) => return None,
        };
        match ocsp::verify_response(&raw, cert, None, now) {
            Ok(response) => {
                tracing::info!(
                    domain = %cert.domain,
                    "reusing persisted ocsp response"
                );
                Some(response)
            }
            Err(e) => {
                tracing::debug!(
                    domain = %cert.domain,
                    error = %e,
                    "discarding persisted ocsp response"
                );
                let _ = fs::remove_file(&path);
                None
            }
        }
    }

    pub fn remove(&self, domain: &str) {
        let _ = fs::remove_file(self.path_for(domain));
    }

    /// Delete persisted responses older than the keep window
    pub fn prune(&self, keep_for: Duration) {
        let now = SystemTime::now();
        let entries = match fs::read_dir(&self.dir) {
            Ok(entries) => entries,
            Err(e) => {
                tracing::warn!(dir = %self.dir.display(), error = %e, "store prune skipped");
                return;
            }
        };
        for entry in entries.flatten() {
            let path = entry.path();
            if path.extension().and_then(|s| s.to_str()) != Some("der") {
                continue;
            }
            let stale = entry
                .metadata()
                .and_then(|m| m.modified())
                .map(|modified| now.duration_since(modified).unwrap_or(Duration::ZERO) > keep_for)
                .unwrap_or(false);
            if stale {
                tracing::debug!(path = %path.display(), "pruning stale persisted ocsp response");
                let _ = fs::remove_file(&path);
            }
        }
    }

    fn path_for(&self, domain: &str) -> PathBuf {
        let safe: String = domain
            .chars()
            .map(|c| {
                if c.is_ascii_alphanumeric() || c == '-' || c == '.' {
                    c
                } else {
                    '_'
                }
            })
            .collect();
        self.dir.join(format!("{safe}.ocsp.der"))
    }
}
