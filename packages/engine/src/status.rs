//! Read-only status projection for monitoring and diagnostics
//!
//! Snapshots are recomputed on demand from policy + cache and are never a
//! source of truth. The JSON shape (`"stapling"`, `"ocsp": {"status",
//! "valid", …}`) is the externally observed contract of the status page.

use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use serde::Serialize;

use crate::cache::{CacheEntry, OcspResponseCache};
use crate::engine::CertRegistry;
use crate::errors::FailureKind;
use crate::policy::StaplingPolicy;
use crate::types::{ManagedCertificate, OcspCertStatus};

/// Externally visible OCSP status for a domain
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum OcspObservedStatus {
    Good,
    Revoked,
    Unknown,
    VerifyFailed,
    NoResponseSent,
}

/// Per-domain stapling lifecycle state, derived rather than stored
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum StaplingState {
    /// Effective mode is off
    Disabled,
    /// Mode is on, waiting for a usable response
    Pending,
    /// A verified response is being stapled
    Active,
    /// Mode is on but fetches keep failing verification; nothing is
    /// stapled and the error is recorded
    Degraded,
}

/// OCSP detail block of a snapshot
#[derive(Debug, Clone, Serialize)]
pub struct OcspStatusView {
    pub status: OcspObservedStatus,
    pub valid: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub produced_at: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub next_update: Option<u64>,
}

/// Read-only projection of one domain's stapling state
#[derive(Debug, Clone, Serialize)]
pub struct StatusSnapshot {
    pub domain: String,
    /// True iff a response is currently eligible for stapling; a domain
    /// with mode on but no usable response yet reports false
    pub stapling: bool,
    pub state: StaplingState,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ocsp: Option<OcspStatusView>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub next_refresh: Option<u64>,
}

/// Produces snapshots; pure reads, safe to poll frequently
#[derive(Clone)]
pub struct StatusReporter {
    policy: Arc<StaplingPolicy>,
    cache: Arc<OcspResponseCache>,
    certs: Arc<CertRegistry>,
    default_validity: Duration,
}

impl StatusReporter {
    pub(crate) fn new(
        policy: Arc<StaplingPolicy>,
        cache: Arc<OcspResponseCache>,
        certs: Arc<CertRegistry>,
        default_validity: Duration,
    ) -> Self {
        Self {
            policy,
            cache,
            certs,
            default_validity,
        }
    }

    /// Snapshot for one managed domain; `None` when the domain has no
    /// installed certificate
    pub fn snapshot(&self, domain: &str) -> Option<StatusSnapshot> {
        let domain = domain.to_ascii_lowercase();
        let cert = self.registered(&domain)?;
        let entry = self.cache.get(&domain);
        Some(self.build(&domain, &cert, entry.as_ref()))
    }

    /// Snapshots for every managed domain, sorted by name
    pub fn snapshot_all(&self) -> Vec<StatusSnapshot> {
        let mut domains: Vec<(String, Arc<ManagedCertificate>)> = {
            let certs = match self.certs.read() {
                Ok(certs) => certs,
                Err(poisoned) => {
                    tracing::warn!("certificate registry read lock poisoned, recovering");
                    poisoned.into_inner()
                }
            };
            certs
                .iter()
                .map(|(d, c)| (d.clone(), Arc::clone(c)))
                .collect()
        };
        domains.sort_by(|a, b| a.0.cmp(&b.0));
        domains
            .into_iter()
            .map(|(domain, cert)| {
                let entry = self.cache.get(&domain);
                self.build(&domain, &cert, entry.as_ref())
            })
            .collect()
    }

    fn registered(&self, domain: &str) -> Option<Arc<ManagedCertificate>> {
        let certs = match self.certs.read() {
            Ok(certs) => certs,
            Err(poisoned) => {
                tracing::warn!("certificate registry read lock poisoned, recovering");
                poisoned.into_inner()
            }
        };
        certs.get(domain).cloned()
    }

    fn build(
        &self,
        domain: &str,
        cert: &ManagedCertificate,
        entry: Option<&CacheEntry>,
    ) -> StatusSnapshot {
        let now = SystemTime::now();
        let mode_on = self.policy.is_enabled(domain);

        // A cache entry bound to a superseded serial contributes nothing.
        let entry = entry.filter(|e| e.cert_serial == cert.serial);
        let response = entry.and_then(|e| e.response.as_ref());
        let eligible = entry.is_some_and(|e| e.is_eligible(now, self.default_validity));
        let stapling = mode_on && eligible;

        let failed_kind = entry.and_then(|e| e.last_error.as_ref()).map(|err| err.kind);
        let state = if !mode_on {
            StaplingState::Disabled
        } else if stapling {
            StaplingState::Active
        } else if matches!(
            failed_kind,
            Some(FailureKind::Verification) | Some(FailureKind::Persistent)
        ) {
            StaplingState::Degraded
        } else {
            StaplingState::Pending
        };

        let ocsp = match response {
            Some(r) => Some(OcspStatusView {
                status: match r.status {
                    OcspCertStatus::Good => OcspObservedStatus::Good,
                    OcspCertStatus::Revoked => OcspObservedStatus::Revoked,
                    OcspCertStatus::Unknown => OcspObservedStatus::Unknown,
                },
                valid: !r.is_expired(now, self.default_validity),
                produced_at: epoch_secs(r.produced_at),
                next_update: r.next_update.and_then(epoch_secs),
            }),
            None if state == StaplingState::Degraded => Some(OcspStatusView {
                status: OcspObservedStatus::VerifyFailed,
                valid: false,
                produced_at: None,
                next_update: None,
            }),
            None => None,
        };

        StatusSnapshot {
            domain: domain.to_string(),
            stapling,
            state,
            ocsp,
            last_error: entry
                .and_then(|e| e.last_error.as_ref())
                .map(|err| err.message.clone()),
            next_refresh: entry.and_then(|e| e.next_refresh).and_then(epoch_secs),
        }
    }
}

fn epoch_secs(t: SystemTime) -> Option<u64> {
    t.duration_since(UNIX_EPOCH).ok().map(|d| d.as_secs())
}
