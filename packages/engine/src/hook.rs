//! Handshake-path staple lookup
//!
//! Called synchronously while a TLS handshake is being assembled. The
//! lookup is a policy check plus one read-locked cache clone; it never
//! performs I/O, never awaits and never fails the handshake.

use std::sync::Arc;
use std::time::{Duration, SystemTime};

use crate::cache::OcspResponseCache;
use crate::engine::CertRegistry;
use crate::policy::StaplingPolicy;
use crate::types::StapleBytes;

/// Connection-level OCSP outcome, matching what a client observes in the
/// handshake
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ObservedOcsp {
    /// No CertificateStatus message was sent
    NoResponseSent,
    /// A verified-good response was stapled
    Successful,
}

impl ObservedOcsp {
    pub fn is_stapled(&self) -> bool {
        matches!(self, ObservedOcsp::Successful)
    }
}

impl std::fmt::Display for ObservedOcsp {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ObservedOcsp::NoResponseSent => write!(f, "no response sent"),
            ObservedOcsp::Successful => write!(f, "successful (0x0)"),
        }
    }
}

/// Cheap-to-clone handle handed to the TLS acceptor
#[derive(Clone)]
pub struct StaplingHook {
    policy: Arc<StaplingPolicy>,
    cache: Arc<OcspResponseCache>,
    certs: Arc<CertRegistry>,
    default_validity: Duration,
}

impl StaplingHook {
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

    /// Bytes to staple into the handshake for `domain`, or `None` to
    /// proceed without a CertificateStatus message
    pub fn lookup(&self, domain: &str) -> Option<StapleBytes> {
        let domain = domain.to_ascii_lowercase();
        if !self.policy.is_enabled(&domain) {
            return None;
        }

        let cert = {
            let certs = match self.certs.read() {
                Ok(certs) => certs,
                Err(poisoned) => {
                    tracing::warn!("certificate registry read lock poisoned, recovering");
                    poisoned.into_inner()
                }
            };
            certs.get(&domain).cloned()?
        };

        let entry = self.cache.get(&domain)?;
        if entry.cert_serial != cert.serial {
            // Entry outlived a renewal; treat as a miss and realign the
            // cache to the live serial so the fetcher refills it.
            tracing::warn!(
                %domain,
                "cached ocsp entry bound to superseded certificate, invalidating"
            );
            self.cache.invalidate(&domain, &cert.serial);
            return None;
        }
        if !entry.is_eligible(SystemTime::now(), self.default_validity) {
            return None;
        }
        entry.response.map(|r| r.der)
    }

    /// What a client connecting to `domain` right now would observe
    pub fn observed_status(&self, domain: &str) -> ObservedOcsp {
        if self.lookup(domain).is_some() {
            ObservedOcsp::Successful
        } else {
            ObservedOcsp::NoResponseSent
        }
    }
}
