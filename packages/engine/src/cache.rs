//! In-memory OCSP response cache
//!
//! Single shared-mutation point between the fetcher and the handshake
//! path. Entries are replaced whole under a write lock, so readers never
//! observe a partially updated entry.

use std::collections::HashMap;
use std::sync::RwLock;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::{Duration, SystemTime};

use crate::errors::FailureKind;
use crate::types::{OcspCertStatus, VerifiedOcspResponse};

/// Most recent fetch or verification failure for a domain
#[derive(Debug, Clone)]
pub struct LastFailure {
    pub kind: FailureKind,
    pub message: String,
    pub at: SystemTime,
}

/// Cached stapling state for one domain
#[derive(Debug, Clone)]
pub struct CacheEntry {
    /// Serial of the certificate this entry belongs to; responses bound
    /// to any other serial are rejected
    pub cert_serial: Vec<u8>,
    pub response: Option<VerifiedOcspResponse>,
    /// Consecutive failed fetch attempts since the last success
    pub fetch_attempts: u32,
    pub last_error: Option<LastFailure>,
    pub refreshed_at: Option<SystemTime>,
    /// When the fetcher plans to run next, for status output
    pub next_refresh: Option<SystemTime>,
}

impl CacheEntry {
    fn for_serial(serial: &[u8]) -> Self {
        Self {
            cert_serial: serial.to_vec(),
            response: None,
            fetch_attempts: 0,
            last_error: None,
            refreshed_at: None,
            next_refresh: None,
        }
    }

    /// Whether the entry currently qualifies for stapling: a verified
    /// good response, bound to this entry's serial, not yet expired.
    /// The policy mode check happens at the hook.
    pub fn is_eligible(&self, now: SystemTime, default_validity: Duration) -> bool {
        match &self.response {
            Some(r) => {
                r.status == OcspCertStatus::Good
                    && r.cert_serial == self.cert_serial
                    && !r.is_expired(now, default_validity)
            }
            None => false,
        }
    }
}

/// Domain-keyed OCSP response store shared between fetch tasks, the
/// handshake hook and status queries
pub struct OcspResponseCache {
    cache: RwLock<HashMap<String, CacheEntry>>,
    hits: AtomicUsize,
    misses: AtomicUsize,
}

impl std::fmt::Debug for OcspResponseCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let cache_size = match self.cache.read() {
            Ok(cache) => cache.len(),
            Err(_) => 0,
        };
        f.debug_struct("OcspResponseCache")
            .field("cache_size", &cache_size)
            .field("hits", &self.hits.load(Ordering::Relaxed))
            .field("misses", &self.misses.load(Ordering::Relaxed))
            .finish_non_exhaustive()
    }
}

impl Default for OcspResponseCache {
    fn default() -> Self {
        Self::new()
    }
}

impl OcspResponseCache {
    pub fn new() -> Self {
        Self {
            cache: RwLock::new(HashMap::with_capacity(16)),
            hits: AtomicUsize::new(0),
            misses: AtomicUsize::new(0),
        }
    }

    /// Get cache statistics (hits, misses)
    pub fn stats(&self) -> (usize, usize) {
        (
            self.hits.load(Ordering::Relaxed),
            self.misses.load(Ordering::Relaxed),
        )
    }

    pub fn len(&self) -> usize {
        match self.cache.read() {
            Ok(cache) => cache.len(),
            Err(poisoned) => {
                tracing::warn!("ocsp cache read lock poisoned during size check, recovering");
                poisoned.into_inner().len()
            }
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Snapshot of one entry; called on the handshake path, so this is a
    /// single read-locked clone and nothing else
    pub fn get(&self, domain: &str) -> Option<CacheEntry> {
        let entry = match self.cache.read() {
            Ok(cache) => cache.get(domain).cloned(),
            Err(poisoned) => {
                tracing::warn!("ocsp cache read lock poisoned, recovering");
                poisoned.into_inner().get(domain).cloned()
            }
        };
        if entry.is_some() {
            self.hits.fetch_add(1, Ordering::Relaxed);
        } else {
            self.misses.fetch_add(1, Ordering::Relaxed);
        }
        entry
    }

    /// Create the entry for a domain/serial pair if missing; an entry
    /// carrying a different serial is reset (certificate renewal)
    pub fn ensure(&self, domain: &str, serial: &[u8]) {
        let mut cache = self.write_lock();
        match cache.get(domain) {
            Some(entry) if entry.cert_serial == serial => {}
            _ => {
                cache.insert(domain.to_string(), CacheEntry::for_serial(serial));
            }
        }
    }

    /// Store a verified response. Returns false (and drops the response)
    /// when the entry is bound to a different certificate serial, which
    /// happens when a fetch completes across a renewal.
    pub fn put(
        &self,
        domain: &str,
        response: VerifiedOcspResponse,
        next_refresh: Option<SystemTime>,
    ) -> bool {
        let mut cache = self.write_lock();
        let entry = match cache.get_mut(domain) {
            Some(entry) => entry,
            None => {
                tracing::debug!(domain, "dropping ocsp response for unmanaged domain");
                return false;
            }
        };
        if entry.cert_serial != response.cert_serial {
            tracing::warn!(
                domain,
                response_serial = %hex::encode(&response.cert_serial),
                entry_serial = %hex::encode(&entry.cert_serial),
                "dropping ocsp response bound to a superseded certificate"
            );
            return false;
        }
        entry.response = Some(response);
        entry.fetch_attempts = 0;
        entry.last_error = None;
        entry.refreshed_at = Some(SystemTime::now());
        entry.next_refresh = next_refresh;
        true
    }

    /// Record a failed attempt, keeping any previous valid response
    pub fn record_failure(
        &self,
        domain: &str,
        kind: FailureKind,
        message: String,
        next_refresh: Option<SystemTime>,
    ) {
        let mut cache = self.write_lock();
        if let Some(entry) = cache.get_mut(domain) {
            entry.fetch_attempts = entry.fetch_attempts.saturating_add(1);
            entry.last_error = Some(LastFailure {
                kind,
                message,
                at: SystemTime::now(),
            });
            entry.next_refresh = next_refresh;
        }
    }

    /// Reset the entry for a new certificate serial. Must run before the
    /// renewed certificate becomes servable so a stale response can never
    /// be stapled against it.
    pub fn invalidate(&self, domain: &str, new_serial: &[u8]) {
        let mut cache = self.write_lock();
        cache.insert(domain.to_string(), CacheEntry::for_serial(new_serial));
        tracing::debug!(domain, "ocsp cache entry invalidated for renewed certificate");
    }

    /// Drop a domain entirely (removed from configuration)
    pub fn remove(&self, domain: &str) {
        let mut cache = self.write_lock();
        cache.remove(domain);
    }

    /// Drop expired responses, keeping the entries and their error state
    pub fn cleanup(&self, default_validity: Duration) {
        let now = SystemTime::now();
        let mut cache = self.write_lock();
        let mut dropped = 0usize;
        for entry in cache.values_mut() {
            if entry
                .response
                .as_ref()
                .is_some_and(|r| r.is_expired(now, default_validity))
            {
                entry.response = None;
                dropped += 1;
            }
        }
        if dropped > 0 {
            tracing::debug!(dropped, "expired ocsp responses dropped from cache");
        }
    }

    fn write_lock(&self) -> std::sync::RwLockWriteGuard<'_, HashMap<String, CacheEntry>> {
        match self.cache.write() {
            Ok(cache) => cache,
            Err(poisoned) => {
                tracing::warn!("ocsp cache write lock poisoned, recovering");
                poisoned.into_inner()
            }
        }
    }
}
