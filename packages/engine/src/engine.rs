//! Engine handle: lifecycle, reload and wiring
//!
//! `StaplingEngine` is the explicit init/teardown handle the surrounding
//! server owns. It ties policy, cache, fetcher and certificate registry
//! together and serializes reconfiguration against fetch-schedule
//! changes.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, RwLock};
use std::time::{Duration, Instant, SystemTime};

use crate::cache::OcspResponseCache;
use crate::config::StaplingConfig;
use crate::errors::StaplingError;
use crate::fetcher::OcspFetcher;
use crate::hook::StaplingHook;
use crate::policy::{StaplingDirectives, StaplingPolicy};
use crate::status::{StatusReporter, StatusSnapshot};
use crate::store::ResponseStore;
use crate::transport::{HttpTransport, OcspTransport};
use crate::types::ManagedCertificate;

/// Shared map from domain to its installed certificate
pub(crate) type CertRegistry = RwLock<HashMap<String, Arc<ManagedCertificate>>>;

/// How often `await_active` re-checks the snapshot
const CONVERGENCE_POLL_INTERVAL: Duration = Duration::from_millis(25);

/// Domains whose effective mode changed on a reload
#[derive(Debug, Default)]
pub struct ReloadOutcome {
    pub enabled: Vec<String>,
    pub disabled: Vec<String>,
}

impl ReloadOutcome {
    /// True when the reload changed nothing (identical configuration)
    pub fn is_noop(&self) -> bool {
        self.enabled.is_empty() && self.disabled.is_empty()
    }
}

/// The managed-domain stapling engine
pub struct StaplingEngine {
    policy: Arc<StaplingPolicy>,
    cache: Arc<OcspResponseCache>,
    fetcher: Arc<OcspFetcher>,
    certs: Arc<CertRegistry>,
    config: Arc<StaplingConfig>,
    store: Option<Arc<ResponseStore>>,
    // Serializes reload and certificate installs against each other so
    // fetch-schedule changes never interleave with a policy swap.
    reconfigure: Mutex<()>,
}

impl std::fmt::Debug for StaplingEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let domains = match self.certs.read() {
            Ok(certs) => certs.len(),
            Err(_) => 0,
        };
        f.debug_struct("StaplingEngine")
            .field("domains", &domains)
            .field("cache", &self.cache)
            .finish_non_exhaustive()
    }
}

impl StaplingEngine {
    /// Engine with the default hyper transport
    ///
    /// # Errors
    ///
    /// Returns `StaplingError::Configuration` for invalid tunables and
    /// `StaplingError::Io` when the store directory cannot be created.
    pub fn new(config: StaplingConfig) -> Result<Self, StaplingError> {
        let timeout = config.fetch_timeout;
        Self::with_transport(config, Arc::new(HttpTransport::new(timeout)))
    }

    /// Engine with a caller-supplied responder transport
    pub fn with_transport(
        config: StaplingConfig,
        transport: Arc<dyn OcspTransport>,
    ) -> Result<Self, StaplingError> {
        config.validate().map_err(StaplingError::Configuration)?;

        let store = match &config.store_dir {
            Some(dir) => {
                let store = ResponseStore::open(dir.clone())?;
                store.prune(config.keep_response_for);
                Some(Arc::new(store))
            }
            None => None,
        };

        let config = Arc::new(config);
        let cache = Arc::new(OcspResponseCache::new());
        let fetcher = Arc::new(OcspFetcher::new(
            Arc::clone(&cache),
            Arc::clone(&config),
            transport,
            store.clone(),
        ));

        Ok(Self {
            policy: Arc::new(StaplingPolicy::new()),
            cache,
            fetcher,
            certs: Arc::new(RwLock::new(HashMap::new())),
            config,
            store,
            reconfigure: Mutex::new(()),
        })
    }

    /// Install or replace the certificate for a domain.
    ///
    /// On renewal (serial change) the cache entry is invalidated before
    /// the new certificate becomes servable, so a response bound to the
    /// old serial can never be stapled against it. If stapling is enabled
    /// for the domain its refresh task is (re)started.
    pub fn install_certificate(&self, mut cert: ManagedCertificate) -> Result<(), StaplingError> {
        cert.domain = cert.domain.trim().to_ascii_lowercase();
        if cert.domain.is_empty() {
            return Err(StaplingError::Configuration(
                "certificate without a domain name".to_string(),
            ));
        }
        if cert.serial.is_empty() {
            return Err(StaplingError::Configuration(format!(
                "certificate for {} has an empty serial",
                cert.domain
            )));
        }

        let _guard = self.lock_reconfigure();
        let cert = Arc::new(cert);
        let domain = cert.domain.clone();

        {
            let mut registry = self.write_certs();
            let prior_serial = registry.get(&domain).map(|c| c.serial.clone());
            match prior_serial {
                Some(serial) if serial == cert.serial => {
                    self.cache.ensure(&domain, &cert.serial);
                }
                Some(_) => {
                    tracing::info!(
                        %domain,
                        serial = %cert.serial_hex(),
                        "certificate renewed, invalidating cached ocsp response"
                    );
                    self.cache.invalidate(&domain, &cert.serial);
                }
                None => {
                    self.cache.ensure(&domain, &cert.serial);
                }
            }
            registry.insert(domain.clone(), Arc::clone(&cert));
        }

        // Reuse a persisted response when the cache has nothing yet.
        if let Some(store) = &self.store {
            let empty = self
                .cache
                .get(&domain)
                .is_some_and(|entry| entry.response.is_none());
            if empty {
                if let Some(response) = store.load(&cert, SystemTime::now()) {
                    let now = SystemTime::now();
                    let expires = response.expires_at(self.config.default_validity);
                    let next_refresh = now + self.config.refresh_delay(now, expires);
                    self.cache.put(&domain, response, Some(next_refresh));
                }
            }
        }

        if self.policy.is_enabled(&domain) {
            self.fetcher.schedule(cert);
        }
        Ok(())
    }

    /// Forget a domain removed from configuration
    pub fn remove_domain(&self, domain: &str) {
        let domain = domain.to_ascii_lowercase();
        let _guard = self.lock_reconfigure();
        self.fetcher.cancel(&domain);
        self.write_certs().remove(&domain);
        self.cache.remove(&domain);
        if let Some(store) = &self.store {
            store.remove(&domain);
        }
        tracing::info!(%domain, "domain removed from stapling engine");
    }

    /// Apply a configuration reload.
    ///
    /// The policy table swaps atomically; afterwards refresh tasks are
    /// started for newly enabled domains and cancelled for newly disabled
    /// ones. Re-applying an identical configuration is a no-op.
    pub fn reload(&self, directives: &StaplingDirectives) -> ReloadOutcome {
        let _guard = self.lock_reconfigure();

        let registered: Vec<(String, Arc<ManagedCertificate>)> = {
            let certs = self.read_certs();
            certs
                .iter()
                .map(|(d, c)| (d.clone(), Arc::clone(c)))
                .collect()
        };

        let before: Vec<bool> = registered
            .iter()
            .map(|(domain, _)| self.policy.is_enabled(domain))
            .collect();

        self.policy.reload(directives);

        let mut outcome = ReloadOutcome::default();
        for ((domain, cert), was_enabled) in registered.into_iter().zip(before) {
            let enabled = self.policy.is_enabled(&domain);
            if enabled == was_enabled {
                continue;
            }
            if enabled {
                self.fetcher.schedule(cert);
                outcome.enabled.push(domain);
            } else {
                self.fetcher.cancel(&domain);
                outcome.disabled.push(domain);
            }
        }

        if !outcome.is_noop() {
            tracing::info!(
                enabled = outcome.enabled.len(),
                disabled = outcome.disabled.len(),
                "stapling configuration reloaded"
            );
        }
        outcome
    }

    /// Handshake-path lookup handle for the TLS acceptor
    pub fn hook(&self) -> StaplingHook {
        StaplingHook::new(
            Arc::clone(&self.policy),
            Arc::clone(&self.cache),
            Arc::clone(&self.certs),
            self.config.default_validity,
        )
    }

    /// Status reporter for monitoring and operator tooling
    pub fn reporter(&self) -> StatusReporter {
        StatusReporter::new(
            Arc::clone(&self.policy),
            Arc::clone(&self.cache),
            Arc::clone(&self.certs),
            self.config.default_validity,
        )
    }

    pub fn snapshot(&self, domain: &str) -> Option<StatusSnapshot> {
        self.reporter().snapshot(domain)
    }

    pub fn snapshot_all(&self) -> Vec<StatusSnapshot> {
        self.reporter().snapshot_all()
    }

    /// Wait until a domain staples, polling the snapshot on a fixed
    /// interval up to `deadline`. Returns false on timeout.
    pub async fn await_active(&self, domain: &str, deadline: Duration) -> bool {
        let give_up = Instant::now() + deadline;
        loop {
            if self
                .snapshot(domain)
                .map(|s| s.stapling)
                .unwrap_or(false)
            {
                return true;
            }
            if Instant::now() >= give_up {
                return false;
            }
            tokio::time::sleep(CONVERGENCE_POLL_INTERVAL).await;
        }
    }

    /// Cache hit/miss counters, for diagnostics
    pub fn cache_stats(&self) -> (usize, usize) {
        self.cache.stats()
    }

    /// Periodic housekeeping: drop expired responses, prune the store
    pub fn perform_maintenance(&self) {
        self.cache.cleanup(self.config.default_validity);
        if let Some(store) = &self.store {
            store.prune(self.config.keep_response_for);
        }
    }

    /// Stop all refresh tasks and release the engine
    pub async fn shutdown(&self) {
        self.fetcher.shutdown().await;
        tracing::info!("stapling engine stopped");
    }

    fn lock_reconfigure(&self) -> std::sync::MutexGuard<'_, ()> {
        match self.reconfigure.lock() {
            Ok(guard) => guard,
            Err(poisoned) => {
                tracing::warn!("reconfigure lock poisoned, recovering");
                poisoned.into_inner()
            }
        }
    }

    fn read_certs(&self) -> std::sync::RwLockReadGuard<'_, HashMap<String, Arc<ManagedCertificate>>> {
        match self.certs.read() {
            Ok(certs) => certs,
            Err(poisoned) => {
                tracing::warn!("certificate registry read lock poisoned, recovering");
                poisoned.into_inner()
            }
        }
    }

    fn write_certs(
        &self,
    ) -> std::sync::RwLockWriteGuard<'_, HashMap<String, Arc<ManagedCertificate>>> {
        match self.certs.write() {
            Ok(certs) => certs,
            Err(poisoned) => {
                tracing::warn!("certificate registry write lock poisoned, recovering");
                poisoned.into_inner()
            }
        }
    }
}
