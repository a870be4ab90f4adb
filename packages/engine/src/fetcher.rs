//! Background OCSP refresh scheduling
//!
//! One task per enabled domain. Each task sleeps until its entry's next
//! refresh point, performs one responder exchange, writes the outcome to
//! the cache and goes back to sleep. Disabling a domain flips its stop
//! flag; an exchange already in flight completes normally and the task
//! exits at the next wake.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::{Duration, SystemTime};

use tokio::sync::watch;
use tokio::task::JoinHandle;

use crate::cache::OcspResponseCache;
use crate::config::StaplingConfig;
use crate::errors::{FailureKind, StaplingError};
use crate::ocsp;
use crate::store::ResponseStore;
use crate::transport::OcspTransport;
use crate::types::{ManagedCertificate, VerifiedOcspResponse};

struct FetchTask {
    serial: Vec<u8>,
    stop: watch::Sender<bool>,
    handle: JoinHandle<()>,
}

/// Owns the per-domain refresh tasks
pub struct OcspFetcher {
    cache: Arc<OcspResponseCache>,
    config: Arc<StaplingConfig>,
    transport: Arc<dyn OcspTransport>,
    store: Option<Arc<ResponseStore>>,
    tasks: Mutex<HashMap<String, FetchTask>>,
}

impl std::fmt::Debug for OcspFetcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let tasks = match self.tasks.lock() {
            Ok(tasks) => tasks.len(),
            Err(_) => 0,
        };
        f.debug_struct("OcspFetcher")
            .field("scheduled_domains", &tasks)
            .finish_non_exhaustive()
    }
}

impl OcspFetcher {
    pub(crate) fn new(
        cache: Arc<OcspResponseCache>,
        config: Arc<StaplingConfig>,
        transport: Arc<dyn OcspTransport>,
        store: Option<Arc<ResponseStore>>,
    ) -> Self {
        Self {
            cache,
            config,
            transport,
            store,
            tasks: Mutex::new(HashMap::new()),
        }
    }

    /// Start (or restart after renewal) the refresh task for a domain.
    /// Scheduling an already running domain with an unchanged serial is a
    /// no-op, so identical reloads cause no task churn.
    pub fn schedule(&self, cert: Arc<ManagedCertificate>) {
        let mut tasks = self.lock_tasks();
        if let Some(existing) = tasks.get(&cert.domain) {
            if existing.serial == cert.serial && !existing.handle.is_finished() {
                return;
            }
            let _ = existing.stop.send(true);
        }

        let (stop_tx, stop_rx) = watch::channel(false);
        let handle = tokio::spawn(refresh_loop(
            Arc::clone(&cert),
            Arc::clone(&self.cache),
            Arc::clone(&self.config),
            Arc::clone(&self.transport),
            self.store.clone(),
            stop_rx,
        ));
        tracing::info!(domain = %cert.domain, serial = %cert.serial_hex(), "ocsp refresh scheduled");
        tasks.insert(
            cert.domain.clone(),
            FetchTask {
                serial: cert.serial.clone(),
                stop: stop_tx,
                handle,
            },
        );
    }

    /// Stop the refresh task for a domain. Takes effect at the task's
    /// next wake; an in-flight responder exchange is not aborted.
    pub fn cancel(&self, domain: &str) {
        let mut tasks = self.lock_tasks();
        if let Some(task) = tasks.remove(domain) {
            let _ = task.stop.send(true);
            tracing::info!(domain, "ocsp refresh cancelled");
        }
    }

    pub fn is_scheduled(&self, domain: &str) -> bool {
        self.lock_tasks()
            .get(domain)
            .is_some_and(|t| !t.handle.is_finished())
    }

    /// Signal every task and await their exit within a bounded grace
    /// period; stragglers are aborted.
    pub async fn shutdown(&self) {
        let drained: Vec<(String, FetchTask)> = self.lock_tasks().drain().collect();
        let grace = self.config.fetch_timeout + Duration::from_secs(1);
        for (domain, task) in drained {
            let _ = task.stop.send(true);
            let abort = task.handle.abort_handle();
            if tokio::time::timeout(grace, task.handle).await.is_err() {
                tracing::warn!(%domain, "ocsp refresh task did not stop in time, aborting");
                abort.abort();
            }
        }
    }

    fn lock_tasks(&self) -> std::sync::MutexGuard<'_, HashMap<String, FetchTask>> {
        match self.tasks.lock() {
            Ok(tasks) => tasks,
            Err(poisoned) => {
                tracing::warn!("fetch task table lock poisoned, recovering");
                poisoned.into_inner()
            }
        }
    }
}

async fn refresh_loop(
    cert: Arc<ManagedCertificate>,
    cache: Arc<OcspResponseCache>,
    config: Arc<StaplingConfig>,
    transport: Arc<dyn OcspTransport>,
    store: Option<Arc<ResponseStore>>,
    mut stop: watch::Receiver<bool>,
) {
    let domain = cert.domain.clone();
    tracing::debug!(%domain, "ocsp refresh task started");
    loop {
        if *stop.borrow() {
            break;
        }
        let delay = next_delay(&cache, &domain, &config);
        if !delay.is_zero() {
            tokio::select! {
                _ = tokio::time::sleep(delay) => {}
                changed = stop.changed() => {
                    if changed.is_err() || *stop.borrow() {
                        break;
                    }
                    continue;
                }
            }
        }
        if *stop.borrow() {
            break;
        }

        match fetch_once(&cert, &config, transport.as_ref()).await {
            Ok(response) => {
                let now = SystemTime::now();
                let expires = response.expires_at(config.default_validity);
                let next_refresh = now + config.refresh_delay(now, expires);
                if cache.put(&domain, response.clone(), Some(next_refresh)) {
                    tracing::info!(
                        %domain,
                        status = ?response.status,
                        next_refresh_in = ?config.refresh_delay(now, expires),
                        "ocsp response refreshed"
                    );
                    if let Some(store) = &store {
                        if let Err(e) = store.save(&domain, &response) {
                            tracing::warn!(%domain, error = %e, "persisting ocsp response failed");
                        }
                    }
                }
                // A rejected put means the certificate was renewed under
                // us; the replacement task owns the entry now.
            }
            Err(e) => {
                let attempts = cache
                    .get(&domain)
                    .map(|entry| entry.fetch_attempts)
                    .unwrap_or(0)
                    .saturating_add(1);
                let kind = e.failure_kind();
                let delay = match kind {
                    FailureKind::Transient => config.backoff_after(attempts),
                    _ => config.persistent_retry_interval,
                };
                tracing::warn!(
                    %domain,
                    attempts,
                    retry_in = ?delay,
                    error = %e,
                    "ocsp fetch failed, keeping previous response if still valid"
                );
                cache.record_failure(&domain, kind, e.to_string(), Some(SystemTime::now() + delay));
            }
        }
    }
    tracing::debug!(%domain, "ocsp refresh task stopped");
}

/// Delay until the entry's planned refresh; zero when nothing is cached
fn next_delay(cache: &OcspResponseCache, domain: &str, config: &StaplingConfig) -> Duration {
    let now = SystemTime::now();
    match cache.get(domain) {
        Some(entry) => match entry.next_refresh {
            Some(next) => next.duration_since(now).unwrap_or(Duration::ZERO),
            None => {
                if let Some(response) = &entry.response {
                    let expires = response.expires_at(config.default_validity);
                    config.refresh_delay(now, expires)
                } else {
                    Duration::ZERO
                }
            }
        },
        None => Duration::ZERO,
    }
}

/// One full exchange: build request, try each responder URL, verify
async fn fetch_once(
    cert: &ManagedCertificate,
    config: &StaplingConfig,
    transport: &dyn OcspTransport,
) -> Result<VerifiedOcspResponse, StaplingError> {
    let urls: Vec<String> = if !cert.responder_urls.is_empty() {
        cert.responder_urls.clone()
    } else if let Some(fallback) = &config.responder_override {
        vec![fallback.clone()]
    } else {
        return Err(StaplingError::Configuration(format!(
            "certificate for {} carries no ocsp responder url and no override is configured",
            cert.domain
        )));
    };

    let nonce = ocsp::generate_nonce();
    let request = ocsp::build_request(cert, &nonce)?;

    let mut last_error = None;
    for url in &urls {
        match transport.post_ocsp(url, request.clone()).await {
            Ok(bytes) => {
                match ocsp::verify_response(&bytes, cert, Some(&nonce), SystemTime::now()) {
                    Ok(response) => return Ok(response),
                    Err(e) => {
                        tracing::warn!(domain = %cert.domain, url, error = %e, "ocsp response rejected");
                        last_error = Some(e);
                    }
                }
            }
            Err(e) => {
                tracing::warn!(domain = %cert.domain, url, error = %e, "ocsp responder unreachable");
                last_error = Some(e);
            }
        }
    }

    Err(last_error.unwrap_or_else(|| {
        StaplingError::FetchTransient("no responder produced a response".to_string())
    }))
}
