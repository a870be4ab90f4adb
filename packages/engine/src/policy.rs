//! Stapling policy resolution from layered configuration
//!
//! A reload swaps the whole directive table in one write, so concurrent
//! readers observe either the previous or the next configuration across
//! all domains, never a mix.

use std::collections::HashMap;
use std::sync::RwLock;

use crate::types::StaplingMode;

/// Tri-state stapling directives as delivered by the config-reload
/// collaborator: one global default plus per-domain overrides
#[derive(Debug, Clone, Default)]
pub struct StaplingDirectives {
    /// Server-wide default; `Inherit` here is unresolvable and treated
    /// as `Off`
    pub global: Option<StaplingMode>,
    /// Per-domain overrides; `Inherit` falls back to the global default
    pub domains: HashMap<String, StaplingMode>,
}

impl StaplingDirectives {
    pub fn new(global: StaplingMode) -> Self {
        Self {
            global: Some(global),
            domains: HashMap::new(),
        }
    }

    /// Add a per-domain directive (hostnames are matched case-insensitively)
    #[must_use]
    pub fn with_domain(mut self, domain: impl Into<String>, mode: StaplingMode) -> Self {
        self.domains.insert(domain.into(), mode);
        self
    }
}

#[derive(Debug)]
struct PolicyTable {
    global_on: bool,
    domains: HashMap<String, StaplingMode>,
}

impl PolicyTable {
    fn from_directives(directives: &StaplingDirectives) -> Self {
        let global_on = match directives.global {
            Some(StaplingMode::On) => true,
            Some(StaplingMode::Off) | None => false,
            Some(StaplingMode::Inherit) => {
                tracing::warn!("global stapling mode 'inherit' is unresolvable, defaulting to off");
                false
            }
        };

        let mut domains = HashMap::with_capacity(directives.domains.len());
        for (name, mode) in &directives.domains {
            let key = name.trim().to_ascii_lowercase();
            if key.is_empty() {
                tracing::warn!("dropping stapling directive with empty hostname");
                continue;
            }
            domains.insert(key, *mode);
        }

        Self { global_on, domains }
    }

    fn effective(&self, domain: &str) -> StaplingMode {
        match self.domains.get(domain) {
            Some(StaplingMode::On) => StaplingMode::On,
            Some(StaplingMode::Off) => StaplingMode::Off,
            Some(StaplingMode::Inherit) | None => {
                if self.global_on {
                    StaplingMode::On
                } else {
                    StaplingMode::Off
                }
            }
        }
    }
}

/// Resolves the effective stapling mode per domain
pub struct StaplingPolicy {
    table: RwLock<PolicyTable>,
}

impl std::fmt::Debug for StaplingPolicy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let (global_on, domains) = match self.table.read() {
            Ok(t) => (t.global_on, t.domains.len()),
            Err(_) => (false, 0),
        };
        f.debug_struct("StaplingPolicy")
            .field("global_on", &global_on)
            .field("domain_overrides", &domains)
            .finish()
    }
}

impl Default for StaplingPolicy {
    fn default() -> Self {
        Self::new()
    }
}

impl StaplingPolicy {
    /// Start with everything off, matching a server without stapling
    /// directives
    pub fn new() -> Self {
        Self {
            table: RwLock::new(PolicyTable {
                global_on: false,
                domains: HashMap::new(),
            }),
        }
    }

    /// Effective mode for a domain; `Inherit` is already resolved and the
    /// result is only ever `On` or `Off`
    pub fn resolve(&self, domain: &str) -> StaplingMode {
        let key = domain.to_ascii_lowercase();
        match self.table.read() {
            Ok(table) => table.effective(&key),
            Err(poisoned) => {
                tracing::warn!("stapling policy read lock poisoned, recovering");
                poisoned.into_inner().effective(&key)
            }
        }
    }

    pub fn is_enabled(&self, domain: &str) -> bool {
        self.resolve(domain) == StaplingMode::On
    }

    /// Atomically replace the directive table
    pub fn reload(&self, directives: &StaplingDirectives) {
        let next = PolicyTable::from_directives(directives);
        let mut table = match self.table.write() {
            Ok(table) => table,
            Err(poisoned) => {
                tracing::warn!("stapling policy write lock poisoned, recovering");
                poisoned.into_inner()
            }
        };
        tracing::debug!(
            global_on = next.global_on,
            overrides = next.domains.len(),
            "stapling policy reloaded"
        );
        *table = next;
    }
}
