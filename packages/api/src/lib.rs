//! Stapled Public API
//!
//! Managed-domain OCSP stapling for TLS servers. The engine keeps one
//! refresh schedule per enabled domain, caches verified responses for the
//! handshake path and exposes a typed status view for monitoring.
//!
//! ```no_run
//! use stapled::{Stapling, StaplingConfig, StaplingDirectives, StaplingMode};
//!
//! # fn certificate() -> stapled::ManagedCertificate { unimplemented!() }
//! # async fn demo() -> Result<(), stapled::StaplingError> {
//! let engine = Stapling::engine(StaplingConfig::default())?;
//! engine.install_certificate(certificate())?;
//! engine.reload(&StaplingDirectives::new(StaplingMode::On));
//!
//! // Hand the hook to the TLS acceptor:
//! let hook = engine.hook();
//! let staple = hook.lookup("www.example.org");
//! # let _ = staple;
//! # Ok(())
//! # }
//! ```

#![deny(unsafe_code)]
#![warn(clippy::all)]

// Re-export the engine surface
pub use stapled_engine::{
    FailureKind, ManagedCertificate, ObservedOcsp, OcspCertStatus, OcspObservedStatus,
    OcspStatusView, OcspTransport, ReloadOutcome, StapleBytes, StaplingConfig,
    StaplingDirectives, StaplingEngine, StaplingError, StaplingHook, StaplingMode, StaplingState,
    StatusReporter, StatusSnapshot, VerifiedOcspResponse,
};

/// Main entry point providing static constructors
pub struct Stapling;

impl Stapling {
    /// Create an engine with the default responder transport
    ///
    /// Shorthand for `StaplingEngine::new(config)`
    pub fn engine(config: StaplingConfig) -> Result<StaplingEngine, StaplingError> {
        StaplingEngine::new(config)
    }

    /// Create an engine with a custom responder transport
    ///
    /// Shorthand for `StaplingEngine::with_transport(config, transport)`
    pub fn with_transport(
        config: StaplingConfig,
        transport: std::sync::Arc<dyn OcspTransport>,
    ) -> Result<StaplingEngine, StaplingError> {
        StaplingEngine::with_transport(config, transport)
    }
}
