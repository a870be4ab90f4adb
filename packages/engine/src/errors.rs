//! Stapling-specific error types for detailed error handling

/// Error taxonomy for the stapling subsystem
///
/// None of these abort a TLS handshake; the hook degrades to serving no
/// staple and the fetcher retries on its own schedule.
#[derive(Debug, thiserror::Error)]
pub enum StaplingError {
    #[error("transient fetch failure: {0}")]
    FetchTransient(String),
    #[error("persistent fetch failure: {0}")]
    FetchPersistent(String),
    #[error("response verification failed: {0}")]
    Verification(String),
    #[error("response serial does not match certificate: {0}")]
    CertificateMismatch(String),
    #[error("configuration error: {0}")]
    Configuration(String),
    #[error("certificate parsing failed: {0}")]
    CertificateParsing(String),
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Coarse failure class recorded on a cache entry and used to pick the
/// retry schedule
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureKind {
    /// Network or responder hiccup, retried with exponential backoff
    Transient,
    /// Responder misbehavior (malformed or rejected exchange), retried at
    /// reduced frequency
    Persistent,
    /// Signature, chain or serial mismatch; never cached as usable
    Verification,
}

impl StaplingError {
    /// Whether the normal backoff schedule applies (as opposed to the
    /// reduced-frequency persistent schedule)
    pub fn is_transient(&self) -> bool {
        matches!(self, StaplingError::FetchTransient(_) | StaplingError::Io(_))
    }

    pub(crate) fn failure_kind(&self) -> FailureKind {
        match self {
            StaplingError::FetchTransient(_) | StaplingError::Io(_) => FailureKind::Transient,
            StaplingError::Verification(_) | StaplingError::CertificateMismatch(_) => {
                FailureKind::Verification
            }
            _ => FailureKind::Persistent,
        }
    }
}
