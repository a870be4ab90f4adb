//! OCSP request/response codec and verification
//!
//! Pure DER plumbing shared by the fetcher: no I/O happens here. Request
//! encoding and response verification are split so the verification path
//! can also re-check responses loaded from the on-disk store.

mod request;
mod verify;

pub use request::{build_request, cert_id, generate_nonce};
pub use verify::verify_response;

/// id-pkix-ocsp-basic
pub(crate) const OID_OCSP_BASIC: &str = "1.3.6.1.5.5.7.48.1.1";
/// id-pkix-ocsp-nonce
pub(crate) const OID_OCSP_NONCE: &str = "1.3.6.1.5.5.7.48.1.2";
/// SHA-256, used for both CertID hashes
pub(crate) const OID_SHA256: &str = "2.16.840.1.101.3.4.2.1";
