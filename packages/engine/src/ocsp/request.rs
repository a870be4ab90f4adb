//! OCSP request encoding

use der::Encode;
use der::asn1::{ObjectIdentifier, OctetString};
use rand::Rng;
use ring::digest::{Context as DigestContext, SHA256};
use x509_cert::ext::Extension;
use x509_cert::serial_number::SerialNumber;
use x509_cert::spki::AlgorithmIdentifierOwned;
use x509_ocsp::{CertId, OcspRequest, Request, TbsRequest};

use super::{OID_OCSP_NONCE, OID_SHA256};
use crate::errors::StaplingError;
use crate::types::ManagedCertificate;

/// CertID for the certificate, hashing issuer name and key with SHA-256
pub fn cert_id(cert: &ManagedCertificate) -> Result<CertId, StaplingError> {
    let mut hasher = DigestContext::new(&SHA256);
    hasher.update(&cert.issuer_subject_der);
    let issuer_name_hash = hasher.finish();

    let mut hasher = DigestContext::new(&SHA256);
    hasher.update(&cert.issuer_public_key);
    let issuer_key_hash = hasher.finish();

    let serial_number = SerialNumber::new(&cert.serial)
        .map_err(|e| StaplingError::Verification(format!("invalid serial number: {e}")))?;

    Ok(CertId {
        hash_algorithm: AlgorithmIdentifierOwned {
            oid: ObjectIdentifier::new_unwrap(OID_SHA256),
            parameters: None,
        },
        issuer_name_hash: OctetString::new(issuer_name_hash.as_ref())
            .map_err(|e| StaplingError::Verification(format!("issuer name hash: {e}")))?,
        issuer_key_hash: OctetString::new(issuer_key_hash.as_ref())
            .map_err(|e| StaplingError::Verification(format!("issuer key hash: {e}")))?,
        serial_number,
    })
}

/// DER-encoded OCSPRequest for the certificate, carrying `nonce` as a
/// request extension for replay protection
pub fn build_request(cert: &ManagedCertificate, nonce: &[u8]) -> Result<Vec<u8>, StaplingError> {
    let req_cert = cert_id(cert)?;

    let nonce_inner = OctetString::new(nonce)
        .and_then(|inner| inner.to_der())
        .map_err(|e| StaplingError::Verification(format!("nonce encoding: {e}")))?;
    let nonce_ext = Extension {
        extn_id: ObjectIdentifier::new_unwrap(OID_OCSP_NONCE),
        critical: false,
        extn_value: OctetString::new(nonce_inner)
            .map_err(|e| StaplingError::Verification(format!("nonce extension: {e}")))?,
    };

    let tbs_request = TbsRequest {
        version: x509_ocsp::Version::V1,
        requestor_name: None,
        request_list: vec![Request {
            req_cert,
            single_request_extensions: None,
        }],
        request_extensions: Some(vec![nonce_ext]),
    };

    let request = OcspRequest {
        tbs_request,
        optional_signature: None,
    };

    request
        .to_der()
        .map_err(|e| StaplingError::Verification(format!("failed to encode ocsp request: {e}")))
}

/// 16-byte random nonce for the request extension
pub fn generate_nonce() -> Vec<u8> {
    let mut nonce = vec![0u8; 16];
    rand::rng().fill(&mut nonce[..]);
    nonce
}
