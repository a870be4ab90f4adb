//! OCSP response decoding and verification

use std::time::{SystemTime, UNIX_EPOCH};

use bytes::Bytes;
use der::asn1::{ObjectIdentifier, OctetString};
use der::{Decode, Encode};
use ring::signature;
use x509_ocsp::{BasicOcspResponse, CertStatus, OcspResponse, OcspResponseStatus};
use x509_parser::prelude::*;

use super::{OID_OCSP_BASIC, OID_OCSP_NONCE};
use crate::errors::StaplingError;
use crate::types::{ManagedCertificate, OcspCertStatus, VerifiedOcspResponse};

/// Decode and verify a raw responder answer for `cert`.
///
/// Checks, in order: responder-level status, basic-response framing,
/// signature against the issuer key (or a delegated responder certificate
/// issued by the same issuer), nonce echo when the responder sent one,
/// serial binding, and the validity window.
///
/// # Errors
///
/// `FetchTransient` for responder-level retry statuses, `FetchPersistent`
/// for malformed or expired data, `Verification` for signature, nonce or
/// serial mismatches. A response that fails here is never cached as usable.
pub fn verify_response(
    raw: &[u8],
    cert: &ManagedCertificate,
    expected_nonce: Option<&[u8]>,
    now: SystemTime,
) -> Result<VerifiedOcspResponse, StaplingError> {
    let response = OcspResponse::from_der(raw)
        .map_err(|e| StaplingError::FetchPersistent(format!("malformed ocsp response: {e}")))?;

    match response.response_status {
        OcspResponseStatus::Successful => {}
        OcspResponseStatus::TryLater | OcspResponseStatus::InternalError => {
            return Err(StaplingError::FetchTransient(format!(
                "responder answered {:?}",
                response.response_status
            )));
        }
        other => {
            return Err(StaplingError::FetchPersistent(format!(
                "responder rejected the request: {other:?}"
            )));
        }
    }

    let response_bytes = response.response_bytes.as_ref().ok_or_else(|| {
        StaplingError::FetchPersistent("successful response without response bytes".to_string())
    })?;
    if response_bytes.response_type != ObjectIdentifier::new_unwrap(OID_OCSP_BASIC) {
        return Err(StaplingError::FetchPersistent(format!(
            "unsupported response type {}",
            response_bytes.response_type
        )));
    }

    let basic = BasicOcspResponse::from_der(response_bytes.response.as_bytes())
        .map_err(|e| StaplingError::FetchPersistent(format!("malformed basic response: {e}")))?;

    verify_signature_against_chain(&basic, cert)?;
    check_nonce(&basic, expected_nonce)?;

    let single = basic
        .tbs_response_data
        .responses
        .iter()
        .find(|r| r.cert_id.serial_number.as_bytes() == cert.serial.as_slice())
        .ok_or_else(|| {
            StaplingError::CertificateMismatch(format!(
                "no response for certificate serial {}",
                cert.serial_hex()
            ))
        })?;

    let status = match &single.cert_status {
        CertStatus::Good(_) => OcspCertStatus::Good,
        CertStatus::Revoked(_) => OcspCertStatus::Revoked,
        CertStatus::Unknown(_) => OcspCertStatus::Unknown,
    };

    let produced_at = to_system_time(&basic.tbs_response_data.produced_at);
    let this_update = to_system_time(&single.this_update);
    let next_update = single.next_update.as_ref().map(to_system_time);

    if let Some(expiry) = next_update {
        if now >= expiry {
            return Err(StaplingError::FetchPersistent(
                "responder returned an already expired response".to_string(),
            ));
        }
    }

    Ok(VerifiedOcspResponse {
        status,
        produced_at,
        this_update,
        next_update,
        der: Bytes::copy_from_slice(raw),
        cert_serial: cert.serial.clone(),
    })
}

fn to_system_time(t: &x509_ocsp::OcspGeneralizedTime) -> SystemTime {
    UNIX_EPOCH + t.0.to_unix_duration()
}

fn verify_signature_against_chain(
    basic: &BasicOcspResponse,
    cert: &ManagedCertificate,
) -> Result<(), StaplingError> {
    let tbs_der = basic
        .tbs_response_data
        .to_der()
        .map_err(|e| StaplingError::Verification(format!("re-encoding response data: {e}")))?;
    let sig = basic.signature.raw_bytes();
    let alg_oid = basic.signature_algorithm.oid.to_string();
    let alg = verification_algorithm(&alg_oid).ok_or_else(|| {
        StaplingError::Verification(format!("unsupported signature algorithm {alg_oid}"))
    })?;

    if signature::UnparsedPublicKey::new(alg, &cert.issuer_public_key)
        .verify(&tbs_der, sig)
        .is_ok()
    {
        return Ok(());
    }

    // Responders may sign with a delegated certificate issued by the same
    // issuer and attached to the response.
    if let Some(delegate_key) = delegated_responder_key(basic, cert) {
        if signature::UnparsedPublicKey::new(alg, &delegate_key)
            .verify(&tbs_der, sig)
            .is_ok()
        {
            tracing::debug!(
                domain = %cert.domain,
                "ocsp response verified via delegated responder certificate"
            );
            return Ok(());
        }
    }

    Err(StaplingError::Verification(
        "ocsp response signature did not verify against the issuer chain".to_string(),
    ))
}

/// Public key of an attached responder certificate that itself verifies
/// against the issuer key
fn delegated_responder_key(basic: &BasicOcspResponse, cert: &ManagedCertificate) -> Option<Vec<u8>> {
    for delegate in basic.certs.as_deref().unwrap_or(&[]) {
        let delegate_der = match delegate.to_der() {
            Ok(der_bytes) => der_bytes,
            Err(_) => continue,
        };
        let Ok((_, parsed)) = X509Certificate::from_der(&delegate_der) else {
            continue;
        };
        if parsed.tbs_certificate.issuer.as_raw() != cert.issuer_subject_der.as_slice() {
            continue;
        }
        let Some(alg) = verification_algorithm(&parsed.signature_algorithm.algorithm.to_id_string())
        else {
            continue;
        };
        let verified = signature::UnparsedPublicKey::new(alg, &cert.issuer_public_key)
            .verify(
                parsed.tbs_certificate.as_ref(),
                parsed.signature_value.data.as_ref(),
            )
            .is_ok();
        if verified {
            return Some(
                parsed
                    .tbs_certificate
                    .subject_pki
                    .subject_public_key
                    .data
                    .to_vec(),
            );
        }
    }
    None
}

fn check_nonce(
    basic: &BasicOcspResponse,
    expected_nonce: Option<&[u8]>,
) -> Result<(), StaplingError> {
    let (Some(expected), Some(exts)) = (
        expected_nonce,
        basic.tbs_response_data.response_extensions.as_ref(),
    ) else {
        return Ok(());
    };
    let Some(ext) = exts
        .iter()
        .find(|e| e.extn_id == ObjectIdentifier::new_unwrap(OID_OCSP_NONCE))
    else {
        // Responders are not required to echo the nonce.
        return Ok(());
    };
    let raw = ext.extn_value.as_bytes();
    let echoed = OctetString::from_der(raw)
        .map(|inner| inner.as_bytes().to_vec())
        .unwrap_or_else(|_| raw.to_vec());
    if echoed != expected {
        return Err(StaplingError::Verification(
            "ocsp nonce mismatch, possible replay".to_string(),
        ));
    }
    Ok(())
}

fn verification_algorithm(oid: &str) -> Option<&'static dyn signature::VerificationAlgorithm> {
    match oid {
        // ecdsa-with-SHA256 / SHA384
        "1.2.840.10045.4.3.2" => Some(&signature::ECDSA_P256_SHA256_ASN1),
        "1.2.840.10045.4.3.3" => Some(&signature::ECDSA_P384_SHA384_ASN1),
        // sha256/sha384WithRSAEncryption
        "1.2.840.113549.1.1.11" => Some(&signature::RSA_PKCS1_2048_8192_SHA256),
        "1.2.840.113549.1.1.12" => Some(&signature::RSA_PKCS1_2048_8192_SHA384),
        // Ed25519
        "1.3.101.112" => Some(&signature::ED25519),
        _ => None,
    }
}
