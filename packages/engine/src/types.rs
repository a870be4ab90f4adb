//! Core types for managed-domain stapling

use std::str::FromStr;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use bytes::Bytes;
use x509_parser::prelude::*;

use crate::errors::StaplingError;

/// Raw DER bytes handed to the TLS layer for the CertificateStatus message
pub type StapleBytes = Bytes;

/// Per-domain stapling directive as written in configuration
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StaplingMode {
    /// Stapling disabled for the domain
    Off,
    /// Stapling enabled for the domain
    On,
    /// Fall back to the global default
    Inherit,
}

impl FromStr for StaplingMode {
    type Err = StaplingError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "on" => Ok(StaplingMode::On),
            "off" => Ok(StaplingMode::Off),
            "inherit" => Ok(StaplingMode::Inherit),
            other => Err(StaplingError::Configuration(format!(
                "unrecognized stapling mode '{other}' (expected on, off or inherit)"
            ))),
        }
    }
}

/// Certificate status carried in an OCSP response
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OcspCertStatus {
    Good,
    Revoked,
    Unknown,
}

/// Certificate material for one managed domain
///
/// Owned by the issuance collaborator; the engine only references the
/// fields it needs to build and verify OCSP exchanges. Private key
/// material never enters this struct, only an opaque reference.
#[derive(Debug, Clone)]
pub struct ManagedCertificate {
    /// Hostname this certificate serves (unique key, lowercased)
    pub domain: String,
    /// DER certificate chain, leaf first
    pub chain_der: Vec<Vec<u8>>,
    /// Opaque reference to the private key held by the issuance subsystem
    pub key_id: String,
    /// Leaf serial number, big-endian bytes
    pub serial: Vec<u8>,
    pub not_before: SystemTime,
    pub not_after: SystemTime,
    /// Raw DER of the issuer subject name, hashed into the OCSP CertID
    pub issuer_subject_der: Vec<u8>,
    /// Issuer public key (BIT STRING payload), for CertID hashing and
    /// response signature verification
    pub issuer_public_key: Vec<u8>,
    /// OCSP responder URLs from the leaf's Authority Information Access
    pub responder_urls: Vec<String>,
}

impl ManagedCertificate {
    /// Parse a DER chain (leaf first) into the fields the engine needs.
    ///
    /// A single-element chain is treated as self-issued and the leaf
    /// doubles as its own issuer.
    ///
    /// # Errors
    ///
    /// Returns `StaplingError::CertificateParsing` when the chain is empty
    /// or either certificate fails to parse.
    pub fn from_chain_der(
        domain: impl Into<String>,
        chain_der: Vec<Vec<u8>>,
        key_id: impl Into<String>,
    ) -> Result<Self, StaplingError> {
        let domain = domain.into().to_ascii_lowercase();
        let leaf_der = chain_der.first().ok_or_else(|| {
            StaplingError::CertificateParsing(format!("empty certificate chain for {domain}"))
        })?;
        let issuer_der = chain_der.get(1).unwrap_or(leaf_der);

        let (_, leaf) = X509Certificate::from_der(leaf_der).map_err(|e| {
            StaplingError::CertificateParsing(format!("leaf certificate for {domain}: {e}"))
        })?;
        let (_, issuer) = X509Certificate::from_der(issuer_der).map_err(|e| {
            StaplingError::CertificateParsing(format!("issuer certificate for {domain}: {e}"))
        })?;

        let serial = leaf.tbs_certificate.serial.to_bytes_be();
        let not_before = asn1_to_system_time(&leaf.validity().not_before);
        let not_after = asn1_to_system_time(&leaf.validity().not_after);
        let responder_urls = ocsp_urls_from_aia(&leaf);
        let issuer_subject_der = issuer.tbs_certificate.subject.as_raw().to_vec();
        let issuer_public_key = issuer
            .tbs_certificate
            .subject_pki
            .subject_public_key
            .data
            .to_vec();

        Ok(Self {
            domain,
            key_id: key_id.into(),
            serial,
            not_before,
            not_after,
            issuer_subject_der,
            issuer_public_key,
            responder_urls,
            chain_der,
        })
    }

    /// Hex rendering of the serial for log and status output
    pub fn serial_hex(&self) -> String {
        hex::encode(&self.serial)
    }
}

fn asn1_to_system_time(t: &ASN1Time) -> SystemTime {
    let secs = t.timestamp();
    if secs >= 0 {
        UNIX_EPOCH + Duration::from_secs(secs as u64)
    } else {
        UNIX_EPOCH
    }
}

fn ocsp_urls_from_aia(cert: &X509Certificate<'_>) -> Vec<String> {
    // id-ad-ocsp
    const OCSP_METHOD_OID: &[u8] = &[0x2b, 0x06, 0x01, 0x05, 0x05, 0x07, 0x30, 0x01];
    let mut urls = Vec::new();
    for ext in cert.tbs_certificate.extensions() {
        if let ParsedExtension::AuthorityInfoAccess(aia) = ext.parsed_extension() {
            for desc in &aia.accessdescs {
                if desc.access_method.as_bytes() == OCSP_METHOD_OID {
                    if let GeneralName::URI(uri) = &desc.access_location {
                        urls.push((*uri).to_string());
                    }
                }
            }
        }
    }
    urls
}

/// An OCSP response that decoded and verified successfully
#[derive(Debug, Clone)]
pub struct VerifiedOcspResponse {
    pub status: OcspCertStatus,
    pub produced_at: SystemTime,
    pub this_update: SystemTime,
    /// Responder-declared expiry; absent responses fall back to the
    /// configured default validity
    pub next_update: Option<SystemTime>,
    /// Raw DER as received, served verbatim on the handshake path
    pub der: StapleBytes,
    /// Serial of the certificate this response is bound to
    pub cert_serial: Vec<u8>,
}

impl VerifiedOcspResponse {
    /// Point in time after which this response must no longer be stapled
    pub fn expires_at(&self, default_validity: Duration) -> SystemTime {
        self.next_update
            .unwrap_or(self.this_update + default_validity)
    }

    pub fn is_expired(&self, now: SystemTime, default_validity: Duration) -> bool {
        now >= self.expires_at(default_validity)
    }
}
