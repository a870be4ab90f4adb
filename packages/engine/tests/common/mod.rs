//! Shared test fixtures: a throwaway CA, an in-process OCSP response
//! signer and a fake responder transport.

#![allow(dead_code)]

use std::collections::VecDeque;
use std::sync::Mutex;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use bytes::Bytes;
use der::Encode;
use der::asn1::{BitString, GeneralizedTime, Null, ObjectIdentifier, OctetString};
use futures::future::BoxFuture;
use ring::digest;
use ring::rand::SystemRandom;
use ring::signature::{ECDSA_P256_SHA256_ASN1_SIGNING, EcdsaKeyPair};
use x509_cert::spki::AlgorithmIdentifierOwned;
use x509_ocsp::{
    BasicOcspResponse, CertStatus, OcspGeneralizedTime, OcspResponse, OcspResponseStatus,
    ResponderId, ResponseBytes, ResponseData, SingleResponse,
};

use stapled_engine::errors::StaplingError;
use stapled_engine::ocsp::cert_id;
use stapled_engine::transport::OcspTransport;
use stapled_engine::types::{ManagedCertificate, OcspCertStatus};
use stapled_engine::config::StaplingConfig;

const ECDSA_WITH_SHA256: &str = "1.2.840.10045.4.3.2";
const ID_PKIX_OCSP_BASIC: &str = "1.3.6.1.5.5.7.48.1.1";

/// Throwaway issuing CA whose key both signs leaf certificates (via
/// rcgen) and OCSP responses (via ring)
pub struct TestCa {
    ca_cert_pem: String,
    ca_cert_der: Vec<u8>,
    ca_key_pem: String,
    responder_key: EcdsaKeyPair,
    rng: SystemRandom,
    next_serial: AtomicU64,
}

impl TestCa {
    pub fn new() -> Self {
        let ca_key = rcgen::KeyPair::generate().expect("generate ca key");
        let ca_key_pem = ca_key.serialize_pem();
        let pkcs8 = ca_key.serialize_der();

        let mut params = rcgen::CertificateParams::new(Vec::<String>::new()).expect("ca params");
        let mut dn = rcgen::DistinguishedName::new();
        dn.push(rcgen::DnType::CommonName, "Stapled Test CA");
        params.distinguished_name = dn;
        params.is_ca = rcgen::IsCa::Ca(rcgen::BasicConstraints::Unconstrained);
        let ca_cert = params.self_signed(&ca_key).expect("self-sign ca");

        let responder_key = EcdsaKeyPair::from_pkcs8(
            &ECDSA_P256_SHA256_ASN1_SIGNING,
            &pkcs8,
            &SystemRandom::new(),
        )
        .expect("ca key for response signing");

        Self {
            ca_cert_pem: ca_cert.pem(),
            ca_cert_der: ca_cert.der().as_ref().to_vec(),
            ca_key_pem,
            responder_key,
            rng: SystemRandom::new(),
            next_serial: AtomicU64::new(0x1000),
        }
    }

    /// Issue a leaf for `domain` with a fresh serial and return it parsed
    /// into the engine's certificate model
    pub fn issue(&self, domain: &str) -> ManagedCertificate {
        let ca_key = rcgen::KeyPair::from_pem(&self.ca_key_pem).expect("reload ca key");
        let issuer =
            rcgen::Issuer::from_ca_cert_pem(&self.ca_cert_pem, ca_key).expect("ca issuer");

        let serial = self.next_serial.fetch_add(1, Ordering::SeqCst);
        let serial_bytes: Vec<u8> = serial
            .to_be_bytes()
            .iter()
            .skip_while(|b| **b == 0)
            .copied()
            .collect();
        let leaf_key = rcgen::KeyPair::generate().expect("generate leaf key");
        let mut params =
            rcgen::CertificateParams::new(vec![domain.to_string()]).expect("leaf params");
        params.serial_number = Some(rcgen::SerialNumber::from(serial_bytes));
        let leaf = params.signed_by(&leaf_key, &issuer).expect("sign leaf");

        let chain = vec![leaf.der().as_ref().to_vec(), self.ca_cert_der.clone()];
        ManagedCertificate::from_chain_der(domain, chain, "test-key").expect("parse chain")
    }

    /// DER OCSPResponse for `cert`, signed by the CA key
    pub fn response_with(
        &self,
        cert: &ManagedCertificate,
        status: OcspCertStatus,
        this_update: SystemTime,
        next_update: Option<SystemTime>,
        produced_at: SystemTime,
    ) -> Vec<u8> {
        let cert_status = match status {
            OcspCertStatus::Good => CertStatus::Good(Null),
            OcspCertStatus::Revoked => CertStatus::Revoked(x509_ocsp::RevokedInfo {
                revocation_time: gtime(this_update),
                revocation_reason: None,
            }),
            OcspCertStatus::Unknown => CertStatus::Unknown(Null),
        };

        let single = SingleResponse {
            cert_id: cert_id(cert).expect("cert id"),
            cert_status,
            this_update: gtime(this_update),
            next_update: next_update.map(gtime),
            single_extensions: None,
        };

        let key_hash = digest::digest(&digest::SHA256, &cert.issuer_public_key);
        let response_data = ResponseData {
            version: x509_ocsp::Version::V1,
            responder_id: ResponderId::ByKey(
                OctetString::new(key_hash.as_ref()).expect("key hash"),
            ),
            produced_at: gtime(produced_at),
            responses: vec![single],
            response_extensions: None,
        };

        let tbs = response_data.to_der().expect("encode response data");
        let sig = self
            .responder_key
            .sign(&self.rng, &tbs)
            .expect("sign response");

        let basic = BasicOcspResponse {
            tbs_response_data: response_data,
            signature_algorithm: AlgorithmIdentifierOwned {
                oid: ObjectIdentifier::new_unwrap(ECDSA_WITH_SHA256),
                parameters: None,
            },
            signature: BitString::from_bytes(sig.as_ref()).expect("signature bits"),
            certs: None,
        };

        let response = OcspResponse {
            response_status: OcspResponseStatus::Successful,
            response_bytes: Some(ResponseBytes {
                response_type: ObjectIdentifier::new_unwrap(ID_PKIX_OCSP_BASIC),
                response: OctetString::new(basic.to_der().expect("encode basic response"))
                    .expect("wrap basic response"),
            }),
        };

        response.to_der().expect("encode ocsp response")
    }

    /// Good response valid from now for `valid_for`
    pub fn good_response(&self, cert: &ManagedCertificate, valid_for: Duration) -> Vec<u8> {
        let now = SystemTime::now();
        self.response_with(
            cert,
            OcspCertStatus::Good,
            now,
            Some(now + valid_for),
            now,
        )
    }
}

fn gtime(t: SystemTime) -> OcspGeneralizedTime {
    let secs = t
        .duration_since(UNIX_EPOCH)
        .expect("time before epoch")
        .as_secs();
    OcspGeneralizedTime(
        GeneralizedTime::from_unix_duration(Duration::from_secs(secs)).expect("generalized time"),
    )
}

enum FakeBehavior {
    Respond(Vec<u8>),
    Fail(String),
}

/// In-process responder double: scripted answers, optional latency,
/// request counting
pub struct FakeTransport {
    behavior: Mutex<FakeBehavior>,
    queued: Mutex<VecDeque<FakeBehavior>>,
    delay: Mutex<Duration>,
    requests: AtomicUsize,
}

impl FakeTransport {
    pub fn new() -> std::sync::Arc<Self> {
        std::sync::Arc::new(Self {
            behavior: Mutex::new(FakeBehavior::Fail("no response configured".to_string())),
            queued: Mutex::new(VecDeque::new()),
            delay: Mutex::new(Duration::ZERO),
            requests: AtomicUsize::new(0),
        })
    }

    /// Answer every following request with this DER response
    pub fn set_response(&self, der: Vec<u8>) {
        *self.behavior.lock().unwrap() = FakeBehavior::Respond(der);
    }

    /// Fail every following request with a transient error
    pub fn set_failure(&self, message: &str) {
        *self.behavior.lock().unwrap() = FakeBehavior::Fail(message.to_string());
    }

    /// One-shot answer consumed before the standing behavior applies
    pub fn queue_response(&self, der: Vec<u8>) {
        self.queued.lock().unwrap().push_back(FakeBehavior::Respond(der));
    }

    /// Latency added before each answer, to keep a fetch in flight
    pub fn set_delay(&self, delay: Duration) {
        *self.delay.lock().unwrap() = delay;
    }

    pub fn requests(&self) -> usize {
        self.requests.load(Ordering::SeqCst)
    }
}

impl OcspTransport for FakeTransport {
    fn post_ocsp(&self, _url: &str, _body: Vec<u8>) -> BoxFuture<'_, Result<Bytes, StaplingError>> {
        self.requests.fetch_add(1, Ordering::SeqCst);
        let delay = *self.delay.lock().unwrap();
        let behavior = match self.queued.lock().unwrap().pop_front() {
            Some(one_shot) => one_shot,
            None => match &*self.behavior.lock().unwrap() {
                FakeBehavior::Respond(der) => FakeBehavior::Respond(der.clone()),
                FakeBehavior::Fail(msg) => FakeBehavior::Fail(msg.clone()),
            },
        };
        Box::pin(async move {
            if !delay.is_zero() {
                tokio::time::sleep(delay).await;
            }
            match behavior {
                FakeBehavior::Respond(der) => Ok(Bytes::from(der)),
                FakeBehavior::Fail(message) => Err(StaplingError::FetchTransient(message)),
            }
        })
    }
}

/// Engine configuration with intervals scaled down for tests
pub fn fast_config() -> StaplingConfig {
    StaplingConfig {
        refresh_fraction: 0.5,
        min_refresh_interval: Duration::from_millis(50),
        max_refresh_interval: Duration::from_secs(3600),
        backoff_initial: Duration::from_millis(50),
        backoff_max: Duration::from_millis(200),
        persistent_retry_interval: Duration::from_millis(100),
        fetch_timeout: Duration::from_secs(2),
        default_validity: Duration::from_secs(3600),
        keep_response_for: Duration::from_secs(3600),
        store_dir: None,
        responder_override: Some("http://ocsp.test/".to_string()),
    }
}
