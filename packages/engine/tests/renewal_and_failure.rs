//! Renewal invalidation, failure handling and response persistence.

mod common;

use std::sync::Arc;
use std::time::{Duration, SystemTime};

use common::{FakeTransport, TestCa, fast_config};
use stapled_engine::{
    OcspObservedStatus, StaplingConfig, StaplingDirectives, StaplingEngine, StaplingMode,
    StaplingState,
};

const DOMAIN: &str = "md.example.org";
const CONVERGE: Duration = Duration::from_secs(5);

async fn await_state(engine: &StaplingEngine, domain: &str, state: StaplingState) -> bool {
    let give_up = SystemTime::now() + CONVERGE;
    loop {
        if engine
            .snapshot(domain)
            .map(|s| s.state == state)
            .unwrap_or(false)
        {
            return true;
        }
        if SystemTime::now() >= give_up {
            return false;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
}

#[tokio::test]
async fn renewal_invalidates_the_previous_response() {
    let ca = TestCa::new();
    let cert_old = ca.issue(DOMAIN);
    let cert_new = ca.issue(DOMAIN);
    assert_ne!(cert_old.serial, cert_new.serial);

    let transport = FakeTransport::new();
    transport.set_response(ca.good_response(&cert_old, Duration::from_secs(3600)));

    let engine = StaplingEngine::with_transport(fast_config(), transport.clone()).unwrap();
    engine.install_certificate(cert_old.clone()).unwrap();
    engine.reload(&StaplingDirectives::new(StaplingMode::On));
    assert!(engine.await_active(DOMAIN, CONVERGE).await);

    let hook = engine.hook();
    let old_staple = hook.lookup(DOMAIN).expect("staple for old certificate");

    // Renew the certificate while the responder still answers for the old
    // serial: the cache entry must be gone before the new certificate is
    // servable and the old staple must never reappear.
    engine.install_certificate(cert_new.clone()).unwrap();
    assert!(hook.lookup(DOMAIN).is_none());
    let snap = engine.snapshot(DOMAIN).unwrap();
    assert!(!snap.stapling);

    // The refresh task keeps receiving old-serial responses; those fail
    // verification and the domain degrades rather than serving them.
    assert!(await_state(&engine, DOMAIN, StaplingState::Degraded).await);
    assert!(hook.lookup(DOMAIN).is_none());

    // Once the responder answers for the renewed serial, stapling
    // recovers with bytes bound to the new certificate.
    transport.set_response(ca.good_response(&cert_new, Duration::from_secs(3600)));
    assert!(engine.await_active(DOMAIN, CONVERGE).await);
    let new_staple = hook.lookup(DOMAIN).expect("staple for renewed certificate");
    assert_ne!(old_staple, new_staple);
    let verified = stapled_engine::ocsp::verify_response(
        &new_staple,
        &cert_new,
        None,
        SystemTime::now(),
    )
    .expect("renewed staple verifies");
    assert_eq!(verified.cert_serial, cert_new.serial);

    engine.shutdown().await;
}

#[tokio::test]
async fn transient_failures_retain_the_previous_good_response() {
    let ca = TestCa::new();
    let cert = ca.issue(DOMAIN);

    let transport = FakeTransport::new();
    transport.set_response(ca.good_response(&cert, Duration::from_secs(3600)));

    // Refresh almost immediately so the failure path gets exercised while
    // the previous response is still well within its validity window.
    let config = StaplingConfig {
        refresh_fraction: 0.000_01,
        ..fast_config()
    };
    let engine = StaplingEngine::with_transport(config, transport.clone()).unwrap();
    engine.install_certificate(cert).unwrap();
    engine.reload(&StaplingDirectives::new(StaplingMode::On));
    assert!(engine.await_active(DOMAIN, CONVERGE).await);

    // Responder goes dark; several refresh attempts fail.
    transport.set_failure("connection refused");
    let fetches = transport.requests();
    let give_up = SystemTime::now() + CONVERGE;
    while transport.requests() < fetches + 2 {
        assert!(SystemTime::now() < give_up, "no retries happened");
        tokio::time::sleep(Duration::from_millis(20)).await;
    }

    // Availability wins: the previous good response keeps being served.
    let snap = engine.snapshot(DOMAIN).unwrap();
    assert!(snap.stapling);
    assert_eq!(snap.state, StaplingState::Active);
    assert!(snap.last_error.unwrap().contains("connection refused"));
    assert!(engine.hook().lookup(DOMAIN).is_some());

    engine.shutdown().await;
}

#[tokio::test]
async fn persistent_verification_failure_degrades_and_recovers() {
    let ca = TestCa::new();
    let cert = ca.issue(DOMAIN);

    let transport = FakeTransport::new();
    // Malformed responder data: decodes as nothing, never cached.
    transport.set_response(b"not an ocsp response".to_vec());

    let engine = StaplingEngine::with_transport(fast_config(), transport.clone()).unwrap();
    engine.install_certificate(cert.clone()).unwrap();
    engine.reload(&StaplingDirectives::new(StaplingMode::On));

    assert!(await_state(&engine, DOMAIN, StaplingState::Degraded).await);
    let snap = engine.snapshot(DOMAIN).unwrap();
    assert!(!snap.stapling);
    assert_eq!(snap.ocsp.unwrap().status, OcspObservedStatus::VerifyFailed);
    assert!(snap.last_error.is_some());
    assert!(engine.hook().lookup(DOMAIN).is_none());

    // Retries continue at the reduced cadence and the next good answer
    // brings the domain back to active.
    transport.set_response(ca.good_response(&cert, Duration::from_secs(3600)));
    assert!(engine.await_active(DOMAIN, CONVERGE).await);
    assert_eq!(
        engine.snapshot(DOMAIN).unwrap().state,
        StaplingState::Active
    );

    engine.shutdown().await;
}

#[tokio::test]
async fn expired_responder_answers_are_rejected() {
    let ca = TestCa::new();
    let cert = ca.issue(DOMAIN);

    let transport = FakeTransport::new();
    let now = SystemTime::now();
    transport.set_response(ca.response_with(
        &cert,
        stapled_engine::OcspCertStatus::Good,
        now - Duration::from_secs(7200),
        Some(now - Duration::from_secs(3600)),
        now - Duration::from_secs(7200),
    ));

    let engine = StaplingEngine::with_transport(fast_config(), transport.clone()).unwrap();
    engine.install_certificate(cert).unwrap();
    engine.reload(&StaplingDirectives::new(StaplingMode::On));

    assert!(await_state(&engine, DOMAIN, StaplingState::Degraded).await);
    assert!(engine.hook().lookup(DOMAIN).is_none());

    engine.shutdown().await;
}

#[tokio::test]
async fn persisted_responses_survive_an_engine_restart() {
    let ca = TestCa::new();
    let cert = ca.issue(DOMAIN);

    let store_dir = std::env::temp_dir().join(format!(
        "stapled-store-test-{}-{}",
        std::process::id(),
        line!()
    ));
    let config = StaplingConfig {
        store_dir: Some(store_dir.clone()),
        ..fast_config()
    };

    // First engine fetches and persists a staple.
    let transport = FakeTransport::new();
    transport.set_response(ca.good_response(&cert, Duration::from_secs(3600)));
    let engine = StaplingEngine::with_transport(config.clone(), transport.clone()).unwrap();
    engine.install_certificate(cert.clone()).unwrap();
    engine.reload(&StaplingDirectives::new(StaplingMode::On));
    assert!(engine.await_active(DOMAIN, CONVERGE).await);
    engine.shutdown().await;

    // Second engine starts with the responder down and must staple from
    // the persisted response alone.
    let offline = FakeTransport::new();
    offline.set_failure("responder down");
    let engine = StaplingEngine::with_transport(config, offline.clone()).unwrap();
    engine.install_certificate(cert).unwrap();
    engine.reload(&StaplingDirectives::new(StaplingMode::On));
    assert!(engine.await_active(DOMAIN, Duration::from_secs(2)).await);
    assert!(engine.hook().lookup(DOMAIN).is_some());

    engine.shutdown().await;
    let _ = std::fs::remove_dir_all(&store_dir);
}
