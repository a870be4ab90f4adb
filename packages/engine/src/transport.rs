//! Responder transport seam
//!
//! The fetcher talks to OCSP responders through `OcspTransport` so tests
//! and embedders can substitute the wire client. The default transport
//! posts `application/ocsp-request` bodies over plain HTTP, which is what
//! responder URLs use in practice.

use std::time::Duration;

use bytes::Bytes;
use futures::future::BoxFuture;
use http::Request;
use http_body_util::{BodyExt, Full};
use hyper_util::client::legacy::Client;
use hyper_util::client::legacy::connect::HttpConnector;
use hyper_util::rt::TokioExecutor;

use crate::errors::StaplingError;

/// One responder round trip: POST the DER request, return the DER answer
pub trait OcspTransport: Send + Sync {
    fn post_ocsp(&self, url: &str, body: Vec<u8>) -> BoxFuture<'_, Result<Bytes, StaplingError>>;
}

/// Default hyper-based transport
pub struct HttpTransport {
    client: Client<HttpConnector, Full<Bytes>>,
    timeout: Duration,
}

impl HttpTransport {
    pub fn new(timeout: Duration) -> Self {
        Self {
            client: Client::builder(TokioExecutor::new()).build_http(),
            timeout,
        }
    }
}

impl OcspTransport for HttpTransport {
    fn post_ocsp(&self, url: &str, body: Vec<u8>) -> BoxFuture<'_, Result<Bytes, StaplingError>> {
        let url = url.to_string();
        Box::pin(async move {
            let parsed = url::Url::parse(&url).map_err(|e| {
                StaplingError::FetchPersistent(format!("invalid responder url {url}: {e}"))
            })?;
            if parsed.scheme() != "http" {
                // Responder URLs are http by definition; anything else is a
                // misissued AIA entry.
                return Err(StaplingError::FetchPersistent(format!(
                    "unsupported responder scheme {}",
                    parsed.scheme()
                )));
            }

            let request = Request::post(url.as_str())
                .header(http::header::CONTENT_TYPE, "application/ocsp-request")
                .header(http::header::ACCEPT, "application/ocsp-response")
                .body(Full::new(Bytes::from(body)))
                .map_err(|e| {
                    StaplingError::FetchPersistent(format!("building responder request: {e}"))
                })?;

            let response = tokio::time::timeout(self.timeout, self.client.request(request))
                .await
                .map_err(|_| {
                    StaplingError::FetchTransient(format!(
                        "responder timed out after {:?}",
                        self.timeout
                    ))
                })?
                .map_err(|e| {
                    StaplingError::FetchTransient(format!("responder request failed: {e}"))
                })?;

            let status = response.status();
            if !status.is_success() {
                return Err(if status.is_server_error() {
                    StaplingError::FetchTransient(format!("responder returned {status}"))
                } else {
                    StaplingError::FetchPersistent(format!("responder returned {status}"))
                });
            }

            let collected = response.into_body().collect().await.map_err(|e| {
                StaplingError::FetchTransient(format!("reading responder body: {e}"))
            })?;
            let bytes = collected.to_bytes();
            if bytes.is_empty() {
                return Err(StaplingError::FetchPersistent(
                    "empty ocsp response body".to_string(),
                ));
            }
            Ok(bytes)
        })
    }
}
