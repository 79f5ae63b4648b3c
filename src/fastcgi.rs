//! CGI-style dispatch for `cgi`-kind workers.
//!
//! The wire-level FastCGI protocol (record framing, multiplexed request
//! IDs, the full `NAME_VALUE_PAIR` encoding) is an explicit Non-goal of
//! this crate. What the proxy handler actually needs is a narrow seam:
//! hand it a fixed set of CGI params plus the request body, get back a
//! status, headers, and body. That seam is `FastCgiClient`; the concrete
//! wire implementation is swappable behind it.

use std::collections::BTreeMap;

use async_trait::async_trait;
use bytes::Bytes;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum FastCgiError {
    #[error("fastcgi connection failed: {0}")]
    Connect(#[source] std::io::Error),
    #[error("fastcgi upstream returned a malformed response")]
    MalformedResponse,
}

/// The fixed CGI parameter set the proxy handler populates per request,
/// matching the documented `REQUEST_METHOD`/`REQUEST_URI`/... names.
pub type CgiParams = BTreeMap<String, String>;

pub struct CgiResponse {
    pub status: u16,
    pub headers: Vec<(String, String)>,
    pub body: Bytes,
}

#[async_trait]
pub trait FastCgiClient: Send + Sync {
    async fn round_trip(
        &self,
        address: (&str, u16),
        params: CgiParams,
        stdin: Bytes,
    ) -> Result<CgiResponse, FastCgiError>;
}

/// A stub client sufficient to exercise dispatch and pooling logic in
/// tests without a real FastCGI responder listening on the worker's port.
/// Always returns a fixed 200 with the params it was handed echoed back
/// as a header, so tests can assert the proxy built the right params.
pub struct StubFastCgiClient;

#[async_trait]
impl FastCgiClient for StubFastCgiClient {
    async fn round_trip(
        &self,
        _address: (&str, u16),
        params: CgiParams,
        stdin: Bytes,
    ) -> Result<CgiResponse, FastCgiError> {
        let method = params
            .get("REQUEST_METHOD")
            .cloned()
            .unwrap_or_else(|| "GET".to_string());
        Ok(CgiResponse {
            status: 200,
            headers: vec![("X-Stub-Method".to_string(), method)],
            body: stdin,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn stub_client_echoes_method_and_body() {
        let client = StubFastCgiClient;
        let mut params = CgiParams::new();
        params.insert("REQUEST_METHOD".to_string(), "POST".to_string());
        let response = client
            .round_trip(("127.0.0.1", 9100), params, Bytes::from_static(b"payload"))
            .await
            .unwrap();
        assert_eq!(response.status, 200);
        assert_eq!(response.headers[0], ("X-Stub-Method".to_string(), "POST".to_string()));
        assert_eq!(response.body, Bytes::from_static(b"payload"));
    }
}
