use http::{HeaderMap, Method};
use thiserror::Error;

/// A request the Upstream Adapter wants carried out against the upstream API.
///
/// `path` may be an absolute URL (used for pagination `next` links) or a
/// path relative to the upstream base `https://<host>/v1.0`.
#[derive(Debug, Clone)]
pub struct UpstreamRequest {
    pub method: Method,
    pub path: String,
    pub bearer_token: String,
    pub json_body: Option<serde_json::Value>,
    pub extra_headers: Vec<(&'static str, String)>,
}

#[derive(Debug, Clone)]
pub struct UpstreamResponse {
    pub status: u16,
    pub body: Vec<u8>,
    pub headers: HeaderMap,
}

impl UpstreamResponse {
    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }

    pub fn etag(&self) -> Option<String> {
        self.headers
            .get(http::header::ETAG)
            .and_then(|v| v.to_str().ok())
            .map(str::to_owned)
    }

    pub fn json<T: serde::de::DeserializeOwned>(&self) -> Result<T, serde_json::Error> {
        serde_json::from_slice(&self.body)
    }
}

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("transport error: {0}")]
    Transport(String),
    #[error("request timed out")]
    Timeout,
}

/// Seam between the Upstream Adapter and the actual HTTP stack, so tests can
/// exercise the adapter, translator, and mailbox-operations layers without a
/// real network. The production implementation is `ReqwestTransport`.
#[async_trait::async_trait]
pub trait HttpTransport: Send + Sync {
    async fn send(&self, request: UpstreamRequest) -> Result<UpstreamResponse, TransportError>;

    /// Implements the reachability probe from §4.3: DNS resolution of the
    /// upstream host followed by a HEAD to `/me`, treating {200,401,403,405}
    /// as reachable.
    async fn probe_reachable(&self) -> bool;
}
