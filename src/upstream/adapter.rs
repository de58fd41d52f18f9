use std::future::Future;
use std::sync::Arc;

use http::Method;
use tracing::warn;

use crate::error::ProxyError;
use crate::token::TokenManager;

use super::transport::{HttpTransport, TransportError, UpstreamRequest, UpstreamResponse};

/// Fronts the upstream mail API: attaches the current bearer token to every
/// call and implements the safe-call wrapper from §4.3 (reachability probe
/// gates the call; transient failures fall back; everything else propagates).
pub struct UpstreamAdapter {
    transport: Arc<dyn HttpTransport>,
    tokens: Arc<TokenManager>,
}

impl UpstreamAdapter {
    pub fn new(transport: Arc<dyn HttpTransport>, tokens: Arc<TokenManager>) -> Self {
        Self { transport, tokens }
    }

    pub async fn is_reachable(&self) -> bool {
        self.transport.probe_reachable().await
    }

    pub async fn call(
        &self,
        method: Method,
        path: impl Into<String>,
        json_body: Option<serde_json::Value>,
    ) -> Result<UpstreamResponse, ProxyError> {
        self.call_with_headers(method, path, json_body, Vec::new())
            .await
    }

    pub async fn call_with_headers(
        &self,
        method: Method,
        path: impl Into<String>,
        json_body: Option<serde_json::Value>,
        mut extra_headers: Vec<(&'static str, String)>,
    ) -> Result<UpstreamResponse, ProxyError> {
        let bearer_token = self
            .tokens
            .get_access_token()
            .await
            .ok_or_else(|| ProxyError::Auth("no access token available".into()))?;

        extra_headers.push(("Accept", "application/json".to_string()));

        let request = UpstreamRequest {
            method,
            path: path.into(),
            bearer_token,
            json_body,
            extra_headers,
        };

        match self.transport.send(request).await {
            Ok(response) if response.is_success() => Ok(response),
            Ok(response) if response.status == 412 => Err(ProxyError::ConcurrentModification),
            Ok(response) if (500..600).contains(&response.status) => Err(
                ProxyError::UpstreamTransient(format!("upstream returned {}", response.status)),
            ),
            Ok(response) => Err(ProxyError::UpstreamPermanent(format!(
                "upstream returned {}",
                response.status
            ))),
            Err(TransportError::Timeout) => {
                Err(ProxyError::UpstreamTransient("request timed out".into()))
            }
            Err(TransportError::Transport(msg)) => Err(ProxyError::UpstreamTransient(msg)),
        }
    }

    /// Wraps a call per §4.3: skip the call entirely and use the fallback
    /// when the upstream is unreachable, use the fallback on a transient
    /// failure, and propagate every other error (permanent failures,
    /// concurrent-modification conflicts, auth failures) to the caller.
    pub async fn safe_call<T, Fut>(
        &self,
        fallback: impl FnOnce() -> T,
        call: impl FnOnce() -> Fut,
    ) -> Result<T, ProxyError>
    where
        Fut: Future<Output = Result<T, ProxyError>>,
    {
        if !self.is_reachable().await {
            return Ok(fallback());
        }

        match call().await {
            Ok(value) => Ok(value),
            Err(ProxyError::UpstreamTransient(msg)) => {
                warn!("upstream call failed transiently, falling back: {msg}");
                Ok(fallback())
            }
            Err(other) => Err(other),
        }
    }
}
