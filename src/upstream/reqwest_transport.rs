use std::time::Duration;

use reqwest::Client;
use tracing::debug;

use super::dns::DnsResolver;
use super::transport::{HttpTransport, TransportError, UpstreamRequest, UpstreamResponse};

const REQUEST_TIMEOUT: Duration = Duration::from_secs(10);
const PROBE_TIMEOUT: Duration = Duration::from_secs(1);
const REACHABLE_STATUSES: [u16; 4] = [200, 401, 403, 405];

/// Production `HttpTransport`: a `reqwest` client talking to the upstream
/// mail API, fronted by a DNS reachability check (§4.3).
pub struct ReqwestTransport {
    client: Client,
    base_url: String,
    host: String,
    dns: DnsResolver,
}

impl ReqwestTransport {
    pub fn new(base_url: impl Into<String>, proxy: Option<&str>) -> Result<Self, reqwest::Error> {
        let base_url = base_url.into();
        let host = url::Url::parse(&base_url)
            .ok()
            .and_then(|u| u.host_str().map(str::to_owned))
            .unwrap_or_default();

        let mut builder = Client::builder().timeout(REQUEST_TIMEOUT);
        if let Some(proxy_url) = proxy {
            builder = builder.proxy(reqwest::Proxy::all(proxy_url)?);
        }

        Ok(Self {
            client: builder.build()?,
            base_url,
            host,
            dns: DnsResolver::new(),
        })
    }

    fn resolve_url(&self, path: &str) -> String {
        if path.starts_with("http://") || path.starts_with("https://") {
            path.to_string()
        } else {
            format!("{}{}", self.base_url, path)
        }
    }
}

#[async_trait::async_trait]
impl HttpTransport for ReqwestTransport {
    async fn send(&self, request: UpstreamRequest) -> Result<UpstreamResponse, TransportError> {
        let url = self.resolve_url(&request.path);
        let mut builder = self
            .client
            .request(request.method, &url)
            .bearer_auth(&request.bearer_token);

        for (name, value) in &request.extra_headers {
            builder = builder.header(*name, value);
        }

        if let Some(body) = &request.json_body {
            builder = builder.json(body);
        }

        let response = builder.send().await.map_err(|err| {
            if err.is_timeout() {
                TransportError::Timeout
            } else {
                TransportError::Transport(err.to_string())
            }
        })?;

        let status = response.status().as_u16();
        let headers = response.headers().clone();
        let body = response
            .bytes()
            .await
            .map_err(|err| TransportError::Transport(err.to_string()))?
            .to_vec();

        Ok(UpstreamResponse {
            status,
            body,
            headers,
        })
    }

    async fn probe_reachable(&self) -> bool {
        if self.host.is_empty() || !self.dns.resolves(&self.host).await {
            debug!("upstream host {} failed to resolve", self.host);
            return false;
        }

        let probe_url = format!("{}/me", self.base_url);
        match self
            .client
            .head(&probe_url)
            .timeout(PROBE_TIMEOUT)
            .send()
            .await
        {
            Ok(response) => REACHABLE_STATUSES.contains(&response.status().as_u16()),
            Err(err) => {
                debug!("upstream reachability probe failed: {err}");
                false
            }
        }
    }
}
