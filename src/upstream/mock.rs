//! In-memory `HttpTransport` used to exercise the adapter, translator, and
//! mailbox-operations layers without a real network, mirroring the real/mock
//! split `DnsResolver` uses for its own DNS lookups.

use std::sync::Mutex;

use http::{HeaderMap, Method};

use super::transport::{HttpTransport, TransportError, UpstreamRequest, UpstreamResponse};

pub struct Script {
    pub method: Method,
    pub path_suffix: &'static str,
    pub result: Result<UpstreamResponse, TransportError>,
}

pub struct MockTransport {
    reachable: Mutex<bool>,
    scripted: Mutex<Vec<Script>>,
    pub calls: Mutex<Vec<UpstreamRequest>>,
}

impl MockTransport {
    pub fn new() -> Self {
        Self {
            reachable: Mutex::new(true),
            scripted: Mutex::new(Vec::new()),
            calls: Mutex::new(Vec::new()),
        }
    }

    pub fn set_reachable(&self, reachable: bool) {
        *self.reachable.lock().unwrap() = reachable;
    }

    pub fn push_response(&self, method: Method, path_suffix: &'static str, status: u16, body: Vec<u8>) {
        self.scripted.lock().unwrap().push(Script {
            method,
            path_suffix,
            result: Ok(UpstreamResponse {
                status,
                body,
                headers: HeaderMap::new(),
            }),
        });
    }

    pub fn push_json(&self, method: Method, path_suffix: &'static str, status: u16, body: &serde_json::Value) {
        self.push_response(method, path_suffix, status, serde_json::to_vec(body).unwrap());
    }

    pub fn push_transient_error(&self, method: Method, path_suffix: &'static str) {
        self.scripted.lock().unwrap().push(Script {
            method,
            path_suffix,
            result: Err(TransportError::Transport("connection reset".into())),
        });
    }
}

impl Default for MockTransport {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait::async_trait]
impl HttpTransport for MockTransport {
    async fn send(&self, request: UpstreamRequest) -> Result<UpstreamResponse, TransportError> {
        self.calls.lock().unwrap().push(request.clone());

        let mut scripted = self.scripted.lock().unwrap();
        let position = scripted
            .iter()
            .position(|s| s.method == request.method && request.path.ends_with(s.path_suffix));

        match position {
            Some(index) => scripted.remove(index).result,
            None => Err(TransportError::Transport(format!(
                "no scripted response for {} {}",
                request.method, request.path
            ))),
        }
    }

    async fn probe_reachable(&self) -> bool {
        *self.reachable.lock().unwrap()
    }
}
