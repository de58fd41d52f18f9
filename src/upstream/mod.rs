mod adapter;
mod dns;
#[cfg(test)]
mod dns_mock;
#[cfg(test)]
pub mod mock;
mod reqwest_transport;
mod transport;

pub use adapter::UpstreamAdapter;
pub use reqwest_transport::ReqwestTransport;
pub use transport::{HttpTransport, TransportError, UpstreamRequest, UpstreamResponse};
