//! DNS leg of the reachability probe (§4.3): before ever attempting the HTTP
//! HEAD to the upstream API, confirm the host resolves at all. A resolution
//! failure is treated as "unreachable" without attempting the HTTP leg,
//! mirroring the real/mock split the teacher uses for its own DNS lookups.

#[cfg(not(test))]
use hickory_resolver::{Resolver, config::ResolverConfig, name_server::TokioConnectionProvider};

#[derive(Clone)]
pub struct DnsResolver {
    #[cfg(not(test))]
    resolver: Resolver<TokioConnectionProvider>,
    #[cfg(test)]
    resolver: super::dns_mock::Resolver,
}

#[cfg(not(test))]
impl Default for DnsResolver {
    fn default() -> Self {
        Self::new()
    }
}

impl DnsResolver {
    #[cfg(not(test))]
    pub fn new() -> Self {
        Self {
            resolver: Resolver::builder_with_config(
                ResolverConfig::cloudflare_https(),
                TokioConnectionProvider::default(),
            )
            .build(),
        }
    }

    #[cfg(test)]
    pub fn mock(resolves: bool) -> Self {
        Self {
            resolver: super::dns_mock::Resolver { resolves },
        }
    }

    #[cfg(test)]
    pub fn new() -> Self {
        Self::mock(true)
    }

    pub async fn resolves(&self, host: &str) -> bool {
        self.resolver.lookup_ip(host).await.is_ok()
    }
}
