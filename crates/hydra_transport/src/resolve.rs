//! Hostname resolution chain for the fronting dial.
//!
//! A common blocking technique is poisoning the system resolver for the
//! front domain; falling through public resolvers circumvents that without
//! changing the observed TLS signature.

use std::net::{IpAddr, Ipv4Addr};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use hickory_resolver::config::{NameServerConfigGroup, ResolverConfig, ResolverOpts};
use hickory_resolver::TokioAsyncResolver;

const UPSTREAM_TIMEOUT: Duration = Duration::from_secs(5);

/// A single way of turning a hostname into addresses.
#[async_trait::async_trait]
pub trait HostResolver: Send + Sync {
    /// Label used in logs ("system", "8.8.8.8", ...).
    fn label(&self) -> &str;

    async fn resolve(&self, host: &str) -> Result<Vec<IpAddr>>;
}

/// The operating-system resolver.
pub struct SystemResolver;

#[async_trait::async_trait]
impl HostResolver for SystemResolver {
    fn label(&self) -> &str {
        "system"
    }

    async fn resolve(&self, host: &str) -> Result<Vec<IpAddr>> {
        let addrs: Vec<IpAddr> = tokio::net::lookup_host((host, 0))
            .await
            .with_context(|| format!("system lookup for {host}"))?
            .map(|addr| addr.ip())
            .collect();
        anyhow::ensure!(!addrs.is_empty(), "no addresses for {host}");
        Ok(addrs)
    }
}

/// Resolver pinned to a single public DNS upstream.
pub struct DnsServerResolver {
    label: String,
    resolver: TokioAsyncResolver,
}

impl DnsServerResolver {
    pub fn new(server: IpAddr) -> Self {
        let name_servers = NameServerConfigGroup::from_ips_clear(&[server], 53, true);
        let config = ResolverConfig::from_parts(None, vec![], name_servers);
        let mut opts = ResolverOpts::default();
        opts.timeout = UPSTREAM_TIMEOUT;

        Self {
            label: server.to_string(),
            resolver: TokioAsyncResolver::tokio(config, opts),
        }
    }
}

#[async_trait::async_trait]
impl HostResolver for DnsServerResolver {
    fn label(&self) -> &str {
        &self.label
    }

    async fn resolve(&self, host: &str) -> Result<Vec<IpAddr>> {
        let lookup = self
            .resolver
            .lookup_ip(host)
            .await
            .with_context(|| format!("lookup {host} via {}", self.label))?;
        let addrs: Vec<IpAddr> = lookup.iter().collect();
        anyhow::ensure!(!addrs.is_empty(), "no addresses for {host}");
        Ok(addrs)
    }
}

/// Fixed address list; for pinned deployments and tests.
pub struct StaticResolver {
    addrs: Vec<IpAddr>,
}

impl StaticResolver {
    pub fn new(addrs: Vec<IpAddr>) -> Self {
        Self { addrs }
    }
}

#[async_trait::async_trait]
impl HostResolver for StaticResolver {
    fn label(&self) -> &str {
        "static"
    }

    async fn resolve(&self, host: &str) -> Result<Vec<IpAddr>> {
        anyhow::ensure!(!self.addrs.is_empty(), "no pinned addresses for {host}");
        Ok(self.addrs.clone())
    }
}

/// System default first, then public resolvers: Google, Cloudflare, Quad9.
pub fn default_resolver_chain() -> Vec<Arc<dyn HostResolver>> {
    vec![
        Arc::new(SystemResolver),
        Arc::new(DnsServerResolver::new(IpAddr::V4(Ipv4Addr::new(8, 8, 8, 8)))),
        Arc::new(DnsServerResolver::new(IpAddr::V4(Ipv4Addr::new(1, 1, 1, 1)))),
        Arc::new(DnsServerResolver::new(IpAddr::V4(Ipv4Addr::new(9, 9, 9, 9)))),
    ]
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn static_resolver_returns_pinned_addresses() {
        let pinned = vec![IpAddr::V4(Ipv4Addr::new(10, 0, 0, 5))];
        let resolver = StaticResolver::new(pinned.clone());
        let addrs = resolver.resolve("whatever.example.com").await.unwrap();
        assert_eq!(addrs, pinned);
    }

    #[tokio::test]
    async fn empty_static_resolver_errors() {
        let resolver = StaticResolver::new(vec![]);
        assert!(resolver.resolve("whatever.example.com").await.is_err());
    }

    #[tokio::test]
    async fn system_resolver_finds_localhost() {
        let resolver = SystemResolver;
        let addrs = resolver.resolve("localhost").await.unwrap();
        assert!(addrs.iter().any(|a| a.is_loopback()));
    }

    #[test]
    fn default_chain_is_system_then_public() {
        let chain = default_resolver_chain();
        assert_eq!(chain.len(), 4);
        assert_eq!(chain[0].label(), "system");
        assert_eq!(chain[1].label(), "8.8.8.8");
        assert_eq!(chain[2].label(), "1.1.1.1");
        assert_eq!(chain[3].label(), "9.9.9.9");
    }
}
