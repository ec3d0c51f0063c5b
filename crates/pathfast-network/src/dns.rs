//! Async DNS Resolver with Caching
//!
//! Resolves proxy server host names to IPv4 addresses. Address literals
//! short-circuit; everything else goes through hickory with a small TTL
//! cache in front.

use async_trait::async_trait;
use hickory_resolver::TokioAsyncResolver;
use hickory_resolver::config::{ResolverConfig, ResolverOpts};
use parking_lot::RwLock;
use std::collections::HashMap;
use std::net::{IpAddr, Ipv4Addr};
use std::time::{Duration, Instant};
use thiserror::Error;
use tracing::{debug, info};

/// DNS resolution errors
#[derive(Debug, Error)]
pub enum DnsError {
    #[error("Resolution failed for {host}: {reason}")]
    ResolutionFailed { host: String, reason: String },

    #[error("No IPv4 address found for {0}")]
    NoAddresses(String),

    #[error("Resolver error: {0}")]
    ResolverError(String),
}

/// DNS resolver configuration
#[derive(Debug, Clone)]
pub struct DnsConfig {
    /// Cache TTL for successful lookups
    pub cache_ttl: Duration,
    /// Maximum cache size
    pub max_cache_entries: usize,
    /// Whether to use system DNS or Cloudflare
    pub use_system_dns: bool,
}

impl Default for DnsConfig {
    fn default() -> Self {
        Self {
            cache_ttl: Duration::from_secs(300),
            max_cache_entries: 256,
            use_system_dns: true,
        }
    }
}

#[derive(Clone)]
struct CacheEntry {
    address: Ipv4Addr,
    expires_at: Instant,
}

/// IPv4 resolver with caching
pub struct DnsResolver {
    resolver: TokioAsyncResolver,
    cache: RwLock<HashMap<String, CacheEntry>>,
    config: DnsConfig,
}

impl DnsResolver {
    pub fn new(config: DnsConfig) -> Result<Self, DnsError> {
        let resolver = if config.use_system_dns {
            TokioAsyncResolver::tokio_from_system_conf()
                .map_err(|e| DnsError::ResolverError(e.to_string()))?
        } else {
            TokioAsyncResolver::tokio(ResolverConfig::cloudflare(), ResolverOpts::default())
        };

        info!("DNS resolver initialized (system: {})", config.use_system_dns);

        Ok(Self {
            resolver,
            cache: RwLock::new(HashMap::new()),
            config,
        })
    }

    pub fn with_defaults() -> Result<Self, DnsError> {
        Self::new(DnsConfig::default())
    }

    /// Resolve `host` to its first IPv4 address
    pub async fn resolve_ipv4(&self, host: &str) -> Result<Ipv4Addr, DnsError> {
        if let Some(addr) = parse_ipv4_literal(host) {
            return Ok(addr);
        }

        let normalized = host.trim_end_matches('.').to_lowercase();
        if let Some(addr) = self.get_cached(&normalized) {
            debug!("DNS cache hit for: {}", host);
            return Ok(addr);
        }

        debug!("DNS lookup for: {}", host);
        let lookup = self
            .resolver
            .ipv4_lookup(normalized.as_str())
            .await
            .map_err(|e| DnsError::ResolutionFailed {
                host: host.to_string(),
                reason: e.to_string(),
            })?;

        let address = lookup
            .iter()
            .next()
            .map(|a| a.0)
            .ok_or_else(|| DnsError::NoAddresses(host.to_string()))?;

        self.cache_address(&normalized, address);
        Ok(address)
    }

    pub fn clear_cache(&self) {
        self.cache.write().clear();
    }

    fn get_cached(&self, host: &str) -> Option<Ipv4Addr> {
        let cache = self.cache.read();
        cache
            .get(host)
            .filter(|e| e.expires_at > Instant::now())
            .map(|e| e.address)
    }

    fn cache_address(&self, host: &str, address: Ipv4Addr) {
        let mut cache = self.cache.write();
        if cache.len() >= self.config.max_cache_entries {
            let now = Instant::now();
            cache.retain(|_, v| v.expires_at > now);
            if cache.len() >= self.config.max_cache_entries {
                cache.clear();
            }
        }
        cache.insert(
            host.to_string(),
            CacheEntry {
                address,
                expires_at: Instant::now() + self.config.cache_ttl,
            },
        );
    }
}

/// Host name to IPv4 lookup
#[async_trait]
pub trait HostResolver: Send + Sync {
    async fn resolve_ipv4(&self, host: &str) -> Result<Ipv4Addr, DnsError>;
}

#[async_trait]
impl HostResolver for DnsResolver {
    async fn resolve_ipv4(&self, host: &str) -> Result<Ipv4Addr, DnsError> {
        DnsResolver::resolve_ipv4(self, host).await
    }
}

/// Parse `host` as an IPv4 literal (IPv4-mapped IPv6 included)
pub fn parse_ipv4_literal(host: &str) -> Option<Ipv4Addr> {
    let trimmed = host.trim_start_matches('[').trim_end_matches(']');
    match trimmed.parse::<IpAddr>().ok()? {
        IpAddr::V4(v4) => Some(v4),
        IpAddr::V6(v6) => v6.to_ipv4_mapped(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_literal() {
        assert_eq!(parse_ipv4_literal("1.2.3.4"), Some(Ipv4Addr::new(1, 2, 3, 4)));
        assert_eq!(
            parse_ipv4_literal("[::ffff:10.0.0.1]"),
            Some(Ipv4Addr::new(10, 0, 0, 1))
        );
        assert_eq!(parse_ipv4_literal("::1"), None);
        assert_eq!(parse_ipv4_literal("example.com"), None);
    }

    #[tokio::test]
    async fn test_literal_skips_lookup() {
        let resolver = DnsResolver::new(DnsConfig {
            use_system_dns: false,
            ..DnsConfig::default()
        })
        .unwrap();
        let addr = resolver.resolve_ipv4("203.0.113.9").await.unwrap();
        assert_eq!(addr, Ipv4Addr::new(203, 0, 113, 9));
    }

    #[tokio::test]
    async fn test_cache_roundtrip() {
        let resolver = DnsResolver::new(DnsConfig {
            use_system_dns: false,
            ..DnsConfig::default()
        })
        .unwrap();
        resolver.cache_address("node.example", Ipv4Addr::new(192, 0, 2, 1));
        assert_eq!(
            resolver.resolve_ipv4("Node.Example.").await.unwrap(),
            Ipv4Addr::new(192, 0, 2, 1)
        );

        resolver.clear_cache();
        assert!(resolver.get_cached("node.example").is_none());
    }
}
