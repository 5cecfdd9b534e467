//! TTL-caching DNS resolver used by [`crate::socket::Socket::connect`] when
//! the host to connect to isn't already a literal address.
use std::collections::HashMap;
use std::net::IpAddr;
use std::sync::Mutex;

use trust_dns_resolver::config::{ResolverConfig, ResolverOpts};
use trust_dns_resolver::TokioAsyncResolver;

use crate::error::Error;
use crate::time::{LocalDuration, LocalTime};

/// How long a resolved name is trusted before a fresh lookup is issued.
pub const DEFAULT_TTL: LocalDuration = LocalDuration::from_secs(60);

struct Entry {
    addrs: Vec<IpAddr>,
    created: LocalTime,
}

/// Caches `host -> [IpAddr]` for [`DEFAULT_TTL`], so a service resolving the
/// same handful of peers repeatedly doesn't pay a lookup every time.
pub struct DnsCache {
    resolver: TokioAsyncResolver,
    ttl: LocalDuration,
    entries: Mutex<HashMap<String, Entry>>,
}

impl DnsCache {
    pub fn new() -> Self {
        Self::with_ttl(DEFAULT_TTL)
    }

    pub fn with_ttl(ttl: LocalDuration) -> Self {
        Self {
            resolver: TokioAsyncResolver::tokio(ResolverConfig::default(), ResolverOpts::default()),
            ttl,
            entries: Mutex::new(HashMap::new()),
        }
    }

    /// Resolve `host`, consulting (and refreshing) the cache.
    ///
    /// Literal addresses should be short-circuited by the caller before
    /// reaching this method; `connect` checks with [`str::parse`] first so a
    /// socket never needs a worker-pool round trip to dial a bare IP.
    pub async fn resolve(&self, host: &str) -> Result<Vec<IpAddr>, Error> {
        if let Some(hit) = self.cached(host) {
            return Ok(hit);
        }

        let response = self
            .resolver
            .lookup_ip(host)
            .await
            .map_err(|source| Error::Dns {
                host: host.to_string(),
                source,
            })?;
        let addrs: Vec<IpAddr> = response.iter().collect();

        self.entries.lock().unwrap().insert(
            host.to_string(),
            Entry {
                addrs: addrs.clone(),
                created: LocalTime::now(),
            },
        );
        Ok(addrs)
    }

    fn cached(&self, host: &str) -> Option<Vec<IpAddr>> {
        let entries = self.entries.lock().unwrap();
        let entry = entries.get(host)?;
        if LocalTime::now().duration_since(entry.created) > self.ttl {
            return None;
        }
        Some(entry.addrs.clone())
    }
}

impl Default for DnsCache {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fresh_cache_has_no_entries() {
        let cache = DnsCache::new();
        assert!(cache.cached("example.com").is_none());
    }
}
