//! Host resolution with positive and negative caching.
//!
//! Successful lookups are cached for `ttl`, failed lookups for
//! `negative_ttl`, so a flapping resolver is not hammered on every
//! reconnect. IPv4 addresses are preferred when both families resolve.

use std::collections::HashMap;
use std::io;
use std::net::IpAddr;
use std::sync::{Arc, RwLock};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use tracing::debug;

/// Something that can turn a hostname into addresses.
#[async_trait]
pub trait Resolve: Send + Sync {
    async fn lookup(&self, host: &str, port: u16) -> io::Result<Vec<IpAddr>>;
}

/// Resolver backed by the operating system (`getaddrinfo` via tokio).
pub struct SystemResolver;

#[async_trait]
impl Resolve for SystemResolver {
    async fn lookup(&self, host: &str, port: u16) -> io::Result<Vec<IpAddr>> {
        let addrs = tokio::net::lookup_host((host, port)).await?;
        Ok(addrs.map(|addr| addr.ip()).collect())
    }
}

#[derive(Debug, Clone)]
enum Cached {
    Hit(IpAddr),
    Miss(String),
}

#[derive(Debug, Clone)]
struct DnsEntry {
    value: Cached,
    expires_at: Instant,
}

pub struct DnsCache {
    resolver: Arc<dyn Resolve>,
    ttl: Duration,
    negative_ttl: Duration,
    entries: RwLock<HashMap<String, DnsEntry>>,
}

impl DnsCache {
    pub fn new(ttl: Duration, negative_ttl: Duration) -> Self {
        Self::with_resolver(Arc::new(SystemResolver), ttl, negative_ttl)
    }

    pub fn with_resolver(resolver: Arc<dyn Resolve>, ttl: Duration, negative_ttl: Duration) -> Self {
        Self {
            resolver,
            ttl,
            negative_ttl,
            entries: RwLock::new(HashMap::new()),
        }
    }

    pub async fn resolve(&self, host: &str, port: u16) -> io::Result<IpAddr> {
        self.resolve_at(host, port, Instant::now()).await
    }

    pub async fn resolve_at(&self, host: &str, port: u16, now: Instant) -> io::Result<IpAddr> {
        if let Ok(ip) = host.parse::<IpAddr>() {
            return Ok(ip);
        }

        if let Some(cached) = self.cached(host, now) {
            return match cached {
                Cached::Hit(ip) => Ok(ip),
                Cached::Miss(reason) => Err(io::Error::new(io::ErrorKind::NotFound, reason)),
            };
        }

        let looked_up = self.resolver.lookup(host, port).await;
        let (value, ttl) = match &looked_up {
            Ok(addrs) => match prefer_ipv4(addrs) {
                Some(ip) => (Cached::Hit(ip), self.ttl),
                None => (Cached::Miss(format!("no addresses for {host}")), self.negative_ttl),
            },
            Err(e) => (Cached::Miss(e.to_string()), self.negative_ttl),
        };

        debug!(host, ?value, ttl_ms = ttl.as_millis() as u64, "dns lookup cached");

        let mut entries = self.entries.write().unwrap_or_else(|e| e.into_inner());
        entries.insert(
            host.to_string(),
            DnsEntry {
                value: value.clone(),
                expires_at: now + ttl,
            },
        );

        match value {
            Cached::Hit(ip) => Ok(ip),
            Cached::Miss(reason) => Err(io::Error::new(io::ErrorKind::NotFound, reason)),
        }
    }

    /// Drop a cached entry, e.g. after the address stopped accepting connections.
    pub fn invalidate(&self, host: &str) {
        let mut entries = self.entries.write().unwrap_or_else(|e| e.into_inner());
        entries.remove(host);
    }

    fn cached(&self, host: &str, now: Instant) -> Option<Cached> {
        let entries = self.entries.read().unwrap_or_else(|e| e.into_inner());
        entries
            .get(host)
            .filter(|entry| entry.expires_at > now)
            .map(|entry| entry.value.clone())
    }
}

fn prefer_ipv4(addrs: &[IpAddr]) -> Option<IpAddr> {
    addrs
        .iter()
        .find(|ip| ip.is_ipv4())
        .or_else(|| addrs.first())
        .copied()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::{Ipv4Addr, Ipv6Addr};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;

    struct ScriptedResolver {
        calls: AtomicUsize,
        answers: Mutex<Vec<io::Result<Vec<IpAddr>>>>,
    }

    impl ScriptedResolver {
        fn new(answers: Vec<io::Result<Vec<IpAddr>>>) -> Arc<Self> {
            Arc::new(Self {
                calls: AtomicUsize::new(0),
                answers: Mutex::new(answers),
            })
        }
    }

    #[async_trait]
    impl Resolve for ScriptedResolver {
        async fn lookup(&self, _host: &str, _port: u16) -> io::Result<Vec<IpAddr>> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.answers.lock().unwrap().remove(0)
        }
    }

    const V4: IpAddr = IpAddr::V4(Ipv4Addr::new(10, 0, 0, 7));
    const V6: IpAddr = IpAddr::V6(Ipv6Addr::LOCALHOST);

    #[tokio::test]
    async fn prefers_ipv4_and_caches_hits() {
        let resolver = ScriptedResolver::new(vec![Ok(vec![V6, V4])]);
        let cache =
            DnsCache::with_resolver(resolver.clone(), Duration::from_secs(60), Duration::from_secs(5));
        let now = Instant::now();

        assert_eq!(cache.resolve_at("db.internal", 5432, now).await.unwrap(), V4);
        assert_eq!(
            cache
                .resolve_at("db.internal", 5432, now + Duration::from_secs(30))
                .await
                .unwrap(),
            V4
        );
        assert_eq!(resolver.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn negative_entries_expire_sooner() {
        let resolver = ScriptedResolver::new(vec![
            Err(io::Error::new(io::ErrorKind::Other, "servfail")),
            Ok(vec![V4]),
        ]);
        let cache =
            DnsCache::with_resolver(resolver.clone(), Duration::from_secs(60), Duration::from_secs(5));
        let now = Instant::now();

        assert!(cache.resolve_at("db.internal", 5432, now).await.is_err());
        // Still inside the negative TTL: no new lookup
        assert!(cache
            .resolve_at("db.internal", 5432, now + Duration::from_secs(2))
            .await
            .is_err());
        assert_eq!(resolver.calls.load(Ordering::SeqCst), 1);

        let ip = cache
            .resolve_at("db.internal", 5432, now + Duration::from_secs(6))
            .await
            .unwrap();
        assert_eq!(ip, V4);
        assert_eq!(resolver.calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn ip_literals_skip_lookup() {
        let resolver = ScriptedResolver::new(vec![]);
        let cache =
            DnsCache::with_resolver(resolver.clone(), Duration::from_secs(60), Duration::from_secs(5));

        let ip = cache.resolve("127.0.0.1", 5432).await.unwrap();
        assert_eq!(ip, IpAddr::V4(Ipv4Addr::LOCALHOST));
        assert_eq!(resolver.calls.load(Ordering::SeqCst), 0);
    }
}
