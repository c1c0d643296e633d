//! Lazily established, shared connection to the state store.
//!
//! The first caller of [`ConnectionManager::get_connection`] starts the
//! connect sequence; concurrent callers wait on the same attempt. Once a
//! pool is ready it is reused for the life of the process and a heartbeat
//! task keeps watch over it, following the store's address through the DNS
//! cache. A failed attempt is not remembered, so the next caller starts over.

use std::net::IpAddr;
use std::str::FromStr;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use rand::Rng;
use sqlx::postgres::{PgConnectOptions, PgPoolOptions, PgSslMode};
use sqlx::PgPool;
use tokio::sync::OnceCell;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use url::Url;

use super::dns::DnsCache;
use crate::config::StoreConfig;
use crate::kernel::jobs::{ConnectivityProbe, StoreError};

/// Where the store lives and whether the transport must be encrypted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoreTarget {
    pub host: String,
    pub port: u16,
    pub tls: bool,
}

impl StoreTarget {
    pub fn parse(database_url: &str, tls_hosts: &[String]) -> Result<Self, StoreError> {
        let url = Url::parse(database_url)
            .map_err(|e| StoreError::Config(format!("invalid store url: {e}")))?;

        let host = url
            .host_str()
            .map(|h| h.trim_start_matches('[').trim_end_matches(']').to_string())
            .ok_or_else(|| StoreError::Config("store url has no host".to_string()))?;
        let port = url.port().unwrap_or(5432);

        let ssl_required = url.query_pairs().any(|(key, value)| {
            key == "sslmode" && matches!(value.as_ref(), "require" | "verify-ca" | "verify-full")
        });
        let tls = ssl_required || tls_hosts.iter().any(|pattern| host_matches(pattern, &host));

        Ok(Self { host, port, tls })
    }

    pub fn is_ip_literal(&self) -> bool {
        self.host.parse::<IpAddr>().is_ok()
    }

    /// Production refuses plaintext, and refuses TLS to raw IPs since the
    /// certificate cannot be verified against a hostname.
    pub fn check_policy(&self, production: bool) -> Result<(), StoreError> {
        if !production {
            return Ok(());
        }
        if !self.tls {
            return Err(StoreError::Config(format!(
                "plaintext store connection to {} refused in production",
                self.host
            )));
        }
        if self.is_ip_literal() {
            return Err(StoreError::Config(format!(
                "TLS store connection to raw address {} refused in production",
                self.host
            )));
        }
        Ok(())
    }
}

fn host_matches(pattern: &str, host: &str) -> bool {
    let host = host.to_ascii_lowercase();
    let pattern = pattern.to_ascii_lowercase();
    match pattern.strip_prefix("*.") {
        Some(suffix) => host.len() > suffix.len() && host.ends_with(&format!(".{suffix}")),
        None => host == pattern,
    }
}

/// Delay before reconnect attempt `attempt` (1-based): exponential growth
/// capped at `cap`, with full jitter.
pub fn reconnect_delay(base: Duration, cap: Duration, attempt: u32) -> Duration {
    let exp = base
        .as_millis()
        .saturating_mul(1u128 << attempt.saturating_sub(1).min(20));
    let ceiling = exp.min(cap.as_millis()) as u64;
    Duration::from_millis(rand::rng().random_range(0..=ceiling))
}

pub struct ConnectionManager {
    config: StoreConfig,
    dns: Arc<DnsCache>,
    pool: OnceCell<PgPool>,
    /// Held for the duration of a connect sequence
    connecting: tokio::sync::Mutex<()>,
    /// Bumped each time a connect sequence fails
    failures: AtomicU64,
    last_failure: Mutex<Option<StoreError>>,
    closed: AtomicBool,
    shutdown: CancellationToken,
}

impl ConnectionManager {
    pub fn new(config: StoreConfig) -> Self {
        let dns = DnsCache::new(config.dns_ttl, config.dns_negative_ttl);
        Self::with_dns(config, dns)
    }

    pub fn with_dns(config: StoreConfig, dns: DnsCache) -> Self {
        Self {
            config,
            dns: Arc::new(dns),
            pool: OnceCell::new(),
            connecting: tokio::sync::Mutex::new(()),
            failures: AtomicU64::new(0),
            last_failure: Mutex::new(None),
            closed: AtomicBool::new(false),
            shutdown: CancellationToken::new(),
        }
    }

    /// Get the shared pool, connecting on first use.
    ///
    /// Callers that arrive while a connect sequence is running wait for it
    /// and share its outcome. A caller arriving after a failure starts over.
    pub async fn get_connection(&self) -> Result<PgPool, StoreError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(StoreError::Unavailable("connection manager closed".to_string()));
        }
        if let Some(pool) = self.pool.get() {
            return Ok(pool.clone());
        }

        let seen = self.failures.load(Ordering::SeqCst);
        let _gate = self.connecting.lock().await;

        if let Some(pool) = self.pool.get() {
            return Ok(pool.clone());
        }
        if self.failures.load(Ordering::SeqCst) != seen {
            let shared = self.lock_failure().clone();
            if let Some(err) = shared {
                return Err(err);
            }
        }

        match self.establish().await {
            Ok(pool) => {
                let _ = self.pool.set(pool.clone());
                Ok(pool)
            }
            Err(e) => {
                *self.lock_failure() = Some(e.clone());
                self.failures.fetch_add(1, Ordering::SeqCst);
                Err(e)
            }
        }
    }

    /// Liveness check against the existing pool. Never starts a connection.
    pub async fn probe(&self) -> ConnectivityProbe {
        match self.pool.get() {
            Some(pool) => {
                let started = Instant::now();
                match ping(pool, self.config.ping_timeout).await {
                    Ok(()) => ConnectivityProbe::up(started.elapsed()),
                    Err(e) => ConnectivityProbe::down(e.to_string()),
                }
            }
            None if self.closed.load(Ordering::SeqCst) => ConnectivityProbe::down("closed"),
            None => ConnectivityProbe::down("not connected"),
        }
    }

    /// Stop the heartbeat and close the pool.
    pub async fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
        self.shutdown.cancel();
        if let Some(pool) = self.pool.get() {
            pool.close().await;
            info!("store connection closed");
        }
    }

    fn lock_failure(&self) -> std::sync::MutexGuard<'_, Option<StoreError>> {
        self.last_failure.lock().unwrap_or_else(|e| e.into_inner())
    }

    async fn establish(&self) -> Result<PgPool, StoreError> {
        let target = StoreTarget::parse(&self.config.database_url, &self.config.tls_hosts)?;
        target.check_policy(self.config.production)?;

        let mut attempt = 0u32;
        loop {
            attempt += 1;
            let started = Instant::now();

            match self.connect_once(&target).await {
                Ok((pool, address)) => {
                    info!(
                        host = %target.host,
                        tls = target.tls,
                        attempt,
                        elapsed_ms = started.elapsed().as_millis() as u64,
                        "store connection ready"
                    );
                    self.spawn_heartbeat(pool.clone(), target, address);
                    return Ok(pool);
                }
                Err(e) if attempt > self.config.max_retries => {
                    warn!(host = %target.host, attempt, error = %e, "store connection attempts exhausted");
                    return Err(StoreError::Unavailable(format!(
                        "giving up after {attempt} attempts: {e}"
                    )));
                }
                Err(e) => {
                    let delay = reconnect_delay(self.config.backoff_base, self.config.backoff_cap, attempt);
                    warn!(
                        host = %target.host,
                        attempt,
                        delay_ms = delay.as_millis() as u64,
                        error = %e,
                        "store connection failed, retrying"
                    );
                    if !target.tls {
                        self.dns.invalidate(&target.host);
                    }
                    tokio::select! {
                        _ = self.shutdown.cancelled() => {
                            return Err(StoreError::Unavailable("shutting down".to_string()));
                        }
                        _ = tokio::time::sleep(delay) => {}
                    }
                }
            }
        }
    }

    async fn connect_once(&self, target: &StoreTarget) -> Result<(PgPool, IpAddr), StoreError> {
        let mut options = PgConnectOptions::from_str(&self.config.database_url)
            .map_err(|e| StoreError::Config(format!("invalid store url: {e}")))?;

        let resolved = self
            .dns
            .resolve(&target.host, target.port)
            .await
            .map_err(|e| StoreError::Unavailable(format!("resolve {}: {e}", target.host)))?;

        if target.tls {
            // Keep the hostname so the certificate can be verified against it
            let mode = if self.config.production {
                PgSslMode::VerifyFull
            } else {
                PgSslMode::Require
            };
            options = options.ssl_mode(mode);
        } else {
            options = options.host(&resolved.to_string());
        }

        debug!(host = %target.host, %resolved, "connecting to store");

        let pool = tokio::time::timeout(
            self.config.connect_timeout,
            PgPoolOptions::new()
                .max_connections(self.config.max_connections)
                .acquire_timeout(self.config.connect_timeout)
                .connect_with(options),
        )
        .await
        .map_err(|_| StoreError::Unavailable("connect timed out".to_string()))??;

        if let Err(e) = ping(&pool, self.config.ping_timeout).await {
            pool.close().await;
            return Err(e);
        }

        Ok((pool, resolved))
    }

    /// Ping the pool on an interval. Plaintext targets are re-resolved
    /// through the cache on every tick so a moved store is followed.
    fn spawn_heartbeat(&self, pool: PgPool, target: StoreTarget, address: IpAddr) {
        let interval = self.config.heartbeat_interval;
        let ping_timeout = self.config.ping_timeout;
        let shutdown = self.shutdown.child_token();
        let dns = self.dns.clone();

        tokio::spawn(async move {
            let mut address = address;
            let mut ticker = tokio::time::interval(interval);
            ticker.tick().await;

            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    _ = ticker.tick() => {
                        if let Err(e) = ping(&pool, ping_timeout).await {
                            warn!(error = %e, "store heartbeat failed");
                            dns.invalidate(&target.host);
                        }
                        if !target.tls {
                            address = repoint(&dns, &pool, &target, address).await;
                        }
                    }
                }
            }

            debug!("store heartbeat stopped");
        });
    }
}

/// Resolve a plaintext target again and aim new pool connections at the
/// answer. Open connections to the old address are dropped by the pool as
/// they fail. Returns the address now in use.
async fn repoint(dns: &DnsCache, pool: &PgPool, target: &StoreTarget, current: IpAddr) -> IpAddr {
    match dns.resolve(&target.host, target.port).await {
        Ok(ip) if ip != current => {
            info!(host = %target.host, from = %current, to = %ip, "store address changed");
            let options = (*pool.connect_options()).clone().host(&ip.to_string());
            pool.set_connect_options(options);
            ip
        }
        Ok(_) => current,
        Err(e) => {
            warn!(host = %target.host, error = %e, "store re-resolution failed");
            current
        }
    }
}

async fn ping(pool: &PgPool, timeout: Duration) -> Result<(), StoreError> {
    match tokio::time::timeout(timeout, sqlx::query("SELECT 1").execute(pool)).await {
        Ok(Ok(_)) => Ok(()),
        Ok(Err(e)) => Err(e.into()),
        Err(_) => Err(StoreError::Unavailable(format!(
            "ping timed out after {}ms",
            timeout.as_millis()
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kernel::store::Resolve;
    use async_trait::async_trait;
    use std::io;
    use std::net::Ipv4Addr;
    use std::sync::atomic::AtomicUsize;

    /// Counts lookups and answers after a short delay.
    struct CountingResolver {
        calls: AtomicUsize,
        answer: Option<IpAddr>,
    }

    impl CountingResolver {
        fn new(answer: Option<IpAddr>) -> Arc<Self> {
            Arc::new(Self {
                calls: AtomicUsize::new(0),
                answer,
            })
        }

        fn calls(&self) -> usize {
            self.calls.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl Resolve for CountingResolver {
        async fn lookup(&self, host: &str, _port: u16) -> io::Result<Vec<IpAddr>> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            tokio::time::sleep(Duration::from_millis(20)).await;
            match self.answer {
                Some(ip) => Ok(vec![ip]),
                None => Err(io::Error::new(io::ErrorKind::NotFound, format!("{host}: nxdomain"))),
            }
        }
    }

    const OLD: IpAddr = IpAddr::V4(Ipv4Addr::new(10, 0, 0, 7));
    const NEW: IpAddr = IpAddr::V4(Ipv4Addr::new(10, 0, 0, 9));

    #[test]
    fn sslmode_require_means_tls() {
        let target =
            StoreTarget::parse("postgres://u:p@db.internal:6543/jobs?sslmode=require", &[]).unwrap();
        assert!(target.tls);
        assert_eq!(target.port, 6543);
        assert_eq!(target.host, "db.internal");
    }

    #[test]
    fn allowlisted_suffix_means_tls() {
        let hosts = vec!["*.db.example.com".to_string()];
        let target = StoreTarget::parse("postgres://u:p@primary.db.example.com/jobs", &hosts).unwrap();
        assert!(target.tls);

        let bare = StoreTarget::parse("postgres://u:p@db.example.com/jobs", &hosts).unwrap();
        assert!(!bare.tls);
    }

    #[test]
    fn production_refuses_plaintext() {
        let target = StoreTarget::parse("postgres://u:p@db.internal/jobs", &[]).unwrap();
        assert!(target.check_policy(false).is_ok());
        assert!(matches!(target.check_policy(true), Err(StoreError::Config(_))));
    }

    #[test]
    fn production_refuses_tls_to_raw_ip() {
        let target =
            StoreTarget::parse("postgres://u:p@10.1.2.3/jobs?sslmode=verify-full", &[]).unwrap();
        assert!(target.is_ip_literal());
        assert!(matches!(target.check_policy(true), Err(StoreError::Config(_))));
    }

    #[test]
    fn production_accepts_tls_hostname() {
        let target =
            StoreTarget::parse("postgres://u:p@db.example.com/jobs?sslmode=require", &[]).unwrap();
        assert!(target.check_policy(true).is_ok());
    }

    #[test]
    fn reconnect_delay_stays_under_cap() {
        let base = Duration::from_millis(100);
        let cap = Duration::from_millis(1_000);
        for attempt in 1..40 {
            assert!(reconnect_delay(base, cap, attempt) <= cap);
        }
        assert!(reconnect_delay(base, cap, 1) <= base);
    }

    #[tokio::test]
    async fn probe_does_not_connect() {
        let manager = ConnectionManager::new(StoreConfig::default());
        let probe = manager.probe().await;
        assert!(!probe.ok);
        assert_eq!(probe.error.as_deref(), Some("not connected"));
    }

    #[tokio::test]
    async fn policy_violation_fails_without_retrying() {
        let manager = Arc::new(ConnectionManager::new(StoreConfig {
            database_url: "postgres://u:p@db.internal/jobs".to_string(),
            production: true,
            ..StoreConfig::default()
        }));

        let err = manager.get_connection().await.unwrap_err();
        assert!(matches!(err, StoreError::Config(_)));
    }

    #[tokio::test]
    async fn concurrent_first_callers_share_one_attempt() {
        let resolver = CountingResolver::new(None);
        let dns = DnsCache::with_resolver(resolver.clone(), Duration::from_secs(60), Duration::ZERO);
        let manager = ConnectionManager::with_dns(
            StoreConfig {
                database_url: "postgres://u:p@db.internal/jobs".to_string(),
                max_retries: 0,
                ..StoreConfig::default()
            },
            dns,
        );

        let results =
            futures::future::join_all((0..5).map(|_| manager.get_connection())).await;

        assert_eq!(resolver.calls(), 1);
        assert!(results.iter().all(|r| matches!(r, Err(e) if e.is_unavailable())));

        // The failure is not remembered for callers that arrive afterwards
        assert!(manager.get_connection().await.is_err());
        assert_eq!(resolver.calls(), 2);
    }

    #[tokio::test]
    async fn repoint_follows_a_moved_store() {
        let resolver = CountingResolver::new(Some(NEW));
        let dns = DnsCache::with_resolver(resolver.clone(), Duration::from_secs(60), Duration::ZERO);
        let target = StoreTarget::parse("postgres://u:p@db.internal/jobs", &[]).unwrap();
        let pool = PgPoolOptions::new()
            .connect_lazy_with(PgConnectOptions::new().host(&OLD.to_string()).port(5432));

        let address = repoint(&dns, &pool, &target, OLD).await;
        assert_eq!(address, NEW);
        assert_eq!(pool.connect_options().get_host(), NEW.to_string());

        // Unchanged answer leaves the pool alone
        assert_eq!(repoint(&dns, &pool, &target, NEW).await, NEW);
        assert_eq!(resolver.calls(), 1);
    }

    #[tokio::test]
    async fn failed_re_resolution_keeps_the_current_address() {
        let resolver = CountingResolver::new(None);
        let dns = DnsCache::with_resolver(resolver, Duration::from_secs(60), Duration::ZERO);
        let target = StoreTarget::parse("postgres://u:p@db.internal/jobs", &[]).unwrap();
        let pool = PgPoolOptions::new()
            .connect_lazy_with(PgConnectOptions::new().host(&OLD.to_string()).port(5432));

        assert_eq!(repoint(&dns, &pool, &target, OLD).await, OLD);
        assert_eq!(pool.connect_options().get_host(), OLD.to_string());
    }

    #[tokio::test]
    async fn closed_manager_is_unavailable() {
        let manager = Arc::new(ConnectionManager::new(StoreConfig::default()));
        manager.close().await;

        let err = manager.get_connection().await.unwrap_err();
        assert!(err.is_unavailable());
    }
}
