use anyhow::{Context, Result};
use dotenvy::dotenv;
use std::env;
use std::str::FromStr;
use std::time::Duration;

/// Which job store backs the service.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StoreBackend {
    Postgres,
    /// Process-local store; jobs are lost on restart
    Memory,
}

/// Application configuration loaded from environment variables
#[derive(Debug, Clone)]
pub struct Config {
    pub port: u16,
    /// `APP_ENV=production` tightens store transport policy
    pub production: bool,
    pub backend: StoreBackend,
    pub store: StoreConfig,
    pub queues: QueueConfig,
    pub cache: CacheConfig,
    pub poll: PollConfig,
    pub tutor: TutorConfig,
}

/// Connection settings for the shared state store.
#[derive(Debug, Clone)]
pub struct StoreConfig {
    pub database_url: String,
    pub production: bool,
    /// Host patterns (`*.example.com` or exact) that always require TLS
    pub tls_hosts: Vec<String>,
    pub max_connections: u32,
    pub connect_timeout: Duration,
    pub ping_timeout: Duration,
    pub heartbeat_interval: Duration,
    pub max_retries: u32,
    pub backoff_base: Duration,
    pub backoff_cap: Duration,
    pub dns_ttl: Duration,
    pub dns_negative_ttl: Duration,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            database_url: "postgres://localhost:5432/tutor_jobs".to_string(),
            production: false,
            tls_hosts: Vec::new(),
            max_connections: 10,
            connect_timeout: Duration::from_secs(10),
            ping_timeout: Duration::from_secs(2),
            heartbeat_interval: Duration::from_secs(30),
            max_retries: 5,
            backoff_base: Duration::from_millis(200),
            backoff_cap: Duration::from_secs(10),
            dns_ttl: Duration::from_secs(60),
            dns_negative_ttl: Duration::from_secs(5),
        }
    }
}

#[derive(Debug, Clone)]
pub struct QueueConfig {
    pub interactive_concurrency: usize,
    pub background_concurrency: usize,
    pub max_attempts: i32,
    pub retention_completed: Duration,
    pub retention_failed: Duration,
    pub sweep_interval: Duration,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            interactive_concurrency: 8,
            background_concurrency: 1,
            max_attempts: 3,
            retention_completed: Duration::from_secs(60 * 60),
            retention_failed: Duration::from_secs(7 * 24 * 60 * 60),
            sweep_interval: Duration::from_secs(60),
        }
    }
}

#[derive(Debug, Clone)]
pub struct CacheConfig {
    pub soft_ttl: Duration,
    pub hard_ttl: Duration,
    pub capacity: usize,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            soft_ttl: Duration::from_secs(30),
            hard_ttl: Duration::from_secs(10 * 60),
            capacity: 10_000,
        }
    }
}

/// Negative-cache settings for polls of ids that are not in any queue.
#[derive(Debug, Clone)]
pub struct PollConfig {
    pub missing_ttl: Duration,
    /// Polls within `missing_ttl` before a missing id is reported gone. 0 disables.
    pub missing_threshold: u32,
    /// Most missing ids tracked at once; the oldest is dropped beyond this
    pub missing_capacity: usize,
}

impl Default for PollConfig {
    fn default() -> Self {
        Self {
            missing_ttl: Duration::from_secs(120),
            missing_threshold: 5,
            missing_capacity: 10_000,
        }
    }
}

#[derive(Debug, Clone)]
pub struct TutorConfig {
    pub base_url: String,
    pub api_key: Option<String>,
    pub model: String,
}

impl Default for TutorConfig {
    fn default() -> Self {
        Self {
            base_url: "https://api.openai.com/v1".to_string(),
            api_key: None,
            model: "gpt-4o-mini".to_string(),
        }
    }
}

impl Config {
    /// Load configuration from environment variables
    pub fn from_env() -> Result<Self> {
        // Load .env file if present (development)
        let _ = dotenv();

        let production = env::var("APP_ENV")
            .map(|v| v.eq_ignore_ascii_case("production"))
            .unwrap_or(false);

        let backend = match env::var("JOB_STORE").as_deref() {
            Ok("memory") => StoreBackend::Memory,
            Ok("postgres") | Err(_) => StoreBackend::Postgres,
            Ok(other) => anyhow::bail!("JOB_STORE must be `postgres` or `memory`, got `{other}`"),
        };

        let store_defaults = StoreConfig::default();
        let database_url = match backend {
            StoreBackend::Postgres => env::var("DATABASE_URL").context("DATABASE_URL must be set")?,
            StoreBackend::Memory => {
                env::var("DATABASE_URL").unwrap_or(store_defaults.database_url.clone())
            }
        };

        let store = StoreConfig {
            database_url,
            production,
            tls_hosts: env::var("STORE_TLS_HOSTS")
                .map(|hosts| {
                    hosts
                        .split(',')
                        .map(str::trim)
                        .filter(|h| !h.is_empty())
                        .map(String::from)
                        .collect()
                })
                .unwrap_or_default(),
            max_connections: env_or("STORE_MAX_CONNECTIONS", store_defaults.max_connections)?,
            connect_timeout: millis_or("STORE_CONNECT_TIMEOUT_MS", store_defaults.connect_timeout)?,
            ping_timeout: millis_or("STORE_PING_TIMEOUT_MS", store_defaults.ping_timeout)?,
            heartbeat_interval: secs_or("STORE_HEARTBEAT_SECS", store_defaults.heartbeat_interval)?,
            max_retries: env_or("STORE_MAX_RETRIES", store_defaults.max_retries)?,
            backoff_base: millis_or("STORE_BACKOFF_BASE_MS", store_defaults.backoff_base)?,
            backoff_cap: millis_or("STORE_BACKOFF_CAP_MS", store_defaults.backoff_cap)?,
            dns_ttl: secs_or("DNS_CACHE_TTL_SECS", store_defaults.dns_ttl)?,
            dns_negative_ttl: secs_or("DNS_NEGATIVE_TTL_SECS", store_defaults.dns_negative_ttl)?,
        };

        let queue_defaults = QueueConfig::default();
        let queues = QueueConfig {
            interactive_concurrency: env_or(
                "INTERACTIVE_CONCURRENCY",
                queue_defaults.interactive_concurrency,
            )?,
            background_concurrency: env_or(
                "BACKGROUND_CONCURRENCY",
                queue_defaults.background_concurrency,
            )?,
            max_attempts: env_or("JOB_MAX_ATTEMPTS", queue_defaults.max_attempts)?,
            retention_completed: secs_or(
                "RETENTION_COMPLETED_SECS",
                queue_defaults.retention_completed,
            )?,
            retention_failed: secs_or("RETENTION_FAILED_SECS", queue_defaults.retention_failed)?,
            sweep_interval: queue_defaults.sweep_interval,
        };

        let cache_defaults = CacheConfig::default();
        let cache = CacheConfig {
            soft_ttl: secs_or("RESULT_CACHE_SOFT_TTL_SECS", cache_defaults.soft_ttl)?,
            hard_ttl: secs_or("RESULT_CACHE_HARD_TTL_SECS", cache_defaults.hard_ttl)?,
            capacity: cache_defaults.capacity,
        };

        let poll_defaults = PollConfig::default();
        let poll = PollConfig {
            missing_ttl: secs_or("MISSING_TTL_SECS", poll_defaults.missing_ttl)?,
            missing_threshold: env_or("MISSING_THRESHOLD", poll_defaults.missing_threshold)?,
            missing_capacity: env_or("MISSING_CAPACITY", poll_defaults.missing_capacity)?,
        };

        let tutor_defaults = TutorConfig::default();
        let tutor = TutorConfig {
            base_url: env::var("TUTOR_API_BASE_URL").unwrap_or(tutor_defaults.base_url),
            api_key: env::var("TUTOR_API_KEY").ok(),
            model: env::var("TUTOR_MODEL").unwrap_or(tutor_defaults.model),
        };

        Ok(Self {
            port: env::var("PORT")
                .unwrap_or_else(|_| "8080".to_string())
                .parse()
                .context("PORT must be a valid number")?,
            production,
            backend,
            store,
            queues,
            cache,
            poll,
            tutor,
        })
    }
}

fn env_or<T>(key: &str, default: T) -> Result<T>
where
    T: FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    match env::var(key) {
        Ok(raw) => raw
            .trim()
            .parse()
            .with_context(|| format!("{key} must be a valid number")),
        Err(_) => Ok(default),
    }
}

fn secs_or(key: &str, default: Duration) -> Result<Duration> {
    env_or(key, default.as_secs()).map(Duration::from_secs)
}

fn millis_or(key: &str, default: Duration) -> Result<Duration> {
    env_or(key, default.as_millis() as u64).map(Duration::from_millis)
}
