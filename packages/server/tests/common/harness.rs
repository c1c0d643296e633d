//! Test harness with testcontainers for store integration testing.
//!
//! Uses one shared Postgres container per test binary, started on the first
//! test. Each harness gets its own freshly migrated database so tests that
//! claim or pause queues cannot see each other's jobs.

use anyhow::{Context, Result};
use sqlx::PgPool;
use std::sync::Arc;
use test_context::AsyncTestContext;
use testcontainers::runners::AsyncRunner;
use testcontainers::{ContainerAsync, ImageExt};
use testcontainers_modules::postgres::Postgres;
use tokio::sync::OnceCell;
use tutor_jobs::kernel::jobs::testing::StubHandlers;
use tutor_jobs::kernel::{ConnectionManager, JobsKernel, JobsSettings, PostgresJobStore};
use tutor_jobs::StoreConfig;
use uuid::Uuid;

/// Shared test infrastructure that persists across all tests.
struct SharedTestInfra {
    /// Server URL without a database name
    server_url: String,
    // Keep the container alive for the entire test run
    _postgres: ContainerAsync<Postgres>,
}

static SHARED_INFRA: OnceCell<SharedTestInfra> = OnceCell::const_new();

impl SharedTestInfra {
    async fn init() -> Result<Self> {
        // Run tests with: RUST_LOG=debug cargo test -- --nocapture
        let _ = tracing_subscriber::fmt()
            .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
            .with_test_writer()
            .try_init();

        let postgres = Postgres::default()
            .with_tag("16")
            .start()
            .await
            .context("Failed to start Postgres container")?;

        let pg_host = postgres.get_host().await?;
        let pg_port = postgres.get_host_port_ipv4(5432).await?;
        let server_url = format!("postgresql://postgres:postgres@{}:{}", pg_host, pg_port);

        Ok(Self {
            server_url,
            _postgres: postgres,
        })
    }

    async fn get() -> &'static Self {
        SHARED_INFRA
            .get_or_init(|| async {
                Self::init()
                    .await
                    .expect("Failed to initialize shared test infrastructure")
            })
            .await
    }
}

/// Test harness backed by a real Postgres job store.
///
/// Every harness owns an isolated database on the shared container.
///
/// ```ignore
/// use test_context::test_context;
///
/// #[test_context(TestHarness)]
/// #[tokio::test]
/// async fn my_test(ctx: &TestHarness) {
///     let probe = ctx.store.probe().await;
/// }
/// ```
pub struct TestHarness {
    pub connections: Arc<ConnectionManager>,
    pub store: Arc<PostgresJobStore>,
    /// Direct pool for assertions and fixture tweaks
    pub db_pool: PgPool,
}

impl AsyncTestContext for TestHarness {
    async fn setup() -> Self {
        Self::new().await.expect("Failed to create test harness")
    }

    async fn teardown(self) {
        self.connections.close().await;
    }
}

impl TestHarness {
    pub async fn new() -> Result<Self> {
        let infra = SharedTestInfra::get().await;

        let db_name = format!("jobs_{}", Uuid::new_v4().simple());
        let admin = PgPool::connect(&format!("{}/postgres", infra.server_url))
            .await
            .context("Failed to connect to Postgres")?;
        sqlx::query(&format!("CREATE DATABASE {db_name}"))
            .execute(&admin)
            .await
            .context("Failed to create test database")?;
        admin.close().await;

        let connections = Arc::new(ConnectionManager::new(StoreConfig {
            database_url: format!("{}/{}", infra.server_url, db_name),
            max_connections: 5,
            ..StoreConfig::default()
        }));
        let db_pool = connections
            .get_connection()
            .await
            .context("Failed to connect to test database")?;

        sqlx::migrate!("./migrations")
            .run(&db_pool)
            .await
            .context("Failed to run migrations")?;

        Ok(Self {
            store: Arc::new(PostgresJobStore::new(connections.clone())),
            connections,
            db_pool,
        })
    }

    /// A kernel over this harness's store with stub handlers.
    pub fn kernel(&self, settings: JobsSettings) -> JobsKernel {
        JobsKernel::new(self.store.clone(), Arc::new(StubHandlers::new()), settings)
    }
}
