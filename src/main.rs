use idempotency_coordinator::config::{Settings, StoreBackend};
use idempotency_coordinator::error::AppError;
use idempotency_coordinator::idempotency::{
    IdempotencyCleanupJob, IdempotencyCoordinator, IdempotencyStore, InMemoryIdempotencyStore,
    PostgresIdempotencyStore, RedisIdempotencyStore, RequestFingerprinter,
};
use idempotency_coordinator::observability::{init_logging, init_metrics, HealthChecker};
use serde_json::json;
use sqlx::postgres::PgPoolOptions;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};
use uuid::Uuid;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    dotenvy::dotenv().ok();

    // Load configuration
    let settings = Settings::new()?;
    init_logging(&settings.logging.to_log_config())?;
    info!("Configuration loaded");

    if let Err(e) = init_metrics() {
        warn!("Prometheus recorder not installed: {}", e);
    }

    let store = connect_store(&settings).await?;

    let health = HealthChecker::new(Arc::clone(&store)).check_all().await;
    if health.status.is_unhealthy() {
        return Err(format!("Idempotency store is unhealthy: {:?}", health.dependencies).into());
    }
    info!("Store {} is {:?}", store.backend_name(), health.status);

    let coordinator = Arc::new(
        IdempotencyCoordinator::new(Arc::clone(&store), settings.coordinator.to_config()?)
            .with_fingerprinter(RequestFingerprinter::new(
                settings.coordinator.fingerprint_config(),
            )),
    );

    verify_at_most_once(&coordinator).await?;
    info!("System startup verification complete: idempotency path healthy.");

    if settings.cleanup.enabled {
        IdempotencyCleanupJob::new(
            Arc::clone(&coordinator),
            Duration::from_secs(settings.cleanup.interval_seconds.max(1)),
        )
        .start();
        info!("Cleanup job scheduled every {}s", settings.cleanup.interval_seconds);
    }

    tokio::signal::ctrl_c().await?;
    info!("Shutting down, stats: {:?}", coordinator.stats());

    Ok(())
}

async fn connect_store(
    settings: &Settings,
) -> Result<Arc<dyn IdempotencyStore>, Box<dyn std::error::Error>> {
    match settings.store.backend {
        StoreBackend::Memory => {
            warn!("Using in-memory store: guarantees hold within this process only");
            Ok(Arc::new(InMemoryIdempotencyStore::new()))
        }
        StoreBackend::Postgres => {
            let database = settings
                .database
                .as_ref()
                .ok_or("store.backend = postgres requires a [database] section")?;

            info!("Connecting to database...");
            let pool = PgPoolOptions::new()
                .max_connections(database.pool_size)
                .acquire_timeout(Duration::from_secs(5))
                .connect(&database.url)
                .await?;

            info!("Running database migrations...");
            sqlx::migrate!("./migrations").run(&pool).await?;
            info!("Migrations applied successfully");

            Ok(Arc::new(PostgresIdempotencyStore::new(pool)))
        }
        StoreBackend::Redis => {
            let redis_settings = settings
                .redis
                .as_ref()
                .ok_or("store.backend = redis requires a [redis] section")?;

            info!("Connecting to Redis...");
            let client = redis::Client::open(redis_settings.url.as_str())?;
            Ok(Arc::new(RedisIdempotencyStore::new(
                client,
                redis_settings.key_prefix.clone(),
            )))
        }
    }
}

/// Runs one probe operation twice under the same key and checks that the
/// second call replays instead of executing.
async fn verify_at_most_once(coordinator: &IdempotencyCoordinator) -> Result<(), AppError> {
    let key = format!("startup-probe-{}", Uuid::new_v4());
    let request = json!({ "probe": true });
    let executions = AtomicUsize::new(0);

    for _ in 0..2 {
        let probe: serde_json::Value = coordinator
            .execute_request(&key, &request, || async {
                executions.fetch_add(1, Ordering::SeqCst);
                Ok(json!({ "probeId": Uuid::new_v4() }))
            })
            .await?;
        info!("Probe returned {}", probe);
    }

    match executions.load(Ordering::SeqCst) {
        1 => Ok(()),
        n => Err(AppError::Internal(anyhow::anyhow!(
            "Probe operation executed {} times for one key",
            n
        ))),
    }
}
