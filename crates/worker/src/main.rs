#![cfg_attr(test, allow(clippy::unwrap_used))]

//! Auth Sandbox Background Worker
//!
//! Handles scheduled maintenance jobs:
//! - Expired verification cleanup (hourly)
//! - Dead session cleanup (every 15 minutes)
//! - Heartbeat (every 5 minutes)

use std::sync::Arc;
use std::time::Duration;

use authsandbox_api::store::{CredentialStore, PgCredentialStore, StoreResult};
use authsandbox_shared::create_pool;
use time::OffsetDateTime;
use tokio_cron_scheduler::{Job, JobScheduler};
use tracing::{error, info};

/// Matches the API default
const DEFAULT_VERIFICATION_CODE_TTL: u64 = 24 * 3600;

fn verification_code_ttl() -> anyhow::Result<u64> {
    match std::env::var("VERIFICATION_CODE_TTL") {
        Ok(raw) => raw
            .trim()
            .parse()
            .map_err(|_| anyhow::anyhow!("VERIFICATION_CODE_TTL must be whole seconds, got {raw:?}")),
        Err(_) => Ok(DEFAULT_VERIFICATION_CODE_TTL),
    }
}

/// Remove pending verifications older than `ttl_secs` together with their
/// unverified accounts. A TTL of zero means codes never expire.
async fn purge_verifications(
    store: &dyn CredentialStore,
    ttl_secs: u64,
    now: OffsetDateTime,
) -> StoreResult<u64> {
    if ttl_secs == 0 {
        return Ok(0);
    }
    let ttl = time::Duration::seconds(i64::try_from(ttl_secs).unwrap_or(i64::MAX));
    store
        .purge_expired_verifications(now.saturating_sub(ttl))
        .await
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    // Load environment
    dotenvy::dotenv().ok();

    info!("Starting Auth Sandbox Worker");

    let database_url = std::env::var("DATABASE_URL")
        .map_err(|_| anyhow::anyhow!("DATABASE_URL must be set for the worker"))?;
    let verification_ttl = verification_code_ttl()?;

    let pool = create_pool(&database_url).await?;
    info!("Database pool created");
    let store: Arc<dyn CredentialStore> = Arc::new(PgCredentialStore::new(pool));

    let scheduler = JobScheduler::new().await?;
    let mut job_count = 0;

    // Job 1: Expired verification cleanup (hourly, on the hour)
    if verification_ttl > 0 {
        let verification_store = store.clone();
        scheduler
            .add(Job::new_async("0 0 * * * *", move |_uuid, _l| {
                let store = verification_store.clone();
                Box::pin(async move {
                    let now = OffsetDateTime::now_utc();
                    match purge_verifications(store.as_ref(), verification_ttl, now).await {
                        Ok(removed) => {
                            info!(removed = removed, "Expired verification cleanup complete")
                        }
                        Err(e) => error!(error = %e, "Expired verification cleanup failed"),
                    }
                })
            })?)
            .await?;
        job_count += 1;
        info!(
            ttl_secs = verification_ttl,
            "Scheduled: Expired verification cleanup (hourly)"
        );
    } else {
        info!("Verification codes never expire (VERIFICATION_CODE_TTL=0), cleanup not scheduled");
    }

    // Job 2: Dead session cleanup (every 15 minutes)
    let session_store = store.clone();
    scheduler
        .add(Job::new_async("0 */15 * * * *", move |_uuid, _l| {
            let store = session_store.clone();
            Box::pin(async move {
                match store.purge_expired_sessions(OffsetDateTime::now_utc()).await {
                    Ok(removed) => info!(removed = removed, "Expired session cleanup complete"),
                    Err(e) => error!(error = %e, "Expired session cleanup failed"),
                }
            })
        })?)
        .await?;
    job_count += 1;
    info!("Scheduled: Expired session cleanup (every 15 minutes)");

    // Job 3: Heartbeat (every 5 minutes)
    scheduler
        .add(Job::new_async("0 */5 * * * *", |_uuid, _l| {
            Box::pin(async move {
                info!("Worker heartbeat - all systems operational");
            })
        })?)
        .await?;
    job_count += 1;
    info!("Scheduled: Heartbeat (every 5 minutes)");

    info!("Starting job scheduler");
    scheduler.start().await?;

    info!(
        "Auth Sandbox Worker started successfully with {} scheduled jobs",
        job_count
    );

    // The scheduler runs jobs in background tasks
    loop {
        tokio::time::sleep(Duration::from_secs(3600)).await;
    }
}
