//! StoryForge Background Worker
//!
//! Handles scheduled metering jobs:
//! - Reservation expiry sweep (every minute)
//! - Billing period reset (daily at 00:10 UTC)
//! - Add-on expiry pass and grace/consistency monitor (hourly)
//! - Health check heartbeat (every 5 minutes)

use std::sync::Arc;
use std::time::Duration;

use sqlx::postgres::PgPoolOptions;
use time::OffsetDateTime;
use tokio_cron_scheduler::{Job, JobScheduler};
use tracing::{error, info, warn};

use storyforge_metering::MeteringService;

/// Create a database connection pool
async fn create_db_pool() -> anyhow::Result<sqlx::PgPool> {
    #[allow(clippy::expect_used)] // Fail-fast on startup if required config is missing
    let database_url = std::env::var("DATABASE_URL").expect("DATABASE_URL must be set");

    let pool = PgPoolOptions::new()
        .max_connections(5)
        .acquire_timeout(Duration::from_secs(5))
        .connect(&database_url)
        .await?;

    info!("Database pool created");
    Ok(pool)
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

    info!("Starting StoryForge Worker");

    let pool = create_db_pool().await?;
    let metering = Arc::new(MeteringService::postgres(pool));

    let scheduler = JobScheduler::new().await?;

    // Job 1: Reservation expiry sweep (every minute)
    // Abandoned holds must release their claim on the pool quickly, or the
    // reserved amounts keep denying legitimate requests.
    let sweep_service = metering.clone();
    scheduler
        .add(Job::new_async("0 * * * * *", move |_uuid, _l| {
            let service = sweep_service.clone();
            Box::pin(async move {
                match service
                    .reservations
                    .sweep_expired(OffsetDateTime::now_utc())
                    .await
                {
                    Ok(report) if report.expired > 0 => {
                        info!(
                            expired = report.expired,
                            reclaimed_amount = report.reclaimed_amount,
                            "Reservation sweep complete"
                        );
                    }
                    Ok(_) => {}
                    Err(e) => error!(error = %e, "Reservation sweep failed"),
                }
            })
        })?)
        .await?;
    info!("Scheduled: Reservation expiry sweep (every minute)");

    // Job 2: Billing period reset (daily at 00:10 UTC)
    // Offset past midnight so day-boundary period math has settled. Periods
    // also rotate lazily on first use, so a missed run self-heals.
    let reset_service = metering.clone();
    scheduler
        .add(Job::new_async("0 10 0 * * *", move |_uuid, _l| {
            let service = reset_service.clone();
            Box::pin(async move {
                info!("Running scheduled billing period reset");
                match service
                    .periods
                    .reset_expired_periods(OffsetDateTime::now_utc())
                    .await
                {
                    Ok(report) => {
                        if report.failed > 0 {
                            warn!(
                                processed = report.processed,
                                failed = report.failed,
                                "Billing period reset finished with failures"
                            );
                        }
                    }
                    Err(e) => error!(error = %e, "Billing period reset failed"),
                }
            })
        })?)
        .await?;
    info!("Scheduled: Billing period reset (daily at 00:10 UTC)");

    // Job 3: Add-on expiry pass plus grace/consistency monitor (hourly)
    let monitor_service = metering.clone();
    scheduler
        .add(Job::new_async("0 0 * * * *", move |_uuid, _l| {
            let service = monitor_service.clone();
            Box::pin(async move {
                let now = OffsetDateTime::now_utc();

                if let Err(e) = service.addons.deactivate_expired(now).await {
                    error!(error = %e, "Add-on expiry pass failed");
                }

                match service.monitor.run_grace_sweep(now).await {
                    Ok(report) if report.blocked > 0 => {
                        warn!(blocked = report.blocked, "Grace sweep blocked organizations");
                    }
                    Ok(_) => {}
                    Err(e) => error!(error = %e, "Grace sweep failed"),
                }

                match service.monitor.run_all_checks(now).await {
                    Ok(summary) if !summary.healthy => {
                        warn!(
                            violations = summary.violations.len(),
                            "Consistency checks found violations"
                        );
                    }
                    Ok(_) => {}
                    Err(e) => error!(error = %e, "Consistency checks failed"),
                }
            })
        })?)
        .await?;
    info!("Scheduled: Add-on expiry and grace/consistency monitor (hourly)");

    // Job 4: Health check heartbeat (every 5 minutes)
    scheduler
        .add(Job::new_async("0 */5 * * * *", |_uuid, _l| {
            Box::pin(async move {
                info!("Worker heartbeat - all systems operational");
            })
        })?)
        .await?;
    info!("Scheduled: Health check heartbeat (every 5 minutes)");

    scheduler.start().await?;
    info!("Worker started, all jobs scheduled");

    // Keep the worker alive
    tokio::signal::ctrl_c().await?;
    info!("Shutdown signal received, stopping worker");

    Ok(())
}
