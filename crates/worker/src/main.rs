//! Stowage Background Worker
//!
//! Runs scheduled jobs:
//! - Billing invariant checks (every 15 minutes by default, `INVARIANT_CHECK_CRON`)
//! - Worker heartbeat (every 5 minutes)

use std::sync::Arc;
use std::time::Duration;

use stowage_billing::{InvariantCheckSummary, InvariantChecker, ViolationSeverity};
use stowage_shared::create_pool;
use tokio_cron_scheduler::{Job, JobScheduler};
use tracing::{error, info, warn};

/// Six-field cron: second minute hour day month weekday
const DEFAULT_INVARIANT_CRON: &str = "0 */15 * * * *";

/// Log the outcome of one invariant run. Critical and high violations carry
/// `alert = true` for log-based paging.
fn log_invariant_summary(summary: &InvariantCheckSummary) {
    for violation in &summary.violations {
        let account_ids: Vec<String> = violation
            .account_ids
            .iter()
            .map(ToString::to_string)
            .collect();

        if needs_alert(violation.severity) {
            error!(
                alert = true,
                invariant = %violation.invariant,
                severity = %violation.severity,
                account_ids = ?account_ids,
                context = %violation.context,
                "{}",
                violation.description
            );
        } else {
            warn!(
                invariant = %violation.invariant,
                severity = %violation.severity,
                account_ids = ?account_ids,
                context = %violation.context,
                "{}",
                violation.description
            );
        }
    }

    info!(
        checks_run = summary.checks_run,
        checks_passed = summary.checks_passed,
        checks_failed = summary.checks_failed,
        violations = summary.violations.len(),
        healthy = summary.healthy,
        "Invariant check cycle complete"
    );
}

fn needs_alert(severity: ViolationSeverity) -> bool {
    matches!(severity, ViolationSeverity::Critical | ViolationSeverity::High)
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load environment
    dotenvy::dotenv().ok();

    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    info!("Starting Stowage Worker");

    let database_url = std::env::var("DATABASE_URL")
        .map_err(|_| anyhow::anyhow!("DATABASE_URL must be set"))?;
    let pool = create_pool(&database_url).await?;
    info!("Database pool created");

    let checker = Arc::new(InvariantChecker::new(pool));

    let scheduler = JobScheduler::new().await?;

    // Job 1: Billing invariant checks
    let invariant_cron =
        std::env::var("INVARIANT_CHECK_CRON").unwrap_or_else(|_| DEFAULT_INVARIANT_CRON.to_string());
    let invariant_checker = checker.clone();
    scheduler
        .add(Job::new_async(invariant_cron.as_str(), move |_uuid, _l| {
            let checker = invariant_checker.clone();
            Box::pin(async move {
                info!("Running scheduled billing invariant checks");
                match checker.run_all_checks().await {
                    Ok(summary) => log_invariant_summary(&summary),
                    Err(e) => error!(error = %e, "Invariant check run failed"),
                }
            })
        })?)
        .await?;
    info!(cron = %invariant_cron, "Scheduled: Billing invariant checks");

    // Job 2: Heartbeat
    scheduler
        .add(Job::new_async("0 */5 * * * *", |_uuid, _l| {
            Box::pin(async move {
                info!("Worker heartbeat - all systems operational");
            })
        })?)
        .await?;
    info!("Scheduled: Heartbeat (every 5 minutes)");

    // One pass at startup so a bad deploy shows up immediately
    match checker.run_all_checks().await {
        Ok(summary) => log_invariant_summary(&summary),
        Err(e) => error!(error = %e, "Startup invariant check failed"),
    }

    info!("Starting job scheduler");
    scheduler.start().await?;
    info!("Stowage Worker started with 2 scheduled jobs");

    // The scheduler runs jobs in background tasks
    loop {
        tokio::time::sleep(Duration::from_secs(3600)).await;
    }
}
