//! Ratekeeper daemon binary
//!
//! Keeps exchange rates fresh until interrupted.

use std::sync::Arc;

use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use ratekeeper_daemon::{Daemon, RatekeeperConfig};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = RatekeeperConfig::from_env();

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(&config.log_level)),
        )
        .with(tracing_subscriber::fmt::layer().json())
        .init();

    info!(version = env!("CARGO_PKG_VERSION"), "Starting Ratekeeper daemon");

    if let Err(e) = config.validate() {
        error!(error = %e, "Invalid configuration");
        return Err(anyhow::anyhow!("Configuration error: {}", e));
    }

    let daemon = Arc::new(Daemon::new(config.clone()).await?);
    daemon.start()?;

    let mut metrics_ticker = tokio::time::interval(config.metrics_log_interval);
    // The first tick completes immediately.
    metrics_ticker.tick().await;

    loop {
        tokio::select! {
            signal = tokio::signal::ctrl_c() => {
                if let Err(e) = signal {
                    error!(error = %e, "Failed to listen for shutdown signal");
                }
                info!("Shutdown signal received");
                break;
            }
            _ = metrics_ticker.tick() => log_metrics(&daemon),
        }
    }

    daemon.stop().await?;

    info!("Ratekeeper daemon shutdown complete");
    Ok(())
}

fn log_metrics(daemon: &Daemon) {
    let health = daemon.service().health();
    let metrics = daemon.service().metrics();
    info!(
        status = ?health.status,
        cycles_total = metrics.cycles_total,
        cycles_committed = metrics.cycles_committed,
        cycles_partial = metrics.cycles_partial,
        cycles_failed = metrics.cycles_failed,
        cycles_skipped = metrics.cycles_skipped,
        history_appended = metrics.history_appended,
        store_errors = metrics.store_errors,
        consecutive_failures = metrics.consecutive_failures,
        last_success_at = ?health.last_successful_refresh,
        "Refresh metrics"
    );
}
