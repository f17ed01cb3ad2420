//! `taskrelay-worker` -- task execution daemon.
//!
//! Registers with the control plane, acquires tasks of one kind through
//! push notifications and polling, runs each as a child process and
//! relays its progress and result. Configuration is environment-only; see
//! [`WorkerConfig::from_env`] for the variable table.

use taskrelay_worker::config::{LogFormat, WorkerConfig, DEFAULT_LOG_FILTER};
use taskrelay_worker::worker;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() {
    dotenvy::dotenv().ok();

    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| DEFAULT_LOG_FILTER.into());
    let registry = tracing_subscriber::registry().with(filter);
    match LogFormat::from_env() {
        LogFormat::Json => registry.with(tracing_subscriber::fmt::layer().json()).init(),
        LogFormat::Text => registry.with(tracing_subscriber::fmt::layer()).init(),
    }

    let config = WorkerConfig::from_env().unwrap_or_else(|e| {
        tracing::error!(error = %e, "Invalid configuration");
        std::process::exit(1);
    });

    let cancel = CancellationToken::new();
    tokio::spawn({
        let cancel = cancel.clone();
        async move {
            if let Err(e) = tokio::signal::ctrl_c().await {
                tracing::error!(error = %e, "Failed to listen for shutdown signal");
                return;
            }
            tracing::info!("Shutdown signal received");
            cancel.cancel();
        }
    });

    match worker::run(config, cancel).await {
        Ok(stats) => stats.log_summary(),
        Err(e) => {
            tracing::error!(error = %e, "Worker stopped");
            std::process::exit(1);
        }
    }
}
