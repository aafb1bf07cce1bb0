//! marketplace-sync - A rate-limited synchronization engine for marketplace APIs
//!
//! This is the main entry point for the marketplace-sync application.

use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use tokio::signal;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use marketplace_sync::config::{AccountConfig, Config};
use marketplace_sync::database::SqliteDatabase;
use marketplace_sync::models::SyncRunStatus;
use marketplace_sync::server::{AppState, Server};
use marketplace_sync::sync::{
    AccountScheduler, AccountSyncer, ApiGateway, HttpMarketplaceClient, RateLimiter, RetryPolicy,
    SchedulerConfig, SyncPipeline,
};
use marketplace_sync::telemetry::init_tracing;

/// marketplace-sync - A rate-limited synchronization engine for marketplace APIs
#[derive(Parser, Debug)]
#[command(name = "marketplace-sync")]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Path to the configuration file
    #[arg(short, long, env = "MARKETPLACE_SYNC_CONFIG")]
    config: Option<String>,

    /// Sync every enabled account once, print a summary and exit
    #[arg(long, env = "MARKETPLACE_SYNC_ONCE")]
    once: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Parse CLI arguments
    let args = Args::parse();

    // Load configuration
    let config = load_config(&args)?;

    // Initialize tracing/logging
    init_tracing(&config.logging)?;

    info!(
        version = env!("CARGO_PKG_VERSION"),
        accounts = config.accounts.len(),
        "Starting marketplace-sync"
    );

    // Initialize database
    let database = Arc::new(SqliteDatabase::new(&config.database.path).await?);
    info!(path = %config.database.path, "Database initialized");

    // Shared by every account
    let rate_limiter = Arc::new(RateLimiter::new(&config.rate_limits));
    let client = Arc::new(HttpMarketplaceClient::new(&config.api)?);
    let gateway = Arc::new(ApiGateway::new(
        client,
        Arc::clone(&rate_limiter),
        RetryPolicy::new(config.retry.clone()),
        config.api.acquire_timeout_secs.map(Duration::from_secs),
    ));
    let pipeline = Arc::new(SyncPipeline::new(
        gateway,
        database.clone(),
        config.pipeline.clone(),
    ));
    info!(base_url = %config.api.base_url, "Marketplace gateway initialized");

    let accounts: Vec<_> = config.enabled_accounts().cloned().collect();

    if args.once {
        return run_once(pipeline, &accounts).await;
    }

    let scheduler = AccountScheduler::new(
        SchedulerConfig::from(&config.scheduler),
        pipeline,
        accounts,
    )
    .start();

    if config.server.enabled {
        let state = AppState {
            database,
            scheduler: scheduler.clone(),
            rate_limiter,
        };
        let server = Server::new(config.server.clone(), state);

        info!(
            host = %config.server.host,
            port = %config.server.port,
            "Starting HTTP server"
        );

        if let Err(e) = server.run(shutdown_signal()).await {
            error!(error = %e, "HTTP server failed");
            scheduler.stop().await;
            return Err(e.into());
        }
    } else {
        shutdown_signal().await;
    }

    scheduler.stop().await;
    info!("marketplace-sync shutdown complete");

    Ok(())
}

/// Sync every account once, sequentially, and print a summary
async fn run_once(
    pipeline: Arc<SyncPipeline>,
    accounts: &[AccountConfig],
) -> anyhow::Result<()> {
    let cancel = CancellationToken::new();
    let interrupt = cancel.clone();
    tokio::spawn(async move {
        shutdown_signal().await;
        interrupt.cancel();
    });

    let mut failed = 0usize;
    for account in accounts {
        for operation in &account.operation_types {
            let run = pipeline
                .sync_account(account, *operation, cancel.clone())
                .await?;

            println!(
                "{:<20} {:<8} {:<10} pages={:<4} processed={:<6} created={:<6} updated={:<6} failed={:<6}{}",
                account.id,
                operation.to_string(),
                run.status.to_string(),
                run.pages_fetched,
                run.items_processed,
                run.items_created,
                run.items_updated,
                run.items_failed,
                run.error_message
                    .as_deref()
                    .map(|e| format!(" error={}", e))
                    .unwrap_or_default()
            );

            if run.status == SyncRunStatus::Failed {
                failed += 1;
            }
        }
    }

    if failed > 0 {
        warn!(failed_runs = failed, "One-shot sync finished with failures");
        anyhow::bail!("{} sync run(s) failed", failed);
    }

    info!("One-shot sync finished");
    Ok(())
}

/// Load configuration from file or environment
fn load_config(args: &Args) -> anyhow::Result<Config> {
    let config = match &args.config {
        Some(path) => {
            // Use eprintln! since tracing is not yet initialized
            eprintln!("Loading configuration from file: {}", path);
            Config::from_file(path).map_err(|e| anyhow::anyhow!("Failed to load config: {}", e))?
        }
        None => {
            // Use eprintln! since tracing is not yet initialized
            eprintln!("Loading configuration from environment variables");
            Config::from_env().map_err(|e| anyhow::anyhow!("Failed to load config: {}", e))?
        }
    };

    config
        .validate()
        .map_err(|e| anyhow::anyhow!("Invalid configuration: {}", e))?;

    Ok(config)
}

/// Create a future that resolves when a shutdown signal is received
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!(error = %e, "Failed to listen for Ctrl+C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                error!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("Received Ctrl+C, initiating graceful shutdown");
        }
        _ = terminate => {
            info!("Received SIGTERM, initiating graceful shutdown");
        }
    }
}
