//! Server entry point for datalink.

use anyhow::{Context, Result};
use clap::Parser;
use datalink::{DataLinkService, ServiceConfig, api};
use tracing::{debug, info, warn};

mod cli;

use cli::Args;

#[tokio::main]
async fn main() -> Result<()> {
    // Parse CLI arguments first (before tracing, so --help works without logs)
    let args = Args::parse();

    // Priority: RUST_LOG env var > quiet flag > verbose flag > default (info)
    let default_level = if args.quiet {
        "error"
    } else {
        match args.verbose {
            0 => "info",
            1 => "debug",
            _ => "trace",
        }
    };

    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(default_level));

    tracing_subscriber::fmt().with_env_filter(filter).init();

    debug!(?args, "CLI arguments parsed");

    let mut config = ServiceConfig::load_or_default(args.config.as_deref())?;
    args.apply(&mut config);
    config.validate()?;

    info!(
        bind = %config.bind,
        data_dir = %config.data_dir.display(),
        state_dir = %config.state_dir.display(),
        "Datalink starting"
    );
    if config.admin_key.is_none() {
        warn!("No admin key configured; admin endpoints are unavailable");
    }

    let service = DataLinkService::open(config.clone())
        .await
        .context("failed to open service")?;
    let background = service.start().await;

    let listener = tokio::net::TcpListener::bind(config.bind)
        .await
        .with_context(|| format!("failed to bind {}", config.bind))?;
    info!(addr = %config.bind, "HTTP API listening");

    let app = api::router(service.clone());
    let shutdown_service = service.clone();
    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            if let Err(error) = tokio::signal::ctrl_c().await {
                warn!(error = %error, "could not listen for shutdown signal");
                std::future::pending::<()>().await;
            }
            info!("Shutdown requested, cancelling transfers");
            shutdown_service.shutdown();
        })
        .await
        .context("HTTP server failed")?;

    service.shutdown();
    background.abort();
    info!("Datalink stopped");
    Ok(())
}
