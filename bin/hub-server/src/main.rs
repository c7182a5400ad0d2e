//! Message Hub Server
//!
//! Runs the event store, router and HTTP API in a single process.
//!
//! ## Startup
//!
//! 1. Load configuration from a TOML file (or defaults) plus `HUB_*` overrides
//! 2. Install the Prometheus recorder
//! 3. Open the hub: recover state from the log and start dispatching
//! 4. Start the lifecycle tasks (transaction sweeper, snapshots, compaction)
//! 5. Serve the HTTP API until SIGINT or SIGTERM

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use metrics_exporter_prometheus::PrometheusBuilder;
use tokio::{net::TcpListener, signal};
use tower_http::cors::{Any, CorsLayer};
use tracing::{info, warn};

use hub_common::logging::{self, LogFormat};
use hub_config::HubConfig;
use hub_router::{HttpMediator, HttpMediatorConfig, Hub, LifecycleManager};

/// Message Hub
#[derive(Parser, Debug)]
#[command(name = "hub-server")]
#[command(about = "Event log, message router and HTTP API")]
struct Args {
    /// Path to a TOML configuration file
    #[arg(long, short, env = "HUB_CONFIG")]
    config: Option<PathBuf>,

    /// Override the API bind address
    #[arg(long, env = "HUB_API_BIND")]
    bind: Option<String>,

    /// Emit JSON logs
    #[arg(long, env = "HUB_LOG_JSON", default_value = "false")]
    log_json: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let _ = dotenvy::dotenv();
    let args = Args::parse();

    let format = if args.log_json { LogFormat::Json } else { LogFormat::from_env() };
    logging::init(format);

    info!(version = env!("CARGO_PKG_VERSION"), "Starting message hub");

    // 1. Configuration
    let mut config = match &args.config {
        Some(path) => HubConfig::load(path)
            .with_context(|| format!("loading configuration from {}", path.display()))?,
        None => HubConfig::from_env().context("loading configuration from environment")?,
    };
    if let Some(bind) = args.bind {
        config.api.bind = bind;
    }

    // 2. Metrics
    let metrics = match PrometheusBuilder::new().install_recorder() {
        Ok(handle) => Some(handle),
        Err(e) => {
            warn!(error = %e, "Prometheus recorder not installed, /metrics will be empty");
            None
        }
    };

    // 3. Hub
    let mediator = Arc::new(
        HttpMediator::new(HttpMediatorConfig {
            timeout: config.router.delivery_timeout(),
            ..Default::default()
        })
        .context("building HTTP client")?,
    );
    let lifecycle_config = config.lifecycle.clone();
    let bind = config.api.bind.clone();
    let hub = Hub::open(config, mediator).await.context("opening hub")?;

    // 4. Background maintenance
    let lifecycle = LifecycleManager::start(hub.clone(), lifecycle_config);

    // 5. HTTP API
    let app = hub_api::create_router(hub.clone(), metrics)
        .layer(CorsLayer::new().allow_origin(Any).allow_methods(Any).allow_headers(Any));

    let listener = TcpListener::bind(&bind)
        .await
        .with_context(|| format!("binding {}", bind))?;
    info!(bind = %bind, "HTTP API listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("serving HTTP API")?;

    info!("Shutdown signal received, draining");
    lifecycle.shutdown().await;
    hub.shutdown().await;
    info!("Message hub stopped");
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            warn!(error = %e, "Failed to install Ctrl+C handler");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
            }
            Err(e) => {
                warn!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}
