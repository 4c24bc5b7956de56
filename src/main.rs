//! tabular-relay server binary.
//!
//! Loads configuration, builds one engine over the configured workbook and
//! serves tool calls over HTTP until interrupted.

use std::sync::Arc;
use std::time::{Duration, Instant};

use clap::Parser;
use tokio::net::TcpListener;
use tracing::info;

use tabular_relay::config::{Cli, Config};
use tabular_relay::engine::Engine;
use tabular_relay::metrics::{MetricsSink, PrometheusMetrics};
use tabular_relay::server::tool_api::{build_router, AppState};
use tabular_relay::upstream::memory::MemoryAccessor;
use tabular_relay::upstream::SharedAccessor;

const MAINTENANCE_INTERVAL: Duration = Duration::from_secs(30);

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Parse CLI arguments.
    let cli = Cli::parse();

    // Initialize tracing/logging.
    let filter = if cli.verbose {
        "tabular_relay=debug,tower_http=debug"
    } else {
        "tabular_relay=info,tower_http=info"
    };

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| filter.into()),
        )
        .with_target(true)
        .init();

    info!("tabular-relay v{}", env!("CARGO_PKG_VERSION"));

    // Load configuration.
    let mut config = Config::load(&cli.config)?;
    if let Some(listen) = cli.listen.clone() {
        config.server.listen = listen;
    }
    let config = Arc::new(config);

    info!(
        provider_cell_limit = config.upstream.provider_cell_limit,
        requests_per_minute = config.quota.requests_per_minute,
        max_concurrent = config.quota.max_concurrent,
        cache_cells = config.cache.max_cells,
        "Configuration loaded"
    );

    // Upstream accessor.
    let accessor = match &cli.workbook {
        Some(path) => {
            info!(path = %path.display(), "Seeding workbooks");
            MemoryAccessor::from_seed_file(path)?
        }
        None => MemoryAccessor::new(),
    };
    let accessor: SharedAccessor = Arc::new(accessor);

    // Metrics and engine.
    let metrics = Arc::new(PrometheusMetrics::new()?);
    let sink: Arc<dyn MetricsSink> = metrics.clone();
    let engine = Arc::new(Engine::new(config.clone(), accessor, sink));
    let maintenance = engine.spawn_maintenance(MAINTENANCE_INTERVAL);

    // Build application state.
    let state = Arc::new(AppState {
        engine: engine.clone(),
        metrics,
        config: config.clone(),
        start_time: Instant::now(),
    });

    // Build the HTTP router.
    let app = build_router(state);

    // Start the server.
    let listen_addr = config.server.listen.clone();
    info!(addr = listen_addr, "Starting server");

    let listener = TcpListener::bind(&listen_addr).await?;
    info!("Listening on {listen_addr}");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    engine.shutdown().await;
    let _ = maintenance.await;
    info!("Server stopped");

    Ok(())
}

async fn shutdown_signal() {
    if let Err(err) = tokio::signal::ctrl_c().await {
        tracing::warn!(error = %err, "Failed to listen for shutdown signal");
        std::future::pending::<()>().await;
    }
    info!("Shutdown signal received");
}
