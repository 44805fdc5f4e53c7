use std::net::TcpListener;
use std::sync::Arc;

use axum_server::Handle;
use dataminer_api::{app, spawn_reaper, AppState, ConversationRegistry};
use dataminer_bus::connector_for;
use dataminer_core::{DataminerConfig, GraphBackend};
use dataminer_graph::{GraphDriver, MemoryGraph, Neo4jDriver};
use dataminer_proxy::server::{self, serve_listener};
use dataminer_proxy::load_tls;
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();

    // Environment variables:
    //   LOG_FORMAT  - "json" or "text" (default: "text")
    //   LOG_FILE    - path to log file (optional, enables file logging)
    //   LOG_ANSI    - "true"/"false" override ANSI colors (auto-detected by default)
    //   RUST_LOG    - standard env filter
    let log_format = std::env::var("LOG_FORMAT").unwrap_or_else(|_| "text".to_string());
    let log_file = std::env::var("LOG_FILE").ok();
    let log_ansi = std::env::var("LOG_ANSI")
        .ok()
        .map(|v| v == "true" || v == "1");

    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        "dataminer_api=debug,dataminer_proxy=debug,dataminer_bus=info,dataminer_graph=info,tower_http=info"
            .into()
    });

    let registry = tracing_subscriber::registry().with(env_filter);

    let _file_guard = if let Some(ref path) = log_file {
        let file_dir = std::path::Path::new(path)
            .parent()
            .unwrap_or(std::path::Path::new("."));
        let file_name = std::path::Path::new(path)
            .file_name()
            .and_then(|f| f.to_str())
            .unwrap_or("dataminer-api.log");
        let file_appender = tracing_appender::rolling::daily(file_dir, file_name);
        let (non_blocking, guard) = tracing_appender::non_blocking(file_appender);

        if log_format == "json" {
            registry
                .with(
                    tracing_subscriber::fmt::layer()
                        .json()
                        .with_writer(non_blocking),
                )
                .init();
        } else {
            let layer = tracing_subscriber::fmt::layer()
                .with_writer(non_blocking)
                .with_ansi(log_ansi.unwrap_or(false));
            registry.with(layer).init();
        }
        Some(guard)
    } else {
        if log_format == "json" {
            registry
                .with(tracing_subscriber::fmt::layer().json())
                .init();
        } else {
            let mut layer = tracing_subscriber::fmt::layer();
            if let Some(ansi) = log_ansi {
                layer = layer.with_ansi(ansi);
            }
            registry.with(layer).init();
        }
        None
    };

    info!(
        log_format = %log_format,
        log_file = log_file.as_deref().unwrap_or("(stdout)"),
        "Logging initialized"
    );

    let config = DataminerConfig::from_env()?;
    info!(
        router = %format!("{}:{}", config.router_host, config.router_port),
        upstream = %config.upstream_url,
        ports = %format!("{}-{}", config.port_range.start(), config.port_range.end()),
        return_mode = ?config.return_mode,
        "Configuration loaded"
    );

    let driver: Arc<dyn GraphDriver> = match config.graph.backend {
        GraphBackend::Neo4j => {
            info!(uri = %config.graph.uri, "Connecting to graph database");
            Arc::new(Neo4jDriver::connect(&config.graph).await?)
        }
        GraphBackend::Memory => {
            warn!("Using in-process graph; writes are not persisted");
            Arc::new(MemoryGraph::new())
        }
    };
    driver.ensure_schema().await?;

    let connector = connector_for(&config.bus_uri)?;

    let tls = match &config.tls {
        Some(tls) => Some(load_tls(tls).await?),
        None => {
            warn!("No TLS material configured; serving plain HTTP");
            None
        }
    };

    let conversations = ConversationRegistry::new(config.clone(), driver, connector, tls.clone());
    let reaper = spawn_reaper(conversations.clone(), config.reaper_interval);

    let listener = TcpListener::bind((config.router_host.as_str(), config.router_port))?;
    let handle = Handle::new();

    let shutdown_handle = handle.clone();
    tokio::spawn(async move {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!(error = %e, "Failed to listen for shutdown signal");
            return;
        }
        info!("Shutdown signal received");
        server::shutdown(&shutdown_handle);
    });

    info!(
        addr = %listener.local_addr()?,
        "Router listening"
    );
    serve_listener(listener, app(AppState::new(conversations.clone())), tls, handle).await?;

    reaper.shutdown().await?;
    conversations.shutdown().await;
    info!("Router stopped");
    Ok(())
}
