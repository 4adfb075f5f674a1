use std::net::SocketAddr;

use anyhow::Context;
use clap::Parser;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use lattice_config::LatticeConfig;
use lattice_server::{routes, state};

/// Command line arguments for the Lattice server
#[derive(Parser, Debug)]
#[command(name = "lattice-server")]
#[command(about = "Memory orchestration service for AI agents")]
struct Args {
    /// Server port (overrides config)
    #[arg(short, long, env = "SERVER_PORT")]
    port: Option<u16>,

    /// Server host (overrides config)
    #[arg(long, env = "SERVER_HOST")]
    host: Option<String>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("info,lattice=debug")),
        )
        .init();

    let args = Args::parse();
    let (mut config, warnings) = LatticeConfig::load();
    if let Some(host) = args.host {
        config.server.host = host;
    }
    if let Some(port) = args.port {
        config.server.port = port;
    }
    warnings.log_all();
    config
        .validate_security_posture()
        .context("security posture validation failed")?;

    let addr: SocketAddr = format!("{}:{}", config.server.host, config.server.port)
        .parse()
        .context("invalid host/port")?;

    let (state, workers) = state::build_state(config).await?;
    info!(
        backend = state.outbox.active_backend(),
        targets = ?state.ingest.enabled_targets(),
        sources = ?state.retrieval.available_sources(),
        "lattice subsystems initialized"
    );

    let router = routes::create_router(state.clone());
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("binding {addr}"))?;
    info!(%addr, "lattice-server listening");

    axum::serve(listener, router)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("server error")?;

    // Drain: stop the workers, then force a final rollup flush so buffered
    // hot-file snapshots are not lost.
    info!("shutting down; draining workers");
    let _ = workers.shutdown.send(true);
    let flush = state.ingest.flush_rollups(true).await;
    if flush["flushed"].as_u64().unwrap_or(0) > 0 {
        info!(%flush, "final rollup flush completed");
    }
    for handle in workers.handles {
        if tokio::time::timeout(std::time::Duration::from_secs(5), handle)
            .await
            .is_err()
        {
            warn!("worker did not stop within the drain window");
        }
    }
    info!("shutdown complete");
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        tokio::signal::ctrl_c()
            .await
            .expect("failed to install ctrl-c handler");
    };

    #[cfg(unix)]
    let terminate = async {
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("failed to install signal handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}
