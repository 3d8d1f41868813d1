// Copyright 2025 Schelling Point Labs Inc
// SPDX-License-Identifier: AGPL-3.0-only

//! ACP bridge daemon binary.

use acp_bridge_server::{build_router, AppState, BridgeConfig};
use clap::Parser;
use std::path::PathBuf;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(name = "acp-bridge", author, version, about = "Local daemon fronting ACP coding agents over HTTP", long_about = None)]
struct Args {
    /// JSON configuration file
    #[arg(long)]
    config: Option<PathBuf>,

    /// Bind host (overrides config and ACP_BRIDGE_HOST)
    #[arg(long)]
    host: Option<String>,

    /// Bind port (overrides config and ACP_BRIDGE_PORT)
    #[arg(long)]
    port: Option<u16>,

    /// Log filter, e.g. `info` or `acp_bridge=debug`
    #[arg(long, default_value = "info")]
    log_level: String,
}

#[tokio::main]
async fn main() {
    let args = Args::parse();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new(args.log_level.clone())),
        )
        .init();

    let mut config = BridgeConfig::load(args.config.as_deref());
    if let Some(host) = args.host {
        config.host = host;
    }
    if let Some(port) = args.port {
        config.port = port;
    }

    let state = AppState::new(config.clone());
    let evictor = state.tasks.spawn_evictor();
    let app = build_router(state.clone());

    let addr = config.bind_addr();
    let listener = match tokio::net::TcpListener::bind(&addr).await {
        Ok(listener) => listener,
        Err(err) if err.kind() == std::io::ErrorKind::AddrInUse => {
            error!(port = config.port, host = %config.host, "port {} already in use", config.port);
            std::process::exit(1);
        }
        Err(err) => {
            error!(%addr, error = %err, "failed to bind listener");
            std::process::exit(1);
        }
    };
    info!(%addr, "acp-bridge listening");

    let shutdown_state = state.clone();
    let serve = axum::serve(listener, app).with_graceful_shutdown(async move {
        wait_for_signal().await;
        info!("shutdown signal received, stopping agents");
        evictor.abort();
        shutdown_state.registry.shutdown_all().await;
    });

    if let Err(err) = serve.await {
        error!(error = %err, "server error");
        std::process::exit(1);
    }
}

async fn wait_for_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        let mut sigterm =
            signal(SignalKind::terminate()).expect("failed to install SIGTERM handler");
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {}
            _ = sigterm.recv() => {}
        }
    }
    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
    }
}
