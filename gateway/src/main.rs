use anyhow::Context;
use clap::Parser;
use std::net::SocketAddr;
use tracing_subscriber::EnvFilter;

use parley_gateway::{config::GatewayConfig, server};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("info,parley_gateway=debug")),
        )
        .init();

    let cfg = GatewayConfig::parse();
    let addr: SocketAddr = cfg.bind.parse().context("parse bind addr")?;

    let state = server::build_state(cfg).await.context("build state")?;
    let app = server::router(state);

    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .context("bind tcp listener")?;
    let local = listener.local_addr().context("read local addr")?;
    tracing::info!(addr = %local, "session gateway listening");

    axum::serve(listener, app).await.context("serve gateway")?;
    Ok(())
}
