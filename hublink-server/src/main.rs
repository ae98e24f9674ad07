//! Hublink server: the WebSocket relay and the HTTP history API in one
//! process, sharing a single in-memory device store.

mod cli;

use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use hublink_relay::{router, ApiState, Relay, RelayServer};
use hublink_store::DeviceStore;

use cli::Args;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(&args.log_level))
        .init();

    let config = args.server_config();
    let store = Arc::new(DeviceStore::new(config.store_config()));
    let relay = Arc::new(Relay::new(store));

    let api = router(ApiState::new(relay.clone(), config.ws_url()));
    let http_listener = tokio::net::TcpListener::bind(&config.http_bind_addr)
        .await
        .with_context(|| format!("binding HTTP API on {}", config.http_bind_addr))?;
    log::info!("HTTP API listening on {}", config.http_bind_addr);

    let ws_server = RelayServer::new(config, relay);

    tokio::select! {
        res = ws_server.run() => res.context("WebSocket relay stopped")?,
        res = axum::serve(http_listener, api) => res.context("HTTP API stopped")?,
        _ = tokio::signal::ctrl_c() => log::info!("Shutting down"),
    }
    Ok(())
}
