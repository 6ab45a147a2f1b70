//! Entry node binary.
//!
//! Reads its configuration from the environment, binds the SOCKS5
//! listener (and the side-channel listener when `PUBLIC_ADDRESS` is
//! set) and serves until killed.

use std::sync::Arc;

use tokio::net::TcpListener;

use newt::config::EntryConfig;
use newt::entry::{EntryDispatcher, NostrDns, SocksServer};
use newt::relay::RelayPool;
use newt::sidechannel::SideChannelListener;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // respects RUST_LOG (e.g. RUST_LOG=debug)
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with_target(false)
        .init();

    let config = EntryConfig::from_env().map_err(|e| anyhow::anyhow!(e))?;
    config.validate().map_err(|e| anyhow::anyhow!(e))?;

    let pool = RelayPool::new();
    for relay in &config.nostr_relays {
        let handle = pool.ensure(relay);
        tracing::info!(relay = %handle.url(), "added relay connection");
    }

    let dns = NostrDns::new(pool.clone(), config.nostr_relays.clone());
    let mut dispatcher = EntryDispatcher::new(config.clone(), pool);

    if let Some(address) = &config.public_address {
        let listener = SideChannelListener::bind(address).await?;
        tracing::info!(%address, "side-channel listener bound");
        dispatcher = dispatcher.with_side_channel(listener.pending());
        tokio::spawn(listener.run());
    }

    let listener = TcpListener::bind(("0.0.0.0", config.socks_port)).await?;
    tracing::info!(port = config.socks_port, "SOCKS5 entry listening");

    let server = Arc::new(SocksServer::new(dispatcher, dns));
    server.run(listener).await?;
    Ok(())
}
