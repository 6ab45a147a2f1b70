//! Exit node binary.
//!
//! Reads its configuration from the environment, generates a private
//! key on first start when none is configured, optionally brings up
//! the HTTPS terminator, then serves sessions until killed.

use newt::codec::PeerKeys;
use newt::config::ExitConfig;
use newt::exit::https::{run_terminator, CertBootstrap};
use newt::exit::ExitNode;

const GENERATED_KEY_NOTICE: &str =
    "generated a new private key; update your configuration or this identity is lost on restart";

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with_target(false)
        .init();

    let mut config = ExitConfig::from_env().map_err(|e| anyhow::anyhow!(e))?;
    if config.nostr_private_key.is_empty() {
        let keys = PeerKeys::generate();
        tracing::warn!(key = %keys.secret_hex(), "{GENERATED_KEY_NOTICE}");
        config.nostr_private_key = keys.secret_hex();
    }
    config.validate().map_err(|e| anyhow::anyhow!(e))?;

    let node = ExitNode::new(config.clone()).map_err(|e| anyhow::anyhow!(e))?;
    tracing::info!(pubkey = %node.public_hex(), "exit identity");
    if let Ok(npub) = node.npub() {
        tracing::info!(%npub, "reachable as profile token");
    }
    if let Ok(domain) = node.nostr_domain() {
        tracing::info!(%domain, "reachable as hostname");
    }

    if let (Some(port), Some(target)) = (config.https_port, config.https_target.clone()) {
        let bootstrap = CertBootstrap::new(
            node.codec(),
            node.pool(),
            config.nostr_relays.clone(),
            node.nostr_domain().map_err(|e| anyhow::anyhow!(e))?,
        );
        let cancel = node.cancel_handle();
        tokio::spawn(async move {
            let identity = match bootstrap.load_or_create().await {
                Ok(identity) => identity,
                Err(err) => {
                    tracing::error!(error = %err, "certificate bootstrap failed");
                    std::process::exit(1);
                }
            };
            if let Err(err) = run_terminator(&identity, port, &target, cancel).await {
                tracing::error!(error = %err, "https terminator failed");
                std::process::exit(1);
            }
        });
    }

    node.run().await.map_err(|e| anyhow::anyhow!(e))?;
    Ok(())
}
