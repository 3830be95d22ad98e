//! cairnd: replication node daemon.
//!
//! Usage: `cairnd [config-path]`. Without an argument the default config
//! location is used (and created with defaults if missing).

use std::path::PathBuf;

use anyhow::{Context, Result};

use cairn_core::config::CairnConfig;
use cairnd::{FileServer, FileServerOpts};

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let config = match std::env::args().nth(1) {
        Some(path) => CairnConfig::load_from(PathBuf::from(&path))
            .with_context(|| format!("failed to load config from {path}"))?,
        None => {
            if let Err(e) = CairnConfig::write_default_if_missing() {
                tracing::warn!(error = %e, "failed to write default config");
            }
            CairnConfig::load().unwrap_or_else(|e| {
                tracing::warn!(error = %e, "failed to load config, using defaults");
                CairnConfig::default()
            })
        }
    };

    let opts = FileServerOpts::from_config(&config).context("invalid transport.allowed_peers")?;
    let server = FileServer::new(opts);
    tracing::info!(
        id = %server.id(),
        listen = %config.node.listen_addr,
        root = %config.storage.root.display(),
        encrypt = config.replication.encrypt,
        "cairnd starting"
    );

    {
        let server = server.clone();
        tokio::spawn(async move {
            tokio::signal::ctrl_c().await.ok();
            tracing::info!("shutdown signal received");
            server.stop();
        });
    }

    server.start().await.context("file server failed")?;
    tracing::info!("cairnd stopped");
    Ok(())
}
