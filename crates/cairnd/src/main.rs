//! cairnd: Cairn replicated file store daemon.
//!
//! Usage: cairnd [listen_addr] [bootstrap_addr...]

use std::sync::Arc;

use anyhow::{Context, Result};

use cairn_core::config::CairnConfig;
use cairn_services::{FileServer, FileServerOpts};

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    // Load config
    if let Err(e) = CairnConfig::write_default_if_missing() {
        tracing::warn!(error = %e, "failed to write default config");
    }
    let mut config = CairnConfig::load().unwrap_or_else(|e| {
        tracing::warn!(error = %e, "failed to load config, using defaults");
        CairnConfig::default()
    });

    let mut args = std::env::args().skip(1);
    if let Some(listen_addr) = args.next() {
        config.network.listen_addr = listen_addr;
    }
    let bootstrap: Vec<String> = args.collect();
    if !bootstrap.is_empty() {
        config.network.bootstrap_nodes = bootstrap;
    }

    let opts = FileServerOpts::from_config(&config).context("invalid configuration")?;
    let server = Arc::new(FileServer::new(opts).context("failed to create file server")?);
    tracing::info!(
        id = %server.id(),
        listen_addr = %config.network.listen_addr,
        storage = %config.storage.root.display(),
        bootstrap = config.network.bootstrap_nodes.len(),
        "cairnd starting"
    );

    let addr = server.start().await.context("failed to start file server")?;
    tracing::info!(%addr, "cairnd listening");

    // ── Shutdown ─────────────────────────────────────────────────────────────
    {
        let server = Arc::clone(&server);
        tokio::spawn(async move {
            tokio::signal::ctrl_c().await.ok();
            tracing::info!("shutdown signal received");
            server.stop();
        });
    }

    server.run().await;
    Ok(())
}
