//! Cairn integration test harness.
//!
//! Tests run real file servers over loopback TCP, each with its own
//! temporary storage root. No root privileges or external setup needed:
//!
//!   cargo test --test integration
//!
//! Nodes stop their dispatch loop and remove their storage when dropped.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use tokio::io::AsyncReadExt;
use tokio::task::JoinHandle;

use cairn_core::crypto::EncryptionKey;
use cairn_services::{FileServer, FileServerOpts};

mod fetch;
mod local;
mod protocol;
mod replication;

// ── Harness ───────────────────────────────────────────────────────────────────

static NEXT_ROOT: AtomicU64 = AtomicU64::new(0);

fn temp_root() -> PathBuf {
    let id = NEXT_ROOT.fetch_add(1, Ordering::Relaxed);
    std::env::temp_dir().join(format!("cairn-it-{}-{}", std::process::id(), id))
}

/// A started file server with its dispatch loop running.
pub struct Node {
    pub server: Arc<FileServer>,
    pub addr: SocketAddr,
    root: PathBuf,
    task: JoinHandle<()>,
}

impl Node {
    /// Start a node on an ephemeral loopback port, dialing `bootstrap`.
    pub async fn start(key: &EncryptionKey, bootstrap: &[SocketAddr]) -> Result<Node> {
        let root = temp_root();
        let mut opts = FileServerOpts::new("127.0.0.1:0", root.clone(), key.clone());
        opts.bootstrap_nodes = bootstrap.iter().map(|a| a.to_string()).collect();

        let server = Arc::new(FileServer::new(opts).context("failed to create server")?);
        let addr = server.start().await.context("failed to start server")?;
        let task = {
            let server = Arc::clone(&server);
            tokio::spawn(async move { server.run().await })
        };
        Ok(Node {
            server,
            addr,
            root,
            task,
        })
    }

    pub fn peers(&self) -> usize {
        self.server.peer_count()
    }
}

impl Drop for Node {
    fn drop(&mut self) {
        self.server.stop();
        self.task.abort();
        let _ = std::fs::remove_dir_all(&self.root);
    }
}

/// Poll `cond` every 10ms until it holds or `timeout` passes.
pub async fn wait_for(what: &str, timeout: Duration, cond: impl Fn() -> bool) -> Result<()> {
    let deadline = tokio::time::Instant::now() + timeout;
    while !cond() {
        if tokio::time::Instant::now() >= deadline {
            bail!("timed out after {timeout:?} waiting for {what}");
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    Ok(())
}

/// Wait until every node sees `n` peers.
pub async fn wait_for_peers(nodes: &[&Node], n: usize) -> Result<()> {
    wait_for("peers to connect", Duration::from_secs(5), || {
        nodes.iter().all(|node| node.peers() == n)
    })
    .await
}

/// Wait until `node` holds `len` bytes for `key` in `namespace`.
pub async fn wait_for_replica(node: &Node, namespace: &str, key: &str, len: u64) -> Result<()> {
    let path = node
        .server
        .content_store()
        .path_for(namespace, &cairn_core::crypto::hash_key(key));
    wait_for("replica to land", Duration::from_secs(5), || {
        std::fs::metadata(&path).map(|m| m.len() == len).unwrap_or(false)
    })
    .await
}

pub async fn read_all(mut file: tokio::fs::File) -> Result<Vec<u8>> {
    let mut buf = Vec::new();
    file.read_to_end(&mut buf).await?;
    Ok(buf)
}

pub fn random_bytes(n: usize) -> Vec<u8> {
    use rand::RngCore;
    let mut buf = vec![0u8; n];
    rand::thread_rng().fill_bytes(&mut buf);
    buf
}
