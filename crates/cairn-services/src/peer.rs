//! Connected peers and the registry that tracks them.
//!
//! A `Peer` owns both halves of one TCP connection. The read half is shared
//! between the transport's framing loop and whichever task drains a raw
//! stream; the `streams` counter decides who owns it at any moment.

use std::io;
use std::net::SocketAddr;
use std::sync::Arc;

use dashmap::DashMap;
use tokio::io::{AsyncWriteExt, BufReader};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::sync::{watch, Mutex, MutexGuard};

pub struct Peer {
    remote_addr: SocketAddr,
    outbound: bool,
    reader: Mutex<BufReader<OwnedReadHalf>>,
    writer: Mutex<OwnedWriteHalf>,
    /// Raw streams announced but not yet drained.
    streams: watch::Sender<usize>,
    /// Set once this side has given up on the connection.
    dropped: watch::Sender<bool>,
}

impl Peer {
    pub fn new(conn: TcpStream, outbound: bool) -> io::Result<Self> {
        let remote_addr = conn.peer_addr()?;
        conn.set_nodelay(true)?;
        let (read, write) = conn.into_split();
        let (streams, _) = watch::channel(0);
        let (dropped, _) = watch::channel(false);
        Ok(Self {
            remote_addr,
            outbound,
            reader: Mutex::new(BufReader::new(read)),
            writer: Mutex::new(write),
            streams,
            dropped,
        })
    }

    pub fn remote_addr(&self) -> SocketAddr {
        self.remote_addr
    }

    /// True if we dialed this peer.
    pub fn is_outbound(&self) -> bool {
        self.outbound
    }

    /// Write `bytes` to the connection as one contiguous unit.
    pub async fn send(&self, bytes: &[u8]) -> io::Result<()> {
        let mut writer = self.writer.lock().await;
        writer.write_all(bytes).await?;
        writer.flush().await
    }

    /// Hold the write half across several writes so nothing interleaves.
    pub async fn lock_writer(&self) -> MutexGuard<'_, OwnedWriteHalf> {
        self.writer.lock().await
    }

    /// Hold the read half. Only safe to drain raw bytes after
    /// `wait_stream_announced` has returned.
    pub async fn lock_reader(&self) -> MutexGuard<'_, BufReader<OwnedReadHalf>> {
        self.reader.lock().await
    }

    /// Called by the framing loop when it reads a stream marker.
    pub fn begin_stream(&self) {
        self.streams.send_modify(|n| *n += 1);
    }

    /// Hand the read half back to the framing loop.
    pub fn end_stream(&self) {
        self.streams.send_modify(|n| *n = n.saturating_sub(1));
    }

    pub fn pending_streams(&self) -> usize {
        *self.streams.borrow()
    }

    /// Resolve once the framing loop has seen a stream marker.
    pub async fn wait_stream_announced(&self) {
        let mut rx = self.streams.subscribe();
        let _ = rx.wait_for(|n| *n > 0).await;
    }

    /// Resolve once every announced stream has been drained.
    pub async fn wait_stream_released(&self) {
        let mut rx = self.streams.subscribe();
        let _ = rx.wait_for(|n| *n == 0).await;
    }

    /// Ask the framing loop to drop this connection, e.g. after the remote
    /// announced a stream it never sent.
    pub fn disconnect(&self) {
        self.dropped.send_replace(true);
    }

    pub fn is_disconnected(&self) -> bool {
        *self.dropped.borrow()
    }

    pub async fn wait_disconnected(&self) {
        let mut rx = self.dropped.subscribe();
        let _ = rx.wait_for(|d| *d).await;
    }

    /// Shut down the write half. The remote sees EOF and our read loop ends
    /// when the remote closes its side.
    pub async fn close(&self) -> io::Result<()> {
        self.writer.lock().await.shutdown().await
    }
}

impl std::fmt::Debug for Peer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Peer")
            .field("remote_addr", &self.remote_addr)
            .field("outbound", &self.outbound)
            .field("pending_streams", &self.pending_streams())
            .finish()
    }
}

/// Live connections keyed by remote address string.
/// Shared between the transport hooks and the file server.
#[derive(Clone, Default)]
pub struct PeerRegistry {
    peers: Arc<DashMap<String, Arc<Peer>>>,
}

impl PeerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, peer: Arc<Peer>) {
        self.peers.insert(peer.remote_addr().to_string(), peer);
    }

    pub fn remove(&self, addr: &str) -> Option<Arc<Peer>> {
        self.peers.remove(addr).map(|(_, p)| p)
    }

    pub fn get(&self, addr: &str) -> Option<Arc<Peer>> {
        self.peers.get(addr).map(|e| Arc::clone(e.value()))
    }

    /// Copy of the current peers. No map lock is held once this returns.
    pub fn snapshot(&self) -> Vec<Arc<Peer>> {
        self.peers.iter().map(|e| Arc::clone(e.value())).collect()
    }

    pub fn len(&self) -> usize {
        self.peers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.peers.is_empty()
    }
}
