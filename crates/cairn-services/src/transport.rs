//! TCP transport: listener, dialer, and per-connection framing loop.
//!
//! Each connection gets a task that decodes frames and pushes control
//! messages onto one bounded queue shared by every peer. When a stream
//! marker arrives the task stops reading until the consumer of that stream
//! calls `Peer::end_stream`, so raw bytes are never parsed as frames.
//! `Peer::disconnect` ends the loop at any point, parked or not.

use std::io;
use std::net::SocketAddr;
use std::sync::{Arc, OnceLock};

use futures::future::BoxFuture;
use futures::FutureExt;
use thiserror::Error;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, watch, Mutex};

use cairn_core::wire::{Decoder, DefaultDecoder, Frame, WireError, DELIVERY_QUEUE_CAPACITY};

use crate::peer::Peer;

/// Runs once per connection before the peer is announced. An error drops it.
pub type HandshakeFn =
    Arc<dyn Fn(Arc<Peer>) -> BoxFuture<'static, Result<(), TransportError>> + Send + Sync>;

/// Runs after a successful handshake. An error drops the connection.
pub type OnPeerFn = Arc<dyn Fn(Arc<Peer>) -> Result<(), TransportError> + Send + Sync>;

/// Runs when an announced peer's connection ends, for any reason.
pub type OnDisconnectFn = Arc<dyn Fn(SocketAddr) + Send + Sync>;

/// Handshake that accepts every connection.
pub fn nop_handshake() -> HandshakeFn {
    Arc::new(|_peer: Arc<Peer>| -> BoxFuture<'static, Result<(), TransportError>> {
        futures::future::ok(()).boxed()
    })
}

pub struct TransportOpts {
    /// `host:port`, or `:port` for every interface.
    pub listen_addr: String,
    pub handshake: HandshakeFn,
    pub decoder: Arc<dyn Decoder>,
    pub on_peer: OnPeerFn,
    pub on_disconnect: OnDisconnectFn,
    pub queue_capacity: usize,
}

impl TransportOpts {
    pub fn new(listen_addr: impl Into<String>) -> Self {
        Self {
            listen_addr: listen_addr.into(),
            handshake: nop_handshake(),
            decoder: Arc::new(DefaultDecoder::default()),
            on_peer: Arc::new(|_peer: Arc<Peer>| -> Result<(), TransportError> { Ok(()) }),
            on_disconnect: Arc::new(|_addr: SocketAddr| {}),
            queue_capacity: DELIVERY_QUEUE_CAPACITY,
        }
    }
}

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("failed to listen on {addr}: {source}")]
    Bind { addr: String, source: io::Error },

    #[error("failed to dial {addr}: {source}")]
    Dial { addr: String, source: io::Error },

    #[error("handshake failed: {0}")]
    Handshake(String),

    #[error("peer rejected: {0}")]
    Rejected(String),

    #[error(transparent)]
    Decode(#[from] WireError),
}

/// State every connection task needs.
struct Shared {
    handshake: HandshakeFn,
    decoder: Arc<dyn Decoder>,
    on_peer: OnPeerFn,
    on_disconnect: OnDisconnectFn,
    frames_tx: mpsc::Sender<Frame>,
    closed: watch::Sender<bool>,
}

pub struct TcpTransport {
    listen_addr: String,
    shared: Arc<Shared>,
    frames: Mutex<mpsc::Receiver<Frame>>,
    local_addr: OnceLock<SocketAddr>,
}

impl TcpTransport {
    pub fn new(opts: TransportOpts) -> Self {
        let (frames_tx, frames_rx) = mpsc::channel(opts.queue_capacity.max(1));
        let (closed, _) = watch::channel(false);
        Self {
            listen_addr: opts.listen_addr,
            shared: Arc::new(Shared {
                handshake: opts.handshake,
                decoder: opts.decoder,
                on_peer: opts.on_peer,
                on_disconnect: opts.on_disconnect,
                frames_tx,
                closed,
            }),
            frames: Mutex::new(frames_rx),
            local_addr: OnceLock::new(),
        }
    }

    /// The configured listen address.
    pub fn addr(&self) -> &str {
        &self.listen_addr
    }

    /// The bound address, once listening. Resolves port 0.
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.local_addr.get().copied()
    }

    /// Bind the listen address and start accepting in the background.
    pub async fn listen_and_accept(&self) -> Result<SocketAddr, TransportError> {
        let addr = with_host(&self.listen_addr, "0.0.0.0");
        let bind_err = |source| TransportError::Bind {
            addr: addr.clone(),
            source,
        };
        let listener = TcpListener::bind(&addr).await.map_err(bind_err)?;
        let local = listener.local_addr().map_err(bind_err)?;
        let _ = self.local_addr.set(local);

        tracing::info!(addr = %local, "tcp transport listening");
        tokio::spawn(accept_loop(Arc::clone(&self.shared), listener));
        Ok(local)
    }

    /// Connect to a remote node. The connection then runs like an accepted one.
    pub async fn dial(&self, addr: &str) -> Result<(), TransportError> {
        let addr = with_host(addr, "127.0.0.1");
        let conn = TcpStream::connect(&addr)
            .await
            .map_err(|source| TransportError::Dial {
                addr: addr.clone(),
                source,
            })?;
        tracing::debug!(%addr, "dialed peer");
        tokio::spawn(handle_conn(Arc::clone(&self.shared), conn, true));
        Ok(())
    }

    /// Next control message from any peer. `None` once the transport is closed.
    pub async fn consume(&self) -> Option<Frame> {
        let mut closed = self.shared.closed.subscribe();
        let mut frames = self.frames.lock().await;
        tokio::select! {
            _ = wait_closed(&mut closed) => None,
            frame = frames.recv() => frame,
        }
    }

    /// Stop accepting and end every connection loop.
    pub fn close(&self) {
        self.shared.closed.send_replace(true);
    }
}

/// `:3000` means `host:3000`.
fn with_host(addr: &str, host: &str) -> String {
    if addr.starts_with(':') {
        format!("{host}{addr}")
    } else {
        addr.to_string()
    }
}

async fn wait_closed(rx: &mut watch::Receiver<bool>) {
    let _ = rx.wait_for(|closed| *closed).await;
}

async fn accept_loop(shared: Arc<Shared>, listener: TcpListener) {
    let mut closed = shared.closed.subscribe();
    loop {
        tokio::select! {
            _ = wait_closed(&mut closed) => {
                tracing::info!("tcp transport shutting down");
                return;
            }

            result = listener.accept() => match result {
                Ok((conn, addr)) => {
                    tracing::debug!(%addr, "accepted connection");
                    tokio::spawn(handle_conn(Arc::clone(&shared), conn, false));
                }
                Err(e) => tracing::warn!(error = %e, "accept failed"),
            }
        }
    }
}

async fn handle_conn(shared: Arc<Shared>, conn: TcpStream, outbound: bool) {
    let peer = match Peer::new(conn, outbound) {
        Ok(p) => Arc::new(p),
        Err(e) => {
            tracing::warn!(error = %e, "failed to set up connection");
            return;
        }
    };
    let addr = peer.remote_addr();

    if let Err(e) = (shared.handshake)(Arc::clone(&peer)).await {
        tracing::warn!(peer = %addr, error = %e, "handshake failed, dropping connection");
        let _ = peer.close().await;
        return;
    }
    if let Err(e) = (shared.on_peer)(Arc::clone(&peer)) {
        tracing::warn!(peer = %addr, error = %e, "peer rejected, dropping connection");
        let _ = peer.close().await;
        return;
    }

    let mut closed = shared.closed.subscribe();
    match read_loop(&shared, &peer, &mut closed).await {
        Ok(()) => tracing::debug!(peer = %addr, "connection closed"),
        Err(e) => tracing::warn!(peer = %addr, error = %e, "connection dropped"),
    }

    (shared.on_disconnect)(addr);
    let _ = peer.close().await;
}

async fn read_loop(
    shared: &Shared,
    peer: &Arc<Peer>,
    closed: &mut watch::Receiver<bool>,
) -> Result<(), TransportError> {
    let from = peer.remote_addr().to_string();
    loop {
        let decoded = {
            let mut reader = peer.lock_reader().await;
            tokio::select! {
                _ = wait_closed(closed) => return Ok(()),
                _ = peer.wait_disconnected() => return Ok(()),
                result = shared.decoder.decode(&mut *reader) => result,
            }
        };

        let mut frame = match decoded {
            Ok(frame) => frame,
            Err(e) if e.is_eof() => return Ok(()),
            Err(e) => return Err(e.into()),
        };
        frame.from = from.clone();

        if frame.stream {
            peer.begin_stream();
            tracing::debug!(peer = %from, "incoming stream, framing suspended");
            tokio::select! {
                _ = wait_closed(closed) => return Ok(()),
                _ = peer.wait_disconnected() => return Ok(()),
                _ = peer.wait_stream_released() => {}
            }
            tracing::debug!(peer = %from, "stream drained, framing resumed");
            continue;
        }

        tokio::select! {
            _ = wait_closed(closed) => return Ok(()),
            _ = peer.wait_disconnected() => return Ok(()),
            sent = shared.frames_tx.send(frame) => {
                if sent.is_err() {
                    return Ok(());
                }
            }
        }
    }
}
