//! Replicating file server.
//!
//! Writes land on local disk first and are then pushed, encrypted, to every
//! connected peer. Reads are served from local disk when possible and
//! otherwise pulled from the network and cached locally.
//!
//! Every stream is one contiguous write under the peer's writer lock:
//! control message, stream marker, ciphertext. The receiving read loop parks
//! on the marker, and only the dispatch loop ever drains a stream, in the
//! order the control messages arrived. A fetch waits on a per-request slot
//! that the dispatcher fills when the matching reply comes in; replies that
//! nobody is waiting for any more are drained and dropped.

use std::io;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use thiserror::Error;
use tokio::fs::File;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWriteExt};
use tokio::sync::{oneshot, watch};

use cairn_core::config::{CairnConfig, ConfigError};
use cairn_core::crypto::{
    copy_encrypt, generate_id, hash_key, new_encryption_key, CipherError, EncryptionKey, IV_LEN,
};
use cairn_core::wire::{
    Decoder, DefaultDecoder, Envelope, FetchIntent, FetchReply, Frame, StoreIntent, WireError,
    DELIVERY_QUEUE_CAPACITY, FRAME_STREAM,
};

use crate::peer::{Peer, PeerRegistry};
use crate::store::{cas_path_transform, PathTransform, Store, StoreError};
use crate::transport::{nop_handshake, HandshakeFn, TcpTransport, TransportError, TransportOpts};

/// Default wait for a peer to answer a request or start a stream it promised.
pub const DEFAULT_STREAM_TIMEOUT: Duration = Duration::from_secs(2);

pub struct FileServerOpts {
    /// Empty = generate one.
    pub id: String,
    pub enc_key: EncryptionKey,
    pub storage_root: PathBuf,
    pub path_transform: PathTransform,
    pub listen_addr: String,
    pub bootstrap_nodes: Vec<String>,
    pub stream_timeout: Duration,
    pub handshake: HandshakeFn,
    pub decoder: Arc<dyn Decoder>,
    pub queue_capacity: usize,
}

impl FileServerOpts {
    pub fn new(
        listen_addr: impl Into<String>,
        storage_root: impl Into<PathBuf>,
        enc_key: EncryptionKey,
    ) -> Self {
        Self {
            id: String::new(),
            enc_key,
            storage_root: storage_root.into(),
            path_transform: cas_path_transform,
            listen_addr: listen_addr.into(),
            bootstrap_nodes: Vec::new(),
            stream_timeout: DEFAULT_STREAM_TIMEOUT,
            handshake: nop_handshake(),
            decoder: Arc::new(DefaultDecoder::default()),
            queue_capacity: DELIVERY_QUEUE_CAPACITY,
        }
    }

    pub fn from_config(config: &CairnConfig) -> Result<Self, ConfigError> {
        let enc_key = match config.encryption_key()? {
            Some(key) => key,
            None => {
                tracing::warn!(
                    "no encryption key configured; using a per-process key, \
                     replicas from this node will be unreadable elsewhere"
                );
                new_encryption_key()
            }
        };

        let mut opts = Self::new(
            config.network.listen_addr.clone(),
            config.storage.root.clone(),
            enc_key,
        );
        opts.id = config.node.id.clone();
        opts.bootstrap_nodes = config.network.bootstrap_nodes.clone();
        opts.stream_timeout = Duration::from_millis(config.network.stream_timeout_ms);
        opts.decoder = Arc::new(DefaultDecoder::new(config.network.max_envelope_bytes));
        opts.queue_capacity = config.network.delivery_queue;
        Ok(opts)
    }
}

#[derive(Debug, Error)]
pub enum ServerError {
    #[error("key {0} not found locally or on any peer")]
    NotFound(String),

    #[error("no connected peer at {0}")]
    UnknownPeer(String),

    #[error("peer {0} disconnected before replying")]
    Disconnected(SocketAddr),

    #[error("failed to send to {addr}: {source}")]
    Send { addr: SocketAddr, source: io::Error },

    #[error("failed to receive from {addr}: {source}")]
    Receive { addr: SocketAddr, source: io::Error },

    #[error("peer {addr} did not start its stream within {timeout:?}")]
    StreamTimeout { addr: SocketAddr, timeout: Duration },

    #[error("peer {addr} did not answer within {timeout:?}")]
    ReplyTimeout { addr: SocketAddr, timeout: Duration },

    #[error("peer {addr} announced {announced} bytes but its stream carries {prefix}")]
    SizeMismatch {
        addr: SocketAddr,
        announced: u64,
        prefix: u64,
    },

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Cipher(#[from] CipherError),

    #[error(transparent)]
    Transport(#[from] TransportError),

    #[error(transparent)]
    Wire(#[from] WireError),
}

/// What became of one GetFile sent to one peer.
#[derive(Debug)]
enum ReplyOutcome {
    Stored(u64),
    Missing,
    Failed(ServerError),
}

/// A GetFile in flight, filled in by the dispatch loop.
struct PendingReply {
    peer: SocketAddr,
    key: String,
    /// Fired as soon as the reply shows up, before its stream is drained.
    claimed: oneshot::Sender<()>,
    done: oneshot::Sender<ReplyOutcome>,
}

/// The fetch side of a `PendingReply`.
struct ReplyWaiter {
    request_id: u64,
    peer: SocketAddr,
    claimed: oneshot::Receiver<()>,
    done: oneshot::Receiver<ReplyOutcome>,
}

type PendingReplies = Arc<DashMap<u64, PendingReply>>;

pub struct FileServer {
    id: String,
    enc_key: EncryptionKey,
    store: Store,
    transport: TcpTransport,
    peers: PeerRegistry,
    pending: PendingReplies,
    next_request: AtomicU64,
    bootstrap_nodes: Vec<String>,
    stream_timeout: Duration,
    shutdown: watch::Sender<bool>,
}

impl FileServer {
    pub fn new(opts: FileServerOpts) -> Result<Self, ServerError> {
        if !matches!(opts.enc_key.len(), 16 | 24 | 32) {
            return Err(CipherError::InvalidKeyLength(opts.enc_key.len()).into());
        }
        let id = if opts.id.is_empty() {
            generate_id()
        } else {
            opts.id
        };

        let peers = PeerRegistry::new();
        let pending = PendingReplies::default();
        let mut transport_opts = TransportOpts::new(opts.listen_addr);
        transport_opts.handshake = opts.handshake;
        transport_opts.decoder = opts.decoder;
        transport_opts.queue_capacity = opts.queue_capacity;

        let registry = peers.clone();
        transport_opts.on_peer = Arc::new(move |peer: Arc<Peer>| -> Result<(), TransportError> {
            tracing::info!(
                peer = %peer.remote_addr(),
                outbound = peer.is_outbound(),
                "peer connected"
            );
            registry.insert(peer);
            Ok(())
        });
        let registry = peers.clone();
        let waiting = Arc::clone(&pending);
        transport_opts.on_disconnect = Arc::new(move |addr: SocketAddr| {
            if registry.remove(&addr.to_string()).is_some() {
                tracing::info!(peer = %addr, "peer disconnected");
            }
            // Dropping the senders wakes every fetch still waiting on this peer.
            waiting.retain(|_, reply| reply.peer != addr);
        });

        let (shutdown, _) = watch::channel(false);
        Ok(Self {
            id,
            enc_key: opts.enc_key,
            store: Store::new(opts.storage_root, opts.path_transform),
            transport: TcpTransport::new(transport_opts),
            peers,
            pending,
            next_request: AtomicU64::new(1),
            bootstrap_nodes: opts.bootstrap_nodes,
            stream_timeout: opts.stream_timeout,
            shutdown,
        })
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    /// The configured listen address.
    pub fn addr(&self) -> &str {
        self.transport.addr()
    }

    /// The bound address once started.
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.transport.local_addr()
    }

    pub fn peer_count(&self) -> usize {
        self.peers.len()
    }

    /// The underlying store. Keys in it are `hash_key(key)`, not caller keys.
    pub fn content_store(&self) -> &Store {
        &self.store
    }

    /// True if `key` is on local disk under this node's namespace.
    /// The lookup is by `hash_key(key)`, like every other store access here.
    pub fn has_local(&self, key: &str) -> bool {
        self.store.has(&self.id, &hash_key(key))
    }

    /// Remove `key` from local disk. Peers keep their replicas.
    pub async fn delete_local(&self, key: &str) -> Result<(), ServerError> {
        Ok(self.store.delete(&self.id, &hash_key(key)).await?)
    }

    /// Listen, then dial the bootstrap nodes. Dial failures are logged only.
    pub async fn start(&self) -> Result<SocketAddr, ServerError> {
        let addr = self.transport.listen_and_accept().await?;
        tracing::info!(id = %self.id, %addr, "file server started");
        self.bootstrap_network().await;
        Ok(addr)
    }

    /// Signal `run` to return and close the transport.
    pub fn stop(&self) {
        self.shutdown.send_replace(true);
        self.transport.close();
    }

    async fn bootstrap_network(&self) {
        let dials = self
            .bootstrap_nodes
            .iter()
            .filter(|addr| !addr.is_empty())
            .map(|addr| async move {
                tracing::info!(%addr, "dialing bootstrap node");
                if let Err(e) = self.transport.dial(addr).await {
                    tracing::warn!(%addr, error = %e, "bootstrap dial failed");
                }
            });
        futures::future::join_all(dials).await;
    }

    fn peer(&self, addr: &str) -> Result<Arc<Peer>, ServerError> {
        self.peers
            .get(addr)
            .ok_or_else(|| ServerError::UnknownPeer(addr.to_string()))
    }

    /// Persist `reader` locally, then replicate it to every connected peer.
    ///
    /// The file lands under `hash_key(key)` in this node's namespace, and
    /// replicas under the same hashed key in ours on each peer.
    /// Returns the ciphertext bytes sent to each peer, or 0 with no peers.
    pub async fn store<R>(&self, key: &str, reader: &mut R) -> Result<u64, ServerError>
    where
        R: AsyncRead + Unpin + ?Sized,
    {
        let hashed = hash_key(key);
        let size = self.store.write(&self.id, &hashed, reader).await?;
        tracing::info!(key = %key, bytes = size, "stored locally");

        let peers = self.peers.snapshot();
        if peers.is_empty() {
            return Ok(0);
        }

        let frame = Envelope::StoreFile(StoreIntent {
            node_id: self.id.clone(),
            key: hashed.clone(),
            size: size + IV_LEN as u64,
        })
        .to_frame_bytes()?;

        let sent = futures::future::try_join_all(
            peers.iter().map(|peer| self.replicate_to(peer, &frame, &hashed)),
        )
        .await?;
        tracing::info!(key = %key, peers = sent.len(), "replicated to peers");
        Ok(sent.into_iter().next().unwrap_or(0))
    }

    async fn replicate_to(&self, peer: &Peer, frame: &[u8], hashed: &str) -> Result<u64, ServerError> {
        let (_, mut file) = self.store.read(&self.id, hashed).await?;
        let addr = peer.remote_addr();
        let send_err = |source| ServerError::Send { addr, source };

        let mut writer = peer.lock_writer().await;
        writer.write_all(frame).await.map_err(send_err)?;
        writer.write_all(&[FRAME_STREAM]).await.map_err(send_err)?;
        let n = copy_encrypt(&self.enc_key, &mut file, &mut *writer).await?;
        tracing::debug!(peer = %addr, bytes = n, "replica sent");
        Ok(n)
    }

    /// Open `key`, pulling it from the network first if it is not on local disk.
    ///
    /// Network replies are handed over by the dispatch loop, so `run` must be
    /// going for a fetch that misses locally to see any peer's answer.
    pub async fn fetch(&self, key: &str) -> Result<File, ServerError> {
        let hashed = hash_key(key);
        if self.store.has(&self.id, &hashed) {
            tracing::debug!(key = %key, "serving from local disk");
            let (_, file) = self.store.read(&self.id, &hashed).await?;
            return Ok(file);
        }

        let peers = self.peers.snapshot();
        if peers.is_empty() {
            return Err(ServerError::NotFound(key.to_string()));
        }
        tracing::info!(key = %key, peers = peers.len(), "not on local disk, fetching from network");

        let mut waiters = Vec::with_capacity(peers.len());
        if let Err(e) = self.request_from(&peers, &hashed, &mut waiters).await {
            for waiter in &waiters {
                self.pending.remove(&waiter.request_id);
            }
            return Err(e);
        }

        let outcomes =
            futures::future::join_all(waiters.into_iter().map(|waiter| self.await_reply(waiter))).await;
        let mut stored = false;
        for (peer, outcome) in outcomes {
            match outcome {
                ReplyOutcome::Stored(n) => {
                    stored = true;
                    tracing::info!(%peer, key = %key, bytes = n, "received file");
                }
                ReplyOutcome::Missing => tracing::debug!(%peer, key = %key, "peer has no copy"),
                ReplyOutcome::Failed(e) => tracing::warn!(%peer, error = %e, "fetch from peer failed"),
            }
        }
        if !stored {
            return Err(ServerError::NotFound(key.to_string()));
        }

        match self.store.read(&self.id, &hashed).await {
            Ok((_, file)) => Ok(file),
            Err(StoreError::NotFound { .. }) => Err(ServerError::NotFound(key.to_string())),
            Err(e) => Err(e.into()),
        }
    }

    /// Register a reply slot per peer, then send it a GetFile.
    async fn request_from(
        &self,
        peers: &[Arc<Peer>],
        hashed: &str,
        waiters: &mut Vec<ReplyWaiter>,
    ) -> Result<(), ServerError> {
        for peer in peers {
            let request_id = self.next_request.fetch_add(1, Ordering::Relaxed);
            let frame = Envelope::GetFile(FetchIntent {
                node_id: self.id.clone(),
                key: hashed.to_string(),
                request_id,
            })
            .to_frame_bytes()?;

            let (claimed_tx, claimed) = oneshot::channel();
            let (done_tx, done) = oneshot::channel();
            self.pending.insert(
                request_id,
                PendingReply {
                    peer: peer.remote_addr(),
                    key: hashed.to_string(),
                    claimed: claimed_tx,
                    done: done_tx,
                },
            );
            waiters.push(ReplyWaiter {
                request_id,
                peer: peer.remote_addr(),
                claimed,
                done,
            });

            peer.send(&frame).await.map_err(|source| ServerError::Send {
                addr: peer.remote_addr(),
                source,
            })?;
        }
        Ok(())
    }

    async fn await_reply(&self, waiter: ReplyWaiter) -> (SocketAddr, ReplyOutcome) {
        let ReplyWaiter {
            request_id,
            peer,
            claimed,
            done,
        } = waiter;
        let claimed = match tokio::time::timeout(self.stream_timeout, claimed).await {
            Ok(Ok(())) => true,
            Ok(Err(_)) => false,
            // Still claimable only if the dispatcher has not taken it yet.
            Err(_) if self.pending.remove(&request_id).is_some() => {
                let timeout = self.stream_timeout;
                let outcome = ReplyOutcome::Failed(ServerError::ReplyTimeout { addr: peer, timeout });
                return (peer, outcome);
            }
            Err(_) => true,
        };
        let outcome = if claimed { done.await.ok() } else { None };
        let outcome = outcome.unwrap_or(ReplyOutcome::Failed(ServerError::Disconnected(peer)));
        (peer, outcome)
    }

    /// Wait for the framing loop to park on the stream `peer` announced.
    /// A peer that never sends it is dropped: its connection cannot be
    /// framed again.
    async fn await_stream(&self, peer: &Peer) -> Result<(), ServerError> {
        if tokio::time::timeout(self.stream_timeout, peer.wait_stream_announced())
            .await
            .is_err()
        {
            peer.disconnect();
            return Err(ServerError::StreamTimeout {
                addr: peer.remote_addr(),
                timeout: self.stream_timeout,
            });
        }
        Ok(())
    }

    /// Decrypt exactly `size` bytes from `reader` into the store.
    /// Leftover bytes are discarded on failure so the connection stays framed.
    async fn ingest<R>(&self, reader: &mut R, node_id: &str, key: &str, size: u64) -> Result<u64, ServerError>
    where
        R: AsyncRead + Unpin,
    {
        let mut limited = reader.take(size);
        let result = self
            .store
            .write_decrypt(&self.enc_key, node_id, key, &mut limited, size)
            .await;
        let _ = tokio::io::copy(&mut limited, &mut tokio::io::sink()).await;
        Ok(result?)
    }

    /// Dispatch loop. Returns after `stop`, closing the transport.
    pub async fn run(&self) {
        let mut shutdown = self.shutdown.subscribe();
        loop {
            let frame = tokio::select! {
                _ = wait_stopped(&mut shutdown) => break,
                frame = self.transport.consume() => match frame {
                    Some(frame) => frame,
                    None => break,
                },
            };

            let from = frame.from.clone();
            if let Err(e) = self.handle_frame(frame).await {
                tracing::warn!(peer = %from, error = %e, "failed to handle message");
            }
        }

        self.transport.close();
        tracing::info!(id = %self.id, "file server stopped");
    }

    async fn handle_frame(&self, frame: Frame) -> Result<(), ServerError> {
        match Envelope::decode(&frame.payload)? {
            Envelope::StoreFile(intent) => self.handle_store_file(&frame.from, intent).await,
            Envelope::GetFile(intent) => self.handle_get_file(&frame.from, intent),
            Envelope::GetFileReply(reply) => self.handle_get_file_reply(&frame.from, reply).await,
            Envelope::Unknown => {
                tracing::debug!(peer = %frame.from, "ignoring unknown message type");
                Ok(())
            }
        }
    }

    async fn handle_store_file(&self, from: &str, intent: StoreIntent) -> Result<(), ServerError> {
        let peer = self.peer(from)?;
        self.await_stream(&peer).await?;

        let mut reader = peer.lock_reader().await;
        let result = self
            .ingest(&mut *reader, &intent.node_id, &intent.key, intent.size)
            .await;
        drop(reader);
        peer.end_stream();

        let n = result?;
        tracing::info!(peer = %from, node_id = %intent.node_id, bytes = n, "stored replica");
        Ok(())
    }

    /// Answered from its own task: the dispatch loop never writes to a socket.
    fn handle_get_file(&self, from: &str, intent: FetchIntent) -> Result<(), ServerError> {
        let peer = self.peer(from)?;
        let store = self.store.clone();
        let enc_key = self.enc_key.clone();
        let own_id = self.id.clone();
        tokio::spawn(async move {
            if let Err(e) = serve_file(&store, &enc_key, &own_id, &peer, intent).await {
                tracing::warn!(peer = %peer.remote_addr(), error = %e, "failed to serve file");
            }
        });
        Ok(())
    }

    async fn handle_get_file_reply(&self, from: &str, reply: FetchReply) -> Result<(), ServerError> {
        let peer = self.peer(from)?;
        let addr = peer.remote_addr();
        let claimed = self
            .pending
            .remove_if(&reply.request_id, |_, pending| {
                pending.peer == addr && pending.key == reply.key
            })
            .map(|(_, pending)| pending);

        let Some(pending) = claimed else {
            tracing::debug!(peer = %from, request_id = reply.request_id, "discarding unclaimed reply");
            if reply.size > 0 {
                self.receive_reply_stream(&peer, &reply, None).await?;
            }
            return Ok(());
        };

        let _ = pending.claimed.send(());
        let outcome = if reply.size == 0 {
            ReplyOutcome::Missing
        } else {
            match self.receive_reply_stream(&peer, &reply, Some(self.id.as_str())).await {
                Ok(n) => ReplyOutcome::Stored(n),
                Err(e) => ReplyOutcome::Failed(e),
            }
        };
        let _ = pending.done.send(outcome);
        Ok(())
    }

    /// Drain the stream behind a GetFileReply into `node_id`'s namespace, or
    /// throw it away when `node_id` is `None`.
    async fn receive_reply_stream(
        &self,
        peer: &Peer,
        reply: &FetchReply,
        node_id: Option<&str>,
    ) -> Result<u64, ServerError> {
        self.await_stream(peer).await?;
        let addr = peer.remote_addr();

        let mut reader = peer.lock_reader().await;
        let result = async {
            let prefix = reader
                .read_u64_le()
                .await
                .map_err(|source| ServerError::Receive { addr, source })?;
            if prefix != reply.size {
                peer.disconnect();
                return Err(ServerError::SizeMismatch {
                    addr,
                    announced: reply.size,
                    prefix,
                });
            }
            match node_id {
                Some(node_id) => self.ingest(&mut *reader, node_id, &reply.key, reply.size).await,
                None => {
                    tokio::io::copy(&mut (&mut *reader).take(reply.size), &mut tokio::io::sink())
                        .await
                        .map_err(|source| ServerError::Receive { addr, source })?;
                    Ok(0)
                }
            }
        }
        .await;
        drop(reader);
        peer.end_stream();
        result
    }
}

/// Answer one GetFile: a GetFileReply, then for a hit the marker, the size
/// again and the ciphertext. The requester's namespace is searched first,
/// then ours.
async fn serve_file(
    store: &Store,
    enc_key: &[u8],
    own_id: &str,
    peer: &Peer,
    intent: FetchIntent,
) -> Result<(), ServerError> {
    let found = match store.read(&intent.node_id, &intent.key).await {
        Err(StoreError::NotFound { .. }) => store.read(own_id, &intent.key).await,
        other => other,
    };
    let (found, failure) = match found {
        Ok(found) => (Some(found), None),
        Err(StoreError::NotFound { .. }) => (None, None),
        Err(e) => (None, Some(e)),
    };

    let size = found.as_ref().map_or(0, |(n, _)| n + IV_LEN as u64);
    let frame = Envelope::GetFileReply(FetchReply {
        request_id: intent.request_id,
        key: intent.key.clone(),
        size,
    })
    .to_frame_bytes()?;

    let addr = peer.remote_addr();
    let send_err = |source| ServerError::Send { addr, source };
    let mut writer = peer.lock_writer().await;
    writer.write_all(&frame).await.map_err(send_err)?;

    if let Some((_, mut file)) = found {
        writer.write_all(&[FRAME_STREAM]).await.map_err(send_err)?;
        writer.write_all(&size.to_le_bytes()).await.map_err(send_err)?;
        let n = copy_encrypt(enc_key, &mut file, &mut *writer).await?;
        tracing::info!(peer = %addr, bytes = n, "served file over the network");
        return Ok(());
    }

    writer.flush().await.map_err(send_err)?;
    match failure {
        Some(e) => Err(e.into()),
        None => {
            tracing::debug!(peer = %addr, key = %intent.key, "no copy to serve");
            Ok(())
        }
    }
}

async fn wait_stopped(rx: &mut watch::Receiver<bool>) {
    let _ = rx.wait_for(|stopped| *stopped).await;
}
