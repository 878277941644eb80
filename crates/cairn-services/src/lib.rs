//! cairn-services: content store, peer transport, and the replicating file server.

pub mod peer;
pub mod server;
pub mod store;
pub mod transport;

pub use peer::{Peer, PeerRegistry};
pub use server::{FileServer, FileServerOpts, ServerError};
pub use store::{cas_path_transform, default_path_transform, PathKey, PathTransform, Store, StoreError};
pub use transport::{TcpTransport, TransportError, TransportOpts};
