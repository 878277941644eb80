//! cairn-core: shared types, wire format, and cryptographic primitives.
//! All other Cairn crates depend on this one.

pub mod config;
pub mod crypto;
pub mod wire;

pub use wire::{Envelope, FetchIntent, FetchReply, Frame, StoreIntent};
