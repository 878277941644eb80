//! Cryptographic primitives for Cairn.
//!
//! Provides three things:
//!   1. AES-CTR stream encryption for replicated payloads
//!   2. BLAKE3 hashing, to obscure storage keys before they cross the network
//!   3. Random NodeIDs and encryption keys
//!
//! The stream cipher protects payload bytes only. Control messages travel in
//! the clear. Key material is wrapped in `Zeroizing` and wiped on drop.

use std::io;

use aes::{Aes128, Aes192, Aes256};
use ctr::cipher::{KeyIvInit, StreamCipher};
use rand::RngCore;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use zeroize::Zeroizing;

/// IV length: one AES block, written in clear at the front of every ciphertext.
pub const IV_LEN: usize = 16;

/// Length of keys produced by `new_encryption_key`.
pub const KEY_LEN: usize = 32;

/// Chunk size for streaming encryption. Memory use is bounded by this,
/// not by the payload size.
const COPY_BUF_SIZE: usize = 32 * 1024;

/// Symmetric key shared by every node that should read replicated payloads.
pub type EncryptionKey = Zeroizing<Vec<u8>>;

// ── BLAKE3 ────────────────────────────────────────────────────────────────────

/// Hash a byte slice, returning a 32-byte BLAKE3 digest.
pub fn hash(data: &[u8]) -> [u8; 32] {
    *blake3::hash(data).as_bytes()
}

/// Obscure a storage key before it crosses the network.
///
/// Deterministic, so every node derives the same on-disk path for the same
/// key. Not a secret: a collision is a correctness problem, nothing more.
pub fn hash_key(key: &str) -> String {
    hex::encode(hash(key.as_bytes()))
}

// ── Randomness ────────────────────────────────────────────────────────────────

/// Generate a random NodeID (32 bytes, hex encoded).
pub fn generate_id() -> String {
    let mut buf = [0u8; 32];
    rand::thread_rng().fill_bytes(&mut buf);
    hex::encode(buf)
}

/// Generate a fresh random AES-256 key.
pub fn new_encryption_key() -> EncryptionKey {
    let mut key = Zeroizing::new(vec![0u8; KEY_LEN]);
    rand::thread_rng().fill_bytes(&mut key);
    key
}

fn generate_iv() -> [u8; IV_LEN] {
    let mut iv = [0u8; IV_LEN];
    rand::thread_rng().fill_bytes(&mut iv);
    iv
}

// ── Stream cipher ─────────────────────────────────────────────────────────────

/// AES in counter mode, keyed by whichever AES variant the key length selects.
enum Keystream {
    Aes128(ctr::Ctr128BE<Aes128>),
    Aes192(ctr::Ctr128BE<Aes192>),
    Aes256(ctr::Ctr128BE<Aes256>),
}

impl Keystream {
    fn new(key: &[u8], iv: &[u8; IV_LEN]) -> Result<Self, CipherError> {
        let bad_len = |_| CipherError::InvalidKeyLength(key.len());
        match key.len() {
            16 => Ok(Self::Aes128(ctr::Ctr128BE::new_from_slices(key, iv).map_err(bad_len)?)),
            24 => Ok(Self::Aes192(ctr::Ctr128BE::new_from_slices(key, iv).map_err(bad_len)?)),
            32 => Ok(Self::Aes256(ctr::Ctr128BE::new_from_slices(key, iv).map_err(bad_len)?)),
            n => Err(CipherError::InvalidKeyLength(n)),
        }
    }

    fn apply(&mut self, buf: &mut [u8]) {
        match self {
            Self::Aes128(c) => c.apply_keystream(buf),
            Self::Aes192(c) => c.apply_keystream(buf),
            Self::Aes256(c) => c.apply_keystream(buf),
        }
    }
}

/// XOR `src` against the keystream into `dst`, 32 KiB at a time.
/// Returns the number of bytes written to `dst`.
async fn copy_stream<R, W>(stream: &mut Keystream, src: &mut R, dst: &mut W) -> io::Result<u64>
where
    R: AsyncRead + Unpin + ?Sized,
    W: AsyncWrite + Unpin + ?Sized,
{
    let mut buf = vec![0u8; COPY_BUF_SIZE];
    let mut written = 0u64;
    loop {
        let n = src.read(&mut buf).await?;
        if n == 0 {
            break;
        }
        stream.apply(&mut buf[..n]);
        dst.write_all(&buf[..n]).await?;
        written += n as u64;
    }
    dst.flush().await?;
    Ok(written)
}

/// Encrypt `src` into `dst`.
///
/// A fresh IV is written in clear first, then the ciphertext. Returns the
/// total bytes written to `dst`, IV included.
pub async fn copy_encrypt<R, W>(key: &[u8], src: &mut R, dst: &mut W) -> Result<u64, CipherError>
where
    R: AsyncRead + Unpin + ?Sized,
    W: AsyncWrite + Unpin + ?Sized,
{
    let iv = generate_iv();
    let mut stream = Keystream::new(key, &iv)?;

    dst.write_all(&iv).await?;
    let n = copy_stream(&mut stream, src, dst).await?;
    Ok(IV_LEN as u64 + n)
}

/// Decrypt `src` into `dst`.
///
/// Reads the IV from the front of `src`. Returns the plaintext bytes written.
pub async fn copy_decrypt<R, W>(key: &[u8], src: &mut R, dst: &mut W) -> Result<u64, CipherError>
where
    R: AsyncRead + Unpin + ?Sized,
    W: AsyncWrite + Unpin + ?Sized,
{
    // Reject the key before consuming anything from the source.
    Keystream::new(key, &[0u8; IV_LEN])?;

    let mut iv = [0u8; IV_LEN];
    src.read_exact(&mut iv).await.map_err(|e| match e.kind() {
        io::ErrorKind::UnexpectedEof => CipherError::TruncatedIv,
        _ => CipherError::Io(e),
    })?;

    let mut stream = Keystream::new(key, &iv)?;
    Ok(copy_stream(&mut stream, src, dst).await?)
}

// ── Errors ────────────────────────────────────────────────────────────────────

#[derive(Debug, Error)]
pub enum CipherError {
    #[error("unsupported key length {0} (expected 16, 24 or 32 bytes)")]
    InvalidKeyLength(usize),

    #[error("stream ended before a complete {}-byte IV was read", IV_LEN)]
    TruncatedIv,

    #[error("cipher stream I/O failed: {0}")]
    Io(#[from] io::Error),
}

// ── Tests ─────────────────────────────────────────────────────────────────────
