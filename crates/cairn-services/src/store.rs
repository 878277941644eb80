//! Content-addressed file store.
//!
//! Files live under one directory per NodeID, at a path derived from the
//! storage key:
//!   {root}/{node_id}/9c6a8/69ebf/.../82781/9c6a869ebf...4582781
//!
//! The segmented directories only bound per-directory fan-out. Deleting a key
//! removes its whole first-segment directory, which takes every other key in
//! that bucket with it.
//!
//! Writes go to a `.partial` sibling that is renamed into place only once the
//! whole payload has landed, so a failed write never leaves a readable key.

use std::io;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};

use sha1::{Digest, Sha1};
use thiserror::Error;
use tokio::fs::{self, File};
use tokio::io::{AsyncRead, AsyncWriteExt};

use cairn_core::crypto::{copy_decrypt, CipherError, IV_LEN};

/// Hex characters per directory segment.
pub const SEGMENT_LEN: usize = 5;

static PARTIAL_SEQ: AtomicU64 = AtomicU64::new(0);

/// On-disk location of a key relative to its namespace directory.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PathKey {
    pub segments: Vec<String>,
    pub file_name: String,
}

impl PathKey {
    /// Directory holding the file.
    pub fn dir(&self) -> PathBuf {
        self.segments.iter().collect()
    }

    pub fn full_path(&self) -> PathBuf {
        self.dir().join(&self.file_name)
    }

    /// The top-level entry `delete` removes.
    pub fn first_segment(&self) -> &str {
        self.segments.first().unwrap_or(&self.file_name)
    }
}

/// Maps a storage key to its on-disk location.
pub type PathTransform = fn(&str) -> PathKey;

/// SHA-1 the key, hex encode it, and split it into 5-character segments.
pub fn cas_path_transform(key: &str) -> PathKey {
    let hex = hex::encode(Sha1::digest(key.as_bytes()));
    let segments = (0..hex.len() / SEGMENT_LEN)
        .map(|i| hex[i * SEGMENT_LEN..(i + 1) * SEGMENT_LEN].to_string())
        .collect();
    PathKey {
        segments,
        file_name: hex,
    }
}

/// Use the key verbatim as a file name directly under the namespace.
pub fn default_path_transform(key: &str) -> PathKey {
    PathKey {
        segments: Vec::new(),
        file_name: key.to_string(),
    }
}

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("failed to {op} {}: {source}", path.display())]
    Io {
        op: &'static str,
        path: PathBuf,
        source: io::Error,
    },

    #[error("key {key} not found under node {node_id}")]
    NotFound { node_id: String, key: String },

    #[error("stream ended after {got} of {expected} bytes")]
    ShortStream { expected: u64, got: u64 },

    #[error(transparent)]
    Cipher(#[from] CipherError),
}

fn io_err<'a>(op: &'static str, path: &'a Path) -> impl FnOnce(io::Error) -> StoreError + 'a {
    move |source| StoreError::Io {
        op,
        path: path.to_path_buf(),
        source,
    }
}

/// Content-addressed store rooted at one directory.
///
/// Keys are opaque here. The file server always hands in `hash_key(key)`,
/// never the caller's key, so `has(node_id, hash_key("x"))` is the form
/// that matches what it wrote.
#[derive(Clone)]
pub struct Store {
    root: PathBuf,
    transform: PathTransform,
}

impl Store {
    pub fn new(root: impl Into<PathBuf>, transform: PathTransform) -> Self {
        Self {
            root: root.into(),
            transform,
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Absolute path of a key. Pure: never touches the disk.
    pub fn path_for(&self, node_id: &str, key: &str) -> PathBuf {
        self.root.join(node_id).join((self.transform)(key).full_path())
    }

    /// True if the key exists for this node. Any stat failure counts as absent.
    pub fn has(&self, node_id: &str, key: &str) -> bool {
        std::fs::metadata(self.path_for(node_id, key)).is_ok()
    }

    /// Copy everything from `reader` into the key's file, replacing it.
    pub async fn write<R>(&self, node_id: &str, key: &str, reader: &mut R) -> Result<u64, StoreError>
    where
        R: AsyncRead + Unpin + ?Sized,
    {
        let (partial, mut file) = self.create_partial(node_id, key).await?;
        let result = async {
            let n = tokio::io::copy(reader, &mut file)
                .await
                .map_err(io_err("write", &partial.tmp))?;
            file.flush().await.map_err(io_err("flush", &partial.tmp))?;
            Ok::<_, StoreError>(n)
        }
        .await;
        drop(file);
        let n = partial.finish(result).await?;
        tracing::debug!(path = %partial.path.display(), bytes = n, "written to disk");
        Ok(n)
    }

    /// Like `write`, but `reader` carries `size` bytes of ciphertext that are
    /// decrypted on the way in. Fewer bytes than `size` is an error, and the
    /// key is left as it was.
    pub async fn write_decrypt<R>(
        &self,
        enc_key: &[u8],
        node_id: &str,
        key: &str,
        reader: &mut R,
        size: u64,
    ) -> Result<u64, StoreError>
    where
        R: AsyncRead + Unpin + ?Sized,
    {
        let (partial, mut file) = self.create_partial(node_id, key).await?;
        let result = async {
            let n = copy_decrypt(enc_key, reader, &mut file).await?;
            file.flush().await.map_err(io_err("flush", &partial.tmp))?;
            let got = n + IV_LEN as u64;
            if got != size {
                return Err(StoreError::ShortStream { expected: size, got });
            }
            Ok::<_, StoreError>(n)
        }
        .await;
        drop(file);
        let n = partial.finish(result).await?;
        tracing::debug!(path = %partial.path.display(), bytes = n, "decrypted to disk");
        Ok(n)
    }

    /// Open a key for reading. Returns its size and a reader at offset 0.
    pub async fn read(&self, node_id: &str, key: &str) -> Result<(u64, File), StoreError> {
        let path = self.path_for(node_id, key);
        let file = match File::open(&path).await {
            Ok(f) => f,
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                return Err(StoreError::NotFound {
                    node_id: node_id.to_string(),
                    key: key.to_string(),
                })
            }
            Err(e) => return Err(io_err("open", &path)(e)),
        };
        let size = file.metadata().await.map_err(io_err("stat", &path))?.len();
        Ok((size, file))
    }

    /// Remove the key's first path segment, and everything under it.
    pub async fn delete(&self, node_id: &str, key: &str) -> Result<(), StoreError> {
        let path_key = (self.transform)(key);
        let target = self.root.join(node_id).join(path_key.first_segment());

        let result = match fs::metadata(&target).await {
            Ok(meta) if meta.is_dir() => fs::remove_dir_all(&target).await,
            Ok(_) => fs::remove_file(&target).await,
            Err(e) => Err(e),
        };
        match result {
            Ok(()) => {
                tracing::debug!(path = %target.display(), "deleted from disk");
                Ok(())
            }
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(io_err("delete", &target)(e)),
        }
    }

    /// Remove the whole store. Test teardown only.
    pub async fn clear(&self) -> Result<(), StoreError> {
        match fs::remove_dir_all(&self.root).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(io_err("clear", &self.root)(e)),
        }
    }

    async fn create_partial(&self, node_id: &str, key: &str) -> Result<(Partial, File), StoreError> {
        let path = self.path_for(node_id, key);
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)
                .await
                .map_err(io_err("create directory", parent))?;
        }
        let mut name = path.file_name().unwrap_or_default().to_os_string();
        name.push(format!(".{}.partial", PARTIAL_SEQ.fetch_add(1, Ordering::Relaxed)));
        let tmp = path.with_file_name(name);
        let file = File::create(&tmp).await.map_err(io_err("create", &tmp))?;
        Ok((Partial { path, tmp }, file))
    }
}

/// A write in progress: `tmp` becomes `path` only on success.
struct Partial {
    path: PathBuf,
    tmp: PathBuf,
}

impl Partial {
    async fn finish(&self, result: Result<u64, StoreError>) -> Result<u64, StoreError> {
        match result {
            Ok(n) => {
                fs::rename(&self.tmp, &self.path)
                    .await
                    .map_err(io_err("rename", &self.tmp))?;
                Ok(n)
            }
            Err(e) => {
                if let Err(rm) = fs::remove_file(&self.tmp).await {
                    tracing::warn!(path = %self.tmp.display(), error = %rm, "failed to remove partial file");
                }
                Err(e)
            }
        }
    }
}
