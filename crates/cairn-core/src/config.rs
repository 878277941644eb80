//! Configuration system for Cairn.
//!
//! Resolution order: environment variables → config file → defaults.
//!
//! Config file location:
//!   1. $CAIRN_CONFIG (explicit override)
//!   2. $XDG_CONFIG_HOME/cairn/config.toml
//!   3. ~/.config/cairn/config.toml

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use zeroize::Zeroizing;

use crate::crypto::EncryptionKey;
use crate::wire::{DELIVERY_QUEUE_CAPACITY, MAX_ENVELOPE_SIZE};

/// Top-level configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CairnConfig {
    pub node: NodeConfig,
    pub network: NetworkConfig,
    pub storage: StorageConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct NodeConfig {
    /// NodeID. Empty = random per process.
    pub id: String,
    /// Hex-encoded AES key shared by the cluster. Empty = random per process,
    /// which means replicas written by this node are unreadable elsewhere.
    pub encryption_key: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct NetworkConfig {
    /// TCP listen address.
    pub listen_addr: String,
    /// Peers dialed at startup. Empty entries are skipped.
    pub bootstrap_nodes: Vec<String>,
    /// How long to wait for a peer to start a promised stream.
    pub stream_timeout_ms: u64,
    /// Capacity of the inbound control message queue.
    pub delivery_queue: usize,
    /// Largest control message accepted from a peer.
    pub max_envelope_bytes: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    /// Root of the content store. One subdirectory per NodeID.
    pub root: PathBuf,
}

// ── Defaults ──────────────────────────────────────────────────────────────────

impl Default for CairnConfig {
    fn default() -> Self {
        Self {
            node: NodeConfig::default(),
            network: NetworkConfig::default(),
            storage: StorageConfig::default(),
        }
    }
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            id: String::new(),
            encryption_key: String::new(),
        }
    }
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            listen_addr: "0.0.0.0:3000".to_string(),
            bootstrap_nodes: Vec::new(),
            stream_timeout_ms: 2_000,
            delivery_queue: DELIVERY_QUEUE_CAPACITY,
            max_envelope_bytes: MAX_ENVELOPE_SIZE,
        }
    }
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            root: data_dir().join("store"),
        }
    }
}

// ── Path helpers ──────────────────────────────────────────────────────────────

fn config_dir() -> PathBuf {
    std::env::var("XDG_CONFIG_HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| dirs_or_home().join(".config"))
        .join("cairn")
}

pub fn data_dir() -> PathBuf {
    std::env::var("XDG_DATA_HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| dirs_or_home().join(".local").join("share"))
        .join("cairn")
}

fn dirs_or_home() -> PathBuf {
    std::env::var("HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| PathBuf::from("/tmp"))
}

// ── Errors ────────────────────────────────────────────────────────────────────

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read {0}: {1}")]
    ReadFailed(PathBuf, std::io::Error),
    #[error("failed to parse {0}: {1}")]
    ParseFailed(PathBuf, toml::de::Error),
    #[error("failed to write {0}: {1}")]
    WriteFailed(PathBuf, std::io::Error),
    #[error("failed to serialize: {0}")]
    SerializeFailed(toml::ser::Error),
    #[error("encryption key is not valid hex: {0}")]
    InvalidKey(hex::FromHexError),
    #[error("encryption key must be 16, 24 or 32 bytes, got {0}")]
    InvalidKeyLength(usize),
}

// ── Loading ───────────────────────────────────────────────────────────────────

impl CairnConfig {
    /// Load config: env vars → file → defaults.
    pub fn load() -> Result<Self, ConfigError> {
        let path = Self::file_path();
        let mut config = if path.exists() {
            let text = std::fs::read_to_string(&path)
                .map_err(|e| ConfigError::ReadFailed(path.clone(), e))?;
            toml::from_str(&text).map_err(|e| ConfigError::ParseFailed(path.clone(), e))?
        } else {
            CairnConfig::default()
        };
        config.apply_overrides(|name| std::env::var(name).ok());
        Ok(config)
    }

    /// Config file path.
    pub fn file_path() -> PathBuf {
        std::env::var("CAIRN_CONFIG")
            .map(PathBuf::from)
            .unwrap_or_else(|_| config_dir().join("config.toml"))
    }

    /// Write default config if none exists. Returns the path.
    pub fn write_default_if_missing() -> Result<PathBuf, ConfigError> {
        let path = Self::file_path();
        if !path.exists() {
            if let Some(parent) = path.parent() {
                std::fs::create_dir_all(parent)
                    .map_err(|e| ConfigError::WriteFailed(path.clone(), e))?;
            }
            let text = toml::to_string_pretty(&CairnConfig::default())
                .map_err(ConfigError::SerializeFailed)?;
            std::fs::write(&path, text).map_err(|e| ConfigError::WriteFailed(path.clone(), e))?;
        }
        Ok(path)
    }

    /// Decode the configured cluster key. `None` when unset.
    pub fn encryption_key(&self) -> Result<Option<EncryptionKey>, ConfigError> {
        if self.node.encryption_key.is_empty() {
            return Ok(None);
        }
        let bytes = Zeroizing::new(
            hex::decode(self.node.encryption_key.trim()).map_err(ConfigError::InvalidKey)?,
        );
        if !matches!(bytes.len(), 16 | 24 | 32) {
            return Err(ConfigError::InvalidKeyLength(bytes.len()));
        }
        Ok(Some(bytes))
    }

    /// Apply CAIRN_* overrides from `lookup` (the process env in production).
    fn apply_overrides(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        if let Some(v) = lookup("CAIRN_NODE__ID") {
            self.node.id = v;
        }
        if let Some(v) = lookup("CAIRN_NODE__ENCRYPTION_KEY") {
            self.node.encryption_key = v;
        }
        if let Some(v) = lookup("CAIRN_NETWORK__LISTEN_ADDR") {
            self.network.listen_addr = v;
        }
        if let Some(v) = lookup("CAIRN_NETWORK__BOOTSTRAP_NODES") {
            self.network.bootstrap_nodes = v
                .split(',')
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .map(String::from)
                .collect();
        }
        if let Some(v) = lookup("CAIRN_NETWORK__STREAM_TIMEOUT_MS") {
            if let Ok(ms) = v.parse() {
                self.network.stream_timeout_ms = ms;
            }
        }
        if let Some(v) = lookup("CAIRN_NETWORK__DELIVERY_QUEUE") {
            if let Ok(n) = v.parse() {
                self.network.delivery_queue = n;
            }
        }
        if let Some(v) = lookup("CAIRN_NETWORK__MAX_ENVELOPE_BYTES") {
            if let Ok(n) = v.parse() {
                self.network.max_envelope_bytes = n;
            }
        }
        if let Some(v) = lookup("CAIRN_STORAGE__ROOT") {
            self.storage.root = PathBuf::from(v);
        }
    }
}
