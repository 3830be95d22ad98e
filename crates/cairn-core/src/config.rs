//! Configuration system for cairn.
//!
//! Resolution order: environment variables → config file → defaults.
//!
//! Config file location:
//!   1. $CAIRN_CONFIG (explicit override)
//!   2. $XDG_CONFIG_HOME/cairn/config.toml
//!   3. ~/.config/cairn/config.toml

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

/// Top-level configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct CairnConfig {
    pub node: NodeConfig,
    pub storage: StorageConfig,
    pub transport: TransportConfig,
    pub replication: ReplicationConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct NodeConfig {
    /// Storage namespace for this node. Empty = random id per process.
    pub id: String,
    /// TCP listen address, e.g. "0.0.0.0:3000".
    pub listen_addr: String,
    /// Peers dialed at startup. Empty entries are skipped.
    pub bootstrap: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    pub root: PathBuf,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TransportConfig {
    /// Capacity of the control-frame channel between read loops and the
    /// dispatch loop. A full channel blocks the read loops.
    pub rpc_buffer: usize,
    /// Remote IPs allowed to connect. Empty = accept everyone.
    pub allowed_peers: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ReplicationConfig {
    /// Encrypt replicated payloads with this node's key. Peers then hold
    /// opaque copies only this node can read back.
    pub encrypt: bool,
    /// How long `get` waits for each peer's reply stream.
    pub fetch_timeout_ms: u64,
}

impl ReplicationConfig {
    pub fn fetch_timeout(&self) -> Duration {
        Duration::from_millis(self.fetch_timeout_ms)
    }
}

// ── Defaults ──────────────────────────────────────────────────────────────────

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            id: String::new(),
            listen_addr: "0.0.0.0:3000".to_string(),
            bootstrap: Vec::new(),
        }
    }
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            root: data_dir().join("network"),
        }
    }
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            rpc_buffer: 1024,
            allowed_peers: Vec::new(),
        }
    }
}

impl Default for ReplicationConfig {
    fn default() -> Self {
        Self {
            encrypt: false,
            fetch_timeout_ms: 2_000,
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
}

// ── Loading ───────────────────────────────────────────────────────────────────

impl CairnConfig {
    /// Load config: env vars → file → defaults.
    pub fn load() -> Result<Self, ConfigError> {
        Self::load_from(Self::file_path())
    }

    /// Load from an explicit path. A missing file yields defaults.
    pub fn load_from(path: PathBuf) -> Result<Self, ConfigError> {
        let mut config = if path.exists() {
            let text = std::fs::read_to_string(&path)
                .map_err(|e| ConfigError::ReadFailed(path.clone(), e))?;
            toml::from_str(&text).map_err(|e| ConfigError::ParseFailed(path.clone(), e))?
        } else {
            CairnConfig::default()
        };
        config.apply_env_overrides();
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

    /// Apply CAIRN_* env var overrides.
    fn apply_env_overrides(&mut self) {
        if let Ok(v) = std::env::var("CAIRN_NODE__ID") {
            self.node.id = v;
        }
        if let Ok(v) = std::env::var("CAIRN_NODE__LISTEN_ADDR") {
            self.node.listen_addr = v;
        }
        if let Ok(v) = std::env::var("CAIRN_NODE__BOOTSTRAP") {
            self.node.bootstrap = parse_list(&v);
        }
        if let Ok(v) = std::env::var("CAIRN_STORAGE__ROOT") {
            self.storage.root = PathBuf::from(v);
        }
        if let Ok(v) = std::env::var("CAIRN_TRANSPORT__RPC_BUFFER") {
            if let Ok(n) = v.parse() {
                self.transport.rpc_buffer = n;
            }
        }
        if let Ok(v) = std::env::var("CAIRN_TRANSPORT__ALLOWED_PEERS") {
            self.transport.allowed_peers = parse_list(&v);
        }
        if let Ok(v) = std::env::var("CAIRN_REPLICATION__ENCRYPT") {
            self.replication.encrypt = v == "true" || v == "1";
        }
        if let Ok(v) = std::env::var("CAIRN_REPLICATION__FETCH_TIMEOUT_MS") {
            if let Ok(ms) = v.parse() {
                self.replication.fetch_timeout_ms = ms;
            }
        }
    }
}

/// Split a comma-separated list, dropping blanks.
fn parse_list(v: &str) -> Vec<String> {
    v.split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(String::from)
        .collect()
}
