//! Configuration types for the filenode
//!
//! This module defines configuration structures used across components.

use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

/// Root configuration for the filenode
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Node configuration
    pub node: NodeConfig,
    /// Metadata index configuration
    pub index: IndexConfig,
    /// Durable storage configuration
    pub store: StoreConfig,
    /// Diagnostic HTTP configuration
    pub http: HttpConfig,
}

/// Node identity configuration
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct NodeConfig {
    /// Node name (human-readable identifier)
    pub name: String,
    /// Data directory for blocks and the cold index
    pub data_dir: PathBuf,
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            name: "filenode".to_string(),
            data_dir: PathBuf::from("/var/lib/filenode"),
        }
    }
}

/// Metadata index configuration
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct IndexConfig {
    /// Quota assigned to a group seen for the first time (bytes)
    pub default_limit: u64,
    /// Expiry of the per-key distributed lock (seconds)
    pub lock_expiry_secs: u64,
    /// Attempts made by the lock client before giving up
    pub lock_tries: u32,
    /// Lower bound of the randomized delay between lock attempts (milliseconds)
    pub lock_min_retry_delay_ms: u64,
    /// Upper bound of the randomized delay between lock attempts (milliseconds)
    pub lock_max_retry_delay_ms: u64,
    /// Keys unused for longer than this are swept to the cold tier (seconds)
    pub persist_ttl_secs: u64,
    /// Interval between sweeps (seconds, 0 disables the periodic sweep)
    pub persist_interval_secs: u64,
    /// Concurrent partitions processed by one sweep
    pub persist_workers: usize,
    /// Keys taken from one partition per sweep
    pub persist_batch: usize,
}

impl Default for IndexConfig {
    fn default() -> Self {
        Self {
            default_limit: 1024 * 1024 * 1024, // 1 GB
            lock_expiry_secs: 20 * 60,
            lock_tries: 32,
            lock_min_retry_delay_ms: 50,
            lock_max_retry_delay_ms: 250,
            persist_ttl_secs: 24 * 60 * 60, // 1 day
            persist_interval_secs: 60 * 60,
            persist_workers: 10,
            persist_batch: 1000,
        }
    }
}

impl IndexConfig {
    /// Lock expiry as a duration
    #[must_use]
    pub const fn lock_expiry(&self) -> Duration {
        Duration::from_secs(self.lock_expiry_secs)
    }

    /// Sweep TTL as a duration
    #[must_use]
    pub const fn persist_ttl(&self) -> Duration {
        Duration::from_secs(self.persist_ttl_secs)
    }
}

/// Durable storage configuration
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreConfig {
    /// Directory holding raw blocks (defaults to `<data_dir>/blocks`)
    pub blocks_path: Option<PathBuf>,
    /// redb file holding evicted index keys (defaults to `<data_dir>/index.redb`)
    pub index_path: Option<PathBuf>,
    /// Directory holding the hot tier snapshot and journal (defaults to `<data_dir>/hot`)
    pub hot_path: Option<PathBuf>,
    /// fsync the hot tier journal after every write
    pub hot_sync_on_write: bool,
    /// Interval between hot tier snapshot checks (seconds, 0 disables them)
    pub hot_snapshot_interval_secs: u64,
    /// Journal size that triggers a hot tier snapshot (bytes)
    pub hot_journal_max_bytes: u64,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            blocks_path: None,
            index_path: None,
            hot_path: None,
            hot_sync_on_write: false,
            hot_snapshot_interval_secs: 60,
            hot_journal_max_bytes: 64 * 1024 * 1024, // 64 MB
        }
    }
}

impl StoreConfig {
    /// Resolve the block directory against the node data directory
    #[must_use]
    pub fn blocks_path(&self, node: &NodeConfig) -> PathBuf {
        self.blocks_path
            .clone()
            .unwrap_or_else(|| node.data_dir.join("blocks"))
    }

    /// Resolve the cold index file against the node data directory
    #[must_use]
    pub fn index_path(&self, node: &NodeConfig) -> PathBuf {
        self.index_path
            .clone()
            .unwrap_or_else(|| node.data_dir.join("index.redb"))
    }

    /// Resolve the hot tier directory against the node data directory
    #[must_use]
    pub fn hot_path(&self, node: &NodeConfig) -> PathBuf {
        self.hot_path
            .clone()
            .unwrap_or_else(|| node.data_dir.join("hot"))
    }
}

/// Diagnostic HTTP configuration
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct HttpConfig {
    /// Address for the stat/check endpoint
    pub listen: SocketAddr,
}

impl Default for HttpConfig {
    fn default() -> Self {
        Self {
            listen: SocketAddr::from(([0, 0, 0, 0], 8000)),
        }
    }
}
