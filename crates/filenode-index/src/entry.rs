//! Index entries
//!
//! Entries are stored bincode-encoded: CID entries as plain string keys,
//! file entries as fields of their space hash, space and group entries
//! as the `info` field of their own hash. Reference counts live next to
//! them as decimal hash fields and are not part of any entry.

use bytes::Bytes;
use filenode_common::{Error, Result};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

/// Current layout version of [`CidEntry`]. Entries found with a lower
/// version are upgraded on load and counted into the global stats.
pub const CID_ENTRY_VERSION: u32 = 1;

/// Current unix time in seconds
pub fn now() -> i64 {
    chrono::Utc::now().timestamp()
}

/// Metadata of one content-addressed block
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CidEntry {
    pub size: u64,
    pub create_time: i64,
    pub update_time: i64,
    /// Number of spaces referencing the block
    pub refs: i64,
    pub version: u32,
}

impl CidEntry {
    pub fn new(size: u64) -> Self {
        let now = now();
        Self {
            size,
            create_time: now,
            update_time: now,
            refs: 0,
            version: CID_ENTRY_VERSION,
        }
    }
}

/// A file: the ordered, duplicate-free list of its CIDs
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileEntry {
    pub cids: Vec<String>,
    /// Sum of the sizes of `cids`
    pub size: u64,
    pub create_time: i64,
    pub update_time: i64,
}

impl FileEntry {
    pub fn new(now: i64) -> Self {
        Self {
            create_time: now,
            update_time: now,
            ..Self::default()
        }
    }

    pub fn exists(&self, cid: &str) -> bool {
        self.cids.iter().any(|c| c == cid)
    }
}

/// Per-space accounting
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SpaceEntry {
    pub group_id: String,
    /// Sum of the sizes of distinct CIDs in the space
    pub size: u64,
    pub file_count: u64,
    pub cid_count: u64,
    /// Isolated quota, zero when the space shares the group pool
    pub limit: u64,
    pub create_time: i64,
    pub update_time: i64,
}

impl SpaceEntry {
    pub fn new(group_id: impl Into<String>, now: i64) -> Self {
        Self {
            group_id: group_id.into(),
            create_time: now,
            update_time: now,
            ..Self::default()
        }
    }

    /// Whether the space has its own quota carved out of the group
    pub const fn is_isolated(&self) -> bool {
        self.limit > 0
    }
}

/// Per-group accounting
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct GroupEntry {
    pub group_id: String,
    /// Sum of the sizes of distinct CIDs across non-isolated spaces
    pub size: u64,
    pub cid_count: u64,
    pub space_ids: Vec<String>,
    /// Shared pool: `account_limit` minus the isolated space limits
    pub limit: u64,
    /// Total quota bought for the group
    pub account_limit: u64,
    pub create_time: i64,
    pub update_time: i64,
}

impl GroupEntry {
    pub fn new(group_id: impl Into<String>, limit: u64, now: i64) -> Self {
        Self {
            group_id: group_id.into(),
            limit,
            account_limit: limit,
            create_time: now,
            update_time: now,
            ..Self::default()
        }
    }

    pub fn has_space(&self, space_id: &str) -> bool {
        self.space_ids.iter().any(|s| s == space_id)
    }

    /// Record membership of a space. Returns `true` when newly added.
    pub fn add_space_id(&mut self, space_id: &str) -> bool {
        if self.has_space(space_id) {
            return false;
        }
        self.space_ids.push(space_id.to_string());
        true
    }

    /// Drop membership of a space. Returns `true` when it was a member.
    pub fn remove_space_id(&mut self, space_id: &str) -> bool {
        let before = self.space_ids.len();
        self.space_ids.retain(|s| s != space_id);
        self.space_ids.len() != before
    }
}

pub fn encode<T: Serialize>(value: &T) -> Result<Bytes> {
    bincode::serialize(value)
        .map(Bytes::from)
        .map_err(|e| Error::Serialization(e.to_string()))
}

pub fn decode<T: DeserializeOwned>(data: &[u8]) -> Result<T> {
    bincode::deserialize(data).map_err(|e| Error::Deserialization(e.to_string()))
}

/// Encode a reference count hash field
pub fn encode_ref(count: i64) -> Bytes {
    Bytes::from(count.to_string())
}

/// Parse a reference count hash field; garbage reads as zero
pub fn decode_ref(data: &[u8]) -> i64 {
    std::str::from_utf8(data)
        .ok()
        .and_then(|s| s.trim().parse().ok())
        .unwrap_or(0)
}

/// Encode the CID list of a file in the pre-group layout
#[cfg(test)]
pub fn encode_legacy_file(cids: &[String]) -> Result<Bytes> {
    let raw = bincode::serialize(cids).map_err(|e| Error::Serialization(e.to_string()))?;
    snap::raw::Encoder::new()
        .compress_vec(&raw)
        .map(Bytes::from)
        .map_err(|e| Error::Serialization(e.to_string()))
}

/// Decode the CID list of a file in the pre-group layout
pub fn decode_legacy_file(data: &[u8]) -> Result<Vec<String>> {
    let raw = snap::raw::Decoder::new()
        .decompress_vec(data)
        .map_err(|e| Error::Deserialization(e.to_string()))?;
    decode(&raw)
}
