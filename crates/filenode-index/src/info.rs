//! Read-only views returned to callers

use serde::{Deserialize, Serialize};

/// One file of a space
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileInfo {
    pub file_id: String,
    pub usage_bytes: u64,
    pub cids_count: u64,
}

/// Usage and quota of a space
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct SpaceInfo {
    /// Quota that applies to the space: its own when isolated, the group pool otherwise
    pub limit_bytes: u64,
    /// Usage counted against `limit_bytes`
    pub total_usage_bytes: u64,
    pub space_usage_bytes: u64,
    pub cids_count: u64,
    pub files_count: u64,
}

/// Usage and quota of a group and its spaces
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct GroupInfo {
    pub limit_bytes: u64,
    pub account_limit_bytes: u64,
    pub total_usage_bytes: u64,
    pub cids_count: u64,
    pub spaces: Vec<GroupSpaceInfo>,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct GroupSpaceInfo {
    pub space_id: String,
    pub limit_bytes: u64,
    pub space_usage_bytes: u64,
    pub cids_count: u64,
    pub files_count: u64,
}

/// Global CID counters
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct IndexStats {
    pub cid_count: i64,
    pub cid_size_sum: i64,
}
