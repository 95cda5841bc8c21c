//! Core type definitions for the filenode
//!
//! This module defines the tenant key, content identifiers and blocks
//! used throughout the system.

use bytes::Bytes;
use derive_more::Display;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fmt;
use std::str::FromStr;

/// Length of a content identifier digest in bytes
pub const CID_LEN: usize = 32;

/// Tenant scope: a space inside the group that is billed for it.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize, Display)]
#[display("{group_id}/{space_id}")]
pub struct Key {
    /// Billing/account unit
    pub group_id: String,
    /// Tenant space
    pub space_id: String,
}

impl Key {
    /// Create a new key
    pub fn new(group_id: impl Into<String>, space_id: impl Into<String>) -> Self {
        Self {
            group_id: group_id.into(),
            space_id: space_id.into(),
        }
    }

    /// Key addressing only a group (used by group-wide maintenance)
    pub fn group(group_id: impl Into<String>) -> Self {
        Self::new(group_id, String::new())
    }
}

/// Content identifier: the SHA-256 digest of a block
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Cid([u8; CID_LEN]);

impl Cid {
    /// Compute the content id of `data`
    #[must_use]
    pub fn from_data(data: &[u8]) -> Self {
        let digest = Sha256::digest(data);
        let mut bytes = [0u8; CID_LEN];
        bytes.copy_from_slice(&digest);
        Self(bytes)
    }

    /// Create from a raw digest
    #[must_use]
    pub const fn from_bytes(bytes: [u8; CID_LEN]) -> Self {
        Self(bytes)
    }

    /// Get the raw digest
    #[must_use]
    pub const fn as_bytes(&self) -> &[u8; CID_LEN] {
        &self.0
    }

    /// Check that `data` hashes to this id
    #[must_use]
    pub fn verify(&self, data: &[u8]) -> bool {
        Self::from_data(data) == *self
    }
}

impl fmt::Debug for Cid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Cid({})", hex::encode(self.0))
    }
}

impl fmt::Display for Cid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&hex::encode(self.0))
    }
}

impl FromStr for Cid {
    type Err = CidParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s.len() != CID_LEN * 2 {
            return Err(CidParseError::InvalidLength(s.len()));
        }
        let mut bytes = [0u8; CID_LEN];
        hex::decode_to_slice(s, &mut bytes)
            .map_err(|_| CidParseError::InvalidEncoding(s.to_string()))?;
        Ok(Self(bytes))
    }
}

/// Content id parsing errors
#[derive(Debug, Clone, thiserror::Error)]
pub enum CidParseError {
    #[error("cid must be {expected} hex characters, got {0}", expected = CID_LEN * 2)]
    InvalidLength(usize),
    #[error("cid is not valid hex: {0}")]
    InvalidEncoding(String),
}

/// An immutable block of bytes addressed by its content id
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Block {
    pub cid: Cid,
    pub data: Bytes,
}

impl Block {
    /// Create a block, deriving its content id from the data
    pub fn new(data: impl Into<Bytes>) -> Self {
        let data = data.into();
        Self {
            cid: Cid::from_data(&data),
            data,
        }
    }

    /// Size of the block in bytes
    #[must_use]
    pub fn size(&self) -> u64 {
        self.data.len() as u64
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::RngCore;

    #[test]
    fn test_cid_parse() {
        let mut data = vec![0u8; 1024];
        rand::thread_rng().fill_bytes(&mut data);
        let cid = Cid::from_data(&data);

        let parsed: Cid = cid.to_string().parse().unwrap();
        assert_eq!(parsed, cid);
        assert!(parsed.verify(&data));
    }

    #[test]
    fn test_cid_parse_invalid() {
        assert!(matches!(
            "abc".parse::<Cid>(),
            Err(CidParseError::InvalidLength(3))
        ));
        assert_eq!(
            CidParseError::InvalidLength(3).to_string(),
            "cid must be 64 hex characters, got 3"
        );
        let not_hex = "z".repeat(CID_LEN * 2);
        assert!(matches!(
            not_hex.parse::<Cid>(),
            Err(CidParseError::InvalidEncoding(_))
        ));
    }

    #[test]
    fn test_block_size() {
        let block = Block::new(vec![7u8; 100]);
        assert_eq!(block.size(), 100);
        assert!(block.cid.verify(&block.data));
    }

    #[test]
    fn test_key_display() {
        let key = Key::new("group", "space");
        assert_eq!(key.to_string(), "group/space");
        assert!(Key::group("group").space_id.is_empty());
    }
}
