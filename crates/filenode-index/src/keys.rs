//! Hot tier key naming
//!
//! These names are shared with existing deployments and must not change.
//! Space and group hashes carry the group id as a `{hash tag}` so a space
//! always lands on the same cluster slot as its group.

use filenode_common::{Cid, Key};
use xxhash_rust::xxh64::xxh64;

/// Hash field holding the serialized entry of a space or group
pub const INFO_KEY: &str = "info";

/// Prefix of CID keys and of CID ref-count hash fields
pub const CID_PREFIX: &str = "c:";

/// Prefix of file entry hash fields
pub const FILE_PREFIX: &str = "f:";

/// Number of partitions of the last-used sets and bloom filters
pub const PARTITION_COUNT: u64 = 256;

/// Global counter of known CIDs
pub const CID_COUNT_KEY: &str = "cidCount";

/// Global counter of the bytes of known CIDs
pub const CID_SIZE_SUM_KEY: &str = "cidSizeSum";

/// Pub/sub channel announcing newly indexed CIDs
pub const CID_UPLOADED_CHANNEL: &str = "cidUploaded";

/// Key (and hash field) of a CID
pub fn cid_key(cid: &Cid) -> String {
    format!("{CID_PREFIX}{cid}")
}

/// Hash field of a CID given in string form
pub fn cid_field(cid: &str) -> String {
    format!("{CID_PREFIX}{cid}")
}

/// Hash field of a file entry
pub fn file_key(file_id: &str) -> String {
    format!("{FILE_PREFIX}{file_id}")
}

/// Hash of a space
pub fn space_key(key: &Key) -> String {
    format!("s:{}.{{{}}}", key.space_id, key.group_id)
}

/// Hash of a group
pub fn group_key(group_id: &str) -> String {
    format!("g:{{{group_id}}}")
}

/// Hash of a space written before spaces belonged to groups
pub fn legacy_space_key(space_id: &str) -> String {
    format!("s:{space_id}")
}

/// Marker set once a space is deleted upstream
pub fn deleted_space_key(space_id: &str) -> String {
    format!("del:{space_id}")
}

/// Distributed lock guarding `key`
pub fn lock_key(key: &str) -> String {
    format!("_lock:{key}")
}

/// Partition of a key for last-used tracking and bloom filters
pub fn partition(key: &str) -> u64 {
    xxh64(key.as_bytes(), 0) % PARTITION_COUNT
}

/// Sorted set of last-used times for a partition
pub fn last_used_key(partition: u64) -> String {
    format!("_lu:{{{partition}}}")
}

/// Bloom filter of persisted keys for a partition
pub fn bloom_key(partition: u64) -> String {
    format!("_bf:{{{partition}}}")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_key_names() {
        let key = Key::new("group1", "space1");
        assert_eq!(space_key(&key), "s:space1.{group1}");
        assert_eq!(group_key("group1"), "g:{group1}");
        assert_eq!(legacy_space_key("space1"), "s:space1");
        assert_eq!(file_key("file1"), "f:file1");
        assert_eq!(lock_key("g:{group1}"), "_lock:g:{group1}");
        assert_eq!(last_used_key(7), "_lu:{7}");
        assert_eq!(bloom_key(255), "_bf:{255}");

        let cid = Cid::from_data(b"data");
        assert_eq!(cid_key(&cid), cid_field(&cid.to_string()));
        assert!(cid_key(&cid).starts_with(CID_PREFIX));
    }

    #[test]
    fn test_partition_stable() {
        for key in ["g:{a}", "s:b.{a}", "c:abc"] {
            let p = partition(key);
            assert!(p < PARTITION_COUNT);
            assert_eq!(p, partition(key));
        }
    }
}
