//! Unbinding files
//!
//! Removing a file drops one reference from every CID it holds. A CID
//! whose last reference in the space (or group) goes away is removed
//! from that hash and its size is released.

use crate::FileIndex;
use crate::cids::LoadedCid;
use crate::entry::{FileEntry, decode, decode_ref};
use crate::keys::{cid_key, file_key};
use crate::loader::SpaceLock;
use filenode_common::{Key, Result};
use filenode_store::{Cmd, Reply};
use tracing::{debug, warn};

impl FileIndex {
    /// Remove files from a space. Unknown file ids are ignored.
    pub async fn file_unbind(&self, key: &Key, file_ids: &[String]) -> Result<()> {
        self.check_space_not_deleted(key).await?;
        let mut lock = self.acquire_space(key).await?;
        let mut result = Ok(());
        for file_id in file_ids {
            result = self.unbind_locked(&mut lock, file_id).await;
            if result.is_err() {
                break;
            }
        }
        lock.release().await;
        result
    }

    pub(crate) async fn unbind_locked(&self, lock: &mut SpaceLock, file_id: &str) -> Result<()> {
        let file_field = file_key(file_id);
        let Some(data) = self.fast.hget(&lock.space_key, &file_field).await? else {
            debug!("File '{}' not found in {}", file_id, lock.key);
            return Ok(());
        };
        let file: FileEntry = decode(&data)?;
        let mut cids = self.cid_entries_by_string(&file.cids).await?;
        let result = self
            .unbind_file(lock, file_field, &mut cids.entries)
            .await;
        cids.release().await;
        result
    }

    async fn unbind_file(
        &self,
        lock: &mut SpaceLock,
        file_field: String,
        cids: &mut [LoadedCid],
    ) -> Result<()> {
        let isolated = lock.space.is_isolated();
        let mut reads = Vec::with_capacity(cids.len() * 2);
        for loaded in cids.iter() {
            let field = cid_key(&loaded.cid);
            if !isolated {
                reads.push(Cmd::hget(lock.group_key.clone(), field.clone()));
            }
            reads.push(Cmd::hget(lock.space_key.clone(), field));
        }
        let mut replies = self.fast.pipeline(reads).await?.into_iter();

        let mut cmds = Vec::with_capacity(cids.len() * 2 + 3);
        let mut left_space = Vec::new();
        for (i, loaded) in cids.iter().enumerate() {
            let field = cid_key(&loaded.cid);
            let size = loaded.entry.size;
            if !isolated {
                match release_ref(&lock.group_key, &field, replies.next()) {
                    Release::Last(cmd) => {
                        lock.group.cid_count = lock.group.cid_count.saturating_sub(1);
                        lock.group.size = lock.group.size.saturating_sub(size);
                        cmds.push(cmd);
                    }
                    Release::Shared(cmd) => cmds.push(cmd),
                    Release::Missing => {
                        warn!("Cid {} missing from group {}", loaded.cid, lock.group_key);
                    }
                }
            }
            match release_ref(&lock.space_key, &field, replies.next()) {
                Release::Last(cmd) => {
                    lock.space.cid_count = lock.space.cid_count.saturating_sub(1);
                    lock.space.size = lock.space.size.saturating_sub(size);
                    cmds.push(cmd);
                    left_space.push(i);
                }
                Release::Shared(cmd) => cmds.push(cmd),
                Release::Missing => {
                    warn!("Cid {} missing from space {}", loaded.cid, lock.space_key);
                }
            }
        }

        lock.space.file_count = lock.space.file_count.saturating_sub(1);
        cmds.push(Cmd::hdel(lock.space_key.clone(), file_field));
        cmds.extend(lock.save_cmds()?);
        self.fast.transaction(cmds).await?;

        for i in left_space {
            let loaded = &mut cids[i];
            loaded.entry.refs -= 1;
            loaded.entry.update_time = crate::entry::now();
            if let Err(e) = self.save_cid_entry(loaded).await {
                warn!("Failed to update refs of cid {}: {}", loaded.cid, e);
            }
        }
        Ok(())
    }
}

enum Release {
    /// The last reference: the field is removed
    Last(Cmd),
    /// Other references remain: the field is decremented
    Shared(Cmd),
    /// Nothing to release
    Missing,
}

fn release_ref(key: &str, field: &str, reply: Option<Reply>) -> Release {
    match reply.and_then(Reply::into_data) {
        None => Release::Missing,
        Some(data) if decode_ref(&data) <= 1 => Release::Last(Cmd::hdel(key, field)),
        Some(_) => Release::Shared(Cmd::hincr_by(key, field, -1)),
    }
}

#[cfg(test)]
mod tests {
    use crate::testutil::TestIndex;
    use filenode_common::Key;
    use filenode_store::FastStore;

    #[tokio::test]
    async fn test_shared_cid_between_files() {
        let t = TestIndex::new();
        let key = Key::new("g", "s");
        let blocks = t.blocks(&[10, 20, 30]).await;

        t.bind(&key, "a", &blocks).await;
        t.bind(&key, "b", &blocks[..2]).await;
        let info = t.index.space_info(&key).await.unwrap();
        assert_eq!(info.space_usage_bytes, 60);
        assert_eq!(info.cids_count, 3);
        assert_eq!(info.files_count, 2);

        t.index.file_unbind(&key, &["a".to_string()]).await.unwrap();
        let info = t.index.space_info(&key).await.unwrap();
        assert_eq!(info.space_usage_bytes, 30);
        assert_eq!(info.cids_count, 2);
        assert_eq!(info.files_count, 1);

        let group = t.index.group_info("g").await.unwrap();
        assert_eq!(group.total_usage_bytes, 30);
        assert_eq!(group.cids_count, 2);
    }

    #[tokio::test]
    async fn test_unbind_restores_state() {
        let t = TestIndex::new();
        let key = Key::new("g", "s");
        let blocks = t.blocks(&[10, 20]).await;

        t.bind(&key, "a", &blocks).await;
        t.index
            .file_unbind(&key, &["a".to_string(), "missing".to_string()])
            .await
            .unwrap();

        let info = t.index.space_info(&key).await.unwrap();
        assert_eq!(info.space_usage_bytes, 0);
        assert_eq!(info.cids_count, 0);
        assert_eq!(info.files_count, 0);
        let entries = t.index.cid_entries(&TestIndex::cids(&blocks)).await.unwrap();
        assert!(entries.iter().all(|c| c.entry.refs == 0));
        entries.release().await;

        let fields = t.fast.hkeys("s:s.{g}").await.unwrap();
        assert_eq!(fields, vec!["info".to_string()]);
    }

    #[tokio::test]
    async fn test_refs_count_spaces() {
        let t = TestIndex::new();
        let blocks = t.blocks(&[10]).await;
        let s1 = Key::new("g", "s1");
        let s2 = Key::new("g", "s2");

        t.bind(&s1, "a", &blocks).await;
        t.bind(&s1, "b", &blocks).await;
        t.bind(&s2, "a", &blocks).await;
        assert_eq!(t.refs(&blocks[0]).await, 2);

        // The group charges the cid once
        let group = t.index.group_info("g").await.unwrap();
        assert_eq!(group.total_usage_bytes, 10);
        assert_eq!(group.cids_count, 1);

        t.index.file_unbind(&s1, &["a".to_string()]).await.unwrap();
        assert_eq!(t.refs(&blocks[0]).await, 2);
        t.index.file_unbind(&s1, &["b".to_string()]).await.unwrap();
        assert_eq!(t.refs(&blocks[0]).await, 1);

        let group = t.index.group_info("g").await.unwrap();
        assert_eq!(group.total_usage_bytes, 10);
        t.index.file_unbind(&s2, &["a".to_string()]).await.unwrap();
        let group = t.index.group_info("g").await.unwrap();
        assert_eq!(group.total_usage_bytes, 0);
        assert_eq!(group.cids_count, 0);
    }
}
