//! Space lifecycle and read-only views

use crate::FileIndex;
use crate::entry::{FileEntry, decode};
use crate::info::{FileInfo, GroupInfo, GroupSpaceInfo, IndexStats, SpaceInfo};
use crate::keys::{
    CID_COUNT_KEY, CID_SIZE_SUM_KEY, FILE_PREFIX, deleted_space_key, file_key, space_key,
};
use crate::loader::SpaceLock;
use bytes::Bytes;
use filenode_common::{Error, Key, Result};
use filenode_store::Cmd;
use tracing::info;

impl FileIndex {
    /// Remove a space: unbind all its files, hand its isolated quota back
    /// to the group and drop it from the group. Returns `false` when
    /// there was nothing to delete.
    pub async fn space_delete(&self, key: &Key) -> Result<bool> {
        let mut lock = self.acquire_space(key).await?;
        let result = self.space_delete_locked(&mut lock).await;
        lock.release().await;
        result
    }

    pub(crate) async fn space_delete_locked(&self, lock: &mut SpaceLock) -> Result<bool> {
        if !lock.space_existed && !lock.group.has_space(&lock.key.space_id) {
            return Ok(false);
        }
        for file_id in self.space_file_ids(&lock.space_key).await? {
            self.unbind_locked(lock, &file_id).await?;
        }
        if lock.space.is_isolated() {
            lock.group.limit += lock.space.limit;
        }
        lock.group.remove_space_id(&lock.key.space_id);

        let cmds = vec![lock.save_group_cmd()?, Cmd::del(lock.space_key.clone())];
        self.fast.transaction(cmds).await?;
        self.forget_key(&lock.space_key).await?;
        lock.space_existed = false;
        info!("Deleted space {}", lock.key);
        Ok(true)
    }

    /// Flag a space as deleted upstream. Returns `false` when already flagged.
    pub async fn mark_space_as_deleted(&self, key: &Key) -> Result<bool> {
        let marker = deleted_space_key(&key.space_id);
        let marked = self
            .fast
            .set_nx(&marker, Bytes::from_static(b"1"), None)
            .await?;
        if marked {
            info!("Space {} marked as deleted", key);
        }
        Ok(marked)
    }

    pub(crate) async fn check_space_not_deleted(&self, key: &Key) -> Result<()> {
        if self.fast.exists(&deleted_space_key(&key.space_id)).await? {
            return Err(Error::SpaceIsDeleted);
        }
        Ok(())
    }

    pub async fn space_info(&self, key: &Key) -> Result<SpaceInfo> {
        let lock = self.acquire_space(key).await?;
        let (limit_bytes, total_usage_bytes) = if lock.space.is_isolated() {
            (lock.space.limit, lock.space.size)
        } else {
            (lock.group.limit, lock.group.size)
        };
        let info = SpaceInfo {
            limit_bytes,
            total_usage_bytes,
            space_usage_bytes: lock.space.size,
            cids_count: lock.space.cid_count,
            files_count: lock.space.file_count,
        };
        lock.release().await;
        Ok(info)
    }

    pub async fn group_info(&self, group_id: &str) -> Result<GroupInfo> {
        let lock = self.acquire_group(group_id).await?;
        let result: Result<Vec<GroupSpaceInfo>> = async {
            let mut spaces = Vec::with_capacity(lock.group.space_ids.len());
            for space_id in &lock.group.space_ids {
                let key = Key::new(group_id, space_id.clone());
                let (exists, guard) = self.acquire_key(&space_key(&key)).await?;
                let space = self.space_entry(&key, exists).await;
                guard.release().await;
                let space = space?;
                spaces.push(GroupSpaceInfo {
                    space_id: space_id.clone(),
                    limit_bytes: space.limit,
                    space_usage_bytes: space.size,
                    cids_count: space.cid_count,
                    files_count: space.file_count,
                });
            }
            Ok(spaces)
        }
        .await;
        let info = GroupInfo {
            limit_bytes: lock.group.limit,
            account_limit_bytes: lock.group.account_limit,
            total_usage_bytes: lock.group.size,
            cids_count: lock.group.cid_count,
            spaces: Vec::new(),
        };
        lock.release().await;
        Ok(GroupInfo {
            spaces: result?,
            ..info
        })
    }

    /// Usage of the given files, in order. Unknown files report zeros.
    pub async fn file_info(&self, key: &Key, file_ids: &[String]) -> Result<Vec<FileInfo>> {
        let lock = self.acquire_space(key).await?;
        let reads = file_ids
            .iter()
            .map(|id| Cmd::hget(lock.space_key.clone(), file_key(id)))
            .collect();
        let replies = self.fast.pipeline(reads).await;
        lock.release().await;

        let mut files = Vec::with_capacity(file_ids.len());
        for (file_id, reply) in file_ids.iter().zip(replies?) {
            let file: FileEntry = match reply.into_data() {
                Some(data) => decode(&data)?,
                None => FileEntry::default(),
            };
            files.push(FileInfo {
                file_id: file_id.clone(),
                usage_bytes: file.size,
                cids_count: file.cids.len() as u64,
            });
        }
        Ok(files)
    }

    /// Ids of every file of a space
    pub async fn space_files(&self, key: &Key) -> Result<Vec<String>> {
        let lock = self.acquire_space(key).await?;
        let files = self.space_file_ids(&lock.space_key).await;
        lock.release().await;
        files
    }

    pub(crate) async fn space_file_ids(&self, space_key: &str) -> Result<Vec<String>> {
        Ok(self
            .fast
            .hkeys(space_key)
            .await?
            .into_iter()
            .filter_map(|field| field.strip_prefix(FILE_PREFIX).map(str::to_string))
            .collect())
    }

    /// Global CID counters
    pub async fn stats(&self) -> Result<IndexStats> {
        let read = |data: Option<Bytes>| -> i64 {
            data.and_then(|d| std::str::from_utf8(&d).ok().and_then(|s| s.parse().ok()))
                .unwrap_or(0)
        };
        Ok(IndexStats {
            cid_count: read(self.fast.get(CID_COUNT_KEY).await?),
            cid_size_sum: read(self.fast.get(CID_SIZE_SUM_KEY).await?),
        })
    }
}
