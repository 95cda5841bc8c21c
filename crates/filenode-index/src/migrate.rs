//! Moving data between layouts and groups

use crate::FileIndex;
use crate::entry::{FileEntry, decode, decode_legacy_file};
use crate::keys::{
    FILE_PREFIX, bloom_key, file_key, group_key, legacy_space_key, partition, space_key,
};
use crate::loader::{KeyGuard, SpaceLock};
use filenode_common::{Error, Key, Result};
use tracing::{info, warn};

impl FileIndex {
    /// Rebind the files of a space stored in the pre-group layout under
    /// `key`, then drop the old hash. Files whose CIDs are no longer
    /// known are skipped. A space without legacy data is left alone.
    pub async fn migrate(&self, key: &Key) -> Result<()> {
        let legacy = legacy_space_key(&key.space_id);
        if !self.fast.exists(&legacy).await?
            && !self.fast.bf_exists(&bloom_key(partition(&legacy)), &legacy).await?
        {
            return Ok(());
        }
        // Another instance may have migrated it before we got the lock
        let (exists, guard) = self.acquire_key(&legacy).await?;
        let result = if exists {
            self.migrate_locked(key, &legacy).await
        } else {
            Ok(())
        };
        guard.release().await;
        result
    }

    async fn migrate_locked(&self, key: &Key, legacy: &str) -> Result<()> {
        let mut migrated = 0usize;
        let mut skipped = 0usize;
        for (field, value) in self.fast.hgetall(legacy).await? {
            let Some(file_id) = field.strip_prefix(FILE_PREFIX) else {
                continue;
            };
            let cids = decode_legacy_file(&value)?;
            let mut entries = match self.cid_entries_by_string(&cids).await {
                Ok(entries) => entries,
                Err(Error::CidsNotExist) => {
                    warn!("Skipping file '{}' of {}: unknown cids", file_id, key);
                    skipped += 1;
                    continue;
                }
                Err(e) => return Err(e),
            };
            let result = self.file_bind(key, file_id, &mut entries).await;
            entries.release().await;
            result?;
            migrated += 1;
        }
        self.fast.del(legacy).await?;
        self.forget_key(legacy).await?;
        info!(
            "Migrated space {}: {} files moved, {} skipped",
            key, migrated, skipped
        );
        Ok(())
    }

    /// Re-home a space: bind every file under `new`, then delete `old`
    /// the way [`space_delete`](Self::space_delete) does.
    pub async fn move_space(&self, old: &Key, new: &Key) -> Result<()> {
        let old_group = group_key(&old.group_id);
        let new_group = group_key(&new.group_id);
        let old_space = space_key(old);
        let new_space = space_key(new);
        if old_group == new_group || old_space == new_space {
            return Err(Error::KeyCollision(format!("{old} -> {new}")));
        }

        let keys = [old_group, old_space, new_group, new_space];
        let mut held = self.acquire_sorted(&keys).await?;
        let [old_group, old_space, new_group, new_space] = keys;
        let mut take = |k: &String| held.remove(k);
        let (Some(og), Some(os), Some(ng), Some(ns)) = (
            take(&old_group),
            take(&old_space),
            take(&new_group),
            take(&new_space),
        ) else {
            return Err(Error::internal("move lost a key lock"));
        };

        let mut new_lock = match self.space_lock(new, ng, ns).await {
            Ok(lock) => lock,
            Err(e) => {
                release_all([og, os]).await;
                return Err(e);
            }
        };
        let mut old_lock = match self.space_lock(old, og, os).await {
            Ok(lock) => lock,
            Err(e) => {
                new_lock.release().await;
                return Err(e);
            }
        };

        let result = self.move_locked(&mut old_lock, &mut new_lock).await;
        new_lock.release().await;
        old_lock.release().await;
        result
    }

    async fn move_locked(&self, old: &mut SpaceLock, new: &mut SpaceLock) -> Result<()> {
        let file_ids = self.space_file_ids(&old.space_key).await?;
        for file_id in &file_ids {
            let Some(data) = self.fast.hget(&old.space_key, &file_key(file_id)).await? else {
                continue;
            };
            let file: FileEntry = decode(&data)?;
            let mut entries = self.cid_entries_by_string(&file.cids).await?;
            let result = self.bind_locked(new, file_id, &mut entries.entries).await;
            entries.release().await;
            result?;
        }
        self.space_delete_locked(old).await?;
        info!("Moved space {} to {} ({} files)", old.key, new.key, file_ids.len());
        Ok(())
    }
}

async fn release_all<const N: usize>(guards: [(bool, KeyGuard); N]) {
    for (_, guard) in guards {
        guard.release().await;
    }
}
