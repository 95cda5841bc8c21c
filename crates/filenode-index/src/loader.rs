//! Key-lock loader
//!
//! Every hot key is read and written under its `_lock:` key. Acquiring
//! a key also makes sure it is present in the hot tier: a key missing
//! there but recorded in its partition's bloom filter is restored from
//! the cold tier first. Keys found present are stamped in their
//! partition's last-used set so the persistence sweep leaves them alone.

use crate::FileIndex;
use crate::entry::{GroupEntry, SpaceEntry, decode, encode, now};
use crate::keys::{
    INFO_KEY, bloom_key, group_key, last_used_key, lock_key, partition, space_key,
};
use bytes::Bytes;
use filenode_common::{Error, Key, Result};
use filenode_store::{Cmd, LockGuard};
use std::collections::BTreeMap;
use tracing::debug;

/// A held key lock
pub(crate) struct KeyGuard {
    lock: LockGuard,
}

impl KeyGuard {
    pub async fn release(self) {
        self.lock.unlock().await;
    }
}

/// A locked space together with its group
pub(crate) struct SpaceLock {
    pub key: Key,
    pub group_key: String,
    pub space_key: String,
    pub group: GroupEntry,
    pub space: SpaceEntry,
    pub space_existed: bool,
    group_guard: KeyGuard,
    space_guard: KeyGuard,
}

impl SpaceLock {
    /// Release the space lock, then the group lock
    pub async fn release(self) {
        self.space_guard.release().await;
        self.group_guard.release().await;
    }

    /// Commands writing both entries back
    pub fn save_cmds(&mut self) -> Result<Vec<Cmd>> {
        self.space.update_time = now();
        Ok(vec![
            Cmd::hset(self.space_key.clone(), INFO_KEY, encode(&self.space)?),
            self.save_group_cmd()?,
        ])
    }

    pub fn save_group_cmd(&mut self) -> Result<Cmd> {
        self.group.update_time = now();
        Ok(Cmd::hset(self.group_key.clone(), INFO_KEY, encode(&self.group)?))
    }
}

/// A locked group
pub(crate) struct GroupLock {
    pub group_key: String,
    pub group: GroupEntry,
    pub existed: bool,
    guard: KeyGuard,
}

impl GroupLock {
    pub async fn release(self) {
        self.guard.release().await;
    }

    pub fn save_cmd(&mut self) -> Result<Cmd> {
        self.group.update_time = now();
        Ok(Cmd::hset(self.group_key.clone(), INFO_KEY, encode(&self.group)?))
    }
}

impl FileIndex {
    /// Lock `key` and bring it into the hot tier. Returns whether the key exists.
    pub(crate) async fn acquire_key(&self, key: &str) -> Result<(bool, KeyGuard)> {
        let guard = KeyGuard {
            lock: self.locker.lock(&lock_key(key)).await?,
        };
        match self.load_key(key).await {
            Ok(exists) => Ok((exists, guard)),
            Err(e) => {
                guard.release().await;
                Err(e)
            }
        }
    }

    async fn load_key(&self, key: &str) -> Result<bool> {
        let exists = self.fast.exists(key).await? || self.restore_key(key).await?;
        if exists {
            #[allow(clippy::cast_precision_loss)]
            let score = now() as f64;
            self.fast
                .zadd(&last_used_key(partition(key)), key, score)
                .await?;
        }
        Ok(exists)
    }

    async fn restore_key(&self, key: &str) -> Result<bool> {
        if !self.fast.bf_exists(&bloom_key(partition(key)), key).await? {
            return Ok(false);
        }
        match self.cold.index_get(key).await? {
            Some(dump) if !dump.is_empty() => {
                self.fast.restore(key, dump).await?;
                debug!("Restored '{}' from the cold index", key);
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    /// Invalidate the cold copy of a key deleted from the hot tier, so it
    /// is not restored on next access. An empty dump reads as absent.
    pub(crate) async fn forget_key(&self, key: &str) -> Result<()> {
        if self.fast.bf_exists(&bloom_key(partition(key)), key).await? {
            self.cold.index_put(key, Bytes::new()).await?;
        }
        Ok(())
    }

    /// Lock several keys in lexicographic order. On failure every lock
    /// taken so far is released.
    pub(crate) async fn acquire_sorted(
        &self,
        keys: &[String],
    ) -> Result<BTreeMap<String, (bool, KeyGuard)>> {
        let mut sorted: Vec<&String> = keys.iter().collect();
        sorted.sort();
        sorted.dedup();

        let mut held = BTreeMap::new();
        for key in sorted {
            match self.acquire_key(key).await {
                Ok(acquired) => {
                    held.insert(key.clone(), acquired);
                }
                Err(e) => {
                    for (_, (_, guard)) in held {
                        guard.release().await;
                    }
                    return Err(e);
                }
            }
        }
        Ok(held)
    }

    /// Lock the group, then the space, and load both entries
    pub(crate) async fn acquire_space(&self, key: &Key) -> Result<SpaceLock> {
        let gkey = group_key(&key.group_id);
        let skey = space_key(key);

        let (group_exists, group_guard) = self.acquire_key(&gkey).await?;
        let (space_exists, space_guard) = match self.acquire_key(&skey).await {
            Ok(acquired) => acquired,
            Err(e) => {
                group_guard.release().await;
                return Err(e);
            }
        };
        self.space_lock(key, (group_exists, group_guard), (space_exists, space_guard))
            .await
    }

    /// Build a [`SpaceLock`] from held guards, releasing them on failure
    pub(crate) async fn space_lock(
        &self,
        key: &Key,
        (group_exists, group_guard): (bool, KeyGuard),
        (space_exists, space_guard): (bool, KeyGuard),
    ) -> Result<SpaceLock> {
        let mut lock = SpaceLock {
            key: key.clone(),
            group_key: group_key(&key.group_id),
            space_key: space_key(key),
            group: GroupEntry::default(),
            space: SpaceEntry::default(),
            space_existed: space_exists,
            group_guard,
            space_guard,
        };
        let loaded: Result<(GroupEntry, SpaceEntry)> = async {
            let group = self.group_entry(&key.group_id, group_exists).await?;
            let space = self.space_entry(key, space_exists).await?;
            if space.group_id != key.group_id {
                return Err(Error::GroupMismatch {
                    space_id: key.space_id.clone(),
                    expected: key.group_id.clone(),
                    actual: space.group_id,
                });
            }
            Ok((group, space))
        }
        .await;
        match loaded {
            Ok((group, space)) => {
                lock.group = group;
                lock.space = space;
                Ok(lock)
            }
            Err(e) => {
                lock.release().await;
                Err(e)
            }
        }
    }

    /// Lock a group and load its entry
    pub(crate) async fn acquire_group(&self, group_id: &str) -> Result<GroupLock> {
        let gkey = group_key(group_id);
        let (existed, guard) = self.acquire_key(&gkey).await?;
        match self.group_entry(group_id, existed).await {
            Ok(group) => Ok(GroupLock {
                group_key: gkey,
                group,
                existed,
                guard,
            }),
            Err(e) => {
                guard.release().await;
                Err(e)
            }
        }
    }

    /// Stored group entry, or a fresh one with the default quota
    pub(crate) async fn group_entry(&self, group_id: &str, exists: bool) -> Result<GroupEntry> {
        if exists && let Some(data) = self.fast.hget(&group_key(group_id), INFO_KEY).await? {
            return decode(&data);
        }
        Ok(GroupEntry::new(group_id, self.config.default_limit, now()))
    }

    /// Stored space entry, or a fresh one belonging to `key.group_id`
    pub(crate) async fn space_entry(&self, key: &Key, exists: bool) -> Result<SpaceEntry> {
        if exists && let Some(data) = self.fast.hget(&space_key(key), INFO_KEY).await? {
            return decode(&data);
        }
        Ok(SpaceEntry::new(key.group_id.clone(), now()))
    }
}
