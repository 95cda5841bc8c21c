//! Quota engine
//!
//! A group owns `account_limit` bytes. A space with a non-zero limit is
//! isolated: its limit is carved out of the group and its CIDs leave the
//! group hash. The rest of the group quota is the shared pool
//! `group.limit`, used by every non-isolated space together.

use crate::FileIndex;
use crate::cids::CidEntries;
use crate::entry::{GroupEntry, decode_ref, encode, now};
use crate::keys::{CID_PREFIX, INFO_KEY, cid_key, space_key};
use crate::loader::{GroupLock, KeyGuard, SpaceLock};
use filenode_common::{Error, Key, Result};
use filenode_store::Cmd;
use tracing::{debug, info};

impl FileIndex {
    /// Set the total quota of a group.
    ///
    /// When the isolated spaces no longer fit, every isolated limit is
    /// scaled down in proportion `limit / account_limit`.
    pub async fn set_group_limit(&self, group_id: &str, limit: u64) -> Result<()> {
        let mut lock = self.acquire_group(group_id).await?;
        let result = self.set_group_limit_locked(&mut lock, limit).await;
        lock.release().await;
        result
    }

    async fn set_group_limit_locked(&self, lock: &mut GroupLock, limit: u64) -> Result<()> {
        if lock.existed && lock.group.account_limit == limit {
            return Ok(());
        }
        let mut guards = Vec::new();
        let result: Result<()> = async {
            let mut isolated = lock.group.account_limit.saturating_sub(lock.group.limit);
            let mut cmds = Vec::new();
            if limit < isolated {
                let account_limit = lock.group.account_limit;
                isolated = 0;
                for space_id in lock.group.space_ids.clone() {
                    let key = Key::new(lock.group.group_id.clone(), space_id);
                    isolated += self
                        .shrink_space_limit(
                            lock,
                            &key,
                            (limit, account_limit),
                            &mut cmds,
                            &mut guards,
                        )
                        .await?;
                }
            }
            info!(
                "Group {} limit {} -> {} ({} isolated)",
                lock.group.group_id, lock.group.account_limit, limit, isolated
            );
            lock.group.limit = limit.saturating_sub(isolated);
            lock.group.account_limit = limit;
            cmds.push(lock.save_cmd()?);
            self.fast.transaction(cmds).await?;
            Ok(())
        }
        .await;
        for guard in guards {
            guard.release().await;
        }
        result
    }

    /// Scale an isolated space limit, returning the new limit. A space
    /// scaled down to nothing rejoins the shared pool. The space stays
    /// locked through `guards` until the caller commits `cmds`.
    async fn shrink_space_limit(
        &self,
        lock: &mut GroupLock,
        key: &Key,
        (limit, account_limit): (u64, u64),
        cmds: &mut Vec<Cmd>,
        guards: &mut Vec<KeyGuard>,
    ) -> Result<u64> {
        let skey = space_key(key);
        let (exists, guard) = self.acquire_key(&skey).await?;
        guards.push(guard);
        let mut space = self.space_entry(key, exists).await?;
        if !space.is_isolated() {
            return Ok(0);
        }
        #[allow(clippy::cast_possible_truncation)]
        let shrunk = (u128::from(space.limit) * u128::from(limit)
            / u128::from(account_limit).max(1)) as u64;
        if shrunk == 0 {
            let mut united = self.unite_cmds(&skey, &lock.group_key, &mut lock.group).await?;
            cmds.append(&mut united);
        }
        debug!("Space {} limit {} -> {}", key, space.limit, shrunk);
        space.limit = shrunk;
        space.update_time = now();
        cmds.push(Cmd::hset(skey, INFO_KEY, encode(&space)?));
        Ok(shrunk)
    }

    /// Set the isolated quota of a space. Zero returns the space to the
    /// shared pool.
    ///
    /// Fails with [`Error::NotEnoughSpace`] when the pool cannot give up
    /// the difference or the space already uses more than `limit`.
    pub async fn set_space_limit(&self, key: &Key, limit: u64) -> Result<()> {
        self.check_space_not_deleted(key).await?;
        let mut lock = self.acquire_space(key).await?;
        let result = self.set_space_limit_locked(&mut lock, limit).await;
        lock.release().await;
        result
    }

    async fn set_space_limit_locked(&self, lock: &mut SpaceLock, limit: u64) -> Result<()> {
        let old = lock.space.limit;
        if old == limit {
            return Ok(());
        }
        let mut cmds = Vec::new();
        if limit > old {
            let diff = limit - old;
            let fits = lock
                .group
                .limit
                .checked_sub(diff)
                .is_some_and(|left| left >= lock.group.size);
            if !fits || lock.space.size > limit {
                return Err(Error::NotEnoughSpace);
            }
            if old == 0 {
                cmds = self.isolate_cmds(lock).await?;
            }
            lock.group.limit -= diff;
        } else {
            if limit == 0 {
                cmds = self
                    .unite_cmds(&lock.space_key, &lock.group_key, &mut lock.group)
                    .await?;
            }
            lock.group.limit += old - limit;
        }
        info!("Space {} limit {} -> {}", lock.key, old, limit);
        lock.space.limit = limit;
        lock.group.add_space_id(&lock.key.space_id);
        cmds.extend(lock.save_cmds()?);
        self.fast.transaction(cmds).await?;
        Ok(())
    }

    /// Reference counts of the CIDs of a space hash, with their entries locked
    async fn space_refs(&self, space_key: &str) -> Result<(Vec<i64>, CidEntries)> {
        let mut cids = Vec::new();
        let mut refs = Vec::new();
        for (field, value) in self.fast.hgetall(space_key).await? {
            if let Some(cid) = field.strip_prefix(CID_PREFIX) {
                cids.push(cid.to_string());
                refs.push(decode_ref(&value));
            }
        }
        let entries = self.cid_entries_by_string(&cids).await?;
        Ok((refs, entries))
    }

    /// Commands taking the space's references out of the group hash
    async fn isolate_cmds(&self, lock: &mut SpaceLock) -> Result<Vec<Cmd>> {
        let (refs, entries) = self.space_refs(&lock.space_key).await?;
        let result: Result<Vec<Cmd>> = async {
            let reads = entries
                .iter()
                .map(|c| Cmd::hget(lock.group_key.clone(), cid_key(&c.cid)))
                .collect();
            let replies = self.fast.pipeline(reads).await?;

            let mut cmds = Vec::new();
            for ((loaded, space_ref), reply) in entries.iter().zip(refs).zip(replies) {
                let field = cid_key(&loaded.cid);
                let Some(group_ref) = reply.into_data().map(|d| decode_ref(&d)) else {
                    continue;
                };
                if group_ref - space_ref > 0 {
                    cmds.push(Cmd::hincr_by(lock.group_key.clone(), field, -space_ref));
                } else {
                    lock.group.cid_count = lock.group.cid_count.saturating_sub(1);
                    lock.group.size = lock.group.size.saturating_sub(loaded.entry.size);
                    cmds.push(Cmd::hdel(lock.group_key.clone(), field));
                }
            }
            Ok(cmds)
        }
        .await;
        entries.release().await;
        result
    }

    /// Commands merging a space's references back into the group hash
    async fn unite_cmds(
        &self,
        space_key: &str,
        group_key: &str,
        group: &mut GroupEntry,
    ) -> Result<Vec<Cmd>> {
        let (refs, entries) = self.space_refs(space_key).await?;
        let result: Result<Vec<Cmd>> = async {
            let lookups = entries
                .iter()
                .map(|c| Cmd::hexists(group_key, cid_key(&c.cid)))
                .collect();
            let replies = self.fast.pipeline(lookups).await?;

            let mut cmds = Vec::new();
            for ((loaded, space_ref), reply) in entries.iter().zip(refs).zip(replies) {
                if !reply.as_bool() {
                    group.cid_count += 1;
                    group.size += loaded.entry.size;
                }
                cmds.push(Cmd::hincr_by(group_key, cid_key(&loaded.cid), space_ref));
            }
            Ok(cmds)
        }
        .await;
        entries.release().await;
        result
    }

    /// Fail with [`Error::LimitExceed`] when the quota that applies to
    /// the space is used up
    pub async fn check_limits(&self, key: &Key) -> Result<()> {
        let lock = self.acquire_space(key).await?;
        let exceeded = if lock.space.is_isolated() {
            lock.space.size >= lock.space.limit
        } else {
            lock.group.size >= lock.group.limit
        };
        lock.release().await;
        if exceeded {
            return Err(Error::LimitExceed);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use crate::keys::lock_key;
    use crate::testutil::TestIndex;
    use filenode_common::{Error, Key};

    #[tokio::test]
    async fn test_space_limit_partitions_group() {
        let t = TestIndex::new();
        t.index.set_group_limit("g", 3000).await.unwrap();
        t.index.set_space_limit(&Key::new("g", "a"), 1000).await.unwrap();
        t.index.set_space_limit(&Key::new("g", "b"), 500).await.unwrap();

        let group = t.index.group_info("g").await.unwrap();
        assert_eq!(group.account_limit_bytes, 3000);
        assert_eq!(group.limit_bytes, 1500);
        let isolated: u64 = group.spaces.iter().map(|s| s.limit_bytes).sum();
        assert_eq!(group.limit_bytes + isolated, group.account_limit_bytes);

        t.index.set_space_limit(&Key::new("g", "a"), 200).await.unwrap();
        let group = t.index.group_info("g").await.unwrap();
        assert_eq!(group.limit_bytes, 2300);

        t.index.set_space_limit(&Key::new("g", "a"), 0).await.unwrap();
        t.index.set_space_limit(&Key::new("g", "b"), 0).await.unwrap();
        let group = t.index.group_info("g").await.unwrap();
        assert_eq!(group.limit_bytes, 3000);
    }

    #[tokio::test]
    async fn test_not_enough_space_leaves_state() {
        let t = TestIndex::new();
        let key = Key::new("g", "s");
        t.index.set_group_limit("g", 1000).await.unwrap();
        assert!(matches!(
            t.index.set_space_limit(&key, 1001).await,
            Err(Error::NotEnoughSpace)
        ));
        let group = t.index.group_info("g").await.unwrap();
        assert_eq!(group.limit_bytes, 1000);
        assert_eq!(t.index.space_info(&key).await.unwrap().limit_bytes, 1000);

        // The space already uses more than the requested limit
        let blocks = t.blocks(&[300]).await;
        t.bind(&key, "f", &blocks).await;
        assert!(matches!(
            t.index.set_space_limit(&key, 200).await,
            Err(Error::NotEnoughSpace)
        ));
    }

    #[tokio::test]
    async fn test_isolate_and_unite() {
        let t = TestIndex::new();
        t.index.set_group_limit("g", 3000).await.unwrap();
        let shared = Key::new("g", "shared");
        let lone = Key::new("g", "lone");
        let blocks = t.blocks(&[100, 200]).await;
        t.bind(&shared, "f", &blocks[..1]).await;
        t.bind(&lone, "f", &blocks).await;
        t.bind(&lone, "g", &blocks[1..]).await;

        let group = t.index.group_info("g").await.unwrap();
        assert_eq!(group.total_usage_bytes, 300);

        t.index.set_space_limit(&lone, 1000).await.unwrap();
        let group = t.index.group_info("g").await.unwrap();
        assert_eq!(group.limit_bytes, 2000);
        assert_eq!(group.total_usage_bytes, 100);
        assert_eq!(group.cids_count, 1);
        let info = t.index.space_info(&lone).await.unwrap();
        assert_eq!(info.limit_bytes, 1000);
        assert_eq!(info.total_usage_bytes, 300);
        assert!(t.index.check(&Key::group("g"), false).await.unwrap().is_empty());

        // Binding into an isolated space leaves the group alone
        let more = t.blocks(&[50]).await;
        t.bind(&lone, "h", &more).await;
        assert_eq!(t.index.group_info("g").await.unwrap().total_usage_bytes, 100);

        t.index.set_space_limit(&lone, 0).await.unwrap();
        let group = t.index.group_info("g").await.unwrap();
        assert_eq!(group.limit_bytes, 3000);
        assert_eq!(group.total_usage_bytes, 350);
        assert_eq!(group.cids_count, 3);
        assert!(t.index.check(&Key::group("g"), false).await.unwrap().is_empty());

        // Unbinding after unite releases group references in full
        t.index
            .file_unbind(&lone, &["f".to_string(), "g".to_string(), "h".to_string()])
            .await
            .unwrap();
        let group = t.index.group_info("g").await.unwrap();
        assert_eq!(group.total_usage_bytes, 100);
        assert!(t.index.check(&Key::group("g"), false).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_group_limit_shrinks_isolated() {
        let t = TestIndex::new();
        t.index.set_group_limit("g", 3000).await.unwrap();
        t.index.set_space_limit(&Key::new("g", "a"), 1500).await.unwrap();
        t.index.set_space_limit(&Key::new("g", "b"), 900).await.unwrap();

        t.index.set_group_limit("g", 1000).await.unwrap();
        let group = t.index.group_info("g").await.unwrap();
        assert_eq!(group.account_limit_bytes, 1000);
        let a = t.index.space_info(&Key::new("g", "a")).await.unwrap();
        let b = t.index.space_info(&Key::new("g", "b")).await.unwrap();
        assert_eq!(a.limit_bytes, 500);
        assert_eq!(b.limit_bytes, 300);
        assert_eq!(group.limit_bytes, 200);
    }

    #[tokio::test]
    async fn test_group_limit_shrink_all_or_nothing() {
        let t = TestIndex::new();
        t.index.set_group_limit("g", 3000).await.unwrap();
        t.index.set_space_limit(&Key::new("g", "a"), 1500).await.unwrap();
        t.index.set_space_limit(&Key::new("g", "b"), 900).await.unwrap();

        // Space b cannot be locked, so the shrink stops after scaling a
        let held = t.index.locker.lock(&lock_key("s:b.{g}")).await.unwrap();
        assert!(matches!(
            t.index.set_group_limit("g", 1000).await,
            Err(Error::LockNotAcquired(_))
        ));
        held.unlock().await;

        let group = t.index.group_info("g").await.unwrap();
        assert_eq!(group.account_limit_bytes, 3000);
        assert_eq!(group.limit_bytes, 600);
        let a = t.index.space_info(&Key::new("g", "a")).await.unwrap();
        assert_eq!(a.limit_bytes, 1500);
        let isolated: u64 = group.spaces.iter().map(|s| s.limit_bytes).sum();
        assert_eq!(group.limit_bytes + isolated, group.account_limit_bytes);
    }

    #[tokio::test]
    async fn test_check_limits() {
        let t = TestIndex::new();
        let key = Key::new("g", "s");
        t.index.set_group_limit("g", 100).await.unwrap();
        t.index.check_limits(&key).await.unwrap();

        let blocks = t.blocks(&[60, 40]).await;
        t.bind(&key, "f", &blocks).await;
        assert!(matches!(
            t.index.check_limits(&key).await,
            Err(Error::LimitExceed)
        ));

        t.index.set_group_limit("g", 1000).await.unwrap();
        t.index.set_space_limit(&key, 200).await.unwrap();
        t.index.check_limits(&key).await.unwrap();
    }
}
