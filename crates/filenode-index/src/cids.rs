//! CID entry store
//!
//! Loading CID entries locks them: a [`CidEntries`] batch holds the lock
//! of every entry it contains until [`CidEntries::release`] is called.
//! An entry missing from the hot and cold tiers but present in the
//! block store is rebuilt from the block itself.

use crate::FileIndex;
use crate::entry::{CID_ENTRY_VERSION, CidEntry, decode, encode, now};
use crate::keys::{CID_COUNT_KEY, CID_SIZE_SUM_KEY, cid_key};
use crate::loader::KeyGuard;
use filenode_common::{Block, Cid, Error, Key, Result};
use filenode_store::Cmd;
use std::collections::HashSet;
use tracing::{debug, info, warn};

/// A CID entry loaded under lock
#[derive(Clone, Debug)]
pub struct LoadedCid {
    pub cid: Cid,
    pub entry: CidEntry,
}

/// A batch of locked CID entries
#[derive(Default)]
pub struct CidEntries {
    pub entries: Vec<LoadedCid>,
    guards: Vec<KeyGuard>,
}

impl CidEntries {
    fn push(&mut self, cid: Cid, entry: CidEntry, guard: KeyGuard) {
        self.entries.push(LoadedCid { cid, entry });
        self.guards.push(guard);
    }

    /// Release every lock held by the batch
    pub async fn release(self) {
        for guard in self.guards {
            guard.release().await;
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &LoadedCid> {
        self.entries.iter()
    }
}

impl FileIndex {
    /// Whether an entry exists for `cid`
    pub async fn cid_exists(&self, cid: &Cid) -> Result<bool> {
        let (exists, guard) = self.acquire_key(&cid_key(cid)).await?;
        guard.release().await;
        Ok(exists)
    }

    /// Lock and load the entries of `cids`. Duplicates are loaded once.
    ///
    /// Fails with [`Error::CidsNotExist`] when a CID is unknown to both
    /// the index and the block store; no lock is held after a failure.
    pub async fn cid_entries(&self, cids: &[Cid]) -> Result<CidEntries> {
        let mut seen = HashSet::new();
        let mut loaded = CidEntries::default();
        for cid in cids {
            if !seen.insert(*cid) {
                continue;
            }
            match self.load_cid_entry(cid).await {
                Ok((entry, guard)) => loaded.push(*cid, entry, guard),
                Err(e) => {
                    loaded.release().await;
                    return Err(e);
                }
            }
        }
        Ok(loaded)
    }

    /// [`cid_entries`](Self::cid_entries) for CIDs in string form
    pub async fn cid_entries_by_string(&self, cids: &[String]) -> Result<CidEntries> {
        let parsed = cids
            .iter()
            .map(|c| c.parse::<Cid>())
            .collect::<std::result::Result<Vec<_>, _>>()?;
        self.cid_entries(&parsed).await
    }

    /// Lock and load whichever of `cids` resolve. Strings that are not
    /// CIDs and CIDs unknown to both the index and the block store are
    /// skipped; any other failure releases the batch and is returned.
    pub(crate) async fn cid_entries_resolvable(&self, cids: &[String]) -> Result<CidEntries> {
        let mut seen = HashSet::new();
        let mut loaded = CidEntries::default();
        for raw in cids {
            let Ok(cid) = raw.parse::<Cid>() else {
                warn!("Skipping malformed cid '{}'", raw);
                continue;
            };
            if !seen.insert(cid) {
                continue;
            }
            match self.load_cid_entry(&cid).await {
                Ok((entry, guard)) => loaded.push(cid, entry, guard),
                Err(Error::CidsNotExist) => warn!("Skipping unknown cid {}", cid),
                Err(e) => {
                    loaded.release().await;
                    return Err(e);
                }
            }
        }
        Ok(loaded)
    }

    /// Lock the entries of freshly uploaded blocks, creating the ones
    /// that do not exist yet
    pub async fn cid_entries_by_blocks(&self, blocks: &[Block]) -> Result<CidEntries> {
        let mut seen = HashSet::new();
        let mut loaded = CidEntries::default();
        for block in blocks {
            if !seen.insert(block.cid) {
                continue;
            }
            let result: Result<(CidEntry, KeyGuard)> = async {
                let key = cid_key(&block.cid);
                let (exists, guard) = self.acquire_key(&key).await?;
                let entry = if exists {
                    self.read_cid_entry(&key).await
                } else {
                    self.create_cid_entry(&key, CidEntry::new(block.size()))
                        .await
                };
                match entry {
                    Ok(entry) => Ok((entry, guard)),
                    Err(e) => {
                        guard.release().await;
                        Err(e)
                    }
                }
            }
            .await;
            match result {
                Ok((entry, guard)) => loaded.push(block.cid, entry, guard),
                Err(e) => {
                    loaded.release().await;
                    return Err(e);
                }
            }
        }
        Ok(loaded)
    }

    /// Record uploaded blocks. Blocks already indexed are left alone;
    /// new ones bump the global counters and wake their waiters.
    pub async fn blocks_add(&self, blocks: &[Block]) -> Result<()> {
        let mut created = Vec::new();
        let mut seen = HashSet::new();
        for block in blocks {
            if !seen.insert(block.cid) {
                continue;
            }
            let key = cid_key(&block.cid);
            let (exists, guard) = self.acquire_key(&key).await?;
            let result = if exists {
                debug!("Block {} already indexed", block.cid);
                Ok(())
            } else {
                self.create_cid_entry(&key, CidEntry::new(block.size()))
                    .await
                    .map(|_| created.push(block.cid))
            };
            guard.release().await;
            result?;
        }
        if !created.is_empty() {
            self.on_block_uploaded(&created).await?;
        }
        Ok(())
    }

    /// Which of `cids` are referenced by the space
    pub async fn cid_exists_in_space(&self, key: &Key, cids: &[Cid]) -> Result<Vec<Cid>> {
        let lock = self.acquire_space(key).await?;
        let cmds = cids
            .iter()
            .map(|cid| Cmd::hexists(lock.space_key.clone(), cid_key(cid)))
            .collect();
        let replies = self.fast.pipeline(cmds).await;
        lock.release().await;
        Ok(cids
            .iter()
            .zip(replies?)
            .filter(|(_, reply)| reply.as_bool())
            .map(|(cid, _)| *cid)
            .collect())
    }

    async fn load_cid_entry(&self, cid: &Cid) -> Result<(CidEntry, KeyGuard)> {
        let key = cid_key(cid);
        let (exists, guard) = self.acquire_key(&key).await?;
        let entry = if exists {
            self.read_cid_entry(&key).await
        } else {
            self.rebuild_cid_entry(cid, &key).await
        };
        match entry {
            Ok(entry) => Ok((entry, guard)),
            Err(e) => {
                guard.release().await;
                Err(e)
            }
        }
    }

    /// Read an entry, upgrading entries written before versioning
    async fn read_cid_entry(&self, key: &str) -> Result<CidEntry> {
        let data = self.fast.get(key).await?.ok_or(Error::CidsNotExist)?;
        let entry: CidEntry = decode(&data)?;
        if entry.version >= CID_ENTRY_VERSION {
            return Ok(entry);
        }
        debug!("Upgrading cid entry '{}' from version {}", key, entry.version);
        self.create_cid_entry(key, entry).await
    }

    /// Store a new (or upgraded) entry and count it into the global stats
    async fn create_cid_entry(&self, key: &str, mut entry: CidEntry) -> Result<CidEntry> {
        let now = now();
        if entry.create_time == 0 {
            entry.create_time = now;
        }
        entry.update_time = now;
        entry.version = CID_ENTRY_VERSION;
        #[allow(clippy::cast_possible_wrap)]
        let size = entry.size as i64;
        self.fast
            .transaction(vec![
                Cmd::set(key, encode(&entry)?),
                Cmd::incr_by(CID_COUNT_KEY, 1),
                Cmd::incr_by(CID_SIZE_SUM_KEY, size),
            ])
            .await?;
        Ok(entry)
    }

    /// Recreate a lost entry from the block store. Global stats are left alone.
    async fn rebuild_cid_entry(&self, cid: &Cid, key: &str) -> Result<CidEntry> {
        let data = self.blocks.get(cid).await?;
        let entry = CidEntry::new(data.len() as u64);
        self.fast.set(key, encode(&entry)?).await?;
        info!("Rebuilt cid entry {} from the block store", cid);
        Ok(entry)
    }

    /// Write a locked entry back
    pub(crate) async fn save_cid_entry(&self, loaded: &LoadedCid) -> Result<()> {
        self.fast
            .set(&cid_key(&loaded.cid), encode(&loaded.entry)?)
            .await?;
        Ok(())
    }
}
