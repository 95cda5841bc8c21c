//! Filenode metadata index
//!
//! Tracks which content-addressed blocks belong to which files, spaces
//! and groups, and enforces the storage quota of each group and space.
//!
//! All live state sits in a hot key/hash store ([`FastStore`]). Keys
//! unused for a while are swept into a cold [`IndexStore`] and restored
//! transparently on next access. Every hot key is guarded by a
//! distributed lock, so several index instances may share one hot tier.
//!
//! Lock order, outermost first: legacy space, group, space, CIDs.
//! Binding is the exception: callers load the CID entries before the
//! space is locked.

mod bind;
mod check;
mod cids;
mod entry;
mod info;
pub mod keys;
mod limit;
mod loader;
mod migrate;
mod persist;
mod space;
mod unbind;
mod waiter;

pub use check::{CheckKind, CheckResult};
pub use cids::{CidEntries, LoadedCid};
pub use entry::{CID_ENTRY_VERSION, CidEntry, FileEntry, GroupEntry, SpaceEntry};
pub use info::{FileInfo, GroupInfo, GroupSpaceInfo, IndexStats, SpaceInfo};

use filenode_common::Result;
use filenode_common::config::IndexConfig;
use filenode_store::{BlockStore, FastStore, IndexStore, Locker, LockerConfig};
use futures::StreamExt;
use parking_lot::Mutex;
use std::sync::Arc;
use tokio::task::JoinHandle;
use tracing::{info, warn};
use waiter::CidWaiters;

/// The metadata index
pub struct FileIndex {
    fast: Arc<dyn FastStore>,
    blocks: Arc<dyn BlockStore>,
    cold: Arc<dyn IndexStore>,
    locker: Locker,
    config: IndexConfig,
    waiters: Arc<CidWaiters>,
    listener: Mutex<Option<JoinHandle<()>>>,
}

impl FileIndex {
    pub fn new(
        config: IndexConfig,
        fast: Arc<dyn FastStore>,
        blocks: Arc<dyn BlockStore>,
        cold: Arc<dyn IndexStore>,
    ) -> Self {
        let locker = Locker::new(Arc::clone(&fast), LockerConfig::from(&config));
        Self {
            fast,
            blocks,
            cold,
            locker,
            config,
            waiters: Arc::new(CidWaiters::default()),
            listener: Mutex::new(None),
        }
    }

    /// Subscribe to upload notifications so that
    /// [`wait_cid_exists`](Self::wait_cid_exists) wakes up on uploads
    /// made by any index instance sharing the hot tier.
    pub async fn start(&self) -> Result<()> {
        let mut messages = self.fast.subscribe(keys::CID_UPLOADED_CHANNEL).await?;
        let waiters = Arc::clone(&self.waiters);
        let handle = tokio::spawn(async move {
            while let Some(message) = messages.next().await {
                match std::str::from_utf8(&message)
                    .ok()
                    .and_then(|s| s.parse().ok())
                {
                    Some(cid) => waiters.notify(&cid),
                    None => warn!("Ignoring malformed upload notification {:?}", message),
                }
            }
        });
        if let Some(previous) = self.listener.lock().replace(handle) {
            previous.abort();
        }
        info!("File index started");
        Ok(())
    }

    /// Stop listening for uploads and fail every pending waiter
    pub fn close(&self) {
        if let Some(handle) = self.listener.lock().take() {
            handle.abort();
        }
        self.waiters.clear();
        info!("File index closed");
    }

    /// Index configuration
    pub const fn config(&self) -> &IndexConfig {
        &self.config
    }
}

impl Drop for FileIndex {
    fn drop(&mut self) {
        if let Some(handle) = self.listener.get_mut().take() {
            handle.abort();
        }
    }
}

#[cfg(test)]
pub(crate) mod testutil {
    use super::FileIndex;
    use crate::keys::cid_key;
    use crate::{CidEntry, entry::decode};
    use filenode_common::config::IndexConfig;
    use filenode_common::{Block, Cid, Key};
    use filenode_store::{
        BlockStore, FastStore, IndexStore, MemoryBlockStore, MemoryStore, RedbIndexStore,
    };
    use rand::RngCore;
    use std::sync::Arc;
    use tempfile::TempDir;

    pub struct TestIndex {
        pub index: FileIndex,
        pub fast: Arc<MemoryStore>,
        pub block_store: Arc<MemoryBlockStore>,
        pub cold: Arc<RedbIndexStore>,
        _dir: TempDir,
    }

    impl TestIndex {
        pub fn new() -> Self {
            Self::with_ttl(0)
        }

        pub fn with_ttl(persist_ttl_secs: u64) -> Self {
            let dir = tempfile::tempdir().unwrap();
            let config = IndexConfig {
                lock_tries: 200,
                lock_min_retry_delay_ms: 1,
                lock_max_retry_delay_ms: 5,
                persist_ttl_secs,
                ..IndexConfig::default()
            };
            let fast = Arc::new(MemoryStore::new());
            let block_store = Arc::new(MemoryBlockStore::new());
            let cold = Arc::new(RedbIndexStore::open(dir.path().join("index.redb")).unwrap());
            let index = FileIndex::new(
                config,
                Arc::clone(&fast) as Arc<dyn FastStore>,
                Arc::clone(&block_store) as Arc<dyn BlockStore>,
                Arc::clone(&cold) as Arc<dyn IndexStore>,
            );
            Self {
                index,
                fast,
                block_store,
                cold,
                _dir: dir,
            }
        }

        /// Upload random blocks of the given sizes
        pub async fn blocks(&self, sizes: &[usize]) -> Vec<Block> {
            let blocks: Vec<Block> = sizes
                .iter()
                .map(|&size| {
                    let mut data = vec![0u8; size];
                    rand::thread_rng().fill_bytes(&mut data);
                    Block::new(data)
                })
                .collect();
            self.block_store.add(&blocks).await.unwrap();
            self.index.blocks_add(&blocks).await.unwrap();
            blocks
        }

        pub async fn blocks_raw(&self, data: &'static [u8]) -> Block {
            let block = Block::new(data);
            self.index.blocks_add(std::slice::from_ref(&block)).await.unwrap();
            block
        }

        pub fn cids(blocks: &[Block]) -> Vec<Cid> {
            blocks.iter().map(|b| b.cid).collect()
        }

        pub async fn bind(&self, key: &Key, file_id: &str, blocks: &[Block]) {
            let mut entries = self.index.cid_entries(&Self::cids(blocks)).await.unwrap();
            self.index.file_bind(key, file_id, &mut entries).await.unwrap();
            entries.release().await;
        }

        /// Stored refs of a block's CID entry
        pub async fn refs(&self, block: &Block) -> i64 {
            let data = self.fast.get(&cid_key(&block.cid)).await.unwrap().unwrap();
            decode::<CidEntry>(&data).unwrap().refs
        }
    }
}
