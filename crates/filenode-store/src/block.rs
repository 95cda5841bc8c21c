//! Durable block storage
//!
//! Raw block content addressed by CID. The index only needs three
//! operations: fetch a block (to rebuild lost CID metadata), store
//! blocks, and delete one.

use async_trait::async_trait;
use bytes::Bytes;
use filenode_common::{Block, Cid, Error, Result};
use parking_lot::RwLock;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tracing::{debug, instrument};
use uuid::Uuid;

/// Durable block storage
#[async_trait]
pub trait BlockStore: Send + Sync + 'static {
    /// Fetch a block. Fails with [`Error::CidsNotExist`] when absent.
    async fn get(&self, cid: &Cid) -> Result<Bytes>;

    /// Store blocks. Blocks that already exist are left untouched.
    async fn add(&self, blocks: &[Block]) -> Result<()>;

    /// Delete a block. Deleting an absent block is not an error.
    async fn delete(&self, cid: &Cid) -> Result<()>;
}

/// Block storage on the local filesystem
///
/// Layout: `<root>/<first two hex chars>/<cid>`.
pub struct FsBlockStore {
    root: PathBuf,
}

impl FsBlockStore {
    /// Open (or create) a block directory
    pub async fn open(root: impl AsRef<Path>) -> Result<Self> {
        let root = root.as_ref().to_path_buf();
        fs::create_dir_all(&root).await?;
        Ok(Self { root })
    }

    fn block_path(&self, cid: &Cid) -> PathBuf {
        let name = cid.to_string();
        self.root.join(&name[..2]).join(name)
    }
}

#[async_trait]
impl BlockStore for FsBlockStore {
    #[instrument(skip(self), fields(backend = "filesystem"))]
    async fn get(&self, cid: &Cid) -> Result<Bytes> {
        match fs::read(self.block_path(cid)).await {
            Ok(data) => Ok(Bytes::from(data)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Err(Error::CidsNotExist),
            Err(e) => Err(e.into()),
        }
    }

    #[instrument(skip(self, blocks), fields(backend = "filesystem", count = blocks.len()))]
    async fn add(&self, blocks: &[Block]) -> Result<()> {
        for block in blocks {
            let path = self.block_path(&block.cid);
            if fs::try_exists(&path).await? {
                continue;
            }
            if let Some(parent) = path.parent() {
                fs::create_dir_all(parent).await?;
            }

            // Write to a unique temp file, fsync, then rename into place
            let temp_path = path.with_extension(format!("tmp.{}", Uuid::new_v4()));
            {
                let mut file = fs::File::create(&temp_path).await?;
                file.write_all(&block.data).await?;
                file.sync_all().await?;
            }
            fs::rename(&temp_path, &path).await?;
            debug!("Stored block {} ({} bytes)", block.cid, block.data.len());
        }
        Ok(())
    }

    #[instrument(skip(self), fields(backend = "filesystem"))]
    async fn delete(&self, cid: &Cid) -> Result<()> {
        match fs::remove_file(self.block_path(cid)).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}

/// In-memory block storage
#[derive(Default)]
pub struct MemoryBlockStore {
    blocks: RwLock<HashMap<Cid, Bytes>>,
}

impl MemoryBlockStore {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of stored blocks
    #[must_use]
    pub fn len(&self) -> usize {
        self.blocks.read().len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.blocks.read().is_empty()
    }
}

#[async_trait]
impl BlockStore for MemoryBlockStore {
    async fn get(&self, cid: &Cid) -> Result<Bytes> {
        self.blocks
            .read()
            .get(cid)
            .cloned()
            .ok_or(Error::CidsNotExist)
    }

    async fn add(&self, blocks: &[Block]) -> Result<()> {
        let mut stored = self.blocks.write();
        for block in blocks {
            stored
                .entry(block.cid)
                .or_insert_with(|| block.data.clone());
        }
        Ok(())
    }

    async fn delete(&self, cid: &Cid) -> Result<()> {
        self.blocks.write().remove(cid);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[tokio::test]
    async fn test_fs_block_store() {
        let dir = tempdir().unwrap();
        let store = FsBlockStore::open(dir.path()).await.unwrap();

        let block = Block::new(vec![1u8; 512]);
        assert!(matches!(
            store.get(&block.cid).await,
            Err(Error::CidsNotExist)
        ));

        store.add(std::slice::from_ref(&block)).await.unwrap();
        // Re-adding is a no-op
        store.add(std::slice::from_ref(&block)).await.unwrap();
        assert_eq!(store.get(&block.cid).await.unwrap(), block.data);

        store.delete(&block.cid).await.unwrap();
        store.delete(&block.cid).await.unwrap();
        assert!(store.get(&block.cid).await.is_err());
    }

    #[tokio::test]
    async fn test_memory_block_store() {
        let store = MemoryBlockStore::new();
        let blocks = vec![Block::new(vec![1u8; 10]), Block::new(vec![2u8; 20])];
        store.add(&blocks).await.unwrap();
        assert_eq!(store.len(), 2);
        assert_eq!(store.get(&blocks[1].cid).await.unwrap().len(), 20);
        store.delete(&blocks[0].cid).await.unwrap();
        assert!(matches!(
            store.get(&blocks[0].cid).await,
            Err(Error::CidsNotExist)
        ));
    }
}
