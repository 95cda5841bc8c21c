//! Cold index tier backed by redb.
//!
//! Holds the dumps of hot-tier keys evicted by the persistence sweep.
//! Values are opaque: whatever [`FastStore::dump`](crate::FastStore::dump)
//! produced is stored as-is and handed back to `restore` on rehydration.
//! redb calls are blocking, so every operation runs on the blocking pool.

use crate::error::{StoreError, StoreResult};
use crate::tables;
use async_trait::async_trait;
use bytes::Bytes;
use filenode_common::Result;
use redb::{Database, ReadableTableMetadata};
use std::path::Path;
use std::sync::Arc;
use tracing::info;

/// Cold storage for evicted index keys
#[async_trait]
pub trait IndexStore: Send + Sync + 'static {
    /// Stored dump of `key`, `None` when the key was never persisted
    async fn index_get(&self, key: &str) -> Result<Option<Bytes>>;

    /// Persist the dump of `key`, replacing any previous one
    async fn index_put(&self, key: &str, value: Bytes) -> Result<()>;
}

/// Cold index tier backed by redb
pub struct RedbIndexStore {
    db: Arc<Database>,
}

impl RedbIndexStore {
    /// Open (or create) the redb database at the given path.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        Ok(Self::open_db(path.as_ref())?)
    }

    fn open_db(path: &Path) -> StoreResult<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let db = Database::create(path)?;

        // Create the table eagerly so later read txns don't fail
        let write_txn = db.begin_write()?;
        {
            let _t = write_txn.open_table(tables::INDEX)?;
        }
        write_txn.commit()?;

        info!("Opened cold index at {:?}", path);
        Ok(Self { db: Arc::new(db) })
    }

    /// Number of persisted keys
    pub fn len(&self) -> Result<u64> {
        let count = (|| -> StoreResult<u64> {
            let read_txn = self.db.begin_read()?;
            let table = read_txn.open_table(tables::INDEX)?;
            Ok(table.len()?)
        })()?;
        Ok(count)
    }

    async fn blocking<T, F>(&self, f: F) -> StoreResult<T>
    where
        T: Send + 'static,
        F: FnOnce(&Database) -> StoreResult<T> + Send + 'static,
    {
        let db = Arc::clone(&self.db);
        tokio::task::spawn_blocking(move || f(&db)).await?
    }
}

#[async_trait]
impl IndexStore for RedbIndexStore {
    async fn index_get(&self, key: &str) -> Result<Option<Bytes>> {
        let key = key.to_string();
        let value = self
            .blocking(move |db| {
                let read_txn = db.begin_read()?;
                let table = read_txn.open_table(tables::INDEX)?;
                Ok(table.get(key.as_str())?.map(|v| Bytes::copy_from_slice(v.value())))
            })
            .await?;
        Ok(value)
    }

    async fn index_put(&self, key: &str, value: Bytes) -> Result<()> {
        let key = key.to_string();
        self.blocking(move |db| {
            let write_txn = db.begin_write()?;
            {
                let mut table = write_txn.open_table(tables::INDEX)?;
                table.insert(key.as_str(), value.as_ref())?;
            }
            write_txn.commit()?;
            Ok::<_, StoreError>(())
        })
        .await?;
        Ok(())
    }
}
