//! Filenode Store - storage tiers consumed by the metadata index
//!
//! This crate implements the collaborators the index is built on:
//! - **Hot tier**: the [`FastStore`] contract (keys, hashes, pipelines,
//!   transactions, sorted sets, bloom filters, dump/restore, pub/sub) and
//!   its in-process engine [`MemoryStore`], made durable by a [`Journal`]
//!   and periodic snapshots
//! - **Distributed locks**: [`Locker`], a token mutex on top of the hot tier
//! - **Cold tier**: the [`IndexStore`] contract for evicted key dumps and
//!   its redb engine [`RedbIndexStore`]
//! - **Block storage**: the [`BlockStore`] contract for raw content and the
//!   [`FsBlockStore`] / [`MemoryBlockStore`] engines

pub mod block;
pub mod bloom;
pub mod error;
pub mod fast;
pub mod index;
pub mod journal;
pub mod lock;
pub mod memory;
mod tables;

// Re-exports
pub use block::{BlockStore, FsBlockStore, MemoryBlockStore};
pub use bloom::BloomFilter;
pub use error::{StoreError, StoreResult};
pub use fast::{Cmd, FastStore, Reply, Subscription};
pub use index::{IndexStore, RedbIndexStore};
pub use journal::{Journal, JournalConfig};
pub use lock::{LockGuard, Locker, LockerConfig};
pub use memory::MemoryStore;
