//! Hot tier contract
//!
//! The index keeps all live accounting in a key/hash store with
//! Redis-like semantics. Every engine must provide atomic single
//! commands, one-round-trip pipelines and all-or-nothing transactions
//! over the [`Cmd`] set, sorted sets for last-used tracking, bloom
//! filters, binary dump/restore of a key and pub/sub.

use crate::error::StoreResult;
use async_trait::async_trait;
use bytes::Bytes;
use futures::stream::BoxStream;
use std::time::Duration;

/// Stream of messages published on a channel
pub type Subscription = BoxStream<'static, Bytes>;

/// A command queued in a pipeline or transaction
#[derive(Clone, Debug, PartialEq)]
pub enum Cmd {
    Set { key: String, value: Bytes },
    Del { key: String },
    IncrBy { key: String, delta: i64 },
    HGet { key: String, field: String },
    HSet { key: String, field: String, value: Bytes },
    HDel { key: String, field: String },
    HIncrBy { key: String, field: String, delta: i64 },
    HExists { key: String, field: String },
}

impl Cmd {
    pub fn set(key: impl Into<String>, value: impl Into<Bytes>) -> Self {
        Self::Set {
            key: key.into(),
            value: value.into(),
        }
    }

    pub fn del(key: impl Into<String>) -> Self {
        Self::Del { key: key.into() }
    }

    pub fn incr_by(key: impl Into<String>, delta: i64) -> Self {
        Self::IncrBy {
            key: key.into(),
            delta,
        }
    }

    pub fn hget(key: impl Into<String>, field: impl Into<String>) -> Self {
        Self::HGet {
            key: key.into(),
            field: field.into(),
        }
    }

    pub fn hset(key: impl Into<String>, field: impl Into<String>, value: impl Into<Bytes>) -> Self {
        Self::HSet {
            key: key.into(),
            field: field.into(),
            value: value.into(),
        }
    }

    pub fn hdel(key: impl Into<String>, field: impl Into<String>) -> Self {
        Self::HDel {
            key: key.into(),
            field: field.into(),
        }
    }

    pub fn hincr_by(key: impl Into<String>, field: impl Into<String>, delta: i64) -> Self {
        Self::HIncrBy {
            key: key.into(),
            field: field.into(),
            delta,
        }
    }

    pub fn hexists(key: impl Into<String>, field: impl Into<String>) -> Self {
        Self::HExists {
            key: key.into(),
            field: field.into(),
        }
    }
}

/// Result of one queued command
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Reply {
    Ok,
    Nil,
    Int(i64),
    Bool(bool),
    Data(Bytes),
}

impl Reply {
    /// Payload of a `HGet` reply, `None` when the field was absent
    #[must_use]
    pub fn into_data(self) -> Option<Bytes> {
        match self {
            Self::Data(data) => Some(data),
            _ => None,
        }
    }

    /// Flag of a `HExists`/`HDel`/`Del` reply
    #[must_use]
    pub const fn as_bool(&self) -> bool {
        match self {
            Self::Bool(b) => *b,
            Self::Int(n) => *n != 0,
            _ => false,
        }
    }

    /// Counter of an `IncrBy`/`HIncrBy` reply
    #[must_use]
    pub const fn as_int(&self) -> Option<i64> {
        match self {
            Self::Int(n) => Some(*n),
            _ => None,
        }
    }
}

/// Hot tier operations used by the index
#[async_trait]
pub trait FastStore: Send + Sync + 'static {
    // ---- Strings ----

    async fn get(&self, key: &str) -> StoreResult<Option<Bytes>>;

    async fn set(&self, key: &str, value: Bytes) -> StoreResult<()>;

    /// Set `key` only when absent, expiring after `ttl` if one is given.
    /// Returns whether it was set.
    async fn set_nx(&self, key: &str, value: Bytes, ttl: Option<Duration>)
    -> StoreResult<bool>;

    /// Delete `key` only when it currently holds `value`.
    async fn del_if_eq(&self, key: &str, value: &[u8]) -> StoreResult<bool>;

    async fn exists(&self, key: &str) -> StoreResult<bool>;

    async fn del(&self, key: &str) -> StoreResult<bool>;

    async fn incr_by(&self, key: &str, delta: i64) -> StoreResult<i64>;

    // ---- Hashes ----

    async fn hget(&self, key: &str, field: &str) -> StoreResult<Option<Bytes>>;

    async fn hset(&self, key: &str, field: &str, value: Bytes) -> StoreResult<()>;

    async fn hdel(&self, key: &str, field: &str) -> StoreResult<bool>;

    async fn hexists(&self, key: &str, field: &str) -> StoreResult<bool>;

    async fn hgetall(&self, key: &str) -> StoreResult<Vec<(String, Bytes)>>;

    async fn hkeys(&self, key: &str) -> StoreResult<Vec<String>>;

    // ---- Batches ----

    /// Send `cmds` in one round-trip. Commands are applied independently:
    /// every command runs even when an earlier one fails, and the first
    /// failure is returned once the whole batch has run.
    async fn pipeline(&self, cmds: Vec<Cmd>) -> StoreResult<Vec<Reply>>;

    /// Apply `cmds` atomically: either every command is applied or none is.
    async fn transaction(&self, cmds: Vec<Cmd>) -> StoreResult<Vec<Reply>>;

    // ---- Sorted sets ----

    async fn zadd(&self, key: &str, member: &str, score: f64) -> StoreResult<()>;

    async fn zscore(&self, key: &str, member: &str) -> StoreResult<Option<f64>>;

    /// Members with score `<= max`, lowest score first, at most `limit`.
    async fn zrange_by_score(&self, key: &str, max: f64, limit: usize)
    -> StoreResult<Vec<String>>;

    async fn zrem(&self, key: &str, member: &str) -> StoreResult<bool>;

    // ---- Bloom filters ----

    async fn bf_add(&self, key: &str, item: &str) -> StoreResult<bool>;

    async fn bf_exists(&self, key: &str, item: &str) -> StoreResult<bool>;

    // ---- Dump / restore ----

    /// Serialized form of `key`, `None` when the key does not exist
    async fn dump(&self, key: &str) -> StoreResult<Option<Bytes>>;

    /// Recreate `key` from a dump, replacing any current value
    async fn restore(&self, key: &str, data: Bytes) -> StoreResult<()>;

    // ---- Pub/sub ----

    async fn publish(&self, channel: &str, message: Bytes) -> StoreResult<()>;

    async fn subscribe(&self, channel: &str) -> StoreResult<Subscription>;
}
