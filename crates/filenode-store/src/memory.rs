//! In-process hot tier engine
//!
//! Implements the full [`FastStore`] contract behind a single mutex, so
//! every command, pipeline and transaction is trivially atomic with
//! respect to the others. Keys may carry an expiry (used by lock keys);
//! expired keys are purged lazily when touched.
//!
//! A store opened with [`MemoryStore::open`] is durable: every mutation of
//! a key without an expiry is appended to a [`Journal`] while the state
//! lock is held, and [`MemoryStore::snapshot`] writes the full keyspace
//! and drops the journal records it covers. Opening loads the snapshot and
//! replays the journal after it. Keys with an expiry are never persisted.

use crate::bloom::BloomFilter;
use crate::error::{StoreError, StoreResult};
use crate::fast::{Cmd, FastStore, Reply, Subscription};
use crate::journal::{Journal, JournalConfig};
use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};
use tokio::sync::broadcast;
use tracing::{info, warn};
use xxhash_rust::xxh64::xxh64;

/// Capacity of a pub/sub channel before slow subscribers start lagging
const CHANNEL_CAPACITY: usize = 1024;

const SNAPSHOT_FILE: &str = "hot.snapshot";
const JOURNAL_FILE: &str = "hot.journal";

/// Stored value of a key
#[derive(Clone, Debug, Serialize, Deserialize)]
enum Value {
    Str(Bytes),
    Hash(HashMap<String, Bytes>),
    ZSet(HashMap<String, f64>),
    Bloom(BloomFilter),
}

#[derive(Clone, Debug)]
struct Entry {
    value: Value,
    expires_at: Option<Instant>,
}

impl Entry {
    const fn new(value: Value) -> Self {
        Self {
            value,
            expires_at: None,
        }
    }

    fn is_expired(&self, now: Instant) -> bool {
        self.expires_at.is_some_and(|at| at <= now)
    }
}

/// Journalled mutation of a key without an expiry
#[derive(Debug, Serialize, Deserialize)]
enum Op {
    Set { key: String, value: Bytes },
    Del { key: String },
    HSet { key: String, field: String, value: Bytes },
    HDel { key: String, field: String },
    ZAdd { key: String, member: String, score: f64 },
    ZRem { key: String, member: String },
    BfAdd { key: String, item: String },
    Restore { key: String, value: Value },
}

impl Op {
    fn apply(self, state: &mut State) -> StoreResult<()> {
        match self {
            Self::Set { key, value } => state.set(&key, value),
            Self::Del { key } => {
                state.del(&key);
            }
            Self::HSet { key, field, value } => state.hset(&key, &field, value)?,
            Self::HDel { key, field } => {
                state.hdel(&key, &field)?;
            }
            Self::ZAdd { key, member, score } => state.zadd(&key, &member, score)?,
            Self::ZRem { key, member } => {
                state.zrem(&key, &member)?;
            }
            Self::BfAdd { key, item } => {
                state.bf_add(&key, &item)?;
            }
            Self::Restore { key, value } => state.restore(&key, value),
        }
        Ok(())
    }
}

#[derive(Default)]
struct State {
    data: HashMap<String, Entry>,
    /// Mutations not yet appended to the journal, `None` when volatile
    log: Option<Vec<Op>>,
}

impl State {
    fn record(&mut self, op: impl FnOnce() -> Op) {
        if let Some(log) = &mut self.log {
            log.push(op());
        }
    }

    /// Live entry for `key`, dropping it first if it has expired
    fn live(&mut self, key: &str) -> Option<&mut Entry> {
        let now = Instant::now();
        if self.data.get(key).is_some_and(|e| e.is_expired(now)) {
            self.data.remove(key);
        }
        self.data.get_mut(key)
    }

    fn contains(&mut self, key: &str) -> bool {
        self.live(key).is_some()
    }

    fn hash(&mut self, key: &str) -> StoreResult<Option<&mut HashMap<String, Bytes>>> {
        match self.live(key) {
            None => Ok(None),
            Some(Entry {
                value: Value::Hash(h),
                ..
            }) => Ok(Some(h)),
            Some(_) => Err(StoreError::WrongType(key.to_string())),
        }
    }

    fn hash_or_create(&mut self, key: &str) -> StoreResult<&mut HashMap<String, Bytes>> {
        if !self.contains(key) {
            self.data
                .insert(key.to_string(), Entry::new(Value::Hash(HashMap::new())));
        }
        self.hash(key)?
            .ok_or_else(|| StoreError::WrongType(key.to_string()))
    }

    fn zset_or_create(&mut self, key: &str) -> StoreResult<&mut HashMap<String, f64>> {
        if !self.contains(key) {
            self.data
                .insert(key.to_string(), Entry::new(Value::ZSet(HashMap::new())));
        }
        match self.live(key) {
            Some(Entry {
                value: Value::ZSet(z),
                ..
            }) => Ok(z),
            _ => Err(StoreError::WrongType(key.to_string())),
        }
    }

    fn zset(&mut self, key: &str) -> StoreResult<Option<&mut HashMap<String, f64>>> {
        match self.live(key) {
            None => Ok(None),
            Some(Entry {
                value: Value::ZSet(z),
                ..
            }) => Ok(Some(z)),
            Some(_) => Err(StoreError::WrongType(key.to_string())),
        }
    }

    /// Drop a hash or sorted set that became empty, as Redis does
    fn drop_if_empty(&mut self, key: &str) {
        let empty = match self.data.get(key).map(|e| &e.value) {
            Some(Value::Hash(h)) => h.is_empty(),
            Some(Value::ZSet(z)) => z.is_empty(),
            _ => false,
        };
        if empty {
            self.data.remove(key);
        }
    }

    fn get(&mut self, key: &str) -> StoreResult<Option<Bytes>> {
        match self.live(key) {
            None => Ok(None),
            Some(Entry {
                value: Value::Str(v),
                ..
            }) => Ok(Some(v.clone())),
            Some(_) => Err(StoreError::WrongType(key.to_string())),
        }
    }

    fn set(&mut self, key: &str, value: Bytes) {
        self.record(|| Op::Set {
            key: key.to_string(),
            value: value.clone(),
        });
        self.data
            .insert(key.to_string(), Entry::new(Value::Str(value)));
    }

    fn del(&mut self, key: &str) -> bool {
        if !self.contains(key) {
            return false;
        }
        match self.data.remove(key) {
            Some(entry) => {
                if entry.expires_at.is_none() {
                    self.record(|| Op::Del {
                        key: key.to_string(),
                    });
                }
                true
            }
            None => false,
        }
    }

    fn incr_by(&mut self, key: &str, delta: i64) -> StoreResult<i64> {
        let current = match self.get(key)? {
            Some(v) => parse_int(key, &v)?,
            None => 0,
        };
        let next = current + delta;
        self.set(key, Bytes::from(next.to_string()));
        Ok(next)
    }

    fn hset(&mut self, key: &str, field: &str, value: Bytes) -> StoreResult<()> {
        self.hash_or_create(key)?
            .insert(field.to_string(), value.clone());
        self.record(|| Op::HSet {
            key: key.to_string(),
            field: field.to_string(),
            value,
        });
        Ok(())
    }

    fn hincr_by(&mut self, key: &str, field: &str, delta: i64) -> StoreResult<i64> {
        let current = match self.hash_or_create(key)?.get(field) {
            Some(v) => parse_int(key, v)?,
            None => 0,
        };
        let next = current + delta;
        self.hset(key, field, Bytes::from(next.to_string()))?;
        Ok(next)
    }

    fn hdel(&mut self, key: &str, field: &str) -> StoreResult<bool> {
        let removed = match self.hash(key)? {
            Some(hash) => hash.remove(field).is_some(),
            None => false,
        };
        self.drop_if_empty(key);
        if removed {
            self.record(|| Op::HDel {
                key: key.to_string(),
                field: field.to_string(),
            });
        }
        Ok(removed)
    }

    fn zadd(&mut self, key: &str, member: &str, score: f64) -> StoreResult<()> {
        self.zset_or_create(key)?.insert(member.to_string(), score);
        self.record(|| Op::ZAdd {
            key: key.to_string(),
            member: member.to_string(),
            score,
        });
        Ok(())
    }

    fn zrem(&mut self, key: &str, member: &str) -> StoreResult<bool> {
        let removed = match self.zset(key)? {
            Some(zset) => zset.remove(member).is_some(),
            None => false,
        };
        self.drop_if_empty(key);
        if removed {
            self.record(|| Op::ZRem {
                key: key.to_string(),
                member: member.to_string(),
            });
        }
        Ok(removed)
    }

    fn bf_add(&mut self, key: &str, item: &str) -> StoreResult<bool> {
        if !self.contains(key) {
            self.data
                .insert(key.to_string(), Entry::new(Value::Bloom(BloomFilter::default())));
        }
        let added = match self.live(key) {
            Some(Entry {
                value: Value::Bloom(bloom),
                ..
            }) => bloom.insert(item.as_bytes()),
            _ => return Err(StoreError::WrongType(key.to_string())),
        };
        if added {
            self.record(|| Op::BfAdd {
                key: key.to_string(),
                item: item.to_string(),
            });
        }
        Ok(added)
    }

    fn restore(&mut self, key: &str, value: Value) {
        self.record(|| Op::Restore {
            key: key.to_string(),
            value: value.clone(),
        });
        self.data.insert(key.to_string(), Entry::new(value));
    }

    fn exec(&mut self, cmd: Cmd) -> StoreResult<Reply> {
        match cmd {
            Cmd::Set { key, value } => {
                self.set(&key, value);
                Ok(Reply::Ok)
            }
            Cmd::Del { key } => Ok(Reply::Bool(self.del(&key))),
            Cmd::IncrBy { key, delta } => self.incr_by(&key, delta).map(Reply::Int),
            Cmd::HGet { key, field } => Ok(self
                .hash(&key)?
                .and_then(|h| h.get(&field).cloned())
                .map_or(Reply::Nil, Reply::Data)),
            Cmd::HSet { key, field, value } => {
                self.hset(&key, &field, value)?;
                Ok(Reply::Ok)
            }
            Cmd::HDel { key, field } => self.hdel(&key, &field).map(Reply::Bool),
            Cmd::HIncrBy { key, field, delta } => {
                self.hincr_by(&key, &field, delta).map(Reply::Int)
            }
            Cmd::HExists { key, field } => Ok(Reply::Bool(
                self.hash(&key)?.is_some_and(|h| h.contains_key(&field)),
            )),
        }
    }
}

fn parse_int(key: &str, value: &[u8]) -> StoreResult<i64> {
    std::str::from_utf8(value)
        .ok()
        .and_then(|s| s.parse().ok())
        .ok_or_else(|| StoreError::NotInteger(key.to_string()))
}

fn cmd_key(cmd: &Cmd) -> &str {
    match cmd {
        Cmd::Set { key, .. }
        | Cmd::Del { key }
        | Cmd::IncrBy { key, .. }
        | Cmd::HGet { key, .. }
        | Cmd::HSet { key, .. }
        | Cmd::HDel { key, .. }
        | Cmd::HIncrBy { key, .. }
        | Cmd::HExists { key, .. } => key,
    }
}

#[derive(Serialize)]
struct SnapshotRef<'a> {
    lsn: u64,
    entries: Vec<(&'a String, &'a Value)>,
}

#[derive(Deserialize)]
struct Snapshot {
    lsn: u64,
    entries: Vec<(String, Value)>,
}

/// Snapshot file: xxh64 of the body followed by the bincode body
fn read_snapshot(path: &Path) -> StoreResult<Option<Snapshot>> {
    let buf = match std::fs::read(path) {
        Ok(buf) => buf,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
        Err(e) => return Err(e.into()),
    };
    let (checksum, body) = buf
        .split_first_chunk::<8>()
        .ok_or_else(|| StoreError::Corrupt(format!("{} is truncated", path.display())))?;
    if u64::from_le_bytes(*checksum) != xxh64(body, 0) {
        return Err(StoreError::Corrupt(format!(
            "{} checksum mismatch",
            path.display()
        )));
    }
    Ok(Some(bincode::deserialize(body)?))
}

fn write_snapshot(path: &Path, body: &[u8]) -> StoreResult<()> {
    let tmp = path.with_extension("snapshot.tmp");
    {
        let mut file = std::fs::File::create(&tmp)?;
        file.write_all(&xxh64(body, 0).to_le_bytes())?;
        file.write_all(body)?;
        file.sync_all()?;
    }
    std::fs::rename(&tmp, path)?;
    Ok(())
}

struct Durable {
    journal: Journal,
    snapshot_path: PathBuf,
    /// Serializes snapshots
    snapshot_lock: Mutex<()>,
}

/// In-process hot tier
#[derive(Default)]
pub struct MemoryStore {
    state: Mutex<State>,
    channels: Mutex<HashMap<String, broadcast::Sender<Bytes>>>,
    durable: Option<Durable>,
}

impl MemoryStore {
    /// Create an empty volatile store
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Open a durable store in `dir`, loading its snapshot and replaying
    /// its journal
    pub fn open(dir: impl AsRef<Path>, config: JournalConfig) -> StoreResult<Self> {
        let dir = dir.as_ref();
        std::fs::create_dir_all(dir)?;

        let snapshot_path = dir.join(SNAPSHOT_FILE);
        let mut state = State::default();
        let snapshot_lsn = match read_snapshot(&snapshot_path)? {
            Some(snapshot) => {
                info!(
                    "Loaded hot tier snapshot at LSN {} ({} keys)",
                    snapshot.lsn,
                    snapshot.entries.len()
                );
                state.data.extend(
                    snapshot
                        .entries
                        .into_iter()
                        .map(|(key, value)| (key, Entry::new(value))),
                );
                snapshot.lsn
            }
            None => 0,
        };

        let journal = Journal::open(dir.join(JOURNAL_FILE), config)?;
        // An empty journal restarts numbering; keep it past the snapshot
        journal.advance_past(snapshot_lsn);

        let mut replayed = 0usize;
        journal.replay(snapshot_lsn + 1, |lsn, data| {
            let ops: Vec<Op> = bincode::deserialize(data)?;
            for op in ops {
                if let Err(e) = op.apply(&mut state) {
                    warn!("Skipping journal op at LSN {}: {}", lsn, e);
                }
            }
            replayed += 1;
            Ok(())
        })?;
        info!(
            "Opened hot tier in {} ({} keys, {} journal records replayed)",
            dir.display(),
            state.data.len(),
            replayed
        );

        state.log = Some(Vec::new());
        Ok(Self {
            state: Mutex::new(state),
            channels: Mutex::default(),
            durable: Some(Durable {
                journal,
                snapshot_path,
                snapshot_lock: Mutex::new(()),
            }),
        })
    }

    /// Number of live keys
    #[must_use]
    pub fn len(&self) -> usize {
        let now = Instant::now();
        self.state
            .lock()
            .data
            .values()
            .filter(|e| !e.is_expired(now))
            .count()
    }

    /// Whether the store holds no live keys
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Whether the store survives a restart
    #[must_use]
    pub const fn is_durable(&self) -> bool {
        self.durable.is_some()
    }

    /// Whether the journal grew past its configured size
    #[must_use]
    pub fn needs_snapshot(&self) -> bool {
        self.durable
            .as_ref()
            .is_some_and(|d| d.journal.needs_compaction())
    }

    /// Write the keyspace to disk and drop the journal records it covers.
    /// Returns the LSN the snapshot covers, 0 for a volatile store.
    ///
    /// Blocks on file I/O.
    pub fn snapshot(&self) -> StoreResult<u64> {
        let Some(durable) = &self.durable else {
            return Ok(0);
        };
        let _guard = durable.snapshot_lock.lock();

        let (lsn, keys, body) = {
            let state = self.state.lock();
            let entries: Vec<(&String, &Value)> = state
                .data
                .iter()
                .filter(|(_, e)| e.expires_at.is_none())
                .map(|(k, e)| (k, &e.value))
                .collect();
            // Appends happen under the state lock, so this LSN matches the image
            let lsn = durable.journal.current_lsn();
            let keys = entries.len();
            (lsn, keys, bincode::serialize(&SnapshotRef { lsn, entries })?)
        };

        write_snapshot(&durable.snapshot_path, &body)?;
        durable.journal.truncate_before(lsn + 1)?;
        info!("Wrote hot tier snapshot at LSN {} ({} keys)", lsn, keys);
        Ok(lsn)
    }

    /// Append the mutations recorded by the last command to the journal
    fn commit(&self, state: &mut State) -> StoreResult<()> {
        let Some(log) = state.log.as_mut() else {
            return Ok(());
        };
        if log.is_empty() {
            return Ok(());
        }
        let ops = std::mem::take(log);
        if let Some(durable) = &self.durable {
            durable.journal.append(&bincode::serialize(&ops)?)?;
        }
        Ok(())
    }

    /// Run a mutation under the state lock and journal what it changed
    fn mutate<T>(&self, f: impl FnOnce(&mut State) -> StoreResult<T>) -> StoreResult<T> {
        let mut state = self.state.lock();
        let result = f(&mut state);
        self.commit(&mut state)?;
        result
    }
}

#[async_trait]
impl FastStore for MemoryStore {
    async fn get(&self, key: &str) -> StoreResult<Option<Bytes>> {
        self.state.lock().get(key)
    }

    async fn set(&self, key: &str, value: Bytes) -> StoreResult<()> {
        self.mutate(|state| {
            state.set(key, value);
            Ok(())
        })
    }

    async fn set_nx(
        &self,
        key: &str,
        value: Bytes,
        ttl: Option<Duration>,
    ) -> StoreResult<bool> {
        self.mutate(|state| {
            if state.contains(key) {
                return Ok(false);
            }
            match ttl {
                Some(ttl) => {
                    state.data.insert(
                        key.to_string(),
                        Entry {
                            value: Value::Str(value),
                            expires_at: Some(Instant::now() + ttl),
                        },
                    );
                }
                None => state.set(key, value),
            }
            Ok(true)
        })
    }

    async fn del_if_eq(&self, key: &str, value: &[u8]) -> StoreResult<bool> {
        self.mutate(|state| {
            let matches = matches!(
                state.live(key),
                Some(Entry { value: Value::Str(v), .. }) if v.as_ref() == value
            );
            Ok(matches && state.del(key))
        })
    }

    async fn exists(&self, key: &str) -> StoreResult<bool> {
        Ok(self.state.lock().contains(key))
    }

    async fn del(&self, key: &str) -> StoreResult<bool> {
        self.mutate(|state| Ok(state.del(key)))
    }

    async fn incr_by(&self, key: &str, delta: i64) -> StoreResult<i64> {
        self.mutate(|state| state.incr_by(key, delta))
    }

    async fn hget(&self, key: &str, field: &str) -> StoreResult<Option<Bytes>> {
        Ok(self
            .state
            .lock()
            .hash(key)?
            .and_then(|h| h.get(field).cloned()))
    }

    async fn hset(&self, key: &str, field: &str, value: Bytes) -> StoreResult<()> {
        self.mutate(|state| state.hset(key, field, value))
    }

    async fn hdel(&self, key: &str, field: &str) -> StoreResult<bool> {
        self.mutate(|state| state.hdel(key, field))
    }

    async fn hexists(&self, key: &str, field: &str) -> StoreResult<bool> {
        Ok(self
            .state
            .lock()
            .hash(key)?
            .is_some_and(|h| h.contains_key(field)))
    }

    async fn hgetall(&self, key: &str) -> StoreResult<Vec<(String, Bytes)>> {
        Ok(self
            .state
            .lock()
            .hash(key)?
            .map(|h| h.iter().map(|(f, v)| (f.clone(), v.clone())).collect())
            .unwrap_or_default())
    }

    async fn hkeys(&self, key: &str) -> StoreResult<Vec<String>> {
        Ok(self
            .state
            .lock()
            .hash(key)?
            .map(|h| h.keys().cloned().collect())
            .unwrap_or_default())
    }

    async fn pipeline(&self, cmds: Vec<Cmd>) -> StoreResult<Vec<Reply>> {
        let mut state = self.state.lock();
        let mut replies = Vec::with_capacity(cmds.len());
        let mut failed = None;
        for cmd in cmds {
            match state.exec(cmd) {
                Ok(reply) => replies.push(reply),
                Err(e) => {
                    replies.push(Reply::Nil);
                    failed.get_or_insert(e);
                }
            }
        }
        self.commit(&mut state)?;
        match failed {
            Some(e) => Err(e),
            None => Ok(replies),
        }
    }

    async fn transaction(&self, cmds: Vec<Cmd>) -> StoreResult<Vec<Reply>> {
        let mut state = self.state.lock();

        // Snapshot touched keys so a failing command rolls everything back
        let mut snapshot: HashMap<String, Option<Entry>> = HashMap::new();
        for cmd in &cmds {
            let key = cmd_key(cmd);
            if !snapshot.contains_key(key) {
                snapshot.insert(key.to_string(), state.data.get(key).cloned());
            }
        }

        let mut replies = Vec::with_capacity(cmds.len());
        for cmd in cmds {
            match state.exec(cmd) {
                Ok(reply) => replies.push(reply),
                Err(e) => {
                    for (key, entry) in snapshot {
                        match entry {
                            Some(entry) => state.data.insert(key, entry),
                            None => state.data.remove(&key),
                        };
                    }
                    if let Some(log) = state.log.as_mut() {
                        log.clear();
                    }
                    return Err(e);
                }
            }
        }
        self.commit(&mut state)?;
        Ok(replies)
    }

    async fn zadd(&self, key: &str, member: &str, score: f64) -> StoreResult<()> {
        self.mutate(|state| state.zadd(key, member, score))
    }

    async fn zscore(&self, key: &str, member: &str) -> StoreResult<Option<f64>> {
        Ok(self
            .state
            .lock()
            .zset(key)?
            .and_then(|z| z.get(member).copied()))
    }

    async fn zrange_by_score(
        &self,
        key: &str,
        max: f64,
        limit: usize,
    ) -> StoreResult<Vec<String>> {
        let mut state = self.state.lock();
        let Some(zset) = state.zset(key)? else {
            return Ok(Vec::new());
        };
        let mut members: Vec<(&String, f64)> = zset
            .iter()
            .filter(|(_, score)| **score <= max)
            .map(|(m, s)| (m, *s))
            .collect();
        members.sort_by(|a, b| a.1.total_cmp(&b.1).then_with(|| a.0.cmp(b.0)));
        Ok(members
            .into_iter()
            .take(limit)
            .map(|(m, _)| m.clone())
            .collect())
    }

    async fn zrem(&self, key: &str, member: &str) -> StoreResult<bool> {
        self.mutate(|state| state.zrem(key, member))
    }

    async fn bf_add(&self, key: &str, item: &str) -> StoreResult<bool> {
        self.mutate(|state| state.bf_add(key, item))
    }

    async fn bf_exists(&self, key: &str, item: &str) -> StoreResult<bool> {
        match self.state.lock().live(key) {
            None => Ok(false),
            Some(Entry {
                value: Value::Bloom(bloom),
                ..
            }) => Ok(bloom.contains(item.as_bytes())),
            Some(_) => Err(StoreError::WrongType(key.to_string())),
        }
    }

    async fn dump(&self, key: &str) -> StoreResult<Option<Bytes>> {
        let mut state = self.state.lock();
        match state.live(key) {
            Some(entry) => Ok(Some(Bytes::from(bincode::serialize(&entry.value)?))),
            None => Ok(None),
        }
    }

    async fn restore(&self, key: &str, data: Bytes) -> StoreResult<()> {
        let value: Value = bincode::deserialize(&data)?;
        self.mutate(|state| {
            state.restore(key, value);
            Ok(())
        })
    }

    async fn publish(&self, channel: &str, message: Bytes) -> StoreResult<()> {
        if let Some(tx) = self.channels.lock().get(channel) {
            // No subscribers is not an error
            let _ = tx.send(message);
        }
        Ok(())
    }

    async fn subscribe(&self, channel: &str) -> StoreResult<Subscription> {
        let rx = self
            .channels
            .lock()
            .entry(channel.to_string())
            .or_insert_with(|| broadcast::channel(CHANNEL_CAPACITY).0)
            .subscribe();
        let stream = futures::stream::unfold(rx, |mut rx| async move {
            loop {
                match rx.recv().await {
                    Ok(message) => return Some((message, rx)),
                    Err(broadcast::error::RecvError::Lagged(_)) => {}
                    Err(broadcast::error::RecvError::Closed) => return None,
                }
            }
        });
        Ok(Box::pin(stream))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::StreamExt;

    #[tokio::test]
    async fn test_hash_incr_and_del() {
        let store = MemoryStore::new();
        assert_eq!(store.state.lock().hincr_by("s:1", "c:a", 1).unwrap(), 1);
        assert_eq!(store.state.lock().hincr_by("s:1", "c:a", 1).unwrap(), 2);
        assert_eq!(
            store.hget("s:1", "c:a").await.unwrap(),
            Some(Bytes::from("2"))
        );
        assert!(store.hdel("s:1", "c:a").await.unwrap());
        // Empty hashes disappear
        assert!(!store.exists("s:1").await.unwrap());
    }

    #[tokio::test]
    async fn test_wrong_type() {
        let store = MemoryStore::new();
        store.set("k", Bytes::from("v")).await.unwrap();
        assert!(matches!(
            store.hget("k", "f").await,
            Err(StoreError::WrongType(_))
        ));
    }

    #[tokio::test]
    async fn test_transaction_rolls_back() {
        let store = MemoryStore::new();
        store.set("str", Bytes::from("not a hash")).await.unwrap();

        let result = store
            .transaction(vec![
                Cmd::hset("h", "f", "1"),
                Cmd::hincr_by("str", "f", 1),
            ])
            .await;
        assert!(result.is_err());
        assert!(!store.exists("h").await.unwrap());
    }

    #[tokio::test]
    async fn test_pipeline_replies() {
        let store = MemoryStore::new();
        let replies = store
            .pipeline(vec![
                Cmd::hincr_by("h", "c:x", 1),
                Cmd::hexists("h", "c:x"),
                Cmd::hexists("h", "c:y"),
                Cmd::hget("h", "c:x"),
                Cmd::hget("h", "c:y"),
            ])
            .await
            .unwrap();
        assert_eq!(replies[0], Reply::Int(1));
        assert!(replies[1].as_bool());
        assert!(!replies[2].as_bool());
        assert_eq!(replies[3].clone().into_data(), Some(Bytes::from("1")));
        assert_eq!(replies[4], Reply::Nil);
    }

    #[tokio::test]
    async fn test_pipeline_runs_past_failure() {
        let store = MemoryStore::new();
        store.set("str", Bytes::from("v")).await.unwrap();
        let result = store
            .pipeline(vec![
                Cmd::hset("h", "a", Bytes::from("1")),
                Cmd::hset("str", "a", Bytes::from("1")),
                Cmd::hset("h", "b", Bytes::from("2")),
            ])
            .await;
        assert!(matches!(result, Err(StoreError::WrongType(k)) if k == "str"));
        assert!(store.hexists("h", "a").await.unwrap());
        assert!(store.hexists("h", "b").await.unwrap());
    }

    #[tokio::test]
    async fn test_set_nx_expiry() {
        let store = MemoryStore::new();
        let ttl = Some(Duration::from_millis(20));
        assert!(store.set_nx("_lock:a", Bytes::from("t1"), ttl).await.unwrap());
        assert!(!store.set_nx("_lock:a", Bytes::from("t2"), ttl).await.unwrap());
        tokio::time::sleep(Duration::from_millis(40)).await;
        assert!(store.set_nx("_lock:a", Bytes::from("t2"), ttl).await.unwrap());
        assert!(!store.del_if_eq("_lock:a", b"t1").await.unwrap());
        assert!(store.del_if_eq("_lock:a", b"t2").await.unwrap());

        // Without a ttl the key stays
        assert!(store.set_nx("del:s", Bytes::from("1"), None).await.unwrap());
        tokio::time::sleep(Duration::from_millis(40)).await;
        assert!(!store.set_nx("del:s", Bytes::from("1"), None).await.unwrap());
        assert!(store.exists("del:s").await.unwrap());
    }

    #[tokio::test]
    async fn test_zrange_by_score() {
        let store = MemoryStore::new();
        store.zadd("_lu:{1}", "a", 30.0).await.unwrap();
        store.zadd("_lu:{1}", "b", 10.0).await.unwrap();
        store.zadd("_lu:{1}", "c", 20.0).await.unwrap();

        let members = store.zrange_by_score("_lu:{1}", 25.0, 10).await.unwrap();
        assert_eq!(members, vec!["b".to_string(), "c".to_string()]);
        let members = store.zrange_by_score("_lu:{1}", 100.0, 1).await.unwrap();
        assert_eq!(members, vec!["b".to_string()]);
    }

    #[tokio::test]
    async fn test_dump_restore() {
        let store = MemoryStore::new();
        store.hset("g:{1}", "info", Bytes::from("x")).await.unwrap();
        store.hset("g:{1}", "c:a", Bytes::from("2")).await.unwrap();

        let dump = store.dump("g:{1}").await.unwrap().unwrap();
        store.del("g:{1}").await.unwrap();
        assert!(store.dump("g:{1}").await.unwrap().is_none());

        store.restore("g:{1}", dump).await.unwrap();
        assert_eq!(
            store.hget("g:{1}", "c:a").await.unwrap(),
            Some(Bytes::from("2"))
        );
    }

    #[tokio::test]
    async fn test_bloom_commands() {
        let store = MemoryStore::new();
        assert!(!store.bf_exists("_bf:{3}", "s:x").await.unwrap());
        store.bf_add("_bf:{3}", "s:x").await.unwrap();
        assert!(store.bf_exists("_bf:{3}", "s:x").await.unwrap());
    }

    #[tokio::test]
    async fn test_pubsub() {
        let store = MemoryStore::new();
        let mut sub = store.subscribe("cidUploaded").await.unwrap();
        store
            .publish("cidUploaded", Bytes::from("abc"))
            .await
            .unwrap();
        assert_eq!(sub.next().await, Some(Bytes::from("abc")));
    }
    #[tokio::test]
    async fn test_open_replays_journal() {
        let dir = tempfile::tempdir().unwrap();
        {
            let store = MemoryStore::open(dir.path(), JournalConfig::default()).unwrap();
            assert!(store.is_durable());
            store
                .pipeline(vec![
                    Cmd::hincr_by("s:{1}", "c:a", 1),
                    Cmd::hincr_by("s:{1}", "c:a", 1),
                ])
                .await
                .unwrap();
            store.hset("s:{1}", "c:b", Bytes::from("1")).await.unwrap();
            store.hdel("s:{1}", "c:b").await.unwrap();
            store.incr_by("cidCount", 5).await.unwrap();
            store.zadd("_lu:{1}", "s:{1}", 10.0).await.unwrap();
            store.bf_add("_bf:{1}", "s:old").await.unwrap();
            store.set("gone", Bytes::from("x")).await.unwrap();
            store.del("gone").await.unwrap();
        }

        let store = MemoryStore::open(dir.path(), JournalConfig::default()).unwrap();
        assert_eq!(
            store.hgetall("s:{1}").await.unwrap(),
            vec![("c:a".to_string(), Bytes::from("2"))]
        );
        assert_eq!(store.get("cidCount").await.unwrap(), Some(Bytes::from("5")));
        assert_eq!(store.zscore("_lu:{1}", "s:{1}").await.unwrap(), Some(10.0));
        assert!(store.bf_exists("_bf:{1}", "s:old").await.unwrap());
        assert!(!store.exists("gone").await.unwrap());
    }

    #[tokio::test]
    async fn test_snapshot_then_journal() {
        let dir = tempfile::tempdir().unwrap();
        {
            let store = MemoryStore::open(dir.path(), JournalConfig::default()).unwrap();
            store.hset("g:{1}", "info", Bytes::from("a")).await.unwrap();
            let dump = store.dump("g:{1}").await.unwrap().unwrap();
            store.restore("g:{2}", dump).await.unwrap();
            assert_eq!(store.snapshot().unwrap(), 2);
            assert!(!store.needs_snapshot());

            // Written after the snapshot, found in the journal only
            store.hset("g:{1}", "c:x", Bytes::from("3")).await.unwrap();
        }

        let store = MemoryStore::open(dir.path(), JournalConfig::default()).unwrap();
        assert_eq!(store.len(), 2);
        assert_eq!(store.hget("g:{2}", "info").await.unwrap(), Some(Bytes::from("a")));
        assert_eq!(store.hget("g:{1}", "c:x").await.unwrap(), Some(Bytes::from("3")));

        assert_eq!(store.snapshot().unwrap(), 3);
        drop(store);

        // Numbering continues past the snapshot after an empty journal
        let store = MemoryStore::open(dir.path(), JournalConfig::default()).unwrap();
        store.set("k", Bytes::from("v")).await.unwrap();
        drop(store);
        let store = MemoryStore::open(dir.path(), JournalConfig::default()).unwrap();
        assert_eq!(store.get("k").await.unwrap(), Some(Bytes::from("v")));
    }

    #[tokio::test]
    async fn test_expiring_keys_not_persisted() {
        let dir = tempfile::tempdir().unwrap();
        {
            let store = MemoryStore::open(dir.path(), JournalConfig::default()).unwrap();
            let ttl = Some(Duration::from_secs(60));
            store.set_nx("_lock:a", Bytes::from("t1"), ttl).await.unwrap();
            store.set_nx("del:s", Bytes::from("1"), None).await.unwrap();
            store.set_nx("_lock:b", Bytes::from("t2"), ttl).await.unwrap();
            store.snapshot().unwrap();
            store.del_if_eq("_lock:b", b"t2").await.unwrap();
        }

        let store = MemoryStore::open(dir.path(), JournalConfig::default()).unwrap();
        assert!(!store.exists("_lock:a").await.unwrap());
        assert!(!store.exists("_lock:b").await.unwrap());
        assert!(store.exists("del:s").await.unwrap());
    }

    #[tokio::test]
    async fn test_failed_transaction_not_journalled() {
        let dir = tempfile::tempdir().unwrap();
        {
            let store = MemoryStore::open(dir.path(), JournalConfig::default()).unwrap();
            store.set("str", Bytes::from("v")).await.unwrap();
            let result = store
                .transaction(vec![
                    Cmd::hset("h", "f", "1"),
                    Cmd::hincr_by("str", "f", 1),
                ])
                .await;
            assert!(result.is_err());
            store
                .transaction(vec![Cmd::hset("h", "g", "2")])
                .await
                .unwrap();
        }

        let store = MemoryStore::open(dir.path(), JournalConfig::default()).unwrap();
        assert!(!store.hexists("h", "f").await.unwrap());
        assert!(store.hexists("h", "g").await.unwrap());
    }

    #[tokio::test]
    async fn test_corrupt_snapshot_refuses_to_open() {
        let dir = tempfile::tempdir().unwrap();
        {
            let store = MemoryStore::open(dir.path(), JournalConfig::default()).unwrap();
            store.set("k", Bytes::from("v")).await.unwrap();
            store.snapshot().unwrap();
        }
        let path = dir.path().join(SNAPSHOT_FILE);
        let mut buf = std::fs::read(&path).unwrap();
        let last = buf.len() - 1;
        buf[last] ^= 0xff;
        std::fs::write(&path, buf).unwrap();

        assert!(matches!(
            MemoryStore::open(dir.path(), JournalConfig::default()),
            Err(StoreError::Corrupt(_))
        ));
    }
}
