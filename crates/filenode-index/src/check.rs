//! Consistency checker
//!
//! Recomputes the accounting of a group from its file entries and
//! reports every stored value that disagrees: file sizes, reference
//! counts in the space and group hashes, zero CID refs and the
//! space/group counters. With `fix` set, each finding is repaired by an
//! independent write; running the check again afterwards is clean.
//! Hash fields naming a CID that cannot be resolved count with size 0.

use crate::FileIndex;
use crate::cids::LoadedCid;
use crate::entry::{
    CidEntry, FileEntry, GroupEntry, SpaceEntry, decode, decode_ref, encode, encode_ref,
};
use crate::keys::{CID_PREFIX, FILE_PREFIX, INFO_KEY, cid_field, cid_key, file_key, space_key};
use crate::loader::GroupLock;
use filenode_common::{Key, Result};
use filenode_store::Cmd;
use serde::Serialize;
use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};
use tracing::info;

/// What a finding is about
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CheckKind {
    /// Stored file size differs from the sum of its CIDs
    FileSize,
    /// Space reference count differs from the number of referencing files
    SpaceCidRef,
    /// A referenced CID entry has no refs
    CidZeroRef,
    /// Space counters differ from its content
    SpaceStats,
    /// Space hash references a CID no file holds
    ExtraSpaceCid,
    /// Group reference count differs from the sum over its spaces
    GroupCidRef,
    /// Group hash misses a CID held by one of its spaces
    MissingGroupCid,
    /// Group hash references a CID no shared space holds
    ExtraGroupCid,
    /// Group counters differ from its content
    GroupStats,
}

/// One inconsistency
#[derive(Clone, Debug, Serialize)]
pub struct CheckResult {
    pub key: String,
    pub kind: CheckKind,
    pub description: String,
    #[serde(skip)]
    fix: Cmd,
}

impl CheckResult {
    fn new(key: &str, kind: CheckKind, description: String, fix: Cmd) -> Self {
        Self {
            key: key.to_string(),
            kind,
            description,
            fix,
        }
    }
}

/// Raw content of a space hash
struct RawSpace {
    key: String,
    entry: SpaceEntry,
    refs: BTreeMap<String, i64>,
    files: Vec<(String, FileEntry)>,
}

impl FileIndex {
    /// Check the group of `key` and all its spaces
    pub async fn check(&self, key: &Key, fix: bool) -> Result<Vec<CheckResult>> {
        let lock = self.acquire_group(&key.group_id).await?;
        let result = if lock.existed {
            self.check_group(&lock, fix).await
        } else {
            Ok(Vec::new())
        };
        lock.release().await;
        result
    }

    async fn check_group(&self, lock: &GroupLock, fix: bool) -> Result<Vec<CheckResult>> {
        let mut spaces = Vec::with_capacity(lock.group.space_ids.len());
        for space_id in &lock.group.space_ids {
            let key = Key::new(lock.group.group_id.clone(), space_id.clone());
            spaces.push(self.read_space(&key).await?);
        }
        let group_refs = self.read_refs(&lock.group_key).await?;

        let mut cids = BTreeSet::new();
        for space in &spaces {
            cids.extend(space.refs.keys().cloned());
            for (_, file) in &space.files {
                cids.extend(file.cids.iter().cloned());
            }
        }
        cids.extend(group_refs.keys().cloned());
        let cids: Vec<String> = cids.into_iter().collect();

        let entries = self.cid_entries_resolvable(&cids).await?;
        let result: Result<Vec<CheckResult>> = async {
            let by_cid: HashMap<String, &LoadedCid> =
                entries.iter().map(|c| (c.cid.to_string(), c)).collect();
            let results =
                check_entries(&lock.group_key, &lock.group, &spaces, &group_refs, &by_cid)?;
            if fix && !results.is_empty() {
                let cmds = results.iter().map(|r| r.fix.clone()).collect();
                self.fast.pipeline(cmds).await?;
                info!(
                    "Fixed {} inconsistencies in group {}",
                    results.len(),
                    lock.group.group_id
                );
            }
            Ok(results)
        }
        .await;
        entries.release().await;
        result
    }

    async fn read_space(&self, key: &Key) -> Result<RawSpace> {
        let skey = space_key(key);
        let (_, guard) = self.acquire_key(&skey).await?;
        let fields = self.fast.hgetall(&skey).await;
        guard.release().await;

        let mut space = RawSpace {
            key: skey,
            entry: SpaceEntry::new(key.group_id.clone(), 0),
            refs: BTreeMap::new(),
            files: Vec::new(),
        };
        for (field, value) in fields? {
            if field == INFO_KEY {
                space.entry = decode(&value)?;
            } else if let Some(cid) = field.strip_prefix(CID_PREFIX) {
                space.refs.insert(cid.to_string(), decode_ref(&value));
            } else if let Some(file_id) = field.strip_prefix(FILE_PREFIX) {
                space.files.push((file_id.to_string(), decode(&value)?));
            }
        }
        Ok(space)
    }

    async fn read_refs(&self, key: &str) -> Result<BTreeMap<String, i64>> {
        Ok(self
            .fast
            .hgetall(key)
            .await?
            .into_iter()
            .filter_map(|(field, value)| {
                field
                    .strip_prefix(CID_PREFIX)
                    .map(|cid| (cid.to_string(), decode_ref(&value)))
            })
            .collect())
    }
}

fn check_entries(
    group_key: &str,
    group: &GroupEntry,
    spaces: &[RawSpace],
    group_refs: &BTreeMap<String, i64>,
    cids: &HashMap<String, &LoadedCid>,
) -> Result<Vec<CheckResult>> {
    let size_of = |cid: &str| cids.get(cid).map_or(0, |c| c.entry.size);
    let mut results = Vec::new();
    let mut zero_refs = HashSet::new();
    let mut group_actual: BTreeMap<String, i64> = BTreeMap::new();

    for space in spaces {
        let mut actual: BTreeMap<String, i64> = BTreeMap::new();
        for (file_id, file) in &space.files {
            let mut size = 0;
            for cid in &file.cids {
                *actual.entry(cid.clone()).or_default() += 1;
                size += size_of(cid.as_str());
            }
            if size != file.size {
                let fixed = FileEntry {
                    size,
                    ..file.clone()
                };
                results.push(CheckResult::new(
                    &space.key,
                    CheckKind::FileSize,
                    format!("file {file_id}: size {} != {size}", file.size),
                    Cmd::hset(space.key.clone(), file_key(file_id), encode(&fixed)?),
                ));
            }
        }

        for (cid, count) in &actual {
            if space.refs.get(cid) != Some(count) {
                results.push(CheckResult::new(
                    &space.key,
                    CheckKind::SpaceCidRef,
                    format!("cid {cid}: ref {:?} != {count}", space.refs.get(cid)),
                    Cmd::hset(space.key.clone(), cid_field(cid), encode_ref(*count)),
                ));
            }
            if let Some(loaded) = cids.get(cid)
                && loaded.entry.refs <= 0
                && zero_refs.insert(cid.clone())
            {
                let fixed = CidEntry {
                    refs: 1,
                    ..loaded.entry.clone()
                };
                let key = cid_key(&loaded.cid);
                results.push(CheckResult::new(
                    &key,
                    CheckKind::CidZeroRef,
                    format!("cid {cid}: refs {}", loaded.entry.refs),
                    Cmd::set(key.clone(), encode(&fixed)?),
                ));
            }
        }

        for cid in space.refs.keys().filter(|c| !actual.contains_key(*c)) {
            results.push(CheckResult::new(
                &space.key,
                CheckKind::ExtraSpaceCid,
                format!("cid {cid}: referenced by no file"),
                Cmd::hdel(space.key.clone(), cid_field(cid)),
            ));
        }

        let size: u64 = actual.keys().map(|c| size_of(c.as_str())).sum();
        let cid_count = actual.len() as u64;
        let file_count = space.files.len() as u64;
        let stored = &space.entry;
        if stored.size != size || stored.cid_count != cid_count || stored.file_count != file_count {
            let fixed = SpaceEntry {
                size,
                cid_count,
                file_count,
                ..stored.clone()
            };
            results.push(CheckResult::new(
                &space.key,
                CheckKind::SpaceStats,
                format!(
                    "size {}/{size}, cids {}/{cid_count}, files {}/{file_count}",
                    stored.size, stored.cid_count, stored.file_count
                ),
                Cmd::hset(space.key.clone(), INFO_KEY, encode(&fixed)?),
            ));
        }

        if !stored.is_isolated() {
            for (cid, count) in actual {
                *group_actual.entry(cid).or_default() += count;
            }
        }
    }

    for (cid, count) in &group_actual {
        let (kind, description) = match group_refs.get(cid) {
            None => (CheckKind::MissingGroupCid, format!("cid {cid}: missing")),
            Some(stored) if stored != count => (
                CheckKind::GroupCidRef,
                format!("cid {cid}: ref {stored} != {count}"),
            ),
            Some(_) => continue,
        };
        results.push(CheckResult::new(
            group_key,
            kind,
            description,
            Cmd::hset(group_key, cid_field(cid), encode_ref(*count)),
        ));
    }
    for cid in group_refs.keys().filter(|c| !group_actual.contains_key(*c)) {
        results.push(CheckResult::new(
            group_key,
            CheckKind::ExtraGroupCid,
            format!("cid {cid}: referenced by no shared space"),
            Cmd::hdel(group_key, cid_field(cid)),
        ));
    }

    let size: u64 = group_actual.keys().map(|c| size_of(c.as_str())).sum();
    let cid_count = group_actual.len() as u64;
    if group.size != size || group.cid_count != cid_count {
        let fixed = GroupEntry {
            size,
            cid_count,
            ..group.clone()
        };
        results.push(CheckResult::new(
            group_key,
            CheckKind::GroupStats,
            format!("size {}/{size}, cids {}/{cid_count}", group.size, group.cid_count),
            Cmd::hset(group_key, INFO_KEY, encode(&fixed)?),
        ));
    }
    Ok(results)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::TestIndex;
    use bytes::Bytes;
    use filenode_store::FastStore;

    fn kinds(results: &[CheckResult]) -> Vec<CheckKind> {
        let mut kinds: Vec<CheckKind> = results.iter().map(|r| r.kind).collect();
        kinds.sort_by_key(|k| format!("{k:?}"));
        kinds.dedup();
        kinds
    }

    #[tokio::test]
    async fn test_check_clean_group() {
        let t = TestIndex::new();
        let blocks = t.blocks(&[10, 20]).await;
        t.bind(&Key::new("g", "a"), "f", &blocks).await;
        t.bind(&Key::new("g", "b"), "f", &blocks[..1]).await;
        assert!(t.index.check(&Key::group("g"), false).await.unwrap().is_empty());
        assert!(t.index.check(&Key::group("none"), true).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_check_fixes_corruption() {
        let t = TestIndex::new();
        let key = Key::new("g", "s");
        let blocks = t.blocks(&[10, 20]).await;
        t.bind(&key, "f", &blocks).await;
        let gkey = "g:{g}";
        let skey = "s:s.{g}";
        let cid0 = cid_key(&blocks[0].cid);
        let stray = cid_key(&filenode_common::Cid::from_data(b"stray"));

        // Wrong space ref, lost group ref, extra group ref, wrong counters
        t.fast.hset(skey, &cid0, Bytes::from_static(b"5")).await.unwrap();
        t.fast.hdel(gkey, &cid_key(&blocks[1].cid)).await.unwrap();
        t.blocks_raw(b"stray").await;
        t.fast.hset(gkey, &stray, Bytes::from_static(b"1")).await.unwrap();
        let mut space: SpaceEntry = decode(&t.fast.hget(skey, INFO_KEY).await.unwrap().unwrap()).unwrap();
        space.size = 999;
        t.fast.hset(skey, INFO_KEY, encode(&space).unwrap()).await.unwrap();
        let mut entry: CidEntry = decode(&t.fast.get(&cid0).await.unwrap().unwrap()).unwrap();
        entry.refs = 0;
        t.fast.set(&cid0, encode(&entry).unwrap()).await.unwrap();

        let results = t.index.check(&Key::group("g"), true).await.unwrap();
        assert_eq!(
            kinds(&results),
            vec![
                CheckKind::CidZeroRef,
                CheckKind::ExtraGroupCid,
                CheckKind::MissingGroupCid,
                CheckKind::SpaceCidRef,
                CheckKind::SpaceStats,
            ]
        );

        assert!(t.index.check(&Key::group("g"), false).await.unwrap().is_empty());
        let info = t.index.space_info(&key).await.unwrap();
        assert_eq!(info.space_usage_bytes, 30);
        assert_eq!(t.refs(&blocks[0]).await, 1);
    }

    #[tokio::test]
    async fn test_check_removes_unresolvable_fields() {
        let t = TestIndex::new();
        let key = Key::new("g", "s");
        let blocks = t.blocks(&[10]).await;
        t.bind(&key, "f", &blocks).await;
        let ghost = cid_key(&filenode_common::Cid::from_data(b"ghost"));

        t.fast.hset("g:{g}", &ghost, Bytes::from_static(b"1")).await.unwrap();
        t.fast.hset("s:s.{g}", &ghost, Bytes::from_static(b"1")).await.unwrap();
        t.fast.hset("s:s.{g}", "c:zz", Bytes::from_static(b"1")).await.unwrap();

        let results = t.index.check(&Key::group("g"), false).await.unwrap();
        assert_eq!(
            kinds(&results),
            vec![CheckKind::ExtraGroupCid, CheckKind::ExtraSpaceCid]
        );
        assert_eq!(results.len(), 3);

        t.index.check(&Key::group("g"), true).await.unwrap();
        assert!(t.index.check(&Key::group("g"), false).await.unwrap().is_empty());
        assert!(!t.fast.hexists("s:s.{g}", "c:zz").await.unwrap());
        assert!(!t.fast.hexists("g:{g}", &ghost).await.unwrap());
        assert_eq!(t.index.space_info(&key).await.unwrap().space_usage_bytes, 10);
    }

    #[tokio::test]
    async fn test_check_file_size_and_group_stats() {
        let t = TestIndex::new();
        let key = Key::new("g", "s");
        let blocks = t.blocks(&[10]).await;
        t.bind(&key, "f", &blocks).await;

        let skey = "s:s.{g}";
        let mut file: FileEntry = decode(&t.fast.hget(skey, "f:f").await.unwrap().unwrap()).unwrap();
        file.size = 1;
        t.fast.hset(skey, "f:f", encode(&file).unwrap()).await.unwrap();
        let mut group: GroupEntry = decode(&t.fast.hget("g:{g}", INFO_KEY).await.unwrap().unwrap()).unwrap();
        group.cid_count = 7;
        t.fast.hset("g:{g}", INFO_KEY, encode(&group).unwrap()).await.unwrap();

        let results = t.index.check(&Key::group("g"), false).await.unwrap();
        assert_eq!(kinds(&results), vec![CheckKind::FileSize, CheckKind::GroupStats]);
        // Report only: nothing changed
        assert_eq!(t.index.check(&Key::group("g"), true).await.unwrap().len(), 2);
        assert!(t.index.check(&Key::group("g"), false).await.unwrap().is_empty());
        assert_eq!(t.index.group_info("g").await.unwrap().cids_count, 1);
    }

    #[test]
    fn test_check_result_serializes_without_fix() {
        let result = CheckResult::new("g:{g}", CheckKind::GroupStats, "size".into(), Cmd::del("x"));
        let json = serde_json::to_value(&result).unwrap();
        assert_eq!(json["kind"], "group_stats");
        assert!(json.get("fix").is_none());
    }
}
