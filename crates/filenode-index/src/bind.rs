//! Binding CIDs to files
//!
//! A CID is charged to the space the first time any file of the space
//! references it, and to the group the first time any non-isolated
//! space of the group does. Isolated spaces never touch the group hash.

use crate::FileIndex;
use crate::cids::{CidEntries, LoadedCid};
use crate::entry::{FileEntry, decode, encode, now};
use crate::keys::{cid_key, file_key};
use crate::loader::SpaceLock;
use filenode_common::{Key, Result};
use filenode_store::Cmd;
use tracing::{debug, warn};

impl FileIndex {
    /// Attach the CIDs of `cids` to a file, creating the file if needed.
    ///
    /// CIDs already in the file are skipped, so binding is idempotent.
    /// The caller keeps ownership of the batch and must release it.
    pub async fn file_bind(&self, key: &Key, file_id: &str, cids: &mut CidEntries) -> Result<()> {
        self.check_space_not_deleted(key).await?;
        let mut lock = self.acquire_space(key).await?;
        let result = self.bind_locked(&mut lock, file_id, &mut cids.entries).await;
        lock.release().await;
        result
    }

    pub(crate) async fn bind_locked(
        &self,
        lock: &mut SpaceLock,
        file_id: &str,
        cids: &mut [LoadedCid],
    ) -> Result<()> {
        let now = now();
        let file_field = file_key(file_id);
        let (mut file, new_file) = match self.fast.hget(&lock.space_key, &file_field).await? {
            Some(data) => (decode::<FileEntry>(&data)?, false),
            None => (FileEntry::new(now), true),
        };

        let mut added = Vec::new();
        for (i, loaded) in cids.iter().enumerate() {
            let cid = loaded.cid.to_string();
            if file.exists(&cid) {
                continue;
            }
            file.cids.push(cid);
            file.size += loaded.entry.size;
            added.push(i);
        }
        if added.is_empty() {
            debug!("File '{}' of {} already holds every cid", file_id, lock.key);
            return Ok(());
        }
        file.update_time = now;

        let isolated = lock.space.is_isolated();
        let mut lookups = Vec::with_capacity(added.len() * 2);
        for &i in &added {
            let field = cid_key(&cids[i].cid);
            if !isolated {
                lookups.push(Cmd::hexists(lock.group_key.clone(), field.clone()));
            }
            lookups.push(Cmd::hexists(lock.space_key.clone(), field));
        }
        let mut replies = self.fast.pipeline(lookups).await?.into_iter();

        let mut cmds = Vec::with_capacity(added.len() * 2 + 3);
        let mut new_in_space = Vec::new();
        for &i in &added {
            let field = cid_key(&cids[i].cid);
            let size = cids[i].entry.size;
            if !isolated {
                if !replies.next().is_some_and(|r| r.as_bool()) {
                    lock.group.cid_count += 1;
                    lock.group.size += size;
                }
                cmds.push(Cmd::hincr_by(lock.group_key.clone(), field.clone(), 1));
            }
            if !replies.next().is_some_and(|r| r.as_bool()) {
                lock.space.cid_count += 1;
                lock.space.size += size;
                new_in_space.push(i);
            }
            cmds.push(Cmd::hincr_by(lock.space_key.clone(), field, 1));
        }

        if new_file {
            lock.space.file_count += 1;
        }
        lock.group.add_space_id(&lock.key.space_id);
        cmds.push(Cmd::hset(lock.space_key.clone(), file_field, encode(&file)?));
        cmds.extend(lock.save_cmds()?);
        self.fast.transaction(cmds).await?;

        // Secondary counters, repaired by the checker if a write is lost
        for i in new_in_space {
            let loaded = &mut cids[i];
            loaded.entry.refs += 1;
            loaded.entry.update_time = now;
            if let Err(e) = self.save_cid_entry(loaded).await {
                warn!("Failed to update refs of cid {}: {}", loaded.cid, e);
            }
        }
        Ok(())
    }
}
