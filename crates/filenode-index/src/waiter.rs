//! Waiting for uploads
//!
//! Waiters register per CID before checking whether the CID already
//! exists, so an upload landing between the check and the wait is never
//! missed. Uploads are announced on the hot tier's pub/sub channel and
//! delivered to waiters of every index instance.

use crate::FileIndex;
use crate::keys::CID_UPLOADED_CHANNEL;
use bytes::Bytes;
use filenode_common::{Cid, Error, Result};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tokio::sync::oneshot;
use tracing::debug;

#[derive(Default)]
pub(crate) struct CidWaiters {
    waiters: Mutex<HashMap<Cid, HashMap<u64, oneshot::Sender<()>>>>,
    next_id: AtomicU64,
}

impl CidWaiters {
    fn register(&self, cid: Cid) -> (Registration<'_>, oneshot::Receiver<()>) {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = oneshot::channel();
        self.waiters.lock().entry(cid).or_default().insert(id, tx);
        (
            Registration {
                waiters: self,
                cid,
                id,
            },
            rx,
        )
    }

    fn unregister(&self, cid: &Cid, id: u64) {
        let mut waiters = self.waiters.lock();
        if let Some(ids) = waiters.get_mut(cid) {
            ids.remove(&id);
            if ids.is_empty() {
                waiters.remove(cid);
            }
        }
    }

    /// Wake every waiter of `cid`
    pub fn notify(&self, cid: &Cid) {
        let Some(ids) = self.waiters.lock().remove(cid) else {
            return;
        };
        debug!("Waking {} waiters of cid {}", ids.len(), cid);
        for (_, tx) in ids {
            let _ = tx.send(());
        }
    }

    /// Drop every waiter; their waits fail
    pub fn clear(&self) {
        self.waiters.lock().clear();
    }

    #[cfg(test)]
    fn len(&self) -> usize {
        self.waiters.lock().values().map(HashMap::len).sum()
    }
}

/// Removes a waiter when its wait ends, whichever way it ends
struct Registration<'a> {
    waiters: &'a CidWaiters,
    cid: Cid,
    id: u64,
}

impl Drop for Registration<'_> {
    fn drop(&mut self) {
        self.waiters.unregister(&self.cid, self.id);
    }
}

impl FileIndex {
    /// Wait until `cid` is indexed, for at most `timeout`.
    ///
    /// Fails with [`Error::DeadlineExceeded`] when the time runs out.
    pub async fn wait_cid_exists(&self, cid: &Cid, timeout: Duration) -> Result<()> {
        let (_registration, rx) = self.waiters.register(*cid);
        if self.cid_exists(cid).await? {
            return Ok(());
        }
        match tokio::time::timeout(timeout, rx).await {
            Ok(Ok(())) => Ok(()),
            Ok(Err(_)) => Err(Error::internal("file index closed")),
            Err(_) => Err(Error::DeadlineExceeded),
        }
    }

    /// Announce newly indexed CIDs to every waiter
    pub async fn on_block_uploaded(&self, cids: &[Cid]) -> Result<()> {
        for cid in cids {
            self.fast
                .publish(CID_UPLOADED_CHANNEL, Bytes::from(cid.to_string()))
                .await?;
        }
        Ok(())
    }
}
