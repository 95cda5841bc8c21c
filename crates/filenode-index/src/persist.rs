//! Persistence sweep
//!
//! Moves keys that have not been used for `persist_ttl` out of the hot
//! tier into the cold index. Each of the 256 partitions is swept
//! independently, in random order, by a bounded number of workers. A
//! swept key is added to its partition's bloom filter so the loader
//! knows to look for it in the cold index.

use crate::FileIndex;
use crate::entry::now;
use crate::keys::{PARTITION_COUNT, bloom_key, last_used_key, lock_key};
use filenode_common::Result;
use futures::StreamExt;
use rand::seq::SliceRandom;
use std::time::Instant;
use tracing::{debug, info, warn};

impl FileIndex {
    /// Run one sweep. Returns the number of keys moved to the cold index.
    pub async fn persist_keys(&self) -> Result<usize> {
        let started = Instant::now();
        #[allow(clippy::cast_possible_wrap, clippy::cast_precision_loss)]
        let deadline = (now() - self.config.persist_ttl_secs as i64) as f64;

        let mut partitions: Vec<u64> = (0..PARTITION_COUNT).collect();
        partitions.shuffle(&mut rand::thread_rng());

        let results: Vec<Result<usize>> = futures::stream::iter(partitions)
            .map(|partition| self.persist_partition(partition, deadline))
            .buffer_unordered(self.config.persist_workers.max(1))
            .collect()
            .await;

        let mut moved = 0;
        let mut first_error = None;
        for result in results {
            match result {
                Ok(n) => moved += n,
                Err(e) => {
                    warn!("Persist sweep partition failed: {}", e);
                    first_error.get_or_insert(e);
                }
            }
        }
        info!(
            "Persist sweep moved {} keys in {:?}",
            moved,
            started.elapsed()
        );
        match first_error {
            Some(e) => Err(e),
            None => Ok(moved),
        }
    }

    async fn persist_partition(&self, partition: u64, deadline: f64) -> Result<usize> {
        let last_used = last_used_key(partition);
        let keys = self
            .fast
            .zrange_by_score(&last_used, deadline, self.config.persist_batch.max(1))
            .await?;
        let mut moved = 0;
        for key in keys {
            if self.persist_key(partition, &last_used, &key, deadline).await? {
                moved += 1;
            }
        }
        Ok(moved)
    }

    async fn persist_key(
        &self,
        partition: u64,
        last_used: &str,
        key: &str,
        deadline: f64,
    ) -> Result<bool> {
        let lock = self.locker.lock(&lock_key(key)).await?;
        let result: Result<bool> = async {
            // Used again since it was listed
            match self.fast.zscore(last_used, key).await? {
                Some(score) if score <= deadline => {}
                _ => return Ok(false),
            }
            let Some(dump) = self.fast.dump(key).await? else {
                debug!("Key '{}' vanished before persisting", key);
                self.fast.zrem(last_used, key).await?;
                return Ok(false);
            };
            self.cold.index_put(key, dump).await?;
            self.fast.bf_add(&bloom_key(partition), key).await?;
            self.fast.zrem(last_used, key).await?;
            self.fast.del(key).await?;
            Ok(true)
        }
        .await;
        lock.unlock().await;
        result
    }
}
