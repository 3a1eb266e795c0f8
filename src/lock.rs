//! Cross-process re-entrant locking for versioning operations.
//!
//! Mutual exclusion is per `(database, collection)` and lives in the
//! `__vc_lock` collection, so any number of processes on any number of
//! hosts serialize through the database itself. Acquisition retries a CAS
//! with exponential backoff; re-entry by the same holder increments a
//! depth counter. Every release after a state-mutating operation advances
//! an epoch, which later acquisitions compare against to decide whether
//! their in-memory caches (log tree, delta trees) are stale.

use std::time::Duration;

use mongodb::Database;
use tracing::debug;
use uuid::Uuid;

use crate::error::{Error, Result};
use crate::store::LockStore;

/// Default bound on waiting for the lock.
pub const DEFAULT_LOCK_TIMEOUT: Duration = Duration::from_secs(30);

/// First retry interval; doubled on every miss up to [`MAX_BACKOFF`].
const INITIAL_BACKOFF: Duration = Duration::from_millis(50);
const MAX_BACKOFF: Duration = Duration::from_millis(1600);

pub struct LockManager {
    store: LockStore,
    collection_name: String,
    holder_id: String,
    timeout: Duration,
    depth: u32,
    last_seen_epoch: Option<i64>,
}

impl LockManager {
    pub fn new(database: &Database, collection_name: &str) -> LockManager {
        LockManager {
            store: LockStore::new(database),
            collection_name: collection_name.to_string(),
            holder_id: Uuid::new_v4().to_string(),
            timeout: DEFAULT_LOCK_TIMEOUT,
            depth: 0,
            last_seen_epoch: None,
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> LockManager {
        self.timeout = timeout;
        self
    }

    /// Create the lock record for this collection if missing.
    pub async fn ensure_record(&self) -> Result<()> {
        self.store.ensure(&self.collection_name).await
    }

    /// Remove the lock record (collection dropped).
    pub async fn remove_record(&self) -> Result<()> {
        self.store.remove(&self.collection_name).await
    }

    /// Acquire the lock, waiting with backoff up to the configured bound.
    ///
    /// Returns `true` when the caller's caches must be invalidated:
    /// another holder released the lock after mutating state since this
    /// process last held it.
    pub async fn acquire(&mut self) -> Result<bool> {
        if self.depth > 0 {
            // Re-entry from the same logical owner.
            if !self
                .store
                .reenter(&self.collection_name, &self.holder_id)
                .await?
            {
                return Err(Error::LockLost(self.collection_name.clone()));
            }
            self.depth += 1;
            return Ok(false);
        }

        // The record may not exist yet when locking a collection that is
        // about to be initialised (first push into an untracked remote).
        self.store.ensure(&self.collection_name).await?;

        let deadline = tokio::time::Instant::now() + self.timeout;
        let mut backoff = INITIAL_BACKOFF;
        loop {
            if let Some(record) = self
                .store
                .try_acquire(&self.collection_name, &self.holder_id)
                .await?
            {
                self.depth = 1;
                let stale = self.last_seen_epoch != Some(record.epoch);
                if stale {
                    debug!(
                        collection = %self.collection_name,
                        epoch = record.epoch,
                        "lock epoch advanced, caches are stale"
                    );
                }
                self.last_seen_epoch = Some(record.epoch);
                return Ok(stale);
            }

            if tokio::time::Instant::now() + backoff > deadline {
                return Err(Error::LockTimeout(self.collection_name.clone()));
            }
            tokio::time::sleep(backoff).await;
            backoff = (backoff * 2).min(MAX_BACKOFF);
        }
    }

    /// Release one level of the lock.
    ///
    /// `mutated` records whether the critical section changed versioning
    /// state; only a mutating release advances the epoch other processes
    /// use for cache invalidation.
    pub async fn release(&mut self, mutated: bool) -> Result<()> {
        if self.depth == 0 {
            return Ok(());
        }
        let record = self
            .store
            .release(&self.collection_name, &self.holder_id, mutated)
            .await?
            .ok_or_else(|| Error::LockLost(self.collection_name.clone()))?;
        self.depth -= 1;
        if self.depth == 0 {
            self.last_seen_epoch = Some(record.epoch);
        }
        Ok(())
    }

    pub fn is_held(&self) -> bool {
        self.depth > 0
    }
}
