//! Lock store: the per-database `__vc_lock` collection.
//!
//! One record per tracked collection. Mutual exclusion is built from
//! atomic compare-and-swap updates on the `locked` field; `epoch`
//! advances on every release that followed a state-mutating operation so
//! other processes can detect stale caches.

use bson::doc;
use mongodb::options::ReturnDocument;
use mongodb::{Collection, Database};
use serde::{Deserialize, Serialize};

use crate::error::Result;

/// Name of the per-database lock collection.
pub const LOCK_COLLECTION: &str = "__vc_lock";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LockRecord {
    pub collection_name: String,
    pub locked: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub holder_id: Option<String>,
    #[serde(default)]
    pub depth: i64,
    #[serde(default)]
    pub epoch: i64,
}

pub struct LockStore {
    collection: Collection<LockRecord>,
}

impl LockStore {
    pub fn new(database: &Database) -> LockStore {
        LockStore {
            collection: database.collection(LOCK_COLLECTION),
        }
    }

    /// Ensure a lock record exists for the given tracked collection.
    pub async fn ensure(&self, collection_name: &str) -> Result<()> {
        self.collection
            .update_one(
                doc! {"collection_name": collection_name},
                doc! {"$setOnInsert": {
                    "collection_name": collection_name,
                    "locked": false,
                    "depth": 0_i64,
                    "epoch": 0_i64,
                }},
            )
            .upsert(true)
            .await?;
        Ok(())
    }

    /// CAS `locked: false -> true` for a new holder. Returns the record
    /// after the swap, or `None` when the lock is held by someone else.
    pub async fn try_acquire(
        &self,
        collection_name: &str,
        holder_id: &str,
    ) -> Result<Option<LockRecord>> {
        let record = self
            .collection
            .find_one_and_update(
                doc! {"collection_name": collection_name, "locked": false},
                doc! {"$set": {"locked": true, "holder_id": holder_id, "depth": 1_i64}},
            )
            .return_document(ReturnDocument::After)
            .await?;
        Ok(record)
    }

    /// Bump the depth for a holder that already owns the lock.
    pub async fn reenter(&self, collection_name: &str, holder_id: &str) -> Result<bool> {
        let record = self
            .collection
            .find_one_and_update(
                doc! {
                    "collection_name": collection_name,
                    "locked": true,
                    "holder_id": holder_id,
                },
                doc! {"$inc": {"depth": 1_i64}},
            )
            .await?;
        Ok(record.is_some())
    }

    /// Decrement the depth; on reaching zero, open the lock and advance
    /// the epoch iff the critical section mutated state.
    ///
    /// Returns the record after the update, or `None` when the caller no
    /// longer holds the lock.
    pub async fn release(
        &self,
        collection_name: &str,
        holder_id: &str,
        mutated: bool,
    ) -> Result<Option<LockRecord>> {
        // Inner re-entrant frame: just drop one level.
        let inner = self
            .collection
            .find_one_and_update(
                doc! {
                    "collection_name": collection_name,
                    "locked": true,
                    "holder_id": holder_id,
                    "depth": {"$gt": 1_i64},
                },
                doc! {"$inc": {"depth": -1_i64}},
            )
            .return_document(ReturnDocument::After)
            .await?;
        if inner.is_some() {
            return Ok(inner);
        }

        let mut update = doc! {"$set": {"locked": false, "depth": 0_i64}, "$unset": {"holder_id": ""}};
        if mutated {
            update.insert("$inc", doc! {"epoch": 1_i64});
        }
        let record = self
            .collection
            .find_one_and_update(
                doc! {
                    "collection_name": collection_name,
                    "locked": true,
                    "holder_id": holder_id,
                },
                update,
            )
            .return_document(ReturnDocument::After)
            .await?;
        Ok(record)
    }

    /// Drop the lock record for a collection; the collection itself is
    /// removed once no tracked collections remain.
    pub async fn remove(&self, collection_name: &str) -> Result<()> {
        self.collection
            .delete_one(doc! {"collection_name": collection_name})
            .await?;
        if self.collection.count_documents(doc! {}).await? == 0 {
            self.collection.drop().await?;
        }
        Ok(())
    }
}
