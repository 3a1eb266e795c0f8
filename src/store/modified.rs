//! Modified store: one tracker per document changed since the last
//! registered version.
//!
//! The listener keeps at most one semantic tracker per document by
//! coalescing consecutive operations; register drains the store after
//! turning the trackers into deltas.

use bson::oid::ObjectId;
use bson::{doc, Bson};
use futures::TryStreamExt;
use mongodb::{ClientSession, Collection, Database};
use serde::{Deserialize, Serialize};

use crate::error::Result;

use super::store_name;

/// The net operation that touched a document in the current interval.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TrackerOp {
    Insert,
    Update,
    Delete,
}

/// Coalesce an incoming operation into the tracker state for a document.
///
/// `None` means no tracker: an insert followed by a delete within one
/// interval cancels out entirely.
pub fn coalesce(current: Option<TrackerOp>, incoming: TrackerOp) -> Option<TrackerOp> {
    use TrackerOp::*;
    match (current, incoming) {
        (None, op) => Some(op),
        (Some(Insert), Delete) => None,
        (Some(Insert), _) => Some(Insert),
        (Some(Update), Delete) => Some(Delete),
        (Some(Update), _) => Some(Update),
        (Some(Delete), Insert) => Some(Update),
        (Some(Delete), Update) => Some(Update),
        (Some(Delete), Delete) => Some(Delete),
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModifiedRecord {
    #[serde(rename = "_id")]
    pub id: ObjectId,
    pub document_id: Bson,
    pub op: TrackerOp,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resume_token: Option<Bson>,
}

pub struct ModifiedStore {
    collection: Collection<ModifiedRecord>,
}

impl ModifiedStore {
    pub fn new(database: &Database, target: &str) -> ModifiedStore {
        ModifiedStore {
            collection: database.collection(&store_name("modified", target)),
        }
    }

    pub async fn is_empty(&self) -> Result<bool> {
        Ok(self.collection.count_documents(doc! {}).await? == 0)
    }

    pub async fn all(&self) -> Result<Vec<ModifiedRecord>> {
        let records = self.collection.find(doc! {}).await?.try_collect().await?;
        Ok(records)
    }

    /// Fold a change event into the tracker for its document.
    ///
    /// Returns whether a tracker exists for the document afterwards.
    pub async fn record_event(
        &self,
        document_id: &Bson,
        op: TrackerOp,
        resume_token: Option<&Bson>,
    ) -> Result<bool> {
        let existing = self
            .collection
            .find_one(doc! {"document_id": document_id})
            .await?;

        let next = coalesce(existing.as_ref().map(|r| r.op), op);
        match (existing, next) {
            (Some(record), None) => {
                self.collection.delete_one(doc! {"_id": record.id}).await?;
                Ok(false)
            }
            (Some(record), Some(op)) => {
                if record.op != op {
                    self.collection
                        .update_one(
                            doc! {"_id": record.id},
                            doc! {"$set": {"op": bson::to_bson(&op)?}},
                        )
                        .await?;
                }
                Ok(true)
            }
            (None, Some(op)) => {
                self.collection
                    .insert_one(ModifiedRecord {
                        id: ObjectId::new(),
                        document_id: document_id.clone(),
                        op,
                        resume_token: resume_token.cloned(),
                    })
                    .await?;
                Ok(true)
            }
            (None, None) => Ok(false),
        }
    }

    /// Remove specific trackers inside an operation's transaction.
    pub async fn delete(&self, ids: &[ObjectId], session: &mut ClientSession) -> Result<()> {
        if ids.is_empty() {
            return Ok(());
        }
        self.collection
            .delete_many(doc! {"_id": {"$in": ids}})
            .session(session)
            .await?;
        Ok(())
    }

    /// Remove every tracker outside a transaction.
    pub async fn purge(&self) -> Result<()> {
        self.collection.delete_many(doc! {}).await?;
        Ok(())
    }

    pub async fn clear(&self, session: &mut ClientSession) -> Result<()> {
        self.collection
            .delete_many(doc! {})
            .session(session)
            .await?;
        Ok(())
    }

    /// Replace the whole store contents (stash restore path).
    pub async fn replace_all(
        &self,
        records: &[ModifiedRecord],
        session: &mut ClientSession,
    ) -> Result<()> {
        self.collection
            .delete_many(doc! {})
            .session(&mut *session)
            .await?;
        if !records.is_empty() {
            self.collection
                .insert_many(records)
                .session(session)
                .await?;
        }
        Ok(())
    }

    pub async fn drop(&self) -> Result<()> {
        self.collection.drop().await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use TrackerOp::*;

    #[test]
    fn coalescing_follows_the_precedence_table() {
        assert_eq!(coalesce(None, Insert), Some(Insert));
        assert_eq!(coalesce(None, Update), Some(Update));
        assert_eq!(coalesce(None, Delete), Some(Delete));

        // An insert seen again stays an insert regardless of later edits.
        assert_eq!(coalesce(Some(Insert), Update), Some(Insert));
        assert_eq!(coalesce(Some(Insert), Insert), Some(Insert));
        // Inserted then deleted within one interval nets out.
        assert_eq!(coalesce(Some(Insert), Delete), None);

        assert_eq!(coalesce(Some(Update), Update), Some(Update));
        assert_eq!(coalesce(Some(Update), Delete), Some(Delete));

        // A document deleted and re-inserted is a net update.
        assert_eq!(coalesce(Some(Delete), Insert), Some(Update));
        assert_eq!(coalesce(Some(Delete), Delete), Some(Delete));
    }
}
