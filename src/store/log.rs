//! Log store: one record per registered version.

use bson::oid::ObjectId;
use bson::doc;
use futures::TryStreamExt;
use mongodb::{ClientSession, Collection, Database};

use crate::error::Result;
use crate::tree::{LogRecord, LogTree};

use super::store_name;

pub struct LogStore {
    collection: Collection<LogRecord>,
    database: Database,
}

impl LogStore {
    pub fn new(database: &Database, target: &str) -> LogStore {
        LogStore {
            collection: database.collection(&store_name("log", target)),
            database: database.clone(),
        }
    }

    pub fn name(&self) -> String {
        self.collection.name().to_string()
    }

    /// The presence of the log collection is what marks a target as
    /// initialised for versioning.
    pub async fn exists(&self) -> Result<bool> {
        let names = self.database.list_collection_names().await?;
        Ok(names.contains(&self.name()))
    }

    /// Load every log record and rebuild the in-memory tree.
    pub async fn load_tree(&self) -> Result<LogTree> {
        let records: Vec<LogRecord> = self.collection.find(doc! {}).await?.try_collect().await?;
        LogTree::from_records(records)
    }

    /// Insert a new log record and link it into its parent's `next_ids`.
    pub async fn insert(&self, record: &LogRecord, session: &mut ClientSession) -> Result<()> {
        self.collection
            .insert_one(record)
            .session(&mut *session)
            .await?;
        if let Some(prev_id) = record.prev_id {
            self.collection
                .update_one(
                    doc! {"_id": prev_id},
                    doc! {"$push": {"next_ids": record.id}},
                )
                .session(session)
                .await?;
        }
        Ok(())
    }

    /// Remove a set of log records and the parent link to the detached root.
    pub async fn remove(
        &self,
        ids: &[ObjectId],
        detached_root: ObjectId,
        parent_id: ObjectId,
        session: &mut ClientSession,
    ) -> Result<()> {
        self.collection
            .update_one(
                doc! {"_id": parent_id},
                doc! {"$pull": {"next_ids": detached_root}},
            )
            .session(&mut *session)
            .await?;
        self.collection
            .delete_many(doc! {"_id": {"$in": ids}})
            .session(session)
            .await?;
        Ok(())
    }

    pub async fn drop(&self) -> Result<()> {
        self.collection.drop().await?;
        Ok(())
    }
}
