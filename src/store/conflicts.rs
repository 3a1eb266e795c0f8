//! Conflicts store: one record per document an auto-merge could not
//! resolve. Exists only while conflicts are pending.

use bson::oid::ObjectId;
use bson::{doc, Bson, Document};
use futures::TryStreamExt;
use mongodb::{ClientSession, Collection, Database};
use serde::{Deserialize, Serialize};

use crate::error::Result;

use super::store_name;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConflictRecord {
    #[serde(rename = "_id")]
    pub id: ObjectId,
    pub document_id: Bson,
    /// State on the branch being merged into.
    pub destination: Document,
    /// State on the branch being merged from.
    pub source: Document,
    /// Partial merge; conflicted fields carry the destination value.
    pub merged: Document,
    pub destination_branch: String,
    pub source_branch: String,
}

pub struct ConflictStore {
    collection: Collection<ConflictRecord>,
}

impl ConflictStore {
    pub fn new(database: &Database, target: &str) -> ConflictStore {
        ConflictStore {
            collection: database.collection(&store_name("conflicts", target)),
        }
    }

    pub async fn all(&self) -> Result<Vec<ConflictRecord>> {
        let records = self.collection.find(doc! {}).await?.try_collect().await?;
        Ok(records)
    }

    pub async fn count(&self) -> Result<u64> {
        Ok(self.collection.count_documents(doc! {}).await?)
    }

    pub async fn insert_many(
        &self,
        records: &[ConflictRecord],
        session: &mut ClientSession,
    ) -> Result<()> {
        if records.is_empty() {
            return Ok(());
        }
        self.collection
            .insert_many(records)
            .session(session)
            .await?;
        Ok(())
    }

    pub async fn delete(&self, id: ObjectId) -> Result<()> {
        self.collection.delete_one(doc! {"_id": id}).await?;
        Ok(())
    }

    pub async fn drop(&self) -> Result<()> {
        self.collection.drop().await?;
        Ok(())
    }
}
