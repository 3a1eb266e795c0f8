//! Stash stores: a single-level shelf for uncommitted changes.
//!
//! Stashing copies the modified documents and their trackers into the
//! `stash` and `stash_modified` collections so the working collection can
//! be restored from the replica. Applying the stash writes the shelved
//! documents back and restores the trackers.

use bson::{doc, Bson, Document};
use futures::TryStreamExt;
use mongodb::{ClientSession, Collection, Database};

use crate::error::Result;

use super::modified::ModifiedRecord;
use super::store_name;

pub struct StashStore {
    documents: Collection<Document>,
    trackers: Collection<ModifiedRecord>,
    database: Database,
}

impl StashStore {
    pub fn new(database: &Database, target: &str) -> StashStore {
        StashStore {
            documents: database.collection(&store_name("stash", target)),
            trackers: database.collection(&store_name("stash_modified", target)),
            database: database.clone(),
        }
    }

    pub async fn exists(&self) -> Result<bool> {
        let names = self.database.list_collection_names().await?;
        Ok(names.contains(&self.trackers.name().to_string()))
    }

    /// Shelve the given documents and trackers.
    pub async fn store(
        &self,
        documents: &[Document],
        trackers: &[ModifiedRecord],
        session: &mut ClientSession,
    ) -> Result<()> {
        if !documents.is_empty() {
            self.documents
                .insert_many(documents)
                .session(&mut *session)
                .await?;
        }
        // The tracker collection is created even when empty; its presence
        // is what marks the stash as occupied.
        if !trackers.is_empty() {
            self.trackers
                .insert_many(trackers)
                .session(&mut *session)
                .await?;
        } else {
            self.database
                .create_collection(self.trackers.name())
                .session(session)
                .await?;
        }
        Ok(())
    }

    pub async fn documents(&self) -> Result<Vec<Document>> {
        let docs = self.documents.find(doc! {}).await?.try_collect().await?;
        Ok(docs)
    }

    pub async fn trackers(&self) -> Result<Vec<ModifiedRecord>> {
        let records = self.trackers.find(doc! {}).await?.try_collect().await?;
        Ok(records)
    }

    /// Ids of the documents held in the stash.
    pub async fn document_ids(&self) -> Result<Vec<Bson>> {
        let records = self.trackers().await?;
        Ok(records.into_iter().map(|r| r.document_id).collect())
    }

    pub async fn drop(&self) -> Result<()> {
        self.documents.drop().await?;
        self.trackers.drop().await?;
        Ok(())
    }
}
