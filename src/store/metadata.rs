//! Metadata store: a singleton record describing the engine position.

use bson::{doc, Bson};
use mongodb::{ClientSession, Collection, Database};
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::tree::VersionId;

use super::store_name;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MetadataRecord {
    pub current_n: i64,
    pub current_branch: String,
    pub detached: bool,
    pub changed: bool,
    pub has_stash: bool,
    pub has_conflicts: bool,
    /// Last change-stream resume token persisted by the listener.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resume_token: Option<Bson>,
}

impl MetadataRecord {
    pub fn initial() -> MetadataRecord {
        MetadataRecord {
            current_n: 0,
            current_branch: crate::tree::MAIN_BRANCH.to_string(),
            detached: false,
            changed: false,
            has_stash: false,
            has_conflicts: false,
            resume_token: None,
        }
    }

    pub fn current(&self) -> VersionId {
        VersionId::new(self.current_n, &self.current_branch)
    }
}

pub struct MetadataStore {
    collection: Collection<MetadataRecord>,
}

impl MetadataStore {
    pub fn new(database: &Database, target: &str) -> MetadataStore {
        MetadataStore {
            collection: database.collection(&store_name("metadata", target)),
        }
    }

    pub async fn load(&self) -> Result<MetadataRecord> {
        self.collection
            .find_one(doc! {})
            .await?
            .ok_or_else(|| Error::CorruptState("the metadata record is missing".into()))
    }

    /// Replace the singleton inside an operation's transaction.
    pub async fn save(&self, record: &MetadataRecord, session: &mut ClientSession) -> Result<()> {
        self.collection
            .find_one_and_replace(doc! {}, record)
            .upsert(true)
            .session(session)
            .await?;
        Ok(())
    }

    /// Flip the changed hint outside a transaction; the listener and the
    /// write-through paths both use this.
    pub async fn set_changed(&self, changed: bool) -> Result<()> {
        self.collection
            .update_one(doc! {}, doc! {"$set": {"changed": changed}})
            .await?;
        Ok(())
    }

    /// Persist the listener's resume token. The listener owns this field
    /// and writes it without holding the versioning lock.
    pub async fn save_resume_token(&self, token: &Bson) -> Result<()> {
        self.collection
            .update_one(doc! {}, doc! {"$set": {"resume_token": token}})
            .await?;
        Ok(())
    }

    pub async fn drop(&self) -> Result<()> {
        self.collection.drop().await?;
        Ok(())
    }
}
