//! Branch store: one pointer record per branch.
//!
//! A branch record locates the branch tip in the log. A freshly created
//! branch has no registered versions yet; its record points into the base
//! branch it was created from, and is resolved through that base until a
//! first version is registered on it.

use bson::doc;
use futures::TryStreamExt;
use mongodb::{ClientSession, Collection, Database};
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::tree::VersionId;

use super::store_name;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BranchRecord {
    pub name: String,
    pub tip_n: i64,
    pub tip_branch: String,
}

impl BranchRecord {
    pub fn tip(&self) -> VersionId {
        VersionId::new(self.tip_n, &self.tip_branch)
    }

    /// Whether this branch has versions of its own.
    pub fn has_versions(&self) -> bool {
        self.tip_branch == self.name
    }
}

pub struct BranchStore {
    collection: Collection<BranchRecord>,
}

impl BranchStore {
    pub fn new(database: &Database, target: &str) -> BranchStore {
        BranchStore {
            collection: database.collection(&store_name("branches", target)),
        }
    }

    pub async fn exists(&self, name: &str) -> Result<bool> {
        Ok(self
            .collection
            .find_one(doc! {"name": name})
            .await?
            .is_some())
    }

    pub async fn get(&self, name: &str) -> Result<BranchRecord> {
        self.collection
            .find_one(doc! {"name": name})
            .await?
            .ok_or_else(|| Error::UnknownBranch(name.to_string()))
    }

    pub async fn names(&self) -> Result<Vec<String>> {
        let records: Vec<BranchRecord> =
            self.collection.find(doc! {}).await?.try_collect().await?;
        let mut names: Vec<String> = records.into_iter().map(|r| r.name).collect();
        names.sort();
        Ok(names)
    }

    pub async fn create(&self, record: &BranchRecord, session: &mut ClientSession) -> Result<()> {
        if self.exists(&record.name).await? {
            return Err(Error::BranchExists(record.name.clone()));
        }
        self.collection
            .insert_one(record)
            .session(session)
            .await?;
        Ok(())
    }

    /// Move a branch pointer to a new tip.
    pub async fn update_tip(
        &self,
        name: &str,
        tip: &VersionId,
        session: &mut ClientSession,
    ) -> Result<()> {
        let updated = self
            .collection
            .update_one(
                doc! {"name": name},
                doc! {"$set": {"tip_n": tip.n, "tip_branch": &tip.branch}},
            )
            .session(session)
            .await?;
        if updated.matched_count == 0 {
            return Err(Error::UnknownBranch(name.to_string()));
        }
        Ok(())
    }

    pub async fn delete_many(&self, names: &[String], session: &mut ClientSession) -> Result<()> {
        if names.is_empty() {
            return Ok(());
        }
        self.collection
            .delete_many(doc! {"name": {"$in": names}})
            .session(session)
            .await?;
        Ok(())
    }

    pub async fn drop(&self) -> Result<()> {
        self.collection.drop().await?;
        Ok(())
    }
}
