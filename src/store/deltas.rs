//! Delta store: per-document invertible diffs, one record per document per
//! registered version that changed it.
//!
//! `prev_id` links a delta to the most recent earlier delta for the same
//! document on the path to the log root, which is not necessarily the
//! previous log entry. Documents inserted independently on different
//! branches have disconnected delta subtrees with `prev_id = null`.

use std::collections::{HashMap, HashSet};

use bson::oid::ObjectId;
use bson::{doc, Binary, Bson};
use chrono::{DateTime, Utc};
use futures::TryStreamExt;
use mongodb::{ClientSession, Collection, Database};
use serde::{Deserialize, Serialize};

use crate::delta::Delta;
use crate::error::Result;
use crate::tree::{Direction, VersionId};
use crate::value::Value;

use super::store_name;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeltaRecord {
    #[serde(rename = "_id")]
    pub id: ObjectId,
    pub document_id: Bson,
    pub version_n: i64,
    pub branch: String,
    #[serde(with = "bson::serde_helpers::chrono_datetime_as_bson_datetime")]
    pub timestamp: DateTime<Utc>,
    pub forward: Binary,
    pub backward: Binary,
    pub prev_id: Option<ObjectId>,
    pub next_ids: Vec<ObjectId>,
}

impl DeltaRecord {
    pub fn version(&self) -> VersionId {
        VersionId::new(self.version_n, &self.branch)
    }

    pub fn document_key(&self) -> Value {
        Value::from_bson(&self.document_id)
    }

    /// Decode the stored delta for one direction of travel.
    pub fn delta(&self, direction: Direction) -> Result<Delta> {
        let bytes = match direction {
            Direction::Forward => &self.forward.bytes,
            Direction::Backward => &self.backward.bytes,
        };
        Delta::from_bytes(bytes)
    }

    /// Build a record from a forward delta, storing both directions.
    pub fn encode(
        document_id: Bson,
        version: &VersionId,
        timestamp: DateTime<Utc>,
        forward: &Delta,
        prev_id: Option<ObjectId>,
    ) -> Result<DeltaRecord> {
        Ok(DeltaRecord {
            id: ObjectId::new(),
            document_id,
            version_n: version.n,
            branch: version.branch.clone(),
            timestamp,
            forward: binary(forward.to_bytes()?),
            backward: binary(forward.invert().to_bytes()?),
            prev_id,
            next_ids: Vec::new(),
        })
    }
}

fn binary(bytes: Vec<u8>) -> Binary {
    Binary {
        subtype: bson::spec::BinarySubtype::Generic,
        bytes,
    }
}

fn version_filter(versions: &[VersionId]) -> bson::Document {
    let clauses: Vec<Bson> = versions
        .iter()
        .map(|v| Bson::Document(doc! {"version_n": v.n, "branch": &v.branch}))
        .collect();
    doc! {"$or": clauses}
}

pub struct DeltaStore {
    collection: Collection<DeltaRecord>,
}

impl DeltaStore {
    pub fn new(database: &Database, target: &str) -> DeltaStore {
        DeltaStore {
            collection: database.collection(&store_name("deltas", target)),
        }
    }

    /// All deltas for one document.
    pub async fn for_document(&self, document_id: &Bson) -> Result<Vec<DeltaRecord>> {
        let records = self
            .collection
            .find(doc! {"document_id": document_id})
            .await?
            .try_collect()
            .await?;
        Ok(records)
    }

    /// Deltas registered at any of the given versions, grouped by document.
    pub async fn in_versions(
        &self,
        versions: &[VersionId],
    ) -> Result<HashMap<Value, Vec<DeltaRecord>>> {
        if versions.is_empty() {
            return Ok(HashMap::new());
        }
        let records: Vec<DeltaRecord> = self
            .collection
            .find(version_filter(versions))
            .sort(doc! {"timestamp": 1})
            .await?
            .try_collect()
            .await?;

        let mut by_document: HashMap<Value, Vec<DeltaRecord>> = HashMap::new();
        for record in records {
            by_document
                .entry(record.document_key())
                .or_default()
                .push(record);
        }
        Ok(by_document)
    }

    pub async fn insert(&self, record: &DeltaRecord, session: &mut ClientSession) -> Result<()> {
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

    /// Replace the payload of an existing delta in the current interval.
    pub async fn update_payload(
        &self,
        id: ObjectId,
        forward: &Delta,
        session: &mut ClientSession,
    ) -> Result<()> {
        self.collection
            .update_one(
                doc! {"_id": id},
                doc! {"$set": {
                    "forward": binary(forward.to_bytes()?),
                    "backward": binary(forward.invert().to_bytes()?),
                }},
            )
            .session(session)
            .await?;
        Ok(())
    }

    pub async fn delete(&self, id: ObjectId, session: &mut ClientSession) -> Result<()> {
        self.collection
            .delete_one(doc! {"_id": id})
            .session(&mut *session)
            .await?;
        self.collection
            .update_many(doc! {"next_ids": id}, doc! {"$pull": {"next_ids": id}})
            .session(session)
            .await?;
        Ok(())
    }

    /// Copy delta records from another engine instance.
    ///
    /// Forward references leaving the copied set are stripped, and the
    /// parent of each boundary record gains a link to it, so the copied
    /// branch splices cleanly into the destination's delta trees.
    pub async fn insert_replicated(
        &self,
        records: Vec<DeltaRecord>,
        session: &mut ClientSession,
    ) -> Result<()> {
        if records.is_empty() {
            return Ok(());
        }
        let copied: HashSet<ObjectId> = records.iter().map(|r| r.id).collect();
        for mut record in records {
            record.next_ids.retain(|id| copied.contains(id));
            if let Some(prev_id) = record.prev_id {
                if !copied.contains(&prev_id) {
                    self.collection
                        .update_one(
                            doc! {"_id": prev_id},
                            doc! {"$push": {"next_ids": record.id}},
                        )
                        .session(&mut *session)
                        .await?;
                }
            }
            self.collection
                .insert_one(&record)
                .session(&mut *session)
                .await?;
        }
        Ok(())
    }

    /// Remove every delta registered at the given versions.
    ///
    /// Parents outside the removed set drop their forward links first, so
    /// the surviving delta trees stay consistent.
    pub async fn delete_in_versions(
        &self,
        versions: &[VersionId],
        session: &mut ClientSession,
    ) -> Result<()> {
        if versions.is_empty() {
            return Ok(());
        }
        let records: Vec<DeltaRecord> = self
            .collection
            .find(version_filter(versions))
            .await?
            .try_collect()
            .await?;
        let removed: HashSet<ObjectId> = records.iter().map(|r| r.id).collect();

        for record in &records {
            if let Some(prev_id) = record.prev_id {
                if !removed.contains(&prev_id) {
                    self.collection
                        .update_one(
                            doc! {"_id": prev_id},
                            doc! {"$pull": {"next_ids": record.id}},
                        )
                        .session(&mut *session)
                        .await?;
                }
            }
        }

        let ids: Vec<ObjectId> = removed.into_iter().collect();
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
