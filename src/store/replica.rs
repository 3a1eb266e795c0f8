//! Replica store: an exact snapshot of the target collection at the last
//! registered or checked-out version.
//!
//! At rest, when the changed hint is clear, the replica equals the target
//! collection element-wise. Register diffs the target against it;
//! checkout and register update it incrementally inside the operation's
//! transaction so the invariant survives crashes.

use bson::{doc, Bson, Document};
use mongodb::{ClientSession, Collection, Database};

use crate::error::Result;

use super::store_name;

pub struct ReplicaStore {
    collection: Collection<Document>,
    database: Database,
    target: String,
}

impl ReplicaStore {
    pub fn new(database: &Database, target: &str) -> ReplicaStore {
        ReplicaStore {
            collection: database.collection(&store_name("replica", target)),
            database: database.clone(),
            target: target.to_string(),
        }
    }

    /// Snapshot the full target collection into the replica.
    ///
    /// Used at initialisation only; `$out` replaces the replica atomically
    /// but cannot run inside a transaction.
    pub async fn snapshot(&self) -> Result<()> {
        let pipeline = vec![
            doc! {"$match": {}},
            doc! {"$out": self.collection.name()},
        ];
        self.database
            .collection::<Document>(&self.target)
            .aggregate(pipeline)
            .await?;
        Ok(())
    }

    pub async fn find_one(&self, id: &Bson) -> Result<Option<Document>> {
        Ok(self.collection.find_one(doc! {"_id": id}).await?)
    }

    /// Mirror one document write into the replica.
    ///
    /// `None` removes the document, `Some` upserts the new state.
    pub async fn apply(
        &self,
        id: &Bson,
        state: Option<&Document>,
        session: &mut ClientSession,
    ) -> Result<()> {
        match state {
            Some(doc) => {
                self.collection
                    .replace_one(doc! {"_id": id}, doc)
                    .upsert(true)
                    .session(session)
                    .await?;
            }
            None => {
                self.collection
                    .delete_one(doc! {"_id": id})
                    .session(session)
                    .await?;
            }
        }
        Ok(())
    }

    pub async fn drop(&self) -> Result<()> {
        self.collection.drop().await?;
        Ok(())
    }
}
