//! Typed wrappers over the auxiliary tracking collections.
//!
//! For a target collection `C` the engine maintains auxiliary collections
//! named `__<role>_C` in the same database: `branches`, `deltas`, `log`,
//! `metadata`, `modified`, `replica`, `stash` (+ `stash_modified`) and
//! `conflicts`, plus the per-database `__vc_lock` collection. Each wrapper
//! exposes only the operations the engine needs; writes that are part of a
//! versioning operation go through a database transaction so the stores
//! advance together or not at all.

use mongodb::{Client, ClientSession, Database};

use crate::error::Result;

pub mod branches;
pub mod conflicts;
pub mod deltas;
pub mod lock;
pub mod log;
pub mod metadata;
pub mod modified;
pub mod replica;
pub mod stash;

pub use branches::{BranchRecord, BranchStore};
pub use conflicts::{ConflictRecord, ConflictStore};
pub use deltas::{DeltaRecord, DeltaStore};
pub use lock::{LockRecord, LockStore, LOCK_COLLECTION};
pub use log::LogStore;
pub use metadata::{MetadataRecord, MetadataStore};
pub use modified::{ModifiedRecord, ModifiedStore, TrackerOp};
pub use replica::ReplicaStore;
pub use stash::StashStore;

/// Name of the auxiliary collection with the given role for a target.
pub fn store_name(role: &str, target: &str) -> String {
    format!("__{role}_{target}")
}

/// Whether a collection name belongs to the versioning machinery.
pub fn is_tracking_name(name: &str) -> bool {
    name.starts_with("__")
}

/// The full set of tracking stores for one target collection.
pub struct Stores {
    client: Client,
    pub log: LogStore,
    pub branches: BranchStore,
    pub deltas: DeltaStore,
    pub metadata: MetadataStore,
    pub modified: ModifiedStore,
    pub replica: ReplicaStore,
    pub stash: StashStore,
    pub conflicts: ConflictStore,
}

impl Stores {
    pub fn new(client: Client, database: &Database, target: &str) -> Stores {
        Stores {
            client,
            log: LogStore::new(database, target),
            branches: BranchStore::new(database, target),
            deltas: DeltaStore::new(database, target),
            metadata: MetadataStore::new(database, target),
            modified: ModifiedStore::new(database, target),
            replica: ReplicaStore::new(database, target),
            stash: StashStore::new(database, target),
            conflicts: ConflictStore::new(database, target),
        }
    }

    /// Start a multi-store transaction.
    ///
    /// The caller commits on success and aborts on error; an aborted
    /// transaction leaves every store untouched.
    pub async fn start_transaction(&self) -> Result<ClientSession> {
        let mut session = self.client.start_session().await?;
        session.start_transaction().await?;
        Ok(session)
    }

    /// Drop every auxiliary collection, including temporary ones.
    pub async fn drop_all(&self) -> Result<()> {
        self.log.drop().await?;
        self.branches.drop().await?;
        self.deltas.drop().await?;
        self.metadata.drop().await?;
        self.modified.drop().await?;
        self.replica.drop().await?;
        self.stash.drop().await?;
        self.conflicts.drop().await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn store_names_follow_the_role_scheme() {
        assert_eq!(store_name("log", "users"), "__log_users");
        assert_eq!(store_name("stash_modified", "users"), "__stash_modified_users");
    }

    #[test]
    fn tracking_names_are_reserved() {
        assert!(is_tracking_name("__log_users"));
        assert!(is_tracking_name("__vc_lock"));
        assert!(!is_tracking_name("users"));
    }
}
