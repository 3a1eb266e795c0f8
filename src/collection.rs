//! Versioned collection engine.
//!
//! Wraps a target collection and gives it git-like semantics by keeping
//! auxiliary tracking collections in the same database. All versioning
//! operations serialize through the cross-process lock, synchronize with
//! the background change listener through a fence, and perform their
//! auxiliary writes inside one database transaction.

use std::collections::HashMap;
use std::collections::HashSet;

use bson::oid::ObjectId;
use bson::{doc, Bson, Document};
use chrono::Utc;
use futures::TryStreamExt;
use mongodb::{Client, ClientSession, Collection, Database};
use serde::Serialize;
use tracing::{debug, info};

use crate::delta::{diff_documents, Delta};
use crate::deltatree::{build_forest, join_forest, latest_on_chain};
use crate::error::{Error, Result};
use crate::listener::{self, ListenerHandle, DEFAULT_FENCE_TIMEOUT};
use crate::lock::LockManager;
use crate::store::{BranchRecord, MetadataRecord, ModifiedRecord, Stores, TrackerOp};
use crate::tree::{LogRecord, LogTree, VersionId, MAIN_BRANCH};
use crate::value::Value;

/// Upper bound on the register drain loop; trackers arriving past the
/// fence belong to concurrent writers and stay for the next register.
const MAX_REGISTER_PASSES: usize = 5;

/// Snapshot of the engine state, as reported by `status`.
#[derive(Debug, Clone, Serialize)]
pub struct Status {
    pub tracked: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub version: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub branch: Option<String>,
    pub detached: bool,
    pub changed: bool,
    pub has_stash: bool,
    pub has_conflicts: bool,
}

/// A tracked and versioned collection.
pub struct VersionedCollection {
    pub(crate) client: Client,
    pub(crate) database: Database,
    pub(crate) name: String,
    pub(crate) target: Collection<Document>,
    pub(crate) stores: Stores,
    pub(crate) lock: LockManager,
    pub(crate) listener: Option<ListenerHandle>,
    pub(crate) tracked: bool,
    pub(crate) tree: Option<LogTree>,
    /// Host component of the lock ordering key used by push/pull.
    pub(crate) origin: String,
}

impl VersionedCollection {
    /// Open a handle on a collection, starting the change listener when
    /// the collection is already tracked.
    pub async fn open(
        client: Client,
        database_name: &str,
        name: &str,
        origin: impl Into<String>,
    ) -> Result<VersionedCollection> {
        if crate::store::is_tracking_name(name) {
            return Err(Error::InvalidArgument(format!(
                "'{name}' is reserved for versioning collections"
            )));
        }
        let database = client.database(database_name);
        let stores = Stores::new(client.clone(), &database, name);
        let tracked = stores.log.exists().await?;

        let mut collection = VersionedCollection {
            target: database.collection(name),
            lock: LockManager::new(&database, name),
            client,
            database,
            name: name.to_string(),
            stores,
            listener: None,
            tracked,
            tree: None,
            origin: origin.into(),
        };
        if tracked {
            collection.lock.ensure_record().await?;
            collection.start_listener().await?;
        }
        Ok(collection)
    }

    /// Stop the listener and release resources.
    pub async fn close(mut self) {
        if let Some(handle) = self.listener.take() {
            handle.stop().await;
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn is_tracked(&self) -> bool {
        self.tracked
    }

    /// Sort key used to take push/pull locks in a fixed global order.
    pub(crate) fn lock_key(&self) -> (String, String, String) {
        (
            self.origin.clone(),
            self.database.name().to_string(),
            self.name.clone(),
        )
    }

    pub(crate) async fn start_listener(&mut self) -> Result<()> {
        if self.listener.is_none() {
            let handle = listener::start(self.database.clone(), self.name.clone()).await?;
            self.listener = Some(handle);
        }
        Ok(())
    }

    pub(crate) fn ensure_tracked(&self) -> Result<()> {
        if !self.tracked {
            return Err(Error::NotInitialized(self.name.clone()));
        }
        Ok(())
    }

    /// Wait until the listener has folded in every write that completed
    /// before this call.
    pub(crate) async fn fence(&self) -> Result<()> {
        let handle = self
            .listener
            .as_ref()
            .ok_or_else(|| Error::OperationFailed("the change listener is not running".into()))?;
        handle.fence(DEFAULT_FENCE_TIMEOUT).await
    }

    /// Acquire the versioning lock, dropping stale caches if another
    /// process advanced the epoch.
    pub(crate) async fn enter(&mut self) -> Result<()> {
        let stale = self.lock.acquire().await?;
        if stale {
            self.tree = None;
        }
        Ok(())
    }

    pub(crate) async fn ensure_tree(&mut self) -> Result<()> {
        if self.tree.is_none() {
            self.tree = Some(self.stores.log.load_tree().await?);
        }
        Ok(())
    }

    pub(crate) fn tree_ref(&self) -> &LogTree {
        self.tree.as_ref().expect("log tree loaded")
    }

    /// The engine position as stored in metadata; `n = -1` on a branch
    /// without registered versions.
    pub async fn current(&self) -> Result<VersionId> {
        self.ensure_tracked()?;
        Ok(self.stores.metadata.load().await?.current())
    }

    /// The position resolved to a registered version in the log tree.
    pub(crate) async fn concrete_position(&self) -> Result<VersionId> {
        let meta = self.stores.metadata.load().await?;
        if meta.current_n >= 0 {
            return Ok(meta.current());
        }
        self.resolve_unborn(&meta.current_branch).await
    }

    /// Follow unborn branch pointers down to a registered version.
    pub(crate) async fn resolve_unborn(&self, branch: &str) -> Result<VersionId> {
        let mut record = self.stores.branches.get(branch).await?;
        let mut hops = 0;
        while !record.has_versions() {
            record = self.stores.branches.get(&record.tip_branch).await?;
            hops += 1;
            if hops > 1024 {
                return Err(Error::CorruptState(format!(
                    "branch pointer cycle starting at '{branch}'"
                )));
            }
        }
        Ok(record.tip())
    }

    /// Initialise the collection for versioning.
    ///
    /// Returns `false` without modifying anything when the collection is
    /// already tracked.
    pub async fn init(&mut self, message: Option<&str>) -> Result<bool> {
        if self.tracked || self.stores.log.exists().await? {
            self.tracked = true;
            return Ok(false);
        }

        info!(collection = %self.name, "initialising versioning");
        let root = LogRecord {
            id: ObjectId::new(),
            n: 0,
            branch: MAIN_BRANCH.to_string(),
            timestamp: Utc::now(),
            message: message.unwrap_or("Initial collection.").to_string(),
            prev_id: None,
            next_ids: Vec::new(),
        };

        let mut session = self.stores.start_transaction().await?;
        let seeded = self.init_records(&root, &mut session).await;
        match seeded {
            Ok(()) => session.commit_transaction().await?,
            Err(err) => {
                let _ = session.abort_transaction().await;
                return Err(err);
            }
        }

        self.stores.replica.snapshot().await?;
        self.lock.ensure_record().await?;
        self.tracked = true;
        self.tree = None;
        self.start_listener().await?;
        Ok(true)
    }

    async fn init_records(&self, root: &LogRecord, session: &mut ClientSession) -> Result<()> {
        self.stores
            .metadata
            .save(&MetadataRecord::initial(), session)
            .await?;
        self.stores.log.insert(root, session).await?;
        self.stores
            .branches
            .create(
                &BranchRecord {
                    name: MAIN_BRANCH.to_string(),
                    tip_n: 0,
                    tip_branch: MAIN_BRANCH.to_string(),
                },
                session,
            )
            .await
    }

    /// Seed the tracking stores from a foreign root entry, so two engine
    /// instances share version identity. Used by the sync engine when a
    /// branch is pushed into an untracked collection.
    pub(crate) async fn init_mirror(&mut self, root: &LogRecord) -> Result<()> {
        if self.tracked {
            return Err(Error::AlreadyInitialized(self.name.clone()));
        }
        let mut session = self.stores.start_transaction().await?;
        let seeded = self.init_records(root, &mut session).await;
        match seeded {
            Ok(()) => session.commit_transaction().await?,
            Err(err) => {
                let _ = session.abort_transaction().await;
                return Err(err);
            }
        }
        self.stores.replica.snapshot().await?;
        self.lock.ensure_record().await?;
        self.tracked = true;
        self.tree = None;
        self.start_listener().await?;
        Ok(())
    }

    /// Report the engine status.
    pub async fn status(&self) -> Result<Status> {
        if !self.tracked {
            return Ok(Status {
                tracked: false,
                version: None,
                branch: None,
                detached: false,
                changed: false,
                has_stash: false,
                has_conflicts: false,
            });
        }
        let meta = self.stores.metadata.load().await?;
        Ok(Status {
            tracked: true,
            version: Some(meta.current_n),
            branch: Some(meta.current_branch.clone()),
            detached: meta.detached,
            changed: meta.changed,
            has_stash: meta.has_stash,
            has_conflicts: meta.has_conflicts,
        })
    }

    /// Whether unregistered changes exist, according to the metadata hint.
    pub async fn has_changes(&self) -> Result<bool> {
        if !self.tracked {
            return Ok(false);
        }
        Ok(self.stores.metadata.load().await?.changed)
    }

    pub async fn has_conflicts(&self) -> Result<bool> {
        if !self.tracked {
            return Ok(false);
        }
        Ok(self.stores.metadata.load().await?.has_conflicts)
    }

    pub async fn has_stash(&self) -> Result<bool> {
        if !self.tracked {
            return Ok(false);
        }
        Ok(self.stores.metadata.load().await?.has_stash)
    }

    /// Names of all branches, including ones without registered versions.
    pub async fn branches(&self) -> Result<Vec<String>> {
        self.ensure_tracked()?;
        self.stores.branches.names().await
    }

    /// The version history of a branch, newest entry first.
    pub async fn log(&mut self, branch: Option<&str>) -> Result<Vec<LogRecord>> {
        self.ensure_tracked()?;
        let meta = self.stores.metadata.load().await?;
        let branch = branch.unwrap_or(&meta.current_branch).to_string();
        let tip = self.resolve_unborn(&branch).await?;

        self.ensure_tree().await?;
        let tree = self.tree_ref();
        let mut entries = vec![tree.record(&tip)?.clone()];
        for ancestor in tree.ancestors(&tip)? {
            entries.push(tree.record(&ancestor)?.clone());
        }
        Ok(entries)
    }

    /// Create a branch at the current position and move onto it.
    ///
    /// Returns the version the new branch points to.
    pub async fn create_branch(&mut self, name: &str) -> Result<VersionId> {
        self.ensure_tracked()?;
        validate_branch_name(name)?;
        self.enter().await?;
        let result = self.create_branch_locked(name).await;
        self.lock.release(result.is_ok()).await?;
        result
    }

    async fn create_branch_locked(&mut self, name: &str) -> Result<VersionId> {
        if self.stores.branches.exists(name).await? {
            return Err(Error::BranchExists(name.to_string()));
        }
        let base = self.concrete_position().await?;
        let mut meta = self.stores.metadata.load().await?;
        meta.current_n = -1;
        meta.current_branch = name.to_string();
        meta.detached = false;

        let mut session = self.stores.start_transaction().await?;
        let outcome = async {
            self.stores
                .branches
                .create(
                    &BranchRecord {
                        name: name.to_string(),
                        tip_n: base.n,
                        tip_branch: base.branch.clone(),
                    },
                    &mut session,
                )
                .await?;
            self.stores.metadata.save(&meta, &mut session).await
        }
        .await;
        match outcome {
            Ok(()) => session.commit_transaction().await?,
            Err(err) => {
                let _ = session.abort_transaction().await;
                return Err(err);
            }
        }
        info!(branch = name, at = %base, "created branch");
        Ok(base)
    }

    /// Register the working state of the collection as a new version.
    ///
    /// Returns the new version, or `None` when there was nothing to
    /// register. In detached mode with pending changes a branch name is
    /// required and the new version starts that branch; without pending
    /// changes register is a no-op and no branch is created.
    pub async fn register(
        &mut self,
        message: &str,
        branch_name: Option<&str>,
    ) -> Result<Option<VersionId>> {
        self.ensure_tracked()?;
        self.enter().await?;
        // Tracked separately from the result: a branch created for a
        // detached register is committed state even when a later step
        // fails.
        let mut mutated = false;
        let result = self
            .register_locked(message, branch_name, &mut mutated)
            .await;
        self.lock.release(mutated).await?;
        result
    }

    async fn register_locked(
        &mut self,
        message: &str,
        branch_name: Option<&str>,
        mutated: &mut bool,
    ) -> Result<Option<VersionId>> {
        let conflicts = self.stores.conflicts.count().await?;
        if conflicts > 0 {
            return Err(Error::UnresolvedConflicts(conflicts as usize));
        }

        self.fence().await?;

        if self.stores.modified.is_empty().await? {
            // Nothing changed; registering again after a success is a
            // no-op rather than an error, detached or not, and no branch
            // is created for an empty version.
            self.stores.metadata.set_changed(false).await?;
            return Ok(None);
        }

        let mut meta = self.stores.metadata.load().await?;
        if meta.detached {
            let name = branch_name.ok_or(Error::DetachedWithoutBranch)?;
            self.create_branch(name).await?;
            *mutated = true;
            meta = self.stores.metadata.load().await?;
        }

        self.ensure_tree().await?;
        let prev = self.concrete_position().await?;
        let new_version = if meta.current_n < 0 {
            VersionId::new(0, &meta.current_branch)
        } else {
            VersionId::new(meta.current_n + 1, &meta.current_branch)
        };

        // Chain from the new version towards the root, for locating each
        // document's previous delta.
        let mut chain = vec![prev.clone()];
        chain.extend(self.tree_ref().ancestors(&prev)?);

        let now = Utc::now();
        let prev_log_id = self.tree_ref().record(&prev)?.id;
        let log_record = LogRecord {
            id: ObjectId::new(),
            n: new_version.n,
            branch: new_version.branch.clone(),
            timestamp: now,
            message: message.to_string(),
            prev_id: Some(prev_log_id),
            next_ids: Vec::new(),
        };

        let mut session = self.stores.start_transaction().await?;
        let outcome = self
            .register_deltas(&chain, &new_version, now, &mut session)
            .await;
        let final_states = match outcome {
            Ok(states) => states,
            Err(err) => {
                let _ = session.abort_transaction().await;
                return Err(err);
            }
        };

        if final_states.is_empty() {
            // Every tracker was a no-op round trip; just clear them.
            meta.changed = false;
            let cleared = self.stores.metadata.save(&meta, &mut session).await;
            match cleared {
                Ok(()) => session.commit_transaction().await?,
                Err(err) => {
                    let _ = session.abort_transaction().await;
                    return Err(err);
                }
            }
            *mutated = true;
            return Ok(None);
        }

        meta.current_n = new_version.n;
        meta.current_branch = new_version.branch.clone();
        meta.detached = false;
        meta.changed = false;

        let outcome = async {
            for (id, state) in &final_states {
                self.stores
                    .replica
                    .apply(&id.to_bson(), state.as_ref(), &mut session)
                    .await?;
            }
            self.stores.log.insert(&log_record, &mut session).await?;
            self.stores
                .branches
                .update_tip(&new_version.branch, &new_version, &mut session)
                .await?;
            self.stores.metadata.save(&meta, &mut session).await
        }
        .await;
        match outcome {
            Ok(()) => session.commit_transaction().await?,
            Err(err) => {
                let _ = session.abort_transaction().await;
                return Err(err);
            }
        }
        *mutated = true;

        if let Some(tree) = self.tree.as_mut() {
            tree.add_entry(log_record)?;
        }
        info!(version = %new_version, "registered new version");
        Ok(Some(new_version))
    }

    /// Turn modification trackers into delta records.
    ///
    /// Drains the modified store in passes so trackers written while the
    /// deltas were being computed are still captured in this version.
    /// Returns the final states of the documents that really changed.
    async fn register_deltas(
        &self,
        chain: &[VersionId],
        version: &VersionId,
        now: chrono::DateTime<Utc>,
        session: &mut ClientSession,
    ) -> Result<HashMap<Value, Option<Document>>> {
        let mut final_states: HashMap<Value, Option<Document>> = HashMap::new();
        let mut delta_ids: HashMap<Value, ObjectId> = HashMap::new();
        let mut processed: HashSet<ObjectId> = HashSet::new();

        for pass in 0..MAX_REGISTER_PASSES {
            let trackers: Vec<ModifiedRecord> = self
                .stores
                .modified
                .all()
                .await?
                .into_iter()
                .filter(|t| !processed.contains(&t.id))
                .collect();
            if trackers.is_empty() {
                break;
            }
            debug!(pass, count = trackers.len(), "draining modification trackers");

            // Coalesce by document; the listener already keeps one
            // tracker per document, this guards against duplicates.
            let mut by_document: HashMap<Value, Vec<ObjectId>> = HashMap::new();
            let mut raw_ids: HashMap<Value, Bson> = HashMap::new();
            for tracker in trackers {
                processed.insert(tracker.id);
                let key = Value::from_bson(&tracker.document_id);
                raw_ids.entry(key.clone()).or_insert(tracker.document_id);
                by_document.entry(key).or_default().push(tracker.id);
            }

            for (key, tracker_ids) in by_document {
                let raw_id = &raw_ids[&key];
                let old = self
                    .stores
                    .replica
                    .find_one(raw_id)
                    .await?
                    .map(|d| Value::from_document(&d))
                    .unwrap_or_else(Value::empty);
                let new_doc = self.target.find_one(doc! {"_id": raw_id}).await?;
                let new = new_doc
                    .as_ref()
                    .map(Value::from_document)
                    .unwrap_or_else(Value::empty);

                let forward = crate::delta::diff(&old, &new);
                if forward.is_empty() {
                    // Modified and then restored; nothing to record.
                    self.stores.modified.delete(&tracker_ids, session).await?;
                    continue;
                }

                match delta_ids.get(&key) {
                    Some(&existing) => {
                        // The document changed again mid-register; the
                        // delta for this version absorbs the newer state.
                        self.stores
                            .deltas
                            .update_payload(existing, &forward, session)
                            .await?;
                    }
                    None => {
                        let history = self.stores.deltas.for_document(raw_id).await?;
                        let prev_delta = latest_on_chain(&history, chain);
                        let record = crate::store::DeltaRecord::encode(
                            raw_id.clone(),
                            version,
                            now,
                            &forward,
                            prev_delta.map(|d| d.id),
                        )?;
                        self.stores.deltas.insert(&record, session).await?;
                        delta_ids.insert(key.clone(), record.id);
                    }
                }
                final_states.insert(key, new_doc);
                self.stores.modified.delete(&tracker_ids, session).await?;
            }
        }
        Ok(final_states)
    }

    /// Check out a registered version.
    ///
    /// At least one of `n` and `branch` must be given; a bare branch
    /// checks out that branch's tip.
    pub async fn checkout(&mut self, n: Option<i64>, branch: Option<&str>) -> Result<VersionId> {
        if n.is_none() && branch.is_none() {
            return Err(Error::InvalidArgument(
                "checkout needs a version, a branch, or both".into(),
            ));
        }
        self.ensure_tracked()?;
        self.enter().await?;
        let mut mutated = false;
        let result = self.checkout_locked(n, branch, &mut mutated).await;
        self.lock.release(mutated).await?;
        result
    }

    async fn checkout_locked(
        &mut self,
        n: Option<i64>,
        branch: Option<&str>,
        mutated: &mut bool,
    ) -> Result<VersionId> {
        self.fence().await?;
        if !self.stores.modified.is_empty().await? {
            return Err(Error::UncommittedChanges);
        }

        let meta = self.stores.metadata.load().await?;
        let branch = branch.unwrap_or(&meta.current_branch).to_string();
        let branch_record = self.stores.branches.get(&branch).await?;

        // Destination as displayed to the user, and as a registered
        // version in the log tree.
        let (dest_version, concrete) = match n {
            Some(n) => {
                if !branch_record.has_versions() {
                    return Err(Error::InvalidVersion(VersionId::new(n, &branch)));
                }
                let v = VersionId::new(n, &branch);
                (v.clone(), v)
            }
            None => {
                if branch_record.has_versions() {
                    (branch_record.tip(), branch_record.tip())
                } else {
                    (
                        VersionId::new(-1, &branch),
                        self.resolve_unborn(&branch).await?,
                    )
                }
            }
        };

        self.ensure_tree().await?;
        if !self.tree_ref().contains(&concrete) {
            return Err(Error::InvalidVersion(concrete));
        }

        let current = self.concrete_position().await?;
        let detached = if dest_version.is_unborn() {
            false
        } else {
            dest_version != branch_record.tip()
        };

        let mut new_meta = meta.clone();
        new_meta.current_n = dest_version.n;
        new_meta.current_branch = dest_version.branch.clone();
        new_meta.detached = detached;
        new_meta.changed = false;

        if current == concrete {
            // Already positioned here; only the head pointer moves.
            let mut session = self.stores.start_transaction().await?;
            let saved = self.stores.metadata.save(&new_meta, &mut session).await;
            match saved {
                Ok(()) => session.commit_transaction().await?,
                Err(err) => {
                    let _ = session.abort_transaction().await;
                    return Err(err);
                }
            }
            *mutated = true;
            return Ok(dest_version);
        }

        let path = self.tree_ref().path(&current, &concrete)?;
        let versions: Vec<VersionId> = path.iter().map(|(v, _)| v.clone()).collect();
        let per_document = self.stores.deltas.in_versions(&versions).await?;

        let mut session = self.stores.start_transaction().await?;
        let outcome = async {
            for (key, records) in per_document {
                let raw_id = records
                    .first()
                    .map(|r| r.document_id.clone())
                    .expect("group has at least one record");
                let joined = join_forest(build_forest(records), self.tree_ref())?;
                let composed = joined.compose_along(&path)?;
                if composed.is_empty() {
                    continue;
                }

                let current_doc = self.target.find_one(doc! {"_id": &raw_id}).await?;
                let current_state = current_doc
                    .as_ref()
                    .map(Value::from_document)
                    .unwrap_or_else(Value::empty);
                let next_state = composed.apply(&current_state).map_err(|err| {
                    Error::CorruptState(format!(
                        "delta composition diverged for document {key}: {err}"
                    ))
                })?;

                let next_doc = if next_state.is_empty_map() {
                    None
                } else {
                    Some(next_state.to_document())
                };
                self.write_target(&raw_id, next_doc.as_ref(), &mut session)
                    .await?;
                self.stores
                    .replica
                    .apply(&raw_id, next_doc.as_ref(), &mut session)
                    .await?;
            }
            self.stores.metadata.save(&new_meta, &mut session).await
        }
        .await;
        match outcome {
            Ok(()) => session.commit_transaction().await?,
            Err(err) => {
                let _ = session.abort_transaction().await;
                return Err(err);
            }
        }
        *mutated = true;

        self.absorb_own_writes().await?;
        info!(version = %dest_version, "checked out");
        Ok(dest_version)
    }

    /// Write one document state to the target collection.
    pub(crate) async fn write_target(
        &self,
        id: &Bson,
        state: Option<&Document>,
        session: &mut ClientSession,
    ) -> Result<()> {
        match state {
            Some(document) => {
                self.target
                    .replace_one(doc! {"_id": id}, document)
                    .upsert(true)
                    .session(session)
                    .await?;
            }
            None => {
                self.target
                    .delete_one(doc! {"_id": id})
                    .session(session)
                    .await?;
            }
        }
        Ok(())
    }

    /// Clear the trackers produced by the engine's own writes to the
    /// target collection (checkout rollbacks, stash restores).
    pub(crate) async fn absorb_own_writes(&mut self) -> Result<()> {
        self.fence().await?;
        self.stores.modified.purge().await?;
        self.stores.metadata.set_changed(false).await?;
        Ok(())
    }

    /// Compute per-document forward deltas.
    ///
    /// Without a target version: registered state vs the working
    /// collection. With one: registered state at the target vs the
    /// registered state here, with unregistered working changes layered
    /// on top when they exist.
    pub async fn diff(&mut self, other: Option<VersionId>) -> Result<HashMap<Value, Delta>> {
        self.ensure_tracked()?;
        self.fence().await?;

        let trackers = self.stores.modified.all().await?;
        let mut working: HashMap<Value, Delta> = HashMap::new();
        for tracker in &trackers {
            let key = Value::from_bson(&tracker.document_id);
            let old = self
                .stores
                .replica
                .find_one(&tracker.document_id)
                .await?
                .unwrap_or_default();
            let new = self
                .target
                .find_one(doc! {"_id": &tracker.document_id})
                .await?
                .unwrap_or_default();
            let delta = diff_documents(&old, &new);
            if !delta.is_empty() {
                working.insert(key, delta);
            }
        }

        let Some(other) = other else {
            return Ok(working);
        };

        self.ensure_tree().await?;
        if !self.tree_ref().contains(&other) {
            return Err(Error::InvalidVersion(other));
        }
        let current = self.concrete_position().await?;
        let path = self.tree_ref().path(&other, &current)?;
        let versions: Vec<VersionId> = path.iter().map(|(v, _)| v.clone()).collect();

        let mut diffs: HashMap<Value, Delta> = HashMap::new();
        for (key, records) in self.stores.deltas.in_versions(&versions).await? {
            let joined = join_forest(build_forest(records), self.tree_ref())?;
            let composed = joined.compose_along(&path)?;
            if !composed.is_empty() {
                diffs.insert(key, composed);
            }
        }

        // Unregistered changes continue the path past the current
        // registered state.
        for (key, delta) in working {
            let merged = match diffs.remove(&key) {
                Some(registered) => crate::delta::compose(&registered, &delta)?,
                None => delta,
            };
            if !merged.is_empty() {
                diffs.insert(key, merged);
            }
        }
        Ok(diffs)
    }

    /// Move the working changes into the stash and restore the
    /// registered state.
    pub async fn stash(&mut self, overwrite: bool) -> Result<bool> {
        self.ensure_tracked()?;
        self.enter().await?;
        let mut mutated = false;
        let result = self.stash_locked(overwrite, &mut mutated).await;
        self.lock.release(mutated).await?;
        result
    }

    async fn stash_locked(&mut self, overwrite: bool, mutated: &mut bool) -> Result<bool> {
        self.fence().await?;
        let trackers = self.stores.modified.all().await?;
        if trackers.is_empty() {
            return Ok(false);
        }
        if self.stores.stash.exists().await? {
            if !overwrite {
                return Err(Error::InvalidArgument(
                    "changes already stashed; pass --overwrite to replace the stash".into(),
                ));
            }
            self.stores.stash.drop().await?;
            *mutated = true;
        }

        let ids: Vec<Bson> = trackers.iter().map(|t| t.document_id.clone()).collect();
        let documents: Vec<Document> = self
            .target
            .find(doc! {"_id": {"$in": ids.as_slice()}})
            .await?
            .try_collect()
            .await?;

        let mut meta = self.stores.metadata.load().await?;
        meta.has_stash = true;
        meta.changed = false;

        let mut session = self.stores.start_transaction().await?;
        let outcome = async {
            self.stores
                .stash
                .store(&documents, &trackers, &mut session)
                .await?;
            self.restore_registered_state(&trackers, &mut session).await?;
            self.stores.modified.clear(&mut session).await?;
            self.stores.metadata.save(&meta, &mut session).await
        }
        .await;
        match outcome {
            Ok(()) => session.commit_transaction().await?,
            Err(err) => {
                let _ = session.abort_transaction().await;
                return Err(err);
            }
        }
        *mutated = true;
        self.absorb_own_writes().await?;
        info!(documents = documents.len(), "stashed working changes");
        Ok(true)
    }

    /// Overwrite the working collection with the stashed documents and
    /// restore their trackers.
    pub async fn stash_apply(&mut self) -> Result<bool> {
        self.ensure_tracked()?;
        self.enter().await?;
        let mut mutated = false;
        let result = self.stash_apply_locked(&mut mutated).await;
        self.lock.release(mutated).await?;
        result
    }

    async fn stash_apply_locked(&mut self, mutated: &mut bool) -> Result<bool> {
        if !self.stores.stash.exists().await? {
            return Ok(false);
        }
        self.fence().await?;
        if !self.stores.modified.is_empty().await? {
            return Err(Error::UncommittedChanges);
        }

        let documents = self.stores.stash.documents().await?;
        let mut trackers = self.stores.stash.trackers().await?;
        let stashed_ids = self.stores.stash.document_ids().await?;

        // A document stashed as an insert may exist again at the version
        // the stash lands on; its tracker becomes an update.
        let existing: Vec<Document> = self
            .target
            .find(doc! {"_id": {"$in": stashed_ids.as_slice()}})
            .await?
            .try_collect()
            .await?;
        let existing_ids: HashSet<Value> = existing
            .iter()
            .filter_map(|d| d.get("_id"))
            .map(Value::from_bson)
            .collect();
        for tracker in &mut trackers {
            if tracker.op == TrackerOp::Insert
                && existing_ids.contains(&Value::from_bson(&tracker.document_id))
            {
                tracker.op = TrackerOp::Update;
            }
        }

        let mut session = self.stores.start_transaction().await?;
        let outcome = async {
            for id in &stashed_ids {
                self.write_target(id, None, &mut session).await?;
            }
            for document in &documents {
                let id = document.get("_id").cloned().ok_or_else(|| {
                    Error::CorruptState("stashed document without an _id".into())
                })?;
                self.write_target(&id, Some(document), &mut session).await?;
            }
            Ok(())
        }
        .await;
        match outcome {
            Ok(()) => session.commit_transaction().await?,
            Err(err) => {
                let _ = session.abort_transaction().await;
                return Err(err);
            }
        }
        *mutated = true;

        // The writes above belong to the stash, not to the listener's
        // view of user activity; replace the trackers wholesale.
        self.absorb_own_writes().await?;
        let mut meta = self.stores.metadata.load().await?;
        meta.has_stash = false;
        meta.changed = true;
        let mut session = self.stores.start_transaction().await?;
        let outcome = async {
            self.stores.modified.replace_all(&trackers, &mut session).await?;
            self.stores.metadata.save(&meta, &mut session).await
        }
        .await;
        match outcome {
            Ok(()) => session.commit_transaction().await?,
            Err(err) => {
                let _ = session.abort_transaction().await;
                return Err(err);
            }
        }
        self.stores.stash.drop().await?;
        Ok(true)
    }

    /// Drop the stash without applying it.
    pub async fn stash_discard(&mut self) -> Result<bool> {
        self.ensure_tracked()?;
        self.enter().await?;
        let mut mutated = false;
        let result = self.stash_discard_locked(&mut mutated).await;
        self.lock.release(mutated).await?;
        result
    }

    async fn stash_discard_locked(&mut self, mutated: &mut bool) -> Result<bool> {
        if !self.stores.stash.exists().await? {
            return Ok(false);
        }
        self.stores.stash.drop().await?;
        *mutated = true;
        let mut meta = self.stores.metadata.load().await?;
        meta.has_stash = false;
        let mut session = self.stores.start_transaction().await?;
        let saved = self.stores.metadata.save(&meta, &mut session).await;
        match saved {
            Ok(()) => session.commit_transaction().await?,
            Err(err) => {
                let _ = session.abort_transaction().await;
                return Err(err);
            }
        }
        Ok(true)
    }

    /// Throw away the working changes and restore the registered state.
    pub async fn discard_changes(&mut self) -> Result<bool> {
        self.ensure_tracked()?;
        self.enter().await?;
        let mut mutated = false;
        let result = self.discard_changes_locked(&mut mutated).await;
        self.lock.release(mutated).await?;
        result
    }

    async fn discard_changes_locked(&mut self, mutated: &mut bool) -> Result<bool> {
        self.fence().await?;
        let trackers = self.stores.modified.all().await?;
        if trackers.is_empty() {
            self.stores.metadata.set_changed(false).await?;
            return Ok(false);
        }

        let mut meta = self.stores.metadata.load().await?;
        meta.changed = false;
        let mut session = self.stores.start_transaction().await?;
        let outcome = async {
            self.restore_registered_state(&trackers, &mut session).await?;
            self.stores.modified.clear(&mut session).await?;
            self.stores.metadata.save(&meta, &mut session).await
        }
        .await;
        match outcome {
            Ok(()) => session.commit_transaction().await?,
            Err(err) => {
                let _ = session.abort_transaction().await;
                return Err(err);
            }
        }
        *mutated = true;
        self.absorb_own_writes().await?;
        Ok(true)
    }

    /// Put every tracked document back into its replica state.
    async fn restore_registered_state(
        &self,
        trackers: &[ModifiedRecord],
        session: &mut ClientSession,
    ) -> Result<()> {
        for tracker in trackers {
            let registered = self.stores.replica.find_one(&tracker.document_id).await?;
            self.write_target(&tracker.document_id, registered.as_ref(), session)
                .await?;
        }
        Ok(())
    }

    /// Delete a version and every version registered after it.
    pub async fn delete_version_subtree(&mut self, n: i64, branch: Option<&str>) -> Result<()> {
        self.ensure_tracked()?;
        self.enter().await?;
        let mut mutated = false;
        let result = self.delete_subtree_locked(n, branch, &mut mutated).await;
        self.lock.release(mutated).await?;
        result
    }

    async fn delete_subtree_locked(
        &mut self,
        n: i64,
        branch: Option<&str>,
        mutated: &mut bool,
    ) -> Result<()> {
        let meta = self.stores.metadata.load().await?;
        let branch = branch.unwrap_or(&meta.current_branch).to_string();
        let version = VersionId::new(n, &branch);

        self.ensure_tree().await?;
        if !self.tree_ref().contains(&version) {
            return Err(Error::InvalidVersion(version));
        }
        let parent = self
            .tree_ref()
            .parent(&version)?
            .map(|record| record.version())
            .ok_or_else(|| Error::InvalidArgument("cannot delete the root version".into()))?;

        let mut removed: HashSet<VersionId> = HashSet::new();
        removed.insert(version.clone());
        removed.extend(self.tree_ref().descendants(&version)?);

        // Step off the doomed subtree first.
        let current = self.concrete_position().await?;
        if removed.contains(&current) {
            self.discard_changes().await?;
            self.checkout(Some(parent.n), Some(&parent.branch)).await?;
            *mutated = true;
        }

        // Branch records whose tip disappears go with the subtree; the
        // rooted branch survives with its tip pulled back when the cut is
        // mid-branch.
        let mut doomed_branches: HashSet<String> =
            removed.iter().map(|v| v.branch.clone()).collect();
        let trim_rooted_branch = parent.branch == branch;
        if trim_rooted_branch {
            doomed_branches.remove(&branch);
        }
        let mut branch_names: Vec<String> = doomed_branches.into_iter().collect();
        for name in self.stores.branches.names().await? {
            let record = self.stores.branches.get(&name).await?;
            if !record.has_versions() && removed.contains(&record.tip()) {
                branch_names.push(record.name);
            }
        }
        branch_names.sort();
        branch_names.dedup();

        let removed_versions: Vec<VersionId> = removed.iter().cloned().collect();
        let detached_root_id = self.tree_ref().record(&version)?.id;
        let parent_id = self.tree_ref().record(&parent)?.id;
        let removed_ids: Vec<ObjectId> = removed_versions
            .iter()
            .map(|v| self.tree_ref().record(v).map(|r| r.id))
            .collect::<Result<_>>()?;

        let mut session = self.stores.start_transaction().await?;
        let outcome = async {
            self.stores
                .log
                .remove(&removed_ids, detached_root_id, parent_id, &mut session)
                .await?;
            self.stores
                .deltas
                .delete_in_versions(&removed_versions, &mut session)
                .await?;
            self.stores
                .branches
                .delete_many(&branch_names, &mut session)
                .await?;
            if trim_rooted_branch {
                self.stores
                    .branches
                    .update_tip(&branch, &VersionId::new(n - 1, &branch), &mut session)
                    .await?;
            }

            // The head may have just become the tip of its branch.
            let mut meta = self.stores.metadata.load().await?;
            if meta.detached {
                let record = self.stores.branches.get(&meta.current_branch).await?;
                let tip_after = if trim_rooted_branch && record.name == branch {
                    VersionId::new(n - 1, &branch)
                } else {
                    record.tip()
                };
                if meta.current() == tip_after {
                    meta.detached = false;
                    self.stores.metadata.save(&meta, &mut session).await?;
                }
            }
            Ok(())
        }
        .await;
        match outcome {
            Ok(()) => session.commit_transaction().await?,
            Err(err) => {
                let _ = session.abort_transaction().await;
                return Err(err);
            }
        }
        *mutated = true;

        if let Some(tree) = self.tree.as_mut() {
            tree.remove_subtree(&version)?;
        }
        info!(version = %version, removed = removed_versions.len(), "deleted version subtree");
        Ok(())
    }

    /// Drop the collection together with all its tracking state.
    pub async fn drop_collection(mut self) -> Result<()> {
        if self.tracked {
            if let Some(handle) = self.listener.take() {
                handle.stop().await;
            }
            self.stores.drop_all().await?;
            self.lock.remove_record().await?;
        }
        self.target.drop().await?;
        Ok(())
    }
}

fn validate_branch_name(name: &str) -> Result<()> {
    if name.is_empty() {
        return Err(Error::InvalidArgument("branch names cannot be empty".into()));
    }
    if name.starts_with("__") {
        return Err(Error::InvalidArgument(
            "branch names cannot start with '__'".into(),
        ));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn branch_names_are_validated() {
        assert!(validate_branch_name("feature").is_ok());
        assert!(validate_branch_name("").is_err());
        assert!(validate_branch_name("__rebranched_main_0").is_err());
    }
}
