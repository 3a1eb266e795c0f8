//! Synchronisation between two engine instances.
//!
//! Push replicates the missing suffix of a branch into another tracked
//! collection; the copy is verbatim, so version and delta identity is
//! shared across instances. Pull fast-forwards when the local branch has
//! not moved, and otherwise stages the remote commits on a synthetic
//! rebranch and three-way merges them against the local branch, recording
//! a conflict per document the merge cannot decide.

use std::collections::{HashMap, HashSet};

use bson::oid::ObjectId;
use bson::{doc, Document};
use futures::TryStreamExt;
use tracing::info;

use crate::collection::VersionedCollection;
use crate::delta::{three_way_merge, Delta};
use crate::deltatree::{build_forest, join_forest};
use crate::error::{Error, Result};
use crate::resolver::Resolver;
use crate::store::{BranchRecord, ConflictRecord};
use crate::tree::{Direction, VersionId, MAIN_BRANCH};
use crate::value::Value;

/// Prefix of the synthetic branches pull uses to stage remote commits.
pub const REBRANCH_PREFIX: &str = "__rebranched_";

impl VersionedCollection {
    /// Push a branch into another tracked collection.
    ///
    /// Returns the number of versions replicated. Refused with
    /// [`Error::NonFastForward`] when the remote tip is not an ancestor
    /// of the local tip.
    pub async fn push(
        &mut self,
        remote: &mut VersionedCollection,
        branch: Option<&str>,
    ) -> Result<u64> {
        self.ensure_tracked()?;
        check_pairing(self, remote)?;

        lock_pair(self, remote).await?;
        // Epoch bumps follow committed writes, not the transferred-version
        // count: pushing an empty branch replicates nothing but still
        // creates a branch record on the remote.
        let mut src_mutated = false;
        let mut dst_mutated = false;
        let result = self
            .push_locked(remote, branch, &mut src_mutated, &mut dst_mutated)
            .await;
        let _ = self.lock.release(src_mutated).await;
        let _ = remote.lock.release(dst_mutated).await;
        result
    }

    pub(crate) async fn push_locked(
        &mut self,
        remote: &mut VersionedCollection,
        branch: Option<&str>,
        src_mutated: &mut bool,
        dst_mutated: &mut bool,
    ) -> Result<u64> {
        let meta = self.stores.metadata.load().await?;
        if meta.has_conflicts {
            let count = self.stores.conflicts.count().await?;
            return Err(Error::UnresolvedConflicts(count as usize));
        }
        if meta.changed {
            return Err(Error::UncommittedChanges);
        }
        let branch = match branch {
            Some(name) => name.to_string(),
            None if meta.detached => return Err(Error::DetachedWithoutBranch),
            None => meta.current_branch.clone(),
        };
        if !self.stores.branches.exists(&branch).await? {
            return Err(Error::UnknownBranch(branch));
        }

        if !remote.is_tracked() {
            // Seeding initialises the remote and moves this collection
            // through its root version and back.
            *src_mutated = true;
            *dst_mutated = true;
            self.seed_remote(remote).await?;
        }

        self.ensure_tree().await?;
        remote.ensure_tree().await?;
        if self.tree_ref().root().id != remote.tree_ref().root().id {
            return Err(Error::CorruptState(
                "the collections have independent version histories".into(),
            ));
        }

        let local_record = self.stores.branches.get(&branch).await?;
        if !local_record.has_versions() {
            return self
                .push_unborn_branch(remote, &local_record, dst_mutated)
                .await;
        }
        let local_tip = local_record.tip();

        let start = match remote.stores.branches.exists(&branch).await? {
            true => {
                let remote_record = remote.stores.branches.get(&branch).await?;
                let remote_tip = if remote_record.has_versions() {
                    remote_record.tip()
                } else {
                    remote.resolve_unborn(&branch).await?
                };
                self.require_fast_forward(remote, &remote_tip, &local_tip, &branch)?;
                if remote_tip == local_tip {
                    return Ok(0);
                }
                remote_tip
            }
            false => {
                // The fork point must already exist on the remote.
                let first = VersionId::new(0, &branch);
                let fork = self
                    .tree_ref()
                    .parent(&first)?
                    .map(|r| r.version())
                    .ok_or_else(|| Error::CorruptState("branch without a fork point".into()))?;
                if !version_shared(self, remote, &fork)? {
                    return Err(Error::OperationFailed(format!(
                        "cannot push '{branch}': its parent branch is not pushed up to {fork}"
                    )));
                }
                let mut session = remote.stores.start_transaction().await?;
                let created = remote
                    .stores
                    .branches
                    .create(
                        &BranchRecord {
                            name: branch.clone(),
                            tip_n: fork.n,
                            tip_branch: fork.branch.clone(),
                        },
                        &mut session,
                    )
                    .await;
                match created {
                    Ok(()) => session.commit_transaction().await?,
                    Err(err) => {
                        let _ = session.abort_transaction().await;
                        return Err(err);
                    }
                }
                *dst_mutated = true;
                fork
            }
        };

        let mut session = remote.stores.start_transaction().await?;
        let outcome = async {
            let copied = replicate_chain(self, remote, &start, &local_tip, &mut session).await?;
            remote
                .stores
                .branches
                .update_tip(&branch, &local_tip, &mut session)
                .await?;
            Ok(copied)
        }
        .await;
        let copied = match outcome {
            Ok(copied) => {
                session.commit_transaction().await?;
                copied
            }
            Err(err) => {
                let _ = session.abort_transaction().await;
                return Err(err);
            }
        };
        *dst_mutated = true;
        remote.tree = None;

        // Keep the remote working collection on the tip it was tracking.
        let remote_meta = remote.stores.metadata.load().await?;
        if remote_meta.current_branch == branch && !remote_meta.detached {
            remote.checkout(None, Some(&branch)).await?;
        }
        info!(branch = %branch, copied, "pushed branch");
        Ok(copied)
    }

    async fn push_unborn_branch(
        &mut self,
        remote: &mut VersionedCollection,
        record: &BranchRecord,
        dst_mutated: &mut bool,
    ) -> Result<u64> {
        let base = self.resolve_unborn(&record.name).await?;
        if remote.stores.branches.exists(&record.name).await? {
            return Ok(0);
        }
        if !version_shared(self, remote, &base)? {
            return Err(Error::OperationFailed(format!(
                "cannot push '{}': its base version {base} is not on the remote",
                record.name
            )));
        }
        let mut session = remote.stores.start_transaction().await?;
        let created = remote.stores.branches.create(record, &mut session).await;
        match created {
            Ok(()) => session.commit_transaction().await?,
            Err(err) => {
                let _ = session.abort_transaction().await;
                return Err(err);
            }
        }
        // No versions transferred, but the remote gained a branch record.
        *dst_mutated = true;
        Ok(0)
    }

    fn require_fast_forward(
        &self,
        remote: &VersionedCollection,
        remote_tip: &VersionId,
        local_tip: &VersionId,
        branch: &str,
    ) -> Result<()> {
        let remote_id = remote.tree_ref().record(remote_tip)?.id;
        let shared = match self.tree_ref().record(remote_tip) {
            Ok(record) => record.id == remote_id,
            Err(_) => false,
        };
        if !shared {
            return Err(Error::NonFastForward(branch.to_string()));
        }
        if remote_tip != local_tip
            && !self.tree_ref().ancestors(local_tip)?.contains(remote_tip)
        {
            return Err(Error::NonFastForward(branch.to_string()));
        }
        Ok(())
    }

    /// Initialise an untracked remote as a mirror of this collection.
    ///
    /// The remote receives the root-version contents of the target
    /// collection and a tracking root with the same identity, so every
    /// later push splices onto a shared history.
    async fn seed_remote(&mut self, remote: &mut VersionedCollection) -> Result<()> {
        self.ensure_tree().await?;
        let root = self.tree_ref().root().clone();
        let position = self.stores.metadata.load().await?.current();

        self.checkout(Some(0), Some(MAIN_BRANCH)).await?;
        let documents: Vec<Document> = self
            .target
            .find(doc! {})
            .await?
            .try_collect()
            .await?;
        remote.target.delete_many(doc! {}).await?;
        if !documents.is_empty() {
            remote.target.insert_many(&documents).await?;
        }
        remote.init_mirror(&root).await?;

        if position.is_unborn() {
            self.checkout(None, Some(&position.branch)).await?;
        } else {
            self.checkout(Some(position.n), Some(&position.branch)).await?;
        }
        info!(remote = %remote.name(), "seeded untracked remote");
        Ok(())
    }

    /// Pull a branch from another tracked collection.
    ///
    /// Fast-forwards when possible; otherwise stages the remote commits
    /// on a synthetic rebranch and auto-merges, failing with
    /// [`Error::AutoMergeFailed`] when conflicts are recorded.
    pub async fn pull(
        &mut self,
        remote: &mut VersionedCollection,
        branch: Option<&str>,
    ) -> Result<u64> {
        check_pairing(self, remote)?;
        if !remote.is_tracked() {
            return Err(Error::NotInitialized(remote.name().to_string()));
        }

        lock_pair(self, remote).await?;
        let mut self_mutated = false;
        let mut remote_mutated = false;
        let result = self
            .pull_locked(remote, branch, &mut self_mutated, &mut remote_mutated)
            .await;
        let _ = self.lock.release(self_mutated).await;
        let _ = remote.lock.release(remote_mutated).await;
        result
    }

    async fn pull_locked(
        &mut self,
        remote: &mut VersionedCollection,
        branch: Option<&str>,
        self_mutated: &mut bool,
        remote_mutated: &mut bool,
    ) -> Result<u64> {
        if !self.is_tracked() {
            // First pull into an untracked collection: mirror the remote.
            // The push runs with the roles swapped, so its source flag is
            // the remote's and its destination flag is ours.
            let branch = branch.unwrap_or(MAIN_BRANCH).to_string();
            return remote
                .push_locked(self, Some(&branch), remote_mutated, self_mutated)
                .await;
        }

        self.fence().await?;
        let meta = self.stores.metadata.load().await?;
        if meta.has_conflicts {
            let count = self.stores.conflicts.count().await?;
            return Err(Error::UnresolvedConflicts(count as usize));
        }
        if meta.changed {
            return Err(Error::UncommittedChanges);
        }
        let branch = match branch {
            Some(name) => name.to_string(),
            None if meta.detached => return Err(Error::DetachedWithoutBranch),
            None => meta.current_branch.clone(),
        };
        if !remote.stores.branches.exists(&branch).await? {
            return Err(Error::UnknownBranch(branch));
        }

        self.ensure_tree().await?;
        remote.ensure_tree().await?;
        if self.tree_ref().root().id != remote.tree_ref().root().id {
            return Err(Error::CorruptState(
                "the collections have independent version histories".into(),
            ));
        }

        let remote_record = remote.stores.branches.get(&branch).await?;
        if !remote_record.has_versions() {
            // An unborn remote branch carries no versions to pull.
            return Ok(0);
        }
        let remote_tip = remote_record.tip();

        // Fork point: the deepest remote ancestor this collection shares.
        let mut remote_chain = vec![remote_tip.clone()];
        remote_chain.extend(remote.tree_ref().ancestors(&remote_tip)?);
        remote_chain.reverse();
        let mut fork: Option<VersionId> = None;
        for version in &remote_chain {
            if version_shared(self, remote, version)? {
                fork = Some(version.clone());
            } else {
                break;
            }
        }
        let fork = fork.ok_or_else(|| {
            Error::CorruptState("the local and remote histories share no versions".into())
        })?;
        if fork == remote_tip {
            return Ok(0);
        }

        let local_tip = match self.stores.branches.exists(&branch).await? {
            true => {
                let record = self.stores.branches.get(&branch).await?;
                if record.has_versions() {
                    record.tip()
                } else {
                    self.resolve_unborn(&branch).await?
                }
            }
            false => fork.clone(),
        };

        if local_tip == fork {
            return self
                .pull_fast_forward(remote, &branch, &fork, &remote_tip, &meta, self_mutated)
                .await;
        }
        self.pull_divergent(remote, &branch, &fork, &remote_tip, &local_tip, self_mutated)
            .await
    }

    async fn pull_fast_forward(
        &mut self,
        remote: &mut VersionedCollection,
        branch: &str,
        fork: &VersionId,
        remote_tip: &VersionId,
        meta: &crate::store::MetadataRecord,
        mutated: &mut bool,
    ) -> Result<u64> {
        let have_branch = self.stores.branches.exists(branch).await?;
        let mut session = self.stores.start_transaction().await?;
        let outcome = async {
            if !have_branch {
                self.stores
                    .branches
                    .create(
                        &BranchRecord {
                            name: branch.to_string(),
                            tip_n: fork.n,
                            tip_branch: fork.branch.clone(),
                        },
                        &mut session,
                    )
                    .await?;
            }
            let copied = replicate_chain(remote, self, fork, remote_tip, &mut session).await?;
            self.stores
                .branches
                .update_tip(branch, remote_tip, &mut session)
                .await?;
            Ok(copied)
        }
        .await;
        let copied = match outcome {
            Ok(copied) => {
                session.commit_transaction().await?;
                copied
            }
            Err(err) => {
                let _ = session.abort_transaction().await;
                return Err(err);
            }
        };
        *mutated = true;
        self.tree = None;

        if meta.current_branch == branch && !meta.detached {
            self.checkout(None, Some(branch)).await?;
        }
        info!(branch, copied, "pulled fast-forward");
        Ok(copied)
    }

    async fn pull_divergent(
        &mut self,
        remote: &mut VersionedCollection,
        branch: &str,
        fork: &VersionId,
        remote_tip: &VersionId,
        local_tip: &VersionId,
        mutated: &mut bool,
    ) -> Result<u64> {
        // Remote commits past the fork, oldest first.
        let staged_path = remote.tree_ref().path(fork, remote_tip)?;
        debug_assert!(staged_path.iter().all(|(_, d)| *d == Direction::Forward));
        let staged: Vec<VersionId> = staged_path.into_iter().map(|(v, _)| v).collect();

        let rebranch = self.next_rebranch_name(branch).await?;
        let rebranch_tip = VersionId::new(staged.len() as i64 - 1, &rebranch);
        let messages = self
            .stage_rebranch(remote, &rebranch, fork, &staged)
            .await?;
        *mutated = true;
        info!(branch, rebranch = %rebranch, staged = staged.len(), "staged divergent pull");

        self.merge_rebranch(branch, local_tip, &rebranch, &rebranch_tip, fork, &messages)
            .await?;
        Ok(staged.len() as u64)
    }

    async fn next_rebranch_name(&self, branch: &str) -> Result<String> {
        let prefix = format!("{REBRANCH_PREFIX}{branch}_");
        let existing = self
            .stores
            .branches
            .names()
            .await?
            .into_iter()
            .filter(|name| name.starts_with(&prefix))
            .count();
        Ok(format!("{prefix}{existing}"))
    }

    /// Copy the remote commits past the fork onto a synthetic branch.
    async fn stage_rebranch(
        &mut self,
        remote: &VersionedCollection,
        rebranch: &str,
        fork: &VersionId,
        staged: &[VersionId],
    ) -> Result<Vec<String>> {
        let mut messages = Vec::new();
        let mut session = self.stores.start_transaction().await?;
        let outcome = async {
            self.stores
                .branches
                .create(
                    &BranchRecord {
                        name: rebranch.to_string(),
                        tip_n: fork.n,
                        tip_branch: fork.branch.clone(),
                    },
                    &mut session,
                )
                .await?;

            let mut prev_id = self.tree_ref().record(fork)?.id;
            for (index, version) in staged.iter().enumerate() {
                let mut record = remote.tree_ref().record(version)?.clone();
                messages.push(record.message.clone());
                record.n = index as i64;
                record.branch = rebranch.to_string();
                record.prev_id = Some(prev_id);
                record.next_ids.clear();
                prev_id = record.id;
                self.stores.log.insert(&record, &mut session).await?;
            }

            let mut deltas: Vec<_> = remote
                .stores
                .deltas
                .in_versions(staged)
                .await?
                .into_values()
                .flatten()
                .collect();
            deltas.sort_by(|a, b| a.timestamp.cmp(&b.timestamp));
            let index_of: HashMap<VersionId, i64> = staged
                .iter()
                .enumerate()
                .map(|(i, v)| (v.clone(), i as i64))
                .collect();
            for delta in &mut deltas {
                let staged_n = index_of[&delta.version()];
                delta.version_n = staged_n;
                delta.branch = rebranch.to_string();
            }
            self.stores
                .deltas
                .insert_replicated(deltas, &mut session)
                .await?;

            self.stores
                .branches
                .update_tip(
                    rebranch,
                    &VersionId::new(staged.len() as i64 - 1, rebranch),
                    &mut session,
                )
                .await
        }
        .await;
        match outcome {
            Ok(()) => session.commit_transaction().await?,
            Err(err) => {
                let _ = session.abort_transaction().await;
                return Err(err);
            }
        }
        self.tree = None;
        Ok(messages)
    }

    /// Three-way merge the staged rebranch into the local branch.
    async fn merge_rebranch(
        &mut self,
        branch: &str,
        local_tip: &VersionId,
        rebranch: &str,
        rebranch_tip: &VersionId,
        fork: &VersionId,
        messages: &[String],
    ) -> Result<()> {
        // Base states live at the fork.
        self.checkout(Some(fork.n), Some(&fork.branch)).await?;
        self.ensure_tree().await?;

        let dest_deltas = self.composed_deltas(fork, local_tip).await?;
        let source_deltas = self.composed_deltas(fork, rebranch_tip).await?;

        let mut keys: HashSet<Value> = HashSet::new();
        keys.extend(dest_deltas.keys().cloned());
        keys.extend(source_deltas.keys().cloned());

        let mut merges = Vec::new();
        let mut conflicts = Vec::new();
        for key in keys {
            let raw_id = key.to_bson();
            let base = self
                .target
                .find_one(doc! {"_id": &raw_id})
                .await?
                .map(|d| Value::from_document(&d))
                .unwrap_or_else(Value::empty);

            let source = match source_deltas.get(&key) {
                Some(delta) => delta.apply(&base)?,
                None => continue,
            };
            if source == base {
                continue;
            }
            let dest = match dest_deltas.get(&key) {
                Some(delta) => delta.apply(&base)?,
                None => base.clone(),
            };

            if dest == base {
                // Only the remote side touched it; take the remote state.
                merges.push((raw_id, source.clone()));
                continue;
            }
            if dest == source {
                continue;
            }

            let outcome = three_way_merge(&base, &dest, &source);
            if outcome.is_clean() {
                merges.push((raw_id, outcome.merged));
            } else {
                conflicts.push(ConflictRecord {
                    id: ObjectId::new(),
                    document_id: raw_id,
                    destination: dest.to_document(),
                    source: source.to_document(),
                    merged: outcome.merged.to_document(),
                    destination_branch: branch.to_string(),
                    source_branch: rebranch.to_string(),
                });
            }
        }

        // Merge lands on the local branch tip.
        self.checkout(Some(local_tip.n), Some(&local_tip.branch))
            .await?;

        let mut session = self.stores.start_transaction().await?;
        let outcome = async {
            for (raw_id, state) in &merges {
                let document = if state.is_empty_map() {
                    None
                } else {
                    Some(state.to_document())
                };
                self.write_target(raw_id, document.as_ref(), &mut session)
                    .await?;
            }
            self.stores
                .conflicts
                .insert_many(&conflicts, &mut session)
                .await?;
            if !conflicts.is_empty() {
                let mut meta = self.stores.metadata.load().await?;
                meta.has_conflicts = true;
                self.stores.metadata.save(&meta, &mut session).await?;
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

        if !conflicts.is_empty() {
            return Err(Error::AutoMergeFailed(branch.to_string()));
        }

        // Clean merge: register the combined state and drop the staging
        // branch.
        self.fence().await?;
        let mut message = String::from("[auto-merged]");
        for entry in messages {
            message.push('\n');
            message.push_str(entry);
        }
        self.register(&message, None).await?;
        self.delete_version_subtree(0, Some(rebranch)).await?;
        Ok(())
    }

    /// Composed forward delta per document along `from -> to`.
    async fn composed_deltas(
        &mut self,
        from: &VersionId,
        to: &VersionId,
    ) -> Result<HashMap<Value, Delta>> {
        let path = self.tree_ref().path(from, to)?;
        let versions: Vec<VersionId> = path.iter().map(|(v, _)| v.clone()).collect();
        let mut composed = HashMap::new();
        for (key, records) in self.stores.deltas.in_versions(&versions).await? {
            let joined = join_forest(build_forest(records), self.tree_ref())?;
            let delta = joined.compose_along(&path)?;
            if !delta.is_empty() {
                composed.insert(key, delta);
            }
        }
        Ok(composed)
    }

    /// Resolve recorded conflicts through an external resolver.
    ///
    /// Returns `true` when every conflict was resolved. With
    /// `discard_local` the merge attempt is abandoned instead: the staged
    /// rebranch and the conflict records are dropped and the working
    /// changes discarded.
    pub async fn resolve_conflicts(
        &mut self,
        resolver: &dyn Resolver,
        discard_local: bool,
    ) -> Result<bool> {
        self.ensure_tracked()?;
        self.enter().await?;
        let mut mutated = false;
        let result = self
            .resolve_conflicts_locked(resolver, discard_local, &mut mutated)
            .await;
        self.lock.release(mutated).await?;
        result
    }

    async fn resolve_conflicts_locked(
        &mut self,
        resolver: &dyn Resolver,
        discard_local: bool,
        mutated: &mut bool,
    ) -> Result<bool> {
        let conflicts = self.stores.conflicts.all().await?;
        if conflicts.is_empty() {
            return Ok(false);
        }
        let source_branch = conflicts[0].source_branch.clone();

        if discard_local {
            self.delete_version_subtree(0, Some(&source_branch)).await?;
            *mutated = true;
            self.stores.conflicts.drop().await?;
            let mut meta = self.stores.metadata.load().await?;
            meta.has_conflicts = false;
            let mut session = self.stores.start_transaction().await?;
            let saved = self.stores.metadata.save(&meta, &mut session).await;
            match saved {
                Ok(()) => session.commit_transaction().await?,
                Err(err) => {
                    let _ = session.abort_transaction().await;
                    return Err(err);
                }
            }
            self.discard_changes().await?;
            return Ok(true);
        }

        let mut unresolved = 0_usize;
        for conflict in conflicts {
            let resolved = resolver.resolve(
                &conflict.destination,
                &conflict.source,
                &conflict.merged,
            )?;
            match resolved {
                Some(document) => {
                    self.target
                        .replace_one(doc! {"_id": &conflict.document_id}, &document)
                        .upsert(true)
                        .await?;
                    self.stores.conflicts.delete(conflict.id).await?;
                    *mutated = true;
                    info!(document_id = %conflict.document_id, "conflict resolved");
                }
                None => unresolved += 1,
            }
        }

        if unresolved > 0 {
            return Ok(false);
        }
        self.delete_version_subtree(0, Some(&source_branch)).await?;
        self.stores.conflicts.drop().await?;
        let mut meta = self.stores.metadata.load().await?;
        meta.has_conflicts = false;
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
}

fn check_pairing(a: &VersionedCollection, b: &VersionedCollection) -> Result<()> {
    if a.lock_key() == b.lock_key() {
        return Err(Error::InvalidArgument(
            "the source and destination collections are the same".into(),
        ));
    }
    if a.name() != b.name() {
        return Err(Error::InvalidArgument(format!(
            "cannot synchronise collections with different names: '{}' and '{}'",
            a.name(),
            b.name()
        )));
    }
    Ok(())
}

/// Take both locks in a fixed global order to avoid deadlock.
async fn lock_pair(a: &mut VersionedCollection, b: &mut VersionedCollection) -> Result<()> {
    if a.lock_key() <= b.lock_key() {
        a.enter().await?;
        if let Err(err) = b.enter().await {
            let _ = a.lock.release(false).await;
            return Err(err);
        }
    } else {
        b.enter().await?;
        if let Err(err) = a.enter().await {
            let _ = b.lock.release(false).await;
            return Err(err);
        }
    }
    Ok(())
}

/// Whether a version exists in both trees with the same log identity.
fn version_shared(
    a: &VersionedCollection,
    b: &VersionedCollection,
    version: &VersionId,
) -> Result<bool> {
    let in_a = a.tree_ref().record(version).ok();
    let in_b = b.tree_ref().record(version).ok();
    Ok(matches!((in_a, in_b), (Some(x), Some(y)) if x.id == y.id))
}

/// Copy the log records and deltas on `start -> tip` from one engine into
/// another, inside the destination's transaction.
async fn replicate_chain(
    src: &VersionedCollection,
    dst: &VersionedCollection,
    start: &VersionId,
    tip: &VersionId,
    session: &mut mongodb::ClientSession,
) -> Result<u64> {
    let path = src.tree_ref().path(start, tip)?;
    debug_assert!(path.iter().all(|(_, d)| *d == Direction::Forward));
    let missing: Vec<VersionId> = path.into_iter().map(|(v, _)| v).collect();

    for version in &missing {
        let mut record = src.tree_ref().record(version)?.clone();
        // Linkage is rebuilt by the insert through the parent's next_ids.
        record.next_ids.clear();
        dst.stores.log.insert(&record, session).await?;
    }

    let mut deltas: Vec<_> = src
        .stores
        .deltas
        .in_versions(&missing)
        .await?
        .into_values()
        .flatten()
        .collect();
    deltas.sort_by(|a, b| a.timestamp.cmp(&b.timestamp));
    dst.stores.deltas.insert_replicated(deltas, session).await?;

    Ok(missing.len() as u64)
}
