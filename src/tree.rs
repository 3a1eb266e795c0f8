//! In-memory log tree.
//!
//! The log store persists one record per registered version, linked into a
//! tree through `prev_id`/`next_ids`. This module reconstructs that tree
//! into an arena with a precomputed level per node, giving O(depth) lowest
//! common ancestor and path queries. The tree is a cache: it is rebuilt
//! from the store on load and invalidated when another process advances
//! the lock epoch.

use std::collections::HashMap;
use std::fmt;

use bson::oid::ObjectId;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Identity of a registered version: a sequence number on a branch.
///
/// `n = -1` denotes a freshly created branch with no version registered
/// on it yet.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct VersionId {
    pub n: i64,
    pub branch: String,
}

impl VersionId {
    pub fn new(n: i64, branch: impl Into<String>) -> VersionId {
        VersionId {
            n,
            branch: branch.into(),
        }
    }

    /// The root of every log tree.
    pub fn root() -> VersionId {
        VersionId::new(0, MAIN_BRANCH)
    }

    /// Whether this id points at a branch without registered versions.
    pub fn is_unborn(&self) -> bool {
        self.n < 0
    }
}

impl fmt::Display for VersionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "({}, {})", self.n, self.branch)
    }
}

/// Name of the branch created by `init`.
pub const MAIN_BRANCH: &str = "main";

/// Direction in which a version's delta is traversed on a path.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Forward,
    Backward,
}

impl Direction {
    pub fn inverted(self) -> Direction {
        match self {
            Direction::Forward => Direction::Backward,
            Direction::Backward => Direction::Forward,
        }
    }
}

/// One registered version, as persisted in the log store.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LogRecord {
    #[serde(rename = "_id")]
    pub id: ObjectId,
    pub n: i64,
    pub branch: String,
    #[serde(with = "bson::serde_helpers::chrono_datetime_as_bson_datetime")]
    pub timestamp: DateTime<Utc>,
    pub message: String,
    pub prev_id: Option<ObjectId>,
    pub next_ids: Vec<ObjectId>,
}

impl LogRecord {
    pub fn version(&self) -> VersionId {
        VersionId::new(self.n, &self.branch)
    }
}

struct Node {
    record: LogRecord,
    parent: Option<usize>,
    children: Vec<usize>,
    level: usize,
}

/// Arena-backed tree over log records with a level index per node.
pub struct LogTree {
    nodes: Vec<Option<Node>>,
    by_version: HashMap<VersionId, usize>,
    by_id: HashMap<ObjectId, usize>,
    root: usize,
}

impl LogTree {
    /// Rebuild the tree from the persisted log records.
    ///
    /// Validates the structural invariants: exactly one root, no cycles,
    /// no unconnected entries, no dangling links.
    pub fn from_records(records: Vec<LogRecord>) -> Result<LogTree> {
        let mut remaining: HashMap<ObjectId, LogRecord> =
            records.into_iter().map(|r| (r.id, r)).collect();
        let total = remaining.len();

        let root_ids: Vec<ObjectId> = remaining
            .values()
            .filter(|r| r.prev_id.is_none())
            .map(|r| r.id)
            .collect();
        let root_id = match root_ids.as_slice() {
            [single] => *single,
            [] => return Err(Error::CorruptState("the log has no root entry".into())),
            many => {
                return Err(Error::CorruptState(format!(
                    "the log has {} root entries",
                    many.len()
                )));
            }
        };

        let mut tree = LogTree {
            nodes: Vec::with_capacity(total),
            by_version: HashMap::with_capacity(total),
            by_id: HashMap::with_capacity(total),
            root: 0,
        };

        // (record id, parent arena index)
        let mut to_visit: Vec<(ObjectId, Option<usize>)> = vec![(root_id, None)];
        while let Some((id, parent)) = to_visit.pop() {
            let record = remaining.remove(&id).ok_or_else(|| {
                Error::CorruptState(format!("log entry {id} is linked more than once"))
            })?;
            let level = parent.map_or(0, |p| tree.node(p).level + 1);
            let next_ids = record.next_ids.clone();
            let index = tree.insert_node(record, parent, level)?;
            if let Some(parent) = parent {
                tree.node_mut(parent).children.push(index);
            }
            for child_id in next_ids {
                to_visit.push((child_id, Some(index)));
            }
        }

        if !remaining.is_empty() {
            return Err(Error::CorruptState(format!(
                "{} log entries are not connected to the root",
                remaining.len()
            )));
        }

        for index in 0..tree.nodes.len() {
            tree.sort_children(index);
        }
        Ok(tree)
    }

    fn insert_node(&mut self, record: LogRecord, parent: Option<usize>, level: usize) -> Result<usize> {
        let version = record.version();
        let id = record.id;
        let index = self.nodes.len();
        if self.by_version.insert(version.clone(), index).is_some() {
            return Err(Error::CorruptState(format!(
                "duplicate log entry for version {version}"
            )));
        }
        self.by_id.insert(id, index);
        self.nodes.push(Some(Node {
            record,
            parent,
            children: Vec::new(),
            level,
        }));
        if parent.is_none() {
            self.root = index;
        }
        Ok(index)
    }

    fn node(&self, index: usize) -> &Node {
        self.nodes[index].as_ref().expect("live node")
    }

    fn node_mut(&mut self, index: usize) -> &mut Node {
        self.nodes[index].as_mut().expect("live node")
    }

    fn index_of(&self, version: &VersionId) -> Result<usize> {
        self.by_version
            .get(version)
            .copied()
            .ok_or_else(|| Error::InvalidVersion(version.clone()))
    }

    // Siblings are ordered by registration time, branch name breaking ties.
    fn sort_children(&mut self, index: usize) {
        let mut children = match &self.nodes[index] {
            Some(node) => node.children.clone(),
            None => return,
        };
        children.sort_by(|&a, &b| {
            let (ra, rb) = (&self.node(a).record, &self.node(b).record);
            ra.timestamp
                .cmp(&rb.timestamp)
                .then_with(|| ra.branch.cmp(&rb.branch))
        });
        self.node_mut(index).children = children;
    }

    /// Number of registered versions.
    pub fn len(&self) -> usize {
        self.by_version.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_version.is_empty()
    }

    pub fn contains(&self, version: &VersionId) -> bool {
        self.by_version.contains_key(version)
    }

    /// The root version of the tree.
    pub fn root(&self) -> &LogRecord {
        &self.node(self.root).record
    }

    pub fn record(&self, version: &VersionId) -> Result<&LogRecord> {
        Ok(&self.node(self.index_of(version)?).record)
    }

    pub fn record_by_id(&self, id: &ObjectId) -> Option<&LogRecord> {
        self.by_id.get(id).map(|&index| &self.node(index).record)
    }

    /// Depth of a version below the root.
    pub fn level(&self, version: &VersionId) -> Result<usize> {
        Ok(self.node(self.index_of(version)?).level)
    }

    /// The immediate predecessor version, `None` for the root.
    pub fn parent(&self, version: &VersionId) -> Result<Option<&LogRecord>> {
        let node = self.node(self.index_of(version)?);
        Ok(node.parent.map(|p| &self.node(p).record))
    }

    /// Immediate successor versions, in sibling order.
    pub fn children(&self, version: &VersionId) -> Result<Vec<&LogRecord>> {
        let node = self.node(self.index_of(version)?);
        Ok(node
            .children
            .iter()
            .map(|&child| &self.node(child).record)
            .collect())
    }

    /// All strict ancestors of a version, nearest first, root last.
    pub fn ancestors(&self, version: &VersionId) -> Result<Vec<VersionId>> {
        let mut index = self.index_of(version)?;
        let mut out = Vec::new();
        while let Some(parent) = self.node(index).parent {
            out.push(self.node(parent).record.version());
            index = parent;
        }
        Ok(out)
    }

    /// All strict descendants of a version, in preorder.
    pub fn descendants(&self, version: &VersionId) -> Result<Vec<VersionId>> {
        let start = self.index_of(version)?;
        let mut out = Vec::new();
        let mut to_visit: Vec<usize> = self.node(start).children.clone();
        while let Some(index) = to_visit.pop() {
            out.push(self.node(index).record.version());
            to_visit.extend(self.node(index).children.iter().copied());
        }
        Ok(out)
    }

    /// Versions at the tips of the subtree rooted in `version`.
    pub fn subtree_tips(&self, version: &VersionId) -> Result<Vec<VersionId>> {
        let start = self.index_of(version)?;
        let mut out = Vec::new();
        let mut to_visit = vec![start];
        while let Some(index) = to_visit.pop() {
            let node = self.node(index);
            if node.children.is_empty() {
                out.push(node.record.version());
            } else {
                to_visit.extend(node.children.iter().copied());
            }
        }
        Ok(out)
    }

    /// The latest registered version on a branch, if any.
    pub fn branch_tip(&self, branch: &str) -> Option<VersionId> {
        self.by_version
            .keys()
            .filter(|v| v.branch == branch)
            .max_by_key(|v| v.n)
            .cloned()
    }

    /// Branch names with at least one registered version.
    pub fn branch_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self
            .by_version
            .keys()
            .map(|v| v.branch.clone())
            .collect();
        names.sort();
        names.dedup();
        names
    }

    /// Lowest common ancestor of two versions.
    pub fn lca(&self, u: &VersionId, v: &VersionId) -> Result<VersionId> {
        let mut a = self.index_of(u)?;
        let mut b = self.index_of(v)?;
        while self.node(a).level > self.node(b).level {
            a = self.node(a).parent.expect("deeper node has a parent");
        }
        while self.node(b).level > self.node(a).level {
            b = self.node(b).parent.expect("deeper node has a parent");
        }
        while a != b {
            a = self.node(a).parent.expect("non-root while walking to lca");
            b = self.node(b).parent.expect("non-root while walking to lca");
        }
        Ok(self.node(a).record.version())
    }

    /// The ordered path from `u` to `v`.
    ///
    /// Versions ascending towards the common ancestor appear with
    /// [`Direction::Backward`] (their deltas are undone), versions on the
    /// descent appear with [`Direction::Forward`]. The common ancestor
    /// itself is not part of the path; `u` appears first, `v` last. The
    /// path from a version to itself is empty.
    pub fn path(&self, u: &VersionId, v: &VersionId) -> Result<Vec<(VersionId, Direction)>> {
        let mut a = self.index_of(u)?;
        let mut b = self.index_of(v)?;
        if a == b {
            return Ok(Vec::new());
        }

        let mut ascent = Vec::new();
        let mut descent = Vec::new();
        while self.node(a).level > self.node(b).level {
            ascent.push(a);
            a = self.node(a).parent.expect("deeper node has a parent");
        }
        while self.node(b).level > self.node(a).level {
            descent.push(b);
            b = self.node(b).parent.expect("deeper node has a parent");
        }
        while a != b {
            ascent.push(a);
            a = self.node(a).parent.expect("non-root while walking to lca");
            descent.push(b);
            b = self.node(b).parent.expect("non-root while walking to lca");
        }

        let mut path: Vec<(VersionId, Direction)> = ascent
            .into_iter()
            .map(|index| (self.node(index).record.version(), Direction::Backward))
            .collect();
        path.extend(
            descent
                .into_iter()
                .rev()
                .map(|index| (self.node(index).record.version(), Direction::Forward)),
        );
        Ok(path)
    }

    /// Attach a newly registered version under its `prev_id` parent.
    pub fn add_entry(&mut self, record: LogRecord) -> Result<()> {
        let parent_id = record.prev_id.ok_or_else(|| {
            Error::CorruptState("non-root log entries must have a predecessor".into())
        })?;
        let parent = *self
            .by_id
            .get(&parent_id)
            .ok_or_else(|| Error::CorruptState(format!("unknown predecessor {parent_id}")))?;
        let level = self.node(parent).level + 1;
        let id = record.id;
        let index = self.insert_node(record, Some(parent), level)?;
        self.node_mut(parent).children.push(index);
        self.node_mut(parent).record.next_ids.push(id);
        self.sort_children(parent);
        Ok(())
    }

    /// Detach and return a version together with all its descendants.
    ///
    /// The root cannot be removed.
    pub fn remove_subtree(&mut self, version: &VersionId) -> Result<Vec<LogRecord>> {
        let start = self.index_of(version)?;
        let parent = self
            .node(start)
            .parent
            .ok_or_else(|| Error::InvalidArgument("cannot delete the root version".into()))?;

        let removed_id = self.node(start).record.id;
        self.node_mut(parent).children.retain(|&c| c != start);
        self.node_mut(parent).record.next_ids.retain(|&id| id != removed_id);

        let mut removed = Vec::new();
        let mut to_visit = vec![start];
        while let Some(index) = to_visit.pop() {
            let node = self.nodes[index].take().expect("live node");
            self.by_version.remove(&node.record.version());
            self.by_id.remove(&node.record.id);
            to_visit.extend(node.children.iter().copied());
            removed.push(node.record);
        }
        Ok(removed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    fn record(
        n: i64,
        branch: &str,
        offset_secs: i64,
        prev: Option<&LogRecord>,
    ) -> LogRecord {
        LogRecord {
            id: ObjectId::new(),
            n,
            branch: branch.to_string(),
            timestamp: DateTime::<Utc>::from_timestamp(1_700_000_000 + offset_secs, 0).unwrap(),
            message: format!("{n}_{branch}"),
            prev_id: prev.map(|p| p.id),
            next_ids: Vec::new(),
        }
    }

    /// main: 0 - 1 - 2 - 3, with branch b forking at 1: b0 - b1.
    fn sample_tree() -> LogTree {
        let r0 = record(0, "main", 0, None);
        let r1 = record(1, "main", 10, Some(&r0));
        let r2 = record(2, "main", 20, Some(&r1));
        let r3 = record(3, "main", 30, Some(&r2));
        let b0 = record(0, "b", 40, Some(&r1));
        let b1 = record(1, "b", 50, Some(&b0));

        let mut records = vec![r0, r1, r2, r3, b0, b1];
        let links: Vec<(usize, usize)> = vec![(0, 1), (1, 2), (2, 3), (1, 4), (4, 5)];
        for (parent, child) in links {
            let id = records[child].id;
            records[parent].next_ids.push(id);
        }
        LogTree::from_records(records).unwrap()
    }

    #[test]
    fn builds_and_indexes_levels() {
        let tree = sample_tree();
        assert_eq!(tree.len(), 6);
        assert_eq!(tree.level(&VersionId::root()).unwrap(), 0);
        assert_eq!(tree.level(&VersionId::new(3, "main")).unwrap(), 3);
        assert_eq!(tree.level(&VersionId::new(1, "b")).unwrap(), 3);
    }

    #[test]
    fn rejects_missing_root() {
        let r0 = record(0, "main", 0, None);
        let mut r1 = record(1, "main", 1, Some(&r0));
        r1.prev_id = Some(ObjectId::new());
        assert!(matches!(
            LogTree::from_records(vec![r1]),
            Err(Error::CorruptState(_))
        ));
    }

    #[test]
    fn rejects_unconnected_entries() {
        let r0 = record(0, "main", 0, None);
        let stray = record(5, "main", 1, Some(&r0));
        // r0 does not link to stray.
        assert!(matches!(
            LogTree::from_records(vec![r0, stray]),
            Err(Error::CorruptState(_))
        ));
    }

    #[test]
    fn lca_across_branches() {
        let tree = sample_tree();
        let lca = tree
            .lca(&VersionId::new(3, "main"), &VersionId::new(1, "b"))
            .unwrap();
        assert_eq!(lca, VersionId::new(1, "main"));
    }

    #[test]
    fn path_between_branches() {
        let tree = sample_tree();
        let path = tree
            .path(&VersionId::new(3, "main"), &VersionId::new(1, "b"))
            .unwrap();
        assert_eq!(
            path,
            vec![
                (VersionId::new(3, "main"), Direction::Backward),
                (VersionId::new(2, "main"), Direction::Backward),
                (VersionId::new(0, "b"), Direction::Forward),
                (VersionId::new(1, "b"), Direction::Forward),
            ]
        );
    }

    #[test]
    fn path_to_ancestor_is_single_direction() {
        let tree = sample_tree();
        let path = tree
            .path(&VersionId::new(3, "main"), &VersionId::root())
            .unwrap();
        assert!(path.iter().all(|(_, d)| *d == Direction::Backward));
        assert_eq!(path.len(), 3);

        let down = tree
            .path(&VersionId::root(), &VersionId::new(2, "main"))
            .unwrap();
        assert!(down.iter().all(|(_, d)| *d == Direction::Forward));
        assert_eq!(down.last().unwrap().0, VersionId::new(2, "main"));
    }

    #[test]
    fn path_to_self_is_empty() {
        let tree = sample_tree();
        let v = VersionId::new(2, "main");
        assert!(tree.path(&v, &v).unwrap().is_empty());
    }

    #[test]
    fn path_reverses_with_inverted_directions() {
        let tree = sample_tree();
        let pairs = [
            (VersionId::new(3, "main"), VersionId::new(1, "b")),
            (VersionId::root(), VersionId::new(1, "b")),
            (VersionId::new(2, "main"), VersionId::new(3, "main")),
        ];
        for (u, v) in pairs {
            let forward = tree.path(&u, &v).unwrap();
            let mut reversed: Vec<_> = tree
                .path(&v, &u)
                .unwrap()
                .into_iter()
                .map(|(id, d)| (id, d.inverted()))
                .collect();
            reversed.reverse();
            assert_eq!(forward, reversed, "path({u}, {v})");
        }
    }

    #[test]
    fn sibling_order_breaks_ties_by_branch() {
        let r0 = record(0, "main", 0, None);
        let mut a = record(0, "zeta", 10, Some(&r0));
        let b = record(1, "main", 10, Some(&r0));
        a.timestamp = b.timestamp;

        let mut records = vec![r0, a, b];
        let ids = (records[1].id, records[2].id);
        records[0].next_ids = vec![ids.0, ids.1];
        let tree = LogTree::from_records(records).unwrap();

        let children = tree.children(&VersionId::root()).unwrap();
        assert_eq!(children[0].branch, "main");
        assert_eq!(children[1].branch, "zeta");
    }

    #[test]
    fn add_entry_extends_tip() {
        let mut tree = sample_tree();
        let tip = tree.record(&VersionId::new(3, "main")).unwrap().clone();
        let next = LogRecord {
            id: ObjectId::new(),
            n: 4,
            branch: "main".into(),
            timestamp: tip.timestamp + Duration::seconds(5),
            message: "v4".into(),
            prev_id: Some(tip.id),
            next_ids: Vec::new(),
        };
        tree.add_entry(next).unwrap();
        assert_eq!(tree.branch_tip("main"), Some(VersionId::new(4, "main")));
        assert_eq!(
            tree.parent(&VersionId::new(4, "main")).unwrap().unwrap().n,
            3
        );
    }

    #[test]
    fn remove_subtree_detaches_descendants() {
        let mut tree = sample_tree();
        let removed = tree.remove_subtree(&VersionId::new(2, "main")).unwrap();
        assert_eq!(removed.len(), 2);
        assert!(!tree.contains(&VersionId::new(3, "main")));
        assert_eq!(tree.branch_tip("main"), Some(VersionId::new(1, "main")));
        // The branch fork is untouched.
        assert!(tree.contains(&VersionId::new(1, "b")));
        assert!(tree.remove_subtree(&VersionId::root()).is_err());
    }

    #[test]
    fn descendants_and_tips() {
        let tree = sample_tree();
        let mut succ = tree.descendants(&VersionId::new(1, "main")).unwrap();
        succ.sort_by(|a, b| (a.n, &a.branch).cmp(&(b.n, &b.branch)));
        assert_eq!(succ.len(), 4);

        let mut tips = tree.subtree_tips(&VersionId::root()).unwrap();
        tips.sort_by(|a, b| a.branch.cmp(&b.branch));
        assert_eq!(
            tips,
            vec![VersionId::new(1, "b"), VersionId::new(3, "main")]
        );
    }
}
