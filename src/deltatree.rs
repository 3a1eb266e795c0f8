//! Per-document delta trees.
//!
//! The deltas of one document form one or more trees linked through
//! `prev_id`/`next_ids`; a document inserted independently on several
//! branches has one subtree per insertion. For a checkout the subtrees
//! touched by the path are joined into a single tree by hanging them
//! under synthetic identity deltas at the lowest common ancestor of their
//! roots, after which the deltas along the path compose into the single
//! transformation to apply to the document.

use std::collections::HashMap;

use crate::delta::{compose, Delta};
use crate::error::{Error, Result};
use crate::store::deltas::DeltaRecord;
use crate::tree::{Direction, LogTree, VersionId};

enum NodeKind {
    Stored(DeltaRecord),
    /// Synthetic join point; forward and backward are both no-ops.
    Identity(VersionId),
}

struct Node {
    kind: NodeKind,
    children: Vec<usize>,
}

impl Node {
    fn version(&self) -> VersionId {
        match &self.kind {
            NodeKind::Stored(record) => record.version(),
            NodeKind::Identity(version) => version.clone(),
        }
    }
}

/// One connected tree of deltas for a single document.
pub struct DeltaTree {
    nodes: Vec<Node>,
    by_version: HashMap<VersionId, usize>,
    root: usize,
}

impl DeltaTree {
    fn root_version(&self) -> VersionId {
        self.nodes[self.root].version()
    }

    /// The stored delta registered at a version, if the document changed
    /// there.
    pub fn record_at(&self, version: &VersionId) -> Option<&DeltaRecord> {
        self.by_version
            .get(version)
            .and_then(|&index| match &self.nodes[index].kind {
                NodeKind::Stored(record) => Some(record),
                NodeKind::Identity(_) => None,
            })
    }

    /// Compose the document's deltas along a log path into one delta.
    ///
    /// Versions where the document has no delta (or only a synthetic
    /// identity) contribute nothing.
    pub fn compose_along(&self, path: &[(VersionId, Direction)]) -> Result<Delta> {
        let mut composed = Delta::identity();
        for (version, direction) in path {
            if let Some(record) = self.record_at(version) {
                let step = record.delta(*direction)?;
                composed = compose(&composed, &step)?;
            }
        }
        Ok(composed)
    }

    fn len(&self) -> usize {
        self.nodes.len()
    }
}

/// Build the delta forest of one document from its stored records.
///
/// A record whose predecessor is absent from the set roots its own
/// subtree, which makes the construction equally usable for the full
/// forest and for the partial forest restricted to a path.
pub fn build_forest(records: Vec<DeltaRecord>) -> Vec<DeltaTree> {
    let mut by_id: HashMap<bson::oid::ObjectId, DeltaRecord> =
        records.into_iter().map(|r| (r.id, r)).collect();

    let root_ids: Vec<bson::oid::ObjectId> = by_id
        .values()
        .filter(|r| match r.prev_id {
            None => true,
            Some(prev) => !by_id.contains_key(&prev),
        })
        .map(|r| r.id)
        .collect();

    let mut forest = Vec::with_capacity(root_ids.len());
    for root_id in root_ids {
        let mut tree = DeltaTree {
            nodes: Vec::new(),
            by_version: HashMap::new(),
            root: 0,
        };
        let mut index_of_id = HashMap::new();
        let mut to_visit = vec![root_id];
        while let Some(id) = to_visit.pop() {
            let Some(record) = by_id.remove(&id) else {
                continue;
            };
            to_visit.extend(record.next_ids.iter().copied());
            let index = tree.nodes.len();
            index_of_id.insert(record.id, index);
            tree.by_version.insert(record.version(), index);
            tree.nodes.push(Node {
                kind: NodeKind::Stored(record),
                children: Vec::new(),
            });
        }

        let mut edges = Vec::new();
        for (index, node) in tree.nodes.iter().enumerate() {
            if let NodeKind::Stored(record) = &node.kind {
                for next in &record.next_ids {
                    if let Some(&child) = index_of_id.get(next) {
                        edges.push((index, child));
                    }
                }
            }
        }
        for (parent, child) in edges {
            tree.nodes[parent].children.push(child);
        }
        forest.push(tree);
    }
    forest
}

/// Join a document's delta forest into a single tree.
///
/// Repeatedly picks the two subtrees whose roots share the deepest common
/// ancestor in the log tree and hangs them under a synthetic identity
/// delta at that ancestor.
pub fn join_forest(mut forest: Vec<DeltaTree>, log: &LogTree) -> Result<DeltaTree> {
    if forest.is_empty() {
        return Err(Error::CorruptState(
            "cannot join an empty delta forest".into(),
        ));
    }

    while forest.len() > 1 {
        let mut best: Option<(usize, usize, usize, VersionId)> = None;
        for i in 0..forest.len() {
            for j in (i + 1)..forest.len() {
                let lca = log.lca(&forest[i].root_version(), &forest[j].root_version())?;
                let depth = log.level(&lca)?;
                if best.as_ref().map_or(true, |(_, _, d, _)| depth > *d) {
                    best = Some((i, j, depth, lca));
                }
            }
        }
        let (i, j, _, lca) = best.expect("forest has at least two trees");

        // Remove the higher index first so the lower stays valid.
        let second = forest.remove(j);
        let first = forest.remove(i);
        forest.push(merge_under_identity(first, second, lca));
    }

    Ok(forest.pop().expect("single joined tree"))
}

fn merge_under_identity(first: DeltaTree, second: DeltaTree, at: VersionId) -> DeltaTree {
    let mut nodes = Vec::with_capacity(first.len() + second.len() + 1);
    let mut by_version = HashMap::new();

    nodes.push(Node {
        kind: NodeKind::Identity(at.clone()),
        children: Vec::new(),
    });
    by_version.insert(at, 0);

    for tree in [first, second] {
        let offset = nodes.len();
        let sub_root = offset + tree.root;
        for (index, node) in tree.nodes.into_iter().enumerate() {
            let version = node.version();
            by_version.entry(version).or_insert(offset + index);
            nodes.push(Node {
                kind: node.kind,
                children: node.children.iter().map(|c| c + offset).collect(),
            });
        }
        nodes[0].children.push(sub_root);
    }

    DeltaTree {
        nodes,
        by_version,
        root: 0,
    }
}

/// The most recent delta for a document along a root-ward version chain.
///
/// `chain` runs from the version being registered towards the root; the
/// first version carrying a delta wins. New deltas link to it as their
/// predecessor.
pub fn latest_on_chain<'a>(
    records: &'a [DeltaRecord],
    chain: &[VersionId],
) -> Option<&'a DeltaRecord> {
    let by_version: HashMap<VersionId, &DeltaRecord> =
        records.iter().map(|r| (r.version(), r)).collect();
    chain
        .iter()
        .find_map(|version| by_version.get(version).copied())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::delta::diff;
    use crate::tree::{LogRecord, LogTree};
    use crate::value::Value;
    use bson::doc;
    use bson::oid::ObjectId;
    use chrono::{DateTime, Utc};

    fn ts(offset: i64) -> DateTime<Utc> {
        DateTime::<Utc>::from_timestamp(1_700_000_000 + offset, 0).unwrap()
    }

    fn log_record(n: i64, branch: &str, offset: i64, prev: Option<&LogRecord>) -> LogRecord {
        LogRecord {
            id: ObjectId::new(),
            n,
            branch: branch.to_string(),
            timestamp: ts(offset),
            message: String::new(),
            prev_id: prev.map(|p| p.id),
            next_ids: Vec::new(),
        }
    }

    /// main: 0 - 1 - 2, branch b at 1: (0, b).
    fn sample_log() -> LogTree {
        let r0 = log_record(0, "main", 0, None);
        let r1 = log_record(1, "main", 10, Some(&r0));
        let r2 = log_record(2, "main", 20, Some(&r1));
        let b0 = log_record(0, "b", 30, Some(&r1));
        let mut records = vec![r0, r1, r2, b0];
        for (parent, child) in [(0usize, 1usize), (1, 2), (1, 3)] {
            let id = records[child].id;
            records[parent].next_ids.push(id);
        }
        LogTree::from_records(records).unwrap()
    }

    fn delta_record(
        doc_id: i64,
        version: VersionId,
        offset: i64,
        from: &Value,
        to: &Value,
        prev: Option<&DeltaRecord>,
    ) -> DeltaRecord {
        let mut record = DeltaRecord::encode(
            bson::Bson::Int64(doc_id),
            &version,
            ts(offset),
            &diff(from, to),
            prev.map(|p| p.id),
        )
        .unwrap();
        record.next_ids = Vec::new();
        record
    }

    fn value(doc: bson::Document) -> Value {
        Value::from_document(&doc)
    }

    #[test]
    fn connected_records_build_one_tree() {
        let v1 = value(doc! {"_id": 3_i64, "x": 1});
        let v2 = value(doc! {"_id": 3_i64, "x": 2});
        let mut first = delta_record(3, VersionId::new(1, "main"), 0, &Value::empty(), &v1, None);
        let second = delta_record(3, VersionId::new(2, "main"), 1, &v1, &v2, Some(&first));
        first.next_ids.push(second.id);

        let forest = build_forest(vec![first, second]);
        assert_eq!(forest.len(), 1);
        assert!(forest[0].record_at(&VersionId::new(1, "main")).is_some());
        assert!(forest[0].record_at(&VersionId::new(2, "main")).is_some());
    }

    #[test]
    fn independent_insertions_build_disconnected_trees() {
        let on_main = value(doc! {"_id": 3_i64, "name": "D3"});
        let on_b = value(doc! {"_id": 3_i64, "name": "D3'"});
        let a = delta_record(3, VersionId::new(2, "main"), 0, &Value::empty(), &on_main, None);
        let b = delta_record(3, VersionId::new(0, "b"), 1, &Value::empty(), &on_b, None);

        let forest = build_forest(vec![a, b]);
        assert_eq!(forest.len(), 2);
    }

    #[test]
    fn join_hangs_subtrees_under_identity_at_the_lca() {
        let log = sample_log();
        let on_main = value(doc! {"_id": 3_i64, "name": "D3"});
        let on_b = value(doc! {"_id": 3_i64, "name": "D3'"});
        let a = delta_record(3, VersionId::new(2, "main"), 0, &Value::empty(), &on_main, None);
        let b = delta_record(3, VersionId::new(0, "b"), 1, &Value::empty(), &on_b, None);

        let joined = join_forest(build_forest(vec![a, b]), &log).unwrap();
        // The join point is the fork version and is synthetic.
        assert_eq!(joined.root_version(), VersionId::new(1, "main"));
        assert!(joined.record_at(&VersionId::new(1, "main")).is_none());
    }

    #[test]
    fn composition_crosses_the_identity_join() {
        let log = sample_log();
        let on_main = value(doc! {"_id": 3_i64, "name": "D3"});
        let on_b = value(doc! {"_id": 3_i64, "name": "D3'"});
        let a = delta_record(3, VersionId::new(2, "main"), 0, &Value::empty(), &on_main, None);
        let b = delta_record(3, VersionId::new(0, "b"), 1, &Value::empty(), &on_b, None);
        let joined = join_forest(build_forest(vec![a, b]), &log).unwrap();

        // Checkout from (2, main) to (0, b).
        let path = log
            .path(&VersionId::new(2, "main"), &VersionId::new(0, "b"))
            .unwrap();
        let composed = joined.compose_along(&path).unwrap();
        assert_eq!(composed.apply(&on_main).unwrap(), on_b);
    }

    #[test]
    fn absent_versions_contribute_nothing() {
        let log = sample_log();
        let v1 = value(doc! {"_id": 9_i64, "x": 1});
        let record = delta_record(9, VersionId::new(1, "main"), 0, &Value::empty(), &v1, None);
        let joined = join_forest(build_forest(vec![record]), &log).unwrap();

        // The path (2, main) -> (1, main) only undoes version 2, where
        // this document has no delta.
        let path = log
            .path(&VersionId::new(2, "main"), &VersionId::new(1, "main"))
            .unwrap();
        assert!(joined.compose_along(&path).unwrap().is_empty());
    }

    #[test]
    fn latest_on_chain_prefers_the_nearest_version() {
        let v1 = value(doc! {"_id": 3_i64, "x": 1});
        let v2 = value(doc! {"_id": 3_i64, "x": 2});
        let mut first = delta_record(3, VersionId::new(1, "main"), 0, &Value::empty(), &v1, None);
        let second = delta_record(3, VersionId::new(2, "main"), 1, &v1, &v2, Some(&first));
        first.next_ids.push(second.id);
        let records = vec![first, second];

        let chain = vec![
            VersionId::new(2, "main"),
            VersionId::new(1, "main"),
            VersionId::root(),
        ];
        let found = latest_on_chain(&records, &chain).unwrap();
        assert_eq!(found.version(), VersionId::new(2, "main"));

        let shallow = vec![VersionId::new(1, "main"), VersionId::root()];
        assert_eq!(
            latest_on_chain(&records, &shallow).unwrap().version(),
            VersionId::new(1, "main")
        );
    }
}
