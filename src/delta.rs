//! Delta codec.
//!
//! Computes invertible structural diffs between two states of a document,
//! applies them in either direction, composes them along a path of
//! versions, and merges two divergent states against a common base.
//!
//! A delta is a set of changes keyed by path. Every change carries the
//! concrete values on both sides of the transition, so a delta can be
//! inverted and applied without access to the documents it was computed
//! from. The empty map is the canonical "absent document" state: a diff
//! from `{}` materialises a document, a diff into `{}` deletes it.

use std::collections::BTreeMap;

use bson::{Bson, Document};
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::value::Value;

/// One step of a path into a nested document.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Seg {
    Key(String),
    Index(usize),
}

/// A path from the document root to a nested field or element.
pub type Path = Vec<Seg>;

/// A single change at one path.
#[derive(Debug, Clone, PartialEq)]
pub enum Change {
    /// The path was absent and gains a value.
    Insert(Value),
    /// The path held a value and loses it.
    Remove(Value),
    /// The path transitions between two values.
    Replace(Value, Value),
}

impl Change {
    fn inverted(&self) -> Change {
        match self {
            Change::Insert(value) => Change::Remove(value.clone()),
            Change::Remove(value) => Change::Insert(value.clone()),
            Change::Replace(old, new) => Change::Replace(new.clone(), old.clone()),
        }
    }
}

/// An invertible structural diff between two document states.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct Delta {
    ops: BTreeMap<Path, Change>,
}

/// Render a path as a `$.field[index]` expression.
pub fn display_path(path: &[Seg]) -> String {
    let mut out = String::from("$");
    for seg in path {
        match seg {
            Seg::Key(key) => {
                out.push('.');
                out.push_str(key);
            }
            Seg::Index(idx) => out.push_str(&format!("[{idx}]")),
        }
    }
    out
}

impl Delta {
    /// The neutral delta: applying it changes nothing.
    pub fn identity() -> Delta {
        Delta::default()
    }

    /// Whether this delta is a no-op.
    pub fn is_empty(&self) -> bool {
        self.ops.is_empty()
    }

    /// Number of changed paths.
    pub fn len(&self) -> usize {
        self.ops.len()
    }

    /// Iterate over the changed paths and their transitions.
    pub fn changes(&self) -> impl Iterator<Item = (&Path, &Change)> {
        self.ops.iter()
    }

    /// The delta that undoes this one.
    pub fn invert(&self) -> Delta {
        Delta {
            ops: self
                .ops
                .iter()
                .map(|(path, change)| (path.clone(), change.inverted()))
                .collect(),
        }
    }

    /// Apply this delta to a document state, producing the next state.
    ///
    /// Transitions are verified against the current state; a mismatch means
    /// the delta is being applied to a state it was not computed from.
    pub fn apply(&self, doc: &Value) -> Result<Value> {
        let mut result = doc.clone();

        // Replacements keep the shape, removals shrink arrays from the
        // highest index first, insertions grow them from the lowest.
        for (path, change) in &self.ops {
            if matches!(change, Change::Replace(..)) {
                apply_change(&mut result, path, change)?;
            }
        }
        for (path, change) in self.ops.iter().rev() {
            if matches!(change, Change::Remove(_)) {
                apply_change(&mut result, path, change)?;
            }
        }
        for (path, change) in &self.ops {
            if matches!(change, Change::Insert(_)) {
                apply_change(&mut result, path, change)?;
            }
        }
        Ok(result)
    }

    /// Serialize into the stable wire encoding.
    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        let wire = WireDelta {
            v: WIRE_VERSION,
            ops: self
                .ops
                .iter()
                .map(|(path, change)| {
                    let p = path
                        .iter()
                        .map(|seg| match seg {
                            Seg::Key(key) => Bson::String(key.clone()),
                            Seg::Index(idx) => Bson::Int64(*idx as i64),
                        })
                        .collect();
                    let (k, o, n) = match change {
                        Change::Insert(new) => (0, Bson::Null, new.to_bson()),
                        Change::Remove(old) => (1, old.to_bson(), Bson::Null),
                        Change::Replace(old, new) => (2, old.to_bson(), new.to_bson()),
                    };
                    WireOp { k, p, o, n }
                })
                .collect(),
        };
        Ok(bson::to_vec(&wire)?)
    }

    /// Deserialize from the wire encoding.
    pub fn from_bytes(bytes: &[u8]) -> Result<Delta> {
        let wire: WireDelta = bson::from_slice(bytes)?;
        if wire.v != WIRE_VERSION {
            return Err(Error::Codec(format!(
                "unsupported delta wire version {}",
                wire.v
            )));
        }
        let mut ops = BTreeMap::new();
        for op in wire.ops {
            let mut path = Path::new();
            for seg in op.p {
                match seg {
                    Bson::String(key) => path.push(Seg::Key(key)),
                    Bson::Int64(idx) if idx >= 0 => path.push(Seg::Index(idx as usize)),
                    other => {
                        return Err(Error::Codec(format!("invalid path segment: {other}")));
                    }
                }
            }
            let change = match op.k {
                0 => Change::Insert(Value::from_bson(&op.n)),
                1 => Change::Remove(Value::from_bson(&op.o)),
                2 => Change::Replace(Value::from_bson(&op.o), Value::from_bson(&op.n)),
                other => return Err(Error::Codec(format!("invalid change kind {other}"))),
            };
            ops.insert(path, change);
        }
        Ok(Delta { ops })
    }
}

const WIRE_VERSION: i32 = 1;

#[derive(Serialize, Deserialize)]
struct WireDelta {
    v: i32,
    ops: Vec<WireOp>,
}

#[derive(Serialize, Deserialize)]
struct WireOp {
    k: i32,
    p: Vec<Bson>,
    o: Bson,
    n: Bson,
}

/// Compute the structural diff from `a` to `b`.
///
/// Applying the result to `a` yields `b`; applying its inverse to `b`
/// yields `a`.
pub fn diff(a: &Value, b: &Value) -> Delta {
    let mut ops = BTreeMap::new();
    diff_into(&mut ops, &mut Path::new(), a, b);
    Delta { ops }
}

/// Diff two BSON documents.
pub fn diff_documents(a: &Document, b: &Document) -> Delta {
    diff(&Value::from_document(a), &Value::from_document(b))
}

fn diff_into(ops: &mut BTreeMap<Path, Change>, path: &mut Path, a: &Value, b: &Value) {
    if a == b {
        return;
    }
    match (a, b) {
        (Value::Map(ma), Value::Map(mb)) => {
            for (key, old) in ma {
                path.push(Seg::Key(key.clone()));
                match mb.get(key) {
                    Some(new) => diff_into(ops, path, old, new),
                    None => {
                        ops.insert(path.clone(), Change::Remove(old.clone()));
                    }
                }
                path.pop();
            }
            for (key, new) in mb {
                if !ma.contains_key(key) {
                    path.push(Seg::Key(key.clone()));
                    ops.insert(path.clone(), Change::Insert(new.clone()));
                    path.pop();
                }
            }
        }
        (Value::Array(xa), Value::Array(xb)) => {
            let shared = xa.len().min(xb.len());
            for idx in 0..shared {
                path.push(Seg::Index(idx));
                diff_into(ops, path, &xa[idx], &xb[idx]);
                path.pop();
            }
            for (idx, old) in xa.iter().enumerate().skip(shared) {
                path.push(Seg::Index(idx));
                ops.insert(path.clone(), Change::Remove(old.clone()));
                path.pop();
            }
            for (idx, new) in xb.iter().enumerate().skip(shared) {
                path.push(Seg::Index(idx));
                ops.insert(path.clone(), Change::Insert(new.clone()));
                path.pop();
            }
        }
        _ => {
            ops.insert(path.clone(), Change::Replace(a.clone(), b.clone()));
        }
    }
}

fn apply_change(root: &mut Value, path: &Path, change: &Change) -> Result<()> {
    if path.is_empty() {
        return match change {
            Change::Replace(old, new) => {
                if root != old {
                    return Err(state_mismatch(path));
                }
                *root = new.clone();
                Ok(())
            }
            _ => Err(Error::Codec(
                "insert/remove at the document root".to_string(),
            )),
        };
    }

    let mut target = root;
    for seg in &path[..path.len() - 1] {
        target = descend(target, seg).ok_or_else(|| state_mismatch(path))?;
    }

    match (path.last().expect("non-empty path"), target) {
        (Seg::Key(key), Value::Map(map)) => match change {
            Change::Insert(new) => {
                if map.insert(key.clone(), new.clone()).is_some() {
                    return Err(state_mismatch(path));
                }
            }
            Change::Remove(old) => {
                if map.remove(key).as_ref() != Some(old) {
                    return Err(state_mismatch(path));
                }
            }
            Change::Replace(old, new) => {
                let slot = map.get_mut(key).ok_or_else(|| state_mismatch(path))?;
                if slot != old {
                    return Err(state_mismatch(path));
                }
                *slot = new.clone();
            }
        },
        (Seg::Index(idx), Value::Array(items)) => match change {
            Change::Insert(new) => {
                if *idx > items.len() {
                    return Err(state_mismatch(path));
                }
                items.insert(*idx, new.clone());
            }
            Change::Remove(old) => {
                if *idx >= items.len() || &items[*idx] != old {
                    return Err(state_mismatch(path));
                }
                items.remove(*idx);
            }
            Change::Replace(old, new) => {
                let slot = items.get_mut(*idx).ok_or_else(|| state_mismatch(path))?;
                if slot != old {
                    return Err(state_mismatch(path));
                }
                *slot = new.clone();
            }
        },
        _ => return Err(state_mismatch(path)),
    }
    Ok(())
}

fn descend<'a>(value: &'a mut Value, seg: &Seg) -> Option<&'a mut Value> {
    match (seg, value) {
        (Seg::Key(key), Value::Map(map)) => map.get_mut(key),
        (Seg::Index(idx), Value::Array(items)) => items.get_mut(*idx),
        _ => None,
    }
}

fn state_mismatch(path: &Path) -> Error {
    Error::Codec(format!(
        "delta does not match the document state at {}",
        display_path(path)
    ))
}

/// Compose two deltas: applying the result equals applying `first`, then
/// `second`. Associative, with [`Delta::identity`] as the unit.
pub fn compose(first: &Delta, second: &Delta) -> Result<Delta> {
    let mut ops = first.ops.clone();

    for (path, change2) in &second.ops {
        if let Some(change1) = ops.remove(path) {
            if let Some(combined) = combine(path, &change1, change2)? {
                ops.insert(path.clone(), combined);
            }
            continue;
        }

        // A change from the first delta may sit on an ancestor of this
        // path; fold the second change into its carried value.
        if let Some((ancestor, change1)) =
            ops.range_mut(..path.clone())
                .rev()
                .find(|(candidate, _)| {
                    path.len() > candidate.len() && path.starts_with(candidate)
                })
        {
            let relative: Path = path[ancestor.len()..].to_vec();
            let carried = match change1 {
                Change::Insert(value) | Change::Replace(_, value) => value,
                Change::Remove(_) => {
                    return Err(Error::Codec(format!(
                        "composition touches removed subtree at {}",
                        display_path(path)
                    )));
                }
            };
            apply_change(carried, &relative, change2)?;
            continue;
        }

        // Or the second change may subsume changes the first delta made
        // below this path; rebase its old side past those changes.
        let nested: Vec<Path> = ops
            .range(path.clone()..)
            .take_while(|(candidate, _)| candidate.starts_with(path))
            .map(|(candidate, _)| candidate.clone())
            .collect();
        if !nested.is_empty() {
            let mut undo = BTreeMap::new();
            for nested_path in &nested {
                let change1 = ops.remove(nested_path).expect("collected from ops");
                undo.insert(nested_path[path.len()..].to_vec(), change1.inverted());
            }
            let undo = Delta { ops: undo };
            let combined = match change2 {
                Change::Insert(_) => {
                    return Err(Error::Codec(format!(
                        "composition inserts over modified subtree at {}",
                        display_path(path)
                    )));
                }
                Change::Remove(old) => Change::Remove(undo.apply(old)?),
                Change::Replace(old, new) => {
                    let original = undo.apply(old)?;
                    if &original == new {
                        continue;
                    }
                    Change::Replace(original, new.clone())
                }
            };
            ops.insert(path.clone(), combined);
            continue;
        }

        ops.insert(path.clone(), change2.clone());
    }

    Ok(Delta { ops })
}

fn combine(path: &Path, first: &Change, second: &Change) -> Result<Option<Change>> {
    let combined = match (first, second) {
        (Change::Insert(a), Change::Replace(old, b)) => {
            ensure_matches(path, a, old)?;
            Some(Change::Insert(b.clone()))
        }
        (Change::Insert(a), Change::Remove(old)) => {
            ensure_matches(path, a, old)?;
            None
        }
        (Change::Replace(a, b), Change::Replace(old, c)) => {
            ensure_matches(path, b, old)?;
            if a == c {
                None
            } else {
                Some(Change::Replace(a.clone(), c.clone()))
            }
        }
        (Change::Replace(a, b), Change::Remove(old)) => {
            ensure_matches(path, b, old)?;
            Some(Change::Remove(a.clone()))
        }
        (Change::Remove(a), Change::Insert(b)) => {
            if a == b {
                None
            } else {
                Some(Change::Replace(a.clone(), b.clone()))
            }
        }
        _ => {
            return Err(Error::Codec(format!(
                "invalid change sequence at {}",
                display_path(path)
            )));
        }
    };
    Ok(combined)
}

fn ensure_matches(path: &Path, produced: &Value, expected: &Value) -> Result<()> {
    if produced != expected {
        return Err(state_mismatch(path));
    }
    Ok(())
}

/// Result of a three-way document merge.
#[derive(Debug, Clone)]
pub struct MergeOutcome {
    /// The merged document; conflicted fields carry the destination value.
    pub merged: Value,
    /// Top-level fields modified to different values on both sides.
    pub conflicts: Vec<String>,
}

impl MergeOutcome {
    pub fn is_clean(&self) -> bool {
        self.conflicts.is_empty()
    }
}

/// Merge two divergent document states against their common base.
///
/// A top-level field modified on exactly one side is taken from that side.
/// A field modified on both sides to the same value merges silently; to
/// different values it is reported as a conflict.
pub fn three_way_merge(base: &Value, dest: &Value, source: &Value) -> MergeOutcome {
    let empty = BTreeMap::new();
    let base_map = base.as_map().unwrap_or(&empty);
    let dest_map = dest.as_map().unwrap_or(&empty);
    let source_map = source.as_map().unwrap_or(&empty);

    let mut keys: Vec<&String> = base_map
        .keys()
        .chain(dest_map.keys())
        .chain(source_map.keys())
        .collect();
    keys.sort();
    keys.dedup();

    let mut merged = BTreeMap::new();
    let mut conflicts = Vec::new();

    for key in keys {
        let in_base = base_map.get(key);
        let in_dest = dest_map.get(key);
        let in_source = source_map.get(key);

        let dest_changed = in_dest != in_base;
        let source_changed = in_source != in_base;

        let winner = match (dest_changed, source_changed) {
            (_, false) => in_dest,
            (false, true) => in_source,
            (true, true) => {
                if in_dest != in_source {
                    conflicts.push(key.clone());
                }
                in_dest
            }
        };
        if let Some(value) = winner {
            merged.insert(key.clone(), value.clone());
        }
    }

    MergeOutcome {
        merged: Value::Map(merged),
        conflicts,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bson::doc;

    fn value(doc: bson::Document) -> Value {
        Value::from_document(&doc)
    }

    #[test]
    fn diff_apply_round_trip() {
        let a = value(doc! {"name": "A", "keep": 1, "nested": {"x": 1, "y": 2}});
        let b = value(doc! {"name": "B", "keep": 1, "nested": {"x": 1, "z": 3}, "added": true});

        let delta = diff(&a, &b);
        assert_eq!(delta.apply(&a).unwrap(), b);
        assert_eq!(delta.invert().apply(&b).unwrap(), a);
    }

    #[test]
    fn diff_of_equal_documents_is_identity() {
        let a = value(doc! {"x": 1});
        assert!(diff(&a, &a).is_empty());
        assert_eq!(Delta::identity().apply(&a).unwrap(), a);
    }

    #[test]
    fn insert_from_nothing_and_delete_into_nothing() {
        let doc = value(doc! {"_id": 1, "name": "A"});

        let create = diff(&Value::empty(), &doc);
        assert_eq!(create.apply(&Value::empty()).unwrap(), doc);

        let delete = diff(&doc, &Value::empty());
        assert!(delete.apply(&doc).unwrap().is_empty_map());
    }

    #[test]
    fn array_growth_and_shrinkage() {
        let a = value(doc! {"tags": ["x", "y", "z"]});
        let b = value(doc! {"tags": ["x", "q"]});

        let delta = diff(&a, &b);
        assert_eq!(delta.apply(&a).unwrap(), b);
        assert_eq!(delta.invert().apply(&b).unwrap(), a);
    }

    #[test]
    fn apply_rejects_wrong_state() {
        let a = value(doc! {"x": 1});
        let b = value(doc! {"x": 2});
        let other = value(doc! {"x": 99});

        let delta = diff(&a, &b);
        assert!(matches!(delta.apply(&other), Err(Error::Codec(_))));
    }

    #[test]
    fn compose_collapses_same_path() {
        let a = value(doc! {"x": 1});
        let b = value(doc! {"x": 2});
        let c = value(doc! {"x": 3});

        let composed = compose(&diff(&a, &b), &diff(&b, &c)).unwrap();
        assert_eq!(composed.apply(&a).unwrap(), c);
        assert_eq!(composed.len(), 1);
    }

    #[test]
    fn compose_drops_round_trips() {
        let a = value(doc! {"x": 1});
        let b = value(doc! {"x": 2});

        let there_and_back = compose(&diff(&a, &b), &diff(&b, &a)).unwrap();
        assert!(there_and_back.is_empty());
    }

    #[test]
    fn compose_folds_nested_change_into_inserted_subtree() {
        let a = value(doc! {});
        let b = value(doc! {"nested": {"x": 1}});
        let c = value(doc! {"nested": {"x": 2}});

        let composed = compose(&diff(&a, &b), &diff(&b, &c)).unwrap();
        assert_eq!(composed.apply(&a).unwrap(), c);
    }

    #[test]
    fn compose_rebases_subsuming_removal() {
        let a = value(doc! {"nested": {"x": 1}});
        let b = value(doc! {"nested": {"x": 2}});
        let c = value(doc! {});

        let composed = compose(&diff(&a, &b), &diff(&b, &c)).unwrap();
        assert_eq!(composed.apply(&a).unwrap(), c);
        // Inverting must restore the original nested value, not the
        // intermediate one.
        assert_eq!(composed.invert().apply(&c).unwrap(), a);
    }

    #[test]
    fn compose_is_associative() {
        let s0 = value(doc! {"x": 1, "nested": {"a": 1}});
        let s1 = value(doc! {"x": 2, "nested": {"a": 1, "b": 2}});
        let s2 = value(doc! {"nested": {"a": 3, "b": 2}});
        let s3 = value(doc! {"nested": {"a": 3}, "y": true});

        let d1 = diff(&s0, &s1);
        let d2 = diff(&s1, &s2);
        let d3 = diff(&s2, &s3);

        let left = compose(&compose(&d1, &d2).unwrap(), &d3).unwrap();
        let right = compose(&d1, &compose(&d2, &d3).unwrap()).unwrap();
        assert_eq!(left.apply(&s0).unwrap(), s3);
        assert_eq!(right.apply(&s0).unwrap(), s3);
        assert_eq!(left, right);
    }

    #[test]
    fn identity_is_the_composition_unit() {
        let a = value(doc! {"x": 1});
        let b = value(doc! {"x": 2, "y": 3});
        let delta = diff(&a, &b);

        assert_eq!(compose(&Delta::identity(), &delta).unwrap(), delta);
        assert_eq!(compose(&delta, &Delta::identity()).unwrap(), delta);
    }

    #[test]
    fn wire_encoding_round_trip() {
        let a = value(doc! {"x": 1, "tags": ["a"], "nested": {"deep": true}});
        let b = value(doc! {"x": 2, "tags": ["a", "b"], "renamed": {"deep": false}});

        let delta = diff(&a, &b);
        let decoded = Delta::from_bytes(&delta.to_bytes().unwrap()).unwrap();
        assert_eq!(decoded, delta);
        assert_eq!(decoded.apply(&a).unwrap(), b);
    }

    #[test]
    fn wire_encoding_rejects_unknown_version() {
        let bytes = bson::to_vec(&WireDelta {
            v: 99,
            ops: Vec::new(),
        })
        .unwrap();
        assert!(matches!(Delta::from_bytes(&bytes), Err(Error::Codec(_))));
    }

    #[test]
    fn merge_takes_single_sided_changes() {
        let base = value(doc! {"a": 1, "b": 1, "c": 1});
        let dest = value(doc! {"a": 2, "b": 1, "c": 1});
        let source = value(doc! {"a": 1, "b": 1});

        let outcome = three_way_merge(&base, &dest, &source);
        assert!(outcome.is_clean());
        assert_eq!(outcome.merged, value(doc! {"a": 2, "b": 1}));
    }

    #[test]
    fn merge_conflict_carries_destination_value() {
        let base = value(doc! {"x": 1, "same": 1});
        let dest = value(doc! {"x": 2, "same": 5});
        let source = value(doc! {"x": 3, "same": 5});

        let outcome = three_way_merge(&base, &dest, &source);
        assert_eq!(outcome.conflicts, vec!["x".to_string()]);
        assert_eq!(outcome.merged, value(doc! {"x": 2, "same": 5}));
    }

    #[test]
    fn merge_of_identical_changes_is_clean() {
        let base = value(doc! {"x": 1});
        let both = value(doc! {"x": 7});

        let outcome = three_way_merge(&base, &both, &both);
        assert!(outcome.is_clean());
        assert_eq!(outcome.merged, both);
    }
}
