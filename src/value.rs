//! Canonical document values.
//!
//! The delta codec does not operate on driver types directly; documents are
//! first lowered into a tagged value with a small closed set of scalar
//! kinds. This keeps the wire format of deltas independent of the driver
//! and makes document ids usable as hash-map keys.

use std::collections::BTreeMap;
use std::fmt;
use std::hash::{Hash, Hasher};

use bson::oid::ObjectId;
use bson::{Bson, Document};
use serde::{Deserialize, Serialize};

/// A canonical, hashable document value.
///
/// Integers are widened to 64 bits and symbols are folded into strings, so
/// a round trip through the codec preserves document contents but not
/// exotic BSON subtypes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Value {
    Null,
    Bool(bool),
    Int(i64),
    Float(f64),
    String(String),
    Bytes(Vec<u8>),
    Array(Vec<Value>),
    Map(BTreeMap<String, Value>),
    Oid(ObjectId),
    Timestamp(i64),
}

impl Eq for Value {}

impl Hash for Value {
    fn hash<H: Hasher>(&self, state: &mut H) {
        std::mem::discriminant(self).hash(state);
        match self {
            Value::Null => {}
            Value::Bool(b) => b.hash(state),
            Value::Int(i) => i.hash(state),
            // NaN never appears as a document id; bit equality is enough.
            Value::Float(f) => f.to_bits().hash(state),
            Value::String(s) => s.hash(state),
            Value::Bytes(b) => b.hash(state),
            Value::Array(items) => items.hash(state),
            Value::Map(map) => map.hash(state),
            Value::Oid(oid) => oid.hash(state),
            Value::Timestamp(ms) => ms.hash(state),
        }
    }
}

impl Value {
    /// The empty map, standing in for an absent document.
    pub fn empty() -> Value {
        Value::Map(BTreeMap::new())
    }

    /// Whether this value is a map with no fields.
    ///
    /// An empty map is the canonical representation of "no document": a
    /// delta whose net effect empties a document deletes it from the
    /// target collection.
    pub fn is_empty_map(&self) -> bool {
        matches!(self, Value::Map(map) if map.is_empty())
    }

    pub fn as_map(&self) -> Option<&BTreeMap<String, Value>> {
        match self {
            Value::Map(map) => Some(map),
            _ => None,
        }
    }

    /// Lower a BSON value into the canonical model.
    pub fn from_bson(bson: &Bson) -> Value {
        match bson {
            Bson::Null | Bson::Undefined => Value::Null,
            Bson::Boolean(b) => Value::Bool(*b),
            Bson::Int32(i) => Value::Int(i64::from(*i)),
            Bson::Int64(i) => Value::Int(*i),
            Bson::Double(f) => Value::Float(*f),
            Bson::String(s) => Value::String(s.clone()),
            Bson::Symbol(s) => Value::String(s.clone()),
            Bson::Binary(bin) => Value::Bytes(bin.bytes.clone()),
            Bson::Array(items) => Value::Array(items.iter().map(Value::from_bson).collect()),
            Bson::Document(doc) => Value::from_document(doc),
            Bson::ObjectId(oid) => Value::Oid(*oid),
            Bson::DateTime(dt) => Value::Timestamp(dt.timestamp_millis()),
            Bson::Timestamp(ts) => {
                Value::Timestamp((i64::from(ts.time)) * 1000 + i64::from(ts.increment))
            }
            Bson::Decimal128(d) => Value::String(d.to_string()),
            Bson::RegularExpression(re) => Value::String(format!("/{}/{}", re.pattern, re.options)),
            Bson::JavaScriptCode(code) => Value::String(code.clone()),
            Bson::JavaScriptCodeWithScope(code) => Value::String(code.code.clone()),
            Bson::MaxKey => Value::String("$maxKey".to_string()),
            Bson::MinKey => Value::String("$minKey".to_string()),
            Bson::DbPointer(_) => Value::Null,
        }
    }

    /// Lower a BSON document into a canonical map value.
    pub fn from_document(doc: &Document) -> Value {
        Value::Map(
            doc.iter()
                .map(|(key, value)| (key.clone(), Value::from_bson(value)))
                .collect(),
        )
    }

    /// Raise a canonical value back into BSON.
    pub fn to_bson(&self) -> Bson {
        match self {
            Value::Null => Bson::Null,
            Value::Bool(b) => Bson::Boolean(*b),
            Value::Int(i) => Bson::Int64(*i),
            Value::Float(f) => Bson::Double(*f),
            Value::String(s) => Bson::String(s.clone()),
            Value::Bytes(bytes) => Bson::Binary(bson::Binary {
                subtype: bson::spec::BinarySubtype::Generic,
                bytes: bytes.clone(),
            }),
            Value::Array(items) => Bson::Array(items.iter().map(Value::to_bson).collect()),
            Value::Map(map) => {
                let mut doc = Document::new();
                for (key, value) in map {
                    doc.insert(key.clone(), value.to_bson());
                }
                Bson::Document(doc)
            }
            Value::Oid(oid) => Bson::ObjectId(*oid),
            Value::Timestamp(ms) => Bson::DateTime(bson::DateTime::from_millis(*ms)),
        }
    }

    /// Raise a canonical map value into a BSON document.
    ///
    /// Non-map values produce an empty document; callers only reach this
    /// with document-shaped values.
    pub fn to_document(&self) -> Document {
        match self.to_bson() {
            Bson::Document(doc) => doc,
            _ => Document::new(),
        }
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Oid(oid) => write!(f, "ObjectId('{oid}')"),
            Value::String(s) => write!(f, "{s:?}"),
            other => write!(f, "{}", other.to_bson()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bson::doc;

    #[test]
    fn document_round_trip() {
        let doc = doc! {
            "_id": ObjectId::new(),
            "name": "A",
            "n": 42_i64,
            "ratio": 0.5,
            "tags": ["x", "y"],
            "nested": { "deep": true, "missing": Bson::Null },
        };
        let value = Value::from_document(&doc);
        assert_eq!(value.to_document(), doc);
    }

    #[test]
    fn int32_widens_to_int64() {
        let value = Value::from_bson(&Bson::Int32(7));
        assert_eq!(value, Value::Int(7));
        assert_eq!(value.to_bson(), Bson::Int64(7));
    }

    #[test]
    fn ids_are_usable_as_keys() {
        use std::collections::HashMap;

        let oid = ObjectId::new();
        let mut map = HashMap::new();
        map.insert(Value::Oid(oid), 1);
        map.insert(Value::String("k".into()), 2);
        map.insert(Value::Int(3), 3);
        assert_eq!(map.get(&Value::Oid(oid)), Some(&1));
        assert_eq!(map.len(), 3);
    }

    #[test]
    fn empty_map_means_absent() {
        assert!(Value::empty().is_empty_map());
        assert!(!Value::from_document(&doc! {"a": 1}).is_empty_map());
    }
}
