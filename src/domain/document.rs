//! Schema-light documents.
//!
//! A [`Document`] is an identity plus a map of named [`Value`]s. Values are
//! scalars, references to other documents by id, embedded field maps, or
//! ordered sequences of numeric rows. Parents hold child *ids*, never child
//! documents, so persisting a parent only serializes the ids it references.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::collections::btree_map;
use std::fmt;
use uuid::Uuid;

/// Opaque, stable document identity.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct DocumentId(String);

impl DocumentId {
    /// A fresh random id.
    pub fn generate() -> Self {
        DocumentId(Uuid::new_v4().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for DocumentId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for DocumentId {
    fn from(value: &str) -> Self {
        DocumentId(value.to_string())
    }
}

impl From<String> for DocumentId {
    fn from(value: String) -> Self {
        DocumentId(value)
    }
}

/// Identity of a store instance. Documents remember the store that minted them.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct StoreId(Uuid);

impl StoreId {
    pub fn generate() -> Self {
        StoreId(Uuid::new_v4())
    }
}

impl fmt::Display for StoreId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Token proving the holder of a lease lock.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct LockToken(Uuid);

impl LockToken {
    pub fn generate() -> Self {
        LockToken(Uuid::new_v4())
    }
}

/// A single numeric cell of a row.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub enum Number {
    Int(i64),
    Float(f64),
}

impl Number {
    pub fn as_i64(&self) -> i64 {
        match *self {
            Number::Int(v) => v,
            Number::Float(v) => v as i64,
        }
    }

    pub fn as_f64(&self) -> f64 {
        match *self {
            Number::Int(v) => v as f64,
            Number::Float(v) => v,
        }
    }
}

impl From<i64> for Number {
    fn from(value: i64) -> Self {
        Number::Int(value)
    }
}

impl From<f64> for Number {
    fn from(value: f64) -> Self {
        Number::Float(value)
    }
}

pub type Row = Vec<Number>;

/// A field value.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Value {
    Null,
    Bool(bool),
    Int(i64),
    Float(f64),
    Text(String),
    /// Reference to another stored document.
    Ref(DocumentId),
    /// Nested fields owned by (and persisted with) the enclosing document.
    Embedded(Fields),
    Rows(Vec<Row>),
}

impl Value {
    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::Text(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Value::Bool(b) => Some(*b),
            _ => None,
        }
    }

    pub fn as_ref_id(&self) -> Option<&DocumentId> {
        match self {
            Value::Ref(id) => Some(id),
            _ => None,
        }
    }

    pub fn as_embedded(&self) -> Option<&Fields> {
        match self {
            Value::Embedded(fields) => Some(fields),
            _ => None,
        }
    }

    pub fn as_rows(&self) -> Option<&[Row]> {
        match self {
            Value::Rows(rows) => Some(rows),
            _ => None,
        }
    }
}

/// Ordered field-name to value map.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Fields(BTreeMap<String, Value>);

impl Fields {
    pub fn new() -> Self {
        Fields(BTreeMap::new())
    }

    pub fn get(&self, name: &str) -> Option<&Value> {
        self.0.get(name)
    }

    pub fn get_mut(&mut self, name: &str) -> Option<&mut Value> {
        self.0.get_mut(name)
    }

    pub fn insert(&mut self, name: impl Into<String>, value: Value) -> Option<Value> {
        self.0.insert(name.into(), value)
    }

    pub fn remove(&mut self, name: &str) -> Option<Value> {
        self.0.remove(name)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.0.contains_key(name)
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn iter(&self) -> btree_map::Iter<'_, String, Value> {
        self.0.iter()
    }

    pub fn keys(&self) -> impl Iterator<Item = &str> {
        self.0.keys().map(String::as_str)
    }

    /// Embedded map at `name`, inserting an empty one when absent.
    /// A value of another type under `name` is replaced.
    pub fn embedded_mut(&mut self, name: &str) -> &mut Fields {
        let slot = self
            .0
            .entry(name.to_string())
            .or_insert_with(|| Value::Embedded(Fields::new()));
        if !matches!(slot, Value::Embedded(_)) {
            *slot = Value::Embedded(Fields::new());
        }
        match slot {
            Value::Embedded(fields) => fields,
            _ => unreachable!("slot was just set to Embedded"),
        }
    }

    /// Row sequence at `name`, inserting an empty one when absent.
    /// A value of another type under `name` is replaced.
    pub fn rows_mut(&mut self, name: &str) -> &mut Vec<Row> {
        let slot = self
            .0
            .entry(name.to_string())
            .or_insert_with(|| Value::Rows(Vec::new()));
        if !matches!(slot, Value::Rows(_)) {
            *slot = Value::Rows(Vec::new());
        }
        match slot {
            Value::Rows(rows) => rows,
            _ => unreachable!("slot was just set to Rows"),
        }
    }

    /// Dotted path of the first NaN or infinite float, searching embedded
    /// maps and rows. Snapshots cannot represent such values.
    pub fn non_finite_path(&self) -> Option<String> {
        self.0.iter().find_map(|(name, value)| match value {
            Value::Float(v) if !v.is_finite() => Some(name.clone()),
            Value::Embedded(fields) => fields
                .non_finite_path()
                .map(|inner| format!("{name}.{inner}")),
            Value::Rows(rows) => rows.iter().enumerate().find_map(|(r, row)| {
                row.iter()
                    .position(|n| matches!(n, Number::Float(v) if !v.is_finite()))
                    .map(|c| format!("{name}[{r}][{c}]"))
            }),
            _ => None,
        })
    }

    /// Ids of every document referenced from these fields, embedded maps included.
    pub fn references(&self) -> Vec<&DocumentId> {
        let mut refs = Vec::new();
        for value in self.0.values() {
            match value {
                Value::Ref(id) => refs.push(id),
                Value::Embedded(fields) => refs.extend(fields.references()),
                _ => {}
            }
        }
        refs
    }
}

impl AsRef<Fields> for Fields {
    fn as_ref(&self) -> &Fields {
        self
    }
}

impl AsMut<Fields> for Fields {
    fn as_mut(&mut self) -> &mut Fields {
        self
    }
}

impl FromIterator<(String, Value)> for Fields {
    fn from_iter<I: IntoIterator<Item = (String, Value)>>(iter: I) -> Self {
        Fields(iter.into_iter().collect())
    }
}

/// An identity-bearing record bound to the store that created it.
///
/// The id and store binding are fixed for the document's lifetime; fields may
/// be replaced freely. `version` is 0 until the first successful put.
#[derive(Debug, Clone, PartialEq)]
pub struct Document {
    id: DocumentId,
    store: StoreId,
    kind: String,
    version: u64,
    lock: Option<LockToken>,
    fields: Fields,
}

impl Document {
    pub(crate) fn new(id: DocumentId, store: StoreId, kind: &str) -> Self {
        Document {
            id,
            store,
            kind: kind.to_string(),
            version: 0,
            lock: None,
            fields: Fields::new(),
        }
    }

    pub(crate) fn restore(
        id: DocumentId,
        store: StoreId,
        kind: String,
        version: u64,
        fields: Fields,
    ) -> Self {
        Document {
            id,
            store,
            kind,
            version,
            lock: None,
            fields,
        }
    }

    pub fn id(&self) -> &DocumentId {
        &self.id
    }

    pub fn store_id(&self) -> StoreId {
        self.store
    }

    /// Name of the view type this document was instantiated for.
    pub fn kind(&self) -> &str {
        &self.kind
    }

    pub fn version(&self) -> u64 {
        self.version
    }

    pub fn is_stored(&self) -> bool {
        self.version > 0
    }

    pub(crate) fn set_version(&mut self, version: u64) {
        self.version = version;
    }

    pub fn lock_token(&self) -> Option<LockToken> {
        self.lock
    }

    pub(crate) fn set_lock(&mut self, lock: Option<LockToken>) {
        self.lock = lock;
    }

    pub fn fields(&self) -> &Fields {
        &self.fields
    }

    pub fn fields_mut(&mut self) -> &mut Fields {
        &mut self.fields
    }

    pub fn get(&self, name: &str) -> Option<&Value> {
        self.fields.get(name)
    }

    pub fn set(&mut self, name: impl Into<String>, value: Value) -> &mut Self {
        self.fields.insert(name, value);
        self
    }
}

impl AsRef<Fields> for Document {
    fn as_ref(&self) -> &Fields {
        &self.fields
    }
}

impl AsMut<Fields> for Document {
    fn as_mut(&mut self) -> &mut Fields {
        &mut self.fields
    }
}
