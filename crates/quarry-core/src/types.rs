//! Universal data types for the federation layer
//!
//! These types provide a normalized representation of backend results:
//! SQL rows and REST API records both end up as a [`DataFrame`].

use std::cmp::Ordering;

use serde::{Deserialize, Serialize};

/// Universal value representation
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Value {
    Null,
    Bool(bool),
    Int(i64),
    Float(f64),
    Text(String),
    Bytes(#[serde(with = "base64_bytes")] Vec<u8>),
    Json(serde_json::Value),
    Array(Vec<Value>),
}

mod base64_bytes {
    use base64::{engine::general_purpose::STANDARD, Engine};
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S>(bytes: &Vec<u8>, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(&STANDARD.encode(bytes))
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Vec<u8>, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        STANDARD.decode(&s).map_err(serde::de::Error::custom)
    }
}

impl Value {
    pub fn is_null(&self) -> bool {
        matches!(self, Value::Null)
    }

    /// Converts a JSON value coming from an API payload.
    ///
    /// Objects are kept as JSON here; [`Record::flatten`] is responsible for
    /// spreading them into dotted columns.
    pub fn from_json(value: &serde_json::Value) -> Self {
        match value {
            serde_json::Value::Null => Value::Null,
            serde_json::Value::Bool(b) => Value::Bool(*b),
            serde_json::Value::Number(n) => match n.as_i64() {
                Some(i) => Value::Int(i),
                None => n.as_f64().map(Value::Float).unwrap_or(Value::Null),
            },
            serde_json::Value::String(s) => Value::Text(s.clone()),
            other => Value::Json(other.clone()),
        }
    }

    /// Short type label used for inferred column metadata.
    pub fn type_name(&self) -> &'static str {
        match self {
            Value::Null => "null",
            Value::Bool(_) => "boolean",
            Value::Int(_) => "integer",
            Value::Float(_) => "float",
            Value::Text(_) => "text",
            Value::Bytes(_) => "bytes",
            Value::Json(_) => "json",
            Value::Array(_) => "array",
        }
    }

    fn as_number(&self) -> Option<f64> {
        match self {
            Value::Int(i) => Some(*i as f64),
            Value::Float(f) => Some(*f),
            Value::Text(s) => s.trim().parse::<f64>().ok(),
            _ => None,
        }
    }

    /// SQL-style comparison.
    ///
    /// Returns `None` when either side is NULL or the two values cannot be
    /// compared; callers treat that as "predicate not satisfied". Numbers
    /// compare across int/float and against numeric text.
    pub fn compare(&self, other: &Value) -> Option<Ordering> {
        match (self, other) {
            (Value::Null, _) | (_, Value::Null) => None,
            (Value::Int(a), Value::Int(b)) => Some(a.cmp(b)),
            (Value::Int(_) | Value::Float(_), Value::Int(_) | Value::Float(_)) => {
                self.as_number()?.partial_cmp(&other.as_number()?)
            }
            (Value::Int(_) | Value::Float(_), Value::Text(_))
            | (Value::Text(_), Value::Int(_) | Value::Float(_)) => {
                self.as_number()?.partial_cmp(&other.as_number()?)
            }
            (Value::Text(a), Value::Text(b)) => Some(a.cmp(b)),
            (Value::Bool(a), Value::Bool(b)) => Some(a.cmp(b)),
            (Value::Bytes(a), Value::Bytes(b)) => Some(a.cmp(b)),
            (Value::Json(a), Value::Json(b)) => (a == b).then_some(Ordering::Equal),
            (Value::Array(a), Value::Array(b)) => (a == b).then_some(Ordering::Equal),
            _ => None,
        }
    }

    /// Total order used for local sorting: values group by kind (booleans,
    /// numbers, text, bytes, JSON, then NULL) and order within the kind.
    /// Unlike [`compare`](Self::compare), numeric text sorts as text.
    pub fn sort_cmp(&self, other: &Value) -> Ordering {
        match self.sort_rank().cmp(&other.sort_rank()) {
            Ordering::Equal => {}
            ordering => return ordering,
        }
        match (self, other) {
            (Value::Bool(a), Value::Bool(b)) => a.cmp(b),
            (Value::Int(a), Value::Int(b)) => a.cmp(b),
            (Value::Int(_) | Value::Float(_), Value::Int(_) | Value::Float(_)) => {
                let a = self.as_number().unwrap_or(f64::NAN);
                let b = other.as_number().unwrap_or(f64::NAN);
                a.total_cmp(&b)
            }
            (Value::Text(a), Value::Text(b)) => a.cmp(b),
            (Value::Bytes(a), Value::Bytes(b)) => a.cmp(b),
            _ => self.sort_key().cmp(&other.sort_key()),
        }
    }

    fn sort_rank(&self) -> u8 {
        match self {
            Value::Bool(_) => 0,
            Value::Int(_) | Value::Float(_) => 1,
            Value::Text(_) => 2,
            Value::Bytes(_) => 3,
            Value::Json(_) | Value::Array(_) => 4,
            Value::Null => 5,
        }
    }

    fn sort_key(&self) -> String {
        match self {
            Value::Json(j) => j.to_string(),
            Value::Array(items) => serde_json::to_string(items).unwrap_or_default(),
            _ => String::new(),
        }
    }
}

impl From<i64> for Value {
    fn from(v: i64) -> Self {
        Value::Int(v)
    }
}

impl From<i32> for Value {
    fn from(v: i32) -> Self {
        Value::Int(v as i64)
    }
}

impl From<f64> for Value {
    fn from(v: f64) -> Self {
        Value::Float(v)
    }
}

impl From<bool> for Value {
    fn from(v: bool) -> Self {
        Value::Bool(v)
    }
}

impl From<&str> for Value {
    fn from(v: &str) -> Self {
        Value::Text(v.to_string())
    }
}

impl From<String> for Value {
    fn from(v: String) -> Self {
        Value::Text(v)
    }
}

/// Column metadata
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ColumnInfo {
    pub name: String,
    pub data_type: String,
    pub nullable: bool,
}

impl ColumnInfo {
    pub fn new(name: impl Into<String>, data_type: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            data_type: data_type.into(),
            nullable: true,
        }
    }
}

/// A single row of data (indexed by column order)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Row {
    pub values: Vec<Value>,
}

/// One API record: field name to value, in backend order.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Record {
    fields: Vec<(String, Value)>,
}

impl Record {
    pub fn new() -> Self {
        Self::default()
    }

    /// Inserts or replaces a field, keeping the original position on replace.
    pub fn insert(&mut self, name: impl Into<String>, value: Value) {
        let name = name.into();
        match self.fields.iter_mut().find(|(key, _)| *key == name) {
            Some(slot) => slot.1 = value,
            None => self.fields.push((name, value)),
        }
    }

    pub fn with(mut self, name: impl Into<String>, value: impl Into<Value>) -> Self {
        self.insert(name, value.into());
        self
    }

    pub fn get(&self, name: &str) -> Option<&Value> {
        self.fields
            .iter()
            .find(|(key, _)| key == name)
            .map(|(_, value)| value)
    }

    pub fn keys(&self) -> impl Iterator<Item = &str> {
        self.fields.iter().map(|(key, _)| key.as_str())
    }

    pub fn len(&self) -> usize {
        self.fields.len()
    }

    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }

    /// Flattens a JSON object into a record.
    ///
    /// Nested objects become dotted column names (`image.src`); arrays are
    /// kept whole as JSON values.
    pub fn flatten(object: &serde_json::Map<String, serde_json::Value>) -> Self {
        let mut record = Record::new();
        flatten_into(None, object, &mut record);
        record
    }
}

fn flatten_into(
    prefix: Option<&str>,
    object: &serde_json::Map<String, serde_json::Value>,
    out: &mut Record,
) {
    for (key, value) in object {
        let name = match prefix {
            Some(prefix) => format!("{prefix}.{key}"),
            None => key.clone(),
        };
        match value {
            serde_json::Value::Object(inner) if !inner.is_empty() => {
                flatten_into(Some(&name), inner, out);
            }
            other => out.insert(name, Value::from_json(other)),
        }
    }
}

/// Tabular frame: ordered columns plus rows aligned to them.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DataFrame {
    pub columns: Vec<ColumnInfo>,
    pub rows: Vec<Row>,
}

impl DataFrame {
    pub fn new(columns: Vec<ColumnInfo>, rows: Vec<Row>) -> Self {
        Self { columns, rows }
    }

    /// A frame with the given columns and no rows.
    pub fn empty(columns: Vec<ColumnInfo>) -> Self {
        Self {
            columns,
            rows: Vec::new(),
        }
    }

    /// Builds a frame from records, projecting `columns` in order.
    ///
    /// Fields missing from a record become NULL. Column types are inferred
    /// from the first non-null value.
    pub fn from_records<S: AsRef<str>>(columns: &[S], records: &[Record]) -> Self {
        let columns_info = columns
            .iter()
            .map(|name| {
                let name = name.as_ref();
                let data_type = records
                    .iter()
                    .filter_map(|record| record.get(name))
                    .find(|value| !value.is_null())
                    .map(Value::type_name)
                    .unwrap_or("unknown");
                ColumnInfo::new(name, data_type)
            })
            .collect();

        let rows = records
            .iter()
            .map(|record| Row {
                values: columns
                    .iter()
                    .map(|name| record.get(name.as_ref()).cloned().unwrap_or(Value::Null))
                    .collect(),
            })
            .collect();

        Self {
            columns: columns_info,
            rows,
        }
    }

    pub fn column_names(&self) -> Vec<&str> {
        self.columns.iter().map(|c| c.name.as_str()).collect()
    }

    pub fn column_index(&self, name: &str) -> Option<usize> {
        self.columns.iter().position(|c| c.name == name)
    }

    /// Renames a column in place; returns false when `from` is absent.
    pub fn rename_column(&mut self, from: &str, to: &str) -> bool {
        match self.columns.iter_mut().find(|c| c.name == from) {
            Some(column) => {
                column.name = to.to_string();
                true
            }
            None => false,
        }
    }

    pub fn value(&self, row: usize, column: &str) -> Option<&Value> {
        let idx = self.column_index(column)?;
        self.rows.get(row)?.values.get(idx)
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }
}
