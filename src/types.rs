//! Universal data types for the rowloom engine
//!
//! These types are the normalized representation shared by every
//! sub-source: values, bound parameters, rows, column metadata and the
//! positional mappings that wire a subquery node into the engine-level
//! index spaces.

use std::collections::{BTreeMap, HashMap};

use chrono::{DateTime, FixedOffset, NaiveDate, NaiveTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Unique identifier for an open session
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SessionId(pub Uuid);

impl SessionId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for SessionId {
    fn default() -> Self {
        Self::new()
    }
}

/// Unique identifier for a statement
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct StatementId(pub Uuid);

impl StatementId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for StatementId {
    fn default() -> Self {
        Self::new()
    }
}

/// Unique identifier for a cursor
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct CursorId(pub Uuid);

impl CursorId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for CursorId {
    fn default() -> Self {
        Self::new()
    }
}

/// Universal value representation
///
/// `Null` is a first-class SQL NULL, not an error or an absence marker.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Value {
    Null,
    Bool(bool),
    Int(i64),
    Float(f64),
    Decimal(Decimal),
    Date(NaiveDate),
    Time(NaiveTime),
    Timestamp(DateTime<Utc>),
    Uuid(Uuid),
    Text(String),
    Bytes(#[serde(with = "base64_bytes")] Vec<u8>),
    Json(serde_json::Value),
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

    /// Canonical string rendering, used for text-backend parameter
    /// substitution and as the fallback for string conversions.
    /// NULL renders as the empty string on the wire.
    pub fn text_form(&self) -> String {
        match self {
            Value::Null => String::new(),
            Value::Bool(b) => b.to_string(),
            Value::Int(i) => i.to_string(),
            Value::Float(f) => f.to_string(),
            Value::Decimal(d) => d.to_string(),
            Value::Date(d) => d.format("%Y-%m-%d").to_string(),
            Value::Time(t) => t.format("%H:%M:%S").to_string(),
            Value::Timestamp(ts) => ts.to_rfc3339(),
            Value::Uuid(u) => u.to_string(),
            Value::Text(s) => s.clone(),
            Value::Bytes(b) => String::from_utf8_lossy(b).into_owned(),
            Value::Json(j) => j.to_string(),
        }
    }

    /// Short type label used in conversion error messages.
    pub fn kind_name(&self) -> &'static str {
        match self {
            Value::Null => "null",
            Value::Bool(_) => "bool",
            Value::Int(_) => "int",
            Value::Float(_) => "float",
            Value::Decimal(_) => "decimal",
            Value::Date(_) => "date",
            Value::Time(_) => "time",
            Value::Timestamp(_) => "timestamp",
            Value::Uuid(_) => "uuid",
            Value::Text(_) => "text",
            Value::Bytes(_) => "bytes",
            Value::Json(_) => "json",
        }
    }
}

/// Declared type tag for a bound parameter.
///
/// `Inferred` passes the payload through using its own `Value` variant.
/// The stream variants carry their payload as bytes plus a declared
/// length hint and are rendered/bound from that prefix.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ParamKind {
    Inferred,
    Bool,
    Int,
    Float,
    Decimal,
    Text,
    Bytes,
    Date,
    Time,
    Timestamp,
    Uuid,
    Json,
    AsciiStream,
    BinaryStream,
    CharacterStream,
}

/// Optional conversion hint attached to a parameter.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub enum ParamHint {
    /// Declared length for streamed payloads.
    DeclaredLen(usize),
    /// Calendar offset for temporal values, in seconds east of UTC.
    OffsetSecs(i32),
}

/// One bound engine-level parameter. Immutable once bound.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Param {
    value: Value,
    kind: ParamKind,
    hint: Option<ParamHint>,
}

impl Param {
    pub fn new(value: Value, kind: ParamKind) -> Self {
        Self {
            value,
            kind,
            hint: None,
        }
    }

    pub fn inferred(value: Value) -> Self {
        Self::new(value, ParamKind::Inferred)
    }

    pub fn with_hint(mut self, hint: ParamHint) -> Self {
        self.hint = Some(hint);
        self
    }

    pub fn value(&self) -> &Value {
        &self.value
    }

    pub fn kind(&self) -> ParamKind {
        self.kind
    }

    pub fn hint(&self) -> Option<&ParamHint> {
        self.hint.as_ref()
    }

    /// Renders the parameter for a text backend.
    ///
    /// Stream payloads are cut to their declared length; temporal values
    /// honor an offset hint. Everything else falls back to the value's
    /// canonical text form.
    pub fn text_form(&self) -> String {
        match (self.kind, &self.value) {
            (
                ParamKind::AsciiStream | ParamKind::BinaryStream | ParamKind::CharacterStream,
                Value::Bytes(bytes),
            ) => {
                let len = match self.hint {
                    Some(ParamHint::DeclaredLen(n)) => n.min(bytes.len()),
                    _ => bytes.len(),
                };
                String::from_utf8_lossy(&bytes[..len]).into_owned()
            }
            (_, Value::Timestamp(ts)) => match self.hint {
                Some(ParamHint::OffsetSecs(secs)) => match FixedOffset::east_opt(secs) {
                    Some(off) => ts.with_timezone(&off).to_rfc3339(),
                    None => ts.to_rfc3339(),
                },
                _ => ts.to_rfc3339(),
            },
            (_, v) => v.text_form(),
        }
    }

    /// Resolves the value used for native relational binding. Stream
    /// payloads collapse to their declared-length prefix; other values
    /// bind as-is.
    pub fn bind_value(&self) -> Value {
        match (self.kind, &self.value) {
            (ParamKind::AsciiStream | ParamKind::CharacterStream, Value::Bytes(bytes)) => {
                let len = match self.hint {
                    Some(ParamHint::DeclaredLen(n)) => n.min(bytes.len()),
                    _ => bytes.len(),
                };
                Value::Text(String::from_utf8_lossy(&bytes[..len]).into_owned())
            }
            (ParamKind::BinaryStream, Value::Bytes(bytes)) => {
                let len = match self.hint {
                    Some(ParamHint::DeclaredLen(n)) => n.min(bytes.len()),
                    _ => bytes.len(),
                };
                Value::Bytes(bytes[..len].to_vec())
            }
            _ => self.value.clone(),
        }
    }
}

/// A single logical output row: a fixed-width tuple of values, produced
/// fresh for every output row and never mutated afterwards.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Row {
    pub values: Vec<Value>,
}

impl Row {
    pub fn new(values: Vec<Value>) -> Self {
        Self { values }
    }

    pub fn width(&self) -> usize {
        self.values.len()
    }

    /// 1-based access.
    pub fn get(&self, index: usize) -> Option<&Value> {
        if index == 0 {
            return None;
        }
        self.values.get(index - 1)
    }
}

/// Column metadata for one engine-level output column.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ColumnInfo {
    pub name: String,
    pub type_name: String,
    pub nullable: bool,
    pub precision: u32,
    pub scale: u32,
    /// Backend location the column came from, if known.
    pub location: Option<String>,
    /// Dataset the column came from, if known.
    pub dataset: Option<String>,
}

impl ColumnInfo {
    /// The default descriptor used when a node supplies nothing richer.
    pub fn generic_string(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            type_name: "string".to_string(),
            nullable: true,
            precision: 0,
            scale: 0,
            location: None,
            dataset: None,
        }
    }
}

/// A finite partial bijection between 1-based local indices and 1-based
/// indices in another index space. Set once at compile time, immutable
/// for the node's lifetime. Iteration is ascending by local index, so
/// collisions on the remote side resolve last-mapped-wins.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PosMapping(BTreeMap<usize, usize>);

impl PosMapping {
    pub fn new() -> Self {
        Self(BTreeMap::new())
    }

    /// Builds a mapping from `(local, remote)` pairs. Indices are 1-based;
    /// a zero index is a compiler bug, not a recoverable condition.
    pub fn from_pairs<I: IntoIterator<Item = (usize, usize)>>(pairs: I) -> Self {
        let mut map = BTreeMap::new();
        for (local, remote) in pairs {
            assert!(local >= 1 && remote >= 1, "mapping indices are 1-based");
            map.insert(local, remote);
        }
        Self(map)
    }

    pub fn get(&self, local: usize) -> Option<usize> {
        self.0.get(&local).copied()
    }

    /// Ascending iteration by local index.
    pub fn iter(&self) -> impl Iterator<Item = (usize, usize)> + '_ {
        self.0.iter().map(|(l, r)| (*l, *r))
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Width of the remote tuple this mapping populates (the highest
    /// remote index it touches).
    pub fn remote_width(&self) -> usize {
        self.0.values().copied().max().unwrap_or(0)
    }
}

/// Hashable form of an exported-value tuple, used as the memoization key
/// for correlated child execution. Floats compare by bit pattern so NaN
/// keys are self-equal; JSON keys compare by canonical rendering.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CorrelationKey(Vec<KeyPart>);

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
enum KeyPart {
    Null,
    Bool(bool),
    Int(i64),
    FloatBits(u64),
    Decimal(Decimal),
    Date(NaiveDate),
    Time(NaiveTime),
    Timestamp(DateTime<Utc>),
    Uuid(Uuid),
    Text(String),
    Bytes(Vec<u8>),
    Json(String),
}

impl CorrelationKey {
    pub fn from_values(values: &[Value]) -> Self {
        Self(
            values
                .iter()
                .map(|v| match v {
                    Value::Null => KeyPart::Null,
                    Value::Bool(b) => KeyPart::Bool(*b),
                    Value::Int(i) => KeyPart::Int(*i),
                    Value::Float(f) => KeyPart::FloatBits(f.to_bits()),
                    Value::Decimal(d) => KeyPart::Decimal(*d),
                    Value::Date(d) => KeyPart::Date(*d),
                    Value::Time(t) => KeyPart::Time(*t),
                    Value::Timestamp(ts) => KeyPart::Timestamp(*ts),
                    Value::Uuid(u) => KeyPart::Uuid(*u),
                    Value::Text(s) => KeyPart::Text(s.clone()),
                    Value::Bytes(b) => KeyPart::Bytes(b.clone()),
                    Value::Json(j) => KeyPart::Json(j.to_string()),
                })
                .collect(),
        )
    }
}

/// Target kind a backend type name can be coerced to through the
/// session-wide type map.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TargetKind {
    Text,
    Int,
    Float,
    Bool,
}

/// Session-wide map from backend type names to coercion targets,
/// consulted during relational value extraction.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TypeMap(HashMap<String, TargetKind>);

impl TypeMap {
    pub fn new() -> Self {
        Self(HashMap::new())
    }

    pub fn insert(&mut self, type_name: impl Into<String>, target: TargetKind) {
        self.0.insert(type_name.into(), target);
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Applies the mapped coercion for `type_name`, if any. Values that
    /// cannot be coerced are passed through unchanged; NULL always stays
    /// NULL.
    pub fn apply(&self, type_name: &str, value: Value) -> Value {
        let Some(target) = self.0.get(type_name) else {
            return value;
        };
        if value.is_null() {
            return value;
        }
        match target {
            TargetKind::Text => Value::Text(value.text_form()),
            TargetKind::Int => match &value {
                Value::Int(_) => value,
                Value::Bool(b) => Value::Int(*b as i64),
                Value::Float(f) => Value::Int(*f as i64),
                Value::Text(s) => s.trim().parse::<i64>().map(Value::Int).unwrap_or(value),
                _ => value,
            },
            TargetKind::Float => match &value {
                Value::Float(_) => value,
                Value::Int(i) => Value::Float(*i as f64),
                Value::Text(s) => s.trim().parse::<f64>().map(Value::Float).unwrap_or(value),
                _ => value,
            },
            TargetKind::Bool => match &value {
                Value::Bool(_) => value,
                Value::Int(i) => Value::Bool(*i != 0),
                Value::Text(s) => match s.trim() {
                    "true" | "1" => Value::Bool(true),
                    "false" | "0" => Value::Bool(false),
                    _ => value,
                },
                _ => value,
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn text_form_renders_null_as_empty() {
        assert_eq!(Value::Null.text_form(), "");
        assert_eq!(Value::Int(42).text_form(), "42");
        assert_eq!(Value::Text("a\tb".into()).text_form(), "a\tb");
    }

    #[test]
    fn stream_param_honors_declared_length() {
        let p = Param::new(
            Value::Bytes(b"hello world".to_vec()),
            ParamKind::AsciiStream,
        )
        .with_hint(ParamHint::DeclaredLen(5));
        assert_eq!(p.text_form(), "hello");
    }

    #[test]
    fn mapping_iterates_ascending_and_reports_remote_width() {
        let m = PosMapping::from_pairs([(3, 1), (1, 5), (2, 2)]);
        let locals: Vec<usize> = m.iter().map(|(l, _)| l).collect();
        assert_eq!(locals, vec![1, 2, 3]);
        assert_eq!(m.remote_width(), 5);
        assert_eq!(m.get(3), Some(1));
        assert_eq!(m.get(4), None);
    }

    #[test]
    fn correlation_keys_compare_by_value() {
        let a = CorrelationKey::from_values(&[Value::Int(1), Value::Text("x".into())]);
        let b = CorrelationKey::from_values(&[Value::Int(1), Value::Text("x".into())]);
        let c = CorrelationKey::from_values(&[Value::Int(2), Value::Text("x".into())]);
        assert_eq!(a, b);
        assert_ne!(a, c);

        let nan1 = CorrelationKey::from_values(&[Value::Float(f64::NAN)]);
        let nan2 = CorrelationKey::from_values(&[Value::Float(f64::NAN)]);
        assert_eq!(nan1, nan2);
    }

    #[test]
    fn type_map_coerces_by_type_name() {
        let mut map = TypeMap::new();
        map.insert("BIGINT", TargetKind::Text);
        assert_eq!(
            map.apply("BIGINT", Value::Int(7)),
            Value::Text("7".to_string())
        );
        assert_eq!(map.apply("BIGINT", Value::Null), Value::Null);
        assert_eq!(map.apply("VARCHAR", Value::Int(7)), Value::Int(7));
    }
}
