// ABOUTME: Record model for tracked entity instances extracted from the source system
// ABOUTME: Defines field values, the (event_time, entity_id) key and exact value equality

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

/// A single business field value of a tracked entity.
///
/// Numeric values are carried as `Int` or `Decimal` so that equality is exact:
/// `Decimal(1.50)` equals `Decimal(1.5)` and `Int(2)` equals `Decimal(2.0)`, but no
/// floating-point approximation is ever involved.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "value", rename_all = "snake_case")]
pub enum FieldValue {
    Null,
    Bool(bool),
    Int(i64),
    Decimal(Decimal),
    Text(String),
    Timestamp(DateTime<Utc>),
    Json(serde_json::Value),
}

impl FieldValue {
    /// Compare two values the way the change detector does.
    ///
    /// Integers and decimals compare numerically with exact decimal arithmetic,
    /// every other combination compares structurally.
    pub fn same_value(&self, other: &FieldValue) -> bool {
        match (self, other) {
            (FieldValue::Int(a), FieldValue::Decimal(b)) => Decimal::from(*a) == *b,
            (FieldValue::Decimal(a), FieldValue::Int(b)) => *a == Decimal::from(*b),
            (a, b) => a == b,
        }
    }

    /// Render the value as text for binding into a SQL statement.
    ///
    /// Returns `None` for SQL NULL.
    pub fn to_sql_text(&self) -> Option<String> {
        match self {
            FieldValue::Null => None,
            FieldValue::Bool(v) => Some(v.to_string()),
            FieldValue::Int(v) => Some(v.to_string()),
            FieldValue::Decimal(v) => Some(v.to_string()),
            FieldValue::Text(v) => Some(v.clone()),
            FieldValue::Timestamp(v) => Some(v.to_rfc3339()),
            FieldValue::Json(v) => Some(v.to_string()),
        }
    }

    pub fn is_null(&self) -> bool {
        matches!(self, FieldValue::Null)
    }
}

impl From<i64> for FieldValue {
    fn from(value: i64) -> Self {
        FieldValue::Int(value)
    }
}

impl From<Decimal> for FieldValue {
    fn from(value: Decimal) -> Self {
        FieldValue::Decimal(value)
    }
}

impl From<bool> for FieldValue {
    fn from(value: bool) -> Self {
        FieldValue::Bool(value)
    }
}

impl From<&str> for FieldValue {
    fn from(value: &str) -> Self {
        FieldValue::Text(value.to_string())
    }
}

impl From<String> for FieldValue {
    fn from(value: String) -> Self {
        FieldValue::Text(value)
    }
}

impl From<DateTime<Utc>> for FieldValue {
    fn from(value: DateTime<Utc>) -> Self {
        FieldValue::Timestamp(value)
    }
}

/// Total order cursor over extracted rows.
///
/// Ordered by `event_time` first and `entity_id` second. `entity_id` uses the
/// byte-wise ordering of `String`, which matches `COLLATE "C"` on the source side.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct RecordKey {
    pub event_time: DateTime<Utc>,
    pub entity_id: String,
}

impl RecordKey {
    pub fn new(event_time: DateTime<Utc>, entity_id: impl Into<String>) -> Self {
        Self {
            event_time,
            entity_id: entity_id.into(),
        }
    }
}

impl fmt::Display for RecordKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "({}, {})", self.event_time.to_rfc3339(), self.entity_id)
    }
}

/// One row of one entity type as seen at the source.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Record {
    /// Stable identifier, unique within the entity type
    pub entity_id: String,
    /// The source system's own update/insert timestamp
    pub event_time: DateTime<Utc>,
    /// Mutable business fields keyed by source column name
    pub fields: BTreeMap<String, FieldValue>,
}

impl Record {
    pub fn new(entity_id: impl Into<String>, event_time: DateTime<Utc>) -> Self {
        Self {
            entity_id: entity_id.into(),
            event_time,
            fields: BTreeMap::new(),
        }
    }

    /// Builder-style field setter.
    pub fn with_field(mut self, name: impl Into<String>, value: impl Into<FieldValue>) -> Self {
        self.fields.insert(name.into(), value.into());
        self
    }

    pub fn field(&self, name: &str) -> Option<&FieldValue> {
        self.fields.get(name)
    }

    pub fn key(&self) -> RecordKey {
        RecordKey::new(self.event_time, self.entity_id.clone())
    }

    /// Full-record equality: same id, same field set, every field `same_value`.
    ///
    /// `compare_event_time` decides whether the entity's own reported time takes
    /// part in the comparison.
    pub fn same_as(&self, other: &Record, compare_event_time: bool) -> bool {
        if self.entity_id != other.entity_id {
            return false;
        }
        if compare_event_time && self.event_time != other.event_time {
            return false;
        }
        if self.fields.len() != other.fields.len() {
            return false;
        }
        self.fields.iter().all(|(name, value)| {
            other
                .fields
                .get(name)
                .is_some_and(|other_value| value.same_value(other_value))
        })
    }
}
