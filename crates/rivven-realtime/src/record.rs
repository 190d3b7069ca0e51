//! Record projection
//!
//! Raw source rows are loosely typed JSON objects. [`Projector`] maps them
//! onto the job schema once, producing a [`Record`] of typed
//! [`FieldValue`]s. Nothing past this boundary sees raw rows.
//!
//! Projection is column-isolated: a property that fails coercion is logged
//! and set to null, the rest of the row is kept.

use crate::error::{ReplicationError, Result};
use crate::schema::{Property, PropertyType, Schema};
use chrono::{DateTime, SecondsFormat, Utc};
use serde::ser::SerializeMap;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::warn;

/// A raw row as returned by the source API.
pub type RawRow = serde_json::Map<String, Value>;

/// Column carrying the source's modification timestamp. Some feeds send it
/// as epoch milliseconds instead of ISO8601.
const LAST_MODIFIED_DATE: &str = "LastModifiedDate";

/// Typed value of a projected property.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum FieldValue {
    Null,
    Bool(bool),
    Integer(i64),
    Float(f64),
    String(String),
    /// Nested object or array, kept as JSON text
    Json(String),
}

impl FieldValue {
    /// Plain JSON form used for output and hashing.
    pub fn to_json(&self) -> Value {
        match self {
            Self::Null => Value::Null,
            Self::Bool(b) => Value::Bool(*b),
            Self::Integer(i) => Value::from(*i),
            Self::Float(f) => serde_json::Number::from_f64(*f)
                .map(Value::Number)
                .unwrap_or(Value::Null),
            Self::String(s) => Value::String(s.clone()),
            Self::Json(raw) => {
                serde_json::from_str(raw).unwrap_or_else(|_| Value::String(raw.clone()))
            }
        }
    }

    /// Untyped pass-through of a raw JSON value.
    pub fn from_json(value: &Value) -> Self {
        match value {
            Value::Null => Self::Null,
            Value::Bool(b) => Self::Bool(*b),
            Value::Number(n) => match n.as_i64() {
                Some(i) => Self::Integer(i),
                None => n.as_f64().map(Self::Float).unwrap_or(Self::Null),
            },
            Value::String(s) => Self::String(s.clone()),
            Value::Array(_) | Value::Object(_) => Self::Json(value.to_string()),
        }
    }

    /// Rendering used inside composite fingerprint ids.
    pub fn to_key_string(&self) -> String {
        match self {
            Self::Null => String::new(),
            Self::Bool(b) => b.to_string(),
            Self::Integer(i) => i.to_string(),
            Self::Float(f) => f.to_string(),
            Self::String(s) => s.clone(),
            Self::Json(raw) => raw.clone(),
        }
    }

    pub fn is_null(&self) -> bool {
        matches!(self, Self::Null)
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Self::String(s) => Some(s),
            _ => None,
        }
    }
}

impl From<&str> for FieldValue {
    fn from(value: &str) -> Self {
        Self::String(value.to_string())
    }
}

impl From<String> for FieldValue {
    fn from(value: String) -> Self {
        Self::String(value)
    }
}

impl From<i64> for FieldValue {
    fn from(value: i64) -> Self {
        Self::Integer(value)
    }
}

impl From<bool> for FieldValue {
    fn from(value: bool) -> Self {
        Self::Bool(value)
    }
}

/// An ordered set of projected fields.
///
/// Serializes as a JSON object in schema order, which is also the input
/// to the content hash.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Record {
    fields: Vec<(String, FieldValue)>,
}

impl Record {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            fields: Vec::with_capacity(capacity),
        }
    }

    /// Set a field, replacing an existing value with the same name.
    pub fn insert(&mut self, name: impl Into<String>, value: FieldValue) {
        let name = name.into();
        match self.fields.iter_mut().find(|(n, _)| *n == name) {
            Some((_, slot)) => *slot = value,
            None => self.fields.push((name, value)),
        }
    }

    pub fn with(mut self, name: impl Into<String>, value: impl Into<FieldValue>) -> Self {
        self.insert(name, value.into());
        self
    }

    pub fn get(&self, name: &str) -> Option<&FieldValue> {
        self.fields.iter().find(|(n, _)| n == name).map(|(_, v)| v)
    }

    pub fn len(&self) -> usize {
        self.fields.len()
    }

    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &FieldValue)> {
        self.fields.iter().map(|(n, v)| (n.as_str(), v))
    }

    pub fn into_fields(self) -> Vec<(String, FieldValue)> {
        self.fields
    }

    pub fn to_json(&self) -> Value {
        let map = self
            .fields
            .iter()
            .map(|(n, v)| (n.clone(), v.to_json()))
            .collect::<serde_json::Map<_, _>>();
        Value::Object(map)
    }
}

impl From<Vec<(String, FieldValue)>> for Record {
    fn from(fields: Vec<(String, FieldValue)>) -> Self {
        Self { fields }
    }
}

impl Serialize for Record {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        let mut map = serializer.serialize_map(Some(self.fields.len()))?;
        for (name, value) in &self.fields {
            map.serialize_entry(name, &value.to_json())?;
        }
        map.end()
    }
}

/// Result of projecting one raw row.
#[derive(Debug, Clone, PartialEq)]
pub struct Projection {
    /// Every schema property, in schema order
    pub record: Record,
    /// Key properties only
    pub keys: Record,
    /// Number of properties nulled because they failed coercion
    pub malformed: usize,
}

/// Maps raw rows onto a schema.
#[derive(Debug, Clone)]
pub struct Projector {
    properties: Vec<Property>,
    key_flags: Vec<bool>,
}

impl Projector {
    pub fn new(schema: &Schema) -> Self {
        let key_flags = schema
            .properties
            .iter()
            .map(|p| schema.key_policy.is_key(p))
            .collect();
        Self {
            properties: schema.properties.clone(),
            key_flags,
        }
    }

    /// Key property names in schema order.
    pub fn key_names(&self) -> impl Iterator<Item = &str> {
        self.properties
            .iter()
            .zip(&self.key_flags)
            .filter(|(_, is_key)| **is_key)
            .map(|(p, _)| p.id.as_str())
    }

    /// Project a raw row. Never fails as a whole.
    pub fn project(&self, raw: &RawRow) -> Projection {
        let mut record = Record::with_capacity(self.properties.len());
        let mut keys = Record::new();
        let mut malformed = 0;

        for (property, is_key) in self.properties.iter().zip(&self.key_flags) {
            let value = match raw.get(&property.id) {
                None | Some(Value::Null) => FieldValue::Null,
                Some(raw_value) => match coerce(property, raw_value) {
                    Ok(value) => value,
                    Err(e) => {
                        warn!(property = %property.id, error = %e, "Malformed field set to null");
                        malformed += 1;
                        FieldValue::Null
                    }
                },
            };

            if *is_key {
                keys.insert(property.id.clone(), value.clone());
            }
            record.insert(property.id.clone(), value);
        }

        Projection {
            record,
            keys,
            malformed,
        }
    }
}

/// Coerce a single non-null raw value to the property's declared type.
fn coerce(property: &Property, raw: &Value) -> Result<FieldValue> {
    let repaired;
    let raw = if property.id == LAST_MODIFIED_DATE && raw.is_i64() {
        repaired = repair_epoch_millis(property, raw)?;
        &repaired
    } else {
        raw
    };

    match &property.property_type {
        ty if ty.is_stringly() => Ok(FieldValue::String(stringify(raw))),
        PropertyType::Integer => match raw {
            Value::Number(n) => n
                .as_i64()
                .map(FieldValue::Integer)
                .ok_or_else(|| ReplicationError::projection(&property.id, format!("{} is not an integer", n))),
            Value::String(s) => s
                .trim()
                .parse::<i64>()
                .map(FieldValue::Integer)
                .map_err(|e| ReplicationError::projection(&property.id, e.to_string())),
            other => Err(mismatch(property, other)),
        },
        PropertyType::Float => match raw {
            Value::Number(n) => n
                .as_f64()
                .map(FieldValue::Float)
                .ok_or_else(|| ReplicationError::projection(&property.id, format!("{} is not a float", n))),
            Value::String(s) => s
                .trim()
                .parse::<f64>()
                .map(FieldValue::Float)
                .map_err(|e| ReplicationError::projection(&property.id, e.to_string())),
            other => Err(mismatch(property, other)),
        },
        PropertyType::Bool => match raw {
            Value::Bool(b) => Ok(FieldValue::Bool(*b)),
            Value::String(s) if s.eq_ignore_ascii_case("true") => Ok(FieldValue::Bool(true)),
            Value::String(s) if s.eq_ignore_ascii_case("false") => Ok(FieldValue::Bool(false)),
            other => Err(mismatch(property, other)),
        },
        _ => Ok(FieldValue::from_json(raw)),
    }
}

fn repair_epoch_millis(property: &Property, raw: &Value) -> Result<Value> {
    let millis = raw
        .as_i64()
        .ok_or_else(|| ReplicationError::projection(&property.id, "epoch is not an integer"))?;
    let ts = DateTime::<Utc>::from_timestamp_millis(millis).ok_or_else(|| {
        ReplicationError::projection(&property.id, format!("epoch {} out of range", millis))
    })?;
    Ok(Value::String(ts.to_rfc3339_opts(SecondsFormat::Millis, true)))
}

fn stringify(raw: &Value) -> String {
    match raw {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

fn mismatch(property: &Property, raw: &Value) -> ReplicationError {
    ReplicationError::projection(
        &property.id,
        format!("cannot coerce {} to {:?}", raw, property.property_type),
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::KeyPolicy;
    use serde_json::json;

    fn row(value: Value) -> RawRow {
        value.as_object().cloned().unwrap()
    }

    fn schema() -> Schema {
        Schema::new("Opportunity")
            .with_property(Property::new("Id", PropertyType::String).key())
            .with_property(Property::new("Name", PropertyType::String))
            .with_property(Property::new("Amount", PropertyType::Decimal))
            .with_property(Property::new("Quantity", PropertyType::Integer))
            .with_property(Property::new("IsWon", PropertyType::Bool))
            .with_property(Property::new("LastModifiedDate", PropertyType::Datetime))
    }

    #[test]
    fn test_string_types_are_stringified() {
        let projection = Projector::new(&schema()).project(&row(json!({
            "Id": "006A",
            "Name": "Big deal",
            "Amount": 1500.5,
            "Quantity": 3,
            "IsWon": true,
            "LastModifiedDate": "2024-03-01T10:00:00.000+0000"
        })));

        let record = projection.record;
        assert_eq!(record.get("Amount"), Some(&FieldValue::String("1500.5".into())));
        assert_eq!(record.get("Quantity"), Some(&FieldValue::Integer(3)));
        assert_eq!(record.get("IsWon"), Some(&FieldValue::Bool(true)));
        assert_eq!(
            record.get("LastModifiedDate"),
            Some(&FieldValue::String("2024-03-01T10:00:00.000+0000".into()))
        );
        assert_eq!(projection.malformed, 0);
    }

    #[test]
    fn test_missing_columns_become_null() {
        let projection = Projector::new(&schema()).project(&row(json!({ "Id": "006A" })));

        assert_eq!(projection.record.len(), 6);
        assert!(projection.record.get("Name").unwrap().is_null());
        assert!(projection.record.get("Quantity").unwrap().is_null());
        assert_eq!(projection.malformed, 0);
    }

    #[test]
    fn test_malformed_field_does_not_drop_row() {
        let projection = Projector::new(&schema()).project(&row(json!({
            "Id": "006A",
            "Name": "Deal",
            "Quantity": "many",
            "IsWon": {"nested": true}
        })));

        assert_eq!(projection.malformed, 2);
        assert!(projection.record.get("Quantity").unwrap().is_null());
        assert!(projection.record.get("IsWon").unwrap().is_null());
        assert_eq!(projection.record.get("Name"), Some(&FieldValue::String("Deal".into())));
        assert_eq!(projection.keys.get("Id"), Some(&FieldValue::String("006A".into())));
    }

    #[test]
    fn test_epoch_millis_last_modified_is_repaired() {
        let projection = Projector::new(&schema()).project(&row(json!({
            "Id": "006A",
            "LastModifiedDate": 1_700_000_000_000i64
        })));

        assert_eq!(
            projection.record.get("LastModifiedDate"),
            Some(&FieldValue::String("2023-11-14T22:13:20.000Z".into()))
        );
    }

    #[test]
    fn test_keys_follow_policy() {
        let schema = Schema::new("Lead")
            .with_key_policy(KeyPolicy::IdName)
            .with_property(Property::new("Id", PropertyType::String))
            .with_property(Property::new("Email", PropertyType::String).key());
        let projector = Projector::new(&schema);

        assert_eq!(projector.key_names().collect::<Vec<_>>(), vec!["Id"]);
        let projection = projector.project(&row(json!({ "Id": "00Q1", "Email": "a@b.c" })));
        assert_eq!(projection.keys.len(), 1);
        assert!(projection.keys.get("Email").is_none());
    }

    #[test]
    fn test_numeric_strings_coerce_to_integer() {
        let projection = Projector::new(&schema()).project(&row(json!({
            "Id": "006A",
            "Quantity": " 42 ",
            "IsWon": "FALSE"
        })));
        assert_eq!(projection.record.get("Quantity"), Some(&FieldValue::Integer(42)));
        assert_eq!(projection.record.get("IsWon"), Some(&FieldValue::Bool(false)));
    }

    #[test]
    fn test_record_serializes_in_schema_order() {
        let record = Record::new()
            .with("Id", "1")
            .with("Name", "A")
            .with("Count", 2i64);

        assert_eq!(
            serde_json::to_string(&record).unwrap(),
            r#"{"Id":"1","Name":"A","Count":2}"#
        );
        assert_eq!(record.to_json(), json!({"Id": "1", "Name": "A", "Count": 2}));
    }

    #[test]
    fn test_json_values_round_trip_to_output() {
        let value = FieldValue::from_json(&json!({"street": "Main"}));
        assert_eq!(value.to_json(), json!({"street": "Main"}));
        assert_eq!(FieldValue::Null.to_key_string(), "");
        assert_eq!(FieldValue::Integer(7).to_key_string(), "7");
    }
}
