//! Checkpoint cursors.
//!
//! A cursor is a flat mapping of named fields to scalar values, stored as
//! compact JSON. Values JSON cannot represent natively are wrapped as
//! `{"type": ..., "value": ...}`:
//!
//! ```text
//! {"captured_at":{"type":"datetime","value":"2019-10-21T04:00:00Z"},"feed_id":"26"}
//! ```
//!
//! `Cursor::loads(&cursor.dumps()?)` always yields the original cursor.

use std::collections::BTreeMap;

use chrono::{DateTime, SecondsFormat, Utc};
use serde_json::{Map, Value};

use crate::error::CheckpointError;
use crate::model::SnapshotKey;

const TYPE_KEY: &str = "type";
const VALUE_KEY: &str = "value";
const DATETIME: &str = "datetime";
const DICT: &str = "dict";

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CursorValue {
    Null,
    Bool(bool),
    Integer(i64),
    Text(String),
    Timestamp(DateTime<Utc>),
    Map(BTreeMap<String, CursorValue>),
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Cursor {
    fields: BTreeMap<String, CursorValue>,
}

impl Cursor {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, name: &str, value: CursorValue) -> Self {
        self.fields.insert(name.to_string(), value);
        self
    }

    pub fn get(&self, name: &str) -> Option<&CursorValue> {
        self.fields.get(name)
    }

    pub fn dumps(&self) -> Result<String, CheckpointError> {
        Ok(serde_json::to_string(&encode_map(&self.fields))?)
    }

    pub fn loads(text: &str) -> Result<Self, CheckpointError> {
        match serde_json::from_str::<Value>(text)? {
            Value::Object(object) => Ok(Self {
                fields: decode_map(&object)?,
            }),
            _ => Err(CheckpointError::NotAnObject),
        }
    }
}

fn wrap(kind: &str, value: Value) -> Value {
    let mut object = Map::new();
    object.insert(TYPE_KEY.to_string(), Value::String(kind.to_string()));
    object.insert(VALUE_KEY.to_string(), value);
    Value::Object(object)
}

fn encode_map(fields: &BTreeMap<String, CursorValue>) -> Value {
    Value::Object(
        fields
            .iter()
            .map(|(name, value)| (name.clone(), encode(value)))
            .collect(),
    )
}

fn encode(value: &CursorValue) -> Value {
    match value {
        CursorValue::Null => Value::Null,
        CursorValue::Bool(b) => Value::Bool(*b),
        CursorValue::Integer(i) => Value::from(*i),
        CursorValue::Text(s) => Value::String(s.clone()),
        CursorValue::Timestamp(ts) => wrap(
            DATETIME,
            Value::String(ts.to_rfc3339_opts(SecondsFormat::AutoSi, true)),
        ),
        CursorValue::Map(fields) => wrap(DICT, encode_map(fields)),
    }
}

fn decode_map(object: &Map<String, Value>) -> Result<BTreeMap<String, CursorValue>, CheckpointError> {
    object
        .iter()
        .map(|(name, value)| Ok((name.clone(), decode(value)?)))
        .collect()
}

fn unsupported(kind: &str, value: &Value) -> CheckpointError {
    CheckpointError::UnsupportedType {
        kind: kind.to_string(),
        value: value.to_string(),
    }
}

fn decode(value: &Value) -> Result<CursorValue, CheckpointError> {
    match value {
        Value::Null => Ok(CursorValue::Null),
        Value::Bool(b) => Ok(CursorValue::Bool(*b)),
        Value::Number(n) => n
            .as_i64()
            .map(CursorValue::Integer)
            .ok_or_else(|| unsupported("number", value)),
        Value::String(s) => Ok(CursorValue::Text(s.clone())),
        Value::Array(_) => Err(unsupported("array", value)),
        Value::Object(object) => match (object.get(TYPE_KEY), object.get(VALUE_KEY)) {
            (Some(Value::String(kind)), Some(inner)) if object.len() == 2 => {
                decode_wrapped(kind, inner)
            }
            _ => Err(unsupported("object", value)),
        },
    }
}

fn decode_wrapped(kind: &str, inner: &Value) -> Result<CursorValue, CheckpointError> {
    match (kind, inner) {
        (DATETIME, Value::String(text)) => DateTime::parse_from_rfc3339(text)
            .map(|ts| CursorValue::Timestamp(ts.with_timezone(&Utc)))
            .map_err(|_| CheckpointError::InvalidTimestamp(text.clone())),
        (DICT, Value::Object(fields)) => Ok(CursorValue::Map(decode_map(fields)?)),
        _ => Err(unsupported(kind, inner)),
    }
}

impl From<&SnapshotKey> for Cursor {
    fn from(key: &SnapshotKey) -> Self {
        Cursor::new()
            .with("captured_at", CursorValue::Timestamp(key.captured_at))
            .with("feed_id", CursorValue::Text(key.feed_id.clone()))
    }
}

impl TryFrom<&Cursor> for SnapshotKey {
    type Error = CheckpointError;

    fn try_from(cursor: &Cursor) -> Result<Self, Self::Error> {
        let captured_at = match cursor.get("captured_at") {
            Some(CursorValue::Timestamp(ts)) => *ts,
            Some(_) => return Err(CheckpointError::WrongType { field: "captured_at" }),
            None => return Err(CheckpointError::MissingField("captured_at")),
        };
        let feed_id = match cursor.get("feed_id") {
            Some(CursorValue::Text(id)) => id.clone(),
            Some(_) => return Err(CheckpointError::WrongType { field: "feed_id" }),
            None => return Err(CheckpointError::MissingField("feed_id")),
        };
        Ok(SnapshotKey { captured_at, feed_id })
    }
}

/// Serialized cursor for a snapshot ordering key.
pub fn dump_snapshot_key(key: &SnapshotKey) -> Result<String, CheckpointError> {
    Cursor::from(key).dumps()
}

pub fn load_snapshot_key(text: &str) -> Result<SnapshotKey, CheckpointError> {
    SnapshotKey::try_from(&Cursor::loads(text)?)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn key() -> SnapshotKey {
        SnapshotKey {
            captured_at: DateTime::from_timestamp(1_571_630_400, 123_456_000).unwrap(),
            feed_id: "26".into(),
        }
    }

    #[test]
    fn test_snapshot_key_cursor_format() {
        let text = dump_snapshot_key(&SnapshotKey {
            captured_at: DateTime::from_timestamp(1_571_630_400, 0).unwrap(),
            feed_id: "26".into(),
        })
        .unwrap();
        assert_eq!(
            text,
            r#"{"captured_at":{"type":"datetime","value":"2019-10-21T04:00:00Z"},"feed_id":"26"}"#
        );
    }

    #[test]
    fn test_round_trip_preserves_subsecond_precision() {
        let text = dump_snapshot_key(&key()).unwrap();
        assert_eq!(load_snapshot_key(&text).unwrap(), key());
    }

    #[test]
    fn test_round_trip_nested_values() {
        let nested = BTreeMap::from([
            ("page".to_string(), CursorValue::Integer(-3)),
            ("at".to_string(), CursorValue::Timestamp(key().captured_at)),
        ]);
        let cursor = Cursor::new()
            .with("done", CursorValue::Bool(false))
            .with("note", CursorValue::Null)
            .with("name", CursorValue::Text("replay".into()))
            .with("inner", CursorValue::Map(nested));

        let text = cursor.dumps().unwrap();
        assert_eq!(Cursor::loads(&text).unwrap(), cursor);
    }

    #[test]
    fn test_rejects_unknown_wrapped_type() {
        let err = Cursor::loads(r#"{"x":{"type":"decimal","value":"1.5"}}"#).unwrap_err();
        assert!(matches!(err, CheckpointError::UnsupportedType { ref kind, .. } if kind == "decimal"));
    }

    #[test]
    fn test_rejects_non_object_and_garbage() {
        assert!(matches!(Cursor::loads("[1, 2]"), Err(CheckpointError::NotAnObject)));
        assert!(matches!(Cursor::loads("{not json"), Err(CheckpointError::Malformed(_))));
        assert!(matches!(
            Cursor::loads(r#"{"x":1.5}"#),
            Err(CheckpointError::UnsupportedType { .. })
        ));
    }

    #[test]
    fn test_snapshot_key_field_errors() {
        assert!(matches!(
            load_snapshot_key(r#"{"feed_id":"1"}"#),
            Err(CheckpointError::MissingField("captured_at"))
        ));
        assert!(matches!(
            load_snapshot_key(r#"{"captured_at":"yesterday","feed_id":"1"}"#),
            Err(CheckpointError::WrongType { field: "captured_at" })
        ));
        assert!(matches!(
            load_snapshot_key(r#"{"captured_at":{"type":"datetime","value":"nope"},"feed_id":"1"}"#),
            Err(CheckpointError::InvalidTimestamp(_))
        ));
    }
}
