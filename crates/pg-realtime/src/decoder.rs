//! Notification payload decoding
//!
//! Parses the JSON envelope emitted by the notify triggers and converts
//! each `{value, oid}` cell into a typed [`Value`] using the value's
//! declared type OID. Hashed columns arrive with the OID already forced
//! to `text`, so their digests decode as plain strings.

use crate::change::{Change, ChangeOp};
use crate::error::{LiveQueryError, Result};
use crate::table::QualifiedTable;
use crate::value::Value;
use serde::Deserialize;
use std::collections::{HashMap, HashSet};

/// One `{value, oid}` cell of the envelope. Triggers emit the OID as a
/// string; a bare number is tolerated.
#[derive(Debug, Deserialize)]
struct Cell {
    value: Option<String>,
    oid: OidField,
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum OidField {
    Text(String),
    Number(u32),
}

impl Cell {
    fn type_oid(&self) -> Result<u32> {
        match &self.oid {
            OidField::Number(n) => Ok(*n),
            OidField::Text(s) => s
                .parse()
                .map_err(|_| LiveQueryError::decode(format!("invalid oid: {s:?}"))),
        }
    }

    fn decode(&self) -> Result<Value> {
        match &self.value {
            None => Ok(Value::Null),
            Some(text) => Value::from_pg_text(self.type_oid()?, text),
        }
    }
}

/// The JSON envelope a notify trigger emits for one row mutation.
#[derive(Debug, Deserialize)]
struct Envelope {
    table: String,
    operation: String,
    #[serde(default)]
    row: HashMap<String, Cell>,
    #[serde(default)]
    old_values: HashMap<String, Cell>,
    #[serde(default)]
    hashed: Vec<String>,
    #[serde(default)]
    error: Option<String>,
}

/// Decode one raw notification payload into a [`Change`].
///
/// An envelope carrying `error` means the trigger body itself failed; that
/// surfaces as [`LiveQueryError::TriggerRuntime`] for the system error
/// handler, and the notification is dropped by the dispatcher.
pub fn decode(payload: &str) -> Result<Change> {
    let envelope: Envelope = serde_json::from_str(payload)
        .map_err(|e| LiveQueryError::decode(format!("malformed envelope: {e}")))?;

    if let Some(message) = envelope.error {
        return Err(LiveQueryError::TriggerRuntime {
            table: envelope.table,
            operation: envelope.operation,
            message,
        });
    }

    let op: ChangeOp = match envelope.operation.as_str() {
        "INSERT" => ChangeOp::Insert,
        "UPDATE" => ChangeOp::Update,
        "DELETE" => ChangeOp::Delete,
        other => {
            return Err(LiveQueryError::decode(format!(
                "unknown operation: {other:?}"
            )))
        }
    };

    let mut row = HashMap::with_capacity(envelope.row.len());
    for (column, cell) in &envelope.row {
        row.insert(column.clone(), cell.decode()?);
    }

    let changes = match op {
        ChangeOp::Insert => row
            .iter()
            .map(|(column, value)| (column.clone(), (Value::Null, value.clone())))
            .collect(),
        ChangeOp::Delete => row
            .iter()
            .map(|(column, value)| (column.clone(), (value.clone(), Value::Null)))
            .collect(),
        ChangeOp::Update => {
            let mut changes = HashMap::with_capacity(envelope.old_values.len());
            for (column, cell) in &envelope.old_values {
                let old = cell.decode()?;
                let new = row.get(column).cloned().unwrap_or(Value::Null);
                changes.insert(column.clone(), (old, new));
            }
            changes
        }
    };

    Ok(Change {
        table: QualifiedTable::parse(&envelope.table),
        op,
        row,
        changes,
        hashed: HashSet::from_iter(envelope.hashed),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn payload(envelope: serde_json::Value) -> String {
        envelope.to_string()
    }

    #[test]
    fn test_decode_insert() {
        let change = decode(&payload(json!({
            "table": "users",
            "operation": "INSERT",
            "row": {
                "id": {"value": "7", "oid": "23"},
                "email": {"value": "a@example.com", "oid": "25"}
            },
            "hashed": []
        })))
        .unwrap();

        assert_eq!(change.table, QualifiedTable::public("users"));
        assert_eq!(change.op, ChangeOp::Insert);
        assert_eq!(change.row["id"], Value::Int32(7));
        assert_eq!(
            change.changes["id"],
            (Value::Null, Value::Int32(7))
        );
        assert_eq!(
            change.changes["email"],
            (Value::Null, Value::String("a@example.com".into()))
        );
        assert!(change.hashed.is_empty());
    }

    #[test]
    fn test_decode_delete_uses_pre_image() {
        let change = decode(&payload(json!({
            "table": "users",
            "operation": "DELETE",
            "row": {"id": {"value": "7", "oid": "23"}},
            "hashed": []
        })))
        .unwrap();

        assert_eq!(change.op, ChangeOp::Delete);
        assert_eq!(change.changes["id"], (Value::Int32(7), Value::Null));
    }

    #[test]
    fn test_decode_update_changes_only_from_old_values() {
        let change = decode(&payload(json!({
            "table": "orders",
            "operation": "UPDATE",
            "row": {
                "id": {"value": "1", "oid": "23"},
                "status": {"value": "shipped", "oid": "25"}
            },
            "old_values": {
                "status": {"value": "pending", "oid": "25"}
            },
            "hashed": []
        })))
        .unwrap();

        assert_eq!(change.op, ChangeOp::Update);
        // id did not change, so it only appears in the post-image
        assert!(!change.changes.contains_key("id"));
        assert_eq!(
            change.changes["status"],
            (
                Value::String("pending".into()),
                Value::String("shipped".into())
            )
        );
    }

    #[test]
    fn test_decode_null_value() {
        let change = decode(&payload(json!({
            "table": "users",
            "operation": "INSERT",
            "row": {"nickname": {"value": null, "oid": "25"}},
            "hashed": []
        })))
        .unwrap();
        assert_eq!(change.row["nickname"], Value::Null);
        assert_eq!(change.changes["nickname"], (Value::Null, Value::Null));
    }

    #[test]
    fn test_decode_qualified_table() {
        let change = decode(&payload(json!({
            "table": "billing.invoices",
            "operation": "INSERT",
            "row": {},
            "hashed": []
        })))
        .unwrap();
        assert_eq!(change.table, QualifiedTable::new("billing", "invoices"));
    }

    #[test]
    fn test_decode_hashed_columns() {
        let digest = "a".repeat(64);
        let change = decode(&payload(json!({
            "table": "posts",
            "operation": "UPDATE",
            "row": {
                "id": {"value": "1", "oid": "23"},
                "body": {"value": digest, "oid": "25"}
            },
            "old_values": {
                "body": {"value": "b".repeat(64), "oid": "25"}
            },
            "hashed": ["body"]
        })))
        .unwrap();

        assert!(change.is_hashed("body"));
        assert!(!change.is_hashed("id"));
        assert_eq!(change.row["body"], Value::String("a".repeat(64)));
    }

    #[test]
    fn test_decode_error_envelope() {
        let err = decode(&payload(json!({
            "table": "users",
            "operation": "UPDATE",
            "error": "division by zero"
        })))
        .unwrap_err();

        match err {
            LiveQueryError::TriggerRuntime {
                table,
                operation,
                message,
            } => {
                assert_eq!(table, "users");
                assert_eq!(operation, "UPDATE");
                assert_eq!(message, "division by zero");
            }
            other => panic!("expected TriggerRuntime, got {other:?}"),
        }
    }

    #[test]
    fn test_decode_malformed_payload() {
        assert!(matches!(
            decode("not json").unwrap_err(),
            LiveQueryError::Decode(_)
        ));
        assert!(matches!(
            decode(r#"{"table":"t","operation":"MERGE","row":{},"hashed":[]}"#).unwrap_err(),
            LiveQueryError::Decode(_)
        ));
    }

    #[test]
    fn test_decode_numeric_oid_field() {
        let change = decode(&payload(json!({
            "table": "users",
            "operation": "INSERT",
            "row": {"id": {"value": "3", "oid": 23}},
            "hashed": []
        })))
        .unwrap();
        assert_eq!(change.row["id"], Value::Int32(3));
    }

    #[test]
    fn test_decode_then_reencode_yields_equal_values() {
        let raw = payload(json!({
            "table": "users",
            "operation": "INSERT",
            "row": {
                "id": {"value": "7", "oid": "23"},
                "active": {"value": "t", "oid": "16"}
            },
            "hashed": []
        }));
        let first = decode(&raw).unwrap();
        let second = decode(&raw).unwrap();
        assert_eq!(first, second);
    }
}
