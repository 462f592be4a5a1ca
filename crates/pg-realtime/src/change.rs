//! Decoded row-change representation
//!
//! One [`Change`] per trigger notification. Values come from the trigger
//! payload at face value; when the trigger connection and the subscriber
//! connection see different rows (row-level security), no reconciliation
//! is attempted.

use crate::table::QualifiedTable;
use crate::value::Value;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::fmt;

/// Row mutation kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum ChangeOp {
    /// Row inserted
    Insert,
    /// Row updated
    Update,
    /// Row deleted
    Delete,
}

impl fmt::Display for ChangeOp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ChangeOp::Insert => write!(f, "INSERT"),
            ChangeOp::Update => write!(f, "UPDATE"),
            ChangeOp::Delete => write!(f, "DELETE"),
        }
    }
}

/// A decoded change notification for one row mutation.
#[derive(Debug, Clone, PartialEq)]
pub struct Change {
    /// Table the mutation happened on.
    pub table: QualifiedTable,
    /// Mutation kind.
    pub op: ChangeOp,
    /// Post-image for INSERT/UPDATE, pre-image for DELETE.
    pub row: HashMap<String, Value>,
    /// Per-column (old, new) pairs. INSERT: old is null; DELETE: new is
    /// null; UPDATE: only columns whose text form actually changed.
    pub changes: HashMap<String, (Value, Value)>,
    /// Columns whose value in `row` is a SHA-256 hex digest rather than
    /// the real value.
    pub hashed: HashSet<String>,
}

impl Change {
    /// Column names that changed in this mutation.
    pub fn changed_columns(&self) -> impl Iterator<Item = &str> {
        self.changes.keys().map(String::as_str)
    }

    /// Whether a column's value was replaced by a digest.
    pub fn is_hashed(&self, column: &str) -> bool {
        self.hashed.contains(column)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_change_op_display() {
        assert_eq!(ChangeOp::Insert.to_string(), "INSERT");
        assert_eq!(ChangeOp::Update.to_string(), "UPDATE");
        assert_eq!(ChangeOp::Delete.to_string(), "DELETE");
    }

    #[test]
    fn test_change_op_deserialize() {
        let op: ChangeOp = serde_json::from_str("\"INSERT\"").unwrap();
        assert_eq!(op, ChangeOp::Insert);
        assert!(serde_json::from_str::<ChangeOp>("\"TRUNCATE\"").is_err());
    }

    #[test]
    fn test_changed_columns_and_hashed() {
        let mut changes = HashMap::new();
        changes.insert("name".to_string(), (Value::Null, Value::String("a".into())));
        let change = Change {
            table: QualifiedTable::public("users"),
            op: ChangeOp::Insert,
            row: HashMap::new(),
            changes,
            hashed: HashSet::from(["body".to_string()]),
        };
        assert_eq!(change.changed_columns().collect::<Vec<_>>(), vec!["name"]);
        assert!(change.is_hashed("body"));
        assert!(!change.is_hashed("name"));
    }
}
