//! Qualified table names
//!
//! A (schema, name) pair. Schema `public` is canonical and rendered bare;
//! any other schema renders as `schema.name`.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Canonical schema that renders without a prefix.
pub const PUBLIC_SCHEMA: &str = "public";

/// A schema-qualified PostgreSQL table.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct QualifiedTable {
    schema: String,
    name: String,
}

impl QualifiedTable {
    /// Create a table reference with an explicit schema.
    pub fn new(schema: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            schema: schema.into(),
            name: name.into(),
        }
    }

    /// Create a table reference in the `public` schema.
    pub fn public(name: impl Into<String>) -> Self {
        Self::new(PUBLIC_SCHEMA, name)
    }

    /// Parse a rendered name: `schema.name`, or a bare name meaning `public`.
    pub fn parse(raw: &str) -> Self {
        match raw.split_once('.') {
            Some((schema, name)) => Self::new(schema, name),
            None => Self::public(raw),
        }
    }

    /// Schema name.
    pub fn schema(&self) -> &str {
        &self.schema
    }

    /// Table name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Whether this table lives in the canonical `public` schema.
    pub fn is_public(&self) -> bool {
        self.schema == PUBLIC_SCHEMA
    }

    /// `<schema>_<name>` suffix used for crate-owned function and trigger names.
    pub fn object_suffix(&self) -> String {
        format!("{}_{}", self.schema, self.name)
    }
}

impl fmt::Display for QualifiedTable {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_public() {
            write!(f, "{}", self.name)
        } else {
            write!(f, "{}.{}", self.schema, self.name)
        }
    }
}

impl From<&str> for QualifiedTable {
    fn from(raw: &str) -> Self {
        Self::parse(raw)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_bare_name_is_public() {
        let t = QualifiedTable::parse("users");
        assert_eq!(t.schema(), "public");
        assert_eq!(t.name(), "users");
        assert!(t.is_public());
    }

    #[test]
    fn test_parse_qualified_name() {
        let t = QualifiedTable::parse("billing.invoices");
        assert_eq!(t.schema(), "billing");
        assert_eq!(t.name(), "invoices");
        assert!(!t.is_public());
    }

    #[test]
    fn test_display_omits_public() {
        assert_eq!(QualifiedTable::public("users").to_string(), "users");
        assert_eq!(
            QualifiedTable::new("billing", "invoices").to_string(),
            "billing.invoices"
        );
    }

    #[test]
    fn test_object_suffix() {
        assert_eq!(QualifiedTable::public("users").object_suffix(), "public_users");
        assert_eq!(
            QualifiedTable::new("billing", "invoices").object_suffix(),
            "billing_invoices"
        );
    }

    #[test]
    fn test_parse_display_round_trip() {
        for raw in ["users", "billing.invoices"] {
            assert_eq!(QualifiedTable::parse(raw).to_string(), raw);
        }
    }
}
