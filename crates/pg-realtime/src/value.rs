//! Typed values and result rows
//!
//! Values decoded from PostgreSQL's text format by type OID, and the row
//! shape returned by query execution. Unknown OIDs degrade to `String`
//! rather than failing, so exotic column types still flow through.

use crate::error::{LiveQueryError, Result};
use chrono::{DateTime, NaiveDate, NaiveDateTime, NaiveTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::str::FromStr;

/// PostgreSQL type OIDs understood by the text decoder.
///
/// Reference: <https://www.postgresql.org/docs/current/datatype.html>
pub(crate) mod oid {
    pub const BOOL: u32 = 16;
    pub const BYTEA: u32 = 17;
    pub const CHAR: u32 = 18;
    pub const NAME: u32 = 19;
    pub const INT8: u32 = 20;
    pub const INT2: u32 = 21;
    pub const INT4: u32 = 23;
    pub const TEXT: u32 = 25;
    pub const OID: u32 = 26;
    pub const JSON: u32 = 114;
    pub const FLOAT4: u32 = 700;
    pub const FLOAT8: u32 = 701;
    pub const BPCHAR: u32 = 1042;
    pub const VARCHAR: u32 = 1043;
    pub const DATE: u32 = 1082;
    pub const TIME: u32 = 1083;
    pub const TIMESTAMP: u32 = 1114;
    pub const TIMESTAMPTZ: u32 = 1184;
    pub const NUMERIC: u32 = 1700;
    pub const UUID: u32 = 2950;
    pub const JSONB: u32 = 3802;
}

/// A typed PostgreSQL value.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Value {
    /// SQL NULL
    Null,
    /// boolean
    Bool(bool),
    /// smallint
    Int16(i16),
    /// integer
    Int32(i32),
    /// bigint (also oid)
    Int64(i64),
    /// real
    Float32(f32),
    /// double precision
    Float64(f64),
    /// numeric/decimal
    Decimal(Decimal),
    /// text, varchar, char(n), name, and the fallback for unknown types
    String(String),
    /// bytea
    Bytes(Vec<u8>),
    /// date
    Date(NaiveDate),
    /// time without time zone
    Time(NaiveTime),
    /// timestamp without time zone
    Timestamp(NaiveDateTime),
    /// timestamp with time zone, normalized to UTC
    TimestampTz(DateTime<Utc>),
    /// uuid
    Uuid(uuid::Uuid),
    /// json/jsonb
    Json(serde_json::Value),
}

impl Value {
    /// Decode a value from PostgreSQL's text representation for the given
    /// type OID.
    pub fn from_pg_text(type_oid: u32, text: &str) -> Result<Value> {
        let value = match type_oid {
            oid::BOOL => match text {
                "t" | "true" => Value::Bool(true),
                "f" | "false" => Value::Bool(false),
                other => return Err(decode_error("bool", other)),
            },
            oid::INT2 => Value::Int16(parse(text, "int2")?),
            oid::INT4 => Value::Int32(parse(text, "int4")?),
            oid::INT8 | oid::OID => Value::Int64(parse(text, "int8")?),
            oid::FLOAT4 => Value::Float32(parse(text, "float4")?),
            oid::FLOAT8 => Value::Float64(parse(text, "float8")?),
            oid::NUMERIC => Value::Decimal(
                Decimal::from_str(text).map_err(|_| decode_error("numeric", text))?,
            ),
            oid::TEXT | oid::VARCHAR | oid::BPCHAR | oid::CHAR | oid::NAME => {
                Value::String(text.to_string())
            }
            oid::BYTEA => {
                let hex_part = text
                    .strip_prefix("\\x")
                    .ok_or_else(|| decode_error("bytea", text))?;
                Value::Bytes(hex::decode(hex_part).map_err(|_| decode_error("bytea", text))?)
            }
            oid::DATE => Value::Date(
                NaiveDate::parse_from_str(text, "%Y-%m-%d")
                    .map_err(|_| decode_error("date", text))?,
            ),
            oid::TIME => Value::Time(
                NaiveTime::parse_from_str(text, "%H:%M:%S%.f")
                    .map_err(|_| decode_error("time", text))?,
            ),
            oid::TIMESTAMP => Value::Timestamp(
                NaiveDateTime::parse_from_str(text, "%Y-%m-%d %H:%M:%S%.f")
                    .map_err(|_| decode_error("timestamp", text))?,
            ),
            oid::TIMESTAMPTZ => Value::TimestampTz(
                DateTime::parse_from_str(text, "%Y-%m-%d %H:%M:%S%.f%#z")
                    .map_err(|_| decode_error("timestamptz", text))?
                    .with_timezone(&Utc),
            ),
            oid::UUID => Value::Uuid(
                uuid::Uuid::parse_str(text).map_err(|_| decode_error("uuid", text))?,
            ),
            oid::JSON | oid::JSONB => Value::Json(
                serde_json::from_str(text).map_err(|_| decode_error("json", text))?,
            ),
            // Unknown types flow through as text
            _ => Value::String(text.to_string()),
        };
        Ok(value)
    }

    /// Whether this value is SQL NULL.
    pub fn is_null(&self) -> bool {
        matches!(self, Value::Null)
    }

    /// Borrow as a string, if this is a string value.
    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::String(s) => Some(s),
            _ => None,
        }
    }

    /// Widen to i64, if this is an integer value.
    pub fn as_i64(&self) -> Option<i64> {
        match self {
            Value::Int16(n) => Some(i64::from(*n)),
            Value::Int32(n) => Some(i64::from(*n)),
            Value::Int64(n) => Some(*n),
            _ => None,
        }
    }

    /// Borrow as a bool, if this is a boolean value.
    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Value::Bool(b) => Some(*b),
            _ => None,
        }
    }
}

fn parse<T: FromStr>(text: &str, type_name: &str) -> Result<T> {
    text.parse()
        .map_err(|_| decode_error(type_name, text))
}

fn decode_error(type_name: &str, text: &str) -> LiveQueryError {
    LiveQueryError::decode(format!("invalid {type_name} text: {text:?}"))
}

/// A single result row: column names paired with typed values.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Row {
    columns: Vec<String>,
    values: Vec<Value>,
}

impl Row {
    /// Create a row from parallel column and value vectors.
    pub fn new(columns: Vec<String>, values: Vec<Value>) -> Self {
        debug_assert_eq!(columns.len(), values.len());
        Self { columns, values }
    }

    /// Column names, in result order.
    pub fn columns(&self) -> &[String] {
        &self.columns
    }

    /// Values, in result order.
    pub fn values(&self) -> &[Value] {
        &self.values
    }

    /// Value at a positional index.
    pub fn get(&self, idx: usize) -> Option<&Value> {
        self.values.get(idx)
    }

    /// Value for a named column.
    pub fn get_by_name(&self, name: &str) -> Option<&Value> {
        self.columns
            .iter()
            .position(|c| c == name)
            .and_then(|idx| self.values.get(idx))
    }

    /// Number of columns.
    pub fn len(&self) -> usize {
        self.values.len()
    }

    /// Whether the row has no columns.
    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }
}

/// The full result of one query execution.
pub type ResultSet = Vec<Row>;
