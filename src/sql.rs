// SQL value layer.
// Dialect-agnostic parameters, statements, and result rows passed between the
// query compiler, the executor, and the backend adapters. Keeping this layer
// untyped-but-tagged lets one compiler serve both drivers.

use anyhow::{bail, Result};
use serde_json::Value as JsonValue;
use std::collections::HashMap;
use std::fmt;

use crate::errors::TypeGraphError;

/// A single bind parameter or decoded column value.
#[derive(Debug, Clone, PartialEq)]
pub enum SqlValue {
    Null,
    Bool(bool),
    Int(i64),
    Float(f64),
    Text(String),
    Json(JsonValue),
}

impl SqlValue {
    pub fn is_null(&self) -> bool {
        matches!(self, Self::Null)
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Self::Bool(b) => Some(*b),
            // SQLite surfaces booleans as 0/1 integers.
            Self::Int(0) => Some(false),
            Self::Int(1) => Some(true),
            _ => None,
        }
    }

    pub fn as_i64(&self) -> Option<i64> {
        match self {
            Self::Int(i) => Some(*i),
            Self::Float(f) if f.fract() == 0.0 => Some(*f as i64),
            _ => None,
        }
    }

    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Self::Int(i) => Some(*i as f64),
            Self::Float(f) => Some(*f),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Self::Text(s) => Some(s),
            _ => None,
        }
    }

    /// Interpret the value as a JSON payload. TEXT columns holding JSON
    /// (SQLite) parse here; JSONB columns (PostgreSQL) arrive pre-parsed.
    pub fn as_json(&self) -> Result<JsonValue> {
        match self {
            Self::Json(v) => Ok(v.clone()),
            Self::Text(s) => serde_json::from_str(s).map_err(|e| {
                TypeGraphError::database("decode_json", format!("invalid JSON payload: {e}")).into()
            }),
            Self::Null => Ok(JsonValue::Null),
            other => bail!(TypeGraphError::database(
                "decode_json",
                format!("cannot read {other:?} as JSON"),
            )),
        }
    }

    /// Lossless conversion into a JSON value for projection output.
    pub fn into_json(self) -> JsonValue {
        match self {
            Self::Null => JsonValue::Null,
            Self::Bool(b) => JsonValue::Bool(b),
            Self::Int(i) => JsonValue::from(i),
            Self::Float(f) => serde_json::Number::from_f64(f)
                .map(JsonValue::Number)
                .unwrap_or(JsonValue::Null),
            Self::Text(s) => JsonValue::String(s),
            Self::Json(v) => v,
        }
    }

    /// Encode a JSON literal as a bind value: scalars map to native SQL
    /// types, structures stay JSON.
    pub fn from_json(value: &JsonValue) -> Self {
        match value {
            JsonValue::Null => Self::Null,
            JsonValue::Bool(b) => Self::Bool(*b),
            JsonValue::Number(n) => {
                if let Some(i) = n.as_i64() {
                    Self::Int(i)
                } else {
                    Self::Float(n.as_f64().unwrap_or(0.0))
                }
            }
            JsonValue::String(s) => Self::Text(s.clone()),
            other => Self::Json(other.clone()),
        }
    }
}

impl fmt::Display for SqlValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Null => f.write_str("NULL"),
            Self::Bool(b) => write!(f, "{b}"),
            Self::Int(i) => write!(f, "{i}"),
            Self::Float(v) => write!(f, "{v}"),
            Self::Text(s) => write!(f, "'{s}'"),
            Self::Json(v) => write!(f, "{v}"),
        }
    }
}

/// A compiled statement: SQL text with dialect-appropriate placeholders plus
/// the bind parameters in placeholder order.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct SqlStatement {
    pub sql: String,
    pub params: Vec<SqlValue>,
}

impl SqlStatement {
    pub fn new(sql: impl Into<String>, params: Vec<SqlValue>) -> Self {
        Self {
            sql: sql.into(),
            params,
        }
    }
}

/// One decoded result row: column name to value.
#[derive(Debug, Clone, Default)]
pub struct SqlRow {
    columns: HashMap<String, SqlValue>,
}

impl SqlRow {
    pub fn new(columns: HashMap<String, SqlValue>) -> Self {
        Self { columns }
    }

    pub fn insert(&mut self, column: impl Into<String>, value: SqlValue) {
        self.columns.insert(column.into(), value);
    }

    pub fn get(&self, column: &str) -> Option<&SqlValue> {
        self.columns.get(column)
    }

    pub fn contains(&self, column: &str) -> bool {
        self.columns.contains_key(column)
    }

    pub fn required(&self, column: &str) -> Result<&SqlValue> {
        self.columns.get(column).ok_or_else(|| {
            TypeGraphError::database("decode_row", format!("missing column '{column}'")).into()
        })
    }

    pub fn opt_i64(&self, column: &str) -> Result<Option<i64>> {
        match self.columns.get(column) {
            None | Some(SqlValue::Null) => Ok(None),
            Some(value) => value.as_i64().map(Some).ok_or_else(|| {
                TypeGraphError::database(
                    "decode_row",
                    format!("column '{column}' is not an integer"),
                )
                .into()
            }),
        }
    }

    pub fn required_i64(&self, column: &str) -> Result<i64> {
        self.opt_i64(column)?.ok_or_else(|| {
            TypeGraphError::database("decode_row", format!("column '{column}' is NULL")).into()
        })
    }

    pub fn opt_str(&self, column: &str) -> Result<Option<&str>> {
        match self.columns.get(column) {
            None | Some(SqlValue::Null) => Ok(None),
            Some(value) => value.as_str().map(Some).ok_or_else(|| {
                TypeGraphError::database("decode_row", format!("column '{column}' is not text"))
                    .into()
            }),
        }
    }

    pub fn required_str(&self, column: &str) -> Result<&str> {
        self.opt_str(column)?.ok_or_else(|| {
            TypeGraphError::database("decode_row", format!("column '{column}' is NULL")).into()
        })
    }

    pub fn column_names(&self) -> impl Iterator<Item = &str> {
        self.columns.keys().map(String::as_str)
    }

    pub fn into_columns(self) -> HashMap<String, SqlValue> {
        self.columns
    }
}
