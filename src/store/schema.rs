//! Column inference and SQL value mapping for JSON records

use rusqlite::types::Value as SqlValue;
use serde_json::{Map, Value};

/// Name of the per-table staging table
pub fn staging_table(table: &str) -> String {
    format!("__staging_{}", table)
}

/// Name of the shadow table built during commit
pub fn shadow_table(table: &str) -> String {
    format!("__shadow_{}", table)
}

/// Refresh catalog table
pub const CATALOG_TABLE: &str = "__sync_tables";

/// Quote an identifier for SQLite
pub fn quote_ident(name: &str) -> String {
    format!("\"{}\"", name.replace('"', "\"\""))
}

/// Storage class inferred for a column
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ColumnType {
    /// No non-null value seen yet
    Unknown,
    /// Integers and booleans
    Integer,
    /// Any non-integral number
    Real,
    /// Strings, arrays, objects, or mixed content
    Text,
}

impl ColumnType {
    fn of(value: &Value) -> Self {
        match value {
            Value::Null => Self::Unknown,
            Value::Bool(_) => Self::Integer,
            Value::Number(n) if n.is_i64() => Self::Integer,
            Value::Number(_) => Self::Real,
            _ => Self::Text,
        }
    }

    fn widen(self, other: Self) -> Self {
        use ColumnType::*;
        match (self, other) {
            (Unknown, t) | (t, Unknown) => t,
            (Text, _) | (_, Text) => Text,
            (Real, _) | (_, Real) => Real,
            (Integer, Integer) => Integer,
        }
    }

    /// SQLite declared type
    pub fn sql(self) -> &'static str {
        match self {
            Self::Integer => "INTEGER",
            Self::Real => "REAL",
            Self::Unknown | Self::Text => "TEXT",
        }
    }
}

/// Columns in first-seen order with their widened types
#[derive(Debug, Default)]
pub struct InferredSchema {
    columns: Vec<(String, ColumnType)>,
}

impl InferredSchema {
    /// Fold one record into the schema
    pub fn observe(&mut self, record: &Map<String, Value>) {
        for (key, value) in record {
            let seen = ColumnType::of(value);
            match self.columns.iter_mut().find(|(name, _)| name == key) {
                Some((_, column_type)) => *column_type = column_type.widen(seen),
                None => self.columns.push((key.clone(), seen)),
            }
        }
    }

    /// Whether no column has been seen
    pub fn is_empty(&self) -> bool {
        self.columns.is_empty()
    }

    /// Column names in order
    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.columns.iter().map(|(name, _)| name.as_str())
    }

    /// `CREATE TABLE` statement for `table`
    pub fn create_statement(&self, table: &str) -> String {
        let columns: Vec<String> = self
            .columns
            .iter()
            .map(|(name, column_type)| format!("{} {}", quote_ident(name), column_type.sql()))
            .collect();
        format!("CREATE TABLE {} ({})", quote_ident(table), columns.join(", "))
    }

    /// Parameterised `INSERT` statement for `table`
    pub fn insert_statement(&self, table: &str) -> String {
        let names: Vec<String> = self.names().map(quote_ident).collect();
        let placeholders: Vec<String> = (1..=names.len()).map(|i| format!("?{}", i)).collect();
        format!(
            "INSERT INTO {} ({}) VALUES ({})",
            quote_ident(table),
            names.join(", "),
            placeholders.join(", ")
        )
    }

    /// Row values in column order; absent fields are NULL
    pub fn row(&self, record: &Map<String, Value>) -> Vec<SqlValue> {
        self.names()
            .map(|name| record.get(name).map_or(SqlValue::Null, to_sql_value))
            .collect()
    }
}

/// Map a JSON value onto a SQLite value
pub fn to_sql_value(value: &Value) -> SqlValue {
    match value {
        Value::Null => SqlValue::Null,
        Value::Bool(b) => SqlValue::Integer(i64::from(*b)),
        Value::Number(n) => match n.as_i64() {
            Some(i) => SqlValue::Integer(i),
            None => SqlValue::Real(n.as_f64().unwrap_or(f64::NAN)),
        },
        Value::String(s) => SqlValue::Text(s.clone()),
        other => SqlValue::Text(other.to_string()),
    }
}
