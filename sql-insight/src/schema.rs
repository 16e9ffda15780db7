//! Schema snapshot types
//!
//! These types represent the database structure discovered at runtime. A
//! snapshot is either complete for every table the connection can see, or it
//! is not produced at all.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::connection::EngineKind;

/// Role a column plays in the table's keys
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum KeyRole {
    None,
    Primary,
    Foreign,
}

/// Information about a single column
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ColumnInfo {
    /// Column name
    pub name: String,

    /// SQL data type as declared (e.g., "INTEGER", "TEXT", "VARCHAR(255)")
    pub data_type: String,

    /// Whether the column allows NULL values
    pub nullable: bool,

    /// Primary/foreign key membership
    pub key_role: KeyRole,
}

impl ColumnInfo {
    pub fn new(name: impl Into<String>, data_type: impl Into<String>, nullable: bool, key_role: KeyRole) -> Self {
        Self {
            name: name.into(),
            data_type: data_type.into(),
            nullable,
            key_role,
        }
    }

    pub fn is_numeric(&self) -> bool {
        is_numeric_type(&self.data_type)
    }

    pub fn is_temporal(&self) -> bool {
        is_temporal_type(&self.data_type)
    }

    pub fn is_textual(&self) -> bool {
        is_textual_type(&self.data_type)
    }

    /// Key columns and `*_id` columns identify rows rather than measure them
    pub fn is_identifier(&self) -> bool {
        self.key_role != KeyRole::None || is_identifier_name(&self.name)
    }
}

/// Complete column list for one table, in the database's native order
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TableSchema {
    /// Name of the table
    pub name: String,

    /// Columns in native ordinal order
    pub columns: Vec<ColumnInfo>,
}

impl TableSchema {
    pub fn new(name: impl Into<String>, columns: Vec<ColumnInfo>) -> Self {
        Self {
            name: name.into(),
            columns,
        }
    }

    /// Case-insensitive column lookup
    pub fn column(&self, name: &str) -> Option<&ColumnInfo> {
        self.columns
            .iter()
            .find(|column| column.name.eq_ignore_ascii_case(name))
    }

    /// Render the table as a `CREATE TABLE` statement for prompt context
    pub fn to_ddl(&self, engine: EngineKind) -> String {
        let columns: Vec<String> = self
            .columns
            .iter()
            .map(|column| {
                let mut definition = format!(
                    "    {} {}",
                    engine.quote_identifier(&column.name),
                    column.data_type
                );
                if !column.nullable {
                    definition.push_str(" NOT NULL");
                }
                match column.key_role {
                    KeyRole::Primary => definition.push_str(" PRIMARY KEY"),
                    KeyRole::Foreign => definition.push_str(" -- foreign key"),
                    KeyRole::None => {}
                }
                definition
            })
            .collect();

        format!(
            "CREATE TABLE {} (\n{}\n);",
            engine.quote_identifier(&self.name),
            columns.join(",\n")
        )
    }
}

/// Every table visible to one connection, keyed by table name
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SchemaSnapshot {
    pub engine: EngineKind,
    pub tables: BTreeMap<String, TableSchema>,
}

impl SchemaSnapshot {
    pub fn new(engine: EngineKind, tables: impl IntoIterator<Item = TableSchema>) -> Self {
        Self {
            engine,
            tables: tables
                .into_iter()
                .map(|table| (table.name.clone(), table))
                .collect(),
        }
    }

    /// Case-insensitive table lookup; schema-qualified names match on the last part
    pub fn table(&self, name: &str) -> Option<&TableSchema> {
        let unqualified = name.rsplit('.').next().unwrap_or(name);
        self.tables.get(unqualified).or_else(|| {
            self.tables
                .values()
                .find(|table| table.name.eq_ignore_ascii_case(unqualified))
        })
    }

    pub fn is_empty(&self) -> bool {
        self.tables.is_empty()
    }

    /// All tables rendered as DDL, used as schema context for SQL generators
    pub fn to_ddl(&self) -> String {
        self.tables
            .values()
            .map(|table| table.to_ddl(self.engine))
            .collect::<Vec<_>>()
            .join("\n\n")
    }
}

pub(crate) fn is_numeric_type(data_type: &str) -> bool {
    let upper = data_type.to_ascii_uppercase();
    ["INT", "REAL", "FLOAT", "DOUBLE", "NUMERIC", "DECIMAL", "MONEY", "SERIAL", "NUMBER"]
        .iter()
        .any(|marker| upper.contains(marker))
        && !upper.contains("INTERVAL")
        && !upper.contains("POINT")
}

pub(crate) fn is_temporal_type(data_type: &str) -> bool {
    let upper = data_type.to_ascii_uppercase();
    upper.contains("DATE") || upper.contains("TIME") || upper == "YEAR"
}

pub(crate) fn is_textual_type(data_type: &str) -> bool {
    let upper = data_type.to_ascii_uppercase();
    ["CHAR", "TEXT", "CLOB", "STRING", "ENUM", "NAME", "CITEXT"]
        .iter()
        .any(|marker| upper.contains(marker))
}

pub(crate) fn is_identifier_name(name: &str) -> bool {
    let lower = name.to_ascii_lowercase();
    lower == "id" || lower.ends_with("_id")
}
