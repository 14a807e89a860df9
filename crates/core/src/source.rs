//! Source descriptors and column mappings.
//!
//! A [`SourceDescriptor`] tells the importer where a delimited file lives,
//! how to split it, and which destination columns its fields land in.
//! Descriptors come from an external catalog and are read-only for the
//! duration of an import.

use std::fmt;
use std::str::FromStr;

use indexmap::IndexMap;
use serde::{Deserialize, Serialize};

use crate::error::SluiceError;

/// One ingested row: header label -> raw cell value, in header order.
pub type Record = IndexMap<String, String>;

/// Destination column name -> declared type, in mapping order.
pub type TableSchema = IndexMap<String, TypeTag>;

// ── Type tags ─────────────────────────────────────────────────

/// Declared type of a destination column.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TypeTag {
    #[serde(alias = "string", alias = "varchar")]
    Text,
    Int,
    BigInt,
    Float,
    Double,
    Decimal,
    Bool,
    Date,
    Timestamp,
    Json,
}

impl TypeTag {
    /// SQL type used for DDL and value casts.
    pub fn sql_type(&self) -> &'static str {
        match self {
            TypeTag::Text => "TEXT",
            TypeTag::Int => "INT",
            TypeTag::BigInt => "BIGINT",
            TypeTag::Float => "REAL",
            TypeTag::Double => "DOUBLE PRECISION",
            TypeTag::Decimal => "NUMERIC",
            TypeTag::Bool => "BOOLEAN",
            TypeTag::Date => "DATE",
            TypeTag::Timestamp => "TIMESTAMP",
            TypeTag::Json => "JSONB",
        }
    }

    pub fn is_text(&self) -> bool {
        matches!(self, TypeTag::Text)
    }
}

impl fmt::Display for TypeTag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            TypeTag::Text => "text",
            TypeTag::Int => "int",
            TypeTag::BigInt => "bigint",
            TypeTag::Float => "float",
            TypeTag::Double => "double",
            TypeTag::Decimal => "decimal",
            TypeTag::Bool => "bool",
            TypeTag::Date => "date",
            TypeTag::Timestamp => "timestamp",
            TypeTag::Json => "json",
        };
        f.write_str(s)
    }
}

impl FromStr for TypeTag {
    type Err = SluiceError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "text" | "string" | "varchar" => Ok(TypeTag::Text),
            "int" | "integer" => Ok(TypeTag::Int),
            "bigint" | "long" => Ok(TypeTag::BigInt),
            "float" | "real" => Ok(TypeTag::Float),
            "double" => Ok(TypeTag::Double),
            "decimal" | "numeric" => Ok(TypeTag::Decimal),
            "bool" | "boolean" => Ok(TypeTag::Bool),
            "date" => Ok(TypeTag::Date),
            "timestamp" | "datetime" => Ok(TypeTag::Timestamp),
            "json" | "jsonb" => Ok(TypeTag::Json),
            other => Err(SluiceError::Parse(format!("unknown type tag '{other}'"))),
        }
    }
}

// ── Connectors ────────────────────────────────────────────────

/// How the source file is delimited.
///
/// Only the delimited-text kinds are streamable; anything else deserializes
/// to `Other` and is refused at admission.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectorKind {
    Csv,
    Tsv,
    Psv,
    #[serde(untagged)]
    Other(String),
}

impl ConnectorKind {
    /// Field delimiter for delimited-text connectors.
    pub fn delimiter(&self) -> Option<u8> {
        match self {
            ConnectorKind::Csv => Some(b','),
            ConnectorKind::Tsv => Some(b'\t'),
            ConnectorKind::Psv => Some(b'|'),
            ConnectorKind::Other(_) => None,
        }
    }
}

impl fmt::Display for ConnectorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConnectorKind::Csv => f.write_str("csv"),
            ConnectorKind::Tsv => f.write_str("tsv"),
            ConnectorKind::Psv => f.write_str("psv"),
            ConnectorKind::Other(name) => f.write_str(name),
        }
    }
}

// ── Descriptor ────────────────────────────────────────────────

/// Maps one source field onto one destination column.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ColumnMapping {
    /// Header label in the source file.
    pub field: String,
    /// Destination column name.
    pub column: String,
    #[serde(rename = "type")]
    pub type_tag: TypeTag,
    /// Hidden from presentation layers; still ingested.
    #[serde(default)]
    pub hidden: bool,
}

impl ColumnMapping {
    pub fn new(field: impl Into<String>, column: impl Into<String>, type_tag: TypeTag) -> Self {
        Self {
            field: field.into(),
            column: column.into(),
            type_tag,
            hidden: false,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SourceDescriptor {
    pub id: String,
    pub connector: ConnectorKind,
    /// Object path of the file inside the configured file store.
    pub location: String,
    /// Destination table; defaults to `t_{id}`.
    #[serde(default)]
    pub table: Option<String>,
    /// Overrides the connector's delimiter (single byte).
    #[serde(default)]
    pub delimiter: Option<char>,
    #[serde(default)]
    pub columns: Vec<ColumnMapping>,
}

impl SourceDescriptor {
    pub fn table_name(&self) -> String {
        match &self.table {
            Some(t) if !t.is_empty() => t.clone(),
            _ => format!("t_{}", self.id),
        }
    }

    /// Effective delimiter, or `None` when the connector cannot be streamed.
    pub fn delimiter(&self) -> Option<u8> {
        match self.delimiter {
            Some(c) if c.is_ascii() => Some(c as u8),
            Some(_) => None,
            None => self.connector.delimiter(),
        }
    }
}

/// Destination schema of a column mapping, in mapping order.
pub fn table_schema(columns: &[ColumnMapping]) -> TableSchema {
    columns.iter().map(|m| (m.column.clone(), m.type_tag)).collect()
}
