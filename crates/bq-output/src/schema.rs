// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Table schema parsing and validation.
//!
//! A schema comes from exactly one of two configuration sources:
//!
//! ```text
//! csv_schema  = "path:STRING,status:INTEGER,score:FLOAT"
//!
//! [[json_schema.fields]]
//! name = "params"
//! type = "RECORD"
//! mode = "REPEATED"
//! fields = [{ name = "key", type = "STRING" }, { name = "value", type = "STRING" }]
//! ```
//!
//! Both are turned into a validated [`TableSchema`] that serializes to the
//! BigQuery REST representation.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

/// Schema errors. All of them are configuration errors.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum SchemaError {
    #[error("configuration must provide either json_schema or csv_schema")]
    Missing,

    #[error("configuration must provide only one of json_schema or csv_schema")]
    Conflicting,

    #[error("csv_schema must follow the format <field-name>:<field-type>, got '{0}'")]
    MalformedEntry(String),

    #[error("csv_schema must contain at least one field")]
    Empty,

    #[error("csv_schema has an unterminated quote")]
    UnterminatedQuote,

    #[error("unknown field type '{0}'")]
    UnknownType(String),

    #[error("unknown field mode '{0}'")]
    UnknownMode(String),

    #[error("field name must not be empty")]
    EmptyName,

    #[error("RECORD field '{0}' must declare sub-fields")]
    RecordWithoutFields(String),

    #[error("field '{0}' is not a RECORD and cannot declare sub-fields")]
    UnexpectedSubFields(String),
}

/// Column type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum FieldType {
    String,
    Bytes,
    Integer,
    Float,
    Numeric,
    Bignumeric,
    Boolean,
    Timestamp,
    Date,
    Time,
    Datetime,
    Geography,
    Record,
}

impl FieldType {
    /// Canonical type name.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::String => "STRING",
            Self::Bytes => "BYTES",
            Self::Integer => "INTEGER",
            Self::Float => "FLOAT",
            Self::Numeric => "NUMERIC",
            Self::Bignumeric => "BIGNUMERIC",
            Self::Boolean => "BOOLEAN",
            Self::Timestamp => "TIMESTAMP",
            Self::Date => "DATE",
            Self::Time => "TIME",
            Self::Datetime => "DATETIME",
            Self::Geography => "GEOGRAPHY",
            Self::Record => "RECORD",
        }
    }
}

impl FromStr for FieldType {
    type Err = SchemaError;

    /// Strict, case-sensitive parse (standard SQL aliases accepted).
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "STRING" => Ok(Self::String),
            "BYTES" => Ok(Self::Bytes),
            "INTEGER" | "INT64" => Ok(Self::Integer),
            "FLOAT" | "FLOAT64" => Ok(Self::Float),
            "NUMERIC" => Ok(Self::Numeric),
            "BIGNUMERIC" => Ok(Self::Bignumeric),
            "BOOLEAN" | "BOOL" => Ok(Self::Boolean),
            "TIMESTAMP" => Ok(Self::Timestamp),
            "DATE" => Ok(Self::Date),
            "TIME" => Ok(Self::Time),
            "DATETIME" => Ok(Self::Datetime),
            "GEOGRAPHY" => Ok(Self::Geography),
            "RECORD" | "STRUCT" => Ok(Self::Record),
            other => Err(SchemaError::UnknownType(other.to_string())),
        }
    }
}

impl fmt::Display for FieldType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Column mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum FieldMode {
    Nullable,
    Required,
    Repeated,
}

impl FromStr for FieldMode {
    type Err = SchemaError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "NULLABLE" => Ok(Self::Nullable),
            "REQUIRED" => Ok(Self::Required),
            "REPEATED" => Ok(Self::Repeated),
            other => Err(SchemaError::UnknownMode(other.to_string())),
        }
    }
}

/// A validated column.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Field {
    pub name: String,
    #[serde(rename = "type")]
    pub field_type: FieldType,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub mode: Option<FieldMode>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub fields: Vec<Field>,
}

impl Field {
    /// Create a scalar column.
    pub fn new(name: impl Into<String>, field_type: FieldType) -> Self {
        Self {
            name: name.into(),
            field_type,
            mode: None,
            description: None,
            fields: Vec::new(),
        }
    }
}

/// A validated column tree.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TableSchema {
    pub fields: Vec<Field>,
}

/// Structured schema description, as written in configuration.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SchemaDescription {
    #[serde(default)]
    pub fields: Vec<FieldDescription>,
}

/// One field of a structured schema description.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FieldDescription {
    pub name: String,
    #[serde(rename = "type")]
    pub field_type: String,
    #[serde(default)]
    pub mode: Option<String>,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub fields: Option<Vec<FieldDescription>>,
}

impl TableSchema {
    /// Build the schema from exactly one of the two configuration sources.
    pub fn from_sources(
        compact: Option<&str>,
        structured: Option<&SchemaDescription>,
    ) -> Result<Self, SchemaError> {
        match (compact, structured) {
            (Some(_), Some(_)) => Err(SchemaError::Conflicting),
            (None, None) => Err(SchemaError::Missing),
            (Some(compact), None) => Self::parse_compact(compact),
            (None, Some(structured)) => Self::from_description(structured),
        }
    }

    /// Parse a compact `name:TYPE,name:TYPE` list.
    pub fn parse_compact(compact: &str) -> Result<Self, SchemaError> {
        let description = describe_compact(compact)?;
        Self::from_description(&description)
    }

    /// Validate a structured description.
    pub fn from_description(description: &SchemaDescription) -> Result<Self, SchemaError> {
        let fields = parse_field_list(&description.fields)?;
        if fields.is_empty() {
            return Err(SchemaError::Empty);
        }
        Ok(Self { fields })
    }

    /// Serialize to the REST API representation.
    pub fn to_json(&self) -> serde_json::Value {
        serde_json::json!({ "fields": self.fields })
    }
}

/// Convert a compact list into a structured description.
pub fn describe_compact(compact: &str) -> Result<SchemaDescription, SchemaError> {
    let mut fields = Vec::new();

    for entry in split_compact(compact)? {
        let entry = entry.trim();
        let parts: Vec<&str> = entry.split(':').collect();
        if parts.len() != 2 || parts[0].trim().is_empty() || parts[1].trim().is_empty() {
            return Err(SchemaError::MalformedEntry(entry.to_string()));
        }

        fields.push(FieldDescription {
            name: parts[0].trim().to_string(),
            field_type: parts[1].trim().to_string(),
            mode: None,
            description: None,
            fields: None,
        });
    }

    if fields.is_empty() {
        return Err(SchemaError::Empty);
    }

    Ok(SchemaDescription { fields })
}

/// Split on commas outside double quotes. `""` inside quotes is a literal quote.
fn split_compact(input: &str) -> Result<Vec<String>, SchemaError> {
    if input.trim().is_empty() {
        return Ok(Vec::new());
    }

    let mut entries = Vec::new();
    let mut current = String::new();
    let mut quoted = false;
    let mut chars = input.chars().peekable();

    while let Some(c) = chars.next() {
        match c {
            '"' if quoted && chars.peek() == Some(&'"') => {
                current.push('"');
                chars.next();
            }
            '"' => quoted = !quoted,
            ',' if !quoted => entries.push(std::mem::take(&mut current)),
            c => current.push(c),
        }
    }

    if quoted {
        return Err(SchemaError::UnterminatedQuote);
    }
    entries.push(current);

    Ok(entries)
}

fn parse_field_list(fields: &[FieldDescription]) -> Result<Vec<Field>, SchemaError> {
    fields.iter().map(parse_field).collect()
}

fn parse_field(description: &FieldDescription) -> Result<Field, SchemaError> {
    let name = description.name.trim();
    if name.is_empty() {
        return Err(SchemaError::EmptyName);
    }

    let field_type: FieldType = description.field_type.parse()?;
    let mode = description
        .mode
        .as_deref()
        .map(str::parse::<FieldMode>)
        .transpose()?;

    let fields = match (&description.fields, field_type) {
        (Some(sub), FieldType::Record) if !sub.is_empty() => parse_field_list(sub)?,
        (_, FieldType::Record) => return Err(SchemaError::RecordWithoutFields(name.to_string())),
        (Some(sub), _) if !sub.is_empty() => {
            return Err(SchemaError::UnexpectedSubFields(name.to_string()))
        }
        _ => Vec::new(),
    };

    Ok(Field {
        name: name.to_string(),
        field_type,
        mode,
        description: description.description.clone(),
        fields,
    })
}
