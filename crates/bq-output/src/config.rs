// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Output configuration.
//!
//! Loaded from TOML. Only `project_id` and `dataset` are required; every
//! other key has a default.
//!
//! ```toml
//! project_id = "my-project"
//! dataset = "logs"
//! csv_schema = "timestamp:TIMESTAMP,message:STRING"
//! batch_size = 128
//! flush_interval_secs = 5
//! ```

use crate::credentials::{CredentialSource, CredentialsError};
use crate::delivery::{InsertOptions, DEFAULT_ENDPOINT};
use crate::error_sink::{ErrorSink, DEFAULT_ERROR_DIRECTORY};
use crate::schema::{SchemaDescription, SchemaError, TableSchema};
use crate::table::{validate_pattern, TableNaming};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

/// Recommended upper bound for rows per streaming insert request.
pub const RECOMMENDED_MAX_BATCH_SIZE: usize = 500;

/// Configuration errors.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("TOML parse error: {0}")]
    Toml(#[from] toml::de::Error),

    #[error("Invalid schema: {0}")]
    Schema(#[from] SchemaError),

    #[error("Invalid credentials: {0}")]
    Credentials(#[from] CredentialsError),

    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

/// Output configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OutputConfig {
    /// Project owning the dataset.
    pub project_id: String,

    /// Dataset the tables live in.
    pub dataset: String,

    /// Prefix of time-derived table names.
    #[serde(default = "default_table_prefix")]
    pub table_prefix: String,

    /// Separator between prefix and date.
    #[serde(default = "default_table_separator")]
    pub table_separator: String,

    /// Fixed, pre-existing table. Disables time-derived naming.
    #[serde(default)]
    pub table_name: Option<String>,

    /// Compact schema, `name:TYPE,name:TYPE`.
    #[serde(default)]
    pub csv_schema: Option<String>,

    /// Structured schema.
    #[serde(default)]
    pub json_schema: Option<SchemaDescription>,

    #[serde(default)]
    pub ignore_unknown_values: bool,

    #[serde(default)]
    pub skip_invalid_rows: bool,

    /// Do not send deduplication ids.
    #[serde(default = "default_true")]
    pub ignore_row_ids: bool,

    /// Field holding the deduplication id.
    #[serde(default = "default_row_id_field")]
    pub row_id_field: String,

    /// strftime pattern of the date part of table names.
    #[serde(default = "default_date_pattern")]
    pub date_pattern: String,

    /// Service-account key file (absolute path).
    #[serde(default)]
    pub json_key_file: Option<PathBuf>,

    /// Pre-issued access token.
    #[serde(default)]
    pub access_token: Option<String>,

    /// Messages per batch.
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,

    /// Bytes per batch.
    #[serde(default = "default_batch_size_bytes")]
    pub batch_size_bytes: usize,

    /// Seconds between periodic flushes.
    #[serde(default = "default_flush_interval")]
    pub flush_interval_secs: u64,

    /// Where undelivered rows are spilled.
    #[serde(default = "default_error_directory")]
    pub error_directory: PathBuf,

    /// REST API root.
    #[serde(default = "default_endpoint")]
    pub endpoint: String,

    /// Per-request timeout (seconds).
    #[serde(default = "default_request_timeout")]
    pub request_timeout_secs: u64,
}

fn default_table_prefix() -> String {
    "logstash".to_string()
}

fn default_table_separator() -> String {
    "_".to_string()
}

fn default_true() -> bool {
    true
}

fn default_row_id_field() -> String {
    "insert_id".to_string()
}

fn default_date_pattern() -> String {
    "%Y-%m-%dT%H:00".to_string()
}

fn default_batch_size() -> usize {
    128
}

fn default_batch_size_bytes() -> usize {
    1_000_000
}

fn default_flush_interval() -> u64 {
    5
}

fn default_error_directory() -> PathBuf {
    PathBuf::from(DEFAULT_ERROR_DIRECTORY)
}

fn default_endpoint() -> String {
    DEFAULT_ENDPOINT.to_string()
}

fn default_request_timeout() -> u64 {
    30
}

impl OutputConfig {
    /// Configuration with defaults for everything but the destination.
    pub fn new(project_id: impl Into<String>, dataset: impl Into<String>) -> Self {
        Self {
            project_id: project_id.into(),
            dataset: dataset.into(),
            table_prefix: default_table_prefix(),
            table_separator: default_table_separator(),
            table_name: None,
            csv_schema: None,
            json_schema: None,
            ignore_unknown_values: false,
            skip_invalid_rows: false,
            ignore_row_ids: true,
            row_id_field: default_row_id_field(),
            date_pattern: default_date_pattern(),
            json_key_file: None,
            access_token: None,
            batch_size: default_batch_size(),
            batch_size_bytes: default_batch_size_bytes(),
            flush_interval_secs: default_flush_interval(),
            error_directory: default_error_directory(),
            endpoint: default_endpoint(),
            request_timeout_secs: default_request_timeout(),
        }
    }

    /// Load and validate a TOML file.
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)?;
        Self::from_toml(&content)
    }

    /// Parse and validate TOML text.
    pub fn from_toml(content: &str) -> Result<Self, ConfigError> {
        let config: Self = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    /// Validate the configuration.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.project_id.trim().is_empty() {
            return Err(ConfigError::Invalid("project_id is empty".into()));
        }
        if self.dataset.trim().is_empty() {
            return Err(ConfigError::Invalid("dataset is empty".into()));
        }
        if matches!(&self.table_name, Some(name) if name.trim().is_empty()) {
            return Err(ConfigError::Invalid("table_name is empty".into()));
        }
        if self.batch_size == 0 {
            return Err(ConfigError::Invalid("batch_size must be > 0".into()));
        }
        if self.batch_size_bytes == 0 {
            return Err(ConfigError::Invalid("batch_size_bytes must be > 0".into()));
        }
        if self.flush_interval_secs == 0 {
            return Err(ConfigError::Invalid(
                "flush_interval_secs must be > 0".into(),
            ));
        }
        if self.request_timeout_secs == 0 {
            return Err(ConfigError::Invalid(
                "request_timeout_secs must be > 0".into(),
            ));
        }
        validate_pattern(&self.date_pattern).map_err(ConfigError::Invalid)?;

        self.schema()?;

        if let Some(path) = &self.json_key_file {
            CredentialSource::key_file(path)?;
        }

        if self.batch_size > RECOMMENDED_MAX_BATCH_SIZE {
            tracing::warn!(
                batch_size = self.batch_size,
                recommended = RECOMMENDED_MAX_BATCH_SIZE,
                "batch_size is above the recommended maximum rows per streaming insert"
            );
        }

        Ok(())
    }

    /// Table naming mode.
    pub fn table_naming(&self) -> TableNaming {
        match &self.table_name {
            Some(name) => TableNaming::Fixed(name.clone()),
            None => TableNaming::dated(
                self.table_prefix.as_str(),
                self.table_separator.as_str(),
                self.date_pattern.as_str(),
            ),
        }
    }

    /// Schema for auto-created tables.
    ///
    /// Both sources together are always rejected. With a fixed table name the
    /// schema is optional since the table is never created.
    pub fn schema(&self) -> Result<Option<TableSchema>, ConfigError> {
        let compact = self.csv_schema.as_deref();
        let structured = self.json_schema.as_ref();

        if compact.is_none() && structured.is_none() && self.table_name.is_some() {
            return Ok(None);
        }
        Ok(Some(TableSchema::from_sources(compact, structured)?))
    }

    /// Row insert policy.
    pub fn insert_options(&self) -> InsertOptions {
        InsertOptions {
            ignore_unknown_values: self.ignore_unknown_values,
            skip_invalid_rows: self.skip_invalid_rows,
            ignore_row_ids: self.ignore_row_ids,
            row_id_field: self.row_id_field.clone(),
        }
    }

    /// Token source for the REST client.
    pub fn credential_source(&self) -> Result<CredentialSource, ConfigError> {
        Ok(CredentialSource::resolve(
            self.json_key_file.as_deref(),
            self.access_token.as_deref(),
        )?)
    }

    pub fn error_sink(&self) -> ErrorSink {
        ErrorSink::new(&self.error_directory)
    }

    pub fn flush_interval(&self) -> Duration {
        Duration::from_secs(self.flush_interval_secs)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }
}
