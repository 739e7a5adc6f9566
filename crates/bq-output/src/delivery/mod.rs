// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Delivery to the remote table store.
//!
//! [`DeliveryClient`] is the only boundary the output talks to:
//!
//! - [`RestClient`] - BigQuery v2 REST API (streaming inserts)
//! - [`MemoryClient`] - in-process store for dry runs and tests

mod memory;
mod rest;

pub use memory::{MemoryClient, StoredRow};
pub use rest::{RestClient, DEFAULT_ENDPOINT};

use crate::batcher::Message;
use crate::credentials::CredentialsError;
use crate::schema::TableSchema;
use serde_json::{Map, Value};
use std::collections::BTreeMap;
use thiserror::Error;

/// Transport-level delivery errors.
#[derive(Debug, Error)]
pub enum DeliveryError {
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("credentials error: {0}")]
    Credentials(#[from] CredentialsError),

    #[error("API error {status}: {message}")]
    Api { status: u16, message: String },

    #[error("unexpected response: {0}")]
    Response(String),

    #[error("{0}")]
    Other(String),
}

/// Row insert policy.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InsertOptions {
    /// Drop values that have no matching column instead of rejecting the row.
    pub ignore_unknown_values: bool,
    /// Insert the valid rows of a request even if some rows are invalid.
    pub skip_invalid_rows: bool,
    /// Never send per-row deduplication ids.
    pub ignore_row_ids: bool,
    /// Field carrying the deduplication id when `ignore_row_ids` is false.
    pub row_id_field: String,
}

impl Default for InsertOptions {
    fn default() -> Self {
        Self {
            ignore_unknown_values: false,
            skip_invalid_rows: false,
            ignore_row_ids: true,
            row_id_field: "insert_id".to_string(),
        }
    }
}

/// Why a single row was rejected.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RowError {
    pub location: Option<String>,
    pub message: String,
    pub reason: String,
}

impl RowError {
    pub fn new(reason: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            location: None,
            message: message.into(),
            reason: reason.into(),
        }
    }
}

/// Result of one append call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeliveryOutcome {
    /// Every row was accepted.
    Delivered,
    /// Rejected rows, keyed by index in the submitted slice.
    Rejected(BTreeMap<usize, Vec<RowError>>),
}

impl DeliveryOutcome {
    /// Build an outcome from per-row errors (empty map means success).
    pub fn from_errors(errors: BTreeMap<usize, Vec<RowError>>) -> Self {
        if errors.is_empty() {
            Self::Delivered
        } else {
            Self::Rejected(errors)
        }
    }

    /// Indices of rejected rows, ascending.
    pub fn failed_indices(&self) -> Vec<usize> {
        match self {
            Self::Delivered => Vec::new(),
            Self::Rejected(errors) => errors.keys().copied().collect(),
        }
    }

    /// Rows accepted out of `submitted`.
    pub fn accepted(&self, submitted: usize) -> usize {
        match self {
            Self::Delivered => submitted,
            Self::Rejected(errors) => submitted.saturating_sub(errors.len()),
        }
    }

    /// Check if every row was accepted.
    pub fn is_delivered(&self) -> bool {
        matches!(self, Self::Delivered)
    }
}

/// Capability to manage tables and append rows in the remote store.
pub trait DeliveryClient: Send + Sync {
    /// Check whether `dataset.table` exists.
    fn table_exists(&self, dataset: &str, table: &str) -> Result<bool, DeliveryError>;

    /// Create `dataset.table` with the given schema.
    fn create_table(
        &self,
        dataset: &str,
        table: &str,
        schema: &TableSchema,
    ) -> Result<(), DeliveryError>;

    /// Append rows; per-row rejections are reported in the outcome.
    ///
    /// An `Err` means nothing can be assumed delivered.
    fn append(
        &self,
        dataset: &str,
        table: &str,
        rows: &[Message],
        options: &InsertOptions,
    ) -> Result<DeliveryOutcome, DeliveryError>;
}

/// A decoded row ready to be sent.
#[derive(Debug, Clone, PartialEq)]
pub struct InsertRow {
    /// Index in the submitted slice.
    pub index: usize,
    /// Deduplication id, if any.
    pub insert_id: Option<String>,
    /// Row content.
    pub json: Map<String, Value>,
}

/// Decode messages into rows.
///
/// Messages that are not JSON objects cannot be sent; they come back as
/// rejected rows (reason `invalid`) keyed by their index.
pub fn build_rows(
    messages: &[Message],
    options: &InsertOptions,
) -> (Vec<InsertRow>, BTreeMap<usize, Vec<RowError>>) {
    let mut rows = Vec::with_capacity(messages.len());
    let mut rejected = BTreeMap::new();

    for (index, message) in messages.iter().enumerate() {
        let mut json = match serde_json::from_str::<Value>(message.as_str()) {
            Ok(Value::Object(map)) => map,
            Ok(_) => {
                rejected.insert(
                    index,
                    vec![RowError::new("invalid", "row is not a JSON object")],
                );
                continue;
            }
            Err(e) => {
                rejected.insert(index, vec![RowError::new("invalid", e.to_string())]);
                continue;
            }
        };

        let insert_id = if options.ignore_row_ids {
            None
        } else {
            take_row_id(&mut json, &options.row_id_field)
        };

        rows.push(InsertRow {
            index,
            insert_id,
            json,
        });
    }

    (rows, rejected)
}

/// Remove the id field from the row. A missing or null field means no id.
fn take_row_id(row: &mut Map<String, Value>, field: &str) -> Option<String> {
    match row.remove(field)? {
        Value::Null => None,
        Value::String(id) => Some(id),
        other => Some(other.to_string()),
    }
}

/// Log every rejected row.
pub(crate) fn log_row_errors(table: &str, errors: &BTreeMap<usize, Vec<RowError>>) {
    for (index, row_errors) in errors {
        for error in row_errors {
            tracing::warn!(
                table,
                row = index,
                location = error.location.as_deref().unwrap_or(""),
                message = %error.message,
                reason = %error.reason,
                "Error while inserting"
            );
        }
    }
}
