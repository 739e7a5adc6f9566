// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! In-process delivery client.
//!
//! Keeps tables and accepted rows in memory. Failures can be injected per
//! operation so the output's degradation paths can be exercised without a
//! network.

use super::{build_rows, log_row_errors, DeliveryClient, DeliveryError, DeliveryOutcome};
use super::{InsertOptions, RowError};
use crate::batcher::Message;
use crate::schema::TableSchema;
use parking_lot::Mutex;
use serde_json::Value;
use std::collections::{BTreeSet, HashMap};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

/// One stored row.
#[derive(Debug, Clone, PartialEq)]
pub struct StoredRow {
    pub insert_id: Option<String>,
    pub json: Value,
}

#[derive(Debug, Default)]
struct MemoryTable {
    schema: Option<TableSchema>,
    rows: Vec<StoredRow>,
}

/// Delivery client backed by a map of `(dataset, table)` to rows.
#[derive(Debug, Default)]
pub struct MemoryClient {
    tables: Mutex<HashMap<(String, String), MemoryTable>>,
    failing_rows: Mutex<BTreeSet<usize>>,
    fail_append: AtomicBool,
    fail_exists: AtomicBool,
    fail_create: AtomicBool,
    append_calls: AtomicU64,
    create_calls: AtomicU64,
}

impl MemoryClient {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register an existing table (no schema).
    pub fn with_table(self, dataset: &str, table: &str) -> Self {
        self.tables
            .lock()
            .insert(key(dataset, table), MemoryTable::default());
        self
    }

    /// Reject rows at these indices of every append.
    pub fn fail_rows(&self, indices: impl IntoIterator<Item = usize>) {
        let mut failing = self.failing_rows.lock();
        failing.clear();
        failing.extend(indices);
    }

    /// Make every append fail at the transport level.
    pub fn fail_append(&self, fail: bool) {
        self.fail_append.store(fail, Ordering::Relaxed);
    }

    /// Make every existence check fail.
    pub fn fail_exists(&self, fail: bool) {
        self.fail_exists.store(fail, Ordering::Relaxed);
    }

    /// Make every table creation fail.
    pub fn fail_create(&self, fail: bool) {
        self.fail_create.store(fail, Ordering::Relaxed);
    }

    /// Check if a table is known.
    pub fn has_table(&self, dataset: &str, table: &str) -> bool {
        self.tables.lock().contains_key(&key(dataset, table))
    }

    /// Schema the table was created with, if it was created by a client call.
    pub fn schema_of(&self, dataset: &str, table: &str) -> Option<TableSchema> {
        self.tables
            .lock()
            .get(&key(dataset, table))
            .and_then(|t| t.schema.clone())
    }

    /// Accepted rows of a table, in insertion order.
    pub fn rows(&self, dataset: &str, table: &str) -> Vec<StoredRow> {
        self.tables
            .lock()
            .get(&key(dataset, table))
            .map(|t| t.rows.clone())
            .unwrap_or_default()
    }

    /// Names of all known tables in a dataset, sorted.
    pub fn tables(&self, dataset: &str) -> Vec<String> {
        let mut names: Vec<String> = self
            .tables
            .lock()
            .keys()
            .filter(|(d, _)| d == dataset)
            .map(|(_, t)| t.clone())
            .collect();
        names.sort();
        names
    }

    /// Number of `append` calls so far.
    pub fn append_calls(&self) -> u64 {
        self.append_calls.load(Ordering::Relaxed)
    }

    /// Number of `create_table` calls so far.
    pub fn create_calls(&self) -> u64 {
        self.create_calls.load(Ordering::Relaxed)
    }
}

fn key(dataset: &str, table: &str) -> (String, String) {
    (dataset.to_string(), table.to_string())
}

impl DeliveryClient for MemoryClient {
    fn table_exists(&self, dataset: &str, table: &str) -> Result<bool, DeliveryError> {
        if self.fail_exists.load(Ordering::Relaxed) {
            return Err(DeliveryError::Other("injected existence check failure".into()));
        }
        Ok(self.has_table(dataset, table))
    }

    fn create_table(
        &self,
        dataset: &str,
        table: &str,
        schema: &TableSchema,
    ) -> Result<(), DeliveryError> {
        self.create_calls.fetch_add(1, Ordering::Relaxed);
        if self.fail_create.load(Ordering::Relaxed) {
            return Err(DeliveryError::Other("injected create failure".into()));
        }

        let mut tables = self.tables.lock();
        let k = key(dataset, table);
        if tables.contains_key(&k) {
            return Err(DeliveryError::Api {
                status: 409,
                message: format!("Already Exists: Table {}.{}", dataset, table),
            });
        }
        tables.insert(
            k,
            MemoryTable {
                schema: Some(schema.clone()),
                rows: Vec::new(),
            },
        );
        tracing::debug!(dataset, table, "Created in-memory table");
        Ok(())
    }

    fn append(
        &self,
        dataset: &str,
        table: &str,
        rows: &[Message],
        options: &InsertOptions,
    ) -> Result<DeliveryOutcome, DeliveryError> {
        self.append_calls.fetch_add(1, Ordering::Relaxed);
        if self.fail_append.load(Ordering::Relaxed) {
            return Err(DeliveryError::Other("injected append failure".into()));
        }

        let mut tables = self.tables.lock();
        let Some(target) = tables.get_mut(&key(dataset, table)) else {
            return Err(DeliveryError::Api {
                status: 404,
                message: format!("Not found: Table {}.{}", dataset, table),
            });
        };

        let (decoded, mut rejected) = build_rows(rows, options);
        let failing = self.failing_rows.lock();
        for index in failing.iter().filter(|i| **i < rows.len()) {
            rejected
                .entry(*index)
                .or_default()
                .push(RowError::new("invalid", "injected row failure"));
        }

        // Without skip_invalid_rows one bad row rejects the whole request.
        let accept_any = rejected.is_empty() || options.skip_invalid_rows;
        if !accept_any {
            for row in &decoded {
                rejected
                    .entry(row.index)
                    .or_insert_with(|| vec![RowError::new("stopped", "")]);
            }
        }

        for row in decoded {
            if accept_any && !rejected.contains_key(&row.index) {
                target.rows.push(StoredRow {
                    insert_id: row.insert_id,
                    json: Value::Object(row.json),
                });
            }
        }

        log_row_errors(table, &rejected);
        Ok(DeliveryOutcome::from_errors(rejected))
    }
}
