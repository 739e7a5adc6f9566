// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Output coordinator.
//!
//! Ties the pipeline together:
//!
//! ```text
//! receive(event) -> encode -> Batcher --(drain)--> publish -> DeliveryClient
//!                                ^                     |
//!                     FlushScheduler (interval)        +--(failed rows)--> ErrorSink
//! ```
//!
//! Nothing that happens while publishing a batch is returned as an error:
//! delivery failures are logged, counted and spilled to disk.

use crate::batcher::{Batch, Batcher, Message};
use crate::config::{ConfigError, OutputConfig};
use crate::delivery::{DeliveryClient, DeliveryError, DeliveryOutcome, InsertOptions};
use crate::encode::encode_event;
use crate::error_sink::ErrorSink;
use crate::flush::{FlushScheduler, StopSignal};
use crate::schema::TableSchema;
use crate::table::{normalize_table_id, TableNaming};
use parking_lot::Mutex;
use serde::Serialize;
use serde_json::Value;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;

/// Errors raised while building the output. Publishing never fails.
#[derive(Debug, Error)]
pub enum OutputError {
    #[error("configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("delivery client error: {0}")]
    Delivery(#[from] DeliveryError),

    #[error("failed to spawn flush thread: {0}")]
    Spawn(#[source] std::io::Error),
}

/// What happened to one drained batch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PublishOutcome {
    /// Empty batch, nothing sent.
    Skipped,
    /// Every row accepted.
    Delivered { table: String, rows: usize },
    /// Some rows rejected; the rejected ones were spilled.
    PartiallyFailed {
        table: String,
        delivered: usize,
        failed: usize,
        spilled: bool,
    },
    /// The append call failed; the whole batch was spilled.
    Failed {
        table: String,
        rows: usize,
        spilled: bool,
    },
}

impl PublishOutcome {
    /// Destination table, if a delivery was attempted.
    pub fn table(&self) -> Option<&str> {
        match self {
            Self::Skipped => None,
            Self::Delivered { table, .. }
            | Self::PartiallyFailed { table, .. }
            | Self::Failed { table, .. } => Some(table),
        }
    }
}

/// Pipeline counters.
#[derive(Debug, Default)]
pub struct OutputStats {
    pub events_received: AtomicU64,
    pub encode_failures: AtomicU64,
    pub batches_published: AtomicU64,
    pub rows_delivered: AtomicU64,
    pub rows_spilled: AtomicU64,
    /// Rows neither delivered nor spilled.
    pub rows_lost: AtomicU64,
    pub tables_created: AtomicU64,
    pub delivery_errors: AtomicU64,
}

impl OutputStats {
    /// Get snapshot of current stats.
    pub fn snapshot(&self) -> OutputStatsSnapshot {
        OutputStatsSnapshot {
            events_received: self.events_received.load(Ordering::Relaxed),
            encode_failures: self.encode_failures.load(Ordering::Relaxed),
            batches_published: self.batches_published.load(Ordering::Relaxed),
            rows_delivered: self.rows_delivered.load(Ordering::Relaxed),
            rows_spilled: self.rows_spilled.load(Ordering::Relaxed),
            rows_lost: self.rows_lost.load(Ordering::Relaxed),
            tables_created: self.tables_created.load(Ordering::Relaxed),
            delivery_errors: self.delivery_errors.load(Ordering::Relaxed),
        }
    }
}

/// Point-in-time copy of [`OutputStats`].
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct OutputStatsSnapshot {
    pub events_received: u64,
    pub encode_failures: u64,
    pub batches_published: u64,
    pub rows_delivered: u64,
    pub rows_spilled: u64,
    pub rows_lost: u64,
    pub tables_created: u64,
    pub delivery_errors: u64,
}

/// Runtime settings of the coordinator, derived from [`OutputConfig`].
#[derive(Debug, Clone)]
pub struct OutputSettings {
    pub dataset: String,
    pub naming: TableNaming,
    /// Required when tables are auto-created.
    pub schema: Option<TableSchema>,
    pub insert_options: InsertOptions,
    pub batch_size: usize,
    pub batch_size_bytes: usize,
    /// `None` disables the flush thread.
    pub flush_interval: Option<Duration>,
    pub error_sink: ErrorSink,
}

impl OutputSettings {
    pub fn from_config(config: &OutputConfig) -> Result<Self, ConfigError> {
        config.validate()?;
        Ok(Self {
            dataset: config.dataset.clone(),
            naming: config.table_naming(),
            schema: config.schema()?,
            insert_options: config.insert_options(),
            batch_size: config.batch_size,
            batch_size_bytes: config.batch_size_bytes,
            flush_interval: Some(config.flush_interval()),
            error_sink: config.error_sink(),
        })
    }
}

struct Pipeline {
    client: Arc<dyn DeliveryClient>,
    dataset: String,
    naming: TableNaming,
    schema: Option<TableSchema>,
    insert_options: InsertOptions,
    batcher: Batcher,
    error_sink: ErrorSink,
    stats: OutputStats,
}

impl Pipeline {
    fn flush(&self) -> PublishOutcome {
        match self.batcher.enqueue(None) {
            Some(batch) => self.publish(batch),
            None => PublishOutcome::Skipped,
        }
    }

    fn publish(&self, batch: Batch) -> PublishOutcome {
        if batch.is_empty() {
            return PublishOutcome::Skipped;
        }

        let rows = batch.len();
        let table = match self.naming.resolve() {
            Ok(table) => table,
            Err(_) => {
                let table = self.fallback_table();
                tracing::error!(naming = ?self.naming, rows, "Cannot resolve table name");
                let spilled = self.write_to_error_sink(batch.messages(), &table);
                return PublishOutcome::Failed {
                    table,
                    rows,
                    spilled,
                };
            }
        };
        if self.naming.auto_create() {
            self.ensure_table(&table);
        }

        self.stats.batches_published.fetch_add(1, Ordering::Relaxed);
        tracing::info!(dataset = %self.dataset, table = %table, rows, "Publishing batch");

        match self
            .client
            .append(&self.dataset, &table, batch.messages(), &self.insert_options)
        {
            Ok(DeliveryOutcome::Delivered) => {
                self.stats
                    .rows_delivered
                    .fetch_add(rows as u64, Ordering::Relaxed);
                PublishOutcome::Delivered { table, rows }
            }
            Ok(outcome) => {
                let failed: Vec<Message> = outcome
                    .failed_indices()
                    .into_iter()
                    .filter_map(|i| batch.messages().get(i).cloned())
                    .collect();
                let delivered = outcome.accepted(rows);
                self.stats
                    .rows_delivered
                    .fetch_add(delivered as u64, Ordering::Relaxed);
                tracing::warn!(
                    table = %table,
                    delivered,
                    failed = failed.len(),
                    "Some rows were rejected"
                );

                let spilled = self.write_to_error_sink(&failed, &table);
                PublishOutcome::PartiallyFailed {
                    table,
                    delivered,
                    failed: failed.len(),
                    spilled,
                }
            }
            Err(e) => {
                self.stats.delivery_errors.fetch_add(1, Ordering::Relaxed);
                tracing::error!(
                    dataset = %self.dataset,
                    table = %table,
                    rows,
                    error = %e,
                    "Error uploading data"
                );

                let spilled = self.write_to_error_sink(batch.messages(), &table);
                PublishOutcome::Failed {
                    table,
                    rows,
                    spilled,
                }
            }
        }
    }

    /// Spill file name used when the table name cannot be resolved.
    fn fallback_table(&self) -> String {
        match &self.naming {
            TableNaming::Fixed(name) => name.clone(),
            TableNaming::Dated { prefix, .. } => normalize_table_id(prefix),
        }
    }

    fn ensure_table(&self, table: &str) {
        match self.client.table_exists(&self.dataset, table) {
            Ok(true) => return,
            Ok(false) => {}
            Err(e) => {
                tracing::error!(table, error = %e, "Error checking table existence");
                return;
            }
        }

        let Some(schema) = &self.schema else {
            tracing::error!(table, "Table is missing and no schema is configured");
            return;
        };

        tracing::info!(dataset = %self.dataset, table, "Creating table");
        match self.client.create_table(&self.dataset, table, schema) {
            Ok(()) => {
                self.stats.tables_created.fetch_add(1, Ordering::Relaxed);
            }
            // Another drain created it first.
            Err(DeliveryError::Api { status: 409, .. }) => {
                tracing::debug!(table, "Table already exists");
            }
            Err(e) => {
                tracing::error!(table, error = %e, "Error creating table");
            }
        }
    }

    fn write_to_error_sink(&self, messages: &[Message], table: &str) -> bool {
        if messages.is_empty() {
            return true;
        }
        let spilled = self.error_sink.spill(table, messages);
        let counter = if spilled {
            &self.stats.rows_spilled
        } else {
            &self.stats.rows_lost
        };
        counter.fetch_add(messages.len() as u64, Ordering::Relaxed);
        spilled
    }
}

/// Batching output to a BigQuery dataset.
///
/// Safe to share between threads; `receive` may be called concurrently.
/// Dropping the output closes it.
pub struct BigQueryOutput {
    pipeline: Arc<Pipeline>,
    scheduler: Mutex<Option<FlushScheduler>>,
    closed: AtomicBool,
}

impl BigQueryOutput {
    /// Validate `config` and start an output delivering through `client`.
    pub fn from_config(
        config: &OutputConfig,
        client: Arc<dyn DeliveryClient>,
    ) -> Result<Self, OutputError> {
        Self::start(OutputSettings::from_config(config)?, client)
    }

    /// Start an output, spawning the flush thread if an interval is set.
    ///
    /// Fails if the table naming cannot be resolved.
    pub fn start(
        settings: OutputSettings,
        client: Arc<dyn DeliveryClient>,
    ) -> Result<Self, OutputError> {
        settings
            .naming
            .validate()
            .map_err(|e| OutputError::Config(ConfigError::Invalid(e)))?;

        let pipeline = Arc::new(Pipeline {
            client,
            dataset: settings.dataset,
            naming: settings.naming,
            schema: settings.schema,
            insert_options: settings.insert_options,
            batcher: Batcher::new(settings.batch_size, settings.batch_size_bytes),
            error_sink: settings.error_sink,
            stats: OutputStats::default(),
        });

        let scheduler = match settings.flush_interval {
            Some(interval) => {
                let flushing = Arc::clone(&pipeline);
                let scheduler =
                    FlushScheduler::spawn(interval, Arc::new(StopSignal::new()), move || {
                        flushing.flush();
                    })
                    .map_err(OutputError::Spawn)?;
                Some(scheduler)
            }
            None => None,
        };

        tracing::info!(
            dataset = %pipeline.dataset,
            naming = ?pipeline.naming,
            batch_size = settings.batch_size,
            batch_size_bytes = settings.batch_size_bytes,
            flush_interval = ?settings.flush_interval,
            "BigQuery output started"
        );

        Ok(Self {
            pipeline,
            scheduler: Mutex::new(scheduler),
            closed: AtomicBool::new(false),
        })
    }

    /// Accept one event.
    ///
    /// Returns the outcome of the publish if this event completed a batch.
    pub fn receive(&self, event: Value) -> Option<PublishOutcome> {
        let stats = &self.pipeline.stats;
        stats.events_received.fetch_add(1, Ordering::Relaxed);

        let message = match encode_event(event) {
            Ok(message) => message,
            Err(e) => {
                stats.encode_failures.fetch_add(1, Ordering::Relaxed);
                tracing::error!(error = %e, "Failed to encode event, dropping it");
                return None;
            }
        };

        self.pipeline
            .batcher
            .enqueue(Some(message))
            .map(|batch| self.pipeline.publish(batch))
    }

    /// Deliver a batch, spilling whatever could not be delivered.
    pub fn publish(&self, batch: Batch) -> PublishOutcome {
        self.pipeline.publish(batch)
    }

    /// Make sure a time-derived table exists, creating it if absent.
    pub fn ensure_table(&self, table: &str) {
        self.pipeline.ensure_table(table)
    }

    /// Spill messages for `table`. Returns `false` if they were lost.
    pub fn write_to_error_sink(&self, messages: &[Message], table: &str) -> bool {
        self.pipeline.write_to_error_sink(messages, table)
    }

    /// Drain and publish whatever is buffered.
    pub fn flush(&self) -> PublishOutcome {
        self.pipeline.flush()
    }

    /// Stop the flush thread and publish the remaining buffer.
    ///
    /// Only the first call does anything.
    pub fn close(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }

        if let Some(mut scheduler) = self.scheduler.lock().take() {
            scheduler.stop();
        }

        let outcome = self.pipeline.flush();
        let stats = self.stats();
        tracing::info!(
            final_flush = ?outcome,
            rows_delivered = stats.rows_delivered,
            rows_spilled = stats.rows_spilled,
            rows_lost = stats.rows_lost,
            "BigQuery output closed"
        );
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Messages waiting in the current batch.
    pub fn pending(&self) -> usize {
        self.pipeline.batcher.len()
    }

    pub fn stats(&self) -> OutputStatsSnapshot {
        self.pipeline.stats.snapshot()
    }

    pub fn naming(&self) -> &TableNaming {
        &self.pipeline.naming
    }
}

impl Drop for BigQueryOutput {
    fn drop(&mut self) {
        self.close();
    }
}

impl std::fmt::Debug for BigQueryOutput {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BigQueryOutput")
            .field("dataset", &self.pipeline.dataset)
            .field("naming", &self.pipeline.naming)
            .field("batcher", &self.pipeline.batcher)
            .field("closed", &self.is_closed())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::delivery::MemoryClient;
    use serde_json::json;

    fn settings(dir: &std::path::Path, naming: TableNaming) -> OutputSettings {
        OutputSettings {
            dataset: "ds".into(),
            naming,
            schema: Some(TableSchema::parse_compact("message:STRING").unwrap()),
            insert_options: InsertOptions {
                skip_invalid_rows: true,
                ..Default::default()
            },
            batch_size: 2,
            batch_size_bytes: 1_000,
            flush_interval: None,
            error_sink: ErrorSink::new(dir),
        }
    }

    fn fixed() -> TableNaming {
        TableNaming::Fixed("events".into())
    }

    fn spilled_lines(dir: &std::path::Path) -> Vec<String> {
        let mut lines = Vec::new();
        for entry in std::fs::read_dir(dir).unwrap() {
            let content = std::fs::read_to_string(entry.unwrap().path()).unwrap();
            lines.extend(content.lines().map(str::to_string));
        }
        lines
    }

    fn batch(payloads: &[&str]) -> Batch {
        payloads.iter().map(|p| Message::new(*p)).collect()
    }

    #[test]
    fn test_empty_batch_skipped() {
        let dir = tempfile::tempdir().unwrap();
        let client = Arc::new(MemoryClient::new().with_table("ds", "events"));
        let output = BigQueryOutput::start(settings(dir.path(), fixed()), client.clone()).unwrap();

        assert_eq!(output.publish(Batch::new()), PublishOutcome::Skipped);
        assert_eq!(output.flush(), PublishOutcome::Skipped);
        assert_eq!(client.append_calls(), 0);
    }

    #[test]
    fn test_receive_publishes_on_threshold() {
        let dir = tempfile::tempdir().unwrap();
        let client = Arc::new(MemoryClient::new().with_table("ds", "events"));
        let output = BigQueryOutput::start(settings(dir.path(), fixed()), client.clone()).unwrap();

        assert_eq!(output.receive(json!({"@message": "a"})), None);
        assert_eq!(output.pending(), 1);
        let outcome = output.receive(json!({"message": "b"}));

        assert_eq!(
            outcome,
            Some(PublishOutcome::Delivered {
                table: "events".into(),
                rows: 2
            })
        );
        let rows = client.rows("ds", "events");
        assert_eq!(rows[0].json, json!({"message": "a"}));
        assert_eq!(output.stats().rows_delivered, 2);
    }

    #[test]
    fn test_partial_failure_spills_only_failed_rows() {
        let dir = tempfile::tempdir().unwrap();
        let client = Arc::new(MemoryClient::new().with_table("ds", "events"));
        client.fail_rows([1]);
        let output = BigQueryOutput::start(settings(dir.path(), fixed()), client.clone()).unwrap();

        let outcome = output.publish(batch(&[r#"{"n":0}"#, r#"{"n":1}"#]));

        assert_eq!(
            outcome,
            PublishOutcome::PartiallyFailed {
                table: "events".into(),
                delivered: 1,
                failed: 1,
                spilled: true
            }
        );
        assert_eq!(spilled_lines(dir.path()), vec![r#"{"n":1}"#.to_string()]);
        let stats = output.stats();
        assert_eq!(stats.rows_delivered, 1);
        assert_eq!(stats.rows_spilled, 1);
    }

    #[test]
    fn test_append_error_spills_whole_batch() {
        let dir = tempfile::tempdir().unwrap();
        let client = Arc::new(MemoryClient::new().with_table("ds", "events"));
        client.fail_append(true);
        let output = BigQueryOutput::start(settings(dir.path(), fixed()), client.clone()).unwrap();

        let outcome = output.publish(batch(&[r#"{"n":0}"#, r#"{"n":1}"#]));

        assert_eq!(
            outcome,
            PublishOutcome::Failed {
                table: "events".into(),
                rows: 2,
                spilled: true
            }
        );
        assert_eq!(spilled_lines(dir.path()).len(), 2);
        assert_eq!(output.stats().delivery_errors, 1);
    }

    #[test]
    fn test_lost_rows_counted_when_spill_fails() {
        let dir = tempfile::tempdir().unwrap();
        let blocker = dir.path().join("not-a-dir");
        std::fs::write(&blocker, "x").unwrap();

        let client = Arc::new(MemoryClient::new().with_table("ds", "events"));
        client.fail_append(true);
        let output = BigQueryOutput::start(settings(&blocker, fixed()), client).unwrap();

        let outcome = output.publish(batch(&["{}"]));
        assert!(matches!(outcome, PublishOutcome::Failed { spilled: false, .. }));
        assert_eq!(output.stats().rows_lost, 1);
        assert_eq!(output.stats().rows_spilled, 0);
    }

    #[test]
    fn test_fixed_table_never_created() {
        let dir = tempfile::tempdir().unwrap();
        let client = Arc::new(MemoryClient::new());
        let output = BigQueryOutput::start(settings(dir.path(), fixed()), client.clone()).unwrap();

        let outcome = output.publish(batch(&["{}"]));

        assert!(matches!(outcome, PublishOutcome::Failed { .. }));
        assert_eq!(client.create_calls(), 0);
        assert!(!client.has_table("ds", "events"));
    }

    #[test]
    fn test_dated_table_created_once() {
        let dir = tempfile::tempdir().unwrap();
        let client = Arc::new(MemoryClient::new());
        let naming = TableNaming::dated("logstash", "_", "%Y");
        let output = BigQueryOutput::start(settings(dir.path(), naming), client.clone()).unwrap();

        let first = output.publish(batch(&["{}"]));
        let second = output.publish(batch(&["{}"]));

        assert!(matches!(first, PublishOutcome::Delivered { .. }));
        assert!(matches!(second, PublishOutcome::Delivered { .. }));
        assert_eq!(client.create_calls(), 1);
        assert_eq!(output.stats().tables_created, 1);

        let table = first.table().unwrap().to_string();
        assert!(table.starts_with("logstash_"));
        assert!(client.schema_of("ds", &table).is_some());
    }

    #[test]
    fn test_existence_check_failure_degrades_to_append() {
        let dir = tempfile::tempdir().unwrap();
        let client = Arc::new(MemoryClient::new());
        client.fail_exists(true);
        let naming = TableNaming::dated("logstash", "_", "%Y");
        let output = BigQueryOutput::start(settings(dir.path(), naming), client.clone()).unwrap();

        let outcome = output.publish(batch(&["{}"]));

        assert!(matches!(outcome, PublishOutcome::Failed { spilled: true, .. }));
        assert_eq!(client.create_calls(), 0);
        assert_eq!(client.append_calls(), 1);
    }

    #[test]
    fn test_create_failure_spills_batch() {
        let dir = tempfile::tempdir().unwrap();
        let client = Arc::new(MemoryClient::new());
        client.fail_create(true);
        let naming = TableNaming::dated("logstash", "_", "%Y");
        let output = BigQueryOutput::start(settings(dir.path(), naming), client.clone()).unwrap();

        let outcome = output.publish(batch(&[r#"{"n":0}"#]));

        assert!(matches!(
            outcome,
            PublishOutcome::Failed { rows: 1, spilled: true, .. }
        ));
        assert_eq!(client.create_calls(), 1);
        assert_eq!(client.append_calls(), 1);
        assert_eq!(spilled_lines(dir.path()), vec![r#"{"n":0}"#.to_string()]);
        assert_eq!(output.stats().tables_created, 0);
    }

    #[test]
    fn test_start_rejects_bad_date_pattern() {
        let dir = tempfile::tempdir().unwrap();
        let naming = TableNaming::dated("x", "_", "%Q");
        let result = BigQueryOutput::start(settings(dir.path(), naming), Arc::new(MemoryClient::new()));

        assert!(matches!(
            result,
            Err(OutputError::Config(ConfigError::Invalid(_)))
        ));
    }

    #[test]
    fn test_unresolvable_table_spills_instead_of_panicking() {
        let dir = tempfile::tempdir().unwrap();
        let client = Arc::new(MemoryClient::new());
        let pipeline = Pipeline {
            client: client.clone(),
            dataset: "ds".into(),
            naming: TableNaming::dated("x-y", "_", "%Q"),
            schema: None,
            insert_options: InsertOptions::default(),
            batcher: Batcher::new(1, 1_000),
            error_sink: ErrorSink::new(dir.path()),
            stats: OutputStats::default(),
        };

        let outcome = pipeline.publish(batch(&["{}"]));

        assert_eq!(
            outcome,
            PublishOutcome::Failed {
                table: "x_y".into(),
                rows: 1,
                spilled: true
            }
        );
        assert_eq!(client.append_calls(), 0);
        assert_eq!(pipeline.stats.snapshot().rows_spilled, 1);
    }

    #[test]
    fn test_close_flushes_once() {
        let dir = tempfile::tempdir().unwrap();
        let client = Arc::new(MemoryClient::new().with_table("ds", "events"));
        let mut config = settings(dir.path(), fixed());
        config.batch_size = 100;
        config.flush_interval = Some(Duration::from_secs(3600));
        let output = BigQueryOutput::start(config, client.clone()).unwrap();

        output.receive(json!({"message": "pending"}));
        output.close();
        output.close();

        assert!(output.is_closed());
        assert_eq!(client.rows("ds", "events").len(), 1);
        assert_eq!(client.append_calls(), 1);
    }

    #[test]
    fn test_drop_closes() {
        let dir = tempfile::tempdir().unwrap();
        let client = Arc::new(MemoryClient::new().with_table("ds", "events"));
        let mut config = settings(dir.path(), fixed());
        config.batch_size = 100;
        {
            let output = BigQueryOutput::start(config, client.clone()).unwrap();
            output.receive(json!({"message": "pending"}));
        }
        assert_eq!(client.rows("ds", "events").len(), 1);
    }
}
