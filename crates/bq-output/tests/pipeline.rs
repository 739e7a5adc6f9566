// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

#![allow(clippy::uninlined_format_args)] // Test code readability over pedantic
#![allow(clippy::missing_panics_doc)] // Tests panic on failure

//! End-to-end pipeline tests
//!
//! Drives `BigQueryOutput` from TOML configuration through the in-memory
//! delivery client, checking delivery, table creation and spill files.

use bq_output::{BigQueryOutput, MemoryClient, OutputConfig, PublishOutcome};
use serde_json::json;
use std::path::Path;
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

fn config(error_dir: &Path, extra: &str) -> OutputConfig {
    let content = format!(
        r#"
        project_id = "test-project"
        dataset = "logs"
        csv_schema = "timestamp:TIMESTAMP,message:STRING,n:INTEGER"
        error_directory = "{}"
        {}
        "#,
        error_dir.display(),
        extra
    );
    OutputConfig::from_toml(&content).expect("valid configuration")
}

fn spill_files(dir: &Path) -> Vec<(String, String)> {
    let Ok(entries) = std::fs::read_dir(dir) else {
        return Vec::new();
    };
    let mut files: Vec<(String, String)> = entries
        .map(|e| {
            let path = e.unwrap().path();
            let name = path.file_name().unwrap().to_string_lossy().into_owned();
            (name, std::fs::read_to_string(&path).unwrap())
        })
        .collect();
    files.sort();
    files
}

#[test]
fn test_dated_table_created_and_rows_sanitized() {
    let dir = tempfile::tempdir().unwrap();
    let client = Arc::new(MemoryClient::new());
    let output = BigQueryOutput::from_config(
        &config(dir.path(), "batch_size = 2"),
        client.clone(),
    )
    .unwrap();

    output.receive(json!({"@timestamp": "2012-09-08T07:06:00Z", "message": "one"}));
    let outcome = output
        .receive(json!({"@timestamp": "2012-09-08T07:06:01Z", "message": "@two", "meta": {"@x": 1}}))
        .expect("second event completes the batch");

    let (table, rows) = match outcome {
        PublishOutcome::Delivered { table, rows } => (table, rows),
        other => panic!("unexpected outcome {:?}", other),
    };
    assert_eq!(rows, 2);
    assert!(table.starts_with("logstash_"));
    assert!(table.chars().all(|c| c.is_ascii_alphanumeric() || c == '_'));

    let stored = client.rows("logs", &table);
    assert_eq!(stored[0].json["timestamp"], "2012-09-08T07:06:00Z");
    assert_eq!(stored[1].json["message"], "@two");
    assert_eq!(stored[1].json["meta"], json!({"x": 1}));

    let schema = client.schema_of("logs", &table).expect("table created with schema");
    assert_eq!(schema.fields.len(), 3);
    assert!(spill_files(dir.path()).is_empty());
}

#[test]
fn test_partial_failure_spills_rejected_row() {
    let dir = tempfile::tempdir().unwrap();
    let client = Arc::new(MemoryClient::new().with_table("logs", "events"));
    client.fail_rows([1]);
    let output = BigQueryOutput::from_config(
        &config(
            dir.path(),
            "table_name = \"events\"\nskip_invalid_rows = true\nbatch_size = 2",
        ),
        client.clone(),
    )
    .unwrap();

    output.receive(json!({"n": 0}));
    output.receive(json!({"n": 1}));

    assert_eq!(client.rows("logs", "events").len(), 1);
    let files = spill_files(dir.path());
    assert_eq!(files.len(), 1);
    assert!(files[0].0.starts_with("events-") && files[0].0.ends_with(".log"));
    assert_eq!(files[0].1, "{\"n\":1}\n");
}

#[test]
fn test_append_error_spills_everything() {
    let dir = tempfile::tempdir().unwrap();
    let client = Arc::new(MemoryClient::new().with_table("logs", "events"));
    client.fail_append(true);
    let output = BigQueryOutput::from_config(
        &config(dir.path(), "table_name = \"events\"\nbatch_size = 2"),
        client.clone(),
    )
    .unwrap();

    output.receive(json!({"n": 0}));
    let outcome = output.receive(json!({"n": 1}));

    assert!(matches!(
        outcome,
        Some(PublishOutcome::Failed { rows: 2, spilled: true, .. })
    ));
    let lines: Vec<String> = spill_files(dir.path())
        .into_iter()
        .flat_map(|(_, content)| content.lines().map(str::to_string).collect::<Vec<_>>())
        .collect();
    assert_eq!(lines, vec!["{\"n\":0}".to_string(), "{\"n\":1}".to_string()]);
}

#[test]
fn test_byte_threshold_publishes_early() {
    let dir = tempfile::tempdir().unwrap();
    let client = Arc::new(MemoryClient::new().with_table("logs", "events"));
    let output = BigQueryOutput::from_config(
        &config(
            dir.path(),
            "table_name = \"events\"\nbatch_size = 100\nbatch_size_bytes = 64",
        ),
        client.clone(),
    )
    .unwrap();

    assert!(output.receive(json!({"message": "short"})).is_none());
    let outcome = output.receive(json!({"message": "x".repeat(100)}));

    assert!(matches!(outcome, Some(PublishOutcome::Delivered { rows: 2, .. })));
    assert_eq!(output.pending(), 0);
}

#[test]
fn test_periodic_flush_delivers_partial_batch() {
    let dir = tempfile::tempdir().unwrap();
    let client = Arc::new(MemoryClient::new().with_table("logs", "events"));
    let output = BigQueryOutput::from_config(
        &config(
            dir.path(),
            "table_name = \"events\"\nbatch_size = 100\nflush_interval_secs = 1",
        ),
        client.clone(),
    )
    .unwrap();

    output.receive(json!({"message": "lonely"}));

    let deadline = Instant::now() + Duration::from_secs(10);
    while client.rows("logs", "events").is_empty() && Instant::now() < deadline {
        thread::sleep(Duration::from_millis(50));
    }
    assert_eq!(client.rows("logs", "events").len(), 1);
}

fn spilled_line_count(dir: &Path) -> usize {
    spill_files(dir)
        .iter()
        .map(|(_, content)| content.lines().count())
        .sum()
}

fn wait_for(mut done: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + Duration::from_secs(10);
    while !done() {
        if Instant::now() >= deadline {
            return false;
        }
        thread::sleep(Duration::from_millis(50));
    }
    true
}

#[test]
fn test_flush_thread_survives_failed_publish() {
    let dir = tempfile::tempdir().unwrap();
    let client = Arc::new(MemoryClient::new().with_table("logs", "events"));
    client.fail_append(true);
    let output = BigQueryOutput::from_config(
        &config(
            dir.path(),
            "table_name = \"events\"\nbatch_size = 100\nflush_interval_secs = 1",
        ),
        client.clone(),
    )
    .unwrap();

    output.receive(json!({"n": 0}));
    assert!(wait_for(|| spilled_line_count(dir.path()) == 1));

    output.receive(json!({"n": 1}));
    assert!(wait_for(|| spilled_line_count(dir.path()) == 2));

    assert!(!output.is_closed());
    let stats = output.stats();
    assert_eq!(stats.delivery_errors, 2);
    assert_eq!(stats.rows_spilled, 2);
    assert!(client.rows("logs", "events").is_empty());
}

#[test]
fn test_close_is_prompt_and_flushes() {
    let dir = tempfile::tempdir().unwrap();
    let client = Arc::new(MemoryClient::new().with_table("logs", "events"));
    let output = BigQueryOutput::from_config(
        &config(
            dir.path(),
            "table_name = \"events\"\nbatch_size = 100\nflush_interval_secs = 3600",
        ),
        client.clone(),
    )
    .unwrap();

    output.receive(json!({"message": "a"}));
    output.receive(json!({"message": "b"}));

    let start = Instant::now();
    output.close();
    assert!(start.elapsed() < Duration::from_secs(5));
    assert_eq!(client.rows("logs", "events").len(), 2);
    assert_eq!(output.stats().batches_published, 1);
}

#[test]
fn test_concurrent_receivers_deliver_every_event() {
    let dir = tempfile::tempdir().unwrap();
    let client = Arc::new(MemoryClient::new().with_table("logs", "events"));
    let output = Arc::new(
        BigQueryOutput::from_config(
            &config(dir.path(), "table_name = \"events\"\nbatch_size = 7"),
            client.clone(),
        )
        .unwrap(),
    );

    let workers: Vec<_> = (0..4)
        .map(|w| {
            let output = Arc::clone(&output);
            thread::spawn(move || {
                for i in 0..100 {
                    output.receive(json!({"worker": w, "n": i}));
                }
            })
        })
        .collect();
    for worker in workers {
        worker.join().unwrap();
    }
    output.close();

    assert_eq!(client.rows("logs", "events").len(), 400);
    let stats = output.stats();
    assert_eq!(stats.events_received, 400);
    assert_eq!(stats.rows_delivered, 400);
    assert_eq!(stats.rows_spilled, 0);
}
