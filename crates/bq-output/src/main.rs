// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! BigQuery output CLI
//!
//! Streams newline-delimited JSON events into BigQuery.
//!
//! # Usage
//!
//! ```bash
//! # Stream events from stdin
//! tail -F app.log.json | bq-output --config bq-output.toml
//!
//! # Replay a file with 4 workers
//! bq-output --config bq-output.toml --input events.ndjson --workers 4
//!
//! # Validate configuration and print the table schema
//! bq-output --config bq-output.toml --check
//!
//! # Exercise batching and spill without touching BigQuery
//! bq-output --config bq-output.toml --input events.ndjson --dry-run
//! ```

use anyhow::{Context, Result};
use bq_output::{
    BigQueryOutput, DeliveryClient, MemoryClient, OutputConfig, RestClient, TableNaming,
};
use clap::Parser;
use crossbeam::channel::{self, Receiver, RecvTimeoutError, Sender};
use serde_json::Value;
use std::fs::File;
use std::io::{self, BufRead, BufReader};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;
use tracing_subscriber::{fmt, EnvFilter};

const EVENT_QUEUE_DEPTH: usize = 4096;
const WORKER_POLL: Duration = Duration::from_millis(100);

#[derive(Parser)]
#[command(name = "bq-output")]
#[command(author = "naskel.com")]
#[command(version = env!("CARGO_PKG_VERSION"))]
#[command(about = "Batching BigQuery output - stream JSON events into BigQuery tables")]
#[command(long_about = None)]
struct Cli {
    /// Configuration file (TOML)
    #[arg(short, long)]
    config: PathBuf,

    /// Input file of newline-delimited JSON events (use - for stdin)
    #[arg(short, long)]
    input: Option<PathBuf>,

    /// Number of worker threads feeding the output
    #[arg(short, long, default_value = "1")]
    workers: usize,

    /// Deliver to an in-memory store instead of BigQuery
    #[arg(long)]
    dry_run: bool,

    /// Validate the configuration, print the schema and exit
    #[arg(long)]
    check: bool,

    /// Verbose mode (debug logs)
    #[arg(short, long)]
    verbose: bool,
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    let filter = if cli.verbose {
        EnvFilter::new("bq_output=debug")
    } else {
        EnvFilter::new("bq_output=info")
    };
    fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(io::stderr)
        .init();

    let config = OutputConfig::from_file(&cli.config)
        .with_context(|| format!("Failed to load configuration {}", cli.config.display()))?;

    if cli.check {
        return print_schema(&config);
    }

    let memory = cli.dry_run.then(|| Arc::new(dry_run_client(&config)));
    let client: Arc<dyn DeliveryClient> = match &memory {
        Some(memory) => Arc::clone(memory) as Arc<dyn DeliveryClient>,
        None => Arc::new(
            RestClient::new(
                &config.endpoint,
                &config.project_id,
                config
                    .credential_source()
                    .context("Failed to resolve credentials")?,
                config.request_timeout(),
            )
            .context("Failed to create REST client")?,
        ),
    };

    let output = Arc::new(
        BigQueryOutput::from_config(&config, client).context("Failed to start output")?,
    );

    tracing::info!(
        project = %config.project_id,
        dataset = %config.dataset,
        workers = cli.workers,
        dry_run = cli.dry_run,
        "Starting bq-output"
    );

    let stop = Arc::new(AtomicBool::new(false));
    ctrlc_handler(Arc::clone(&stop));

    let (tx, rx) = channel::bounded::<Value>(EVENT_QUEUE_DEPTH);
    let input = cli.input.clone();
    let reader_stop = Arc::clone(&stop);
    // Not joined: on Ctrl+C it may be blocked on stdin.
    thread::Builder::new()
        .name("bq-output-reader".to_string())
        .spawn(move || {
            if let Err(e) = read_events(input.as_deref(), &tx, &reader_stop) {
                tracing::error!(error = %e, "Input error");
            }
        })
        .context("Failed to spawn reader thread")?;

    let workers = spawn_workers(cli.workers.max(1), &output, &rx, &stop)?;
    for worker in workers {
        if worker.join().is_err() {
            tracing::error!("Worker thread panicked");
        }
    }
    let drained = drain_queue(&rx, &output);
    if drained > 0 {
        tracing::info!(events = drained, "Drained queued events");
    }
    drop(rx);

    output.close();

    let stats = output.stats();
    tracing::info!(
        events_received = stats.events_received,
        batches_published = stats.batches_published,
        rows_delivered = stats.rows_delivered,
        rows_spilled = stats.rows_spilled,
        rows_lost = stats.rows_lost,
        "Shutdown complete"
    );

    if let Some(memory) = memory {
        for table in memory.tables(&config.dataset) {
            tracing::info!(
                table = %table,
                rows = memory.rows(&config.dataset, &table).len(),
                "Dry-run table contents"
            );
        }
    }

    Ok(())
}

/// In-memory client; a fixed table is assumed to exist already.
fn dry_run_client(config: &OutputConfig) -> MemoryClient {
    match config.table_naming() {
        TableNaming::Fixed(table) => MemoryClient::new().with_table(&config.dataset, &table),
        TableNaming::Dated { .. } => MemoryClient::new(),
    }
}

fn print_schema(config: &OutputConfig) -> Result<()> {
    match config.schema().context("Invalid schema")? {
        Some(schema) => {
            let json = serde_json::to_string_pretty(&schema.to_json())?;
            println!("{}", json);
        }
        None => println!("null"),
    }
    tracing::info!(naming = ?config.table_naming(), "Configuration OK");
    Ok(())
}

/// Read events until EOF or stop. Unparseable lines are skipped.
fn read_events(input: Option<&Path>, tx: &Sender<Value>, stop: &AtomicBool) -> io::Result<()> {
    let reader: Box<dyn BufRead> = match input {
        Some(path) if path != Path::new("-") => Box::new(BufReader::new(File::open(path)?)),
        _ => Box::new(BufReader::new(io::stdin())),
    };

    for (number, line) in reader.lines().enumerate() {
        if stop.load(Ordering::Relaxed) {
            break;
        }
        let line = line?;
        let Some(event) = parse_line(&line, number + 1) else {
            continue;
        };
        if tx.send(event).is_err() {
            break;
        }
    }
    Ok(())
}

fn parse_line(line: &str, number: usize) -> Option<Value> {
    let line = line.trim();
    if line.is_empty() {
        return None;
    }
    match serde_json::from_str(line) {
        Ok(event) => Some(event),
        Err(e) => {
            tracing::warn!(line = number, error = %e, "Skipping unparseable input line");
            None
        }
    }
}

fn spawn_workers(
    count: usize,
    output: &Arc<BigQueryOutput>,
    rx: &Receiver<Value>,
    stop: &Arc<AtomicBool>,
) -> Result<Vec<JoinHandle<()>>> {
    (0..count)
        .map(|i| {
            let output = Arc::clone(output);
            let rx = rx.clone();
            let stop = Arc::clone(stop);
            thread::Builder::new()
                .name(format!("bq-output-worker-{}", i))
                .spawn(move || loop {
                    if stop.load(Ordering::Relaxed) {
                        break;
                    }
                    match rx.recv_timeout(WORKER_POLL) {
                        Ok(event) => {
                            output.receive(event);
                        }
                        Err(RecvTimeoutError::Timeout) => {}
                        Err(RecvTimeoutError::Disconnected) => break,
                    }
                })
                .context("Failed to spawn worker thread")
        })
        .collect()
}

/// Hand every event still queued to the output. Returns how many.
fn drain_queue(rx: &Receiver<Value>, output: &BigQueryOutput) -> usize {
    rx.try_iter().map(|event| output.receive(event)).count()
}

/// Setup Ctrl+C handler.
fn ctrlc_handler(stop: Arc<AtomicBool>) {
    let _ = ctrlc::set_handler(move || {
        tracing::info!("Received Ctrl+C, shutting down...");
        stop.store(true, Ordering::Relaxed);
    });
}
