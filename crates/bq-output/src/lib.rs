// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Batching BigQuery Output
//!
//! Buffers structured log events and streams them into BigQuery tables.
//!
//! # Features
//!
//! - **Batching**: Count and byte thresholds, whichever is reached first
//! - **Periodic Flush**: Background thread drains partial batches on an interval
//! - **Table Naming**: Fixed table or time-derived tables created on first use
//! - **Error Spill**: Rows that could not be delivered are written to local files
//! - **Pluggable Delivery**: REST client, or an in-memory store for dry runs
//!
//! # Example
//!
//! ```rust,ignore
//! use bq_output::{BigQueryOutput, MemoryClient, OutputConfig};
//! use std::sync::Arc;
//!
//! let config = OutputConfig::from_file("bq-output.toml")?;
//! let output = BigQueryOutput::from_config(&config, Arc::new(MemoryClient::new()))?;
//!
//! output.receive(serde_json::json!({"@timestamp": "2012-09-08T07:06:00Z", "message": "hi"}));
//! output.close();
//! ```

pub mod batcher;
pub mod config;
pub mod credentials;
pub mod delivery;
pub mod encode;
pub mod error_sink;
pub mod flush;
pub mod output;
pub mod schema;
pub mod table;

pub use batcher::{Batch, Batcher, Message};
pub use config::{ConfigError, OutputConfig};
pub use credentials::{CredentialSource, CredentialsError, CredentialsFile};
pub use delivery::{
    DeliveryClient, DeliveryError, DeliveryOutcome, InsertOptions, MemoryClient, RestClient,
    RowError,
};
pub use error_sink::ErrorSink;
pub use flush::{FlushScheduler, StopSignal};
pub use output::{
    BigQueryOutput, OutputError, OutputSettings, OutputStatsSnapshot, PublishOutcome,
};
pub use schema::{Field, FieldMode, FieldType, SchemaDescription, SchemaError, TableSchema};
pub use table::TableNaming;
