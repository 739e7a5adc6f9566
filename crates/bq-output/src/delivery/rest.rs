// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! BigQuery v2 REST client.
//!
//! Uses streaming inserts (`tabledata.insertAll`). Every call is blocking and
//! carries a bearer token from the [`TokenProvider`].

use super::{build_rows, log_row_errors, DeliveryClient, DeliveryError, DeliveryOutcome};
use super::{InsertOptions, RowError};
use crate::batcher::Message;
use crate::credentials::{CredentialSource, TokenProvider};
use crate::schema::TableSchema;
use reqwest::blocking::{Client, RequestBuilder, Response};
use reqwest::StatusCode;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::time::Duration;

/// Public API root.
pub const DEFAULT_ENDPOINT: &str = "https://bigquery.googleapis.com/bigquery/v2";

/// REST delivery client for one project.
#[derive(Debug)]
pub struct RestClient {
    endpoint: String,
    project_id: String,
    http: Client,
    tokens: TokenProvider,
}

// ============================================================================
// API Types
// ============================================================================

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct TableReference<'a> {
    project_id: &'a str,
    dataset_id: &'a str,
    table_id: &'a str,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct TableResource<'a> {
    table_reference: TableReference<'a>,
    schema: Value,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct InsertAllRequest<'a> {
    kind: &'static str,
    skip_invalid_rows: bool,
    ignore_unknown_values: bool,
    rows: Vec<InsertAllRow<'a>>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct InsertAllRow<'a> {
    #[serde(skip_serializing_if = "Option::is_none")]
    insert_id: Option<&'a str>,
    json: &'a Map<String, Value>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct InsertAllResponse {
    #[serde(default)]
    insert_errors: Vec<InsertErrors>,
}

#[derive(Debug, Deserialize)]
struct InsertErrors {
    index: usize,
    #[serde(default)]
    errors: Vec<ErrorProto>,
}

#[derive(Debug, Deserialize)]
struct ErrorProto {
    #[serde(default)]
    reason: Option<String>,
    #[serde(default)]
    location: Option<String>,
    #[serde(default)]
    message: Option<String>,
}

impl From<ErrorProto> for RowError {
    fn from(e: ErrorProto) -> Self {
        RowError {
            location: e.location.filter(|l| !l.is_empty()),
            message: e.message.unwrap_or_default(),
            reason: e.reason.unwrap_or_default(),
        }
    }
}

// ============================================================================
// Client
// ============================================================================

impl RestClient {
    /// Create a client.
    ///
    /// # Arguments
    /// - `endpoint` - API root, e.g. [`DEFAULT_ENDPOINT`]
    /// - `project_id` - Project owning the datasets
    /// - `credentials` - Token source
    /// - `timeout` - Per-request timeout
    pub fn new(
        endpoint: &str,
        project_id: &str,
        credentials: CredentialSource,
        timeout: Duration,
    ) -> Result<Self, DeliveryError> {
        let http = Client::builder()
            .timeout(timeout)
            .user_agent(concat!("bq-output/", env!("CARGO_PKG_VERSION")))
            .build()?;

        Ok(Self {
            endpoint: endpoint.trim_end_matches('/').to_string(),
            project_id: project_id.to_string(),
            tokens: TokenProvider::new(credentials, http.clone()),
            http,
        })
    }

    fn tables_url(&self, dataset: &str) -> String {
        format!(
            "{}/projects/{}/datasets/{}/tables",
            self.endpoint, self.project_id, dataset
        )
    }

    fn authorized(&self, request: RequestBuilder) -> Result<RequestBuilder, DeliveryError> {
        Ok(request.bearer_auth(self.tokens.token()?))
    }

    fn send(&self, request: RequestBuilder) -> Result<Response, DeliveryError> {
        let response = self.authorized(request)?.send()?;
        if response.status() == StatusCode::UNAUTHORIZED {
            self.tokens.invalidate();
        }
        Ok(response)
    }
}

/// Turn a non-success response into an API error.
fn check_status(response: Response) -> Result<Response, DeliveryError> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }

    let body = response.text().unwrap_or_default();
    let message = serde_json::from_str::<Value>(&body)
        .ok()
        .and_then(|v| v["error"]["message"].as_str().map(str::to_string))
        .unwrap_or(body);

    Err(DeliveryError::Api {
        status: status.as_u16(),
        message,
    })
}

impl DeliveryClient for RestClient {
    fn table_exists(&self, dataset: &str, table: &str) -> Result<bool, DeliveryError> {
        let url = format!("{}/{}", self.tables_url(dataset), table);
        let response = self.send(self.http.get(&url))?;

        if response.status() == StatusCode::NOT_FOUND {
            return Ok(false);
        }
        check_status(response)?;
        Ok(true)
    }

    fn create_table(
        &self,
        dataset: &str,
        table: &str,
        schema: &TableSchema,
    ) -> Result<(), DeliveryError> {
        let body = TableResource {
            table_reference: TableReference {
                project_id: &self.project_id,
                dataset_id: dataset,
                table_id: table,
            },
            schema: schema.to_json(),
        };

        let response = self.send(self.http.post(self.tables_url(dataset)).json(&body))?;
        check_status(response)?;
        tracing::info!(dataset, table, "Created table");
        Ok(())
    }

    fn append(
        &self,
        dataset: &str,
        table: &str,
        rows: &[Message],
        options: &InsertOptions,
    ) -> Result<DeliveryOutcome, DeliveryError> {
        let (decoded, mut rejected) = build_rows(rows, options);

        if !decoded.is_empty() {
            let request = InsertAllRequest {
                kind: "bigquery#tableDataInsertAllRequest",
                skip_invalid_rows: options.skip_invalid_rows,
                ignore_unknown_values: options.ignore_unknown_values,
                rows: decoded
                    .iter()
                    .map(|row| InsertAllRow {
                        insert_id: row.insert_id.as_deref(),
                        json: &row.json,
                    })
                    .collect(),
            };

            let url = format!("{}/{}/insertAll", self.tables_url(dataset), table);
            let response = check_status(self.send(self.http.post(&url).json(&request))?)?;
            let parsed: InsertAllResponse = response.json()?;

            // Response indices refer to the request rows, not the batch.
            for insert_error in parsed.insert_errors {
                let Some(row) = decoded.get(insert_error.index) else {
                    return Err(DeliveryError::Response(format!(
                        "insert error for unknown row {}",
                        insert_error.index
                    )));
                };
                rejected
                    .entry(row.index)
                    .or_default()
                    .extend(insert_error.errors.into_iter().map(RowError::from));
            }
        }

        log_row_errors(table, &rejected);
        Ok(DeliveryOutcome::from_errors(rejected))
    }
}
