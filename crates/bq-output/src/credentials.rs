// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! OAuth2 bearer tokens for the REST client.
//!
//! # Sources
//!
//! - **Key file** -- a credentials JSON file, either a service-account key
//!   (an RS256-signed JWT assertion is exchanged for an access token at the
//!   key's `token_uri`) or an `authorized_user` file written by
//!   `gcloud auth application-default login` (refresh-token grant)
//! - **Metadata server** -- default service account of the current instance
//! - **Static token** -- a pre-issued access token, never refreshed
//!
//! Tokens are cached and refreshed shortly before they expire.

use base64::{engine::general_purpose, Engine as _};
use parking_lot::Mutex;
use ring::rand::SystemRandom;
use ring::signature::{self, RsaKeyPair};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};
use thiserror::Error;

/// OAuth2 scope for BigQuery.
pub const BIGQUERY_SCOPE: &str = "https://www.googleapis.com/auth/bigquery";

/// Metadata server token endpoint.
pub const METADATA_TOKEN_URL: &str =
    "http://metadata.google.internal/computeMetadata/v1/instance/service-accounts/default/token";

/// Environment variable pointing at application default credentials.
pub const CREDENTIALS_ENV: &str = "GOOGLE_APPLICATION_CREDENTIALS";

const JWT_BEARER_GRANT: &str = "urn:ietf:params:oauth:grant-type:jwt-bearer";
const REFRESH_TOKEN_GRANT: &str = "refresh_token";
const DEFAULT_TOKEN_URI: &str = "https://oauth2.googleapis.com/token";
const ASSERTION_LIFETIME_SECS: u64 = 3600;
const REFRESH_MARGIN: Duration = Duration::from_secs(60);

/// Credential errors.
#[derive(Debug, Error)]
pub enum CredentialsError {
    #[error("key file must be an absolute path: {0}")]
    RelativeKeyFile(PathBuf),

    #[error("key file not found: {0}")]
    MissingKeyFile(PathBuf),

    #[error("failed to read key file {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("invalid key file: {0}")]
    InvalidKey(String),

    #[error("signing failed: {0}")]
    Signing(String),

    #[error("token request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("token endpoint returned {status}: {body}")]
    TokenEndpoint { status: u16, body: String },
}

/// Where access tokens come from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CredentialSource {
    KeyFile(PathBuf),
    MetadataServer,
    StaticToken(String),
}

impl CredentialSource {
    /// Pick a source: explicit token, explicit key file,
    /// `GOOGLE_APPLICATION_CREDENTIALS`, then the metadata server.
    pub fn resolve(
        key_file: Option<&Path>,
        access_token: Option<&str>,
    ) -> Result<Self, CredentialsError> {
        if let Some(token) = access_token {
            return Ok(Self::StaticToken(token.to_string()));
        }
        if let Some(path) = key_file {
            return Self::key_file(path);
        }
        match std::env::var_os(CREDENTIALS_ENV) {
            Some(path) if !path.is_empty() => Self::key_file(Path::new(&path)),
            _ => Ok(Self::MetadataServer),
        }
    }

    /// Key file source; the path must be absolute and exist.
    pub fn key_file(path: &Path) -> Result<Self, CredentialsError> {
        if !path.is_absolute() {
            return Err(CredentialsError::RelativeKeyFile(path.to_path_buf()));
        }
        if !path.is_file() {
            return Err(CredentialsError::MissingKeyFile(path.to_path_buf()));
        }
        Ok(Self::KeyFile(path.to_path_buf()))
    }
}

/// Contents of a credentials file, selected by its `type` field.
///
/// A file without `type` is read as a service-account key.
#[derive(Debug, Clone)]
pub enum CredentialsFile {
    ServiceAccount(ServiceAccountKey),
    AuthorizedUser(AuthorizedUser),
}

impl CredentialsFile {
    pub fn from_file(path: &Path) -> Result<Self, CredentialsError> {
        let raw = std::fs::read_to_string(path).map_err(|source| CredentialsError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_json(&raw)
    }

    pub fn from_json(raw: &str) -> Result<Self, CredentialsError> {
        let value: serde_json::Value =
            serde_json::from_str(raw).map_err(|e| CredentialsError::InvalidKey(e.to_string()))?;
        let kind = value
            .get("type")
            .and_then(serde_json::Value::as_str)
            .unwrap_or("service_account")
            .to_string();
        let invalid = |e: serde_json::Error| CredentialsError::InvalidKey(e.to_string());
        match kind.as_str() {
            "service_account" => serde_json::from_value(value)
                .map(Self::ServiceAccount)
                .map_err(invalid),
            "authorized_user" => serde_json::from_value(value)
                .map(Self::AuthorizedUser)
                .map_err(invalid),
            other => Err(CredentialsError::InvalidKey(format!(
                "unsupported credentials type '{}'",
                other
            ))),
        }
    }
}

/// User credentials from `gcloud auth application-default login`.
#[derive(Clone, Deserialize)]
pub struct AuthorizedUser {
    pub client_id: String,
    pub client_secret: String,
    pub refresh_token: String,
    #[serde(default)]
    pub token_uri: Option<String>,
}

impl AuthorizedUser {
    fn token_uri(&self) -> &str {
        self.token_uri.as_deref().unwrap_or(DEFAULT_TOKEN_URI)
    }

    /// Form fields of the refresh-token grant.
    fn refresh_form(&self) -> [(&'static str, &str); 4] {
        [
            ("grant_type", REFRESH_TOKEN_GRANT),
            ("client_id", self.client_id.as_str()),
            ("client_secret", self.client_secret.as_str()),
            ("refresh_token", self.refresh_token.as_str()),
        ]
    }
}

impl std::fmt::Debug for AuthorizedUser {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AuthorizedUser")
            .field("client_id", &self.client_id)
            .field("token_uri", &self.token_uri())
            .finish_non_exhaustive()
    }
}

/// Service-account key (the fields we use).
#[derive(Debug, Clone, Deserialize)]
pub struct ServiceAccountKey {
    pub client_email: String,
    pub private_key: String,
    #[serde(default)]
    pub private_key_id: Option<String>,
    #[serde(default)]
    pub token_uri: Option<String>,
}

impl ServiceAccountKey {
    pub fn from_json(raw: &str) -> Result<Self, CredentialsError> {
        serde_json::from_str(raw).map_err(|e| CredentialsError::InvalidKey(e.to_string()))
    }

    fn token_uri(&self) -> &str {
        self.token_uri.as_deref().unwrap_or(DEFAULT_TOKEN_URI)
    }

    /// Build a signed JWT assertion issued at `now` (unix seconds).
    pub fn assertion(&self, scope: &str, now: u64) -> Result<String, CredentialsError> {
        let mut header = serde_json::json!({ "alg": "RS256", "typ": "JWT" });
        if let Some(kid) = &self.private_key_id {
            header["kid"] = serde_json::Value::String(kid.clone());
        }
        let claims = serde_json::json!({
            "iss": self.client_email,
            "scope": scope,
            "aud": self.token_uri(),
            "iat": now,
            "exp": now + ASSERTION_LIFETIME_SECS,
        });

        let encode = |value: &serde_json::Value| general_purpose::URL_SAFE_NO_PAD.encode(value.to_string());
        let signing_input = format!("{}.{}", encode(&header), encode(&claims));
        let signature = sign_rs256(signing_input.as_bytes(), self.private_key.as_bytes())?;

        Ok(format!(
            "{}.{}",
            signing_input,
            general_purpose::URL_SAFE_NO_PAD.encode(signature)
        ))
    }
}

/// RSASSA-PKCS1-v1_5 with SHA-256 over `data`, key given as PKCS#8 PEM.
fn sign_rs256(data: &[u8], private_key_pem: &[u8]) -> Result<Vec<u8>, CredentialsError> {
    let pem = pem::parse(private_key_pem)
        .map_err(|e| CredentialsError::InvalidKey(format!("failed to parse private key PEM: {}", e)))?;
    let key_pair = RsaKeyPair::from_pkcs8(pem.contents())
        .map_err(|e| CredentialsError::InvalidKey(format!("not an RSA PKCS#8 key: {}", e)))?;

    let rng = SystemRandom::new();
    let mut signature = vec![0u8; key_pair.public().modulus_len()];
    key_pair
        .sign(&signature::RSA_PKCS1_SHA256, &rng, data, &mut signature)
        .map_err(|e| CredentialsError::Signing(format!("{:?}", e)))?;
    Ok(signature)
}

#[derive(Debug, Deserialize)]
struct TokenResponse {
    access_token: String,
    #[serde(default)]
    expires_in: Option<u64>,
}

#[derive(Debug, Clone)]
struct CachedToken {
    value: String,
    refresh_at: Option<Instant>,
}

impl CachedToken {
    fn is_fresh(&self, now: Instant) -> bool {
        self.refresh_at.map_or(true, |at| now < at)
    }
}

/// Token provider with a refresh-ahead cache.
pub struct TokenProvider {
    source: CredentialSource,
    http: reqwest::blocking::Client,
    cached: Mutex<Option<CachedToken>>,
}

impl TokenProvider {
    pub fn new(source: CredentialSource, http: reqwest::blocking::Client) -> Self {
        Self {
            source,
            http,
            cached: Mutex::new(None),
        }
    }

    pub fn source(&self) -> &CredentialSource {
        &self.source
    }

    /// Current access token, fetching a new one if the cached one is stale.
    pub fn token(&self) -> Result<String, CredentialsError> {
        let key_file = match &self.source {
            CredentialSource::StaticToken(token) => return Ok(token.clone()),
            CredentialSource::KeyFile(path) => Some(path.as_path()),
            CredentialSource::MetadataServer => None,
        };

        let mut cached = self.cached.lock();
        if let Some(token) = cached.as_ref().filter(|t| t.is_fresh(Instant::now())) {
            return Ok(token.value.clone());
        }

        let response = match key_file {
            Some(path) => self.fetch_with_key(path)?,
            None => self.fetch_from_metadata()?,
        };
        tracing::debug!(expires_in = ?response.expires_in, "Fetched access token");

        let refresh_at = response
            .expires_in
            .map(|secs| Instant::now() + Duration::from_secs(secs).saturating_sub(REFRESH_MARGIN));
        let token = CachedToken {
            value: response.access_token,
            refresh_at,
        };
        let value = token.value.clone();
        *cached = Some(token);
        Ok(value)
    }

    /// Drop the cached token (e.g. after a 401).
    pub fn invalidate(&self) {
        *self.cached.lock() = None;
    }

    fn fetch_with_key(&self, path: &Path) -> Result<TokenResponse, CredentialsError> {
        let key = match CredentialsFile::from_file(path)? {
            CredentialsFile::ServiceAccount(key) => key,
            CredentialsFile::AuthorizedUser(user) => return self.fetch_with_refresh_token(&user),
        };
        let now = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_secs())
            .unwrap_or(0);
        let assertion = key.assertion(BIGQUERY_SCOPE, now)?;

        let response = self
            .http
            .post(key.token_uri())
            .form(&[("grant_type", JWT_BEARER_GRANT), ("assertion", assertion.as_str())])
            .send()?;
        read_token(response)
    }

    fn fetch_with_refresh_token(
        &self,
        user: &AuthorizedUser,
    ) -> Result<TokenResponse, CredentialsError> {
        let response = self
            .http
            .post(user.token_uri())
            .form(&user.refresh_form())
            .send()?;
        read_token(response)
    }

    fn fetch_from_metadata(&self) -> Result<TokenResponse, CredentialsError> {
        let response = self
            .http
            .get(METADATA_TOKEN_URL)
            .header("Metadata-Flavor", "Google")
            .send()?;
        read_token(response)
    }
}

impl std::fmt::Debug for TokenProvider {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TokenProvider")
            .field("source", &match &self.source {
                CredentialSource::StaticToken(_) => "static-token".to_string(),
                other => format!("{:?}", other),
            })
            .finish()
    }
}

fn read_token(response: reqwest::blocking::Response) -> Result<TokenResponse, CredentialsError> {
    let status = response.status();
    if !status.is_success() {
        let body = response.text().unwrap_or_default();
        return Err(CredentialsError::TokenEndpoint {
            status: status.as_u16(),
            body,
        });
    }
    Ok(response.json()?)
}
