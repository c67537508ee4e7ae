//! Schema registry client.
//!
//! Typed operations against the Confluent-compatible surface of the schema
//! registry. Every call is a live request; the client holds no version
//! cache across reconcile passes. The underlying HTTP client is shared
//! across convergence controllers for connection pooling only.


use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use reqwest::StatusCode;
use serde::Deserialize;

use crate::error::RegistryError;

/// The timeout applied to each registry API call.
const API_TIMEOUT: Duration = Duration::from_secs(5);
/// The schema type submitted with every registration.
const SCHEMA_TYPE_AVRO: &str = "AVRO";

/// A result type used for registry operations.
pub type RegistryResult<T> = std::result::Result<T, RegistryError>;

/// Metadata of a registered subject version.
#[derive(Clone, Copy, Debug, Deserialize)]
pub struct VersionMetadata {
    /// The subject-scoped version number.
    pub version: i64,
}

/// The outcome of a successful version registration.
#[derive(Clone, Copy, Debug, Deserialize)]
pub struct RegisteredVersion {
    /// The subject-scoped version number assigned by the registry.
    pub version: i64,
    /// The registry-wide ID of the schema content.
    #[serde(rename = "globalId")]
    pub global_id: i64,
}

/// Typed operations against the schema registry.
#[async_trait]
pub trait RegistryClient: Send + Sync + 'static {
    /// Check whether the given subject already holds a registered version.
    async fn version_exists(&self, subject: &str) -> RegistryResult<Option<VersionMetadata>>;

    /// Register the given schema content as a new version of the subject.
    ///
    /// Callers must gate this on a preceding existence check; it is issued
    /// at most once per reconcile pass.
    async fn register_version(&self, subject: &str, content: &str) -> RegistryResult<RegisteredVersion>;

    /// Fetch the content of the subject's latest version.
    async fn fetch_latest(&self, subject: &str) -> RegistryResult<Option<String>>;
}

/// A `RegistryClient` backed by the registry's HTTP API.
pub struct HttpRegistryClient {
    /// Base URL of the registry's Confluent-compatible API.
    endpoint: String,
    /// The shared HTTP client.
    http: reqwest::Client,
}

impl HttpRegistryClient {
    /// Create a new instance.
    pub fn new(endpoint: &str) -> Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(API_TIMEOUT)
            .build()
            .context("error building registry HTTP client")?;
        Ok(Self {
            endpoint: endpoint.trim_end_matches('/').to_string(),
            http,
        })
    }

    /// Render a full URL for the given API path.
    fn url(&self, path: &str) -> String {
        format!("{}{}", self.endpoint, path)
    }
}

#[async_trait]
impl RegistryClient for HttpRegistryClient {
    #[tracing::instrument(level = "debug", skip(self))]
    async fn version_exists(&self, subject: &str) -> RegistryResult<Option<VersionMetadata>> {
        let url = self.url(&format!("/subjects/{}/versions/1", subject));
        let res = self.http.get(&url).send().await.map_err(transport_error)?;
        let status = res.status();
        let body = res.text().await.map_err(transport_error)?;
        map_version_response(status, &body)
    }

    #[tracing::instrument(level = "debug", skip(self, content))]
    async fn register_version(&self, subject: &str, content: &str) -> RegistryResult<RegisteredVersion> {
        let url = self.url(&format!("/subjects/{}/versions", subject));
        let payload = serde_json::json!({
            "schema": content,
            "schemaType": SCHEMA_TYPE_AVRO,
            "references": [],
        });
        let res = self.http.post(&url).json(&payload).send().await.map_err(transport_error)?;
        let status = res.status();
        let body = res.text().await.map_err(transport_error)?;
        map_register_response(status, &body)
    }

    #[tracing::instrument(level = "debug", skip(self))]
    async fn fetch_latest(&self, subject: &str) -> RegistryResult<Option<String>> {
        let url = self.url(&format!("/subjects/{}/versions/latest", subject));
        let res = self.http.get(&url).send().await.map_err(transport_error)?;
        let status = res.status();
        let body = res.text().await.map_err(transport_error)?;
        map_latest_response(status, &body)
    }
}

/// Map a transport-level failure into the registry error taxonomy.
fn transport_error(err: reqwest::Error) -> RegistryError {
    RegistryError::Transient(err.to_string())
}

/// Map an existence-check response onto the client contract.
///
/// A 404 from the registry is the expected-absent signal, not an error.
fn map_version_response(status: StatusCode, body: &str) -> RegistryResult<Option<VersionMetadata>> {
    match status {
        StatusCode::OK => serde_json::from_str(body)
            .map(Some)
            .map_err(|err| RegistryError::Transient(format!("error decoding version metadata: {}", err))),
        StatusCode::NOT_FOUND => Ok(None),
        status => Err(RegistryError::Transient(format!("unexpected status {} from registry: {}", status, body))),
    }
}

/// Map a registration response onto the client contract.
///
/// The registry signals rejected schema content with a 409 or 422; both are
/// non-retryable without a change to the declared schema.
fn map_register_response(status: StatusCode, body: &str) -> RegistryResult<RegisteredVersion> {
    match status {
        StatusCode::OK => serde_json::from_str(body)
            .map_err(|err| RegistryError::Transient(format!("error decoding registration response: {}", err))),
        StatusCode::CONFLICT | StatusCode::UNPROCESSABLE_ENTITY => Err(RegistryError::MalformedSchema(registry_message(body))),
        status => Err(RegistryError::Transient(format!("unexpected status {} from registry: {}", status, body))),
    }
}

/// Map a latest-version fetch response onto the client contract.
fn map_latest_response(status: StatusCode, body: &str) -> RegistryResult<Option<String>> {
    /// Response body of a latest-version fetch.
    #[derive(Deserialize)]
    struct LatestVersion {
        schema: String,
    }

    match status {
        StatusCode::OK => serde_json::from_str::<LatestVersion>(body)
            .map(|latest| Some(latest.schema))
            .map_err(|err| RegistryError::Transient(format!("error decoding latest version: {}", err))),
        StatusCode::NOT_FOUND => Ok(None),
        status => Err(RegistryError::Transient(format!("unexpected status {} from registry: {}", status, body))),
    }
}

/// Extract the registry's error message from a JSON error body.
fn registry_message(body: &str) -> String {
    #[derive(Deserialize)]
    struct ErrorBody {
        message: String,
    }

    serde_json::from_str::<ErrorBody>(body)
        .map(|parsed| parsed.message)
        .unwrap_or_else(|_| body.to_string())
}
