//! HTTP Visit Service Adapter
//!
//! Implements the `VisitService` port against the remote REST API.
//!
//! Every endpoint except batch ingest wraps its payload in an envelope:
//!
//! ```text
//! { "success": true, "message": "...", "data": { ... }, "status_code": 200 }
//! { "success": false, "message": "...", "errors": ["..."], "status_code": 422 }
//! ```

use std::time::Duration;

use async_trait::async_trait;
use reqwest::{Client, StatusCode};
use serde::de::DeserializeOwned;
use serde::Deserialize;
use tracing::{debug, instrument};

use crate::domain::{PaginatedVisits, VisitCreate, VisitMetrics, VisitService};
use crate::error::{Error, Result};

// =============================================================================
// Configuration
// =============================================================================

/// Configuration for the remote visit service
#[derive(Debug, Clone)]
pub struct RemoteConfig {
    /// Base URL of the API, e.g. `http://localhost:8000/api`
    pub api_base_url: String,

    /// Per-request timeout
    pub timeout: Duration,
}

impl Default for RemoteConfig {
    fn default() -> Self {
        Self {
            api_base_url: "http://localhost:8000/api".to_string(),
            timeout: Duration::from_millis(10_000),
        }
    }
}

// =============================================================================
// Response Envelope
// =============================================================================

#[derive(Debug, Deserialize)]
struct ApiResponse<T> {
    success: bool,
    #[serde(default)]
    message: String,
    data: Option<T>,
    #[serde(default)]
    errors: Option<Vec<String>>,
    #[serde(default)]
    status_code: Option<u16>,
}

impl<T> ApiResponse<T> {
    fn error_message(&self) -> String {
        match &self.errors {
            Some(errors) if !errors.is_empty() => errors.join(", "),
            _ if !self.message.is_empty() => self.message.clone(),
            _ => "An error occurred".to_string(),
        }
    }
}

/// Turn a non-success HTTP response body into a rejection.
fn rejection(status: StatusCode, body: &[u8]) -> Error {
    let message = serde_json::from_slice::<ApiResponse<serde_json::Value>>(body)
        .map(|envelope| envelope.error_message())
        .unwrap_or_else(|_| format!("Request failed with status: {}", status));

    Error::RemoteRejected {
        status: status.as_u16(),
        message,
    }
}

/// Unwrap the `data` of an enveloped response.
fn unwrap_envelope<T: DeserializeOwned>(status: StatusCode, body: &[u8]) -> Result<T> {
    if !status.is_success() {
        return Err(rejection(status, body));
    }

    let envelope: ApiResponse<T> = serde_json::from_slice(body)
        .map_err(|e| Error::RemoteResponseParse(e.to_string()))?;

    if !envelope.success {
        return Err(Error::RemoteRejected {
            status: envelope.status_code.unwrap_or(status.as_u16()),
            message: envelope.error_message(),
        });
    }

    envelope
        .data
        .ok_or_else(|| Error::RemoteResponseParse("Response envelope has no data".into()))
}

/// Batch ingest answers with any 2xx body; an explicit `success: false` still fails.
fn check_ingest(status: StatusCode, body: &[u8]) -> Result<()> {
    if !status.is_success() {
        return Err(rejection(status, body));
    }

    match serde_json::from_slice::<ApiResponse<serde::de::IgnoredAny>>(body) {
        Ok(envelope) if !envelope.success => Err(Error::RemoteRejected {
            status: envelope.status_code.unwrap_or(status.as_u16()),
            message: envelope.error_message(),
        }),
        _ => Ok(()),
    }
}

// =============================================================================
// HTTP Visit Service
// =============================================================================

/// Remote visit service over HTTP.
pub struct HttpVisitService {
    config: RemoteConfig,
    client: Client,
}

impl HttpVisitService {
    pub fn new(config: RemoteConfig) -> Result<Self> {
        let client = Client::builder()
            .timeout(config.timeout)
            .build()
            .map_err(|e| Error::Internal(format!("Failed to create HTTP client: {}", e)))?;

        Ok(Self { config, client })
    }

    fn endpoint(&self, path: &str) -> String {
        format!("{}{}", self.config.api_base_url.trim_end_matches('/'), path)
    }

    async fn get_enveloped<T: DeserializeOwned>(&self, url: &str) -> Result<T> {
        debug!("GET {}", url);

        let response = self
            .client
            .get(url)
            .send()
            .await
            .map_err(Error::RemoteConnection)?;
        let status = response.status();
        let body = response.bytes().await.map_err(Error::RemoteConnection)?;

        unwrap_envelope(status, &body)
    }
}

impl std::fmt::Debug for HttpVisitService {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HttpVisitService")
            .field("api_base_url", &self.config.api_base_url)
            .field("timeout", &self.config.timeout)
            .finish()
    }
}

#[async_trait]
impl VisitService for HttpVisitService {
    #[instrument(skip(self, visits), fields(count = visits.len()))]
    async fn submit_batch(&self, visits: &[VisitCreate]) -> Result<()> {
        let url = self.endpoint("/visits/batch");

        let response = self
            .client
            .post(&url)
            .json(visits)
            .send()
            .await
            .map_err(Error::RemoteConnection)?;
        let status = response.status();
        let body = response.bytes().await.map_err(Error::RemoteConnection)?;

        check_ingest(status, &body)
    }

    #[instrument(skip(self))]
    async fn get_history(&self, url: &str, page: u32, page_size: u32) -> Result<PaginatedVisits> {
        let endpoint = format!(
            "{}?url={}&page={}&page_size={}",
            self.endpoint("/visits/history"),
            urlencoding::encode(url),
            page,
            page_size
        );
        self.get_enveloped(&endpoint).await
    }

    #[instrument(skip(self))]
    async fn get_metrics(&self, url: &str) -> Result<VisitMetrics> {
        let endpoint = format!(
            "{}?url={}",
            self.endpoint("/visits/metrics"),
            urlencoding::encode(url)
        );
        self.get_enveloped(&endpoint).await
    }
}
