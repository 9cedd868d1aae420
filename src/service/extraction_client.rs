//! Client for the external document-understanding service.
//!
//! Owns no business state. Each call is wrapped in a timeout, retried with capped
//! exponential backoff on rate limits, 5xx, timeouts and network errors, and
//! surfaces every other failure immediately. Documents are staged in a temp file
//! that is removed when the call returns, whichever way it returns.

use async_trait::async_trait;
use reqwest::header::{CONTENT_TYPE, RETRY_AFTER};
use serde::Deserialize;
use serde_json::{json, Value};
use std::future::Future;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tempfile::NamedTempFile;
use thiserror::Error;

use crate::config::ExtractionConfig;
use crate::models::ExtractionSchema;

const USER_AGENT: &str = concat!("receipt-ingest/", env!("CARGO_PKG_VERSION"));

/// Classified provider failure
#[derive(Debug, Clone, Error, PartialEq)]
pub enum ProviderError {
    #[error("rate limited by provider")]
    RateLimited { retry_after: Option<Duration> },

    #[error("provider server error {status}: {body}")]
    Server { status: u16, body: String },

    #[error("provider call timed out after {0:?}")]
    Timeout(Duration),

    #[error("network error: {0}")]
    Network(String),

    #[error("malformed input: {0}")]
    MalformedInput(String),

    #[error("authentication failed: {0}")]
    Auth(String),

    #[error("schema rejected: {0}")]
    SchemaRejected(String),

    #[error("could not stage request payload: {0}")]
    Staging(String),
}

impl ProviderError {
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            ProviderError::RateLimited { .. }
                | ProviderError::Server { .. }
                | ProviderError::Timeout(_)
                | ProviderError::Network(_)
        )
    }

    pub fn class(&self) -> &'static str {
        match self {
            ProviderError::RateLimited { .. } => "rate_limited",
            ProviderError::Server { .. } => "server_error",
            ProviderError::Timeout(_) => "timeout",
            ProviderError::Network(_) => "network",
            ProviderError::MalformedInput(_) => "malformed_input",
            ProviderError::Auth(_) => "auth",
            ProviderError::SchemaRejected(_) => "schema_rejected",
            ProviderError::Staging(_) => "staging",
        }
    }

    fn retry_after(&self) -> Option<Duration> {
        match self {
            ProviderError::RateLimited { retry_after } => *retry_after,
            _ => None,
        }
    }
}

/// What the extract step reads from
#[derive(Debug, Clone, Copy)]
pub enum ExtractSource<'a> {
    /// intermediate text from the parse step
    Text(&'a str),
    /// the staged original document
    Document { path: &'a Path, mime_type: &'a str },
}

/// External extraction service
#[async_trait]
pub trait ExtractionProvider: Send + Sync {
    /// Turn a document into intermediate text
    async fn parse(&self, document: &Path, mime_type: &str) -> Result<String, ProviderError>;

    /// Return a structured object for the given field specification
    async fn extract(&self, source: ExtractSource<'_>, schema: &Value) -> Result<Value, ProviderError>;
}

/// Extraction service over HTTP
pub struct HttpExtractionProvider {
    http_client: reqwest::Client,
    base_url: String,
    api_key: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ParseResponse {
    text: String,
}

impl HttpExtractionProvider {
    pub fn new(base_url: impl Into<String>, api_key: Option<String>) -> Result<Self, ProviderError> {
        let http_client = reqwest::Client::builder()
            .user_agent(USER_AGENT)
            .build()
            .map_err(|e| ProviderError::Network(e.to_string()))?;

        Ok(Self {
            http_client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            api_key,
        })
    }

    fn request(&self, path: &str) -> reqwest::RequestBuilder {
        let builder = self.http_client.post(format!("{}{}", self.base_url, path));
        match &self.api_key {
            Some(key) => builder.bearer_auth(key),
            None => builder,
        }
    }

    async fn send(&self, request: reqwest::RequestBuilder) -> Result<Value, ProviderError> {
        let response = request.send().await.map_err(|e| {
            if e.is_timeout() {
                ProviderError::Timeout(Duration::ZERO)
            } else {
                ProviderError::Network(e.to_string())
            }
        })?;

        let status = response.status();
        if status.is_success() {
            return response
                .json::<Value>()
                .await
                .map_err(|e| ProviderError::Network(format!("unreadable response body: {}", e)));
        }

        let retry_after = response
            .headers()
            .get(RETRY_AFTER)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.trim().parse::<u64>().ok())
            .map(Duration::from_secs);
        let body = response.text().await.unwrap_or_default();
        Err(classify_status(status.as_u16(), body, retry_after))
    }
}

/// Map an HTTP error status onto the failure taxonomy
pub fn classify_status(status: u16, body: String, retry_after: Option<Duration>) -> ProviderError {
    match status {
        429 => ProviderError::RateLimited { retry_after },
        401 | 403 => ProviderError::Auth(body),
        422 => ProviderError::SchemaRejected(body),
        500..=599 => ProviderError::Server { status, body },
        _ => ProviderError::MalformedInput(format!("status {}: {}", status, body)),
    }
}

#[async_trait]
impl ExtractionProvider for HttpExtractionProvider {
    async fn parse(&self, document: &Path, mime_type: &str) -> Result<String, ProviderError> {
        let bytes = tokio::fs::read(document)
            .await
            .map_err(|e| ProviderError::Staging(e.to_string()))?;
        let body = self
            .send(self.request("/v1/parse").header(CONTENT_TYPE, mime_type).body(bytes))
            .await?;
        let parsed: ParseResponse = serde_json::from_value(body)
            .map_err(|e| ProviderError::SchemaRejected(format!("parse response: {}", e)))?;
        Ok(parsed.text)
    }

    async fn extract(&self, source: ExtractSource<'_>, schema: &Value) -> Result<Value, ProviderError> {
        let request = match source {
            ExtractSource::Text(text) => self
                .request("/v1/extract")
                .json(&json!({ "schema": schema, "text": text })),
            ExtractSource::Document { path, mime_type } => {
                let bytes = tokio::fs::read(path)
                    .await
                    .map_err(|e| ProviderError::Staging(e.to_string()))?;
                self.request("/v1/extract")
                    .header(CONTENT_TYPE, mime_type)
                    .header("X-Extraction-Schema", schema.to_string())
                    .body(bytes)
            }
        };
        self.send(request).await
    }
}

/// Backoff for one client call
#[derive(Debug, Clone)]
pub struct RetryConfig {
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
    pub request_timeout: Duration,
}

impl RetryConfig {
    pub fn from_config(config: &ExtractionConfig) -> Self {
        Self {
            max_attempts: config.max_attempts.max(1),
            base_delay: Duration::from_millis(config.base_delay_ms),
            max_delay: Duration::from_millis(config.max_delay_ms),
            request_timeout: config.request_timeout(),
        }
    }

    /// Delay after the given failed attempt (1-based): base * 2^(attempt-1), capped
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(20);
        self.base_delay
            .saturating_mul(1u32 << exponent)
            .min(self.max_delay)
    }
}

/// Terminal client failure with the last provider error
#[derive(Debug, Clone, Error)]
#[error("{operation} failed after {attempts} attempt(s): {error}")]
pub struct ExtractionFailure {
    pub operation: &'static str,
    pub attempts: u32,
    pub error: ProviderError,
}

impl ExtractionFailure {
    /// Diagnostic detail kept on the receipt
    pub fn details(&self) -> Value {
        let status = match &self.error {
            ProviderError::Server { status, .. } => Some(*status),
            _ => None,
        };
        json!({
            "operation": self.operation,
            "attempts": self.attempts,
            "class": self.error.class(),
            "retryable": self.error.is_retryable(),
            "status": status,
            "message": self.error.to_string(),
        })
    }
}

pub struct ExtractionClient {
    provider: Arc<dyn ExtractionProvider>,
    retry: RetryConfig,
    staging_dir: Option<PathBuf>,
    schema: ExtractionSchema,
}

impl ExtractionClient {
    pub fn new(
        provider: Arc<dyn ExtractionProvider>,
        retry: RetryConfig,
        staging_dir: Option<PathBuf>,
        schema: ExtractionSchema,
    ) -> Self {
        Self {
            provider,
            retry,
            staging_dir,
            schema,
        }
    }

    pub fn schema(&self) -> &ExtractionSchema {
        &self.schema
    }

    /// Parse step: document -> intermediate text
    pub async fn parse(&self, bytes: &[u8], mime_type: &str) -> Result<String, ExtractionFailure> {
        let staged = self.stage("parse", bytes).await?;
        let path = staged.path();
        self.with_retry("parse", || self.provider.parse(path, mime_type)).await
    }

    /// Extract step from intermediate text
    pub async fn extract_text(&self, text: &str) -> Result<Value, ExtractionFailure> {
        let schema = self.schema.to_json();
        self.with_retry("extract", || self.provider.extract(ExtractSource::Text(text), &schema))
            .await
    }

    /// Extract step straight from the document
    pub async fn extract_document(&self, bytes: &[u8], mime_type: &str) -> Result<Value, ExtractionFailure> {
        let schema = self.schema.to_json();
        let staged = self.stage("extract", bytes).await?;
        let path = staged.path();
        self.with_retry("extract", || {
            self.provider
                .extract(ExtractSource::Document { path, mime_type }, &schema)
        })
        .await
    }

    async fn stage(&self, operation: &'static str, bytes: &[u8]) -> Result<NamedTempFile, ExtractionFailure> {
        stage_document(self.staging_dir.as_deref(), bytes).await.map_err(|e| ExtractionFailure {
            operation,
            attempts: 0,
            error: ProviderError::Staging(e.to_string()),
        })
    }

    async fn with_retry<T, F, Fut>(&self, operation: &'static str, mut call: F) -> Result<T, ExtractionFailure>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, ProviderError>>,
    {
        let mut attempt = 0u32;
        loop {
            attempt += 1;
            let result = match tokio::time::timeout(self.retry.request_timeout, call()).await {
                Ok(result) => result,
                Err(_) => Err(ProviderError::Timeout(self.retry.request_timeout)),
            };

            let error = match result {
                Ok(value) => {
                    if attempt > 1 {
                        tracing::info!(operation, attempt, "provider call succeeded after retry");
                    }
                    return Ok(value);
                }
                Err(error) => error,
            };

            if !error.is_retryable() || attempt >= self.retry.max_attempts {
                tracing::error!(
                    operation,
                    attempt,
                    class = error.class(),
                    "provider call failed: {}",
                    error
                );
                return Err(ExtractionFailure {
                    operation,
                    attempts: attempt,
                    error,
                });
            }

            let delay = error
                .retry_after()
                .map(|d| d.min(self.retry.max_delay))
                .unwrap_or_else(|| self.retry.delay_for(attempt));
            tracing::warn!(
                operation,
                attempt,
                class = error.class(),
                backoff_ms = delay.as_millis() as u64,
                "provider call failed, retrying: {}",
                error
            );
            tokio::time::sleep(delay).await;
        }
    }
}

/// Write bytes to a temp file that deletes itself on drop
async fn stage_document(dir: Option<&Path>, bytes: &[u8]) -> std::io::Result<NamedTempFile> {
    let file = {
        let mut builder = tempfile::Builder::new();
        builder.prefix("receipt-");
        match dir {
            Some(dir) => builder.tempfile_in(dir)?,
            None => builder.tempfile()?,
        }
    };
    tokio::fs::write(file.path(), bytes).await?;
    Ok(file)
}
