//! Field extraction provider abstraction.
//!
//! The heuristics that turn document bytes into structured candidate fields
//! are an external service; the pipeline only knows this contract.

use async_trait::async_trait;
use rust_decimal::Decimal;
use serde::Deserialize;
use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Duration;
use thiserror::Error;

use crate::models::ExtractedFields;

#[derive(Error, Debug)]
pub enum ExtractorError {
    #[error("Extractor not configured: {0}")]
    NotConfigured(String),

    #[error("Extraction failed: {0}")]
    ExtractionFailed(String),

    #[error("Network error: {0}")]
    NetworkError(String),
}

#[async_trait]
pub trait FieldExtractor: Send + Sync {
    async fn extract(&self, bytes: &[u8]) -> Result<ExtractedFields, ExtractorError>;
}

/// HTTP client for the external extraction service.
pub struct HttpFieldExtractor {
    endpoint: String,
    client: reqwest::Client,
}

impl HttpFieldExtractor {
    pub fn new(endpoint: String, timeout: Duration) -> Result<Self, ExtractorError> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| ExtractorError::NotConfigured(e.to_string()))?;
        Ok(Self { endpoint, client })
    }
}

#[derive(Debug, Deserialize)]
struct ExtractResponse {
    customer_ref: String,
    #[serde(default)]
    order_ref: String,
    amount: Decimal,
    confidence: i32,
}

#[async_trait]
impl FieldExtractor for HttpFieldExtractor {
    async fn extract(&self, bytes: &[u8]) -> Result<ExtractedFields, ExtractorError> {
        tracing::debug!(size = bytes.len(), "Sending document to extractor");

        let response = self
            .client
            .post(&self.endpoint)
            .header(reqwest::header::CONTENT_TYPE, "application/octet-stream")
            .body(bytes.to_vec())
            .send()
            .await
            .map_err(|e| ExtractorError::NetworkError(e.to_string()))?;

        if !response.status().is_success() {
            let status = response.status();
            let error_text = response.text().await.unwrap_or_default();
            return Err(ExtractorError::ExtractionFailed(format!(
                "Extractor error {}: {}",
                status, error_text
            )));
        }

        let parsed: ExtractResponse = response
            .json()
            .await
            .map_err(|e| ExtractorError::ExtractionFailed(format!("Bad response: {}", e)))?;

        Ok(ExtractedFields {
            customer_ref: parsed.customer_ref,
            order_ref: parsed.order_ref,
            amount: parsed.amount,
            confidence: parsed.confidence,
        })
    }
}

/// Scriptable extractor for tests and local runs: responses are keyed by the
/// document bytes' content, with an optional artificial delay.
#[derive(Default)]
pub struct MockFieldExtractor {
    responses: Mutex<HashMap<Vec<u8>, Result<ExtractedFields, String>>>,
    delay: Option<Duration>,
}

impl MockFieldExtractor {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_delay(delay: Duration) -> Self {
        Self {
            responses: Mutex::new(HashMap::new()),
            delay: Some(delay),
        }
    }

    pub fn on_bytes(&self, bytes: impl Into<Vec<u8>>, result: Result<ExtractedFields, String>) {
        self.responses
            .lock()
            .expect("mock extractor mutex poisoned")
            .insert(bytes.into(), result);
    }
}

#[async_trait]
impl FieldExtractor for MockFieldExtractor {
    async fn extract(&self, bytes: &[u8]) -> Result<ExtractedFields, ExtractorError> {
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }

        let scripted = self
            .responses
            .lock()
            .expect("mock extractor mutex poisoned")
            .get(bytes)
            .cloned();

        match scripted {
            Some(Ok(fields)) => Ok(fields),
            Some(Err(reason)) => Err(ExtractorError::ExtractionFailed(reason)),
            None => Err(ExtractorError::ExtractionFailed(
                "no scripted response for document".to_string(),
            )),
        }
    }
}
