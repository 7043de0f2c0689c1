//! External stamping provider client.
//!
//! The provider is the system of record for legal validity: it stamps a
//! draft and returns the certified invoice reference. Failures are
//! classified so the submission queue can decide between retry and
//! immediate failure.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::Mutex;
use std::time::Duration;
use thiserror::Error;
use uuid::Uuid;

use crate::models::{InvoiceDraft, RenditionFormat};

#[derive(Error, Debug)]
pub enum ProviderError {
    #[error("Provider not configured: {0}")]
    NotConfigured(String),

    /// Timeouts, connection failures, 429 and 5xx responses. Worth retrying.
    #[error("Retryable provider error: {0}")]
    Retryable(String),

    /// Validation-equivalent rejections (4xx). Retrying cannot succeed.
    #[error("Terminal provider error: {0}")]
    Terminal(String),
}

impl ProviderError {
    pub fn is_retryable(&self) -> bool {
        matches!(self, ProviderError::Retryable(_))
    }
}

/// A stamped, legally-valid invoice as returned by the provider.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StampedInvoice {
    pub provider_invoice_id: String,
    pub stamp: String,
}

#[async_trait]
pub trait InvoicingProvider: Send + Sync {
    async fn submit(&self, draft: &InvoiceDraft) -> Result<StampedInvoice, ProviderError>;

    async fn fetch_rendition(
        &self,
        provider_invoice_id: &str,
        format: RenditionFormat,
    ) -> Result<Vec<u8>, ProviderError>;
}

/// HTTP client for the external provider.
pub struct HttpInvoicingProvider {
    base_url: String,
    api_key: String,
    client: reqwest::Client,
}

impl HttpInvoicingProvider {
    pub fn new(
        base_url: String,
        api_key: String,
        timeout: Duration,
    ) -> Result<Self, ProviderError> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| ProviderError::NotConfigured(e.to_string()))?;
        Ok(Self {
            base_url,
            api_key,
            client,
        })
    }

    fn classify_status(status: reqwest::StatusCode, body: String) -> ProviderError {
        if status.as_u16() == 429 || status.is_server_error() {
            ProviderError::Retryable(format!("Provider error {}: {}", status, body))
        } else {
            ProviderError::Terminal(format!("Provider rejected request {}: {}", status, body))
        }
    }

    fn classify_transport(err: reqwest::Error) -> ProviderError {
        // Transport-level failures (timeouts, refused connections) are
        // indistinguishable from transient outages.
        ProviderError::Retryable(err.to_string())
    }
}

#[derive(Debug, Deserialize)]
struct SubmitResponse {
    provider_invoice_id: String,
    stamp: String,
}

#[async_trait]
impl InvoicingProvider for HttpInvoicingProvider {
    async fn submit(&self, draft: &InvoiceDraft) -> Result<StampedInvoice, ProviderError> {
        if self.api_key.is_empty() {
            return Err(ProviderError::NotConfigured(
                "Provider API key not configured".to_string(),
            ));
        }

        let url = format!("{}/invoices", self.base_url);

        tracing::debug!(
            series = %draft.series,
            folio = draft.folio,
            "Submitting draft to provider"
        );

        let response = self
            .client
            .post(&url)
            .bearer_auth(&self.api_key)
            .json(draft)
            .send()
            .await
            .map_err(Self::classify_transport)?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            return Err(Self::classify_status(status, body));
        }

        let parsed: SubmitResponse = response
            .json()
            .await
            .map_err(|e| ProviderError::Terminal(format!("Bad provider response: {}", e)))?;

        Ok(StampedInvoice {
            provider_invoice_id: parsed.provider_invoice_id,
            stamp: parsed.stamp,
        })
    }

    async fn fetch_rendition(
        &self,
        provider_invoice_id: &str,
        format: RenditionFormat,
    ) -> Result<Vec<u8>, ProviderError> {
        let url = format!(
            "{}/invoices/{}/rendition?format={}",
            self.base_url,
            provider_invoice_id,
            format.as_str()
        );

        let response = self
            .client
            .get(&url)
            .bearer_auth(&self.api_key)
            .send()
            .await
            .map_err(Self::classify_transport)?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            return Err(Self::classify_status(status, body));
        }

        let bytes = response
            .bytes()
            .await
            .map_err(Self::classify_transport)?;
        Ok(bytes.to_vec())
    }
}

/// Scriptable provider for tests: per-folio failure scripts, call recording,
/// an optional per-call delay and an optional gate to step submissions one
/// permit at a time.
#[derive(Default)]
pub struct MockInvoicingProvider {
    inner: Mutex<MockProviderState>,
    delay: Option<Duration>,
    gate: Option<std::sync::Arc<tokio::sync::Semaphore>>,
    entered: std::sync::atomic::AtomicUsize,
}

#[derive(Default)]
struct MockProviderState {
    /// Failures to serve (in order) before succeeding, keyed by folio.
    scripts: std::collections::HashMap<i64, Vec<ProviderFailure>>,
    submitted: Vec<SubmittedCall>,
    rendition_failures: std::collections::HashSet<String>,
}

#[derive(Debug, Clone)]
pub enum ProviderFailure {
    Retryable(String),
    Terminal(String),
}

#[derive(Debug, Clone)]
pub struct SubmittedCall {
    pub series: String,
    pub folio: i64,
    pub outcome: Result<String, String>,
}

impl MockInvoicingProvider {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_delay(delay: Duration) -> Self {
        Self {
            delay: Some(delay),
            ..Default::default()
        }
    }

    /// Gate submissions on a semaphore: each submit consumes one permit
    /// before proceeding, so tests can step the queue deterministically.
    pub fn with_gate(gate: std::sync::Arc<tokio::sync::Semaphore>) -> Self {
        Self {
            gate: Some(gate),
            ..Default::default()
        }
    }

    /// Number of submit calls that have started (before gating completes).
    pub fn entered_count(&self) -> usize {
        self.entered.load(std::sync::atomic::Ordering::SeqCst)
    }

    /// Queue failures for a folio; they are consumed in order, then the
    /// submission succeeds.
    pub fn fail_folio(&self, folio: i64, failures: Vec<ProviderFailure>) {
        self.inner
            .lock()
            .expect("mock provider mutex poisoned")
            .scripts
            .insert(folio, failures);
    }

    pub fn fail_rendition(&self, provider_invoice_id: impl Into<String>) {
        self.inner
            .lock()
            .expect("mock provider mutex poisoned")
            .rendition_failures
            .insert(provider_invoice_id.into());
    }

    pub fn submitted_calls(&self) -> Vec<SubmittedCall> {
        self.inner
            .lock()
            .expect("mock provider mutex poisoned")
            .submitted
            .clone()
    }

    pub fn successful_submissions(&self) -> usize {
        self.submitted_calls()
            .iter()
            .filter(|c| c.outcome.is_ok())
            .count()
    }
}

#[async_trait]
impl InvoicingProvider for MockInvoicingProvider {
    async fn submit(&self, draft: &InvoiceDraft) -> Result<StampedInvoice, ProviderError> {
        self.entered
            .fetch_add(1, std::sync::atomic::Ordering::SeqCst);

        if let Some(gate) = &self.gate {
            gate.acquire()
                .await
                .expect("mock provider gate closed")
                .forget();
        }

        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }

        let mut state = self.inner.lock().expect("mock provider mutex poisoned");

        let next_failure = state
            .scripts
            .get_mut(&draft.folio)
            .and_then(|failures| if failures.is_empty() { None } else { Some(failures.remove(0)) });

        match next_failure {
            Some(ProviderFailure::Retryable(reason)) => {
                state.submitted.push(SubmittedCall {
                    series: draft.series.clone(),
                    folio: draft.folio,
                    outcome: Err(reason.clone()),
                });
                Err(ProviderError::Retryable(reason))
            }
            Some(ProviderFailure::Terminal(reason)) => {
                state.submitted.push(SubmittedCall {
                    series: draft.series.clone(),
                    folio: draft.folio,
                    outcome: Err(reason.clone()),
                });
                Err(ProviderError::Terminal(reason))
            }
            None => {
                let provider_invoice_id = Uuid::new_v4().to_string();
                state.submitted.push(SubmittedCall {
                    series: draft.series.clone(),
                    folio: draft.folio,
                    outcome: Ok(provider_invoice_id.clone()),
                });
                Ok(StampedInvoice {
                    provider_invoice_id,
                    stamp: format!("STAMP-{}-{}", draft.series, draft.folio),
                })
            }
        }
    }

    async fn fetch_rendition(
        &self,
        provider_invoice_id: &str,
        format: RenditionFormat,
    ) -> Result<Vec<u8>, ProviderError> {
        let state = self.inner.lock().expect("mock provider mutex poisoned");
        if state.rendition_failures.contains(provider_invoice_id) {
            return Err(ProviderError::Retryable(format!(
                "rendition unavailable for {}",
                provider_invoice_id
            )));
        }
        Ok(format!("{} rendition of {}", format.as_str(), provider_invoice_id).into_bytes())
    }
}
