//! Batch job and item models for batch-invoicing-service.

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Batch lifecycle status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BatchStatus {
    Collecting,
    Analyzing,
    AwaitingConfirmation,
    Submitting,
    Completed,
    Failed,
    Canceled,
}

impl BatchStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            BatchStatus::Collecting => "collecting",
            BatchStatus::Analyzing => "analyzing",
            BatchStatus::AwaitingConfirmation => "awaiting_confirmation",
            BatchStatus::Submitting => "submitting",
            BatchStatus::Completed => "completed",
            BatchStatus::Failed => "failed",
            BatchStatus::Canceled => "canceled",
        }
    }

    pub fn from_string(s: &str) -> Self {
        match s {
            "analyzing" => BatchStatus::Analyzing,
            "awaiting_confirmation" => BatchStatus::AwaitingConfirmation,
            "submitting" => BatchStatus::Submitting,
            "completed" => BatchStatus::Completed,
            "failed" => BatchStatus::Failed,
            "canceled" => BatchStatus::Canceled,
            _ => BatchStatus::Collecting,
        }
    }

    /// Terminal batches only expire; no further transitions are accepted.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            BatchStatus::Completed | BatchStatus::Failed | BatchStatus::Canceled
        )
    }
}

/// Per-item pipeline status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ItemStatus {
    Pending,
    Downloaded,
    Analyzed,
    AnalysisFailed,
    Queued,
    Submitted,
    SubmitFailed,
}

impl ItemStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ItemStatus::Pending => "pending",
            ItemStatus::Downloaded => "downloaded",
            ItemStatus::Analyzed => "analyzed",
            ItemStatus::AnalysisFailed => "analysis_failed",
            ItemStatus::Queued => "queued",
            ItemStatus::Submitted => "submitted",
            ItemStatus::SubmitFailed => "submit_failed",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            ItemStatus::AnalysisFailed | ItemStatus::Submitted | ItemStatus::SubmitFailed
        )
    }
}

/// Operator-selected tax treatment for a batch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaxTreatment {
    Withholding,
    NoWithholding,
}

impl TaxTreatment {
    pub fn as_str(&self) -> &'static str {
        match self {
            TaxTreatment::Withholding => "withholding",
            TaxTreatment::NoWithholding => "no_withholding",
        }
    }
}

/// Structured fields produced by the external extractor for one document.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExtractedFields {
    pub customer_ref: String,
    pub order_ref: String,
    pub amount: Decimal,
    /// Extractor confidence, 0-100.
    pub confidence: i32,
}

/// Folio recorded on the item at allocation time, before the first enqueue.
/// Retries read it from here; the allocator is never called twice for an item.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AllocatedFolio {
    pub series: String,
    pub number: i64,
}

/// Reference to the invoice stamped by the external provider.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InvoiceRef {
    pub provider_invoice_id: String,
    pub stamp: String,
    pub series: String,
    pub folio: i64,
}

/// One source document travelling through the pipeline.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BatchItem {
    pub item_id: Uuid,
    pub source_name: String,
    pub storage_key: String,
    pub status: ItemStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub fields: Option<ExtractedFields>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub folio: Option<AllocatedFolio>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub invoice_ref: Option<InvoiceRef>,
}

impl BatchItem {
    pub fn new(source_name: impl Into<String>, storage_key: impl Into<String>) -> Self {
        Self {
            item_id: Uuid::new_v4(),
            source_name: source_name.into(),
            storage_key: storage_key.into(),
            status: ItemStatus::Pending,
            fields: None,
            error: None,
            folio: None,
            invoice_ref: None,
        }
    }
}

/// Batch job: the unit of bulk work.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BatchJob {
    pub batch_id: Uuid,
    pub tenant_id: Uuid,
    pub owner_id: Uuid,
    pub status: BatchStatus,
    pub series: String,
    pub items: Vec<BatchItem>,
    pub selected_treatment: Option<TaxTreatment>,
    pub created_utc: DateTime<Utc>,
    pub expires_utc: DateTime<Utc>,
}

impl BatchJob {
    pub fn new(
        tenant_id: Uuid,
        owner_id: Uuid,
        series: String,
        items: Vec<BatchItem>,
        retention: chrono::Duration,
    ) -> Self {
        let now = Utc::now();
        Self {
            batch_id: Uuid::new_v4(),
            tenant_id,
            owner_id,
            status: BatchStatus::Collecting,
            series,
            items,
            selected_treatment: None,
            created_utc: now,
            expires_utc: now + retention,
        }
    }

    pub fn item_mut(&mut self, item_id: Uuid) -> Option<&mut BatchItem> {
        self.items.iter_mut().find(|i| i.item_id == item_id)
    }

    /// Items that survived analysis and can be offered for confirmation.
    pub fn analyzed_items(&self) -> impl Iterator<Item = &BatchItem> {
        self.items
            .iter()
            .filter(|i| i.status == ItemStatus::Analyzed)
    }

    pub fn all_items_terminal(&self) -> bool {
        self.items.iter().all(|i| i.status.is_terminal())
    }

    pub fn any_item_submitted(&self) -> bool {
        self.items
            .iter()
            .any(|i| i.status == ItemStatus::Submitted)
    }

    /// Final per-item outcome breakdown. Items still in flight are only
    /// reported once the batch itself is terminal: under a canceled batch an
    /// undispatched item counts as failed with an explicit reason.
    pub fn summary(&self) -> BatchSummary {
        let mut succeeded = Vec::new();
        let mut failed = Vec::new();

        for item in &self.items {
            match item.status {
                ItemStatus::Submitted => succeeded.push(SuccessEntry {
                    item_id: item.item_id,
                    source_name: item.source_name.clone(),
                    invoice_ref: item.invoice_ref.clone(),
                }),
                ItemStatus::AnalysisFailed | ItemStatus::SubmitFailed => {
                    failed.push(FailureEntry {
                        item_id: item.item_id,
                        source_name: item.source_name.clone(),
                        reason: item
                            .error
                            .clone()
                            .unwrap_or_else(|| "unknown failure".to_string()),
                    })
                }
                _ if self.status == BatchStatus::Canceled => failed.push(FailureEntry {
                    item_id: item.item_id,
                    source_name: item.source_name.clone(),
                    reason: "batch canceled before submission".to_string(),
                }),
                _ => {}
            }
        }

        BatchSummary { succeeded, failed }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SuccessEntry {
    pub item_id: Uuid,
    pub source_name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub invoice_ref: Option<InvoiceRef>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FailureEntry {
    pub item_id: Uuid,
    pub source_name: String,
    pub reason: String,
}

/// Aggregate outcome reported to the operator.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BatchSummary {
    pub succeeded: Vec<SuccessEntry>,
    pub failed: Vec<FailureEntry>,
}
