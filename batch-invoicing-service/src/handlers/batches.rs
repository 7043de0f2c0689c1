use axum::{
    Json,
    extract::{Path, Query, State},
    http::{StatusCode, header},
    response::IntoResponse,
};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use service_core::error::AppError;
use uuid::Uuid;
use validator::Validate;

use crate::middleware::OwnerId;
use crate::models::{
    BatchItem, BatchJob, BatchStatus, BatchSummary, InvoiceDraft, ItemStatus, LineItem, Priority,
    QueuedSubmission, TaxTreatment, TreatmentComparison,
};
use crate::services::batch_store::{BatchPatch, BatchStore, ItemPatch};
use crate::services::calculator;
use crate::startup::AppState;

/// Document types the pipeline accepts.
const ACCEPTED_TYPES: &[&str] = &[
    "application/pdf",
    "image/jpeg",
    "image/png",
    "application/xml",
    "text/xml",
];

#[derive(Debug, Deserialize, Validate)]
pub struct CreateBatchRequest {
    pub tenant_id: Uuid,
    /// Folio series; defaults to the configured series.
    pub series: Option<String>,
    #[validate(
        length(min = 1, message = "at least one document is required"),
        nested
    )]
    pub documents: Vec<SourceDocumentRequest>,
}

#[derive(Debug, Deserialize, Serialize, Validate)]
pub struct SourceDocumentRequest {
    #[validate(length(min = 1))]
    pub name: String,
    pub content_type: String,
    pub size_bytes: u64,
    #[validate(length(min = 1))]
    pub storage_key: String,
}

#[derive(Debug, Serialize)]
pub struct BatchCreatedResponse {
    pub batch_id: Uuid,
    pub status: BatchStatus,
}

/// POST /batches
///
/// Validates the whole group synchronously: any violation rejects the
/// batch, nothing is partially admitted. On success the record is written
/// as `collecting`, flipped to `analyzing` and the analysis pool is
/// spawned.
pub async fn create_batch(
    State(state): State<AppState>,
    owner: OwnerId,
    Json(request): Json<CreateBatchRequest>,
) -> Result<impl IntoResponse, AppError> {
    request.validate()?;

    let limits = &state.config.pipeline;

    if request.documents.len() > limits.max_items {
        return Err(AppError::BadRequest(anyhow::anyhow!(
            "Batch of {} documents exceeds the {} item limit",
            request.documents.len(),
            limits.max_items
        )));
    }

    for document in &request.documents {
        if !ACCEPTED_TYPES.contains(&document.content_type.as_str()) {
            return Err(AppError::BadRequest(anyhow::anyhow!(
                "Unsupported document type '{}' for '{}'",
                document.content_type,
                document.name
            )));
        }
    }

    let total_bytes: u64 = request.documents.iter().map(|d| d.size_bytes).sum();
    if total_bytes > limits.max_total_bytes {
        return Err(AppError::BadRequest(anyhow::anyhow!(
            "Batch size {} bytes exceeds the {} byte limit",
            total_bytes,
            limits.max_total_bytes
        )));
    }

    let items: Vec<BatchItem> = request
        .documents
        .iter()
        .map(|d| BatchItem::new(d.name.clone(), d.storage_key.clone()))
        .collect();

    let series = request
        .series
        .unwrap_or_else(|| limits.default_series.clone());

    let batch = BatchJob::new(
        request.tenant_id,
        owner.0,
        series,
        items,
        chrono::Duration::seconds(limits.record_ttl_secs as i64),
    );

    state.store.put(&batch, limits.record_ttl()).await?;

    let batch = state
        .store
        .update(
            owner.0,
            batch.batch_id,
            BatchPatch::status(BatchStatus::Analyzing),
        )
        .await?;

    tracing::info!(
        batch_id = %batch.batch_id,
        tenant_id = %batch.tenant_id,
        items = batch.items.len(),
        "Batch created, analysis started"
    );
    metrics::counter!("batches_created").increment(1);

    let pool = state.analysis.clone();
    let snapshot = batch.clone();
    tokio::spawn(async move {
        pool.run(snapshot).await;
    });

    Ok((
        StatusCode::ACCEPTED,
        Json(BatchCreatedResponse {
            batch_id: batch.batch_id,
            status: batch.status,
        }),
    ))
}

#[derive(Debug, Serialize)]
pub struct BatchSnapshotResponse {
    #[serde(flatten)]
    pub batch: BatchJob,
    /// True when the distributed store is unreachable and state lives only
    /// in this process.
    pub degraded: bool,
    pub summary: BatchSummary,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub treatment_preview: Option<TreatmentComparison>,
}

/// GET /batches/:batch_id
pub async fn get_batch(
    State(state): State<AppState>,
    owner: OwnerId,
    Path(batch_id): Path<Uuid>,
) -> Result<Json<BatchSnapshotResponse>, AppError> {
    let batch = state
        .store
        .get(owner.0, batch_id)
        .await?
        .ok_or_else(|| AppError::NotFound(anyhow::anyhow!("Batch {} not found", batch_id)))?;

    let treatment_preview = (batch.status == BatchStatus::AwaitingConfirmation)
        .then(|| treatment_preview(&state, &batch));

    Ok(Json(BatchSnapshotResponse {
        degraded: state.store.is_degraded(),
        summary: batch.summary(),
        treatment_preview,
        batch,
    }))
}

/// Both treatment totals over every analyzed item, so the operator can
/// compare before confirming. Withholding rates are attached here
/// unconditionally; eligibility narrows them at confirmation.
fn treatment_preview(state: &AppState, batch: &BatchJob) -> TreatmentComparison {
    let lines: Vec<LineItem> = batch
        .analyzed_items()
        .filter_map(|item| item.fields.as_ref())
        .map(|fields| calculator::line_from_fields(fields, &state.tax_profile, true))
        .collect();
    calculator::compare_treatments(&lines, Decimal::ZERO)
}

#[derive(Debug, Deserialize)]
pub struct ConfirmRequest {
    pub treatment: TaxTreatment,
}

#[derive(Debug, Serialize)]
pub struct ConfirmResponse {
    pub batch_id: Uuid,
    pub status: BatchStatus,
    pub enqueued: usize,
    pub skipped: usize,
}

/// POST /batches/:batch_id/confirm
///
/// Allocates one folio per analyzed item and hands the drafts to the
/// submission queue at batch priority. Folio allocation happens exactly
/// once per item, before its first enqueue; an allocation failure fails
/// that item alone and consumes nothing.
pub async fn confirm_batch(
    State(state): State<AppState>,
    owner: OwnerId,
    Path(batch_id): Path<Uuid>,
    Json(request): Json<ConfirmRequest>,
) -> Result<impl IntoResponse, AppError> {
    let batch = state
        .store
        .get(owner.0, batch_id)
        .await?
        .ok_or_else(|| AppError::NotFound(anyhow::anyhow!("Batch {} not found", batch_id)))?;

    if batch.status != BatchStatus::AwaitingConfirmation {
        return Err(AppError::Conflict(anyhow::anyhow!(
            "Batch {} is {}, not awaiting confirmation",
            batch_id,
            batch.status.as_str()
        )));
    }

    let analyzed: Vec<BatchItem> = batch.analyzed_items().cloned().collect();
    if analyzed.is_empty() {
        return Err(AppError::BadRequest(anyhow::anyhow!(
            "Batch {} has no analyzed items to confirm",
            batch_id
        )));
    }

    let batch = state
        .store
        .update(
            owner.0,
            batch_id,
            BatchPatch {
                status: Some(BatchStatus::Submitting),
                selected_treatment: Some(request.treatment),
                ..Default::default()
            },
        )
        .await?;

    let mut enqueued = 0usize;
    let mut skipped = 0usize;

    for item in &analyzed {
        match stage_item(&state, &batch, item, request.treatment).await {
            Ok(()) => enqueued += 1,
            Err(reason) => {
                skipped += 1;
                tracing::warn!(
                    batch_id = %batch_id,
                    item_id = %item.item_id,
                    reason = %reason,
                    "Item skipped at confirmation"
                );
                if let Err(e) = state
                    .store
                    .update(
                        owner.0,
                        batch_id,
                        BatchPatch::item(ItemPatch::failure(
                            item.item_id,
                            ItemStatus::SubmitFailed,
                            reason,
                        )),
                    )
                    .await
                {
                    tracing::error!(
                        batch_id = %batch_id,
                        item_id = %item.item_id,
                        error = %e,
                        "Failed to record confirmation failure"
                    );
                }
            }
        }
    }

    // Everything may have failed before reaching the queue.
    crate::workers::finalize_batch(state.store.as_ref(), owner.0, batch_id).await;

    tracing::info!(
        batch_id = %batch_id,
        treatment = request.treatment.as_str(),
        enqueued = enqueued,
        skipped = skipped,
        "Batch confirmed"
    );

    Ok((
        StatusCode::ACCEPTED,
        Json(ConfirmResponse {
            batch_id,
            status: BatchStatus::Submitting,
            enqueued,
            skipped,
        }),
    ))
}

/// Resolve, price, allocate and enqueue one analyzed item. Returns a
/// human-readable reason on failure; the caller records it on the item.
async fn stage_item(
    state: &AppState,
    batch: &BatchJob,
    item: &BatchItem,
    treatment: TaxTreatment,
) -> Result<(), String> {
    let fields = item
        .fields
        .as_ref()
        .ok_or_else(|| "item has no extracted fields".to_string())?;

    let profile = state
        .directory
        .resolve(batch.tenant_id, &fields.customer_ref)
        .await
        .map_err(|e| format!("customer resolution failed: {}", e))?;

    let line = calculator::line_from_fields(fields, &state.tax_profile, profile.withholding_eligible);
    let apply_withholding =
        treatment == TaxTreatment::Withholding && profile.withholding_eligible;
    let breakdown = calculator::compute_breakdown(&[line.clone()], apply_withholding, Decimal::ZERO);

    let folio = state
        .allocator
        .allocate(batch.tenant_id, &batch.series)
        .await
        .map_err(|e| format!("folio allocation failed: {}", e))?;

    // Record the folio before the first enqueue attempt; retries and
    // restarts must find it on the item, never re-allocate.
    state
        .store
        .update(
            batch.owner_id,
            batch.batch_id,
            BatchPatch::item(ItemPatch {
                item_id: item.item_id,
                status: Some(ItemStatus::Queued),
                folio: Some(crate::models::AllocatedFolio {
                    series: batch.series.clone(),
                    number: folio,
                }),
                ..Default::default()
            }),
        )
        .await
        .map_err(|e| format!("failed to record folio: {}", e))?;

    let draft = InvoiceDraft {
        tenant_id: batch.tenant_id,
        customer_id: profile.customer_id,
        customer_name: profile.name,
        series: batch.series.clone(),
        folio,
        treatment,
        line_items: vec![line],
        breakdown,
    };

    state
        .queue
        .enqueue(QueuedSubmission {
            owner_id: batch.owner_id,
            batch_id: batch.batch_id,
            item_id: item.item_id,
            draft,
            priority: Priority::Batch,
            attempts: 0,
        })
        .map_err(|e| format!("enqueue failed: {}", e))
}

#[derive(Debug, Serialize)]
pub struct CancelResponse {
    pub batch_id: Uuid,
    pub status: BatchStatus,
}

/// POST /batches/:batch_id/cancel
///
/// Marks the batch canceled. Queued submissions not yet dispatched are
/// dropped at dispatch time; invoices already stamped upstream stand.
pub async fn cancel_batch(
    State(state): State<AppState>,
    owner: OwnerId,
    Path(batch_id): Path<Uuid>,
) -> Result<Json<CancelResponse>, AppError> {
    let batch = state
        .store
        .get(owner.0, batch_id)
        .await?
        .ok_or_else(|| AppError::NotFound(anyhow::anyhow!("Batch {} not found", batch_id)))?;

    if batch.status.is_terminal() {
        return Err(AppError::Conflict(anyhow::anyhow!(
            "Batch {} is already {}",
            batch_id,
            batch.status.as_str()
        )));
    }

    let batch = state
        .store
        .update(
            owner.0,
            batch_id,
            BatchPatch::status(BatchStatus::Canceled),
        )
        .await?;

    tracing::info!(batch_id = %batch_id, "Batch canceled");
    metrics::counter!("batches_canceled").increment(1);

    Ok(Json(CancelResponse {
        batch_id,
        status: batch.status,
    }))
}

#[derive(Debug, Deserialize)]
pub struct ArtifactParams {
    pub format: Option<String>,
}

/// GET /batches/:batch_id/artifacts?format=pdf|xml
pub async fn get_artifacts(
    State(state): State<AppState>,
    owner: OwnerId,
    Path(batch_id): Path<Uuid>,
    Query(params): Query<ArtifactParams>,
) -> Result<impl IntoResponse, AppError> {
    let format = params
        .format
        .as_deref()
        .unwrap_or("pdf")
        .parse::<crate::models::RenditionFormat>()
        .map_err(|e| AppError::BadRequest(anyhow::anyhow!(e)))?;

    let batch = state
        .store
        .get(owner.0, batch_id)
        .await?
        .ok_or_else(|| AppError::NotFound(anyhow::anyhow!("Batch {} not found", batch_id)))?;

    let bytes = state.packager.package(&batch, format).await?;

    let file_name = format!("batch_{}_{}.zip", batch_id, format.as_str());

    Ok((
        [
            (header::CONTENT_TYPE, "application/zip".to_string()),
            (
                header::CONTENT_DISPOSITION,
                format!("attachment; filename=\"{}\"", file_name),
            ),
        ],
        bytes,
    ))
}
