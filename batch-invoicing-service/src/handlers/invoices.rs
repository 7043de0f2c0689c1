use axum::{Json, extract::State, http::StatusCode, response::IntoResponse};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use service_core::error::AppError;
use uuid::Uuid;
use validator::Validate;

use crate::middleware::OwnerId;
use crate::models::{
    AllocatedFolio, BatchItem, BatchJob, BatchStatus, ExtractedFields, InvoiceDraft, ItemStatus,
    Priority, QueuedSubmission, TaxTreatment,
};
use crate::services::batch_store::{BatchPatch, BatchStore};
use crate::services::calculator;
use crate::startup::AppState;

#[derive(Debug, Deserialize, Validate)]
pub struct CreateInvoiceRequest {
    pub tenant_id: Uuid,
    #[validate(length(min = 1))]
    pub customer_ref: String,
    #[serde(default)]
    pub order_ref: String,
    pub amount: Decimal,
    pub treatment: TaxTreatment,
    pub series: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct InvoiceCreatedResponse {
    pub batch_id: Uuid,
    pub item_id: Uuid,
    pub series: String,
    pub folio: i64,
    pub status: BatchStatus,
}

/// POST /invoices
///
/// Single ad-hoc invoice: modelled as a one-item batch that skips analysis
/// and enqueues at interactive priority, so it preempts bulk work in the
/// submission queue. Tracked and packaged through the same batch routes.
pub async fn create_invoice(
    State(state): State<AppState>,
    owner: OwnerId,
    Json(request): Json<CreateInvoiceRequest>,
) -> Result<impl IntoResponse, AppError> {
    request.validate()?;

    if request.amount <= Decimal::ZERO {
        return Err(AppError::BadRequest(anyhow::anyhow!(
            "Invoice amount must be positive"
        )));
    }

    let profile = state
        .directory
        .resolve(request.tenant_id, &request.customer_ref)
        .await?;

    let fields = ExtractedFields {
        customer_ref: request.customer_ref.clone(),
        order_ref: request.order_ref.clone(),
        amount: request.amount,
        confidence: 100,
    };

    let series = request
        .series
        .unwrap_or_else(|| state.config.pipeline.default_series.clone());

    let mut item = BatchItem::new(format!("adhoc-{}", request.customer_ref), String::new());
    item.status = ItemStatus::Analyzed;
    item.fields = Some(fields.clone());
    let item_id = item.item_id;

    let mut batch = BatchJob::new(
        request.tenant_id,
        owner.0,
        series.clone(),
        vec![item],
        chrono::Duration::seconds(state.config.pipeline.record_ttl_secs as i64),
    );
    batch.status = BatchStatus::Submitting;
    batch.selected_treatment = Some(request.treatment);

    let line = calculator::line_from_fields(&fields, &state.tax_profile, profile.withholding_eligible);
    let apply_withholding =
        request.treatment == TaxTreatment::Withholding && profile.withholding_eligible;
    let breakdown =
        calculator::compute_breakdown(&[line.clone()], apply_withholding, Decimal::ZERO);

    // Allocate before the record is visible, so the folio is on the item
    // from its first stored state.
    let folio = state.allocator.allocate(request.tenant_id, &series).await?;

    {
        let item = batch
            .item_mut(item_id)
            .expect("item just inserted into batch");
        item.status = ItemStatus::Queued;
        item.folio = Some(AllocatedFolio {
            series: series.clone(),
            number: folio,
        });
    }

    state
        .store
        .put(&batch, state.config.pipeline.record_ttl())
        .await?;

    let draft = InvoiceDraft {
        tenant_id: request.tenant_id,
        customer_id: profile.customer_id,
        customer_name: profile.name,
        series: series.clone(),
        folio,
        treatment: request.treatment,
        line_items: vec![line],
        breakdown,
    };

    if let Err(e) = state.queue.enqueue(QueuedSubmission {
        owner_id: owner.0,
        batch_id: batch.batch_id,
        item_id,
        draft,
        priority: Priority::Interactive,
        attempts: 0,
    }) {
        // The folio is consumed either way; record the failure on the item.
        let _ = state
            .store
            .update(
                owner.0,
                batch.batch_id,
                BatchPatch::item(crate::services::batch_store::ItemPatch::failure(
                    item_id,
                    ItemStatus::SubmitFailed,
                    format!("enqueue failed: {}", e),
                )),
            )
            .await;
        return Err(e);
    }

    tracing::info!(
        batch_id = %batch.batch_id,
        series = %series,
        folio = folio,
        "Ad-hoc invoice enqueued at interactive priority"
    );

    Ok((
        StatusCode::ACCEPTED,
        Json(InvoiceCreatedResponse {
            batch_id: batch.batch_id,
            item_id,
            series,
            folio,
            status: BatchStatus::Submitting,
        }),
    ))
}
