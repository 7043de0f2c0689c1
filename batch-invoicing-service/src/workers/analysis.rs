//! Parallel analysis worker pool.
//!
//! Downloads each item's source bytes and runs the external extractor,
//! fanning out up to `max_fan_out` items at once. A per-item timeout turns
//! a hung download or extraction into an isolated `analysis_failed`; one
//! item's failure never aborts its siblings. One consolidated snapshot is
//! written once every item has resolved.

use futures::future::join_all;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Semaphore;
use tokio::time::timeout;

use crate::models::{BatchItem, BatchJob, BatchStatus, ExtractedFields, ItemStatus};
use crate::services::batch_store::{BatchPatch, BatchStore, ItemPatch};
use crate::services::extractor::FieldExtractor;
use crate::services::storage::Storage;

#[derive(Clone)]
pub struct AnalysisPool {
    store: Arc<dyn BatchStore>,
    storage: Arc<dyn Storage>,
    extractor: Arc<dyn FieldExtractor>,
    max_fan_out: usize,
    item_timeout: Duration,
    min_confidence: i32,
}

impl AnalysisPool {
    pub fn new(
        store: Arc<dyn BatchStore>,
        storage: Arc<dyn Storage>,
        extractor: Arc<dyn FieldExtractor>,
        max_fan_out: usize,
        item_timeout: Duration,
        min_confidence: i32,
    ) -> Self {
        Self {
            store,
            storage,
            extractor,
            max_fan_out: max_fan_out.max(1),
            item_timeout,
            min_confidence,
        }
    }

    /// Analyze every item of the batch, then write the consolidated snapshot
    /// and transition to awaiting_confirmation (or failed when nothing
    /// survived).
    pub async fn run(&self, batch: BatchJob) {
        let start = Instant::now();
        let semaphore = Arc::new(Semaphore::new(self.max_fan_out));

        tracing::info!(
            batch_id = %batch.batch_id,
            items = batch.items.len(),
            max_fan_out = self.max_fan_out,
            "Starting batch analysis"
        );

        let item_futures: Vec<_> = batch
            .items
            .iter()
            .cloned()
            .map(|item| {
                let sem = semaphore.clone();
                let owner_id = batch.owner_id;
                let batch_id = batch.batch_id;
                async move {
                    let _permit = sem.acquire().await.expect("analysis semaphore closed");

                    let outcome =
                        match timeout(self.item_timeout, self.analyze_one(owner_id, batch_id, &item))
                            .await
                        {
                            Ok(result) => result,
                            Err(_) => Err(format!(
                                "analysis timed out after {}s",
                                self.item_timeout.as_secs()
                            )),
                        };

                    (item, outcome)
                }
            })
            .collect();

        let results = join_all(item_futures).await;

        let mut analyzed = 0usize;
        let items: Vec<BatchItem> = results
            .into_iter()
            .map(|(mut item, outcome)| {
                match outcome {
                    Ok(fields) => {
                        analyzed += 1;
                        item.status = ItemStatus::Analyzed;
                        item.fields = Some(fields);
                        metrics::counter!("batch_item_analyzed").increment(1);
                    }
                    Err(reason) => {
                        tracing::warn!(
                            batch_id = %batch.batch_id,
                            item_id = %item.item_id,
                            source = %item.source_name,
                            reason = %reason,
                            "Item analysis failed"
                        );
                        item.status = ItemStatus::AnalysisFailed;
                        item.error = Some(reason);
                        metrics::counter!("batch_item_analysis_failed").increment(1);
                    }
                }
                item
            })
            .collect();

        let next_status = if analyzed > 0 {
            BatchStatus::AwaitingConfirmation
        } else {
            BatchStatus::Failed
        };

        let patch = BatchPatch {
            status: Some(next_status),
            items: Some(items),
            ..Default::default()
        };

        match self.store.update(batch.owner_id, batch.batch_id, patch).await {
            Ok(_) => {
                metrics::histogram!("batch_analysis_duration")
                    .record(start.elapsed().as_secs_f64());
                tracing::info!(
                    batch_id = %batch.batch_id,
                    analyzed = analyzed,
                    failed = batch.items.len() - analyzed,
                    status = next_status.as_str(),
                    duration_ms = start.elapsed().as_millis(),
                    "Batch analysis complete"
                );
            }
            Err(e) => {
                tracing::error!(
                    batch_id = %batch.batch_id,
                    error = %e,
                    "Failed to write analysis snapshot"
                );
            }
        }
    }

    async fn analyze_one(
        &self,
        owner_id: uuid::Uuid,
        batch_id: uuid::Uuid,
        item: &BatchItem,
    ) -> Result<ExtractedFields, String> {
        let bytes = self
            .storage
            .download(&item.storage_key)
            .await
            .map_err(|e| format!("source download failed: {}", e))?;

        // Progress marker; losing it is harmless, the snapshot wins.
        if let Err(e) = self
            .store
            .update(
                owner_id,
                batch_id,
                BatchPatch::item(ItemPatch::status(item.item_id, ItemStatus::Downloaded)),
            )
            .await
        {
            tracing::debug!(item_id = %item.item_id, error = %e, "Progress update skipped");
        }

        let fields = self
            .extractor
            .extract(&bytes)
            .await
            .map_err(|e| format!("extraction failed: {}", e))?;

        if fields.confidence < self.min_confidence {
            return Err(format!(
                "extraction confidence {} below threshold {}",
                fields.confidence, self.min_confidence
            ));
        }

        Ok(fields)
    }
}
