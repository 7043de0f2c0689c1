//! Submission queue: rate-limited, priority-aware dispatch to the stamping
//! provider.
//!
//! Two tiers: interactive submissions always preempt batch work; FIFO
//! within a tier. Concurrent in-flight calls are capped and a direct
//! governor quota respects the provider's throttling budget. Retryable
//! failures back off exponentially up to the attempt cap; terminal
//! failures fail the item immediately. A retry always reuses the folio
//! allocated before the first enqueue; the allocator is never called here.

use backoff::ExponentialBackoff;
use backoff::future::retry;
use governor::clock::DefaultClock;
use governor::state::{InMemoryState, NotKeyed};
use governor::{Quota, RateLimiter};
use service_core::error::AppError;
use std::num::NonZeroU32;
use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::{Duration, Instant};
use tokio::sync::{Semaphore, mpsc};
use tokio_util::sync::CancellationToken;

use crate::models::{BatchStatus, InvoiceRef, ItemStatus, Priority, QueuedSubmission};
use crate::services::batch_store::{BatchPatch, BatchStore, ItemPatch};
use crate::services::provider::{InvoicingProvider, ProviderError};

type DirectRateLimiter = RateLimiter<NotKeyed, InMemoryState, DefaultClock>;

#[derive(Debug, Clone)]
pub struct SubmissionSettings {
    /// Concurrent in-flight provider calls.
    pub max_in_flight: usize,
    /// Provider throttling budget.
    pub requests_per_minute: u32,
    /// Total submit attempts per draft, first try included.
    pub max_attempts: u32,
    /// First retry delay; subsequent delays grow exponentially.
    pub retry_initial_interval: Duration,
    /// Capacity of each tier's channel.
    pub queue_capacity: usize,
}

impl Default for SubmissionSettings {
    fn default() -> Self {
        Self {
            max_in_flight: 4,
            requests_per_minute: 60,
            max_attempts: 3,
            retry_initial_interval: Duration::from_millis(500),
            queue_capacity: 256,
        }
    }
}

/// Producer handle. Cheap to clone; handlers keep one in AppState.
#[derive(Clone)]
pub struct SubmissionQueue {
    interactive_tx: mpsc::Sender<QueuedSubmission>,
    batch_tx: mpsc::Sender<QueuedSubmission>,
}

impl SubmissionQueue {
    pub fn enqueue(&self, submission: QueuedSubmission) -> Result<(), AppError> {
        metrics::counter!(
            "submission_enqueued",
            "priority" => submission.priority.as_str()
        )
        .increment(1);

        let tx = match submission.priority {
            Priority::Interactive => &self.interactive_tx,
            Priority::Batch => &self.batch_tx,
        };
        tx.try_send(submission)
            .map_err(|_| AppError::InternalError(anyhow::anyhow!("Submission queue full")))
    }
}

/// Consumer half. `run` owns the dispatch loop until shutdown.
pub struct SubmissionDispatcher {
    interactive_rx: mpsc::Receiver<QueuedSubmission>,
    batch_rx: mpsc::Receiver<QueuedSubmission>,
    store: Arc<dyn BatchStore>,
    provider: Arc<dyn InvoicingProvider>,
    settings: SubmissionSettings,
    limiter: Arc<DirectRateLimiter>,
    in_flight: Arc<Semaphore>,
    shutdown: CancellationToken,
}

pub fn submission_queue(
    store: Arc<dyn BatchStore>,
    provider: Arc<dyn InvoicingProvider>,
    settings: SubmissionSettings,
    shutdown: CancellationToken,
) -> (SubmissionQueue, SubmissionDispatcher) {
    let (interactive_tx, interactive_rx) = mpsc::channel(settings.queue_capacity);
    let (batch_tx, batch_rx) = mpsc::channel(settings.queue_capacity);

    let rpm = NonZeroU32::new(settings.requests_per_minute.max(1))
        .expect("requests_per_minute is guaranteed to be non-zero");
    let limiter = Arc::new(RateLimiter::direct(Quota::per_minute(rpm)));
    let in_flight = Arc::new(Semaphore::new(settings.max_in_flight.max(1)));

    let queue = SubmissionQueue {
        interactive_tx,
        batch_tx,
    };
    let dispatcher = SubmissionDispatcher {
        interactive_rx,
        batch_rx,
        store,
        provider,
        settings,
        limiter,
        in_flight,
        shutdown,
    };

    (queue, dispatcher)
}

impl SubmissionDispatcher {
    pub async fn run(mut self) {
        tracing::info!(
            max_in_flight = self.settings.max_in_flight,
            requests_per_minute = self.settings.requests_per_minute,
            "Submission dispatcher started"
        );

        loop {
            // biased: drain the interactive tier completely before touching
            // batch work.
            let submission = tokio::select! {
                biased;
                _ = self.shutdown.cancelled() => {
                    tracing::info!("Submission dispatcher shutting down");
                    break;
                }
                Some(submission) = self.interactive_rx.recv() => submission,
                Some(submission) = self.batch_rx.recv() => submission,
                else => {
                    tracing::info!("Submission channels closed, dispatcher exiting");
                    break;
                }
            };

            let permit = self
                .in_flight
                .clone()
                .acquire_owned()
                .await
                .expect("in-flight semaphore closed");
            self.limiter.until_ready().await;

            let store = self.store.clone();
            let provider = self.provider.clone();
            let settings = self.settings.clone();

            tokio::spawn(async move {
                let _permit = permit;
                dispatch_one(store, provider, &settings, submission).await;
            });
        }
    }
}

async fn dispatch_one(
    store: Arc<dyn BatchStore>,
    provider: Arc<dyn InvoicingProvider>,
    settings: &SubmissionSettings,
    submission: QueuedSubmission,
) {
    let QueuedSubmission {
        owner_id,
        batch_id,
        item_id,
        draft,
        priority,
        attempts: prior_attempts,
    } = submission;

    // Cancellation gate: a canceled batch blocks everything not yet sent.
    // Dispatched submissions are already an external side effect and stand.
    match store.get(owner_id, batch_id).await {
        Ok(Some(batch)) if batch.status == BatchStatus::Canceled => {
            tracing::info!(
                batch_id = %batch_id,
                item_id = %item_id,
                "Batch canceled, dropping queued submission"
            );
            metrics::counter!("submission_dropped_canceled").increment(1);
            return;
        }
        Ok(Some(_)) => {}
        Ok(None) => {
            tracing::warn!(
                batch_id = %batch_id,
                item_id = %item_id,
                "Batch record expired before dispatch, dropping submission"
            );
            return;
        }
        Err(e) => {
            tracing::warn!(
                batch_id = %batch_id,
                error = %e,
                "Cancellation check failed, dispatching anyway"
            );
        }
    }

    let start = Instant::now();
    // Attempts carried on the submission count against the same cap.
    let attempts = AtomicU32::new(prior_attempts);
    let max_attempts = settings.max_attempts.max(1);

    let policy = ExponentialBackoff {
        initial_interval: settings.retry_initial_interval,
        max_elapsed_time: None,
        ..Default::default()
    };

    let result = retry(policy, || async {
        let attempt = attempts.fetch_add(1, Ordering::SeqCst) + 1;
        match provider.submit(&draft).await {
            Ok(stamped) => Ok(stamped),
            Err(e) if e.is_retryable() && attempt < max_attempts => {
                tracing::warn!(
                    batch_id = %batch_id,
                    item_id = %item_id,
                    folio = draft.folio,
                    attempt = attempt,
                    error = %e,
                    "Retryable provider failure, backing off"
                );
                metrics::counter!("submission_retries").increment(1);
                Err(backoff::Error::transient(e))
            }
            Err(e) => Err(backoff::Error::permanent(e)),
        }
    })
    .await;

    let patch = match &result {
        Ok(stamped) => {
            metrics::counter!("submission_succeeded", "priority" => priority.as_str())
                .increment(1);
            metrics::histogram!("submission_duration").record(start.elapsed().as_secs_f64());
            tracing::info!(
                batch_id = %batch_id,
                item_id = %item_id,
                series = %draft.series,
                folio = draft.folio,
                provider_invoice_id = %stamped.provider_invoice_id,
                "Invoice stamped"
            );
            BatchPatch::item(ItemPatch {
                item_id,
                status: Some(ItemStatus::Submitted),
                invoice_ref: Some(InvoiceRef {
                    provider_invoice_id: stamped.provider_invoice_id.clone(),
                    stamp: stamped.stamp.clone(),
                    series: draft.series.clone(),
                    folio: draft.folio,
                }),
                ..Default::default()
            })
        }
        Err(e) => {
            let terminal = matches!(e, ProviderError::Terminal(_));
            metrics::counter!(
                "submission_failed",
                "terminal" => if terminal { "true" } else { "false" }
            )
            .increment(1);
            tracing::error!(
                batch_id = %batch_id,
                item_id = %item_id,
                folio = draft.folio,
                attempts = attempts.load(Ordering::SeqCst),
                error = %e,
                "Submission failed"
            );
            BatchPatch::item(ItemPatch::failure(
                item_id,
                ItemStatus::SubmitFailed,
                e.to_string(),
            ))
        }
    };

    if let Err(e) = store.update(owner_id, batch_id, patch).await {
        tracing::error!(
            batch_id = %batch_id,
            item_id = %item_id,
            error = %e,
            "Failed to record submission outcome"
        );
    }

    finalize_batch(store.as_ref(), owner_id, batch_id).await;
}

/// Flip a submitting batch to its terminal status once every item has
/// resolved. Safe to call repeatedly.
pub async fn finalize_batch(store: &dyn BatchStore, owner_id: uuid::Uuid, batch_id: uuid::Uuid) {
    let batch = match store.get(owner_id, batch_id).await {
        Ok(Some(batch)) => batch,
        Ok(None) => return,
        Err(e) => {
            tracing::warn!(batch_id = %batch_id, error = %e, "Finalize check failed");
            return;
        }
    };

    if batch.status != BatchStatus::Submitting || !batch.all_items_terminal() {
        return;
    }

    let next = if batch.any_item_submitted() {
        BatchStatus::Completed
    } else {
        BatchStatus::Failed
    };

    match store
        .update(owner_id, batch_id, BatchPatch::status(next))
        .await
    {
        Ok(_) => {
            tracing::info!(batch_id = %batch_id, status = next.as_str(), "Batch finalized");
        }
        Err(e) => {
            tracing::error!(batch_id = %batch_id, error = %e, "Failed to finalize batch");
        }
    }
}
