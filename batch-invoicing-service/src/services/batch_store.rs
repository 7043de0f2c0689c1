//! Distributed batch state store.
//!
//! The authoritative cross-process view of a BatchJob lives in Redis, keyed
//! by (owner, batch) with a TTL. Every pipeline stage goes through
//! read-modify-write here; nothing relies on process-local state alone.
//! When Redis is unreachable the store degrades to an in-process map and
//! flags it: the pipeline keeps working in a single process, cross-process
//! resumption is no longer guaranteed.

use async_trait::async_trait;
use redis::{Client, aio::ConnectionManager};
use service_core::error::AppError;
use std::collections::HashMap;
use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};
use uuid::Uuid;

use crate::models::{
    AllocatedFolio, BatchItem, BatchJob, BatchStatus, ExtractedFields, InvoiceRef, ItemStatus,
    TaxTreatment,
};

/// Targeted mutation of a single item inside a stored record.
#[derive(Debug, Clone, Default)]
pub struct ItemPatch {
    pub item_id: Uuid,
    pub status: Option<ItemStatus>,
    pub fields: Option<ExtractedFields>,
    pub error: Option<String>,
    pub folio: Option<AllocatedFolio>,
    pub invoice_ref: Option<InvoiceRef>,
}

impl ItemPatch {
    pub fn status(item_id: Uuid, status: ItemStatus) -> Self {
        Self {
            item_id,
            status: Some(status),
            ..Default::default()
        }
    }

    pub fn failure(item_id: Uuid, status: ItemStatus, error: impl Into<String>) -> Self {
        Self {
            item_id,
            status: Some(status),
            error: Some(error.into()),
            ..Default::default()
        }
    }
}

/// Partial update merged field-by-field into the stored record, so two
/// in-flight stage transitions cannot clobber each other's unrelated
/// fields.
#[derive(Debug, Clone, Default)]
pub struct BatchPatch {
    pub status: Option<BatchStatus>,
    pub selected_treatment: Option<TaxTreatment>,
    /// Wholesale item list replacement (the analysis snapshot).
    pub items: Option<Vec<BatchItem>>,
    /// Targeted per-item mutations (submission outcomes).
    pub item_patches: Vec<ItemPatch>,
}

impl BatchPatch {
    pub fn status(status: BatchStatus) -> Self {
        Self {
            status: Some(status),
            ..Default::default()
        }
    }

    pub fn item(patch: ItemPatch) -> Self {
        Self {
            item_patches: vec![patch],
            ..Default::default()
        }
    }

    pub fn apply(&self, job: &mut BatchJob) {
        if let Some(status) = self.status {
            // Terminal statuses are final: a late analysis snapshot must not
            // resurrect a canceled batch.
            if !job.status.is_terminal() {
                job.status = status;
            }
        }
        if let Some(treatment) = self.selected_treatment {
            job.selected_treatment = Some(treatment);
        }
        if let Some(items) = &self.items {
            job.items = items.clone();
        }
        for patch in &self.item_patches {
            if let Some(item) = job.item_mut(patch.item_id) {
                if let Some(status) = patch.status {
                    if !item.status.is_terminal() {
                        item.status = status;
                    }
                }
                if let Some(fields) = &patch.fields {
                    item.fields = Some(fields.clone());
                }
                if let Some(error) = &patch.error {
                    item.error = Some(error.clone());
                }
                if let Some(folio) = &patch.folio {
                    item.folio = Some(folio.clone());
                }
                if let Some(invoice_ref) = &patch.invoice_ref {
                    item.invoice_ref = Some(invoice_ref.clone());
                }
            }
        }
    }
}

#[async_trait]
pub trait BatchStore: Send + Sync {
    async fn get(&self, owner_id: Uuid, batch_id: Uuid) -> Result<Option<BatchJob>, AppError>;
    async fn put(&self, record: &BatchJob, ttl: Duration) -> Result<(), AppError>;
    /// Merge `patch` into the stored record, preserving its TTL. Fails with
    /// `NotFound` when the record expired or never existed.
    async fn update(
        &self,
        owner_id: Uuid,
        batch_id: Uuid,
        patch: BatchPatch,
    ) -> Result<BatchJob, AppError>;
    async fn delete(&self, owner_id: Uuid, batch_id: Uuid) -> Result<(), AppError>;
}

fn record_key(owner_id: Uuid, batch_id: Uuid) -> String {
    format!("batch:{}:{}", owner_id, batch_id)
}

/// Redis-backed store, the normal cross-process mode.
#[derive(Clone)]
pub struct RedisBatchStore {
    manager: ConnectionManager,
    /// Serializes read-merge-write updates within this process. Across
    /// processes, each batch's items are mutated by the dispatcher that
    /// owns its submissions, so per-process serialization is sufficient.
    update_guard: std::sync::Arc<tokio::sync::Mutex<()>>,
}

impl RedisBatchStore {
    pub async fn connect(url: &str) -> Result<Self, AppError> {
        tracing::info!(url = %url, "Connecting to Redis batch store");
        let client = Client::open(url)?;
        let manager = client.get_connection_manager().await?;
        tracing::info!("Redis batch store connected");
        Ok(Self {
            manager,
            update_guard: std::sync::Arc::new(tokio::sync::Mutex::new(())),
        })
    }

    async fn read(&self, key: &str) -> Result<Option<BatchJob>, AppError> {
        let mut conn = self.manager.clone();
        let raw: Option<String> = redis::cmd("GET").arg(key).query_async(&mut conn).await?;
        match raw {
            Some(json) => {
                let job = serde_json::from_str(&json).map_err(|e| {
                    AppError::StateStore(anyhow::anyhow!("Corrupt batch record {}: {}", key, e))
                })?;
                Ok(Some(job))
            }
            None => Ok(None),
        }
    }
}

#[async_trait]
impl BatchStore for RedisBatchStore {
    async fn get(&self, owner_id: Uuid, batch_id: Uuid) -> Result<Option<BatchJob>, AppError> {
        self.read(&record_key(owner_id, batch_id)).await
    }

    async fn put(&self, record: &BatchJob, ttl: Duration) -> Result<(), AppError> {
        let key = record_key(record.owner_id, record.batch_id);
        let json = serde_json::to_string(record)
            .map_err(|e| AppError::StateStore(anyhow::anyhow!("Serialize failed: {}", e)))?;
        let mut conn = self.manager.clone();
        redis::cmd("SET")
            .arg(&key)
            .arg(json)
            .arg("EX")
            .arg(ttl.as_secs().max(1))
            .query_async::<_, ()>(&mut conn)
            .await?;
        Ok(())
    }

    async fn update(
        &self,
        owner_id: Uuid,
        batch_id: Uuid,
        patch: BatchPatch,
    ) -> Result<BatchJob, AppError> {
        let _guard = self.update_guard.lock().await;

        let key = record_key(owner_id, batch_id);
        let mut job = self.read(&key).await?.ok_or_else(|| {
            AppError::NotFound(anyhow::anyhow!("Batch {} not found or expired", batch_id))
        })?;

        patch.apply(&mut job);

        let json = serde_json::to_string(&job)
            .map_err(|e| AppError::StateStore(anyhow::anyhow!("Serialize failed: {}", e)))?;
        let mut conn = self.manager.clone();
        redis::cmd("SET")
            .arg(&key)
            .arg(json)
            .arg("KEEPTTL")
            .query_async::<_, ()>(&mut conn)
            .await?;
        Ok(job)
    }

    async fn delete(&self, owner_id: Uuid, batch_id: Uuid) -> Result<(), AppError> {
        let mut conn = self.manager.clone();
        redis::cmd("DEL")
            .arg(record_key(owner_id, batch_id))
            .query_async::<_, ()>(&mut conn)
            .await?;
        Ok(())
    }
}

/// Generic expiring map: get/set/evict with a per-entry deadline. Expired
/// entries are dropped lazily on access, no sweep task involved.
pub struct ExpiringMap<K, V> {
    entries: Mutex<HashMap<K, (V, Instant)>>,
}

impl<K: std::hash::Hash + Eq + Clone, V: Clone> ExpiringMap<K, V> {
    pub fn new() -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
        }
    }

    pub fn get(&self, key: &K) -> Option<V> {
        let mut entries = self.entries.lock().expect("expiring map mutex poisoned");
        match entries.get(key) {
            Some((_, deadline)) if *deadline <= Instant::now() => {
                entries.remove(key);
                None
            }
            Some((value, _)) => Some(value.clone()),
            None => None,
        }
    }

    pub fn set(&self, key: K, value: V, ttl: Duration) {
        let mut entries = self.entries.lock().expect("expiring map mutex poisoned");
        entries.insert(key, (value, Instant::now() + ttl));
    }

    /// Mutate a live entry in place under the map lock, keeping its
    /// deadline. Returns the updated value, or None when the entry is gone
    /// or expired. This is the atomic read-modify-write primitive.
    pub fn update(&self, key: &K, f: impl FnOnce(&mut V)) -> Option<V> {
        let mut entries = self.entries.lock().expect("expiring map mutex poisoned");
        match entries.get_mut(key) {
            Some((_, deadline)) if *deadline <= Instant::now() => {
                entries.remove(key);
                None
            }
            Some((value, _)) => {
                f(value);
                Some(value.clone())
            }
            None => None,
        }
    }

    pub fn evict(&self, key: &K) {
        let mut entries = self.entries.lock().expect("expiring map mutex poisoned");
        entries.remove(key);
    }
}

impl<K: std::hash::Hash + Eq + Clone, V: Clone> Default for ExpiringMap<K, V> {
    fn default() -> Self {
        Self::new()
    }
}

/// In-process fallback store with the same TTL semantics.
#[derive(Default)]
pub struct InMemoryBatchStore {
    records: ExpiringMap<(Uuid, Uuid), BatchJob>,
}

impl InMemoryBatchStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl BatchStore for InMemoryBatchStore {
    async fn get(&self, owner_id: Uuid, batch_id: Uuid) -> Result<Option<BatchJob>, AppError> {
        Ok(self.records.get(&(owner_id, batch_id)))
    }

    async fn put(&self, record: &BatchJob, ttl: Duration) -> Result<(), AppError> {
        self.records
            .set((record.owner_id, record.batch_id), record.clone(), ttl);
        Ok(())
    }

    async fn update(
        &self,
        owner_id: Uuid,
        batch_id: Uuid,
        patch: BatchPatch,
    ) -> Result<BatchJob, AppError> {
        let key = (owner_id, batch_id);
        self.records
            .update(&key, |job| patch.apply(job))
            .ok_or_else(|| {
                AppError::NotFound(anyhow::anyhow!("Batch {} not found or expired", batch_id))
            })
    }

    async fn delete(&self, owner_id: Uuid, batch_id: Uuid) -> Result<(), AppError> {
        self.records.evict(&(owner_id, batch_id));
        Ok(())
    }
}

/// Store that prefers Redis and falls back to the in-process map when Redis
/// errors, flagging degraded mode. The flag is sticky: once degraded, the
/// in-process map is authoritative for the rest of this process's life so
/// records do not split across the two layers.
pub struct DegradableBatchStore {
    primary: Option<RedisBatchStore>,
    fallback: InMemoryBatchStore,
    degraded: AtomicBool,
}

impl DegradableBatchStore {
    pub fn new(primary: Option<RedisBatchStore>) -> Self {
        if primary.is_none() {
            tracing::warn!(
                "Batch store running without Redis: degraded mode, cross-process resumption unavailable"
            );
        }
        Self {
            degraded: AtomicBool::new(primary.is_none()),
            primary,
            fallback: InMemoryBatchStore::new(),
        }
    }

    pub fn is_degraded(&self) -> bool {
        self.degraded.load(Ordering::SeqCst)
    }

    fn enter_degraded(&self, err: &AppError) {
        if !self.degraded.swap(true, Ordering::SeqCst) {
            tracing::warn!(
                error = %err,
                "Batch store degraded to in-process mode; cross-process resumption unavailable"
            );
        }
    }

    fn active(&self) -> Option<&RedisBatchStore> {
        if self.is_degraded() {
            None
        } else {
            self.primary.as_ref()
        }
    }
}

#[async_trait]
impl BatchStore for DegradableBatchStore {
    async fn get(&self, owner_id: Uuid, batch_id: Uuid) -> Result<Option<BatchJob>, AppError> {
        if let Some(primary) = self.active() {
            match primary.get(owner_id, batch_id).await {
                Ok(record) => return Ok(record),
                Err(e) => self.enter_degraded(&e),
            }
        }
        self.fallback.get(owner_id, batch_id).await
    }

    async fn put(&self, record: &BatchJob, ttl: Duration) -> Result<(), AppError> {
        if let Some(primary) = self.active() {
            match primary.put(record, ttl).await {
                Ok(()) => return Ok(()),
                Err(e) => self.enter_degraded(&e),
            }
        }
        self.fallback.put(record, ttl).await
    }

    async fn update(
        &self,
        owner_id: Uuid,
        batch_id: Uuid,
        patch: BatchPatch,
    ) -> Result<BatchJob, AppError> {
        if let Some(primary) = self.active() {
            match primary.update(owner_id, batch_id, patch.clone()).await {
                Ok(record) => return Ok(record),
                // NotFound is an answer, not an outage.
                Err(e @ AppError::NotFound(_)) => return Err(e),
                Err(e) => self.enter_degraded(&e),
            }
        }
        self.fallback.update(owner_id, batch_id, patch).await
    }

    async fn delete(&self, owner_id: Uuid, batch_id: Uuid) -> Result<(), AppError> {
        if let Some(primary) = self.active() {
            match primary.delete(owner_id, batch_id).await {
                Ok(()) => return Ok(()),
                Err(e) => self.enter_degraded(&e),
            }
        }
        self.fallback.delete(owner_id, batch_id).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::BatchItem;

    fn sample_batch() -> BatchJob {
        BatchJob::new(
            Uuid::new_v4(),
            Uuid::new_v4(),
            "A".to_string(),
            vec![BatchItem::new("a.pdf", "key-a"), BatchItem::new("b.pdf", "key-b")],
            chrono::Duration::hours(1),
        )
    }

    #[test]
    fn expiring_map_drops_entries_past_deadline() {
        let map: ExpiringMap<&str, u32> = ExpiringMap::new();
        map.set("live", 1, Duration::from_secs(60));
        map.set("dead", 2, Duration::from_millis(0));

        std::thread::sleep(Duration::from_millis(5));

        assert_eq!(map.get(&"live"), Some(1));
        assert_eq!(map.get(&"dead"), None);
        assert!(map.update(&"dead", |v| *v += 1).is_none());
        assert_eq!(map.update(&"live", |v| *v += 1), Some(2));
    }

    #[tokio::test]
    async fn update_merges_without_clobbering_unrelated_fields() {
        let store = InMemoryBatchStore::new();
        let mut batch = sample_batch();
        batch.status = BatchStatus::Submitting;
        batch.selected_treatment = Some(TaxTreatment::NoWithholding);
        store.put(&batch, Duration::from_secs(60)).await.unwrap();

        let item_id = batch.items[0].item_id;
        let updated = store
            .update(
                batch.owner_id,
                batch.batch_id,
                BatchPatch::item(ItemPatch::status(item_id, ItemStatus::Submitted)),
            )
            .await
            .unwrap();

        // Item patched, everything else untouched.
        assert_eq!(updated.items[0].status, ItemStatus::Submitted);
        assert_eq!(updated.items[1].status, ItemStatus::Pending);
        assert_eq!(updated.status, BatchStatus::Submitting);
        assert_eq!(
            updated.selected_treatment,
            Some(TaxTreatment::NoWithholding)
        );
    }

    #[tokio::test]
    async fn update_missing_record_is_not_found() {
        let store = InMemoryBatchStore::new();
        let err = store
            .update(
                Uuid::new_v4(),
                Uuid::new_v4(),
                BatchPatch::status(BatchStatus::Canceled),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, AppError::NotFound(_)));
    }

    #[tokio::test]
    async fn degraded_store_round_trips_without_redis() {
        let store = DegradableBatchStore::new(None);
        assert!(store.is_degraded());

        let batch = sample_batch();
        store.put(&batch, Duration::from_secs(60)).await.unwrap();

        let loaded = store
            .get(batch.owner_id, batch.batch_id)
            .await
            .unwrap()
            .expect("record in fallback");
        assert_eq!(loaded.batch_id, batch.batch_id);

        store
            .update(
                batch.owner_id,
                batch.batch_id,
                BatchPatch::status(BatchStatus::Canceled),
            )
            .await
            .unwrap();
        let loaded = store
            .get(batch.owner_id, batch.batch_id)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(loaded.status, BatchStatus::Canceled);

        store.delete(batch.owner_id, batch.batch_id).await.unwrap();
        assert!(
            store
                .get(batch.owner_id, batch.batch_id)
                .await
                .unwrap()
                .is_none()
        );
    }
}
