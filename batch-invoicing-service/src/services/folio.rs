//! Folio allocation: legally-unique sequential invoice numbers.
//!
//! The counter is the single source of truth shared by every worker
//! process. Allocation must be a one-statement atomic read-modify-write:
//! under K concurrent calls for the same (tenant, series) the returned
//! numbers are exactly {last+1 .. last+K}, no duplicates, no gaps. A folio
//! is consumed forever once returned; there is no unallocation path.

use async_trait::async_trait;
use service_core::error::AppError;
use sqlx::postgres::PgPool;
use std::collections::HashMap;
use std::sync::Mutex;
use tracing::{info, instrument};
use uuid::Uuid;

#[async_trait]
pub trait FolioAllocator: Send + Sync {
    /// Allocate the next folio for the given tenant and series. Fails with
    /// `AppError::Allocation` when the counter update cannot be confirmed;
    /// on failure no counter mutation is observable.
    async fn allocate(&self, tenant_id: Uuid, series: &str) -> Result<i64, AppError>;
}

/// Postgres-backed allocator over the `folio_counters` table.
#[derive(Clone)]
pub struct PgFolioAllocator {
    pool: PgPool,
}

impl PgFolioAllocator {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl FolioAllocator for PgFolioAllocator {
    #[instrument(skip(self), fields(tenant_id = %tenant_id, series = %series))]
    async fn allocate(&self, tenant_id: Uuid, series: &str) -> Result<i64, AppError> {
        // Single statement: the row lock taken by the upsert serializes
        // concurrent allocators, and a failed statement leaves the counter
        // untouched.
        let folio: i64 = sqlx::query_scalar(
            r#"
            INSERT INTO folio_counters (tenant_id, series, last_folio, updated_utc)
            VALUES ($1, $2, 1, NOW())
            ON CONFLICT (tenant_id, series)
            DO UPDATE SET last_folio = folio_counters.last_folio + 1,
                          updated_utc = NOW()
            RETURNING last_folio
            "#,
        )
        .bind(tenant_id)
        .bind(series)
        .fetch_one(&self.pool)
        .await
        .map_err(|e| AppError::Allocation(anyhow::anyhow!("Counter update failed: {}", e)))?;

        info!(folio = folio, "Folio allocated");

        Ok(folio)
    }
}

/// In-process allocator for tests and local runs without Postgres. Keeps
/// the same gap-free, duplicate-free contract within a single process.
#[derive(Default)]
pub struct MockFolioAllocator {
    counters: Mutex<HashMap<(Uuid, String), i64>>,
    fail: std::sync::atomic::AtomicBool,
}

impl MockFolioAllocator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make subsequent allocations fail without advancing any counter.
    pub fn set_failing(&self, failing: bool) {
        self.fail
            .store(failing, std::sync::atomic::Ordering::SeqCst);
    }

    pub fn last_issued(&self, tenant_id: Uuid, series: &str) -> Option<i64> {
        self.counters
            .lock()
            .expect("folio counter mutex poisoned")
            .get(&(tenant_id, series.to_string()))
            .copied()
    }
}

#[async_trait]
impl FolioAllocator for MockFolioAllocator {
    async fn allocate(&self, tenant_id: Uuid, series: &str) -> Result<i64, AppError> {
        if self.fail.load(std::sync::atomic::Ordering::SeqCst) {
            return Err(AppError::Allocation(anyhow::anyhow!(
                "Counter store unavailable"
            )));
        }

        let mut counters = self
            .counters
            .lock()
            .map_err(|e| AppError::Allocation(anyhow::anyhow!("Counter mutex poisoned: {}", e)))?;
        let entry = counters.entry((tenant_id, series.to_string())).or_insert(0);
        *entry += 1;
        Ok(*entry)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;
    use std::sync::Arc;

    #[tokio::test]
    async fn failed_allocation_does_not_advance_counter() {
        let allocator = MockFolioAllocator::new();
        let tenant = Uuid::new_v4();

        assert_eq!(allocator.allocate(tenant, "A").await.unwrap(), 1);

        allocator.set_failing(true);
        assert!(allocator.allocate(tenant, "A").await.is_err());

        allocator.set_failing(false);
        assert_eq!(allocator.allocate(tenant, "A").await.unwrap(), 2);
    }

    #[tokio::test]
    async fn concurrent_allocations_are_gap_free() {
        let allocator = Arc::new(MockFolioAllocator::new());
        let tenant = Uuid::new_v4();

        let mut handles = Vec::new();
        for _ in 0..20 {
            let allocator = allocator.clone();
            handles.push(tokio::spawn(async move {
                allocator.allocate(tenant, "A").await.unwrap()
            }));
        }

        let mut seen = HashSet::new();
        for handle in handles {
            assert!(seen.insert(handle.await.unwrap()));
        }

        let expected: HashSet<i64> = (1..=20).collect();
        assert_eq!(seen, expected);
    }

    #[tokio::test]
    async fn series_partition_counters() {
        let allocator = MockFolioAllocator::new();
        let tenant = Uuid::new_v4();

        assert_eq!(allocator.allocate(tenant, "A").await.unwrap(), 1);
        assert_eq!(allocator.allocate(tenant, "B").await.unwrap(), 1);
        assert_eq!(allocator.allocate(tenant, "A").await.unwrap(), 2);
    }
}
