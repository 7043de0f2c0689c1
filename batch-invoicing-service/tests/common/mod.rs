//! Common test utilities: an in-process TestApp with mock collaborators.

#![allow(dead_code)]

use std::sync::Arc;
use std::time::Duration;

use batch_invoicing_service::config::{
    BatchingConfig, DatabaseConfig, DirectoryConfig, ExtractorConfig, PipelineConfig,
    ProviderConfig, RedisConfig, StorageConfig,
};
use batch_invoicing_service::models::{BatchStatus, CustomerProfile, ExtractedFields, ItemStatus};
use batch_invoicing_service::services::{
    DegradableBatchStore, LocalStorage, MockFieldExtractor, MockFolioAllocator,
    MockInvoicingProvider, StaticCustomerDirectory, Storage,
};
use batch_invoicing_service::startup::{Application, Dependencies};
use rust_decimal::Decimal;
use serde_json::{Value, json};
use uuid::Uuid;

pub struct TestHarness {
    pub provider: Arc<MockInvoicingProvider>,
    pub extractor: Arc<MockFieldExtractor>,
    pub max_in_flight: usize,
    pub analysis_timeout_secs: u64,
}

impl Default for TestHarness {
    fn default() -> Self {
        Self {
            provider: Arc::new(MockInvoicingProvider::new()),
            extractor: Arc::new(MockFieldExtractor::new()),
            max_in_flight: 4,
            analysis_timeout_secs: 5,
        }
    }
}

pub struct TestApp {
    pub address: String,
    pub client: reqwest::Client,
    pub tenant_id: Uuid,
    pub owner_id: Uuid,
    pub store: Arc<DegradableBatchStore>,
    pub storage: Arc<LocalStorage>,
    pub extractor: Arc<MockFieldExtractor>,
    pub provider: Arc<MockInvoicingProvider>,
    pub directory: Arc<StaticCustomerDirectory>,
    pub allocator: Arc<MockFolioAllocator>,
    _scratch: tempfile::TempDir,
}

fn test_config(storage_path: &str, scratch_path: &str, harness: &TestHarness) -> BatchingConfig {
    BatchingConfig {
        common: service_core::config::Config {
            port: 0,
            log_level: "info".to_string(),
        },
        database: DatabaseConfig {
            url: "postgres://unused".to_string(),
            max_connections: 1,
            min_connections: 0,
        },
        redis: RedisConfig {
            url: "redis://unused".to_string(),
        },
        storage: StorageConfig {
            local_path: storage_path.to_string(),
            scratch_path: scratch_path.to_string(),
        },
        extractor: ExtractorConfig {
            endpoint: "http://unused".to_string(),
            timeout_secs: 5,
            min_confidence: 50,
        },
        provider: ProviderConfig {
            base_url: "http://unused".to_string(),
            api_key: "test".to_string(),
            timeout_secs: 5,
            max_attempts: 3,
            max_in_flight: harness.max_in_flight,
            requests_per_minute: 6000,
        },
        directory: DirectoryConfig {
            base_url: "http://unused".to_string(),
            timeout_secs: 5,
        },
        pipeline: PipelineConfig {
            max_items: 10,
            max_total_bytes: 100 * 1024 * 1024,
            record_ttl_secs: 3600,
            analysis_timeout_secs: harness.analysis_timeout_secs,
            max_fan_out: 10,
            artifact_grace_secs: 1,
            default_series: "A".to_string(),
        },
    }
}

impl TestApp {
    pub async fn spawn() -> Self {
        Self::spawn_with(TestHarness::default()).await
    }

    pub async fn spawn_with(harness: TestHarness) -> Self {
        service_core::observability::init_tracing_local("warn");

        let scratch = tempfile::tempdir().expect("Failed to create temp dir");
        let storage_path = scratch.path().join("storage");
        let scratch_path = scratch.path().join("scratch");

        let config = test_config(
            storage_path.to_str().expect("utf-8 temp path"),
            scratch_path.to_str().expect("utf-8 temp path"),
            &harness,
        );

        let store = Arc::new(DegradableBatchStore::new(None));
        let storage = Arc::new(
            LocalStorage::new(&storage_path)
                .await
                .expect("Failed to create local storage"),
        );
        let directory = Arc::new(StaticCustomerDirectory::new());
        let allocator = Arc::new(MockFolioAllocator::new());

        let app = Application::build(
            config,
            Dependencies {
                db: None,
                store: store.clone(),
                storage: storage.clone(),
                extractor: harness.extractor.clone(),
                provider: harness.provider.clone(),
                directory: directory.clone(),
                allocator: allocator.clone(),
            },
        )
        .await
        .expect("Failed to build application");

        let port = app.port();
        tokio::spawn(app.run_until_stopped());

        Self {
            address: format!("http://127.0.0.1:{}", port),
            client: reqwest::Client::new(),
            tenant_id: Uuid::new_v4(),
            owner_id: Uuid::new_v4(),
            store,
            storage,
            extractor: harness.extractor,
            provider: harness.provider,
            directory,
            allocator,
            _scratch: scratch,
        }
    }

    /// Register a customer the directory will resolve.
    pub fn register_customer(&self, customer_ref: &str, withholding_eligible: bool) -> Uuid {
        let customer_id = Uuid::new_v4();
        self.directory.insert(
            customer_ref,
            CustomerProfile {
                customer_id,
                name: format!("{} S.A.", customer_ref),
                withholding_eligible,
            },
        );
        customer_id
    }

    /// Seed a source document and script its extraction result.
    pub async fn seed_document(
        &self,
        key: &str,
        customer_ref: &str,
        amount: &str,
        confidence: i32,
    ) {
        let bytes = format!("document body for {}", key).into_bytes();
        self.storage
            .upload(key, bytes.clone())
            .await
            .expect("Failed to seed document");
        self.extractor.on_bytes(
            bytes,
            Ok(ExtractedFields {
                customer_ref: customer_ref.to_string(),
                order_ref: format!("PO-{}", key),
                amount: amount.parse::<Decimal>().expect("valid amount"),
                confidence,
            }),
        );
    }

    /// Seed a document whose extraction fails outright.
    pub async fn seed_failing_document(&self, key: &str, reason: &str) {
        let bytes = format!("document body for {}", key).into_bytes();
        self.storage
            .upload(key, bytes.clone())
            .await
            .expect("Failed to seed document");
        self.extractor.on_bytes(bytes, Err(reason.to_string()));
    }

    pub fn document_request(&self, key: &str) -> Value {
        json!({
            "name": format!("{}.pdf", key),
            "content_type": "application/pdf",
            "size_bytes": 1024,
            "storage_key": key,
        })
    }

    pub async fn create_batch(&self, documents: Vec<Value>) -> reqwest::Response {
        self.client
            .post(format!("{}/batches", self.address))
            .header("X-Owner-Id", self.owner_id.to_string())
            .json(&json!({
                "tenant_id": self.tenant_id,
                "documents": documents,
            }))
            .send()
            .await
            .expect("Failed to execute create batch request")
    }

    pub async fn get_batch(&self, batch_id: &str) -> Value {
        self.client
            .get(format!("{}/batches/{}", self.address, batch_id))
            .header("X-Owner-Id", self.owner_id.to_string())
            .send()
            .await
            .expect("Failed to execute get batch request")
            .json()
            .await
            .expect("Batch snapshot is not JSON")
    }

    pub async fn confirm_batch(&self, batch_id: &str, treatment: &str) -> reqwest::Response {
        self.client
            .post(format!("{}/batches/{}/confirm", self.address, batch_id))
            .header("X-Owner-Id", self.owner_id.to_string())
            .json(&json!({ "treatment": treatment }))
            .send()
            .await
            .expect("Failed to execute confirm request")
    }

    pub async fn cancel_batch(&self, batch_id: &str) -> reqwest::Response {
        self.client
            .post(format!("{}/batches/{}/cancel", self.address, batch_id))
            .header("X-Owner-Id", self.owner_id.to_string())
            .send()
            .await
            .expect("Failed to execute cancel request")
    }

    /// Poll until the batch reaches `status` or the timeout elapses.
    pub async fn wait_for_status(&self, batch_id: &str, status: BatchStatus) -> Value {
        let deadline = tokio::time::Instant::now() + Duration::from_secs(10);
        loop {
            let snapshot = self.get_batch(batch_id).await;
            if snapshot["status"] == status.as_str() {
                return snapshot;
            }
            if tokio::time::Instant::now() > deadline {
                panic!(
                    "Batch {} never reached {} (last: {})",
                    batch_id, status.as_str(), snapshot["status"]
                );
            }
            tokio::time::sleep(Duration::from_millis(25)).await;
        }
    }

    /// Poll until `count` items carry the given status.
    pub async fn wait_for_item_count(&self, batch_id: &str, status: ItemStatus, count: usize) {
        let deadline = tokio::time::Instant::now() + Duration::from_secs(10);
        loop {
            let snapshot = self.get_batch(batch_id).await;
            let matching = items_with_status(&snapshot, status);
            if matching == count {
                return;
            }
            if tokio::time::Instant::now() > deadline {
                panic!(
                    "Batch {} never reached {} items with status {} (last snapshot: {})",
                    batch_id,
                    count,
                    status.as_str(),
                    snapshot
                );
            }
            tokio::time::sleep(Duration::from_millis(25)).await;
        }
    }
}

pub fn items_with_status(snapshot: &Value, status: ItemStatus) -> usize {
    snapshot["items"]
        .as_array()
        .map(|items| {
            items
                .iter()
                .filter(|i| i["status"] == status.as_str())
                .count()
        })
        .unwrap_or(0)
}

/// Folio numbers recorded on submitted items.
pub fn submitted_folios(snapshot: &Value) -> Vec<i64> {
    snapshot["items"]
        .as_array()
        .map(|items| {
            items
                .iter()
                .filter(|i| i["status"] == "submitted")
                .filter_map(|i| i["invoice_ref"]["folio"].as_i64())
                .collect()
        })
        .unwrap_or_default()
}
