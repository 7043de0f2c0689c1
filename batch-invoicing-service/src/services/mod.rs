pub mod batch_store;
pub mod calculator;
pub mod database;
pub mod directory;
pub mod extractor;
pub mod folio;
pub mod metrics;
pub mod packager;
pub mod provider;
pub mod storage;

pub use batch_store::{
    BatchPatch, BatchStore, DegradableBatchStore, ExpiringMap, InMemoryBatchStore, ItemPatch,
    RedisBatchStore,
};
pub use calculator::TaxProfile;
pub use database::Database;
pub use directory::{CustomerDirectory, HttpCustomerDirectory, StaticCustomerDirectory};
pub use extractor::{ExtractorError, FieldExtractor, HttpFieldExtractor, MockFieldExtractor};
pub use folio::{FolioAllocator, MockFolioAllocator, PgFolioAllocator};
pub use metrics::{get_metrics, init_metrics};
pub use packager::ArtifactPackager;
pub use provider::{
    HttpInvoicingProvider, InvoicingProvider, MockInvoicingProvider, ProviderError,
    ProviderFailure, StampedInvoice,
};
pub use storage::{LocalStorage, Storage};
