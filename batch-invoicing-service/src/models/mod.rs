pub mod batch;
pub mod invoice;
pub mod submission;

pub use batch::{
    AllocatedFolio, BatchItem, BatchJob, BatchStatus, BatchSummary, ExtractedFields, FailureEntry,
    InvoiceRef, ItemStatus, SuccessEntry, TaxTreatment,
};
pub use invoice::{
    AppliedTaxRate, CustomerProfile, FinancialBreakdown, InvoiceDraft, LineItem, RenditionFormat,
    TaxLine, TreatmentComparison,
};
pub use submission::{Priority, QueuedSubmission};
