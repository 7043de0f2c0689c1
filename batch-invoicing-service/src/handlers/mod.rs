pub mod batches;
pub mod health;
pub mod invoices;

pub use batches::{cancel_batch, confirm_batch, create_batch, get_artifacts, get_batch};
pub use health::{health_check, metrics_endpoint, readiness_check};
pub use invoices::create_invoice;
