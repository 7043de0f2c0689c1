//! Submission queue job models.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::models::invoice::InvoiceDraft;

/// Dispatch tier. Interactive submissions preempt batch work; FIFO within
/// a tier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Priority {
    Interactive,
    Batch,
}

impl Priority {
    pub fn as_str(&self) -> &'static str {
        match self {
            Priority::Interactive => "interactive",
            Priority::Batch => "batch",
        }
    }
}

/// A fully-allocated draft waiting for dispatch to the stamping provider.
#[derive(Debug, Clone)]
pub struct QueuedSubmission {
    pub owner_id: Uuid,
    pub batch_id: Uuid,
    pub item_id: Uuid,
    pub draft: InvoiceDraft,
    pub priority: Priority,
    pub attempts: u32,
}
