pub mod analysis;
pub mod submission;

pub use analysis::AnalysisPool;
pub use submission::{SubmissionDispatcher, SubmissionQueue, finalize_batch, submission_queue};
