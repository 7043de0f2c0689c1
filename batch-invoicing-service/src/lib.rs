//! Batch invoice-generation pipeline.
//!
//! Ingests a group of source documents, extracts structured fields from
//! each under bounded concurrency, lets an operator pick a tax treatment,
//! allocates legally-unique sequential folios, submits drafts to the
//! external stamping provider under a rate limit with classified retries,
//! and packages the resulting artifacts.

pub mod config;
pub mod handlers;
pub mod middleware;
pub mod models;
pub mod services;
pub mod startup;
pub mod workers;
