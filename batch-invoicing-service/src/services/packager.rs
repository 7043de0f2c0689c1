//! Result aggregation and artifact packaging.
//!
//! Fetches provider renditions for every stamped invoice in a batch and
//! streams them into a single zip. A fetch failure excludes that item and
//! is recorded in the archive manifest, never failing the whole archive.
//! Scratch copies are removed after a bounded grace period; cleanup errors
//! are logged, never surfaced.

use service_core::error::AppError;
use std::io::{Cursor, Write};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use zip::{CompressionMethod, ZipWriter, write::SimpleFileOptions};

use crate::models::{BatchJob, BatchSummary, ItemStatus, RenditionFormat};
use crate::services::provider::InvoicingProvider;
use crate::services::storage::Storage;

pub struct ArtifactPackager {
    provider: Arc<dyn InvoicingProvider>,
    storage: Arc<dyn Storage>,
    scratch_dir: PathBuf,
    cleanup_grace: Duration,
}

impl ArtifactPackager {
    pub fn new(
        provider: Arc<dyn InvoicingProvider>,
        storage: Arc<dyn Storage>,
        scratch_dir: impl Into<PathBuf>,
        cleanup_grace: Duration,
    ) -> Self {
        Self {
            provider,
            storage,
            scratch_dir: scratch_dir.into(),
            cleanup_grace,
        }
    }

    /// Terminal per-item outcomes with human-readable reasons.
    pub fn summarize(&self, batch: &BatchJob) -> BatchSummary {
        batch.summary()
    }

    /// Build the archive for a batch. Returns the archive bytes; the scratch
    /// copy on disk is deleted after the grace period.
    pub async fn package(
        &self,
        batch: &BatchJob,
        format: RenditionFormat,
    ) -> Result<Vec<u8>, AppError> {
        let mut renditions: Vec<(String, Vec<u8>)> = Vec::new();
        let mut fetch_failures: Vec<(String, String)> = Vec::new();

        for item in &batch.items {
            if item.status != ItemStatus::Submitted {
                continue;
            }
            let Some(invoice_ref) = &item.invoice_ref else {
                continue;
            };

            match self
                .provider
                .fetch_rendition(&invoice_ref.provider_invoice_id, format)
                .await
            {
                Ok(bytes) => {
                    let file_name = format!(
                        "{}-{}.{}",
                        invoice_ref.series,
                        invoice_ref.folio,
                        format.extension()
                    );
                    renditions.push((file_name, bytes));
                }
                Err(e) => {
                    tracing::warn!(
                        item_id = %item.item_id,
                        provider_invoice_id = %invoice_ref.provider_invoice_id,
                        error = %e,
                        "Rendition fetch failed, excluding from archive"
                    );
                    metrics::counter!("artifact_fetch_failed").increment(1);
                    fetch_failures.push((item.source_name.clone(), e.to_string()));
                }
            }
        }

        if renditions.is_empty() {
            return Err(AppError::Packaging(anyhow::anyhow!(
                "No artifacts available for batch {}",
                batch.batch_id
            )));
        }

        let bytes = build_zip(&renditions, &fetch_failures)?;

        self.persist_scratch_copy(batch, format, &bytes).await;
        self.schedule_source_cleanup(batch);

        metrics::counter!("artifact_archives_built").increment(1);

        Ok(bytes)
    }

    /// The sources were only needed for analysis; once artifacts are
    /// delivered they are removed after the same grace period. Errors are
    /// logged, never surfaced.
    fn schedule_source_cleanup(&self, batch: &BatchJob) {
        let storage = self.storage.clone();
        let keys: Vec<String> = batch
            .items
            .iter()
            .filter(|i| !i.storage_key.is_empty())
            .map(|i| i.storage_key.clone())
            .collect();
        let grace = self.cleanup_grace;

        tokio::spawn(async move {
            tokio::time::sleep(grace).await;
            for key in keys {
                if let Err(e) = storage.delete(&key).await {
                    tracing::warn!(key = %key, error = %e, "Source cleanup failed");
                }
            }
        });
    }

    /// Best-effort scratch copy with delayed cleanup. Failures here never
    /// reach the caller; the archive already exists in memory.
    async fn persist_scratch_copy(&self, batch: &BatchJob, format: RenditionFormat, bytes: &[u8]) {
        if let Err(e) = tokio::fs::create_dir_all(&self.scratch_dir).await {
            tracing::warn!(error = %e, "Failed to create scratch dir, skipping scratch copy");
            return;
        }

        let path = self
            .scratch_dir
            .join(format!("batch_{}_{}.zip", batch.batch_id, format.as_str()));

        if let Err(e) = tokio::fs::write(&path, bytes).await {
            tracing::warn!(path = ?path, error = %e, "Failed to write scratch archive");
            return;
        }

        let grace = self.cleanup_grace;
        tokio::spawn(async move {
            tokio::time::sleep(grace).await;
            if let Err(e) = tokio::fs::remove_file(&path).await {
                tracing::warn!(path = ?path, error = %e, "Scratch archive cleanup failed");
            }
        });
    }
}

fn build_zip(
    renditions: &[(String, Vec<u8>)],
    fetch_failures: &[(String, String)],
) -> Result<Vec<u8>, AppError> {
    let mut writer = ZipWriter::new(Cursor::new(Vec::new()));
    let options = SimpleFileOptions::default().compression_method(CompressionMethod::Deflated);

    for (name, bytes) in renditions {
        writer
            .start_file(name.as_str(), options)
            .map_err(|e| AppError::Packaging(anyhow::anyhow!("Archive entry failed: {}", e)))?;
        writer
            .write_all(bytes)
            .map_err(|e| AppError::Packaging(anyhow::anyhow!("Archive write failed: {}", e)))?;
    }

    if !fetch_failures.is_empty() {
        writer
            .start_file("failures.txt", options)
            .map_err(|e| AppError::Packaging(anyhow::anyhow!("Archive entry failed: {}", e)))?;
        for (source_name, reason) in fetch_failures {
            writeln!(writer, "{}: {}", source_name, reason)
                .map_err(|e| AppError::Packaging(anyhow::anyhow!("Archive write failed: {}", e)))?;
        }
    }

    let cursor = writer
        .finish()
        .map_err(|e| AppError::Packaging(anyhow::anyhow!("Archive finalize failed: {}", e)))?;

    Ok(cursor.into_inner())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn zip_contains_one_entry_per_rendition_plus_manifest() {
        let renditions = vec![
            ("A-1.pdf".to_string(), b"pdf one".to_vec()),
            ("A-2.pdf".to_string(), b"pdf two".to_vec()),
        ];
        let failures = vec![("c.pdf".to_string(), "rendition unavailable".to_string())];

        let bytes = build_zip(&renditions, &failures).unwrap();

        let mut archive = zip::ZipArchive::new(Cursor::new(bytes)).unwrap();
        assert_eq!(archive.len(), 3);
        assert!(archive.by_name("A-1.pdf").is_ok());
        assert!(archive.by_name("A-2.pdf").is_ok());
        assert!(archive.by_name("failures.txt").is_ok());
    }

    #[test]
    fn zip_without_failures_has_no_manifest() {
        let renditions = vec![("A-1.xml".to_string(), b"<xml/>".to_vec())];
        let bytes = build_zip(&renditions, &[]).unwrap();

        let mut archive = zip::ZipArchive::new(Cursor::new(bytes)).unwrap();
        assert_eq!(archive.len(), 1);
        assert!(archive.by_name("failures.txt").is_err());
    }
}
