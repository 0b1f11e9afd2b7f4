use crate::distribute::{self, DistributionReport};
use crate::ingest::{self, IngestError, TabularFormat};
use crate::models::LeadDraft;
use crate::state::{AppState, StoreError};
use chrono::Utc;
use std::io::Write;
use std::path::Path;
use tempfile::NamedTempFile;
use uuid::Uuid;

pub const ALLOWED_MIME_TYPES: [&str; 3] = [
    "text/csv",
    "application/vnd.ms-excel",
    "application/vnd.openxmlformats-officedocument.spreadsheetml.sheet",
];

#[derive(Debug, thiserror::Error)]
pub enum UploadError {
    #[error("No file uploaded")]
    NoFile,
    #[error("Invalid file type. Only CSV, XLS, and XLSX files are allowed.")]
    InvalidType,
    #[error("File too large (max {limit} bytes)")]
    TooLarge { limit: usize },
    #[error("{0}")]
    Multipart(String),
    #[error(transparent)]
    Ingest(#[from] IngestError),
    #[error("No valid leads found in the file")]
    NoValidLeads,
    #[error("No active agents found")]
    NoActiveAgents,
    #[error("staging upload failed: {0}")]
    Io(#[from] std::io::Error),
    #[error("parser task failed: {0}")]
    Task(#[from] tokio::task::JoinError),
    #[error(transparent)]
    Store(#[from] StoreError),
}

fn check_mime(content_type: Option<&str>) -> Result<(), UploadError> {
    let essence = content_type
        .and_then(|ct| ct.split(';').next())
        .map(|ct| ct.trim().to_ascii_lowercase())
        .ok_or(UploadError::InvalidType)?;
    if ALLOWED_MIME_TYPES.contains(&essence.as_str()) {
        Ok(())
    } else {
        Err(UploadError::InvalidType)
    }
}

/// An accepted upload written to the staging directory. The file is removed
/// when this value is dropped, whichever way the pipeline ends.
#[derive(Debug)]
pub struct StagedUpload {
    file: NamedTempFile,
    original_name: String,
    format: TabularFormat,
}

impl StagedUpload {
    /// Type, size and content checks, then write to `dir`.
    pub fn stage(
        dir: &Path,
        original_name: &str,
        content_type: Option<&str>,
        content: &[u8],
        max_bytes: usize,
    ) -> Result<Self, UploadError> {
        check_mime(content_type)?;
        let format = TabularFormat::from_file_name(original_name)?;
        if content.len() > max_bytes {
            return Err(UploadError::TooLarge { limit: max_bytes });
        }
        format.sniff(content)?;

        let mut file = tempfile::Builder::new()
            .prefix(&format!("{}-", Utc::now().timestamp_millis()))
            .suffix(format.extension())
            .tempfile_in(dir)?;
        file.write_all(content)?;
        file.flush()?;

        tracing::debug!(
            "Staged {} ({} bytes, {:?}) at {:?}",
            original_name,
            content.len(),
            format,
            file.path()
        );
        Ok(StagedUpload {
            file,
            original_name: original_name.to_string(),
            format,
        })
    }

    pub fn path(&self) -> &Path {
        self.file.path()
    }

    pub fn format(&self) -> TabularFormat {
        self.format
    }
}

impl Drop for StagedUpload {
    fn drop(&mut self) {
        tracing::debug!("Removing staged upload {:?}", self.file.path());
    }
}

/// Parse → normalize → round-robin → persist → report.
pub async fn distribute_upload(
    state: &AppState,
    upload: StagedUpload,
) -> Result<DistributionReport, UploadError> {
    let path = upload.path().to_path_buf();
    let format = upload.format();
    let rows = tokio::task::spawn_blocking(move || ingest::parse_file(&path, format)).await??;

    let drafts = ingest::normalize_rows(&rows);
    tracing::info!(
        "Parsed {}: {} rows, {} valid, {} dropped",
        upload.original_name,
        rows.len(),
        drafts.len(),
        rows.len() - drafts.len()
    );
    if drafts.is_empty() {
        return Err(UploadError::NoValidLeads);
    }

    let pool = state.active_agents();
    let pool_ids: Vec<Uuid> = pool.iter().map(|a| a.id).collect();
    let assigned: Vec<(LeadDraft, Uuid)> =
        distribute::round_robin(drafts, &pool_ids).ok_or(UploadError::NoActiveAgents)?;

    let batch = state.next_batch_id();
    let saved = state.insert_batch(&batch, assigned)?;
    drop(upload);

    let report = distribute::build_report(&batch, &saved, &pool, |id| state.agent(id));
    tracing::info!(
        "Batch {}: {} leads across {} of {} agents",
        batch,
        report.lead_total(),
        report.distribution.len(),
        pool.len()
    );
    Ok(report)
}
