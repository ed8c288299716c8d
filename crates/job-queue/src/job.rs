//! Job and media file records

use std::path::{Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};

use common::MediaKind;
use enhance_client::OutputFormat;
use serde::Serialize;
use uuid::Uuid;

use crate::error::{Error, Result};

pub type JobId = Uuid;

/// Global processing state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ProcessingState {
    Stopped,
    Running,
    Paused,
}

impl ProcessingState {
    pub fn label(&self) -> &'static str {
        match self {
            ProcessingState::Stopped => "stopped",
            ProcessingState::Running => "running",
            ProcessingState::Paused => "paused",
        }
    }
}

impl std::fmt::Display for ProcessingState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.label())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum JobStatus {
    Pending,
    Queued,
    Processing,
    Paused,
    Completed,
    Error,
    Stopped,
}

impl JobStatus {
    /// Completed, error and stopped jobs are never picked up again.
    pub fn is_terminal(&self) -> bool {
        matches!(self, JobStatus::Completed | JobStatus::Error | JobStatus::Stopped)
    }

    /// Holds a worker slot.
    pub fn is_active(&self) -> bool {
        matches!(self, JobStatus::Processing | JobStatus::Paused)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum FileStatus {
    Pending,
    Processing,
    Completed,
    Error,
}

/// A media file discovered in the input folder.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MediaFile {
    pub name: String,
    pub path: PathBuf,
    pub size: u64,
    /// Lowercase, without the dot
    pub extension: String,
    pub kind: MediaKind,
    pub status: FileStatus,
}

impl MediaFile {
    /// Describe `path` if its extension is a supported media type.
    pub fn from_path(path: &Path, size: u64) -> Option<Self> {
        let kind = MediaKind::from_path(path)?;
        let name = path.file_name()?.to_string_lossy().into_owned();
        let extension = path.extension()?.to_string_lossy().to_ascii_lowercase();
        Some(Self {
            name,
            path: path.to_path_buf(),
            size,
            extension,
            kind,
            status: FileStatus::Pending,
        })
    }
}

/// One file's trip through remote enhancement.
///
/// Only the worker driving the job writes to it while it is active; operator
/// actions only relabel it (pause, resume, stop).
#[derive(Debug, Clone, Serialize)]
pub struct Job {
    pub id: JobId,
    pub file_name: String,
    pub file_path: PathBuf,
    pub kind: MediaKind,
    pub size: u64,
    pub status: JobStatus,
    /// 0-100, never decreases while processing
    pub progress: f64,
    pub phase: String,
    /// Unix millis
    pub started_at: Option<u64>,
    /// Masked key of the credential used by the latest attempt
    pub credential: Option<String>,
    pub retry_count: u32,
    pub credits_used: Option<f64>,
    pub error: Option<String>,
    pub request_id: Option<String>,
    pub output_path: Option<PathBuf>,
}

impl Job {
    pub fn queued(file: &MediaFile) -> Self {
        Self {
            id: Uuid::new_v4(),
            file_name: file.name.clone(),
            file_path: file.path.clone(),
            kind: file.kind,
            size: file.size,
            status: JobStatus::Queued,
            progress: 0.0,
            phase: "Queued".to_string(),
            started_at: None,
            credential: None,
            retry_count: 0,
            credits_used: None,
            error: None,
            request_id: None,
            output_path: None,
        }
    }
}

pub(crate) fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

fn stem(source: &Path) -> String {
    source
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_else(|| "output".to_string())
}

/// `<stem>_upscaled<.ext>` in `output_dir`.
pub fn video_output_path(output_dir: &Path, source: &Path) -> PathBuf {
    let ext = source
        .extension()
        .map(|e| format!(".{}", e.to_string_lossy()))
        .unwrap_or_default();
    output_dir.join(format!("{}_upscaled{ext}", stem(source)))
}

/// `<stem>_enhanced.<jpeg|png>` in `output_dir`.
pub fn image_output_path(output_dir: &Path, source: &Path, format: OutputFormat) -> PathBuf {
    output_dir.join(format!("{}_enhanced.{}", stem(source), format.extension()))
}

/// Supported media files directly inside `dir`, sorted by name.
pub async fn scan_dir(dir: &Path) -> Result<Vec<MediaFile>> {
    let mut entries = tokio::fs::read_dir(dir)
        .await
        .map_err(|e| Error::LocalIo(format!("reading {}: {e}", dir.display())))?;

    let mut files = Vec::new();
    while let Some(entry) = entries
        .next_entry()
        .await
        .map_err(|e| Error::LocalIo(format!("reading {}: {e}", dir.display())))?
    {
        let Ok(metadata) = entry.metadata().await else {
            continue;
        };
        if !metadata.is_file() {
            continue;
        }
        if let Some(file) = MediaFile::from_path(&entry.path(), metadata.len()) {
            files.push(file);
        }
    }
    files.sort_by(|a, b| a.name.cmp(&b.name));
    Ok(files)
}
