//! Request options and normalized response types

use serde::{Deserialize, Serialize};

/// Video enhancement settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct VideoOptions {
    /// Upscale model id (e.g. "prob-4", "ahq-12")
    pub model: String,
    /// Target resolution as "WIDTHxHEIGHT"; swapped to follow input orientation
    pub resolution: String,
    /// Strip audio locally after download
    pub remove_audio: bool,
    /// Frame interpolation model id, None to disable
    pub frame_interpolation: Option<String>,
    pub slow_motion: u32,
    pub crop_to_fit: bool,
}

impl Default for VideoOptions {
    fn default() -> Self {
        Self {
            model: "prob-4".into(),
            resolution: "1920x1080".into(),
            remove_audio: false,
            frame_interpolation: Some("chf-3".into()),
            slow_motion: 1,
            crop_to_fit: false,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OutputFormat {
    #[default]
    Jpeg,
    Png,
}

impl OutputFormat {
    pub fn extension(&self) -> &'static str {
        match self {
            OutputFormat::Jpeg => "jpeg",
            OutputFormat::Png => "png",
        }
    }

    pub fn mime(&self) -> &'static str {
        match self {
            OutputFormat::Jpeg => "image/jpeg",
            OutputFormat::Png => "image/png",
        }
    }
}

/// Image enhancement settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ImageOptions {
    pub model: String,
    pub output_format: OutputFormat,
    pub output_width: u32,
}

impl Default for ImageOptions {
    fn default() -> Self {
        Self {
            model: "Standard V2".into(),
            output_format: OutputFormat::Jpeg,
            output_width: 3840,
        }
    }
}

/// One uploaded part, echoed back when completing the upload.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UploadPart {
    pub part_num: u32,
    pub e_tag: String,
}

/// Remote processing status as reported by the status endpoint.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RemoteStatus {
    Queued,
    Initializing,
    Preprocessing,
    Processing,
    Postprocessing,
    /// "complete" or "completed"
    Complete,
    /// "failed" or "error"
    Failed,
    Unknown(String),
}

impl RemoteStatus {
    pub fn parse(raw: &str) -> Self {
        match raw.trim().to_ascii_lowercase().as_str() {
            "queued" => RemoteStatus::Queued,
            "initializing" => RemoteStatus::Initializing,
            "preprocessing" => RemoteStatus::Preprocessing,
            "processing" => RemoteStatus::Processing,
            "postprocessing" => RemoteStatus::Postprocessing,
            "complete" | "completed" => RemoteStatus::Complete,
            "failed" | "error" => RemoteStatus::Failed,
            other => RemoteStatus::Unknown(other.to_string()),
        }
    }

    pub fn label(&self) -> &str {
        match self {
            RemoteStatus::Queued => "queued",
            RemoteStatus::Initializing => "initializing",
            RemoteStatus::Preprocessing => "preprocessing",
            RemoteStatus::Processing => "processing",
            RemoteStatus::Postprocessing => "postprocessing",
            RemoteStatus::Complete => "complete",
            RemoteStatus::Failed => "failed",
            RemoteStatus::Unknown(raw) => raw,
        }
    }
}

/// Status check result with the download URL already located.
#[derive(Debug, Clone, PartialEq)]
pub struct StatusReport {
    pub status: RemoteStatus,
    /// Server-reported sub-progress, 0-100
    pub progress: Option<f64>,
    pub download_url: Option<String>,
    pub message: Option<String>,
}

/// Credit balance of one API key.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct CreditBalance {
    pub available: f64,
    pub reserved: f64,
    pub total: f64,
}
