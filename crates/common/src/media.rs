//! Media descriptors shared between the inspection tools, the remote client
//! and the job queue.

use serde::{Deserialize, Serialize};
use std::path::Path;

/// Kind of media a job processes. Selects the phase ladder.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MediaKind {
    Video,
    Image,
}

impl MediaKind {
    /// Classify a file by extension (case-insensitive).
    ///
    /// `.mp4`/`.mov` are video, `.jpg`/`.jpeg`/`.png` are image, anything else
    /// is not media this service handles.
    pub fn from_path(path: &Path) -> Option<Self> {
        let ext = path.extension()?.to_str()?.to_ascii_lowercase();
        match ext.as_str() {
            "mp4" | "mov" => Some(MediaKind::Video),
            "jpg" | "jpeg" | "png" => Some(MediaKind::Image),
            _ => None,
        }
    }

    pub fn label(&self) -> &'static str {
        match self {
            MediaKind::Video => "video",
            MediaKind::Image => "image",
        }
    }
}

/// Source video metadata sent with a remote creation request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MediaInfo {
    pub width: u32,
    pub height: u32,
    /// Whole seconds
    pub duration: u64,
    pub frame_rate: u32,
    pub frame_count: u64,
    pub container: String,
    pub size: u64,
}

impl MediaInfo {
    /// Values used when the file cannot be inspected: 1080p, 10s at 30fps.
    pub fn fallback(size: u64, container: impl Into<String>) -> Self {
        Self {
            width: 1920,
            height: 1080,
            duration: 10,
            frame_rate: 30,
            frame_count: 300,
            container: container.into(),
            size,
        }
    }

    pub fn is_portrait(&self) -> bool {
        self.height > self.width
    }
}
