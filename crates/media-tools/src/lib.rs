//! Local media capabilities used around remote enhancement
//!
//! Two operations, both behind the `MediaTools` trait so job processing can be
//! tested without ffmpeg installed:
//! - `probe`: metadata for the creation request, falling back to fixed
//!   defaults when the file cannot be inspected
//! - `strip_audio`: copy the video stream without audio, reporting progress

pub mod error;
pub mod ffmpeg;

pub use error::{Error, Result};
pub use ffmpeg::Ffmpeg;

use common::MediaInfo;
use std::future::Future;
use std::path::Path;
use std::pin::Pin;

/// Boxed future used by the dyn-compatible trait below.
pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

pub trait MediaTools: Send + Sync {
    /// Inspect a media file. Only fails when the file itself is unreadable;
    /// inspection failures yield `MediaInfo::fallback` with the real size.
    fn probe<'a>(&'a self, path: &'a Path) -> BoxFuture<'a, Result<MediaInfo>>;

    /// Write `input` to `output` without audio. `on_progress` receives 0-100.
    fn strip_audio<'a>(
        &'a self,
        input: &'a Path,
        output: &'a Path,
        on_progress: &'a (dyn Fn(u8) + Send + Sync),
    ) -> BoxFuture<'a, Result<()>>;
}
