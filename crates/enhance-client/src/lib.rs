//! Client for the remote media enhancement service
//!
//! Defines the `RemoteClient` trait that decouples job processing from the HTTP
//! protocol, plus the reqwest-backed implementation. One client is bound to one
//! API key; a `Connector` turns keys into clients so the credential pool never
//! needs to know about HTTP.
//!
//! Video protocol:
//! 1. `create_video_request` → request id
//! 2. `accept_video_request` → upload URL
//! 3. `upload_file` → eTag
//! 4. `complete_upload` → remote processing starts
//! 5. `check_status` until complete → download URL
//! 6. `download`
//!
//! Images are a single synchronous `create_image_request` call.

pub mod classify;
pub mod error;
pub mod http;
pub mod normalize;
pub mod request;
pub mod types;

pub use classify::{classify_status, is_credit_message};
pub use error::{Error, Result};
pub use http::{DEFAULT_REQUEST_TIMEOUT, HttpClient, HttpConnector};
pub use types::{
    CreditBalance, ImageOptions, OutputFormat, RemoteStatus, StatusReport, UploadPart,
    VideoOptions,
};

use common::{MediaInfo, Secret};
use std::future::Future;
use std::path::Path;
use std::pin::Pin;
use std::sync::Arc;

/// Boxed future used by the dyn-compatible traits below.
pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// Progress callback for downloads, called with 0-100.
pub type ProgressFn<'a> = &'a (dyn Fn(u8) + Send + Sync);

/// Operations against the enhancement service for a single API key.
///
/// Uses `Pin<Box<dyn Future>>` return types for dyn-compatibility
/// (`Arc<dyn RemoteClient>`).
pub trait RemoteClient: Send + Sync {
    /// Enhance an image in one call, returning the encoded result.
    fn create_image_request<'a>(
        &'a self,
        path: &'a Path,
        options: &'a ImageOptions,
    ) -> BoxFuture<'a, Result<Vec<u8>>>;

    /// Create a video request, returning its request id.
    fn create_video_request<'a>(
        &'a self,
        source: &'a MediaInfo,
        options: &'a VideoOptions,
    ) -> BoxFuture<'a, Result<String>>;

    /// Accept a created request, returning the normalized upload URL.
    fn accept_video_request<'a>(&'a self, request_id: &'a str) -> BoxFuture<'a, Result<String>>;

    /// Upload the source file, returning the eTag of the stored object.
    fn upload_file<'a>(&'a self, path: &'a Path, upload_url: &'a str)
    -> BoxFuture<'a, Result<String>>;

    /// Finish the upload and trigger remote processing.
    fn complete_upload<'a>(
        &'a self,
        request_id: &'a str,
        parts: &'a [UploadPart],
    ) -> BoxFuture<'a, Result<()>>;

    /// Poll remote processing status.
    fn check_status<'a>(&'a self, request_id: &'a str) -> BoxFuture<'a, Result<StatusReport>>;

    /// Download a result to `dest`, reporting percentage progress.
    fn download<'a>(
        &'a self,
        url: &'a str,
        dest: &'a Path,
        on_progress: ProgressFn<'a>,
    ) -> BoxFuture<'a, Result<()>>;

    /// Current credit balance of this key.
    fn credit_balance(&self) -> BoxFuture<'_, Result<CreditBalance>>;
}

/// Builds a client bound to one API key.
pub trait Connector: Send + Sync {
    fn connect(&self, api_key: &Secret<String>) -> Arc<dyn RemoteClient>;
}
