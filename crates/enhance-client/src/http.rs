//! reqwest-backed `RemoteClient`
//!
//! Every call against the service API carries the key in `X-API-Key` and is
//! bounded by the request timeout. Upload and download go to pre-signed
//! storage URLs, carry no key, and only have a connect timeout: a large video
//! transfer may legitimately take longer than any API call.

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use common::{MediaInfo, Secret};
use futures_util::StreamExt;
use reqwest::header::{ACCEPT, CONTENT_TYPE, ETAG, RETRY_AFTER};
use serde_json::{Value, json};
use tokio::io::AsyncWriteExt;
use tracing::debug;

use crate::classify::{classify_status, parse_retry_after};
use crate::error::{Error, Result};
use crate::normalize;
use crate::request::video_request_body;
use crate::types::{CreditBalance, ImageOptions, StatusReport, UploadPart, VideoOptions};
use crate::{BoxFuture, Connector, ProgressFn, RemoteClient};

pub const DEFAULT_BASE_URL: &str = "https://api.topazlabs.com";

const API_KEY_HEADER: &str = "X-API-Key";

/// Total time allowed for one API call unless configured otherwise.
pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(300);

/// Client bound to a single API key.
pub struct HttpClient {
    http: reqwest::Client,
    base_url: String,
    api_key: Secret<String>,
    request_timeout: Duration,
}

impl HttpClient {
    pub fn new(http: reqwest::Client, base_url: &str, api_key: Secret<String>) -> Self {
        Self {
            http,
            base_url: base_url.trim_end_matches('/').to_string(),
            api_key,
            request_timeout: DEFAULT_REQUEST_TIMEOUT,
        }
    }

    /// Bound every API call (not storage transfers) by `timeout`.
    pub fn with_request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = timeout;
        self
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    fn authed(&self, builder: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        builder
            .timeout(self.request_timeout)
            .header(API_KEY_HEADER, self.api_key.expose().as_str())
            .header(ACCEPT, "application/json")
    }
}

fn network(context: &str, err: reqwest::Error) -> Error {
    Error::Network(format!("{context}: {err}"))
}

/// Turn a non-success response into a classified error.
async fn fail(response: reqwest::Response) -> Error {
    let status = response.status().as_u16();
    let retry_after = response
        .headers()
        .get(RETRY_AFTER)
        .and_then(|v| v.to_str().ok())
        .and_then(parse_retry_after);
    let body = response
        .text()
        .await
        .unwrap_or_else(|_| String::from("<no body>"));
    classify_status(status, &body, retry_after)
}

/// Read a JSON body, classifying non-success statuses.
async fn read_json(response: reqwest::Response, context: &str) -> Result<Value> {
    if !response.status().is_success() {
        return Err(fail(response).await);
    }
    let text = response.text().await.map_err(|e| network(context, e))?;
    if text.trim().is_empty() {
        return Ok(Value::Null);
    }
    serde_json::from_str(&text).map_err(|e| Error::Protocol(format!("{context}: invalid JSON: {e}")))
}

fn file_name(path: &Path) -> String {
    path.file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| "upload".to_string())
}

impl RemoteClient for HttpClient {
    fn create_image_request<'a>(
        &'a self,
        path: &'a Path,
        options: &'a ImageOptions,
    ) -> BoxFuture<'a, Result<Vec<u8>>> {
        Box::pin(async move {
            let bytes = tokio::fs::read(path)
                .await
                .map_err(|e| Error::Io(format!("reading {}: {e}", path.display())))?;
            let source_mime = match path
                .extension()
                .and_then(|e| e.to_str())
                .map(str::to_ascii_lowercase)
                .as_deref()
            {
                Some("png") => "image/png",
                _ => "image/jpeg",
            };
            let image = reqwest::multipart::Part::bytes(bytes)
                .file_name(file_name(path))
                .mime_str(source_mime)
                .map_err(|e| Error::InvalidRequest(format!("image part: {e}")))?;
            let form = reqwest::multipart::Form::new()
                .text("model", options.model.clone())
                .text("output_width", options.output_width.to_string())
                .text("crop_to_fill", "false")
                .text("output_format", options.output_format.extension())
                .part("image", image);

            let response = self
                .http
                .post(self.url("/image/v1/enhance"))
                .timeout(self.request_timeout)
                .header(API_KEY_HEADER, self.api_key.expose().as_str())
                .header(ACCEPT, options.output_format.mime())
                .multipart(form)
                .send()
                .await
                .map_err(|e| network("image enhance request failed", e))?;
            if !response.status().is_success() {
                return Err(fail(response).await);
            }
            let body = response
                .bytes()
                .await
                .map_err(|e| network("reading enhanced image", e))?;
            if body.is_empty() {
                return Err(Error::Protocol("image enhance returned an empty body".into()));
            }
            Ok(body.to_vec())
        })
    }

    fn create_video_request<'a>(
        &'a self,
        source: &'a MediaInfo,
        options: &'a VideoOptions,
    ) -> BoxFuture<'a, Result<String>> {
        Box::pin(async move {
            let body = video_request_body(source, options)?;
            let response = self
                .authed(self.http.post(self.url("/video/")))
                .json(&body)
                .send()
                .await
                .map_err(|e| network("create video request failed", e))?;
            let value = read_json(response, "create video request").await?;
            let request_id = value
                .get("requestId")
                .and_then(Value::as_str)
                .filter(|s| !s.is_empty())
                .ok_or_else(|| Error::Protocol("create response missing requestId".into()))?;
            debug!(request_id, "video request created");
            Ok(request_id.to_string())
        })
    }

    fn accept_video_request<'a>(&'a self, request_id: &'a str) -> BoxFuture<'a, Result<String>> {
        Box::pin(async move {
            let response = self
                .authed(
                    self.http
                        .patch(self.url(&format!("/video/{request_id}/accept"))),
                )
                .send()
                .await
                .map_err(|e| network("accept request failed", e))?;
            let value = read_json(response, "accept request").await?;
            normalize::upload_url(&value)
                .ok_or_else(|| Error::Protocol("accept response carried no upload URL".into()))
        })
    }

    fn upload_file<'a>(
        &'a self,
        path: &'a Path,
        upload_url: &'a str,
    ) -> BoxFuture<'a, Result<String>> {
        Box::pin(async move {
            let bytes = tokio::fs::read(path)
                .await
                .map_err(|e| Error::Io(format!("reading {}: {e}", path.display())))?;
            let size = bytes.len();
            let response = self
                .http
                .put(upload_url)
                .header(CONTENT_TYPE, "video/mp4")
                .body(bytes)
                .send()
                .await
                .map_err(|e| network("upload failed", e))?;
            if !response.status().is_success() {
                return Err(fail(response).await);
            }
            let etag = response
                .headers()
                .get(ETAG)
                .and_then(|v| v.to_str().ok())
                .map(|v| v.trim_matches('"').to_string())
                .filter(|v| !v.is_empty())
                .ok_or_else(|| Error::Protocol("upload response missing ETag".into()))?;
            debug!(size, "upload finished");
            Ok(etag)
        })
    }

    fn complete_upload<'a>(
        &'a self,
        request_id: &'a str,
        parts: &'a [UploadPart],
    ) -> BoxFuture<'a, Result<()>> {
        Box::pin(async move {
            let response = self
                .authed(
                    self.http
                        .patch(self.url(&format!("/video/{request_id}/complete-upload"))),
                )
                .json(&json!({ "uploadResults": parts }))
                .send()
                .await
                .map_err(|e| network("complete upload failed", e))?;
            read_json(response, "complete upload").await?;
            Ok(())
        })
    }

    fn check_status<'a>(&'a self, request_id: &'a str) -> BoxFuture<'a, Result<StatusReport>> {
        Box::pin(async move {
            let response = self
                .authed(self.http.get(self.url(&format!("/video/{request_id}/status"))))
                .send()
                .await
                .map_err(|e| network("status check failed", e))?;
            let value = read_json(response, "status check").await?;
            Ok(normalize::status_report(&value))
        })
    }

    fn download<'a>(
        &'a self,
        url: &'a str,
        dest: &'a Path,
        on_progress: ProgressFn<'a>,
    ) -> BoxFuture<'a, Result<()>> {
        Box::pin(async move {
            let response = self
                .http
                .get(url)
                .send()
                .await
                .map_err(|e| network("download request failed", e))?;
            if !response.status().is_success() {
                return Err(fail(response).await);
            }
            let total = response.content_length().filter(|n| *n > 0);
            let mut file = tokio::fs::File::create(dest)
                .await
                .map_err(|e| Error::Io(format!("creating {}: {e}", dest.display())))?;

            let mut stream = response.bytes_stream();
            let mut written: u64 = 0;
            let mut last_percent: Option<u8> = None;
            while let Some(chunk) = stream.next().await {
                let chunk = chunk.map_err(|e| network("download interrupted", e))?;
                file.write_all(&chunk)
                    .await
                    .map_err(|e| Error::Io(format!("writing {}: {e}", dest.display())))?;
                written += chunk.len() as u64;
                if let Some(total) = total {
                    let percent = ((written.min(total) * 100) / total) as u8;
                    if last_percent != Some(percent) {
                        last_percent = Some(percent);
                        on_progress(percent);
                    }
                }
            }
            file.flush()
                .await
                .map_err(|e| Error::Io(format!("flushing {}: {e}", dest.display())))?;
            if last_percent != Some(100) {
                on_progress(100);
            }
            debug!(bytes = written, path = %dest.display(), "download finished");
            Ok(())
        })
    }

    fn credit_balance(&self) -> BoxFuture<'_, Result<CreditBalance>> {
        Box::pin(async move {
            let response = self
                .authed(self.http.get(self.url("/account/v1/credits/balance")))
                .send()
                .await
                .map_err(|e| network("credit balance request failed", e))?;
            let value = read_json(response, "credit balance").await?;
            Ok(normalize::credit_balance(&value))
        })
    }
}

/// Creates `HttpClient`s sharing one connection pool.
#[derive(Clone)]
pub struct HttpConnector {
    http: reqwest::Client,
    base_url: String,
    request_timeout: Duration,
}

impl HttpConnector {
    /// `timeout` bounds each API call and each connection attempt. Storage
    /// transfers run without a total deadline.
    pub fn new(base_url: &str, timeout: Duration) -> Result<Self> {
        let http = reqwest::Client::builder()
            .connect_timeout(timeout)
            .build()
            .map_err(|e| Error::Network(format!("building HTTP client: {e}")))?;
        Ok(Self {
            http,
            base_url: base_url.to_string(),
            request_timeout: timeout,
        })
    }
}

impl Connector for HttpConnector {
    fn connect(&self, api_key: &Secret<String>) -> Arc<dyn RemoteClient> {
        Arc::new(
            HttpClient::new(self.http.clone(), &self.base_url, api_key.clone())
                .with_request_timeout(self.request_timeout),
        )
    }
}
