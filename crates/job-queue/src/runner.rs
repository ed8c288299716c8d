//! Per-job state machine
//!
//! Drives one job through its phase ladder with a fresh credential per
//! attempt. Attempts are capped at twice the pool size; credit exhaustion
//! refreshes balances and rotates quickly, rate limits back the key off,
//! anything else waits a little longer before rotating.
//!
//! Video: probe → create → accept → upload → complete → poll → download →
//! optional audio strip. Image: one synchronous enhance call, then save.

use std::ffi::OsString;
use std::path::{Path, PathBuf};
use std::time::Duration;

use common::MediaKind;
use credential_pool::{SelectedCredential, Selection};
use enhance_client::{RemoteStatus, UploadPart};
use tracing::{debug, info, warn};

use crate::error::{Error, FailureClass, Result};
use crate::job::{image_output_path, video_output_path};
use crate::scheduler::{JobHandle, Outcome};

pub const CREDIT_RETRY_DELAY: Duration = Duration::from_secs(1);
pub const RETRY_DELAY: Duration = Duration::from_secs(2);

/// Run the job to a terminal outcome.
pub(crate) async fn run(job: &JobHandle) -> Result<Outcome> {
    let (source, kind) = job.source().ok_or(Error::StoppedByUser)?;
    let output_dir = job
        .config()
        .output_dir
        .clone()
        .ok_or_else(|| Error::Validation("output folder not set".into()))?;

    let mut attempts: u32 = 0;
    loop {
        job.checkpoint().await?;
        let max_attempts = (job.pool().len().await as u32 * 2).max(1);

        let (credential, result) = match job.pool().next_eligible().await {
            Some(Selection::Wait {
                label,
                until: Some(until),
                ..
            }) => {
                debug!(credential = %label, "all API keys throttled, waiting");
                job.phase("Waiting for API key");
                job.sleep_until(until).await?;
                continue;
            }
            Some(Selection::Ready(credential)) => {
                attempts += 1;
                job.set_credential(&credential.label);
                debug!(credential = %credential.label, attempt = attempts, max_attempts, "attempt started");
                let result = attempt(job, &credential, &source, kind, &output_dir).await;
                (Some(credential), result)
            }
            Some(Selection::Wait { until: None, .. }) => {
                attempts += 1;
                let err = Error::NoCredentials("all API keys are inactive or out of credits".into());
                (None, Err(err))
            }
            None => {
                attempts += 1;
                (None, Err(Error::NoCredentials("credential pool is empty".into())))
            }
        };

        let err = match result {
            Ok(output_path) => {
                let credits_used = match &credential {
                    Some(credential) => credits_used(job, credential).await,
                    None => None,
                };
                return Ok(Outcome {
                    output_path,
                    credits_used,
                });
            }
            Err(Error::StoppedByUser) => return Err(Error::StoppedByUser),
            Err(e) => e,
        };

        job.record_retry();
        let class = err.class();
        metrics::counter!("enhance_job_attempt_failures_total", "class" => class.label())
            .increment(1);
        warn!(
            attempt = attempts,
            max_attempts,
            class = class.label(),
            credential = credential.as_ref().map(|c| c.label.as_str()),
            error = %err,
            "attempt failed"
        );
        if attempts >= max_attempts {
            return Err(err);
        }

        match class {
            FailureClass::Credit => {
                job.phase(&format!("Switching API key ({attempts}/{max_attempts})"));
                job.pool().refresh_all_credits().await;
                job.sleep(CREDIT_RETRY_DELAY).await?;
            }
            FailureClass::RateLimited(retry_after) => {
                job.phase(&format!("Switching API key ({attempts}/{max_attempts})"));
                if let Some(credential) = &credential {
                    job.pool().mark_rate_limited(credential.id, retry_after).await;
                }
                job.sleep(CREDIT_RETRY_DELAY).await?;
            }
            FailureClass::Generic => {
                job.phase(&format!("Retrying ({attempts}/{max_attempts})"));
                job.sleep(RETRY_DELAY).await?;
            }
        }
    }
}

async fn attempt(
    job: &JobHandle,
    credential: &SelectedCredential,
    source: &Path,
    kind: MediaKind,
    output_dir: &Path,
) -> Result<PathBuf> {
    match kind {
        MediaKind::Video => enhance_video(job, credential, source, output_dir).await,
        MediaKind::Image => enhance_image(job, credential, source, output_dir).await,
    }
}

/// Credits spent by the job on `credential`, from the balance before and
/// after. Best effort.
async fn credits_used(job: &JobHandle, credential: &SelectedCredential) -> Option<f64> {
    let before = credential.credits_available;
    let after = job
        .pool()
        .refresh_credits(credential.id)
        .await
        .map(|balance| balance.available);
    before.zip(after).map(|(b, a)| (b - a).max(0.0))
}

fn local_io(context: &str, path: &Path, e: impl std::fmt::Display) -> Error {
    Error::LocalIo(format!("{context} {}: {e}", path.display()))
}

async fn enhance_video(
    job: &JobHandle,
    credential: &SelectedCredential,
    source: &Path,
    output_dir: &Path,
) -> Result<PathBuf> {
    let client = credential.client.as_ref();
    let options = &job.config().video;

    job.progress(5.0, "Analyzing video");
    let info = job
        .media()
        .probe(source)
        .await
        .map_err(|e| local_io("probing", source, e))?;
    job.checkpoint().await?;

    job.progress(10.0, "Creating request");
    let request_id = client.create_video_request(&info, options).await?;
    job.set_request_id(&request_id);
    debug!(request_id = %request_id, "remote request created");
    job.checkpoint().await?;

    job.progress(15.0, "Getting upload URL");
    let upload_url = client.accept_video_request(&request_id).await?;
    job.checkpoint().await?;

    job.progress(20.0, "Uploading video");
    let e_tag = client.upload_file(source, &upload_url).await?;
    job.checkpoint().await?;

    job.progress(30.0, "Starting processing");
    client
        .complete_upload(&request_id, &[UploadPart { part_num: 1, e_tag }])
        .await?;
    job.checkpoint().await?;

    let download_url = poll_until_complete(job, credential, &request_id).await?;
    job.checkpoint().await?;

    job.progress(85.0, "Downloading result");
    tokio::fs::create_dir_all(output_dir)
        .await
        .map_err(|e| local_io("creating", output_dir, e))?;
    let output = video_output_path(output_dir, source);
    let on_download = |percent: u8| {
        job.progress(85.0 + f64::from(percent) * 0.1, "Downloading result");
    };
    client.download(&download_url, &output, &on_download).await?;

    if options.remove_audio {
        job.checkpoint().await?;
        job.progress(95.0, "Removing audio");
        if let Err(e) = remove_audio(job, &output).await {
            warn!(output = %output.display(), error = %e, "audio removal failed, keeping original audio");
        }
    }

    info!(request_id = %request_id, output = %output.display(), "video enhanced");
    Ok(output)
}

/// Poll until the remote job completes with a download URL.
async fn poll_until_complete(
    job: &JobHandle,
    credential: &SelectedCredential,
    request_id: &str,
) -> Result<String> {
    let max_checks = job.config().max_status_checks;
    let interval = job.config().poll_interval;

    for check in 1..=max_checks {
        job.sleep(interval).await?;
        job.checkpoint().await?;

        let report = credential.client.check_status(request_id).await?;
        let label = format!("{} (check {check}/{max_checks})", capitalize(report.status.label()));
        match report.status {
            RemoteStatus::Complete => match report.download_url {
                Some(url) => {
                    job.progress(80.0, "Processing complete");
                    return Ok(url);
                }
                // Some responses report completion before the URL is ready
                None => job.phase(&label),
            },
            RemoteStatus::Failed => {
                return Err(Error::RemoteProcessingFailed(
                    report.message.unwrap_or_else(|| "Unknown error".into()),
                ));
            }
            _ => {
                let remote = report.progress.unwrap_or(0.0);
                job.progress((30.0 + remote * 0.45).min(75.0), &label);
            }
        }
    }

    Err(Error::ProcessingTimeout {
        checks: max_checks,
        waited_secs: interval.as_secs() * u64::from(max_checks),
    })
}

fn capitalize(word: &str) -> String {
    let mut chars = word.chars();
    match chars.next() {
        Some(first) => first.to_uppercase().chain(chars).collect(),
        None => String::new(),
    }
}

/// Re-encode `output` without audio, keeping the original on failure.
async fn remove_audio(job: &JobHandle, output: &Path) -> Result<()> {
    let mut temp = OsString::from(output.as_os_str());
    temp.push(".temp");
    let temp = PathBuf::from(temp);

    tokio::fs::rename(output, &temp)
        .await
        .map_err(|e| local_io("renaming", output, e))?;

    let on_strip = |percent: u8| {
        job.progress(95.0 + f64::from(percent) * 0.05, "Removing audio");
    };
    match job.media().strip_audio(&temp, output, &on_strip).await {
        Ok(()) => {
            if let Err(e) = tokio::fs::remove_file(&temp).await {
                debug!(path = %temp.display(), error = %e, "could not remove temp file");
            }
            Ok(())
        }
        Err(e) => {
            let _ = tokio::fs::remove_file(output).await;
            tokio::fs::rename(&temp, output)
                .await
                .map_err(|e| local_io("restoring", output, e))?;
            Err(Error::LocalIo(e.to_string()))
        }
    }
}

async fn enhance_image(
    job: &JobHandle,
    credential: &SelectedCredential,
    source: &Path,
    output_dir: &Path,
) -> Result<PathBuf> {
    let options = &job.config().image;

    job.progress(10.0, "Preparing image");
    job.checkpoint().await?;

    job.progress(30.0, "Enhancing image");
    let bytes = credential
        .client
        .create_image_request(source, options)
        .await?;
    job.checkpoint().await?;

    job.progress(80.0, "Saving result");
    tokio::fs::create_dir_all(output_dir)
        .await
        .map_err(|e| local_io("creating", output_dir, e))?;
    let output = image_output_path(output_dir, source, options.output_format);
    tokio::fs::write(&output, &bytes)
        .await
        .map_err(|e| local_io("writing", &output, e))?;

    info!(output = %output.display(), bytes = bytes.len(), "image enhanced");
    Ok(output)
}
