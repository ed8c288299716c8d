//! ffprobe / ffmpeg backed `MediaTools`

use std::path::Path;
use std::process::Stdio;

use common::MediaInfo;
use serde::Deserialize;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::Command;
use tracing::{debug, warn};

use crate::error::{Error, Result};
use crate::{BoxFuture, MediaTools};

/// Stderr lines kept for the error message of a failed command.
const STDERR_TAIL: usize = 5;

#[derive(Debug, Deserialize)]
struct ProbeOutput {
    format: ProbeFormat,
    #[serde(default)]
    streams: Vec<ProbeStream>,
}

#[derive(Debug, Deserialize)]
struct ProbeFormat {
    duration: Option<String>,
    format_name: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ProbeStream {
    codec_type: String,
    width: Option<u32>,
    height: Option<u32>,
    r_frame_rate: Option<String>,
}

/// Runs the system (or configured) ffmpeg and ffprobe binaries.
#[derive(Debug, Clone)]
pub struct Ffmpeg {
    ffmpeg: String,
    ffprobe: String,
}

impl Default for Ffmpeg {
    fn default() -> Self {
        Self::new("ffmpeg", "ffprobe")
    }
}

impl Ffmpeg {
    pub fn new(ffmpeg: impl Into<String>, ffprobe: impl Into<String>) -> Self {
        Self {
            ffmpeg: ffmpeg.into(),
            ffprobe: ffprobe.into(),
        }
    }

    async fn run_ffprobe(&self, path: &Path) -> Result<Vec<u8>> {
        let output = Command::new(&self.ffprobe)
            .kill_on_drop(true)
            .args(["-v", "quiet", "-print_format", "json", "-show_format", "-show_streams"])
            .arg(path)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .output()
            .await
            .map_err(|e| Error::ProbeFailed(format!("running {}: {e}", self.ffprobe)))?;

        if !output.status.success() {
            return Err(Error::CommandFailed {
                program: self.ffprobe.clone(),
                code: output.status.code(),
                message: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            });
        }
        Ok(output.stdout)
    }

    async fn duration_secs(&self, path: &Path) -> Option<f64> {
        let stdout = self.run_ffprobe(path).await.ok()?;
        let probe: ProbeOutput = serde_json::from_slice(&stdout).ok()?;
        probe.format.duration.as_deref()?.parse().ok()
    }
}

/// Container label from a file extension ("mp4", "mov").
fn container_of(path: &Path) -> String {
    path.extension()
        .and_then(|e| e.to_str())
        .map(str::to_ascii_lowercase)
        .unwrap_or_else(|| "mp4".to_string())
}

/// Frame rate from "30000/1001" or "30", rounded to whole frames.
fn parse_frame_rate(raw: &str) -> Option<u32> {
    let fps = match raw.split_once('/') {
        Some((num, den)) => {
            let num: f64 = num.trim().parse().ok()?;
            let den: f64 = den.trim().parse().ok()?;
            if den <= 0.0 {
                return None;
            }
            num / den
        }
        None => raw.trim().parse().ok()?,
    };
    let rounded = fps.round();
    (rounded >= 1.0).then_some(rounded as u32)
}

/// Merge ffprobe JSON over the fallback values.
fn media_info_from_probe(stdout: &[u8], size: u64, container: &str) -> Result<MediaInfo> {
    let probe: ProbeOutput = serde_json::from_slice(stdout)
        .map_err(|e| Error::ProbeFailed(format!("parsing ffprobe output: {e}")))?;
    let video = probe
        .streams
        .iter()
        .find(|s| s.codec_type == "video")
        .ok_or_else(|| Error::ProbeFailed("no video stream found".into()))?;

    let fallback = MediaInfo::fallback(size, container);
    let duration = probe
        .format
        .duration
        .as_deref()
        .and_then(|d| d.parse::<f64>().ok())
        .filter(|d| *d > 0.0)
        .unwrap_or(fallback.duration as f64);
    let frame_rate = video
        .r_frame_rate
        .as_deref()
        .and_then(parse_frame_rate)
        .unwrap_or(fallback.frame_rate);
    let container = probe
        .format
        .format_name
        .as_deref()
        .map(|names| probed_container(names, container))
        .unwrap_or(fallback.container.clone());

    Ok(MediaInfo {
        width: video.width.unwrap_or(fallback.width),
        height: video.height.unwrap_or(fallback.height),
        duration: duration.round() as u64,
        frame_rate,
        frame_count: (duration * frame_rate as f64).round() as u64,
        container,
        size,
    })
}

/// Container name for the creation request. ffprobe reports demuxer families
/// such as `mov,mp4,m4a,3gp,3g2,mj2`; the file's own extension wins when it is
/// one of them.
fn probed_container(format_names: &str, extension: &str) -> String {
    let mut names = format_names.split(',').map(str::trim).filter(|n| !n.is_empty());
    if names.clone().any(|n| n.eq_ignore_ascii_case(extension)) {
        return extension.to_string();
    }
    names.next().unwrap_or(extension).to_string()
}

/// Seconds of output written, from an `-progress` key=value line.
fn progress_seconds(line: &str) -> Option<f64> {
    let (key, value) = line.trim().split_once('=')?;
    match key {
        // ffmpeg reports both in microseconds
        "out_time_us" | "out_time_ms" => value.parse::<i64>().ok().map(|us| us.max(0) as f64 / 1e6),
        _ => None,
    }
}

/// Percentage for `seconds` of output. Without a known duration, a rough
/// estimate capped at 90 is used.
fn progress_percent(seconds: f64, duration: Option<f64>) -> u8 {
    match duration.filter(|d| *d > 0.0) {
        Some(total) => ((seconds / total) * 100.0).clamp(0.0, 99.0) as u8,
        None => (seconds * 2.0).clamp(0.0, 90.0) as u8,
    }
}

impl MediaTools for Ffmpeg {
    fn probe<'a>(&'a self, path: &'a Path) -> BoxFuture<'a, Result<MediaInfo>> {
        Box::pin(async move {
            let metadata = tokio::fs::metadata(path)
                .await
                .map_err(|e| Error::Io(format!("reading {}: {e}", path.display())))?;
            let container = container_of(path);

            let probed = match self.run_ffprobe(path).await {
                Ok(stdout) => media_info_from_probe(&stdout, metadata.len(), &container),
                Err(e) => Err(e),
            };
            match probed {
                Ok(info) => {
                    debug!(path = %path.display(), width = info.width, height = info.height, "probed media");
                    Ok(info)
                }
                Err(e) => {
                    warn!(path = %path.display(), error = %e, "probe failed, using default media info");
                    Ok(MediaInfo::fallback(metadata.len(), container))
                }
            }
        })
    }

    fn strip_audio<'a>(
        &'a self,
        input: &'a Path,
        output: &'a Path,
        on_progress: &'a (dyn Fn(u8) + Send + Sync),
    ) -> BoxFuture<'a, Result<()>> {
        Box::pin(async move {
            let duration = self.duration_secs(input).await;

            let mut child = Command::new(&self.ffmpeg)
                .kill_on_drop(true)
                .args(["-nostats", "-progress", "pipe:2", "-i"])
                .arg(input)
                .args(["-c:v", "copy", "-an", "-y"])
                .arg(output)
                .stdin(Stdio::null())
                .stdout(Stdio::null())
                .stderr(Stdio::piped())
                .spawn()
                .map_err(|e| Error::Io(format!("running {}: {e}", self.ffmpeg)))?;

            let mut tail: Vec<String> = Vec::new();
            if let Some(stderr) = child.stderr.take() {
                let mut lines = BufReader::new(stderr).lines();
                while let Ok(Some(line)) = lines.next_line().await {
                    if let Some(seconds) = progress_seconds(&line) {
                        on_progress(progress_percent(seconds, duration));
                    } else if !line.contains('=') {
                        if tail.len() == STDERR_TAIL {
                            tail.remove(0);
                        }
                        tail.push(line);
                    }
                }
            }

            let status = child
                .wait()
                .await
                .map_err(|e| Error::Io(format!("waiting for {}: {e}", self.ffmpeg)))?;
            if !status.success() {
                return Err(Error::CommandFailed {
                    program: self.ffmpeg.clone(),
                    code: status.code(),
                    message: tail.join("\n"),
                });
            }
            on_progress(100);
            debug!(input = %input.display(), output = %output.display(), "audio stripped");
            Ok(())
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const PROBE_JSON: &str = r#"{
        "streams": [
            {"codec_type": "audio"},
            {"codec_type": "video", "width": 1080, "height": 1920, "r_frame_rate": "30000/1001"}
        ],
        "format": {"duration": "12.6", "format_name": "mov,mp4,m4a,3gp,3g2,mj2"}
    }"#;

    #[test]
    fn frame_rate_parsing() {
        assert_eq!(parse_frame_rate("30/1"), Some(30));
        assert_eq!(parse_frame_rate("30000/1001"), Some(30));
        assert_eq!(parse_frame_rate("24"), Some(24));
        assert_eq!(parse_frame_rate("0/0"), None);
        assert_eq!(parse_frame_rate("abc"), None);
    }

    #[test]
    fn probe_output_merged_over_defaults() {
        let info = media_info_from_probe(PROBE_JSON.as_bytes(), 4096, "mov").unwrap();
        assert_eq!(info.width, 1080);
        assert_eq!(info.height, 1920);
        assert_eq!(info.duration, 13);
        assert_eq!(info.frame_rate, 30);
        assert_eq!(info.frame_count, 378);
        assert_eq!(info.container, "mov");
        assert_eq!(info.size, 4096);
    }

    #[test]
    fn mp4_source_keeps_its_container() {
        let info = media_info_from_probe(PROBE_JSON.as_bytes(), 1000, "mp4").unwrap();
        assert_eq!(info.container, "mp4");
    }

    #[test]
    fn container_from_demuxer_family() {
        assert_eq!(probed_container("mov,mp4,m4a,3gp,3g2,mj2", "mp4"), "mp4");
        assert_eq!(probed_container("mov,mp4,m4a,3gp,3g2,mj2", "mov"), "mov");
        assert_eq!(probed_container("matroska,webm", "mp4"), "matroska");
        assert_eq!(probed_container("", "mp4"), "mp4");
    }

    #[test]
    fn probe_without_video_stream_fails() {
        let json = r#"{"streams":[{"codec_type":"audio"}],"format":{}}"#;
        assert!(matches!(
            media_info_from_probe(json.as_bytes(), 1, "mp4"),
            Err(Error::ProbeFailed(_))
        ));
    }

    #[test]
    fn progress_lines() {
        assert_eq!(progress_seconds("out_time_us=2500000"), Some(2.5));
        assert_eq!(progress_seconds("out_time_ms=1000000"), Some(1.0));
        assert_eq!(progress_seconds("frame=10"), None);
        assert_eq!(progress_seconds("garbage"), None);

        assert_eq!(progress_percent(5.0, Some(10.0)), 50);
        assert_eq!(progress_percent(20.0, Some(10.0)), 99);
        assert_eq!(progress_percent(10.0, None), 20);
        assert_eq!(progress_percent(100.0, None), 90);
    }

    #[tokio::test]
    async fn probe_falls_back_without_ffprobe() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("clip.MOV");
        std::fs::write(&path, vec![0u8; 2048]).unwrap();

        let tools = Ffmpeg::new("/nonexistent/ffmpeg", "/nonexistent/ffprobe");
        let info = tools.probe(&path).await.unwrap();
        assert_eq!(info, MediaInfo::fallback(2048, "mov"));
    }

    #[tokio::test]
    async fn probe_missing_file_is_io_error() {
        let tools = Ffmpeg::default();
        let err = tools.probe(Path::new("/nonexistent/clip.mp4")).await.unwrap_err();
        assert!(matches!(err, Error::Io(_)));
    }

    #[tokio::test]
    async fn strip_audio_without_ffmpeg_fails() {
        let dir = tempfile::tempdir().unwrap();
        let input = dir.path().join("in.mp4");
        std::fs::write(&input, b"x").unwrap();

        let tools = Ffmpeg::new("/nonexistent/ffmpeg", "/nonexistent/ffprobe");
        let result = tools
            .strip_audio(&input, &dir.path().join("out.mp4"), &|_: u8| {})
            .await;
        assert!(matches!(result, Err(Error::Io(_))));
    }

    /// Dropping the strip future (task abort on shutdown) must not leave
    /// ffmpeg running.
    #[cfg(target_os = "linux")]
    #[tokio::test]
    async fn dropped_strip_kills_ffmpeg() {
        use std::os::unix::fs::PermissionsExt;
        use std::time::Duration;

        let dir = tempfile::tempdir().unwrap();
        let pid_file = dir.path().join("ffmpeg.pid");
        let script = dir.path().join("ffmpeg");
        std::fs::write(
            &script,
            format!("#!/bin/sh\necho $$ > {}\nexec sleep 30\n", pid_file.display()),
        )
        .unwrap();
        std::fs::set_permissions(&script, std::fs::Permissions::from_mode(0o755)).unwrap();
        let input = dir.path().join("in.mp4");
        std::fs::write(&input, b"x").unwrap();
        let output = dir.path().join("out.mp4");

        let tools = Ffmpeg::new(script.to_string_lossy(), "/nonexistent/ffprobe");
        let pid = tokio::select! {
            _ = tools.strip_audio(&input, &output, &|_: u8| {}) => panic!("ffmpeg exited early"),
            pid = async {
                loop {
                    if let Ok(raw) = tokio::fs::read_to_string(&pid_file).await
                        && let Ok(pid) = raw.trim().parse::<u32>()
                    {
                        break pid;
                    }
                    tokio::time::sleep(Duration::from_millis(20)).await;
                }
            } => pid,
        };

        // Killed processes may linger as zombies until reaped
        let running = || match std::fs::read_to_string(format!("/proc/{pid}/stat")) {
            Ok(stat) => stat
                .rsplit_once(')')
                .and_then(|(_, rest)| rest.trim_start().chars().next())
                .is_some_and(|state| state != 'Z' && state != 'X'),
            Err(_) => false,
        };
        for _ in 0..100 {
            if !running() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
        panic!("ffmpeg {pid} still running after its future was dropped");
    }
}
