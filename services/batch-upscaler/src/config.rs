//! Configuration types and loading
//!
//! Config precedence: CLI args > env vars > config file > defaults.
//! API keys are loaded from the ENHANCE_API_KEYS env var and the key file,
//! never stored in the TOML directly to avoid leaking secrets.

use common::Secret;
use enhance_client::{ImageOptions, VideoOptions};
use job_queue::{MAX_WORKERS, MIN_WORKERS, SchedulerConfig};
use serde::Deserialize;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Root configuration
#[derive(Debug, Default, Deserialize)]
#[serde(default)]
pub struct Config {
    pub paths: PathsConfig,
    pub scheduler: SchedulerSection,
    pub remote: RemoteConfig,
    pub credentials: CredentialsConfig,
    pub media: MediaConfig,
    pub video: VideoOptions,
    pub image: ImageOptions,
    pub admin: AdminConfig,
    /// From ENHANCE_API_KEYS
    #[serde(skip)]
    pub api_keys: Vec<Secret<String>>,
}

/// Input and output folders
#[derive(Debug, Default, Deserialize)]
#[serde(default)]
pub struct PathsConfig {
    pub input_dir: Option<PathBuf>,
    pub output_dir: Option<PathBuf>,
}

#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct SchedulerSection {
    pub workers: usize,
    /// Start processing as soon as the service is up
    pub autostart: bool,
}

impl Default for SchedulerSection {
    fn default() -> Self {
        Self {
            workers: job_queue::DEFAULT_WORKERS,
            autostart: false,
        }
    }
}

/// Enhancement service settings
#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct RemoteConfig {
    pub base_url: String,
    pub timeout_secs: u64,
    pub poll_interval_secs: u64,
    pub max_status_checks: u32,
}

impl Default for RemoteConfig {
    fn default() -> Self {
        Self {
            base_url: enhance_client::http::DEFAULT_BASE_URL.to_string(),
            timeout_secs: 300,
            poll_interval_secs: job_queue::DEFAULT_POLL_INTERVAL.as_secs(),
            max_status_checks: job_queue::DEFAULT_MAX_STATUS_CHECKS,
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct CredentialsConfig {
    pub keys_file: PathBuf,
    pub refresh_interval_secs: u64,
}

impl Default for CredentialsConfig {
    fn default() -> Self {
        Self {
            keys_file: PathBuf::from("credentials.json"),
            refresh_interval_secs: 300,
        }
    }
}

/// Local ffmpeg tooling
#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct MediaConfig {
    pub ffmpeg_path: String,
    pub ffprobe_path: String,
}

impl Default for MediaConfig {
    fn default() -> Self {
        Self {
            ffmpeg_path: "ffmpeg".into(),
            ffprobe_path: "ffprobe".into(),
        }
    }
}

/// Operator API listener
#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct AdminConfig {
    pub listen_addr: SocketAddr,
    pub max_connections: usize,
}

impl Default for AdminConfig {
    fn default() -> Self {
        Self {
            listen_addr: SocketAddr::from(([127, 0, 0, 1], 9090)),
            max_connections: 64,
        }
    }
}

impl Config {
    /// Load configuration from a TOML file, then overlay environment variables.
    pub fn load(path: &Path) -> common::Result<Self> {
        let contents = std::fs::read_to_string(path)?;
        let mut config: Config = toml::from_str(&contents)?;
        config.validate()?;
        config.api_keys = api_keys_from_env();
        Ok(config)
    }

    fn validate(&self) -> common::Result<()> {
        let base_url = &self.remote.base_url;
        if !base_url.starts_with("http://") && !base_url.starts_with("https://") {
            return Err(common::Error::Config(format!(
                "base_url must start with http:// or https://, got: {base_url}"
            )));
        }

        if !(MIN_WORKERS..=MAX_WORKERS).contains(&self.scheduler.workers) {
            return Err(common::Error::Config(format!(
                "workers must be between {MIN_WORKERS} and {MAX_WORKERS}"
            )));
        }

        if self.remote.timeout_secs == 0 {
            return Err(common::Error::Config(
                "timeout_secs must be greater than 0".into(),
            ));
        }

        if self.remote.poll_interval_secs == 0 {
            return Err(common::Error::Config(
                "poll_interval_secs must be greater than 0".into(),
            ));
        }

        if self.remote.max_status_checks == 0 {
            return Err(common::Error::Config(
                "max_status_checks must be greater than 0".into(),
            ));
        }

        if self.credentials.refresh_interval_secs == 0 {
            return Err(common::Error::Config(
                "refresh_interval_secs must be greater than 0".into(),
            ));
        }

        if self.admin.max_connections == 0 {
            return Err(common::Error::Config(
                "max_connections must be greater than 0".into(),
            ));
        }

        Ok(())
    }

    /// Resolve config file path from CLI arg or CONFIG_PATH env var.
    pub fn resolve_path(cli_path: Option<&str>) -> PathBuf {
        if let Some(p) = cli_path {
            return PathBuf::from(p);
        }
        if let Ok(p) = std::env::var("CONFIG_PATH") {
            return PathBuf::from(p);
        }
        PathBuf::from("batch-upscaler.toml")
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.remote.timeout_secs)
    }

    pub fn refresh_interval(&self) -> Duration {
        Duration::from_secs(self.credentials.refresh_interval_secs)
    }

    pub fn scheduler_config(&self) -> SchedulerConfig {
        SchedulerConfig {
            input_dir: self.paths.input_dir.clone(),
            output_dir: self.paths.output_dir.clone(),
            workers: self.scheduler.workers,
            poll_interval: Duration::from_secs(self.remote.poll_interval_secs),
            max_status_checks: self.remote.max_status_checks,
            video: self.video.clone(),
            image: self.image.clone(),
        }
    }
}

/// Comma separated keys from ENHANCE_API_KEYS, blanks dropped.
fn api_keys_from_env() -> Vec<Secret<String>> {
    std::env::var("ENHANCE_API_KEYS")
        .map(|raw| {
            raw.split(',')
                .map(str::trim)
                .filter(|k| !k.is_empty())
                .map(|k| Secret::new(k.to_string()))
                .collect()
        })
        .unwrap_or_default()
}
