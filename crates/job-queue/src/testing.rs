//! Scripted fakes for the remote service and local media tools

use std::collections::{HashMap, VecDeque};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use common::{MediaInfo, Secret};
use credential_pool::{CredentialId, Pool};
use enhance_client::{
    BoxFuture, Connector, CreditBalance, ImageOptions, ProgressFn, RemoteClient, RemoteStatus,
    StatusReport, UploadPart, VideoOptions,
};
use media_tools::MediaTools;
use tokio::sync::broadcast;

use crate::events::JobEvent;
use crate::job::Job;
use crate::scheduler::{Scheduler, SchedulerConfig};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub(crate) enum Call {
    CreateImage,
    CreateVideo,
    Accept,
    Upload,
    Complete,
    Status,
    Download,
    Balance,
}

#[derive(Default)]
struct RemoteState {
    balances: HashMap<String, f64>,
    failures: HashMap<(String, Call), VecDeque<enhance_client::Error>>,
    always_fail: Option<enhance_client::Error>,
    statuses: VecDeque<StatusReport>,
    stall: bool,
    calls: Vec<(String, Call)>,
    requests: u32,
}

/// Remote service shared by every fake client.
#[derive(Clone, Default)]
pub(crate) struct Remote(Arc<Mutex<RemoteState>>);

const STARTING_BALANCE: f64 = 100.0;
const COST_PER_JOB: f64 = 2.0;

pub(crate) fn stalled(progress: f64) -> StatusReport {
    StatusReport {
        status: RemoteStatus::Processing,
        progress: Some(progress),
        download_url: None,
        message: None,
    }
}

fn completed() -> StatusReport {
    StatusReport {
        status: RemoteStatus::Complete,
        progress: Some(100.0),
        download_url: Some("https://download.example/result.mp4".into()),
        message: None,
    }
}

impl Remote {
    fn state(&self) -> std::sync::MutexGuard<'_, RemoteState> {
        self.0.lock().unwrap()
    }

    /// Fail the next `call` made with `key`.
    pub(crate) fn fail_next(&self, key: &str, call: Call, err: enhance_client::Error) {
        self.state()
            .failures
            .entry((key.to_string(), call))
            .or_default()
            .push_back(err);
    }

    /// Fail every call until `recover`.
    pub(crate) fn fail_always(&self, err: enhance_client::Error) {
        self.state().always_fail = Some(err);
    }

    pub(crate) fn recover(&self) {
        self.state().always_fail = None;
    }

    /// Queue a status report; once the queue drains, checks report completion.
    pub(crate) fn push_status(&self, report: StatusReport) {
        self.state().statuses.push_back(report);
    }

    /// Report "processing" forever.
    pub(crate) fn stall(&self) {
        self.state().stall = true;
    }

    pub(crate) fn calls(&self) -> Vec<(String, Call)> {
        self.state().calls.clone()
    }

    pub(crate) fn count(&self, call: Call) -> usize {
        self.state().calls.iter().filter(|(_, c)| *c == call).count()
    }

    fn record(&self, key: &str, call: Call) -> enhance_client::Result<()> {
        let mut state = self.state();
        state.calls.push((key.to_string(), call));
        if let Some(err) = &state.always_fail {
            return Err(err.clone());
        }
        match state
            .failures
            .get_mut(&(key.to_string(), call))
            .and_then(VecDeque::pop_front)
        {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }

    fn charge(&self, key: &str) {
        let mut state = self.state();
        let balance = state
            .balances
            .entry(key.to_string())
            .or_insert(STARTING_BALANCE);
        *balance -= COST_PER_JOB;
    }
}

struct FakeClient {
    key: String,
    remote: Remote,
}

impl RemoteClient for FakeClient {
    fn create_image_request<'a>(
        &'a self,
        _: &'a Path,
        _: &'a ImageOptions,
    ) -> BoxFuture<'a, enhance_client::Result<Vec<u8>>> {
        Box::pin(async move {
            self.remote.record(&self.key, Call::CreateImage)?;
            self.remote.charge(&self.key);
            Ok(b"image-bytes".to_vec())
        })
    }

    fn create_video_request<'a>(
        &'a self,
        _: &'a MediaInfo,
        _: &'a VideoOptions,
    ) -> BoxFuture<'a, enhance_client::Result<String>> {
        Box::pin(async move {
            self.remote.record(&self.key, Call::CreateVideo)?;
            let mut state = self.remote.state();
            state.requests += 1;
            Ok(format!("req-{}", state.requests))
        })
    }

    fn accept_video_request<'a>(
        &'a self,
        _: &'a str,
    ) -> BoxFuture<'a, enhance_client::Result<String>> {
        Box::pin(async move {
            self.remote.record(&self.key, Call::Accept)?;
            Ok("https://upload.example/part-1".to_string())
        })
    }

    fn upload_file<'a>(
        &'a self,
        _: &'a Path,
        _: &'a str,
    ) -> BoxFuture<'a, enhance_client::Result<String>> {
        Box::pin(async move {
            self.remote.record(&self.key, Call::Upload)?;
            Ok("etag-1".to_string())
        })
    }

    fn complete_upload<'a>(
        &'a self,
        _: &'a str,
        _: &'a [UploadPart],
    ) -> BoxFuture<'a, enhance_client::Result<()>> {
        Box::pin(async move { self.remote.record(&self.key, Call::Complete) })
    }

    fn check_status<'a>(
        &'a self,
        _: &'a str,
    ) -> BoxFuture<'a, enhance_client::Result<StatusReport>> {
        Box::pin(async move {
            self.remote.record(&self.key, Call::Status)?;
            let mut state = self.remote.state();
            if let Some(report) = state.statuses.pop_front() {
                return Ok(report);
            }
            Ok(if state.stall { stalled(10.0) } else { completed() })
        })
    }

    fn download<'a>(
        &'a self,
        _: &'a str,
        dest: &'a Path,
        on_progress: ProgressFn<'a>,
    ) -> BoxFuture<'a, enhance_client::Result<()>> {
        Box::pin(async move {
            self.remote.record(&self.key, Call::Download)?;
            on_progress(50);
            tokio::fs::write(dest, b"enhanced")
                .await
                .map_err(|e| enhance_client::Error::Io(e.to_string()))?;
            on_progress(100);
            self.remote.charge(&self.key);
            Ok(())
        })
    }

    fn credit_balance(&self) -> BoxFuture<'_, enhance_client::Result<CreditBalance>> {
        Box::pin(async move {
            self.remote.record(&self.key, Call::Balance)?;
            let available = *self
                .remote
                .state()
                .balances
                .get(&self.key)
                .unwrap_or(&STARTING_BALANCE);
            Ok(CreditBalance {
                available,
                reserved: 0.0,
                total: STARTING_BALANCE,
            })
        })
    }
}

struct FakeConnector {
    remote: Remote,
}

impl Connector for FakeConnector {
    fn connect(&self, api_key: &Secret<String>) -> Arc<dyn RemoteClient> {
        Arc::new(FakeClient {
            key: api_key.expose().clone(),
            remote: self.remote.clone(),
        })
    }
}

/// Probe returns fallback metadata; audio stripping copies the file.
#[derive(Debug, Default, Clone)]
pub(crate) struct FakeMedia {
    pub fail_strip: bool,
}

impl MediaTools for FakeMedia {
    fn probe<'a>(&'a self, path: &'a Path) -> media_tools::BoxFuture<'a, media_tools::Result<MediaInfo>> {
        Box::pin(async move {
            let size = tokio::fs::metadata(path)
                .await
                .map_err(|e| media_tools::Error::Io(e.to_string()))?
                .len();
            Ok(MediaInfo::fallback(size, "mp4"))
        })
    }

    fn strip_audio<'a>(
        &'a self,
        input: &'a Path,
        output: &'a Path,
        on_progress: &'a (dyn Fn(u8) + Send + Sync),
    ) -> media_tools::BoxFuture<'a, media_tools::Result<()>> {
        Box::pin(async move {
            if self.fail_strip {
                // Leave a partial file behind like a crashed ffmpeg would
                let _ = tokio::fs::write(output, b"partial").await;
                return Err(media_tools::Error::CommandFailed {
                    program: "ffmpeg".into(),
                    code: Some(1),
                    message: "Invalid data found when processing input".into(),
                });
            }
            tokio::fs::copy(input, output)
                .await
                .map_err(|e| media_tools::Error::Io(e.to_string()))?;
            on_progress(100);
            Ok(())
        })
    }
}

/// Scheduler wired to fakes over a temporary input/output tree.
pub(crate) struct Harness {
    pub dir: tempfile::TempDir,
    pub remote: Remote,
    pub pool: Arc<Pool>,
    pub ids: Vec<CredentialId>,
    pub scheduler: Scheduler,
}

impl Harness {
    pub(crate) async fn new(keys: &[&str], files: &[&str]) -> Self {
        Self::build(keys, files, FakeMedia::default(), |_| {}).await
    }

    pub(crate) async fn build(
        keys: &[&str],
        files: &[&str],
        media: FakeMedia,
        configure: impl FnOnce(&mut SchedulerConfig),
    ) -> Self {
        let dir = tempfile::tempdir().unwrap();
        let input = dir.path().join("input");
        std::fs::create_dir(&input).unwrap();
        for name in files {
            std::fs::write(input.join(name), b"source").unwrap();
        }

        let remote = Remote::default();
        let pool = Arc::new(Pool::new(Arc::new(FakeConnector {
            remote: remote.clone(),
        })));
        let mut ids = Vec::new();
        for key in keys {
            ids.push(pool.restore(key).await.unwrap());
        }
        pool.refresh_all_credits().await;

        let mut config = SchedulerConfig {
            input_dir: Some(input),
            output_dir: Some(dir.path().join("output")),
            ..SchedulerConfig::default()
        };
        configure(&mut config);

        let scheduler = Scheduler::new(Arc::clone(&pool), Arc::new(media), config);
        scheduler.scan_input().await.unwrap();

        Self {
            dir,
            remote,
            pool,
            ids,
            scheduler,
        }
    }

    pub(crate) fn input_dir(&self) -> PathBuf {
        self.dir.path().join("input")
    }

    pub(crate) fn output_dir(&self) -> PathBuf {
        self.dir.path().join("output")
    }
}

/// Wait for the first job update whose phase starts with `prefix`.
pub(crate) async fn wait_for_phase(events: &mut broadcast::Receiver<JobEvent>, prefix: &str) -> Job {
    loop {
        match events.recv().await {
            Ok(JobEvent::Updated(job)) if job.phase.starts_with(prefix) => return job,
            Ok(_) | Err(broadcast::error::RecvError::Lagged(_)) => continue,
            Err(broadcast::error::RecvError::Closed) => panic!("event stream closed"),
        }
    }
}
