//! Background credit refresh
//!
//! Spawns a periodic task that re-fetches every credential's balance so
//! exhausted keys drop out of rotation and topped-up keys rejoin it without
//! waiting for a job to fail first.

use std::sync::Arc;
use std::time::Duration;

use tracing::debug;

use crate::pool::Pool;

/// Spawn a task that refreshes all balances every `interval`.
///
/// The first tick is skipped; balances are fetched when keys are added and
/// when processing starts. Refresh failures are logged by the pool and
/// retried on the next cycle.
pub fn spawn_refresh_task(pool: Arc<Pool>, interval: Duration) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        ticker.tick().await;

        loop {
            ticker.tick().await;
            debug!("periodic credit refresh");
            pool.refresh_all_credits().await;
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use common::{MediaInfo, Secret};
    use enhance_client::{
        BoxFuture, Connector, CreditBalance, ImageOptions, ProgressFn, RemoteClient,
        StatusReport, UploadPart, VideoOptions,
    };
    use std::path::Path;
    use std::sync::atomic::{AtomicU32, Ordering};

    /// Counts balance fetches; everything else fails.
    struct CountingClient {
        fetches: Arc<AtomicU32>,
    }

    fn refused<'a, T: Send + 'a>() -> BoxFuture<'a, enhance_client::Result<T>> {
        Box::pin(async { Err(enhance_client::Error::Protocol("refused".into())) })
    }

    impl RemoteClient for CountingClient {
        fn create_image_request<'a>(
            &'a self,
            _: &'a Path,
            _: &'a ImageOptions,
        ) -> BoxFuture<'a, enhance_client::Result<Vec<u8>>> {
            refused()
        }
        fn create_video_request<'a>(
            &'a self,
            _: &'a MediaInfo,
            _: &'a VideoOptions,
        ) -> BoxFuture<'a, enhance_client::Result<String>> {
            refused()
        }
        fn accept_video_request<'a>(
            &'a self,
            _: &'a str,
        ) -> BoxFuture<'a, enhance_client::Result<String>> {
            refused()
        }
        fn upload_file<'a>(
            &'a self,
            _: &'a Path,
            _: &'a str,
        ) -> BoxFuture<'a, enhance_client::Result<String>> {
            refused()
        }
        fn complete_upload<'a>(
            &'a self,
            _: &'a str,
            _: &'a [UploadPart],
        ) -> BoxFuture<'a, enhance_client::Result<()>> {
            refused()
        }
        fn check_status<'a>(
            &'a self,
            _: &'a str,
        ) -> BoxFuture<'a, enhance_client::Result<StatusReport>> {
            refused()
        }
        fn download<'a>(
            &'a self,
            _: &'a str,
            _: &'a Path,
            _: ProgressFn<'a>,
        ) -> BoxFuture<'a, enhance_client::Result<()>> {
            refused()
        }
        fn credit_balance(&self) -> BoxFuture<'_, enhance_client::Result<CreditBalance>> {
            self.fetches.fetch_add(1, Ordering::SeqCst);
            Box::pin(async {
                Ok(CreditBalance {
                    available: 5.0,
                    reserved: 0.0,
                    total: 5.0,
                })
            })
        }
    }

    struct CountingConnector {
        fetches: Arc<AtomicU32>,
    }

    impl Connector for CountingConnector {
        fn connect(&self, _: &Secret<String>) -> Arc<dyn RemoteClient> {
            Arc::new(CountingClient {
                fetches: Arc::clone(&self.fetches),
            })
        }
    }

    #[tokio::test(start_paused = true)]
    async fn refreshes_on_each_interval_after_the_first() {
        let fetches = Arc::new(AtomicU32::new(0));
        let pool = Arc::new(Pool::new(Arc::new(CountingConnector {
            fetches: Arc::clone(&fetches),
        })));
        pool.restore("key-aaaaaaaa").await;
        pool.restore("key-bbbbbbbb").await;

        let handle = spawn_refresh_task(Arc::clone(&pool), Duration::from_secs(300));

        tokio::time::sleep(Duration::from_secs(10)).await;
        assert_eq!(fetches.load(Ordering::SeqCst), 0, "first tick is skipped");

        tokio::time::sleep(Duration::from_secs(300)).await;
        assert_eq!(fetches.load(Ordering::SeqCst), 2);
        assert_eq!(pool.list().await[0].credits.map(|c| c.available), Some(5.0));

        tokio::time::sleep(Duration::from_secs(300)).await;
        assert_eq!(fetches.load(Ordering::SeqCst), 4);

        handle.abort();
    }
}
