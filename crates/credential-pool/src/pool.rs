//! Credential state and round-robin selection
//!
//! Selection rotates over the *eligible* subset: active, not rate limited, and
//! either funded or of unknown balance. The cursor is taken modulo the eligible
//! count so keys that are temporarily unusable do not skew rotation.
//!
//! Rate-limit deadlines lapse on their own: the next selection after a
//! deadline passes clears it and the key rejoins the rotation.
//!
//! Remote calls (validation, balance fetches) never run under the state lock.
//! Clients are cloned out first and results are written back by `CredentialId`,
//! which stays stable while indices shift on removal.

use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use common::{MediaInfo, Secret};
use enhance_client::{Connector, CreditBalance, RemoteClient, VideoOptions};
use serde::Serialize;
use tokio::sync::RwLock;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::error::{Error, Result};
use crate::store::KeyStore;

/// Backoff applied when the service does not say how long to wait.
pub const DEFAULT_RATE_LIMIT_BACKOFF: Duration = Duration::from_secs(60);

/// Stable identity of a pool entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(transparent)]
pub struct CredentialId(u64);

impl fmt::Display for CredentialId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "cred-{}", self.0)
    }
}

struct Entry {
    id: CredentialId,
    key: Secret<String>,
    label: String,
    client: Arc<dyn RemoteClient>,
    active: bool,
    usage: u64,
    /// Unix millis
    last_used: Option<u64>,
    rate_limit_reset: Option<Instant>,
    credits: Option<CreditBalance>,
    /// Unix millis
    last_credit_check: Option<u64>,
}

impl Entry {
    fn rate_limited(&self, now: Instant) -> bool {
        matches!(self.rate_limit_reset, Some(reset) if reset > now)
    }

    fn eligible(&self, now: Instant) -> bool {
        self.active
            && !self.rate_limited(now)
            && self.credits.is_none_or(|c| c.available > 0.0)
    }
}

struct PoolState {
    entries: Vec<Entry>,
    cursor: usize,
}

impl PoolState {
    fn eligible_count(&self, now: Instant) -> usize {
        self.entries.iter().filter(|e| e.eligible(now)).count()
    }

    fn find_mut(&mut self, id: CredentialId) -> Option<&mut Entry> {
        self.entries.iter_mut().find(|e| e.id == id)
    }
}

/// A credential handed to a worker for one attempt.
#[derive(Clone)]
pub struct SelectedCredential {
    pub id: CredentialId,
    /// Position in the pool at selection time
    pub index: usize,
    /// Masked key for logs and job records
    pub label: String,
    pub client: Arc<dyn RemoteClient>,
    /// Available credits known at selection time
    pub credits_available: Option<f64>,
}

impl fmt::Debug for SelectedCredential {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SelectedCredential")
            .field("id", &self.id)
            .field("index", &self.index)
            .field("label", &self.label)
            .field("credits_available", &self.credits_available)
            .finish()
    }
}

/// Outcome of `Pool::next_eligible`.
#[derive(Debug, Clone)]
pub enum Selection {
    /// Use this credential now.
    Ready(SelectedCredential),
    /// Nothing is eligible. `id` is the credential whose rate-limit deadline
    /// lapses first; `until` is that deadline, or None when no credential is
    /// waiting on one (inactive or out of credits), so waiting will not help.
    Wait {
        id: CredentialId,
        label: String,
        until: Option<Instant>,
    },
}

/// Aggregate counters for status displays.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct PoolStats {
    pub total: usize,
    pub active: usize,
    pub total_requests: u64,
    pub rate_limited: usize,
    /// Credentials selection would hand out right now.
    pub eligible: usize,
}

/// One row of the credential listing. The key is masked.
#[derive(Debug, Clone, Serialize)]
pub struct CredentialSummary {
    pub index: usize,
    pub id: CredentialId,
    pub key: String,
    pub active: bool,
    pub request_count: u64,
    pub last_used: Option<u64>,
    pub rate_limited: bool,
    pub rate_limit_remaining_secs: Option<u64>,
    pub credits: Option<CreditBalance>,
    pub last_credit_check: Option<u64>,
}

/// Process-wide pool of API credentials.
pub struct Pool {
    state: RwLock<PoolState>,
    connector: Arc<dyn Connector>,
    store: Option<Arc<KeyStore>>,
    next_id: AtomicU64,
}

fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

/// Media description for the key validation request: 1080p, one second.
fn validation_source() -> MediaInfo {
    MediaInfo {
        duration: 1,
        frame_count: 30,
        ..MediaInfo::fallback(1_000_000, "mp4")
    }
}

impl Pool {
    /// Create an empty pool. Keys are not persisted.
    pub fn new(connector: Arc<dyn Connector>) -> Self {
        Self {
            state: RwLock::new(PoolState {
                entries: Vec::new(),
                cursor: 0,
            }),
            connector,
            store: None,
            next_id: AtomicU64::new(1),
        }
    }

    /// Create an empty pool that mirrors additions and removals into `store`.
    pub fn with_store(connector: Arc<dyn Connector>, store: Arc<KeyStore>) -> Self {
        Self {
            store: Some(store),
            ..Self::new(connector)
        }
    }

    fn make_entry(&self, key: Secret<String>) -> Entry {
        let id = CredentialId(self.next_id.fetch_add(1, Ordering::Relaxed));
        let client = self.connector.connect(&key);
        Entry {
            id,
            label: key.masked(),
            key,
            client,
            active: true,
            usage: 0,
            last_used: None,
            rate_limit_reset: None,
            credits: None,
            last_credit_check: None,
        }
    }

    async fn contains_key(&self, token: &str) -> bool {
        let state = self.state.read().await;
        state.entries.iter().any(|e| e.key.expose() == token)
    }

    /// Validate a key against the service and append it.
    ///
    /// Validation issues one minimal creation request. The initial credit
    /// balance is fetched before the key joins the pool; a failed fetch
    /// leaves the balance unknown, which counts as eligible.
    pub async fn add(&self, token: &str) -> Result<CredentialId> {
        let token = token.trim();
        if token.is_empty() {
            return Err(Error::InvalidCredential("API key is empty".into()));
        }
        let key = Secret::new(token.to_string());
        if self.contains_key(token).await {
            return Err(Error::Duplicate(key.masked()));
        }

        let mut entry = self.make_entry(key);
        validate(entry.client.as_ref()).await?;

        match entry.client.credit_balance().await {
            Ok(balance) => {
                entry.credits = Some(balance);
                entry.last_credit_check = Some(now_millis());
            }
            Err(e) => warn!(credential = %entry.label, error = %e, "initial credit check failed"),
        }

        if let Some(store) = &self.store {
            store.add(token).await?;
        }

        let id = entry.id;
        let label = entry.label.clone();
        let mut state = self.state.write().await;
        if state.entries.iter().any(|e| e.key.expose() == token) {
            return Err(Error::Duplicate(label));
        }
        state.entries.push(entry);
        info!(credential = %label, total = state.entries.len(), "credential added");
        Ok(id)
    }

    /// Append a previously validated key without contacting the service.
    ///
    /// Used at startup for keys from the environment or the key file. Balances
    /// stay unknown until the next credit refresh.
    pub async fn restore(&self, token: &str) -> Option<CredentialId> {
        let token = token.trim();
        if token.is_empty() || self.contains_key(token).await {
            return None;
        }
        let entry = self.make_entry(Secret::new(token.to_string()));
        let id = entry.id;
        let mut state = self.state.write().await;
        debug!(credential = %entry.label, "credential restored");
        state.entries.push(entry);
        Some(id)
    }

    /// Remove the credential at `index`. Out-of-range indices are ignored.
    ///
    /// The key file is updated first; if that write fails the credential
    /// stays in the pool. The cursor wraps to 0 when it no longer addresses an
    /// eligible slot.
    pub async fn remove(&self, index: usize) -> Result<Option<CredentialId>> {
        let mut state = self.state.write().await;
        let Some(entry) = state.entries.get(index) else {
            return Ok(None);
        };
        if let Some(store) = &self.store {
            store.remove(entry.key.expose()).await?;
        }

        let removed = state.entries.remove(index);
        let eligible = state.eligible_count(Instant::now());
        if state.cursor >= eligible {
            state.cursor = 0;
        }
        info!(credential = %removed.label, remaining = state.entries.len(), "credential removed");
        Ok(Some(removed.id))
    }

    /// Pick the next credential.
    ///
    /// Returns None for an empty pool. When nothing is eligible, returns
    /// `Selection::Wait` for the credential with the earliest rate-limit
    /// deadline (ties go to pool order) without touching the cursor.
    pub async fn next_eligible(&self) -> Option<Selection> {
        let mut state = self.state.write().await;
        if state.entries.is_empty() {
            return None;
        }
        let now = Instant::now();

        for entry in state.entries.iter_mut() {
            if matches!(entry.rate_limit_reset, Some(reset) if reset <= now) {
                debug!(credential = %entry.label, "rate limit lapsed");
                entry.rate_limit_reset = None;
            }
        }

        let eligible: Vec<usize> = state
            .entries
            .iter()
            .enumerate()
            .filter(|(_, e)| e.eligible(now))
            .map(|(i, _)| i)
            .collect();

        if eligible.is_empty() {
            let waiting = state
                .entries
                .iter()
                .filter_map(|e| e.rate_limit_reset.map(|reset| (reset, e)))
                .min_by_key(|(reset, _)| *reset);
            let selection = match waiting {
                Some((reset, entry)) => Selection::Wait {
                    id: entry.id,
                    label: entry.label.clone(),
                    until: Some(reset),
                },
                None => {
                    let first = &state.entries[0];
                    Selection::Wait {
                        id: first.id,
                        label: first.label.clone(),
                        until: None,
                    }
                }
            };
            return Some(selection);
        }

        let slot = state.cursor % eligible.len();
        state.cursor = (state.cursor + 1) % eligible.len();
        let index = eligible[slot];
        let entry = &mut state.entries[index];
        entry.usage += 1;
        entry.last_used = Some(now_millis());

        Some(Selection::Ready(SelectedCredential {
            id: entry.id,
            index,
            label: entry.label.clone(),
            client: Arc::clone(&entry.client),
            credits_available: entry.credits.map(|c| c.available),
        }))
    }

    /// Back a credential off for `retry_after` (60s when None).
    pub async fn mark_rate_limited(&self, id: CredentialId, retry_after: Option<Duration>) {
        let backoff = retry_after.unwrap_or(DEFAULT_RATE_LIMIT_BACKOFF);
        let mut state = self.state.write().await;
        if let Some(entry) = state.find_mut(id) {
            entry.rate_limit_reset = Some(Instant::now() + backoff);
            metrics::counter!("enhance_credentials_rate_limited_total").increment(1);
            warn!(
                credential = %entry.label,
                backoff_secs = backoff.as_secs(),
                "credential rate limited"
            );
        }
    }

    /// Re-fetch one credential's balance. Returns the new balance, or None if
    /// the fetch failed (the prior snapshot is kept) or the id is gone.
    pub async fn refresh_credits(&self, id: CredentialId) -> Option<CreditBalance> {
        let (client, label) = {
            let state = self.state.read().await;
            let entry = state.entries.iter().find(|e| e.id == id)?;
            (Arc::clone(&entry.client), entry.label.clone())
        };

        match client.credit_balance().await {
            Ok(balance) => {
                let mut state = self.state.write().await;
                let entry = state.find_mut(id)?;
                entry.credits = Some(balance);
                entry.last_credit_check = Some(now_millis());
                debug!(credential = %label, available = balance.available, "credits refreshed");
                Some(balance)
            }
            Err(e) => {
                warn!(credential = %label, error = %e, "credit refresh failed");
                None
            }
        }
    }

    /// Re-fetch every credential's balance concurrently. Best effort.
    pub async fn refresh_all_credits(&self) {
        let ids: Vec<CredentialId> = {
            let state = self.state.read().await;
            state.entries.iter().map(|e| e.id).collect()
        };
        let refreshed = futures_util::future::join_all(ids.iter().map(|id| self.refresh_credits(*id)))
            .await
            .into_iter()
            .filter(Option::is_some)
            .count();
        debug!(total = ids.len(), refreshed, "credit refresh finished");
    }

    /// Manually activate or deactivate the credential at `index`.
    pub async fn set_active(&self, index: usize, active: bool) -> Result<()> {
        let mut state = self.state.write().await;
        let entry = state
            .entries
            .get_mut(index)
            .ok_or_else(|| Error::NotFound(format!("no credential at index {index}")))?;
        entry.active = active;
        info!(credential = %entry.label, active, "credential activity changed");
        Ok(())
    }

    pub async fn stats(&self) -> PoolStats {
        let state = self.state.read().await;
        let now = Instant::now();
        PoolStats {
            total: state.entries.len(),
            active: state.entries.iter().filter(|e| e.active).count(),
            total_requests: state.entries.iter().map(|e| e.usage).sum(),
            rate_limited: state.entries.iter().filter(|e| e.rate_limited(now)).count(),
            eligible: state.eligible_count(now),
        }
    }

    pub async fn list(&self) -> Vec<CredentialSummary> {
        let state = self.state.read().await;
        let now = Instant::now();
        state
            .entries
            .iter()
            .enumerate()
            .map(|(index, e)| CredentialSummary {
                index,
                id: e.id,
                key: e.label.clone(),
                active: e.active,
                request_count: e.usage,
                last_used: e.last_used,
                rate_limited: e.rate_limited(now),
                rate_limit_remaining_secs: e
                    .rate_limit_reset
                    .filter(|reset| *reset > now)
                    .map(|reset| (reset - now).as_secs()),
                credits: e.credits,
                last_credit_check: e.last_credit_check,
            })
            .collect()
    }

    pub async fn len(&self) -> usize {
        self.state.read().await.entries.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }
}

/// Issue the minimal creation request used to prove a key works.
///
/// A credit-exhaustion answer still proves the key authenticates, so the key
/// is accepted and simply starts out ineligible once its balance is known.
async fn validate(client: &dyn RemoteClient) -> Result<()> {
    let options = VideoOptions {
        model: "prob-4".into(),
        resolution: "1920x1080".into(),
        ..VideoOptions::default()
    };
    match client.create_video_request(&validation_source(), &options).await {
        Ok(_) => Ok(()),
        Err(e) if e.is_credit_exhaustion() => Ok(()),
        Err(enhance_client::Error::Network(msg)) | Err(enhance_client::Error::Io(msg)) => {
            Err(Error::Network(msg))
        }
        Err(e) => Err(Error::InvalidCredential(e.to_string())),
    }
}
