//! API key file
//!
//! Keeps the operator's API keys in a JSON file so they survive restarts. All
//! writes use atomic temp-file + rename. A tokio Mutex serializes writes from
//! concurrent admin requests.
//!
//! The file only stores keys in pool order. Usage counters, rate-limit
//! deadlines and credit balances are runtime state and are not persisted.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tracing::{debug, info};

use crate::error::{Error, Result};

#[derive(Debug, Default, Clone, Serialize, Deserialize)]
struct KeyFile {
    #[serde(default)]
    api_keys: Vec<String>,
}

/// Thread-safe key file manager.
pub struct KeyStore {
    path: PathBuf,
    state: Mutex<KeyFile>,
}

impl KeyStore {
    /// Load keys from the given file path.
    ///
    /// If the file doesn't exist, creates it with an empty key list.
    pub async fn load(path: PathBuf) -> Result<Self> {
        let state = if path.exists() {
            let contents = tokio::fs::read_to_string(&path)
                .await
                .map_err(|e| Error::Store(format!("reading key file: {e}")))?;
            let file: KeyFile = serde_json::from_str(&contents)
                .map_err(|e| Error::Store(format!("parsing key file: {e}")))?;
            info!(path = %path.display(), keys = file.api_keys.len(), "loaded API keys");
            file
        } else {
            info!(path = %path.display(), "key file not found, starting with empty store");
            let file = KeyFile::default();
            write_atomic(&path, &file).await?;
            file
        };

        Ok(Self {
            path,
            state: Mutex::new(state),
        })
    }

    /// All stored keys, in insertion order.
    pub async fn keys(&self) -> Vec<String> {
        self.state.lock().await.api_keys.clone()
    }

    /// Append a key and persist. Already-present keys are left alone.
    pub async fn add(&self, key: &str) -> Result<()> {
        let mut state = self.state.lock().await;
        if state.api_keys.iter().any(|k| k == key) {
            return Ok(());
        }
        let mut next = state.clone();
        next.api_keys.push(key.to_string());
        write_atomic(&self.path, &next).await?;
        *state = next;
        debug!("added key to store");
        Ok(())
    }

    /// Remove a key and persist. Returns whether it was present.
    pub async fn remove(&self, key: &str) -> Result<bool> {
        let mut state = self.state.lock().await;
        if !state.api_keys.iter().any(|k| k == key) {
            return Ok(false);
        }
        let mut next = state.clone();
        next.api_keys.retain(|k| k != key);
        write_atomic(&self.path, &next).await?;
        *state = next;
        debug!("removed key from store");
        Ok(true)
    }

    pub async fn len(&self) -> usize {
        self.state.lock().await.api_keys.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }
}

/// Write the key file atomically with 0600 permissions.
///
/// Callers commit their in-memory change only after this succeeds.
async fn write_atomic(path: &Path, data: &KeyFile) -> Result<()> {
    let json = serde_json::to_string_pretty(data)
        .map_err(|e| Error::Store(format!("serializing keys: {e}")))?;

    let dir = match path.parent() {
        Some(dir) if !dir.as_os_str().is_empty() => dir,
        _ => Path::new("."),
    };

    let tmp_path = dir.join(format!(".api-keys.tmp.{}", std::process::id()));

    tokio::fs::write(&tmp_path, json.as_bytes())
        .await
        .map_err(|e| Error::Store(format!("writing temp key file: {e}")))?;

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        let perms = std::fs::Permissions::from_mode(0o600);
        tokio::fs::set_permissions(&tmp_path, perms)
            .await
            .map_err(|e| Error::Store(format!("setting key file permissions: {e}")))?;
    }

    tokio::fs::rename(&tmp_path, path)
        .await
        .map_err(|e| Error::Store(format!("renaming temp key file: {e}")))?;

    debug!(path = %path.display(), "persisted API keys");
    Ok(())
}
