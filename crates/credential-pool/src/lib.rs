//! Credential pool for the enhancement service
//!
//! Holds every API key with its activity flag, usage counter, rate-limit
//! deadline and last known credit balance, and hands keys out round-robin over
//! the currently eligible subset.
//!
//! Credential lifecycle:
//! 1. Operator adds a key → validated with a minimal creation request, balance fetched
//! 2. Workers call `next_eligible` → round-robin over active, unthrottled, funded keys
//! 3. Service returns 429 → `mark_rate_limited` sets a reset deadline
//! 4. Deadline passes → key is eligible again without explicit action
//! 5. Background task refreshes credit balances periodically
//! 6. Operator removes the key; nothing removes keys automatically

pub mod error;
pub mod pool;
pub mod refresh;
pub mod store;

pub use error::{Error, Result};
pub use pool::{
    CredentialId, CredentialSummary, DEFAULT_RATE_LIMIT_BACKOFF, Pool, PoolStats,
    SelectedCredential, Selection,
};
pub use refresh::spawn_refresh_task;
pub use store::KeyStore;
