//! Transient grant storage
//!
//! Grants are write-once and read-once. [`GrantStore`] is the seam between the
//! flow handlers and the backend; [`MemoryGrantStore`] is the process-local
//! implementation. A distributed backend only has to honour the same two
//! rules:
//!
//! - an entry at or past its `expires_at` is never returned, swept or not
//! - [`GrantStore::take`] is an atomic get-and-invalidate

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, LazyLock};
use std::time::Duration;

use async_trait::async_trait;
use base64::{Engine as _, engine::general_purpose::URL_SAFE_NO_PAD};
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use ring::rand::{SecureRandom, SystemRandom};
use thiserror::Error;
use tokio::task::JoinHandle;
use tracing::debug;

use crate::error::BrokerError;
use crate::grant::{AuthorizedGrant, PendingGrant};

/// Random bytes in a minted code
pub const CODE_BYTES: usize = 32;

/// Storage backend failure
#[derive(Debug, Error)]
pub enum StoreError {
    /// Backend could not complete the operation
    #[error("grant store unavailable: {0}")]
    Unavailable(String),
    /// System randomness failed
    #[error("random source failure")]
    Random,
}

impl From<StoreError> for BrokerError {
    fn from(err: StoreError) -> Self {
        Self::Server(err.to_string())
    }
}

/// Something with an absolute expiry
pub trait Expiring {
    /// When the value stops being valid
    fn expires_at(&self) -> DateTime<Utc>;

    /// Whether the value is no longer valid at `now`
    fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        now >= self.expires_at()
    }
}

/// Keyed store of expiring grants
#[async_trait]
pub trait GrantStore<G>: Send + Sync + fmt::Debug
where
    G: Expiring + Clone + Send + Sync + 'static,
{
    /// Insert a grant under a fresh code
    async fn put(&self, code: String, grant: G) -> Result<(), StoreError>;

    /// Look up a grant without consuming it
    async fn get(&self, code: &str) -> Result<Option<G>, StoreError>;

    /// Remove and return a grant
    async fn take(&self, code: &str) -> Result<Option<G>, StoreError>;

    /// Drop expired entries, returning how many were removed
    async fn purge_expired(&self) -> Result<usize, StoreError>;
}

/// Shared handle to a grant store
pub type SharedGrantStore<G> = Arc<dyn GrantStore<G>>;

const SWEEP_EVERY_PUTS: u64 = 256;

/// DashMap-backed grant store
pub struct MemoryGrantStore<G> {
    entries: DashMap<String, G>,
    puts: AtomicU64,
}

impl<G> fmt::Debug for MemoryGrantStore<G> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MemoryGrantStore")
            .field("entries", &self.entries.len())
            .finish()
    }
}

impl<G> Default for MemoryGrantStore<G> {
    fn default() -> Self {
        Self {
            entries: DashMap::new(),
            puts: AtomicU64::new(0),
        }
    }
}

impl<G: Expiring> MemoryGrantStore<G> {
    /// Create an empty store
    pub fn new() -> Self {
        Self::default()
    }

    /// Physically present entries, expired ones included
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether no entries are present
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    fn purge(&self, now: DateTime<Utc>) -> usize {
        let before = self.entries.len();
        self.entries.retain(|_, grant| !grant.is_expired_at(now));
        before.saturating_sub(self.entries.len())
    }
}

#[async_trait]
impl<G> GrantStore<G> for MemoryGrantStore<G>
where
    G: Expiring + Clone + Send + Sync + 'static,
{
    async fn put(&self, code: String, grant: G) -> Result<(), StoreError> {
        self.entries.insert(code, grant);

        if self.puts.fetch_add(1, Ordering::Relaxed) % SWEEP_EVERY_PUTS == SWEEP_EVERY_PUTS - 1 {
            let purged = self.purge(Utc::now());
            if purged > 0 {
                debug!(target: "authgate::oauth", purged, "purged expired grants");
            }
        }
        Ok(())
    }

    async fn get(&self, code: &str) -> Result<Option<G>, StoreError> {
        let now = Utc::now();
        Ok(self
            .entries
            .get(code)
            .filter(|entry| !entry.is_expired_at(now))
            .map(|entry| entry.value().clone()))
    }

    async fn take(&self, code: &str) -> Result<Option<G>, StoreError> {
        let now = Utc::now();
        Ok(self
            .entries
            .remove(code)
            .map(|(_, grant)| grant)
            .filter(|grant| !grant.is_expired_at(now)))
    }

    async fn purge_expired(&self) -> Result<usize, StoreError> {
        Ok(self.purge(Utc::now()))
    }
}

static PENDING: LazyLock<Arc<MemoryGrantStore<PendingGrant>>> =
    LazyLock::new(|| Arc::new(MemoryGrantStore::new()));

static AUTHORIZED: LazyLock<Arc<MemoryGrantStore<AuthorizedGrant>>> =
    LazyLock::new(|| Arc::new(MemoryGrantStore::new()));

/// Process-wide store of pending grants, keyed by local authorization code
pub fn pending_grants() -> Arc<MemoryGrantStore<PendingGrant>> {
    Arc::clone(&PENDING)
}

/// Process-wide store of authorized grants, keyed by client-facing code
pub fn authorized_grants() -> Arc<MemoryGrantStore<AuthorizedGrant>> {
    Arc::clone(&AUTHORIZED)
}

/// Periodically purge a store until the runtime shuts down
pub fn spawn_sweeper<G>(store: SharedGrantStore<G>, every: Duration) -> JoinHandle<()>
where
    G: Expiring + Clone + Send + Sync + 'static,
{
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(every);
        ticker.tick().await;
        loop {
            ticker.tick().await;
            match store.purge_expired().await {
                Ok(0) => {}
                Ok(purged) => debug!(target: "authgate::oauth", purged, "swept expired grants"),
                Err(e) => debug!(target: "authgate::oauth", error = %e, "grant sweep failed"),
            }
        }
    })
}

/// Mint a URL-safe code with 256 bits of entropy
///
/// # Errors
///
/// Returns [`StoreError::Random`] if the system random source fails.
pub fn mint_code() -> Result<String, StoreError> {
    static RNG: LazyLock<SystemRandom> = LazyLock::new(SystemRandom::new);

    let mut bytes = [0u8; CODE_BYTES];
    RNG.fill(&mut bytes).map_err(|_| StoreError::Random)?;
    Ok(URL_SAFE_NO_PAD.encode(bytes))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    #[derive(Debug, Clone, PartialEq)]
    struct Ticket {
        label: &'static str,
        expires_at: DateTime<Utc>,
    }

    impl Expiring for Ticket {
        fn expires_at(&self) -> DateTime<Utc> {
            self.expires_at
        }
    }

    fn ticket(label: &'static str, ttl_secs: i64) -> Ticket {
        Ticket {
            label,
            expires_at: Utc::now() + chrono::Duration::seconds(ttl_secs),
        }
    }

    #[tokio::test]
    async fn test_take_is_single_use() {
        let store = MemoryGrantStore::new();
        store.put("code".into(), ticket("a", 600)).await.unwrap();

        assert_eq!(store.get("code").await.unwrap().map(|t| t.label), Some("a"));
        assert_eq!(store.take("code").await.unwrap().map(|t| t.label), Some("a"));
        assert!(store.take("code").await.unwrap().is_none());
        assert!(store.get("code").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_expired_entry_is_not_found_without_sweep() {
        let store = MemoryGrantStore::new();
        store.put("old".into(), ticket("old", -1)).await.unwrap();

        assert_eq!(store.len(), 1);
        assert!(store.get("old").await.unwrap().is_none());
        assert!(store.take("old").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_purge_expired() {
        let store = MemoryGrantStore::new();
        store.put("a".into(), ticket("a", -5)).await.unwrap();
        store.put("b".into(), ticket("b", -5)).await.unwrap();
        store.put("c".into(), ticket("c", 600)).await.unwrap();

        assert_eq!(store.purge_expired().await.unwrap(), 2);
        assert_eq!(store.len(), 1);
        assert!(store.get("c").await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_concurrent_take_yields_one_winner() {
        let store = Arc::new(MemoryGrantStore::new());
        store.put("race".into(), ticket("r", 600)).await.unwrap();

        let mut handles = Vec::new();
        for _ in 0..16 {
            let store = Arc::clone(&store);
            handles.push(tokio::spawn(async move { store.take("race").await.unwrap() }));
        }
        let mut winners = 0;
        for handle in handles {
            if handle.await.unwrap().is_some() {
                winners += 1;
            }
        }
        assert_eq!(winners, 1);
    }

    #[test]
    fn test_minted_codes() {
        let codes: HashSet<String> = (0..100).map(|_| mint_code().unwrap()).collect();
        assert_eq!(codes.len(), 100);
        for code in &codes {
            assert_eq!(code.len(), 43);
            assert!(code.bytes().all(|b| b.is_ascii_alphanumeric() || b == b'-' || b == b'_'));
        }
    }
}
