//! In-process store with key expiry and fault injection.
//!
//! Mirrors the subset of Redis semantics the tracker relies on, so the whole
//! admission pipeline can run without a server in tests and local setups.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use dashmap::mapref::entry::Entry as MapEntry;
use dashmap::DashMap;
use parking_lot::RwLock;
use tokio::time::Instant;

use super::backend::{BackendError, StoreBackend, Ttl};

#[derive(Debug, Clone)]
struct Entry {
    value: String,
    expires_at: Option<Instant>,
}

impl Entry {
    fn new(value: String, ttl: Duration) -> Self {
        let expires_at = (!ttl.is_zero()).then(|| Instant::now() + ttl);
        Self { value, expires_at }
    }

    fn is_expired(&self, now: Instant) -> bool {
        self.expires_at.is_some_and(|at| at <= now)
    }
}

/// A store held in process memory.
#[derive(Debug, Default)]
pub struct MemoryBackend {
    entries: DashMap<String, Entry>,
    /// When set, every call fails with [`BackendError::Unavailable`].
    fault: RwLock<Option<String>>,
    /// Latency added to every call.
    latency: RwLock<Duration>,
    calls: AtomicU64,
}

impl MemoryBackend {
    /// Create an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every subsequent call fail with `message`, or recover with `None`.
    pub fn set_fault(&self, message: Option<&str>) {
        *self.fault.write() = message.map(str::to_string);
    }

    /// Delay every subsequent call by `latency`.
    pub fn set_latency(&self, latency: Duration) {
        *self.latency.write() = latency;
    }

    /// Number of calls that reached this backend.
    pub fn calls(&self) -> u64 {
        self.calls.load(Ordering::SeqCst)
    }

    /// Number of live keys. Expired entries are evicted first.
    pub fn len(&self) -> usize {
        self.purge_expired(Instant::now());
        self.entries.len()
    }

    /// Whether no live keys are stored.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    async fn enter(&self) -> Result<Instant, BackendError> {
        self.calls.fetch_add(1, Ordering::SeqCst);

        let latency = *self.latency.read();
        if !latency.is_zero() {
            tokio::time::sleep(latency).await;
        }

        if let Some(message) = self.fault.read().clone() {
            return Err(BackendError::Unavailable(message));
        }

        Ok(Instant::now())
    }

    /// Evict every expired entry.
    fn purge_expired(&self, now: Instant) {
        self.entries.retain(|_, e| !e.is_expired(now));
    }

    /// Fetch a live entry, evicting it if it has expired.
    fn live(&self, key: &str, now: Instant) -> Option<Entry> {
        let entry = self.entries.get(key)?.clone();
        if entry.is_expired(now) {
            self.entries.remove_if(key, |_, e| e.is_expired(now));
            return None;
        }
        Some(entry)
    }
}

/// Glob matching supporting `*` and `?`.
fn glob_match(pattern: &str, text: &str) -> bool {
    let pattern: Vec<char> = pattern.chars().collect();
    let text: Vec<char> = text.chars().collect();
    let (mut p, mut t) = (0, 0);
    let mut backtrack: Option<(usize, usize)> = None;

    while t < text.len() {
        match pattern.get(p) {
            Some('*') => {
                backtrack = Some((p, t));
                p += 1;
            }
            Some(&c) if c == '?' || c == text[t] => {
                p += 1;
                t += 1;
            }
            _ => match backtrack {
                Some((bp, bt)) => {
                    p = bp + 1;
                    t = bt + 1;
                    backtrack = Some((bp, bt + 1));
                }
                None => return false,
            },
        }
    }

    pattern[p..].iter().all(|&c| c == '*')
}

#[async_trait]
impl StoreBackend for MemoryBackend {
    async fn get(&self, key: &str) -> Result<Option<String>, BackendError> {
        let now = self.enter().await?;
        Ok(self.live(key, now).map(|e| e.value))
    }

    async fn set(&self, key: &str, value: &str, ttl: Duration) -> Result<(), BackendError> {
        self.enter().await?;
        self.entries
            .insert(key.to_string(), Entry::new(value.to_string(), ttl));
        Ok(())
    }

    async fn del(&self, key: &str) -> Result<bool, BackendError> {
        let now = self.enter().await?;
        Ok(self
            .entries
            .remove(key)
            .is_some_and(|(_, e)| !e.is_expired(now)))
    }

    async fn exists(&self, key: &str) -> Result<bool, BackendError> {
        let now = self.enter().await?;
        Ok(self.live(key, now).is_some())
    }

    async fn ttl(&self, key: &str) -> Result<Ttl, BackendError> {
        let now = self.enter().await?;
        Ok(match self.live(key, now) {
            None => Ttl::Missing,
            Some(Entry { expires_at: None, .. }) => Ttl::Persistent,
            Some(Entry { expires_at: Some(at), .. }) => Ttl::Expires(at - now),
        })
    }

    async fn incr_expire(&self, key: &str, ttl: Duration) -> Result<i64, BackendError> {
        let now = self.enter().await?;

        // The entry guard holds the shard lock for the whole read-modify-write.
        match self.entries.entry(key.to_string()) {
            MapEntry::Occupied(mut occupied) => {
                let current = if occupied.get().is_expired(now) {
                    0
                } else {
                    occupied.get().value.parse::<i64>().map_err(|_| {
                        BackendError::BadRequest(format!("value at {key} is not an integer"))
                    })?
                };
                let next = current + 1;
                occupied.insert(Entry::new(next.to_string(), ttl));
                Ok(next)
            }
            MapEntry::Vacant(vacant) => {
                vacant.insert(Entry::new("1".to_string(), ttl));
                Ok(1)
            }
        }
    }

    async fn keys(&self, pattern: &str) -> Result<Vec<String>, BackendError> {
        let now = self.enter().await?;
        self.purge_expired(now);
        let mut keys: Vec<String> = self
            .entries
            .iter()
            .filter(|e| glob_match(pattern, e.key()))
            .map(|e| e.key().clone())
            .collect();
        keys.sort();
        Ok(keys)
    }

    async fn flush(&self) -> Result<(), BackendError> {
        self.enter().await?;
        self.entries.clear();
        Ok(())
    }

    async fn ping(&self) -> Result<(), BackendError> {
        self.enter().await?;
        Ok(())
    }
}
