//! Per-identity attempt counters and timeout records in the store.

use std::time::Duration;

use tracing::trace;

use super::identity::{Id, Kind, KeyLayout};
use super::timeout::Timeout;
use crate::store::{StoreClient, StoreError, Ttl};

/// Maps identities onto store records and exposes atomic primitives on them.
///
/// The tracker keeps no state of its own; concurrent callers are serialized
/// only by the store.
#[derive(Debug, Clone)]
pub struct RateLimitTracker {
    store: StoreClient,
    layout: KeyLayout,
    /// TTL applied to the attempt counter on every increment
    attempt_window: Duration,
    /// TTL applied to timeout records
    timeout_expiration: Duration,
}

impl RateLimitTracker {
    /// Create a tracker for the `key_type` namespace.
    pub fn new(
        store: StoreClient,
        key_type: impl Into<String>,
        attempt_window: Duration,
        timeout_expiration: Duration,
    ) -> Self {
        Self {
            store,
            layout: KeyLayout::new(key_type),
            attempt_window,
            timeout_expiration,
        }
    }

    /// The key layout of this tracker.
    pub fn layout(&self) -> &KeyLayout {
        &self.layout
    }

    /// The store this tracker writes to.
    pub fn store(&self) -> &StoreClient {
        &self.store
    }

    /// Count one attempt and refresh the counter TTL to the attempt window.
    ///
    /// Increment and expiry happen in one atomic store operation.
    pub async fn incr_attempts(&self, id: &Id) -> Result<i64, StoreError> {
        let key = self.layout.attempts_key(id);
        let count = self.store.incr_expire(&key, self.attempt_window).await?;
        trace!(key = %key, count = count, "Incremented attempts");
        Ok(count)
    }

    /// Current attempt count; zero when no counter exists.
    pub async fn get_attempts(&self, id: &Id) -> Result<i64, StoreError> {
        match self.store.get_i64(&self.layout.attempts_key(id)).await {
            Ok(count) => Ok(count),
            Err(e) if e.is_not_found() => Ok(0),
            Err(e) => Err(e),
        }
    }

    /// Delete the attempt counter, returning whether one existed.
    pub async fn reset_attempts(&self, id: &Id) -> Result<bool, StoreError> {
        self.store.del(&self.layout.attempts_key(id)).await
    }

    /// The last recorded timeout, or the zero value if there is none.
    pub async fn last_timeout(&self, id: &Id) -> Result<Timeout, StoreError> {
        let key = self.layout.timeout_key(id);
        match self.store.get(&key).await {
            Ok(value) => {
                Timeout::decode(&value).map_err(|detail| StoreError::Malformed { key, detail })
            }
            Err(e) if e.is_not_found() => Ok(Timeout::default()),
            Err(e) => Err(e),
        }
    }

    /// Persist a timeout record. Concurrent writers for one identity race; last write wins.
    pub async fn set_timeout(&self, id: &Id, timeout: &Timeout) -> Result<(), StoreError> {
        let key = self.layout.timeout_key(id);
        self.store
            .set(&key, &timeout.encode(), self.timeout_expiration)
            .await
    }

    /// Delete the timeout record.
    pub async fn reset_timeout(&self, id: &Id) -> Result<(), StoreError> {
        self.store.del(&self.layout.timeout_key(id)).await?;
        Ok(())
    }

    /// Remaining lifetime of one of the records of `id`.
    pub async fn expires_at(&self, id: &Id, kind: Kind) -> Result<Ttl, StoreError> {
        self.store.ttl(&self.layout.key(id, kind)).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::{BreakerConfig, MemoryBackend, StoreBackend};
    use chrono::Utc;
    use std::sync::Arc;

    fn tracker(attempt_window: Duration) -> (Arc<MemoryBackend>, RateLimitTracker) {
        let backend = Arc::new(MemoryBackend::new());
        let store = StoreClient::new("test", backend.clone(), BreakerConfig::default()).unwrap();
        let tracker = RateLimitTracker::new(store, "test_key", attempt_window, Duration::from_secs(60));
        (backend, tracker)
    }

    #[tokio::test]
    async fn test_incr_attempts_counts_consecutively() {
        let (_, tracker) = tracker(Duration::from_secs(60));
        let id = Id::ip("1.1.1.1");

        for expected in 1..=10 {
            assert_eq!(tracker.incr_attempts(&id).await.unwrap(), expected);
        }
        assert_eq!(tracker.get_attempts(&id).await.unwrap(), 10);
    }

    #[tokio::test]
    async fn test_incr_attempts_refreshes_window() {
        let (_, tracker) = tracker(Duration::from_millis(100));
        let id = Id::ip("1.1.1.1");

        tracker.incr_attempts(&id).await.unwrap();
        tokio::time::sleep(Duration::from_millis(60)).await;
        // Still inside the window, and the TTL restarts
        assert_eq!(tracker.incr_attempts(&id).await.unwrap(), 2);
        tokio::time::sleep(Duration::from_millis(60)).await;
        assert_eq!(tracker.incr_attempts(&id).await.unwrap(), 3);

        tokio::time::sleep(Duration::from_millis(150)).await;
        assert_eq!(tracker.incr_attempts(&id).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_incr_attempts_sets_ttl_to_window() {
        let (_, tracker) = tracker(Duration::from_secs(300));
        let id = Id::ip("1.1.1.1");
        tracker.incr_attempts(&id).await.unwrap();

        let ttl = tracker.expires_at(&id, Kind::Attempts).await.unwrap();
        let remaining = ttl.remaining().unwrap();
        assert!(remaining > Duration::from_secs(299));
        assert!(remaining <= Duration::from_secs(300));
    }

    #[tokio::test]
    async fn test_get_attempts_without_counter_is_zero() {
        let (_, tracker) = tracker(Duration::from_secs(60));
        assert_eq!(tracker.get_attempts(&Id::ip("9.9.9.9")).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_reset_attempts() {
        let (_, tracker) = tracker(Duration::from_secs(60));
        let id = Id::ip("1.1.1.1");
        tracker.incr_attempts(&id).await.unwrap();

        assert!(tracker.reset_attempts(&id).await.unwrap());
        assert!(!tracker.reset_attempts(&id).await.unwrap());
        assert_eq!(tracker.incr_attempts(&id).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_timeout_roundtrip_through_store() {
        let (backend, tracker) = tracker(Duration::from_secs(60));
        let id = Id::ip("1.1.1.1");

        assert!(tracker.last_timeout(&id).await.unwrap().is_empty());

        let timeout = Timeout::new(Utc::now(), Duration::from_secs(5));
        tracker.set_timeout(&id, &timeout).await.unwrap();
        assert_eq!(tracker.last_timeout(&id).await.unwrap(), timeout);

        let stored = backend
            .get("test_key/ip/{1.1.1.1}/timeout")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(stored, timeout.encode());

        // Records expire with the configured maximum timeout
        let ttl = tracker.expires_at(&id, Kind::Timeout).await.unwrap();
        assert!(ttl.remaining().unwrap() > Duration::from_secs(59));

        tracker.reset_timeout(&id).await.unwrap();
        assert!(tracker.last_timeout(&id).await.unwrap().is_empty());
        assert_eq!(tracker.expires_at(&id, Kind::Timeout).await.unwrap(), Ttl::Missing);
    }

    #[tokio::test]
    async fn test_malformed_timeout_is_reported() {
        let (backend, tracker) = tracker(Duration::from_secs(60));
        let id = Id::ip("1.1.1.1");
        backend
            .set("test_key/ip/{1.1.1.1}/timeout", "garbage", Duration::ZERO)
            .await
            .unwrap();

        let err = tracker.last_timeout(&id).await.unwrap_err();
        assert!(matches!(err, StoreError::Malformed { .. }));
    }

    #[tokio::test]
    async fn test_store_faults_propagate() {
        let (backend, tracker) = tracker(Duration::from_secs(60));
        backend.set_fault(Some("down"));
        let id = Id::ip("1.1.1.1");

        assert!(tracker.incr_attempts(&id).await.unwrap_err().is_fault());
        assert!(tracker.last_timeout(&id).await.unwrap_err().is_fault());
        assert!(tracker.get_attempts(&id).await.unwrap_err().is_fault());
    }
}
