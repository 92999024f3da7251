//! Store client that runs every backend call under a circuit breaker.

use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;
use tracing::warn;

use super::backend::{BackendError, StoreBackend, Ttl};
use super::breaker::{
    BreakerConfig, BreakerError, BreakerStats, CircuitBreaker, CircuitState, Failure,
};

/// Errors returned by [`StoreClient`].
#[derive(Debug, Error)]
pub enum StoreError {
    /// The key does not exist. An expected outcome, not a fault.
    #[error("key not found: {key}")]
    NotFound { key: String },

    /// The breaker is open; the store was not contacted.
    #[error("circuit breaker is open")]
    CircuitOpen,

    /// Too many store calls were already in flight.
    #[error("store overloaded: {limit} calls in flight")]
    Overloaded { limit: usize },

    /// The store did not answer within the breaker deadline.
    #[error("{op} timed out after {after:?}")]
    Timeout { op: &'static str, after: Duration },

    /// The backend reported an error.
    #[error("{op} failed: {source}")]
    Backend {
        op: &'static str,
        #[source]
        source: BackendError,
    },

    /// A stored value could not be decoded.
    #[error("malformed value at {key}: {detail}")]
    Malformed { key: String, detail: String },
}

impl StoreError {
    /// Whether the error only signals an absent key.
    pub fn is_not_found(&self) -> bool {
        matches!(self, StoreError::NotFound { .. })
    }

    /// Whether the call was short-circuited by an open breaker.
    pub fn is_circuit_open(&self) -> bool {
        matches!(self, StoreError::CircuitOpen)
    }

    /// Whether the error reflects store health (I/O, timeouts, backpressure).
    pub fn is_fault(&self) -> bool {
        match self {
            StoreError::Timeout { .. } | StoreError::Overloaded { .. } => true,
            StoreError::Backend { source, .. } => !source.is_bad_request(),
            _ => false,
        }
    }

    fn from_breaker(op: &'static str, err: BreakerError<BackendError>) -> Self {
        match err {
            BreakerError::Open => StoreError::CircuitOpen,
            BreakerError::ConcurrencyLimit(limit) => StoreError::Overloaded { limit },
            BreakerError::Timeout(after) => StoreError::Timeout { op, after },
            BreakerError::Inner(source) => StoreError::Backend { op, source },
        }
    }
}

impl Failure for BackendError {
    fn counts_as_failure(&self) -> bool {
        !self.is_bad_request()
    }
}

/// A cloneable handle to a backend guarded by a circuit breaker.
///
/// Clones share the same backend and breaker, so every limiter built on one
/// client shares one failure budget.
#[derive(Clone)]
pub struct StoreClient {
    backend: Arc<dyn StoreBackend>,
    breaker: Arc<CircuitBreaker>,
}

impl std::fmt::Debug for StoreClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StoreClient")
            .field("breaker", &self.breaker.name())
            .field("state", &self.breaker.state())
            .finish()
    }
}

impl StoreClient {
    /// Create a client over `backend` with a breaker named `name`.
    pub fn new(
        name: &str,
        backend: Arc<dyn StoreBackend>,
        config: BreakerConfig,
    ) -> crate::error::Result<Self> {
        let breaker = CircuitBreaker::new(name, config)
            .map_err(|e| crate::error::GatekeeperError::Config(format!("breaker {name}: {e}")))?;

        Ok(Self {
            backend,
            breaker: Arc::new(breaker),
        })
    }

    /// The breaker guarding this client.
    pub fn breaker(&self) -> &CircuitBreaker {
        &self.breaker
    }

    /// Current breaker state.
    pub fn circuit_state(&self) -> CircuitState {
        self.breaker.state()
    }

    /// Breaker outcome counters.
    pub fn breaker_stats(&self) -> BreakerStats {
        self.breaker.stats()
    }

    async fn run<T, F, Fut>(&self, op: &'static str, key: &str, f: F) -> Result<T, StoreError>
    where
        F: FnOnce(Arc<dyn StoreBackend>) -> Fut,
        Fut: std::future::Future<Output = Result<T, BackendError>>,
    {
        let backend = self.backend.clone();
        self.breaker.call(|| f(backend)).await.map_err(|e| {
            let err = StoreError::from_breaker(op, e);
            warn!(op = op, key = %key, error = %err, "Store call failed");
            err
        })
    }

    /// Read a string value. A missing key is [`StoreError::NotFound`].
    pub async fn get(&self, key: &str) -> Result<String, StoreError> {
        let owned = key.to_string();
        let value = self
            .run("get", key, |b| async move { b.get(&owned).await })
            .await?;
        value.ok_or_else(|| StoreError::NotFound {
            key: key.to_string(),
        })
    }

    /// Read an integer value.
    pub async fn get_i64(&self, key: &str) -> Result<i64, StoreError> {
        let value = self.get(key).await?;
        value.parse().map_err(|_| StoreError::Malformed {
            key: key.to_string(),
            detail: format!("expected integer, got {value:?}"),
        })
    }

    /// Read a `0`/`1` flag.
    pub async fn get_bool(&self, key: &str) -> Result<bool, StoreError> {
        match self.get(key).await?.as_str() {
            "0" => Ok(false),
            "1" => Ok(true),
            other => Err(StoreError::Malformed {
                key: key.to_string(),
                detail: format!("expected 0 or 1, got {other:?}"),
            }),
        }
    }

    /// Write a string value with `ttl` (zero for no expiry).
    pub async fn set(&self, key: &str, value: &str, ttl: Duration) -> Result<(), StoreError> {
        let (owned, value) = (key.to_string(), value.to_string());
        self.run("set", key, |b| async move { b.set(&owned, &value, ttl).await })
            .await
    }

    /// Delete a key, returning whether it existed.
    pub async fn del(&self, key: &str) -> Result<bool, StoreError> {
        let owned = key.to_string();
        self.run("del", key, |b| async move { b.del(&owned).await })
            .await
    }

    /// Check whether a key exists.
    pub async fn exists(&self, key: &str) -> Result<bool, StoreError> {
        let owned = key.to_string();
        self.run("exists", key, |b| async move { b.exists(&owned).await })
            .await
    }

    /// Query the remaining lifetime of a key.
    pub async fn ttl(&self, key: &str) -> Result<Ttl, StoreError> {
        let owned = key.to_string();
        self.run("ttl", key, |b| async move { b.ttl(&owned).await })
            .await
    }

    /// Atomically increment a counter and reset its expiry to `ttl`.
    pub async fn incr_expire(&self, key: &str, ttl: Duration) -> Result<i64, StoreError> {
        let owned = key.to_string();
        self.run("incr_expire", key, |b| async move {
            b.incr_expire(&owned, ttl).await
        })
        .await
    }

    /// List keys matching a glob pattern. Diagnostic use only.
    pub async fn keys(&self, pattern: &str) -> Result<Vec<String>, StoreError> {
        let owned = pattern.to_string();
        self.run("keys", pattern, |b| async move { b.keys(&owned).await })
            .await
    }

    /// Remove every key. Diagnostic and test use only.
    pub async fn flush(&self) -> Result<(), StoreError> {
        self.run("flush", "*", |b| async move { b.flush().await })
            .await
    }

    /// Round-trip check through the breaker.
    pub async fn ping(&self) -> Result<(), StoreError> {
        self.run("ping", "", |b| async move { b.ping().await }).await
    }
}
