//! Key/value backend trait for abstracting Redis and in-memory stores.

use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;

/// Remaining lifetime of a key as reported by the store.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Ttl {
    /// The key does not exist.
    Missing,
    /// The key exists and never expires.
    Persistent,
    /// The key expires after the given duration.
    Expires(Duration),
}

impl Ttl {
    /// Decode a Redis `PTTL` reply.
    pub fn from_pttl(millis: i64) -> Self {
        match millis {
            -2 => Ttl::Missing,
            m if m < 0 => Ttl::Persistent,
            m => Ttl::Expires(Duration::from_millis(m as u64)),
        }
    }

    /// The remaining duration, if the key expires.
    pub fn remaining(&self) -> Option<Duration> {
        match self {
            Ttl::Expires(d) => Some(*d),
            _ => None,
        }
    }
}

/// Errors raised by a backend.
#[derive(Debug, Error)]
pub enum BackendError {
    /// Error returned by the Redis client.
    #[error("redis error: {0}")]
    Redis(#[from] redis::RedisError),

    /// The backend could not be reached.
    #[error("backend unavailable: {0}")]
    Unavailable(String),

    /// The backend answered but the operation does not apply to the stored value.
    #[error("bad request: {0}")]
    BadRequest(String),
}

impl BackendError {
    /// Whether the error reflects a caller mistake rather than backend health.
    ///
    /// Bad requests are returned to the caller but never trip the breaker.
    pub fn is_bad_request(&self) -> bool {
        match self {
            BackendError::Redis(e) => matches!(
                e.kind(),
                redis::ErrorKind::TypeError | redis::ErrorKind::ResponseError
            ),
            BackendError::Unavailable(_) => false,
            BackendError::BadRequest(_) => true,
        }
    }
}

/// Operations every backing store has to provide.
///
/// Misses are expressed in the reply type (`None`, `false`, [`Ttl::Missing`]),
/// never as errors.
#[async_trait]
pub trait StoreBackend: Send + Sync {
    /// Read a string value.
    async fn get(&self, key: &str) -> Result<Option<String>, BackendError>;

    /// Write a string value. A zero `ttl` stores the value without expiry.
    async fn set(&self, key: &str, value: &str, ttl: Duration) -> Result<(), BackendError>;

    /// Delete a key, returning whether it existed.
    async fn del(&self, key: &str) -> Result<bool, BackendError>;

    /// Check whether a key exists.
    async fn exists(&self, key: &str) -> Result<bool, BackendError>;

    /// Query the remaining lifetime of a key.
    async fn ttl(&self, key: &str) -> Result<Ttl, BackendError>;

    /// Increment a counter and set its expiry to `ttl` in one atomic step.
    ///
    /// Returns the counter value after the increment.
    async fn incr_expire(&self, key: &str, ttl: Duration) -> Result<i64, BackendError>;

    /// List keys matching a glob pattern.
    async fn keys(&self, pattern: &str) -> Result<Vec<String>, BackendError>;

    /// Remove every key.
    async fn flush(&self) -> Result<(), BackendError>;

    /// Round-trip check.
    async fn ping(&self) -> Result<(), BackendError>;
}
