//! Resilient key/value store access.
//!
//! Every call goes through a [`CircuitBreaker`] so that a slow or failing
//! store makes callers fail fast instead of piling up behind it. Key misses
//! are part of the reply types and never count as failures.

mod backend;
mod breaker;
mod client;
mod memory;
mod redis;

pub use backend::{BackendError, StoreBackend, Ttl};
pub use breaker::{
    BreakerConfig, BreakerError, BreakerStats, CircuitBreaker, CircuitState, Failure,
};
pub use client::{StoreClient, StoreError};
pub use memory::MemoryBackend;
pub use self::redis::RedisBackend;
