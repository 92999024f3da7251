//! Admission control with escalating timeouts.
//!
//! This module provides:
//! - Identity scopes and the store key layout
//! - Timeout records and their wire encoding
//! - A tracker for per-identity counters and timeouts
//! - The throttler deciding whether an operation may proceed
//! - A registry of named throttlers and a failure policy for callers

mod identity;
mod policy;
mod registry;
mod throttler;
mod timeout;
mod tracker;

pub use identity::{Id, KeyLayout, Kind};
pub use policy::FailurePolicy;
pub use registry::LimiterRegistry;
pub use throttler::{Details, Throttler, ThrottlerConfig};
pub use timeout::Timeout;
pub use tracker::RateLimitTracker;
