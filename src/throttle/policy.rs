//! What a store failure means at a call site.

use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::error::Result;

/// How to treat a throttling decision that could not be made.
///
/// Throttler operations surface store and circuit failures as errors; a
/// caller that needs a yes/no answer picks a policy instead of guessing.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailurePolicy {
    /// Treat the request as not throttled
    #[default]
    FailOpen,
    /// Treat the request as throttled
    FailClosed,
}

impl FailurePolicy {
    /// The decision to act on when a throttler call fails.
    pub fn on_failure(&self) -> bool {
        matches!(self, FailurePolicy::FailClosed)
    }

    /// Collapse a throttler result into a decision.
    pub fn resolve(&self, result: Result<bool>) -> bool {
        match result {
            Ok(throttled) => throttled,
            Err(e) => {
                let throttled = self.on_failure();
                warn!(
                    error = %e,
                    circuit_open = e.is_circuit_open(),
                    policy = ?self,
                    throttled = throttled,
                    "Throttling decision unavailable, applying failure policy"
                );
                throttled
            }
        }
    }
}
