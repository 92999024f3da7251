//! Error types for Gatekeeper.

use thiserror::Error;

use crate::store::StoreError;

/// Main error type for Gatekeeper operations.
#[derive(Error, Debug)]
pub enum GatekeeperError {
    /// Configuration-related errors
    #[error("Configuration error: {0}")]
    Config(String),

    /// A store operation failed outside of any throttler operation
    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    /// A throttler operation failed; `op` names the operation
    #[error("{op}: {source}")]
    Throttle {
        op: &'static str,
        #[source]
        source: StoreError,
    },

    /// I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl GatekeeperError {
    pub(crate) fn throttle(op: &'static str, source: StoreError) -> Self {
        GatekeeperError::Throttle { op, source }
    }

    /// The underlying store error, if any.
    pub fn store_error(&self) -> Option<&StoreError> {
        match self {
            GatekeeperError::Store(e) | GatekeeperError::Throttle { source: e, .. } => Some(e),
            _ => None,
        }
    }

    /// Whether the failure came from an open circuit rather than the store itself.
    pub fn is_circuit_open(&self) -> bool {
        self.store_error().is_some_and(StoreError::is_circuit_open)
    }
}

/// Result type alias for Gatekeeper operations.
pub type Result<T> = std::result::Result<T, GatekeeperError>;
