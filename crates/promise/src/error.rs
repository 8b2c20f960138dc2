//! Promise outcome errors.

use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;

/// Shared, cloneable rejection reason.
pub type Rejection = Arc<dyn std::error::Error + Send + Sync + 'static>;

/// Why a promise did not yield a value.
#[derive(Debug, Clone, Error)]
pub enum PromiseError {
    #[error("promise was cancelled")]
    Cancelled,

    #[error("promise was rejected: {0}")]
    Rejected(Rejection),

    #[error("timed out after {0:?} waiting for promise")]
    Timeout(Duration),
}

impl PromiseError {
    pub fn is_cancelled(&self) -> bool {
        matches!(self, Self::Cancelled)
    }
}

/// Plain-text rejection reason.
#[derive(Debug, Error)]
#[error("{0}")]
pub struct RejectionMessage(pub String);

/// Builds a [`Rejection`] from a message.
pub fn rejection(message: impl Into<String>) -> Rejection {
    Arc::new(RejectionMessage(message.into()))
}
