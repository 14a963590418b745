//! Error types for the subscription core.

use thiserror::Error;

use crate::ports::BrokerError;

/// Errors returned by subscribe/unsubscribe operations.
#[derive(Debug, Clone, Error)]
pub enum SinkError {
    #[error(transparent)]
    Broker(#[from] BrokerError),

    /// Two primary names would resolve to the same internal name.
    #[error("metric '{primary}' resolves to '{internal}', which already belongs to '{existing}'")]
    NameConflict {
        primary: String,
        internal: String,
        existing: String,
    },

    /// The task running a subscription change panicked or was shut down.
    #[error("subscription task failed: {0}")]
    Interrupted(String),
}
