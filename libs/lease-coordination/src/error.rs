//! Error types for lease coordination operations.
//!
//! Lost compare-and-set races are not errors: they surface as `Ok(false)`
//! from the store. The variants here separate failures that leave ownership
//! unknown (transport, timeout) from ones that are definitive.

use thiserror::Error;

/// Failures of store, liveness and lease operations.
#[derive(Debug, Error)]
pub enum CoordinationError {
    /// The store could not be reached or the request failed in flight.
    #[error("store transport: {0}")]
    Transport(String),

    /// A store call did not complete within `store_timeout`.
    #[error("store timeout: {0}")]
    Timeout(String),

    /// A record could not be encoded or decoded.
    #[error("record codec: {0}")]
    Codec(String),

    /// Invalid settings, or a session list that could not be loaded.
    #[error("invalid config: {0}")]
    Config(String),

    /// No open connection to the store.
    #[error("store not connected: {0}")]
    NotConnected(String),

    /// The node has no unexpired liveness record.
    #[error("node offline: {0}")]
    NodeOffline(String),

    /// The store answered with something we did not expect.
    #[error("protocol error: {0}")]
    Protocol(String),
}

impl CoordinationError {
    /// Ownership is unknown after this error; a holder goes Uncertain
    /// instead of releasing.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            CoordinationError::Transport(_)
                | CoordinationError::Timeout(_)
                | CoordinationError::NotConnected(_)
        )
    }

    /// The store call hit `store_timeout`.
    pub fn is_timeout(&self) -> bool {
        matches!(self, CoordinationError::Timeout(_))
    }

    /// Returns true if the error means a node is not live.
    pub fn is_offline(&self) -> bool {
        matches!(self, CoordinationError::NodeOffline(_))
    }
}

/// Shorthand result alias for coordination operations.
pub type CoordinationResult<T> = Result<T, CoordinationError>;
