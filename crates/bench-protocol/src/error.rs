/// Error taxonomy shared by the control plane and its clients.

use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum BenchError {
    #[error("experiment {0} not found")]
    NotFound(String),

    #[error("experiment id {0} already exists")]
    DuplicateId(String),

    #[error("{0}")]
    InvalidState(String),

    #[error("invalid request: {0}")]
    InvalidRequest(String),

    /// An acknowledgement or completion for a run that no longer holds the slot.
    #[error("stale signal for experiment {id}: {reason}")]
    StaleSignal { id: String, reason: String },
}

impl BenchError {
    pub fn invalid_state(msg: impl Into<String>) -> Self {
        Self::InvalidState(msg.into())
    }

    pub fn stale(id: &str, reason: impl Into<String>) -> Self {
        Self::StaleSignal {
            id: id.to_string(),
            reason: reason.into(),
        }
    }
}
