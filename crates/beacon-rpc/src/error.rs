use thiserror::Error;

#[derive(Debug, Error)]
pub enum RpcError {
    /// The downstream service did not reply within the deadline.
    #[error("RPC call timed out")]
    Timeout,

    /// Connection-level failure in the underlying queue backend.
    #[error("Transport error: {0}")]
    Transport(String),

    #[error("Serialisation error: {0}")]
    Serialisation(String),
}

impl From<beacon_state::QueueError> for RpcError {
    fn from(err: beacon_state::QueueError) -> Self {
        Self::Transport(err.to_string())
    }
}
