use thiserror::Error;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("Connection error: {0}")]
    Connection(String),

    #[error("Serialisation error: {0}")]
    Serialisation(String),

    #[error("Backend error: {0}")]
    Backend(String),
}

#[derive(Debug, Error)]
pub enum QueueError {
    #[error("Connection error: {0}")]
    Connection(String),

    #[error("Backend error: {0}")]
    Backend(String),
}

#[derive(Debug, Error)]
pub enum LockError {
    #[error("Connection error: {0}")]
    Connection(String),

    #[error("Lock acquisition timed out")]
    Timeout,

    #[error("Lock not held or expired")]
    NotHeld,

    #[error("Backend error: {0}")]
    Backend(String),
}
