use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::broadcast;

use crate::error::{LockError, QueueError, StoreError};
use crate::types::LockGuard;

/// Registry store: TTL'd string keys plus broadcast channels.
///
/// Values are JSON documents; the store itself treats them as opaque.
#[async_trait]
pub trait StoreBackend: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<String>, StoreError>;

    async fn set(
        &self,
        key: &str,
        value: &str,
        ttl: Option<Duration>,
    ) -> Result<(), StoreError>;

    async fn del(&self, key: &str) -> Result<bool, StoreError>;

    /// Lists all live keys starting with `prefix`.
    async fn keys(&self, prefix: &str) -> Result<Vec<String>, StoreError>;

    /// Publishes a payload on a channel. Fire-and-forget: no receivers is
    /// not an error.
    async fn publish(&self, channel: &str, payload: &str) -> Result<(), StoreError>;

    /// Subscribes to a channel. Missed messages while the receiver lags are
    /// dropped, matching at-most-once pub/sub semantics.
    async fn subscribe(&self, channel: &str) -> Result<broadcast::Receiver<String>, StoreError>;
}

/// Named queue with blocking pop, used for request/response RPC.
#[async_trait]
pub trait QueueBackend: Send + Sync {
    async fn push(&self, queue: &str, payload: &str) -> Result<(), QueueError>;

    /// Pops the oldest payload, waiting up to `timeout`. `None` on timeout.
    async fn pop(&self, queue: &str, timeout: Duration) -> Result<Option<String>, QueueError>;
}

#[async_trait]
pub trait LockBackend: Send + Sync {
    /// Single set-if-absent attempt.
    async fn try_acquire(
        &self,
        resource: &str,
        ttl: Duration,
    ) -> Result<Option<LockGuard>, LockError>;

    /// Retries `try_acquire` until `wait` elapses, then fails with
    /// [`LockError::Timeout`].
    async fn acquire(
        &self,
        resource: &str,
        ttl: Duration,
        wait: Duration,
    ) -> Result<LockGuard, LockError>;
}

#[async_trait]
pub trait LockOps: Send + Sync {
    async fn release(&self, resource: &str, token: &str) -> Result<(), LockError>;

    async fn refresh(&self, resource: &str, token: &str, ttl: Duration) -> Result<(), LockError>;
}
