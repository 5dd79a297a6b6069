//! Shared state backends for beacon.
//!
//! Provides the registry store abstraction (TTL'd key-value entries plus
//! pub/sub channels), a named-queue backend used by the RPC transport, and a
//! best-effort distributed lock. Backends exist for in-process memory (tests
//! and dev mode) and Valkey/Redis (production).

mod error;
mod traits;
mod types;

#[cfg(feature = "memory")]
mod memory;

#[cfg(feature = "valkey")]
mod valkey;

pub use error::{LockError, QueueError, StoreError};
pub use traits::{LockBackend, LockOps, QueueBackend, StoreBackend};
pub use types::LockGuard;

#[cfg(feature = "memory")]
pub use memory::{MemoryLockProvider, MemoryQueue, MemoryStore};

#[cfg(feature = "valkey")]
pub use valkey::{ValkeyLockProvider, ValkeyQueue, ValkeyStore};
