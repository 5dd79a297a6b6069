use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use dashmap::DashMap;
use tokio::sync::{broadcast, Mutex, RwLock};
use uuid::Uuid;

use crate::error::{LockError, QueueError, StoreError};
use crate::traits::{LockBackend, LockOps, QueueBackend, StoreBackend};
use crate::types::LockGuard;

const CHANNEL_CAPACITY: usize = 256;

#[derive(Debug, Clone)]
struct StoreEntry {
    value: String,
    expires_at: Option<Instant>,
}

impl StoreEntry {
    fn is_live(&self, now: Instant) -> bool {
        self.expires_at.map_or(true, |exp| now < exp)
    }
}

/// In-process store backend. Cloning shares the underlying state, so several
/// components in one test can act as independent processes against a single
/// store.
#[derive(Debug, Clone, Default)]
pub struct MemoryStore {
    data: Arc<RwLock<HashMap<String, StoreEntry>>>,
    channels: Arc<DashMap<String, broadcast::Sender<String>>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn sender(&self, channel: &str) -> broadcast::Sender<String> {
        self.channels
            .entry(channel.to_string())
            .or_insert_with(|| broadcast::channel(CHANNEL_CAPACITY).0)
            .clone()
    }
}

#[async_trait]
impl StoreBackend for MemoryStore {
    async fn get(&self, key: &str) -> Result<Option<String>, StoreError> {
        let data = self.data.read().await;
        match data.get(key) {
            Some(entry) if entry.is_live(Instant::now()) => Ok(Some(entry.value.clone())),
            Some(_) => {
                drop(data);
                let mut data = self.data.write().await;
                data.remove(key);
                Ok(None)
            }
            None => Ok(None),
        }
    }

    async fn set(
        &self,
        key: &str,
        value: &str,
        ttl: Option<Duration>,
    ) -> Result<(), StoreError> {
        let mut data = self.data.write().await;
        data.insert(
            key.to_string(),
            StoreEntry {
                value: value.to_string(),
                expires_at: ttl.map(|d| Instant::now() + d),
            },
        );
        Ok(())
    }

    async fn del(&self, key: &str) -> Result<bool, StoreError> {
        let mut data = self.data.write().await;
        Ok(data.remove(key).is_some())
    }

    async fn keys(&self, prefix: &str) -> Result<Vec<String>, StoreError> {
        let data = self.data.read().await;
        let now = Instant::now();

        let mut keys: Vec<_> = data
            .iter()
            .filter(|(k, entry)| k.starts_with(prefix) && entry.is_live(now))
            .map(|(k, _)| k.clone())
            .collect();

        keys.sort();
        Ok(keys)
    }

    async fn publish(&self, channel: &str, payload: &str) -> Result<(), StoreError> {
        // A send error only means nobody is listening.
        let _ = self.sender(channel).send(payload.to_string());
        Ok(())
    }

    async fn subscribe(&self, channel: &str) -> Result<broadcast::Receiver<String>, StoreError> {
        Ok(self.sender(channel).subscribe())
    }
}

/// In-process queue backend with blocking pop.
#[derive(Debug, Clone, Default)]
pub struct MemoryQueue {
    queues: Arc<Mutex<HashMap<String, VecDeque<String>>>>,
}

impl MemoryQueue {
    pub fn new() -> Self {
        Self::default()
    }

    async fn try_pop(&self, queue: &str) -> Option<String> {
        let mut queues = self.queues.lock().await;
        queues.get_mut(queue).and_then(VecDeque::pop_front)
    }
}

#[async_trait]
impl QueueBackend for MemoryQueue {
    async fn push(&self, queue: &str, payload: &str) -> Result<(), QueueError> {
        let mut queues = self.queues.lock().await;
        queues
            .entry(queue.to_string())
            .or_default()
            .push_back(payload.to_string());
        Ok(())
    }

    async fn pop(&self, queue: &str, timeout: Duration) -> Result<Option<String>, QueueError> {
        let deadline = Instant::now() + timeout;

        loop {
            if let Some(payload) = self.try_pop(queue).await {
                return Ok(Some(payload));
            }
            if Instant::now() >= deadline {
                return Ok(None);
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    }
}

#[derive(Debug, Clone)]
struct LockEntry {
    token: String,
    expires_at: Instant,
}

#[derive(Debug, Default)]
struct MemoryLock {
    locks: Mutex<HashMap<String, LockEntry>>,
}

/// In-process lock backend with the same token semantics as the Valkey one.
#[derive(Debug, Clone, Default)]
pub struct MemoryLockProvider {
    inner: Arc<MemoryLock>,
}

impl MemoryLockProvider {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl LockOps for MemoryLockProvider {
    async fn release(&self, resource: &str, token: &str) -> Result<(), LockError> {
        let mut locks = self.inner.locks.lock().await;
        match locks.get(resource) {
            Some(entry) if entry.token == token => {
                locks.remove(resource);
                Ok(())
            }
            Some(_) => Err(LockError::NotHeld),
            None => Ok(()),
        }
    }

    async fn refresh(&self, resource: &str, token: &str, ttl: Duration) -> Result<(), LockError> {
        let mut locks = self.inner.locks.lock().await;
        match locks.get_mut(resource) {
            Some(entry) if entry.token == token => {
                entry.expires_at = Instant::now() + ttl;
                Ok(())
            }
            _ => Err(LockError::NotHeld),
        }
    }
}

#[async_trait]
impl LockBackend for MemoryLockProvider {
    async fn try_acquire(
        &self,
        resource: &str,
        ttl: Duration,
    ) -> Result<Option<LockGuard>, LockError> {
        let mut locks = self.inner.locks.lock().await;
        let now = Instant::now();

        if let Some(entry) = locks.get(resource) {
            if entry.expires_at > now {
                return Ok(None);
            }
        }

        let token = Uuid::new_v4().to_string();
        locks.insert(
            resource.to_string(),
            LockEntry {
                token: token.clone(),
                expires_at: now + ttl,
            },
        );
        drop(locks);

        Ok(Some(LockGuard::new(
            resource.to_string(),
            token,
            Arc::new(self.clone()) as Arc<dyn LockOps>,
        )))
    }

    async fn acquire(
        &self,
        resource: &str,
        ttl: Duration,
        wait: Duration,
    ) -> Result<LockGuard, LockError> {
        let deadline = Instant::now() + wait;

        loop {
            if let Some(guard) = self.try_acquire(resource, ttl).await? {
                return Ok(guard);
            }
            if Instant::now() >= deadline {
                return Err(LockError::Timeout);
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn store_basic_operations() {
        let store = MemoryStore::new();

        assert!(store.get("key1").await.unwrap().is_none());

        store.set("key1", "value1", None).await.unwrap();
        assert_eq!(
            store.get("key1").await.unwrap(),
            Some("value1".to_string())
        );

        assert!(store.del("key1").await.unwrap());
        assert!(store.get("key1").await.unwrap().is_none());
        assert!(!store.del("key1").await.unwrap());
    }

    #[tokio::test]
    async fn store_ttl_expiry() {
        let store = MemoryStore::new();

        store
            .set("key1", "value1", Some(Duration::from_millis(50)))
            .await
            .unwrap();
        assert!(store.get("key1").await.unwrap().is_some());

        tokio::time::sleep(Duration::from_millis(60)).await;
        assert!(store.get("key1").await.unwrap().is_none());
        assert!(store.keys("key").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn store_keys_by_prefix() {
        let store = MemoryStore::new();

        store.set("svc:auth:1", "a", None).await.unwrap();
        store.set("svc:auth:2", "b", None).await.unwrap();
        store.set("svc:users:1", "c", None).await.unwrap();
        store.set("other:1", "d", None).await.unwrap();

        let keys = store.keys("svc:auth:").await.unwrap();
        assert_eq!(keys, vec!["svc:auth:1", "svc:auth:2"]);

        let keys = store.keys("svc:").await.unwrap();
        assert_eq!(keys.len(), 3);
    }

    #[tokio::test]
    async fn publish_reaches_all_subscribers() {
        let store = MemoryStore::new();

        let mut rx1 = store.subscribe("events").await.unwrap();
        let mut rx2 = store.subscribe("events").await.unwrap();

        store.publish("events", "hello").await.unwrap();

        assert_eq!(rx1.recv().await.unwrap(), "hello");
        assert_eq!(rx2.recv().await.unwrap(), "hello");
    }

    #[tokio::test]
    async fn publish_without_subscribers_is_ok() {
        let store = MemoryStore::new();
        store.publish("events", "nobody home").await.unwrap();
    }

    #[tokio::test]
    async fn clones_share_state() {
        let store = MemoryStore::new();
        let other = store.clone();

        store.set("shared", "yes", None).await.unwrap();
        assert_eq!(other.get("shared").await.unwrap(), Some("yes".to_string()));
    }

    #[tokio::test]
    async fn queue_push_pop_order() {
        let queue = MemoryQueue::new();

        queue.push("q", "first").await.unwrap();
        queue.push("q", "second").await.unwrap();

        let timeout = Duration::from_millis(100);
        assert_eq!(
            queue.pop("q", timeout).await.unwrap(),
            Some("first".to_string())
        );
        assert_eq!(
            queue.pop("q", timeout).await.unwrap(),
            Some("second".to_string())
        );
        assert_eq!(queue.pop("q", Duration::from_millis(30)).await.unwrap(), None);
    }

    #[tokio::test]
    async fn queue_pop_waits_for_push() {
        let queue = MemoryQueue::new();
        let producer = queue.clone();

        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(30)).await;
            producer.push("q", "late").await.unwrap();
        });

        let got = queue.pop("q", Duration::from_secs(1)).await.unwrap();
        assert_eq!(got, Some("late".to_string()));
    }

    #[tokio::test]
    async fn lock_mutual_exclusion() {
        let lock = MemoryLockProvider::new();

        let guard = lock
            .try_acquire("svc", Duration::from_secs(10))
            .await
            .unwrap()
            .unwrap();

        assert!(lock
            .try_acquire("svc", Duration::from_secs(10))
            .await
            .unwrap()
            .is_none());

        guard.release().await.unwrap();

        assert!(lock
            .try_acquire("svc", Duration::from_secs(10))
            .await
            .unwrap()
            .is_some());
    }

    #[tokio::test]
    async fn lock_expires_without_release() {
        let lock = MemoryLockProvider::new();

        let _guard = lock
            .try_acquire("svc", Duration::from_millis(40))
            .await
            .unwrap()
            .unwrap();

        tokio::time::sleep(Duration::from_millis(50)).await;

        assert!(lock
            .try_acquire("svc", Duration::from_secs(10))
            .await
            .unwrap()
            .is_some());
    }

    #[tokio::test]
    async fn acquire_times_out() {
        let lock = MemoryLockProvider::new();

        let _guard = lock
            .try_acquire("svc", Duration::from_secs(30))
            .await
            .unwrap()
            .unwrap();

        let result = lock
            .acquire("svc", Duration::from_secs(30), Duration::from_millis(120))
            .await;

        assert!(matches!(result, Err(LockError::Timeout)));
    }
}
