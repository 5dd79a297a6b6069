//! Valkey/Redis adapters for the store, queue, and lock backends.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashMap;
use deadpool_redis::{Config, Pool, Runtime};
use futures_util::StreamExt;
use redis::AsyncCommands;
use tokio::sync::broadcast;
use uuid::Uuid;

use crate::error::{LockError, QueueError, StoreError};
use crate::traits::{LockBackend, LockOps, QueueBackend, StoreBackend};
use crate::types::LockGuard;

const CHANNEL_CAPACITY: usize = 256;

async fn build_pool(url: &str, pool_size: usize) -> Result<Pool, String> {
    let config = Config::from_url(url);
    let pool = config
        .builder()
        .map_err(|e| e.to_string())?
        .max_size(pool_size)
        .runtime(Runtime::Tokio1)
        .build()
        .map_err(|e| e.to_string())?;

    // Test the connection
    let mut conn = pool.get().await.map_err(|e| e.to_string())?;
    redis::cmd("PING")
        .query_async::<String>(&mut *conn)
        .await
        .map_err(|e| e.to_string())?;

    Ok(pool)
}

/// Valkey/Redis store backend.
///
/// Keys carry a per-key TTL via `SET .. PX`; channels map onto native
/// PUBLISH/SUBSCRIBE, with one dedicated subscriber connection per channel
/// forwarding into a local broadcast fan-out.
#[derive(Clone)]
pub struct ValkeyStore {
    pool: Pool,
    client: redis::Client,
    subs: Arc<DashMap<String, broadcast::Sender<String>>>,
}

impl ValkeyStore {
    pub async fn new(url: &str, pool_size: usize) -> Result<Self, StoreError> {
        let pool = build_pool(url, pool_size)
            .await
            .map_err(StoreError::Connection)?;
        let client = redis::Client::open(url).map_err(|e| StoreError::Connection(e.to_string()))?;

        Ok(Self {
            pool,
            client,
            subs: Arc::new(DashMap::new()),
        })
    }

    fn spawn_subscriber(&self, channel: String, tx: broadcast::Sender<String>) {
        let client = self.client.clone();

        tokio::spawn(async move {
            loop {
                match client.get_async_pubsub().await {
                    Ok(mut pubsub) => match pubsub.subscribe(&channel).await {
                        Ok(()) => {
                            let mut stream = pubsub.on_message();
                            while let Some(msg) = stream.next().await {
                                match msg.get_payload::<String>() {
                                    Ok(payload) => {
                                        let _ = tx.send(payload);
                                    }
                                    Err(e) => {
                                        tracing::warn!(
                                            channel = %channel,
                                            error = %e,
                                            "Dropping undecodable pub/sub payload"
                                        );
                                    }
                                }
                            }
                        }
                        Err(e) => {
                            tracing::warn!(channel = %channel, error = %e, "Subscribe failed");
                        }
                    },
                    Err(e) => {
                        tracing::warn!(channel = %channel, error = %e, "Pub/sub connection failed");
                    }
                }

                if tx.receiver_count() == 0 {
                    break;
                }
                tokio::time::sleep(Duration::from_secs(1)).await;
            }
        });
    }
}

#[async_trait]
impl StoreBackend for ValkeyStore {
    async fn get(&self, key: &str) -> Result<Option<String>, StoreError> {
        let mut conn = self
            .pool
            .get()
            .await
            .map_err(|e| StoreError::Connection(e.to_string()))?;

        let value: Option<String> = conn
            .get(key)
            .await
            .map_err(|e| StoreError::Backend(e.to_string()))?;

        Ok(value)
    }

    async fn set(
        &self,
        key: &str,
        value: &str,
        ttl: Option<Duration>,
    ) -> Result<(), StoreError> {
        let mut conn = self
            .pool
            .get()
            .await
            .map_err(|e| StoreError::Connection(e.to_string()))?;

        match ttl {
            Some(duration) => {
                let millis = duration.as_millis().max(1) as u64;
                redis::cmd("SET")
                    .arg(key)
                    .arg(value)
                    .arg("PX")
                    .arg(millis)
                    .query_async::<()>(&mut *conn)
                    .await
                    .map_err(|e| StoreError::Backend(e.to_string()))?;
            }
            None => {
                conn.set::<_, _, ()>(key, value)
                    .await
                    .map_err(|e| StoreError::Backend(e.to_string()))?;
            }
        }

        Ok(())
    }

    async fn del(&self, key: &str) -> Result<bool, StoreError> {
        let mut conn = self
            .pool
            .get()
            .await
            .map_err(|e| StoreError::Connection(e.to_string()))?;

        let deleted: i64 = conn
            .del(key)
            .await
            .map_err(|e| StoreError::Backend(e.to_string()))?;

        Ok(deleted > 0)
    }

    async fn keys(&self, prefix: &str) -> Result<Vec<String>, StoreError> {
        let mut conn = self
            .pool
            .get()
            .await
            .map_err(|e| StoreError::Connection(e.to_string()))?;

        let mut keys: Vec<String> = redis::cmd("KEYS")
            .arg(format!("{prefix}*"))
            .query_async(&mut *conn)
            .await
            .map_err(|e| StoreError::Backend(e.to_string()))?;

        keys.sort();
        Ok(keys)
    }

    async fn publish(&self, channel: &str, payload: &str) -> Result<(), StoreError> {
        let mut conn = self
            .pool
            .get()
            .await
            .map_err(|e| StoreError::Connection(e.to_string()))?;

        redis::cmd("PUBLISH")
            .arg(channel)
            .arg(payload)
            .query_async::<i64>(&mut *conn)
            .await
            .map_err(|e| StoreError::Backend(e.to_string()))?;

        Ok(())
    }

    async fn subscribe(&self, channel: &str) -> Result<broadcast::Receiver<String>, StoreError> {
        let entry = self.subs.entry(channel.to_string());
        let tx = match entry {
            dashmap::mapref::entry::Entry::Occupied(occupied) => occupied.get().clone(),
            dashmap::mapref::entry::Entry::Vacant(vacant) => {
                let (tx, _) = broadcast::channel(CHANNEL_CAPACITY);
                vacant.insert(tx.clone());
                self.spawn_subscriber(channel.to_string(), tx.clone());
                tx
            }
        };

        Ok(tx.subscribe())
    }
}

impl std::fmt::Debug for ValkeyStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ValkeyStore")
            .field("channels", &self.subs.len())
            .finish_non_exhaustive()
    }
}

/// Valkey/Redis queue backend over LPUSH/BRPOP.
#[derive(Clone)]
pub struct ValkeyQueue {
    pool: Pool,
}

impl ValkeyQueue {
    pub async fn new(url: &str, pool_size: usize) -> Result<Self, QueueError> {
        let pool = build_pool(url, pool_size)
            .await
            .map_err(QueueError::Connection)?;
        Ok(Self { pool })
    }
}

#[async_trait]
impl QueueBackend for ValkeyQueue {
    async fn push(&self, queue: &str, payload: &str) -> Result<(), QueueError> {
        let mut conn = self
            .pool
            .get()
            .await
            .map_err(|e| QueueError::Connection(e.to_string()))?;

        conn.lpush::<_, _, ()>(queue, payload)
            .await
            .map_err(|e| QueueError::Backend(e.to_string()))?;

        Ok(())
    }

    async fn pop(&self, queue: &str, timeout: Duration) -> Result<Option<String>, QueueError> {
        let mut conn = self
            .pool
            .get()
            .await
            .map_err(|e| QueueError::Connection(e.to_string()))?;

        let result: Option<(String, String)> = redis::cmd("BRPOP")
            .arg(queue)
            .arg(timeout.as_secs_f64().max(0.01))
            .query_async(&mut *conn)
            .await
            .map_err(|e| QueueError::Backend(e.to_string()))?;

        Ok(result.map(|(_, payload)| payload))
    }
}

impl std::fmt::Debug for ValkeyQueue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ValkeyQueue").finish_non_exhaustive()
    }
}

/// Valkey/Redis lock backend: `SET key token NX PX ttl`, Lua-guarded
/// release and refresh so only the token holder can touch the key.
#[derive(Clone)]
pub struct ValkeyLockProvider {
    pool: Pool,
}

impl ValkeyLockProvider {
    pub async fn new(url: &str, pool_size: usize) -> Result<Self, LockError> {
        let pool = build_pool(url, pool_size)
            .await
            .map_err(LockError::Connection)?;
        Ok(Self { pool })
    }
}

#[async_trait]
impl LockOps for ValkeyLockProvider {
    async fn release(&self, resource: &str, token: &str) -> Result<(), LockError> {
        let mut conn = self
            .pool
            .get()
            .await
            .map_err(|e| LockError::Connection(e.to_string()))?;

        let script = redis::Script::new(
            r#"
            if redis.call('GET', KEYS[1]) == ARGV[1] then
                return redis.call('DEL', KEYS[1])
            else
                return 0
            end
            "#,
        );

        let _: i64 = script
            .key(resource)
            .arg(token)
            .invoke_async(&mut *conn)
            .await
            .map_err(|e| LockError::Backend(e.to_string()))?;

        Ok(())
    }

    async fn refresh(&self, resource: &str, token: &str, ttl: Duration) -> Result<(), LockError> {
        let mut conn = self
            .pool
            .get()
            .await
            .map_err(|e| LockError::Connection(e.to_string()))?;

        let script = redis::Script::new(
            r#"
            if redis.call('GET', KEYS[1]) == ARGV[1] then
                return redis.call('PEXPIRE', KEYS[1], ARGV[2])
            else
                return 0
            end
            "#,
        );

        let result: i64 = script
            .key(resource)
            .arg(token)
            .arg(ttl.as_millis().max(1) as u64)
            .invoke_async(&mut *conn)
            .await
            .map_err(|e| LockError::Backend(e.to_string()))?;

        if result == 0 {
            return Err(LockError::NotHeld);
        }

        Ok(())
    }
}

#[async_trait]
impl LockBackend for ValkeyLockProvider {
    async fn try_acquire(
        &self,
        resource: &str,
        ttl: Duration,
    ) -> Result<Option<LockGuard>, LockError> {
        let mut conn = self
            .pool
            .get()
            .await
            .map_err(|e| LockError::Connection(e.to_string()))?;

        let token = Uuid::new_v4().to_string();

        let result: Option<String> = redis::cmd("SET")
            .arg(resource)
            .arg(&token)
            .arg("NX")
            .arg("PX")
            .arg(ttl.as_millis().max(1) as u64)
            .query_async(&mut *conn)
            .await
            .map_err(|e| LockError::Backend(e.to_string()))?;

        if result.is_some() {
            Ok(Some(LockGuard::new(
                resource.to_string(),
                token,
                Arc::new(self.clone()) as Arc<dyn LockOps>,
            )))
        } else {
            Ok(None)
        }
    }

    async fn acquire(
        &self,
        resource: &str,
        ttl: Duration,
        wait: Duration,
    ) -> Result<LockGuard, LockError> {
        let deadline = std::time::Instant::now() + wait;

        loop {
            if let Some(guard) = self.try_acquire(resource, ttl).await? {
                return Ok(guard);
            }
            if std::time::Instant::now() >= deadline {
                return Err(LockError::Timeout);
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
    }
}

impl std::fmt::Debug for ValkeyLockProvider {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ValkeyLockProvider").finish_non_exhaustive()
    }
}
