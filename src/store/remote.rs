//! Remote (Redis Streams-backed) Store Backend implementation.
//!
//! Channels map 1:1 onto Redis Streams; `cas` is built from `GET`/`SET NX` on
//! the same key since the coordinator lease is the only caller. Retries use
//! jittered exponential backoff (250 ms to 8 s, 3 attempts).

use std::time::Duration;

use async_trait::async_trait;
use rand::Rng;
use redis::aio::ConnectionManager;
use redis::AsyncCommands;

use crate::error::{PowerModeError, Result};
use crate::store::{StoreBackend, StoredMessage, SubscriptionCursor};

const INITIAL_BACKOFF: Duration = Duration::from_millis(250);
const MAX_BACKOFF: Duration = Duration::from_secs(8);
const MAX_ATTEMPTS: u32 = 3;

/// Environment variable naming the remote store's connection URL.
pub const STORE_URL_ENV: &str = "POWER_MODE_STORE_URL";
/// Environment variable naming the remote store's bearer token, carried as
/// the Redis `AUTH` password component of the connection URL.
pub const STORE_TOKEN_ENV: &str = "POWER_MODE_STORE_TOKEN";

/// Redis-Streams-backed remote store.
pub struct RemoteStore {
    manager: ConnectionManager,
}

impl RemoteStore {
    /// Connects using `POWER_MODE_STORE_URL` and `POWER_MODE_STORE_TOKEN`.
    ///
    /// # Errors
    ///
    /// Returns [`PowerModeError::Transport`] if either environment variable
    /// is missing, or [`PowerModeError::StoreClient`] if the connection
    /// cannot be established.
    pub async fn connect_from_env() -> Result<Self> {
        let url = std::env::var(STORE_URL_ENV)
            .map_err(|_| PowerModeError::Transport(format!("{STORE_URL_ENV} not set")))?;
        let token = std::env::var(STORE_TOKEN_ENV)
            .map_err(|_| PowerModeError::Transport(format!("{STORE_TOKEN_ENV} not set")))?;
        Self::connect(&url, &token).await
    }

    /// Connects to the given URL, carrying `token` as the connection's
    /// password component.
    ///
    /// # Errors
    ///
    /// Returns [`PowerModeError::StoreClient`] if the client cannot be built
    /// or the initial connection fails.
    pub async fn connect(url: &str, token: &str) -> Result<Self> {
        let client = redis::Client::open(url)?;
        let mut conn = client.get_multiplexed_async_connection().await?;
        if !token.is_empty() {
            redis::cmd("AUTH")
                .arg(token)
                .query_async::<()>(&mut conn)
                .await?;
        }
        let manager = ConnectionManager::new(client).await?;
        Ok(Self { manager })
    }

    /// Probes connectivity with a short timeout, used by `auto` backend
    /// selection.
    ///
    /// # Errors
    ///
    /// Returns [`PowerModeError::Timeout`] if the ping does not complete
    /// within `budget`, or the underlying client error otherwise.
    pub async fn ping(&self, budget: Duration) -> Result<()> {
        let mut conn = self.manager.clone();
        tokio::time::timeout(budget, redis::cmd("PING").query_async::<()>(&mut conn))
            .await
            .map_err(|_| PowerModeError::Timeout("store ping exceeded budget".to_string()))??;
        Ok(())
    }

    async fn with_retry<T, F, Fut>(mut op: F) -> Result<T>
    where
        F: FnMut() -> Fut,
        Fut: std::future::Future<Output = Result<T>>,
    {
        let mut backoff = INITIAL_BACKOFF;
        let mut attempt = 0;
        loop {
            match op().await {
                Ok(v) => return Ok(v),
                Err(e) if attempt + 1 < MAX_ATTEMPTS => {
                    attempt += 1;
                    let jitter_ms = rand::thread_rng().gen_range(0..=50);
                    tokio::time::sleep(backoff + Duration::from_millis(jitter_ms)).await;
                    backoff = (backoff * 2).min(MAX_BACKOFF);
                    tracing::warn!(attempt, error = %e, "store op failed, retrying");
                }
                Err(e) => return Err(e),
            }
        }
    }
}

#[async_trait]
impl StoreBackend for RemoteStore {
    async fn publish(&self, channel: &str, bytes: &[u8]) -> Result<()> {
        self.xadd(channel, bytes).await.map(|_| ())
    }

    async fn subscribe(
        &self,
        channel: &str,
        client_id: &str,
    ) -> Result<Box<dyn SubscriptionCursor>> {
        Ok(Box::new(RemoteCursor {
            manager: self.manager.clone(),
            channel: channel.to_string(),
            last_id: self
                .hget(&format!("pop:cursor:{channel}"), client_id)
                .await?
                .and_then(|b| String::from_utf8(b).ok())
                .unwrap_or_else(|| "0".to_string()),
            client_id: client_id.to_string(),
        }))
    }

    async fn set(&self, key: &str, bytes: &[u8], ttl_seconds: Option<u64>) -> Result<()> {
        let key = key.to_string();
        let bytes = bytes.to_vec();
        Self::with_retry(|| {
            let mut conn = self.manager.clone();
            let key = key.clone();
            let bytes = bytes.clone();
            async move {
                match ttl_seconds {
                    Some(ttl) => conn.set_ex::<_, _, ()>(&key, bytes, ttl).await?,
                    None => conn.set::<_, _, ()>(&key, bytes).await?,
                }
                Ok(())
            }
        })
        .await
    }

    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>> {
        let key = key.to_string();
        Self::with_retry(|| {
            let mut conn = self.manager.clone();
            let key = key.clone();
            async move { Ok(conn.get(&key).await?) }
        })
        .await
    }

    async fn cas(&self, key: &str, expected: Option<&[u8]>, new: &[u8]) -> Result<bool> {
        let key = key.to_string();
        let expected = expected.map(<[u8]>::to_vec);
        let new = new.to_vec();
        Self::with_retry(|| {
            let mut conn = self.manager.clone();
            let key = key.clone();
            let expected = expected.clone();
            let new = new.clone();
            async move {
                match &expected {
                    None => {
                        let set: bool = redis::cmd("SET")
                            .arg(&key)
                            .arg(&new)
                            .arg("NX")
                            .query_async::<Option<String>>(&mut conn)
                            .await?
                            .is_some();
                        Ok(set)
                    }
                    Some(expected_bytes) => {
                        let current: Option<Vec<u8>> = conn.get(&key).await?;
                        if current.as_deref() == Some(expected_bytes.as_slice()) {
                            conn.set::<_, _, ()>(&key, &new).await?;
                            Ok(true)
                        } else {
                            Ok(false)
                        }
                    }
                }
            }
        })
        .await
    }

    async fn hset(&self, name: &str, field: &str, bytes: &[u8]) -> Result<()> {
        let mut conn = self.manager.clone();
        conn.hset::<_, _, _, ()>(name, field, bytes).await?;
        Ok(())
    }

    async fn hget(&self, name: &str, field: &str) -> Result<Option<Vec<u8>>> {
        let mut conn = self.manager.clone();
        Ok(conn.hget(name, field).await?)
    }

    async fn hgetall(&self, name: &str) -> Result<Vec<(String, Vec<u8>)>> {
        let mut conn = self.manager.clone();
        let map: std::collections::HashMap<String, Vec<u8>> = conn.hgetall(name).await?;
        Ok(map.into_iter().collect())
    }

    async fn lpush(&self, name: &str, bytes: &[u8]) -> Result<()> {
        let mut conn = self.manager.clone();
        conn.lpush::<_, _, ()>(name, bytes).await?;
        Ok(())
    }

    async fn rpop(&self, name: &str) -> Result<Option<Vec<u8>>> {
        let mut conn = self.manager.clone();
        Ok(conn.rpop(name, None).await?)
    }

    async fn lrange(&self, name: &str, start: i64, stop: i64) -> Result<Vec<Vec<u8>>> {
        let mut conn = self.manager.clone();
        Ok(conn.lrange(name, start as isize, stop as isize).await?)
    }

    async fn xadd(&self, stream: &str, bytes: &[u8]) -> Result<String> {
        let stream = stream.to_string();
        let bytes = bytes.to_vec();
        Self::with_retry(|| {
            let mut conn = self.manager.clone();
            let stream = stream.clone();
            let bytes = bytes.clone();
            async move {
                let id: String = conn.xadd(&stream, "*", &[("data", bytes)]).await?;
                Ok(id)
            }
        })
        .await
    }

    async fn xrange(&self, stream: &str, start: &str, end: &str) -> Result<Vec<(String, Vec<u8>)>> {
        let mut conn = self.manager.clone();
        let reply: redis::streams::StreamRangeReply =
            conn.xrange(stream, start, end).await?;
        Ok(reply
            .ids
            .into_iter()
            .filter_map(|entry| {
                entry
                    .map
                    .get("data")
                    .and_then(|v| redis::from_redis_value::<Vec<u8>>(v).ok())
                    .map(|data| (entry.id.clone(), data))
            })
            .collect())
    }

    fn is_remote(&self) -> bool {
        true
    }
}

struct RemoteCursor {
    manager: ConnectionManager,
    channel: String,
    client_id: String,
    last_id: String,
}

#[async_trait]
impl SubscriptionCursor for RemoteCursor {
    async fn poll(&mut self) -> Result<Vec<StoredMessage>> {
        let mut conn = self.manager.clone();
        let reply: redis::streams::StreamRangeReply = conn
            .xrange_count(&self.channel, format!("({}", self.last_id), "+", 100)
            .await?;
        let mut out = Vec::with_capacity(reply.ids.len());
        for (i, entry) in reply.ids.into_iter().enumerate() {
            if let Some(data) = entry
                .map
                .get("data")
                .and_then(|v| redis::from_redis_value::<Vec<u8>>(v).ok())
            {
                let ts_millis: i64 = entry
                    .id
                    .split('-')
                    .next()
                    .and_then(|s| s.parse().ok())
                    .unwrap_or(0);
                out.push(StoredMessage {
                    data,
                    ts_millis,
                    seq: i as u64 + 1,
                });
                self.last_id = entry.id;
            }
        }
        if !out.is_empty() {
            conn.hset::<_, _, _, ()>(
                format!("pop:cursor:{}", self.channel),
                &self.client_id,
                self.last_id.as_bytes(),
            )
            .await?;
        }
        Ok(out)
    }
}
