//! # Cache Connector
//!
//! Redis via a multiplexed `ConnectionManager`, which reconnects its
//! socket on its own; the handle above it decides whether the cache is
//! usable at all.
//!
//! Values are stored as JSON strings. Every key is namespaced with the
//! configured prefix.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use redis::aio::ConnectionManager;
use redis::AsyncCommands;
use serde::de::DeserializeOwned;
use serde::Serialize;
use trellis_core::{CacheSettings, Capability};

use crate::error::{BoxError, ServiceError};
use crate::handle::Connector;

/// Time-to-live applied by [`CacheClient::set`] when none is given.
pub const DEFAULT_TTL: Duration = Duration::from_secs(3600);

/// Typed JSON access to the cache.
#[derive(Clone)]
pub struct CacheClient {
    conn: ConnectionManager,
    prefix: Arc<str>,
}

impl std::fmt::Debug for CacheClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CacheClient")
            .field("prefix", &self.prefix)
            .finish_non_exhaustive()
    }
}

impl CacheClient {
    fn key(&self, key: &str) -> String {
        format!("{}{key}", self.prefix)
    }

    /// Reads and decodes a value; `None` when the key is absent.
    pub async fn get<T: DeserializeOwned>(&self, key: &str) -> Result<Option<T>, ServiceError> {
        let mut conn = self.conn.clone();
        let raw: Option<String> = conn
            .get(self.key(key))
            .await
            .map_err(|e| ServiceError::operation(Capability::Cache, e))?;
        raw.map(|s| serde_json::from_str(&s))
            .transpose()
            .map_err(|e| ServiceError::operation(Capability::Cache, e))
    }

    /// Stores a value. A zero `ttl` stores without expiry.
    pub async fn set<T: Serialize + ?Sized>(
        &self,
        key: &str,
        value: &T,
        ttl: Duration,
    ) -> Result<(), ServiceError> {
        let encoded =
            serde_json::to_string(value).map_err(|e| ServiceError::operation(Capability::Cache, e))?;
        let mut cmd = redis::cmd("SET");
        cmd.arg(self.key(key)).arg(encoded);
        if !ttl.is_zero() {
            cmd.arg("EX").arg(ttl.as_secs().max(1));
        }
        let mut conn = self.conn.clone();
        let _: () = cmd
            .query_async(&mut conn)
            .await
            .map_err(|e| ServiceError::operation(Capability::Cache, e))?;
        Ok(())
    }

    /// Removes a key. Returns whether it existed.
    pub async fn delete(&self, key: &str) -> Result<bool, ServiceError> {
        let mut conn = self.conn.clone();
        let removed: i64 = conn
            .del(self.key(key))
            .await
            .map_err(|e| ServiceError::operation(Capability::Cache, e))?;
        Ok(removed > 0)
    }

    async fn ping(&self) -> redis::RedisResult<()> {
        let mut conn = self.conn.clone();
        let _pong: String = redis::cmd("PING").query_async(&mut conn).await?;
        Ok(())
    }
}

/// Opens a Redis connection manager from [`CacheSettings`].
#[derive(Debug, Clone)]
pub struct CacheConnector {
    settings: CacheSettings,
}

impl CacheConnector {
    pub fn new(settings: CacheSettings) -> Self {
        Self { settings }
    }
}

#[async_trait]
impl Connector for CacheConnector {
    type Client = CacheClient;

    fn capability(&self) -> Capability {
        Capability::Cache
    }

    async fn connect(&self) -> Result<CacheClient, BoxError> {
        let client = redis::Client::open(self.settings.url.as_str())?;
        let conn = ConnectionManager::new(client).await?;
        let cache = CacheClient {
            conn,
            prefix: Arc::from(self.settings.key_prefix.as_str()),
        };
        cache.ping().await?;
        Ok(cache)
    }

    async fn ping(&self, client: &CacheClient) -> Result<(), BoxError> {
        client.ping().await?;
        Ok(())
    }

    async fn disconnect(&self, client: CacheClient) {
        // The manager closes its socket when the last clone is dropped.
        drop(client);
    }
}
