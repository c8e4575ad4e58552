use std::time::Duration;

use async_trait::async_trait;
use redis::aio::ConnectionManager;
use tracing::info;

use courier_core::config::BackendEndpoint;

use super::{BatchOp, CacheBackend, CacheBatch, ScanPage};
use crate::{CacheError, CacheResult};

/// Cache backend over a single Redis endpoint.
///
/// The connection manager reconnects on its own, so a clone of it is used
/// per command.
#[derive(Clone)]
pub struct RedisCacheBackend {
    conn: ConnectionManager,
}

impl RedisCacheBackend {
    pub async fn connect(endpoint: &BackendEndpoint, connect_timeout: Duration) -> CacheResult<Self> {
        let client = redis::Client::open(endpoint.url())?;
        let conn = tokio::time::timeout(connect_timeout, ConnectionManager::new(client))
            .await
            .map_err(|_| CacheError::ConnectTimeout(connect_timeout))??;

        info!("Connected cache backend at {}:{}", endpoint.host, endpoint.port);
        Ok(Self { conn })
    }

    pub fn from_connection(conn: ConnectionManager) -> Self {
        Self { conn }
    }
}

#[async_trait]
impl CacheBackend for RedisCacheBackend {
    async fn get(&self, key: &str) -> CacheResult<Option<String>> {
        let mut conn = self.conn.clone();
        let value: Option<String> = redis::cmd("GET").arg(key).query_async(&mut conn).await?;
        Ok(value)
    }

    async fn set(&self, key: &str, value: &str, ttl_secs: u64) -> CacheResult<()> {
        let mut conn = self.conn.clone();
        let _: () = redis::cmd("SET")
            .arg(key)
            .arg(value)
            .arg("EX")
            .arg(ttl_secs.max(1))
            .query_async(&mut conn)
            .await?;
        Ok(())
    }

    async fn del(&self, keys: &[String]) -> CacheResult<u64> {
        if keys.is_empty() {
            return Ok(0);
        }
        let mut conn = self.conn.clone();
        let removed: u64 = redis::cmd("DEL").arg(keys).query_async(&mut conn).await?;
        Ok(removed)
    }

    async fn smembers(&self, key: &str) -> CacheResult<Vec<String>> {
        let mut conn = self.conn.clone();
        let members: Vec<String> = redis::cmd("SMEMBERS").arg(key).query_async(&mut conn).await?;
        Ok(members)
    }

    async fn exec(&self, batch: CacheBatch) -> CacheResult<()> {
        if batch.is_empty() {
            return Ok(());
        }

        let mut pipe = redis::pipe();
        pipe.atomic();
        for op in &batch.ops {
            match op {
                BatchOp::Set { key, value, ttl_secs } => {
                    pipe.cmd("SET").arg(key).arg(value).arg("EX").arg((*ttl_secs).max(1)).ignore();
                }
                BatchOp::SAdd { key, member } => {
                    pipe.cmd("SADD").arg(key).arg(member).ignore();
                }
                BatchOp::Expire { key, ttl_secs } => {
                    pipe.cmd("EXPIRE").arg(key).arg((*ttl_secs).max(1)).ignore();
                }
                BatchOp::Del { keys } => {
                    pipe.cmd("DEL").arg(keys).ignore();
                }
            }
        }

        let mut conn = self.conn.clone();
        let _: () = pipe.query_async(&mut conn).await?;
        Ok(())
    }

    async fn scan(&self, cursor: Option<&str>, pattern: &str, count: usize) -> CacheResult<ScanPage> {
        let mut conn = self.conn.clone();
        let (next, keys): (String, Vec<String>) = redis::cmd("SCAN")
            .arg(cursor.unwrap_or("0"))
            .arg("MATCH")
            .arg(pattern)
            .arg("COUNT")
            .arg(count.max(1))
            .query_async(&mut conn)
            .await?;

        Ok(ScanPage {
            keys,
            next_cursor: (next != "0").then_some(next),
        })
    }

    async fn flush_all(&self) -> CacheResult<()> {
        let mut conn = self.conn.clone();
        let _: () = redis::cmd("FLUSHDB").query_async(&mut conn).await?;
        Ok(())
    }
}
