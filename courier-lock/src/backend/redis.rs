use std::time::Duration;

use async_trait::async_trait;
use redis::aio::ConnectionManager;
use redis::Script;
use tracing::info;

use courier_core::config::BackendEndpoint;

use super::LockBackend;
use crate::{LockError, LockResult};

/// Deletes the key only while it still holds the caller's token
const UNLOCK_SCRIPT: &str = r#"
if redis.call("GET", KEYS[1]) == ARGV[1] then
    return redis.call("DEL", KEYS[1])
else
    return 0
end
"#;

/// Lock server backed by one Redis endpoint (`SET NX PX` + token-checked delete)
#[derive(Clone)]
pub struct RedisLockBackend {
    name: String,
    conn: ConnectionManager,
    unlock_script: Script,
}

impl RedisLockBackend {
    pub async fn connect(endpoint: &BackendEndpoint, connect_timeout: Duration) -> LockResult<Self> {
        let client = redis::Client::open(endpoint.url())?;
        let conn = tokio::time::timeout(connect_timeout, ConnectionManager::new(client))
            .await
            .map_err(|_| LockError::ConnectTimeout(connect_timeout))??;

        let name = format!("{}:{}", endpoint.host, endpoint.port);
        info!("Connected lock backend {}", name);
        Ok(Self {
            name,
            conn,
            unlock_script: Script::new(UNLOCK_SCRIPT),
        })
    }
}

#[async_trait]
impl LockBackend for RedisLockBackend {
    fn name(&self) -> &str {
        &self.name
    }

    async fn try_lock(&self, resource: &str, value: &str, ttl: Duration) -> LockResult<bool> {
        let mut conn = self.conn.clone();
        let reply: Option<String> = redis::cmd("SET")
            .arg(resource)
            .arg(value)
            .arg("NX")
            .arg("PX")
            .arg(ttl.as_millis().max(1) as u64)
            .query_async(&mut conn)
            .await?;
        Ok(reply.is_some())
    }

    async fn unlock(&self, resource: &str, value: &str) -> LockResult<bool> {
        let mut conn = self.conn.clone();
        let removed: i64 = self
            .unlock_script
            .key(resource)
            .arg(value)
            .invoke_async(&mut conn)
            .await?;
        Ok(removed == 1)
    }

    async fn quit(&self) -> LockResult<()> {
        let mut conn = self.conn.clone();
        let _: () = redis::cmd("QUIT").query_async(&mut conn).await?;
        Ok(())
    }
}
