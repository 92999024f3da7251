//! Redis-backed store.

use std::time::Duration;

use async_trait::async_trait;
use redis::aio::ConnectionManager;
use redis::{AsyncCommands, Client, Script};
use tracing::info;

use super::backend::{BackendError, StoreBackend, Ttl};

/// Increments `KEYS[1]` and sets its expiry to `ARGV[1]` milliseconds.
const INCR_EXPIRE_SCRIPT: &str = r#"
local current = redis.call("INCR", KEYS[1])
redis.call("PEXPIRE", KEYS[1], tonumber(ARGV[1]))
return current
"#;

/// A store backed by a Redis [`ConnectionManager`].
///
/// The connection manager reconnects on its own and is cheap to clone, so a
/// single backend can be shared across every task.
#[derive(Clone)]
pub struct RedisBackend {
    connection_manager: ConnectionManager,
    incr_expire: Script,
}

impl std::fmt::Debug for RedisBackend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RedisBackend").finish_non_exhaustive()
    }
}

impl RedisBackend {
    /// Connect to the Redis server at `url`.
    pub async fn connect(url: &str) -> Result<Self, BackendError> {
        info!(url = %url, "Connecting to Redis");
        let client = Client::open(url)?;
        let connection_manager = client.get_connection_manager().await?;
        Ok(Self::from_connection_manager(connection_manager))
    }

    /// Wrap an existing connection manager.
    pub fn from_connection_manager(connection_manager: ConnectionManager) -> Self {
        Self {
            connection_manager,
            incr_expire: Script::new(INCR_EXPIRE_SCRIPT),
        }
    }

    fn conn(&self) -> ConnectionManager {
        self.connection_manager.clone()
    }
}

fn ttl_millis(ttl: Duration) -> u64 {
    // PEXPIRE 0 deletes the key, so round sub-millisecond windows up
    (ttl.as_millis() as u64).max(1)
}

#[async_trait]
impl StoreBackend for RedisBackend {
    async fn get(&self, key: &str) -> Result<Option<String>, BackendError> {
        let mut conn = self.conn();
        let value: Option<String> = conn.get(key).await?;
        Ok(value)
    }

    async fn set(&self, key: &str, value: &str, ttl: Duration) -> Result<(), BackendError> {
        let mut conn = self.conn();
        let mut cmd = redis::cmd("SET");
        cmd.arg(key).arg(value);
        if !ttl.is_zero() {
            cmd.arg("PX").arg(ttl_millis(ttl));
        }
        let _: () = cmd.query_async(&mut conn).await?;
        Ok(())
    }

    async fn del(&self, key: &str) -> Result<bool, BackendError> {
        let mut conn = self.conn();
        let removed: i64 = conn.del(key).await?;
        Ok(removed > 0)
    }

    async fn exists(&self, key: &str) -> Result<bool, BackendError> {
        let mut conn = self.conn();
        let exists: bool = conn.exists(key).await?;
        Ok(exists)
    }

    async fn ttl(&self, key: &str) -> Result<Ttl, BackendError> {
        let mut conn = self.conn();
        let millis: i64 = redis::cmd("PTTL").arg(key).query_async(&mut conn).await?;
        Ok(Ttl::from_pttl(millis))
    }

    async fn incr_expire(&self, key: &str, ttl: Duration) -> Result<i64, BackendError> {
        let mut conn = self.conn();
        let count: i64 = self
            .incr_expire
            .key(key)
            .arg(ttl_millis(ttl))
            .invoke_async(&mut conn)
            .await?;
        Ok(count)
    }

    async fn keys(&self, pattern: &str) -> Result<Vec<String>, BackendError> {
        let mut conn = self.conn();
        let keys: Vec<String> = conn.keys(pattern).await?;
        Ok(keys)
    }

    async fn flush(&self) -> Result<(), BackendError> {
        let mut conn = self.conn();
        let _: () = redis::cmd("FLUSHDB").query_async(&mut conn).await?;
        Ok(())
    }

    async fn ping(&self) -> Result<(), BackendError> {
        let mut conn = self.conn();
        let pong: String = redis::cmd("PING").query_async(&mut conn).await?;
        if pong != "PONG" {
            return Err(BackendError::Unavailable(format!("unexpected PING reply: {pong}")));
        }
        Ok(())
    }
}
