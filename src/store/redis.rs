//! Redis state store backend
//!
//! Uses a `ConnectionManager` which transparently reconnects; every command
//! additionally carries an explicit timeout so callers never wait unbounded.

use std::time::Duration;

use async_trait::async_trait;
use redis::aio::ConnectionManager;
use redis::{AsyncCommands, Script};
use tracing::debug;

use super::backend::{StateStore, StoreHealth};
use super::error::{StoreError, StoreResult};

/// Upper bound on any single store command
const COMMAND_TIMEOUT: Duration = Duration::from_secs(5);

/// Compare-and-swap as a Lua script so the check and the write are atomic.
/// ARGV[1] is "1" when a current value is expected (in ARGV[2]), "0" when the
/// key must be absent; ARGV[3] is the new value. The key's TTL is preserved.
const CAS_SCRIPT: &str = r#"
local current = redis.call('GET', KEYS[1])
if ARGV[1] == '1' then
  if current ~= ARGV[2] then return 0 end
else
  if current then return 0 end
end
local ttl = redis.call('PTTL', KEYS[1])
redis.call('SET', KEYS[1], ARGV[3])
if ttl > 0 then
  redis.call('PEXPIRE', KEYS[1], ttl)
end
return 1
"#;

/// Redis-backed state store
pub struct RedisStore {
    manager: ConnectionManager,
    cas: Script,
}

impl RedisStore {
    /// Connect to redis at `url`.
    pub async fn connect(url: &str) -> StoreResult<Self> {
        let client = redis::Client::open(url)
            .map_err(|e| StoreError::InvalidConfig(format!("invalid redis URL: {e}")))?;
        let manager = tokio::time::timeout(COMMAND_TIMEOUT, ConnectionManager::new(client))
            .await
            .map_err(|_| StoreError::ConnectionFailed("connect timed out".to_string()))??;
        debug!("connected to redis state store");
        Ok(Self {
            manager,
            cas: Script::new(CAS_SCRIPT),
        })
    }

    async fn with_timeout<T>(
        &self,
        fut: impl std::future::Future<Output = redis::RedisResult<T>>,
    ) -> StoreResult<T> {
        tokio::time::timeout(COMMAND_TIMEOUT, fut)
            .await
            .map_err(|_| StoreError::OperationFailed("command timed out".to_string()))?
            .map_err(StoreError::from)
    }
}

#[async_trait]
impl StateStore for RedisStore {
    async fn get_raw(&self, key: &str) -> StoreResult<Option<String>> {
        let mut conn = self.manager.clone();
        self.with_timeout(conn.get(key)).await
    }

    async fn put_raw(&self, key: &str, value: String, ttl: Option<Duration>) -> StoreResult<()> {
        let mut conn = self.manager.clone();
        match ttl {
            Some(ttl) => {
                let mut cmd = redis::cmd("SET");
                cmd.arg(key).arg(value).arg("PX").arg(ttl.as_millis() as u64);
                self.with_timeout(cmd.query_async::<()>(&mut conn)).await
            }
            None => self.with_timeout(conn.set(key, value)).await,
        }
    }

    async fn delete(&self, key: &str) -> StoreResult<()> {
        let mut conn = self.manager.clone();
        self.with_timeout(conn.del(key)).await
    }

    async fn set_if_absent(&self, key: &str, value: String, ttl: Duration) -> StoreResult<bool> {
        let mut conn = self.manager.clone();
        let mut cmd = redis::cmd("SET");
        cmd.arg(key)
            .arg(value)
            .arg("NX")
            .arg("PX")
            .arg(ttl.as_millis() as u64);
        let reply: Option<String> = self.with_timeout(cmd.query_async(&mut conn)).await?;
        Ok(reply.is_some())
    }

    async fn compare_and_swap(
        &self,
        key: &str,
        expected: Option<&str>,
        value: String,
    ) -> StoreResult<bool> {
        let mut conn = self.manager.clone();
        let flag = if expected.is_some() { "1" } else { "0" };
        let mut invocation = self.cas.key(key);
        invocation
            .arg(flag)
            .arg(expected.unwrap_or(""))
            .arg(value);
        let swapped: i64 = self
            .with_timeout(invocation.invoke_async(&mut conn))
            .await?;
        Ok(swapped == 1)
    }

    async fn expire_in(&self, key: &str, ttl: Duration) -> StoreResult<()> {
        let mut conn = self.manager.clone();
        let mut cmd = redis::cmd("PEXPIRE");
        cmd.arg(key).arg(ttl.as_millis() as u64);
        self.with_timeout(cmd.query_async::<i64>(&mut conn))
            .await?;
        Ok(())
    }

    async fn scan_prefix(&self, prefix: &str) -> StoreResult<Vec<(String, String)>> {
        let mut conn = self.manager.clone();
        let pattern = format!("{prefix}*");
        let mut cursor: u64 = 0;
        let mut keys = Vec::new();

        loop {
            let mut cmd = redis::cmd("SCAN");
            cmd.arg(cursor)
                .arg("MATCH")
                .arg(&pattern)
                .arg("COUNT")
                .arg(200);
            let (next, batch): (u64, Vec<String>) =
                self.with_timeout(cmd.query_async(&mut conn)).await?;
            keys.extend(batch);
            cursor = next;
            if cursor == 0 {
                break;
            }
        }

        let mut pairs = Vec::with_capacity(keys.len());
        for key in keys {
            let value: Option<String> = self.with_timeout(conn.get(&key)).await?;
            // key may expire between SCAN and GET
            if let Some(value) = value {
                pairs.push((key, value));
            }
        }
        Ok(pairs)
    }

    async fn health_check(&self) -> StoreResult<StoreHealth> {
        let mut conn = self.manager.clone();
        let pong: String = self
            .with_timeout(redis::cmd("PING").query_async(&mut conn))
            .await?;
        Ok(StoreHealth {
            healthy: pong == "PONG",
            message: format!("redis: {pong}"),
        })
    }
}
