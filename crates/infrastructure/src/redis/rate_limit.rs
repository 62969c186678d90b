//! Redis 固定窗口计数
//!
//! `INCRBY` 后仅在窗口的第一次命中时设置 `PEXPIRE`，两步在同一脚本内完成，
//! 计数键总是带过期时间，不需要额外清理。

use std::time::Duration;

use application::{ApplicationError, RateLimitStore};
use async_trait::async_trait;
use redis::aio::ConnectionManager;
use redis::Script;

use crate::redis::RedisError;

const HIT_SCRIPT: &str = r#"
local count = redis.call('INCRBY', KEYS[1], ARGV[1])
if redis.call('PTTL', KEYS[1]) < 0 then
    redis.call('PEXPIRE', KEYS[1], ARGV[2])
end
return count
"#;

pub struct RedisRateLimitStore {
    connection: ConnectionManager,
    prefix: String,
    hit: Script,
}

impl RedisRateLimitStore {
    pub fn new(connection: ConnectionManager, prefix: impl Into<String>) -> Self {
        Self {
            connection,
            prefix: prefix.into(),
            hit: Script::new(HIT_SCRIPT),
        }
    }

    fn bucket_key(&self, identity: &str) -> String {
        format!("{}:rate:{}", self.prefix, identity)
    }
}

#[async_trait]
impl RateLimitStore for RedisRateLimitStore {
    async fn hit(&self, identity: &str, cost: u32, window: Duration) -> Result<u32, ApplicationError> {
        let window_ms = u64::try_from(window.as_millis()).unwrap_or(u64::MAX).max(1);
        let mut conn = self.connection.clone();
        let count: u32 = self
            .hit
            .key(self.bucket_key(identity))
            .arg(cost)
            .arg(window_ms)
            .invoke_async(&mut conn)
            .await
            .map_err(RedisError::from)?;
        Ok(count)
    }
}
