//! Redis 后端
//!
//! 事件总线（Pub/Sub）与三类共享状态：在线状态、房间成员、限流计数。
//! 所有后端共享一个 `ConnectionManager`，断线由它自动重连。

pub mod bus;
pub mod error;
pub mod membership;
pub mod presence;
pub mod rate_limit;

use std::sync::Arc;

use redis::aio::ConnectionManager;
use redis::Client;
use tracing::info;

pub use bus::RedisEventBus;
pub use error::*;
pub use membership::RedisMembershipBackend;
pub use presence::RedisPresenceBackend;
pub use rate_limit::RedisRateLimitStore;

/// 共享状态键的默认前缀
pub const DEFAULT_KEY_PREFIX: &str = "rt";

/// 一组基于同一 Redis 的后端
pub struct RedisBackends {
    pub bus: Arc<RedisEventBus>,
    pub presence: Arc<RedisPresenceBackend>,
    pub membership: Arc<RedisMembershipBackend>,
    pub rate_limits: Arc<RedisRateLimitStore>,
    connection: ConnectionManager,
}

impl RedisBackends {
    /// 连接 Redis 并构造全部后端
    pub async fn connect(url: &str, channel: &str, capacity: usize, prefix: &str) -> RedisResult<Self> {
        let client = Client::open(url)?;
        let connection = client
            .get_connection_manager()
            .await
            .map_err(|e| RedisError::ConnectionError {
                message: format!("连接 Redis 失败: {e}"),
            })?;

        let backends = Self {
            bus: Arc::new(RedisEventBus::new(client, connection.clone(), channel, capacity)),
            presence: Arc::new(RedisPresenceBackend::new(connection.clone(), prefix)),
            membership: Arc::new(RedisMembershipBackend::new(connection.clone(), prefix)),
            rate_limits: Arc::new(RedisRateLimitStore::new(connection.clone(), prefix)),
            connection,
        };
        backends.ping().await?;
        info!(channel, prefix, "Redis 后端已就绪");
        Ok(backends)
    }

    /// 健康检查
    pub async fn ping(&self) -> RedisResult<()> {
        let mut conn = self.connection.clone();
        let _: String = redis::cmd("PING").query_async(&mut conn).await?;
        Ok(())
    }
}
