//! 基础设施层实现。
//!
//! 提供 Redis 事件总线与共享状态后端、CRUD 层协作方的 HTTP 客户端，
//! 实现应用层定义的接口。

pub mod http_collaborators;
pub mod redis;
pub mod retry;

pub use http_collaborators::{CollaboratorError, HttpCollaborators};
pub use redis::{
    RedisBackends, RedisError, RedisEventBus, RedisMembershipBackend, RedisPresenceBackend,
    RedisRateLimitStore, DEFAULT_KEY_PREFIX,
};
