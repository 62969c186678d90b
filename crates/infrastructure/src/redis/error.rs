//! Redis 错误类型定义

use application::{ApplicationError, BroadcastError};
use thiserror::Error;

/// Redis 操作错误
#[derive(Error, Debug)]
pub enum RedisError {
    /// 连接错误
    #[error("Redis 连接错误: {message}")]
    ConnectionError { message: String },

    /// 命令或脚本执行错误
    #[error("Redis 命令错误: {message}")]
    CommandError { message: String },

    /// 序列化错误
    #[error("序列化错误: {message}")]
    SerializationError { message: String },

    /// 存储中的数据无法解析
    #[error("数据损坏: {message}")]
    CorruptData { message: String },

    /// 配置错误
    #[error("配置错误: {message}")]
    ConfigError { message: String },
}

/// Redis 结果类型
pub type RedisResult<T> = Result<T, RedisError>;

impl From<redis::RedisError> for RedisError {
    fn from(err: redis::RedisError) -> Self {
        if err.kind() == redis::ErrorKind::InvalidClientConfig {
            RedisError::ConfigError {
                message: err.to_string(),
            }
        } else if err.is_io_error() || err.is_connection_dropped() || err.is_connection_refusal() {
            RedisError::ConnectionError {
                message: err.to_string(),
            }
        } else {
            RedisError::CommandError {
                message: err.to_string(),
            }
        }
    }
}

impl From<serde_json::Error> for RedisError {
    fn from(err: serde_json::Error) -> Self {
        RedisError::SerializationError {
            message: err.to_string(),
        }
    }
}

impl From<RedisError> for ApplicationError {
    fn from(err: RedisError) -> Self {
        ApplicationError::infrastructure(err.to_string())
    }
}

impl From<RedisError> for BroadcastError {
    fn from(err: RedisError) -> Self {
        BroadcastError::bus(err.to_string())
    }
}
