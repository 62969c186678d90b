use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashMap;
use domain::UserId;

use crate::error::{ApplicationError, AuthError};

/// 固定窗口计数存储，可跨进程共享
#[async_trait]
pub trait RateLimitStore: Send + Sync {
    /// 在当前窗口内累加 `cost`，返回累加后的计数
    async fn hit(&self, identity: &str, cost: u32, window: Duration) -> Result<u32, ApplicationError>;

    /// 清理过期窗口（共享存储可依赖键过期，无需实现）
    async fn prune(&self, _window: Duration) -> Result<(), ApplicationError> {
        Ok(())
    }
}

pub mod memory {
    use super::*;
    use tokio::time::Instant;

    /// 单个身份的窗口配额
    #[derive(Debug, Clone)]
    struct Bucket {
        count: u32,
        window_start: Instant,
    }

    #[derive(Default)]
    pub struct MemoryRateLimitStore {
        buckets: DashMap<String, Bucket>,
    }

    impl MemoryRateLimitStore {
        pub fn new() -> Self {
            Self::default()
        }

        pub fn len(&self) -> usize {
            self.buckets.len()
        }

        pub fn is_empty(&self) -> bool {
            self.buckets.is_empty()
        }
    }

    #[async_trait]
    impl RateLimitStore for MemoryRateLimitStore {
        async fn hit(&self, identity: &str, cost: u32, window: Duration) -> Result<u32, ApplicationError> {
            let now = Instant::now();
            let mut bucket = self
                .buckets
                .entry(identity.to_string())
                .or_insert_with(|| Bucket {
                    count: 0,
                    window_start: now,
                });

            // 检查是否需要重置时间窗口
            if now.duration_since(bucket.window_start) >= window {
                bucket.count = 0;
                bucket.window_start = now;
            }
            bucket.count = bucket.count.saturating_add(cost);
            Ok(bucket.count)
        }

        async fn prune(&self, window: Duration) -> Result<(), ApplicationError> {
            let now = Instant::now();
            self.buckets
                .retain(|_, bucket| now.duration_since(bucket.window_start) < window * 2);
            Ok(())
        }
    }
}

/// 准入结果
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Admission {
    Allowed,
    /// 被拒绝；`abusive` 表示连续拒绝次数已达到滥用阈值
    Denied { abusive: bool },
}

impl Admission {
    pub fn is_allowed(&self) -> bool {
        matches!(self, Admission::Allowed)
    }
}

/// 限流器
/// 按身份做固定窗口计数，同时限制每个用户在本进程的并发连接数
pub struct RateLimiter {
    store: Arc<dyn RateLimitStore>,
    /// 每个窗口允许的动作数
    budget: u32,
    window: Duration,
    /// 连续被拒多少次后视为滥用
    abuse_threshold: u32,
    max_connections_per_user: u32,
    denials: DashMap<String, Denials>,
    connections: DashMap<UserId, u32>,
}

/// 某个身份的连续拒绝记录
#[derive(Debug, Clone, Copy)]
struct Denials {
    consecutive: u32,
    last: tokio::time::Instant,
}

impl RateLimiter {
    pub fn new(
        store: Arc<dyn RateLimitStore>,
        budget: u32,
        window: Duration,
        abuse_threshold: u32,
        max_connections_per_user: u32,
    ) -> Self {
        Self {
            store,
            budget,
            window,
            abuse_threshold,
            max_connections_per_user,
            denials: DashMap::new(),
            connections: DashMap::new(),
        }
    }

    /// 用户身份键，建连与消息共用同一份预算
    pub fn identity(user_id: UserId) -> String {
        format!("user:{user_id}")
    }

    /// 准入检查。存储不可用时返回错误，调用方据此拒绝动作
    pub async fn admit(&self, identity: &str, cost: u32) -> Result<Admission, ApplicationError> {
        let count = self.store.hit(identity, cost, self.window).await?;
        if count <= self.budget {
            self.denials.remove(identity);
            return Ok(Admission::Allowed);
        }

        let consecutive = {
            let now = tokio::time::Instant::now();
            let mut denials = self
                .denials
                .entry(identity.to_string())
                .or_insert(Denials {
                    consecutive: 0,
                    last: now,
                });
            denials.consecutive += 1;
            denials.last = now;
            denials.consecutive
        };
        tracing::info!(
            identity,
            count,
            budget = self.budget,
            consecutive,
            "rate limit exceeded"
        );
        Ok(Admission::Denied {
            abusive: consecutive >= self.abuse_threshold,
        })
    }

    /// 检查并占用一个连接名额
    pub fn acquire_connection(&self, user_id: UserId) -> Result<(), AuthError> {
        let mut count = self.connections.entry(user_id).or_insert(0);
        if *count >= self.max_connections_per_user {
            return Err(AuthError::TooManyConnections {
                current: *count,
                max: self.max_connections_per_user,
            });
        }
        *count += 1;
        Ok(())
    }

    /// 用户断开连接时调用
    pub fn release_connection(&self, user_id: UserId) {
        if let Some(mut count) = self.connections.get_mut(&user_id) {
            *count = count.saturating_sub(1);
        }
        // 如果连接数为0，从map中移除
        self.connections.remove_if(&user_id, |_, count| *count == 0);
    }

    pub fn connection_count(&self, user_id: UserId) -> u32 {
        self.connections.get(&user_id).map(|count| *count).unwrap_or(0)
    }

    /// 清理过期的配额记录与拒绝计数（防止内存泄漏）
    pub async fn cleanup(&self) {
        let now = tokio::time::Instant::now();
        self.denials
            .retain(|_, denials| now.duration_since(denials.last) < self.window * 2);
        if let Err(err) = self.store.prune(self.window).await {
            tracing::warn!(error = %err, "rate limit prune failed");
        }
    }

    /// 仍在跟踪连续拒绝的身份数
    pub fn tracked_denials(&self) -> usize {
        self.denials.len()
    }
}
