//! 在线状态
//!
//! 共享存储记录每个用户的状态和每条连接的心跳。连接心跳超过陈旧阈值即视为失效，
//! 这样崩溃进程遗留的连接会在清扫时被剔除。
//! 同一用户的状态迁移在本进程内按用户串行，跨进程依靠后端的比较并交换。

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashMap;
use domain::{
    event_types, ConnectionId, Envelope, PresenceEntry, PresenceStatus, RoomName, Timestamp, UserId,
};
use serde_json::json;
use tokio::sync::{Mutex, OwnedMutexGuard};

use crate::error::ApplicationError;

/// CAS 冲突时的最大重试次数
const MAX_CAS_ATTEMPTS: usize = 5;

#[async_trait]
pub trait PresenceBackend: Send + Sync {
    /// 登记连接并刷新心跳，返回该用户当前登记的连接数
    async fn register_connection(
        &self,
        user_id: UserId,
        connection_id: ConnectionId,
    ) -> Result<usize, ApplicationError>;

    /// 注销连接，返回剩余连接数
    async fn unregister_connection(
        &self,
        user_id: UserId,
        connection_id: ConnectionId,
    ) -> Result<usize, ApplicationError>;

    /// 刷新连接心跳与最近活跃时间。未登记的连接不会被重新登记
    async fn touch(&self, user_id: UserId, connection_id: ConnectionId) -> Result<(), ApplicationError>;

    async fn live_connections(&self, user_id: UserId) -> Result<usize, ApplicationError>;

    async fn entry(&self, user_id: UserId) -> Result<Option<PresenceEntry>, ApplicationError>;

    /// 当前状态等于 `expected` 时原子地改为 `new`。没有记录视为 offline
    async fn compare_and_set(
        &self,
        user_id: UserId,
        expected: PresenceStatus,
        new: PresenceStatus,
    ) -> Result<bool, ApplicationError>;

    /// 状态为 online/away 的用户
    async fn online_users(&self) -> Result<Vec<UserId>, ApplicationError>;

    /// 非 offline 且需要清扫的用户：有心跳超过 `threshold` 的连接，
    /// 或已没有连接且最近一次活动（含注销连接）早于 `threshold`
    async fn stale_users(&self, threshold: Duration) -> Result<Vec<UserId>, ApplicationError>;

    /// 剔除心跳超过 `threshold` 的连接
    async fn prune_connections(
        &self,
        user_id: UserId,
        threshold: Duration,
    ) -> Result<PrunedConnections, ApplicationError>;
}

/// 一次剔除的结果
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PrunedConnections {
    pub pruned: Vec<ConnectionId>,
    pub remaining: usize,
}

/// 内存实现，时间基于 tokio 时钟以便在测试中暂停
pub mod memory {
    use super::*;
    use chrono::Utc;
    use std::collections::HashMap;
    use tokio::time::Instant;

    struct Record {
        status: PresenceStatus,
        last_active: Timestamp,
        last_seen: Instant,
        connections: HashMap<ConnectionId, Instant>,
    }

    impl Record {
        fn new() -> Self {
            Self {
                status: PresenceStatus::Offline,
                last_active: Utc::now(),
                last_seen: Instant::now(),
                connections: HashMap::new(),
            }
        }

        fn seen(&mut self) {
            self.last_active = Utc::now();
            self.last_seen = Instant::now();
        }
    }

    #[derive(Default)]
    pub struct MemoryPresenceBackend {
        records: DashMap<UserId, Record>,
    }

    impl MemoryPresenceBackend {
        pub fn new() -> Self {
            Self::default()
        }
    }

    #[async_trait]
    impl PresenceBackend for MemoryPresenceBackend {
        async fn register_connection(
            &self,
            user_id: UserId,
            connection_id: ConnectionId,
        ) -> Result<usize, ApplicationError> {
            let mut record = self.records.entry(user_id).or_insert_with(Record::new);
            record.seen();
            record.connections.insert(connection_id, Instant::now());
            Ok(record.connections.len())
        }

        async fn unregister_connection(
            &self,
            user_id: UserId,
            connection_id: ConnectionId,
        ) -> Result<usize, ApplicationError> {
            Ok(match self.records.get_mut(&user_id) {
                Some(mut record) => {
                    if record.connections.remove(&connection_id).is_some() {
                        record.last_seen = Instant::now();
                    }
                    record.connections.len()
                }
                None => 0,
            })
        }

        async fn touch(
            &self,
            user_id: UserId,
            connection_id: ConnectionId,
        ) -> Result<(), ApplicationError> {
            if let Some(mut record) = self.records.get_mut(&user_id) {
                if let Some(heartbeat) = record.connections.get_mut(&connection_id) {
                    *heartbeat = Instant::now();
                    record.seen();
                }
            }
            Ok(())
        }

        async fn live_connections(&self, user_id: UserId) -> Result<usize, ApplicationError> {
            Ok(self
                .records
                .get(&user_id)
                .map(|record| record.connections.len())
                .unwrap_or(0))
        }

        async fn entry(&self, user_id: UserId) -> Result<Option<PresenceEntry>, ApplicationError> {
            Ok(self.records.get(&user_id).map(|record| PresenceEntry {
                user_id,
                status: record.status,
                last_active: record.last_active,
            }))
        }

        async fn compare_and_set(
            &self,
            user_id: UserId,
            expected: PresenceStatus,
            new: PresenceStatus,
        ) -> Result<bool, ApplicationError> {
            let mut record = self.records.entry(user_id).or_insert_with(Record::new);
            if record.status != expected {
                return Ok(false);
            }
            record.status = new;
            record.last_active = Utc::now();
            Ok(true)
        }

        async fn online_users(&self) -> Result<Vec<UserId>, ApplicationError> {
            Ok(self
                .records
                .iter()
                .filter(|record| record.status.is_connected())
                .map(|record| *record.key())
                .collect())
        }

        async fn stale_users(&self, threshold: Duration) -> Result<Vec<UserId>, ApplicationError> {
            let now = Instant::now();
            Ok(self
                .records
                .iter()
                .filter(|record| {
                    let expired = |seen: &Instant| now.duration_since(*seen) >= threshold;
                    record.status.is_connected()
                        && if record.connections.is_empty() {
                            expired(&record.last_seen)
                        } else {
                            record.connections.values().any(expired)
                        }
                })
                .map(|record| *record.key())
                .collect())
        }

        async fn prune_connections(
            &self,
            user_id: UserId,
            threshold: Duration,
        ) -> Result<PrunedConnections, ApplicationError> {
            let now = Instant::now();
            let Some(mut record) = self.records.get_mut(&user_id) else {
                return Ok(PrunedConnections::default());
            };
            let pruned: Vec<ConnectionId> = record
                .connections
                .iter()
                .filter(|(_, heartbeat)| now.duration_since(**heartbeat) >= threshold)
                .map(|(connection_id, _)| *connection_id)
                .collect();
            for connection_id in &pruned {
                record.connections.remove(connection_id);
            }
            Ok(PrunedConnections {
                pruned,
                remaining: record.connections.len(),
            })
        }
    }
}

/// 一次实际发生的状态变化
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PresenceTransition {
    pub user_id: UserId,
    pub from: PresenceStatus,
    pub to: PresenceStatus,
}

impl PresenceTransition {
    /// 对应的广播事件。online/offline 走默认路由到粉丝房间，away 显式指定同一房间
    pub fn envelope(&self) -> Envelope {
        let payload = json!({
            "userId": self.user_id.to_string(),
            "status": self.to.as_str(),
            "previous": self.from.as_str(),
        });
        match self.to {
            PresenceStatus::Online => Envelope::new(event_types::USER_ONLINE, payload),
            PresenceStatus::Offline => Envelope::new(event_types::USER_OFFLINE, payload),
            PresenceStatus::Away => Envelope::new(event_types::USER_AWAY, payload)
                .to_room(RoomName::followers(self.user_id)),
        }
    }
}

/// 一次清扫的结果
#[derive(Debug, Clone, Default)]
pub struct SweepReport {
    /// 被强制置为 offline 的用户
    pub transitions: Vec<PresenceTransition>,
    /// 被剔除的失效连接，调用方据此清理房间成员
    pub pruned: Vec<(UserId, ConnectionId)>,
}

pub struct PresenceStore {
    backend: Arc<dyn PresenceBackend>,
    staleness: Duration,
    sequencers: DashMap<UserId, Arc<Mutex<()>>>,
}

impl PresenceStore {
    pub fn new(backend: Arc<dyn PresenceBackend>, staleness: Duration) -> Self {
        Self {
            backend,
            staleness,
            sequencers: DashMap::new(),
        }
    }

    async fn sequence(&self, user_id: UserId) -> OwnedMutexGuard<()> {
        let lock = self.sequencers.entry(user_id).or_default().clone();
        lock.lock_owned().await
    }

    fn release(&self, user_id: UserId, guard: OwnedMutexGuard<()>) {
        drop(guard);
        self.sequencers
            .remove_if(&user_id, |_, lock| Arc::strong_count(lock) == 1);
    }

    /// 在持有用户序列锁时调用：只有状态真正改变才返回迁移
    async fn transition(
        &self,
        user_id: UserId,
        target: PresenceStatus,
    ) -> Result<Option<PresenceTransition>, ApplicationError> {
        for _ in 0..MAX_CAS_ATTEMPTS {
            let current = self
                .backend
                .entry(user_id)
                .await?
                .map(|entry| entry.status)
                .unwrap_or(PresenceStatus::Offline);
            if current == target {
                return Ok(None);
            }
            if self.backend.compare_and_set(user_id, current, target).await? {
                tracing::debug!(user_id = %user_id, from = %current, to = %target, "presence changed");
                return Ok(Some(PresenceTransition {
                    user_id,
                    from: current,
                    to: target,
                }));
            }
        }
        Err(ApplicationError::infrastructure(format!(
            "presence update for {user_id} kept conflicting"
        )))
    }

    async fn sequenced_transition(
        &self,
        user_id: UserId,
        target: PresenceStatus,
    ) -> Result<Option<PresenceTransition>, ApplicationError> {
        let guard = self.sequence(user_id).await;
        let result = self.transition(user_id, target).await;
        self.release(user_id, guard);
        result
    }

    /// 新连接：登记并标记在线
    pub async fn connection_opened(
        &self,
        user_id: UserId,
        connection_id: ConnectionId,
    ) -> Result<Option<PresenceTransition>, ApplicationError> {
        let guard = self.sequence(user_id).await;
        let result: Result<_, ApplicationError> = async {
            self.backend.register_connection(user_id, connection_id).await?;
            self.transition(user_id, PresenceStatus::Online).await
        }
        .await;
        self.release(user_id, guard);
        result
    }

    /// 连接关闭：注销并返回剩余连接数。状态不在这里改变，留给宽限期结算
    pub async fn connection_closed(
        &self,
        user_id: UserId,
        connection_id: ConnectionId,
    ) -> Result<usize, ApplicationError> {
        let guard = self.sequence(user_id).await;
        let result = self.backend.unregister_connection(user_id, connection_id).await;
        self.release(user_id, guard);
        result
    }

    pub async fn mark_online(&self, user_id: UserId) -> Result<Option<PresenceTransition>, ApplicationError> {
        self.sequenced_transition(user_id, PresenceStatus::Online).await
    }

    pub async fn mark_away(&self, user_id: UserId) -> Result<Option<PresenceTransition>, ApplicationError> {
        self.sequenced_transition(user_id, PresenceStatus::Away).await
    }

    pub async fn mark_offline(&self, user_id: UserId) -> Result<Option<PresenceTransition>, ApplicationError> {
        self.sequenced_transition(user_id, PresenceStatus::Offline).await
    }

    /// 宽限期结束：仍无任何连接时才置为 offline
    pub async fn settle_offline(
        &self,
        user_id: UserId,
    ) -> Result<Option<PresenceTransition>, ApplicationError> {
        let guard = self.sequence(user_id).await;
        let result: Result<_, ApplicationError> = async {
            if self.backend.live_connections(user_id).await? > 0 {
                return Ok(None);
            }
            self.transition(user_id, PresenceStatus::Offline).await
        }
        .await;
        self.release(user_id, guard);
        result
    }

    pub async fn touch(&self, user_id: UserId, connection_id: ConnectionId) -> Result<(), ApplicationError> {
        self.backend.touch(user_id, connection_id).await
    }

    pub async fn is_online(&self, user_id: UserId) -> Result<bool, ApplicationError> {
        Ok(self
            .backend
            .entry(user_id)
            .await?
            .map(|entry| entry.status.is_connected())
            .unwrap_or(false))
    }

    /// 当前条目，没有记录时返回 offline
    pub async fn status(&self, user_id: UserId) -> Result<PresenceEntry, ApplicationError> {
        Ok(self
            .backend
            .entry(user_id)
            .await?
            .unwrap_or_else(|| PresenceEntry::offline(user_id, chrono::Utc::now())))
    }

    pub async fn online_users(&self) -> Result<Vec<UserId>, ApplicationError> {
        self.backend.online_users().await
    }

    /// 清扫：剔除陈旧连接，已无连接的用户强制 offline
    pub async fn sweep(&self) -> Result<SweepReport, ApplicationError> {
        let mut report = SweepReport::default();
        for user_id in self.backend.stale_users(self.staleness).await? {
            let guard = self.sequence(user_id).await;
            let result: Result<_, ApplicationError> = async {
                let pruned = self.backend.prune_connections(user_id, self.staleness).await?;
                let transition = if pruned.remaining > 0 {
                    None
                } else {
                    self.transition(user_id, PresenceStatus::Offline).await?
                };
                Ok((pruned.pruned, transition))
            }
            .await;
            self.release(user_id, guard);
            match result {
                Ok((pruned, transition)) => {
                    report
                        .pruned
                        .extend(pruned.into_iter().map(|connection_id| (user_id, connection_id)));
                    report.transitions.extend(transition);
                }
                Err(err) => {
                    tracing::error!(user_id = %user_id, error = %err, "presence sweep failed for user")
                }
            }
        }
        if !report.pruned.is_empty() || !report.transitions.is_empty() {
            tracing::info!(
                pruned = report.pruned.len(),
                offline = report.transitions.len(),
                "presence sweep removed dead connections"
            );
        }
        Ok(report)
    }
}
