//! CRUD 层协作方接口
//!
//! 枢纽只通过这些窄接口访问外部系统：会话查询、房间准入、事件持久化、
//! 通知入队、观影派对记录。它们是唯一允许挂起等待 I/O 的调用点。

use async_trait::async_trait;
use domain::{Envelope, RoomName, Session, UserId, WatchPartyRecord, WatchPartyStatus};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::ApplicationError;

/// 观影派对参与者记录的状态
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ParticipantStatus {
    Pending,
    Active,
}

/// `LookupSession(token) -> {userId, role, expiry} | invalid`
#[cfg_attr(any(test, feature = "testing"), mockall::automock)]
#[async_trait]
pub trait SessionLookup: Send + Sync {
    async fn lookup(&self, token: &str) -> Result<Option<Session>, ApplicationError>;
}

/// `CheckRoomAccess(userId, room) -> bool`
#[cfg_attr(any(test, feature = "testing"), mockall::automock)]
#[async_trait]
pub trait RoomAccessChecker: Send + Sync {
    async fn check_access(&self, user_id: UserId, room: &RoomName)
        -> Result<bool, ApplicationError>;
}

/// `PersistDomainEvent(envelope)`
#[cfg_attr(any(test, feature = "testing"), mockall::automock)]
#[async_trait]
pub trait EventPersister: Send + Sync {
    async fn persist(&self, envelope: &Envelope) -> Result<(), ApplicationError>;
}

/// `EnqueueNotification(userId, payload)`
#[cfg_attr(any(test, feature = "testing"), mockall::automock)]
#[async_trait]
pub trait NotificationQueue: Send + Sync {
    async fn enqueue(&self, user_id: UserId, payload: Value) -> Result<(), ApplicationError>;
}

/// 观影派对与参与者记录
#[cfg_attr(any(test, feature = "testing"), mockall::automock)]
#[async_trait]
pub trait WatchPartyDirectory: Send + Sync {
    async fn fetch(&self, party_id: &str) -> Result<Option<WatchPartyRecord>, ApplicationError>;

    async fn update_status(
        &self,
        party_id: &str,
        status: WatchPartyStatus,
    ) -> Result<(), ApplicationError>;

    async fn participant(
        &self,
        party_id: &str,
        user_id: UserId,
    ) -> Result<Option<ParticipantStatus>, ApplicationError>;

    async fn set_participant(
        &self,
        party_id: &str,
        user_id: UserId,
        status: ParticipantStatus,
    ) -> Result<(), ApplicationError>;
}

/// 本地实现，用于开发环境和测试
pub mod local {
    use super::*;
    use dashmap::DashMap;
    use domain::RoomKind;
    use std::sync::Arc;

    /// 宽松的准入策略：`user:<id>` 只允许本人，其余房间一律放行
    #[derive(Debug, Default, Clone)]
    pub struct PermissiveAccess;

    #[async_trait]
    impl RoomAccessChecker for PermissiveAccess {
        async fn check_access(
            &self,
            user_id: UserId,
            room: &RoomName,
        ) -> Result<bool, ApplicationError> {
            Ok(match room.kind() {
                RoomKind::User => room.key() == user_id.to_string(),
                _ => true,
            })
        }
    }

    /// 只记录日志的持久化
    #[derive(Debug, Default, Clone)]
    pub struct LoggingPersister;

    #[async_trait]
    impl EventPersister for LoggingPersister {
        async fn persist(&self, envelope: &Envelope) -> Result<(), ApplicationError> {
            tracing::debug!(event_type = %envelope.event_type, "persist (local no-op)");
            Ok(())
        }
    }

    #[derive(Debug, Default, Clone)]
    pub struct LoggingNotificationQueue;

    #[async_trait]
    impl NotificationQueue for LoggingNotificationQueue {
        async fn enqueue(&self, user_id: UserId, payload: Value) -> Result<(), ApplicationError> {
            tracing::debug!(user_id = %user_id, payload = %payload, "enqueue notification (local no-op)");
            Ok(())
        }
    }

    /// 内存中的派对目录
    #[derive(Debug, Default, Clone)]
    pub struct InMemoryWatchPartyDirectory {
        parties: Arc<DashMap<String, WatchPartyRecord>>,
        participants: Arc<DashMap<(String, UserId), ParticipantStatus>>,
    }

    impl InMemoryWatchPartyDirectory {
        pub fn new() -> Self {
            Self::default()
        }

        pub fn insert(&self, record: WatchPartyRecord) {
            self.parties.insert(record.id.clone(), record);
        }
    }

    #[async_trait]
    impl WatchPartyDirectory for InMemoryWatchPartyDirectory {
        async fn fetch(&self, party_id: &str) -> Result<Option<WatchPartyRecord>, ApplicationError> {
            Ok(self.parties.get(party_id).map(|r| r.clone()))
        }

        async fn update_status(
            &self,
            party_id: &str,
            status: WatchPartyStatus,
        ) -> Result<(), ApplicationError> {
            let mut record = self
                .parties
                .get_mut(party_id)
                .ok_or_else(|| ApplicationError::NotFound(format!("watch party {party_id}")))?;
            record.status = status;
            Ok(())
        }

        async fn participant(
            &self,
            party_id: &str,
            user_id: UserId,
        ) -> Result<Option<ParticipantStatus>, ApplicationError> {
            Ok(self
                .participants
                .get(&(party_id.to_string(), user_id))
                .map(|s| *s))
        }

        async fn set_participant(
            &self,
            party_id: &str,
            user_id: UserId,
            status: ParticipantStatus,
        ) -> Result<(), ApplicationError> {
            self.participants
                .insert((party_id.to_string(), user_id), status);
            Ok(())
        }
    }

}
