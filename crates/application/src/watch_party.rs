//! 观影派对协调器
//!
//! 派对记录归 CRUD 层所有，首次使用时经 [`WatchPartyDirectory`] 载入并缓存。
//! 只有主持人可以广播播放进度或推进状态；结束与取消会拆除整个房间。

use std::sync::Arc;

use chrono::Utc;
use dashmap::DashMap;
use domain::{
    event_types, ConnectionId, Envelope, Identity, PlaybackState, RoomKind, RoomName, UserId,
    WatchPartyRecord, WatchPartyStatus,
};
use serde_json::json;
use tokio::sync::{Mutex, OwnedMutexGuard};
use uuid::Uuid;

use crate::broadcaster::EventBroadcaster;
use crate::collaborators::{EventPersister, NotificationQueue, ParticipantStatus, WatchPartyDirectory};
use crate::error::ApplicationError;
use crate::rooms::RoomRegistry;

/// 加入结果
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JoinOutcome {
    Joined,
    /// 需要主持人审批，已通知主持人
    Pending,
}

pub struct WatchPartyCoordinator {
    directory: Arc<dyn WatchPartyDirectory>,
    rooms: Arc<RoomRegistry>,
    broadcaster: Arc<EventBroadcaster>,
    notifications: Arc<dyn NotificationQueue>,
    persister: Arc<dyn EventPersister>,
    parties: DashMap<String, WatchPartyRecord>,
    playback: DashMap<String, PlaybackState>,
    locks: DashMap<String, Arc<Mutex<()>>>,
}

fn party_room(party_id: &str) -> Result<RoomName, ApplicationError> {
    Ok(RoomName::new(RoomKind::WatchParty, party_id)?)
}

fn ensure_host(record: &WatchPartyRecord, user_id: UserId, action: &str) -> Result<(), ApplicationError> {
    if record.host_id != user_id {
        tracing::info!(party_id = %record.id, user_id = %user_id, action, "non-host watch party action rejected");
        return Err(ApplicationError::PermissionDenied(format!(
            "only the host can {action} watch party {}",
            record.id
        )));
    }
    Ok(())
}

impl WatchPartyCoordinator {
    pub fn new(
        directory: Arc<dyn WatchPartyDirectory>,
        rooms: Arc<RoomRegistry>,
        broadcaster: Arc<EventBroadcaster>,
        notifications: Arc<dyn NotificationQueue>,
        persister: Arc<dyn EventPersister>,
    ) -> Self {
        Self {
            directory,
            rooms,
            broadcaster,
            notifications,
            persister,
            parties: DashMap::new(),
            playback: DashMap::new(),
            locks: DashMap::new(),
        }
    }

    async fn lock(&self, party_id: &str) -> OwnedMutexGuard<()> {
        let lock = self.locks.entry(party_id.to_string()).or_default().clone();
        lock.lock_owned().await
    }

    fn unlock(&self, party_id: &str, guard: OwnedMutexGuard<()>) {
        drop(guard);
        self.locks
            .remove_if(party_id, |_, lock| Arc::strong_count(lock) == 1);
    }

    /// 缓存优先
    async fn record(&self, party_id: &str) -> Result<WatchPartyRecord, ApplicationError> {
        if let Some(record) = self.parties.get(party_id) {
            return Ok(record.clone());
        }
        self.refresh(party_id).await
    }

    /// 从目录重新载入
    async fn refresh(&self, party_id: &str) -> Result<WatchPartyRecord, ApplicationError> {
        let record = self
            .directory
            .fetch(party_id)
            .await?
            .ok_or_else(|| ApplicationError::NotFound(format!("watch party {party_id}")))?;
        self.parties.insert(party_id.to_string(), record.clone());
        Ok(record)
    }

    pub async fn status(&self, party_id: &str) -> Result<WatchPartyStatus, ApplicationError> {
        Ok(self.record(party_id).await?.status)
    }

    pub fn playback(&self, party_id: &str) -> Option<PlaybackState> {
        self.playback.get(party_id).map(|state| *state)
    }

    pub async fn join(
        &self,
        identity: &Identity,
        connection_id: ConnectionId,
        party_id: &str,
    ) -> Result<JoinOutcome, ApplicationError> {
        let guard = self.lock(party_id).await;
        let result = self.join_locked(identity, connection_id, party_id).await;
        self.unlock(party_id, guard);
        result
    }

    async fn join_locked(
        &self,
        identity: &Identity,
        connection_id: ConnectionId,
        party_id: &str,
    ) -> Result<JoinOutcome, ApplicationError> {
        let user_id = identity.user_id;
        let record = self.refresh(party_id).await?;
        if record.status.is_terminal() {
            return Err(ApplicationError::Conflict(format!(
                "watch party {party_id} is {}",
                record.status
            )));
        }
        let room = party_room(party_id)?;
        if self.rooms.is_connection_in(connection_id, &room) {
            return Ok(JoinOutcome::Joined);
        }

        let is_host = record.host_id == user_id;
        if !is_host {
            let participant = self.directory.participant(party_id, user_id).await?;
            if record.requires_approval && participant != Some(ParticipantStatus::Active) {
                if participant.is_none() {
                    self.request_approval(&record, identity).await?;
                }
                return Ok(JoinOutcome::Pending);
            }
            if participant.is_none() {
                self.directory
                    .set_participant(party_id, user_id, ParticipantStatus::Active)
                    .await?;
            }
        }

        let membership = self.rooms.join_unchecked(user_id, connection_id, &room).await?;
        if membership.is_first_for_user() {
            let envelope = Envelope::new(
                event_types::WATCH_PARTY_USER_JOINED,
                json!({
                    "partyId": party_id,
                    "userId": user_id.to_string(),
                    "username": identity.username,
                    "isHost": is_host,
                }),
            )
            .to_room(room);
            self.broadcaster.publish(envelope).await?;
        }

        // 迟到者直接拿到当前进度
        if let Some(state) = self.playback(party_id) {
            self.broadcaster.send_to_connection(
                connection_id,
                domain::WireMessage::from_envelope(&Self::sync_envelope(&record, &state)),
            );
        }
        tracing::info!(party_id, user_id = %user_id, is_host, "joined watch party");
        Ok(JoinOutcome::Joined)
    }

    async fn request_approval(
        &self,
        record: &WatchPartyRecord,
        identity: &Identity,
    ) -> Result<(), ApplicationError> {
        self.directory
            .set_participant(&record.id, identity.user_id, ParticipantStatus::Pending)
            .await?;
        let payload = json!({
            "partyId": record.id,
            "userId": identity.user_id.to_string(),
            "username": identity.username,
        });
        self.notifications
            .enqueue(
                record.host_id,
                json!({ "type": event_types::WATCH_PARTY_JOIN_REQUEST, "data": payload }),
            )
            .await?;
        let envelope =
            Envelope::new(event_types::WATCH_PARTY_JOIN_REQUEST, payload).to_user(record.host_id);
        self.broadcaster.publish(envelope).await?;
        tracing::info!(party_id = %record.id, user_id = %identity.user_id, "watch party join pending approval");
        Ok(())
    }

    /// 主持人批准待审请求；用户收到通知后重新发送加入请求
    pub async fn approve(
        &self,
        host: &Identity,
        party_id: &str,
        user_id: UserId,
    ) -> Result<(), ApplicationError> {
        let record = self.record(party_id).await?;
        ensure_host(&record, host.user_id, "approve requests for")?;
        if record.status.is_terminal() {
            return Err(ApplicationError::Conflict(format!(
                "watch party {party_id} is {}",
                record.status
            )));
        }
        match self.directory.participant(party_id, user_id).await? {
            Some(ParticipantStatus::Pending) => {}
            Some(ParticipantStatus::Active) => return Ok(()),
            None => {
                return Err(ApplicationError::NotFound(format!(
                    "no pending request from {user_id} for watch party {party_id}"
                )))
            }
        }

        self.directory
            .set_participant(party_id, user_id, ParticipantStatus::Active)
            .await?;
        let payload = json!({ "partyId": party_id, "hostId": host.user_id.to_string() });
        self.notifications
            .enqueue(
                user_id,
                json!({ "type": event_types::WATCH_PARTY_JOIN_APPROVED, "data": payload }),
            )
            .await?;
        self.broadcaster
            .publish(Envelope::new(event_types::WATCH_PARTY_JOIN_APPROVED, payload).to_user(user_id))
            .await?;
        Ok(())
    }

    pub async fn leave(
        &self,
        identity: &Identity,
        connection_id: ConnectionId,
        party_id: &str,
    ) -> Result<(), ApplicationError> {
        let room = party_room(party_id)?;
        if self.rooms.leave(identity.user_id, connection_id, &room).await? {
            self.publish_user_left(party_id, identity.user_id, "left").await?;
        }
        Ok(())
    }

    async fn publish_user_left(
        &self,
        party_id: &str,
        user_id: UserId,
        reason: &str,
    ) -> Result<(), ApplicationError> {
        let envelope = Envelope::new(
            event_types::WATCH_PARTY_USER_LEFT,
            json!({ "partyId": party_id, "userId": user_id.to_string(), "reason": reason }),
        )
        .to_room(party_room(party_id)?);
        self.broadcaster.publish(envelope).await?;
        Ok(())
    }

    fn sync_envelope(record: &WatchPartyRecord, state: &PlaybackState) -> Envelope {
        Envelope::new(
            event_types::WATCH_PARTY_PLAYBACK_SYNC,
            json!({
                "partyId": record.id,
                "hostId": record.host_id.to_string(),
                "position": state.position,
                "isPlaying": state.is_playing,
                "updatedAt": state.updated_at,
            }),
        )
    }

    /// 主持人广播播放进度；其他人的尝试被拒绝且不产生任何广播
    pub async fn sync(
        &self,
        identity: &Identity,
        connection_id: ConnectionId,
        party_id: &str,
        position: f64,
        is_playing: bool,
    ) -> Result<(), ApplicationError> {
        let record = self.record(party_id).await?;
        ensure_host(&record, identity.user_id, "sync")?;
        if record.status != WatchPartyStatus::Live {
            return Err(ApplicationError::Conflict(format!(
                "watch party {party_id} is {}, not live",
                record.status
            )));
        }

        let state = PlaybackState {
            position,
            is_playing,
            updated_at: Utc::now(),
        };
        self.playback.insert(party_id.to_string(), state);
        let envelope = Self::sync_envelope(&record, &state)
            .to_room(party_room(party_id)?)
            .excluding(connection_id);
        self.broadcaster.publish(envelope).await?;
        Ok(())
    }

    /// 派对聊天：先持久化，失败则整个动作失败
    pub async fn send_message(
        &self,
        identity: &Identity,
        connection_id: ConnectionId,
        party_id: &str,
        content: String,
    ) -> Result<(), ApplicationError> {
        let room = party_room(party_id)?;
        if !self.rooms.is_connection_in(connection_id, &room) {
            return Err(ApplicationError::access_denied(&room));
        }
        let record = self.record(party_id).await?;
        if record.status.is_terminal() {
            return Err(ApplicationError::Conflict(format!(
                "watch party {party_id} is {}",
                record.status
            )));
        }

        let mut envelope = Envelope::new(
            event_types::WATCH_PARTY_MESSAGE,
            json!({
                "partyId": party_id,
                "messageId": Uuid::new_v4().to_string(),
                "userId": identity.user_id.to_string(),
                "username": identity.username,
                "content": content,
            }),
        )
        .to_room(room);
        envelope.id = Some(Uuid::new_v4().to_string());
        self.persister.persist(&envelope).await?;
        self.broadcaster.publish(envelope).await?;
        Ok(())
    }

    pub async fn start(&self, host: &Identity, party_id: &str) -> Result<(), ApplicationError> {
        self.transition(host, party_id, WatchPartyStatus::Live, "start").await?;
        let envelope = Envelope::new(
            event_types::WATCH_PARTY_STARTED,
            json!({ "partyId": party_id, "hostId": host.user_id.to_string() }),
        )
        .to_room(party_room(party_id)?);
        self.broadcaster.publish(envelope).await?;
        Ok(())
    }

    pub async fn end(&self, host: &Identity, party_id: &str) -> Result<(), ApplicationError> {
        self.transition(host, party_id, WatchPartyStatus::Ended, "end").await?;
        self.teardown(party_id, event_types::WATCH_PARTY_ENDED, "ended").await
    }

    pub async fn cancel(&self, host: &Identity, party_id: &str) -> Result<(), ApplicationError> {
        self.transition(host, party_id, WatchPartyStatus::Cancelled, "cancel")
            .await?;
        self.teardown(party_id, event_types::WATCH_PARTY_CANCELLED, "cancelled")
            .await
    }

    async fn transition(
        &self,
        host: &Identity,
        party_id: &str,
        next: WatchPartyStatus,
        action: &str,
    ) -> Result<(), ApplicationError> {
        let guard = self.lock(party_id).await;
        let result: Result<(), ApplicationError> = async {
            let mut record = self.refresh(party_id).await?;
            ensure_host(&record, host.user_id, action)?;
            let status = record
                .status
                .transition(next)
                .map_err(|err| ApplicationError::Conflict(err.to_string()))?;
            self.directory.update_status(party_id, status).await?;
            record.status = status;
            self.parties.insert(party_id.to_string(), record);
            tracing::info!(party_id, status = %status, "watch party status changed");
            Ok(())
        }
        .await;
        self.unlock(party_id, guard);
        result
    }

    /// 每个成员收到 userLeft，再广播终态事件，最后删除房间
    async fn teardown(&self, party_id: &str, event_type: &str, reason: &str) -> Result<(), ApplicationError> {
        let room = party_room(party_id)?;
        let members = self.rooms.members_of(&room).await?;
        for user_id in &members {
            self.publish_user_left(party_id, *user_id, reason).await?;
        }
        let envelope = Envelope::new(event_type, json!({ "partyId": party_id }))
            .to_room(room.clone());
        self.broadcaster.publish(envelope).await?;

        self.rooms.clear_room(&room).await?;
        self.playback.remove(party_id);
        tracing::info!(party_id, members = members.len(), reason, "watch party torn down");
        Ok(())
    }
}
