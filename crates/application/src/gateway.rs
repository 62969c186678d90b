//! 连接网关
//!
//! [`RealtimeHub`] 是显式构造的服务对象，持有全部组件。传输层通过 [`RealtimeHub::accept`]
//! 拿到 [`ConnectionSession`]，之后把每条入站文本交给它处理，并从出站队列取事件写回套接字。

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;

use chrono::Utc;
use config::HubConfig;
use domain::{
    event_types, ClientMessage, ConnectionId, DomainError, Envelope, Identity, PresenceEntry,
    PresenceStatus, RoomKind, RoomName, Timestamp, UserId, WireMessage,
};
use serde_json::{json, Value};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use uuid::Uuid;

use crate::broadcaster::{ConnectionDirectory, EventBroadcaster, Outbound};
use crate::bus::EventBus;
use crate::collaborators::{
    EventPersister, NotificationQueue, RoomAccessChecker, SessionLookup, WatchPartyDirectory,
};
use crate::error::{ApplicationError, AuthError};
use crate::presence::{PresenceBackend, PresenceStore, PresenceTransition, SweepReport};
use crate::rate_limiter::{Admission, RateLimitStore, RateLimiter};
use crate::rooms::{MembershipBackend, RoomRegistry};
use crate::scheduler::{Expired, ExpiryScheduler};
use crate::typing::TypingManager;
use crate::watch_party::{JoinOutcome, WatchPartyCoordinator};

/// WebSocket 关闭码：策略违规
pub const CLOSE_POLICY_VIOLATION: u16 = 1008;
/// WebSocket 关闭码：服务端下线
pub const CLOSE_GOING_AWAY: u16 = 1001;

/// 枢纽运行参数
#[derive(Debug, Clone)]
pub struct HubSettings {
    pub outbound_buffer: usize,
    pub staleness: Duration,
    pub sweep_interval: Duration,
    pub grace_period: Duration,
    pub typing_expiry: Duration,
    pub rate_budget: u32,
    pub rate_window: Duration,
    pub abuse_threshold: u32,
    pub max_connections_per_user: u32,
}

impl From<&HubConfig> for HubSettings {
    fn from(config: &HubConfig) -> Self {
        Self {
            outbound_buffer: config.server.outbound_buffer,
            staleness: config.presence.staleness(),
            sweep_interval: config.presence.sweep_interval(),
            grace_period: config.presence.grace_period(),
            typing_expiry: config.typing.expiry(),
            rate_budget: config.rate_limit.budget,
            rate_window: config.rate_limit.window(),
            abuse_threshold: config.rate_limit.abuse_threshold,
            max_connections_per_user: config.rate_limit.max_connections_per_user,
        }
    }
}

impl Default for HubSettings {
    fn default() -> Self {
        Self::from(&HubConfig::default())
    }
}

pub struct HubDependencies {
    pub settings: HubSettings,
    pub bus: Arc<dyn EventBus>,
    pub presence: Arc<dyn PresenceBackend>,
    pub membership: Arc<dyn MembershipBackend>,
    pub rate_limits: Arc<dyn RateLimitStore>,
    pub sessions: Arc<dyn SessionLookup>,
    pub access: Arc<dyn RoomAccessChecker>,
    pub persister: Arc<dyn EventPersister>,
    pub notifications: Arc<dyn NotificationQueue>,
    pub watch_parties: Arc<dyn WatchPartyDirectory>,
}

/// 一条已认证的连接。身份快照在认证时确定，之后不变；已加入的房间由注册表维护
#[derive(Debug, Clone)]
pub struct Connection {
    pub id: ConnectionId,
    pub identity: Identity,
    pub created_at: Timestamp,
}

impl Connection {
    pub fn user_id(&self) -> UserId {
        self.identity.user_id
    }
}

/// 处理一条入站消息后传输层应采取的动作
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DispatchOutcome {
    Continue,
    Close { code: u16, reason: String },
}

pub struct RealtimeHub {
    settings: HubSettings,
    sessions: Arc<dyn SessionLookup>,
    persister: Arc<dyn EventPersister>,
    directory: Arc<ConnectionDirectory>,
    rooms: Arc<RoomRegistry>,
    presence: Arc<PresenceStore>,
    typing: Arc<TypingManager>,
    rate_limiter: RateLimiter,
    broadcaster: Arc<EventBroadcaster>,
    watch_parties: WatchPartyCoordinator,
    grace: ExpiryScheduler<UserId>,
    grace_generation: AtomicU64,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl RealtimeHub {
    /// 构造枢纽并启动后台任务（总线监听、输入到期、宽限期、清扫）。必须在 tokio 运行时内调用
    pub fn new(deps: HubDependencies) -> Arc<Self> {
        let settings = deps.settings;
        let directory = Arc::new(ConnectionDirectory::new());
        let rooms = Arc::new(RoomRegistry::new(deps.membership, deps.access));
        let broadcaster = Arc::new(EventBroadcaster::new(
            domain::InstanceId::generate(),
            deps.bus,
            rooms.clone(),
            directory.clone(),
        ));
        let presence = Arc::new(PresenceStore::new(deps.presence, settings.staleness));
        let rate_limiter = RateLimiter::new(
            deps.rate_limits,
            settings.rate_budget,
            settings.rate_window,
            settings.abuse_threshold,
            settings.max_connections_per_user,
        );
        let (typing, typing_task) = TypingManager::spawn(broadcaster.clone(), settings.typing_expiry);
        let watch_parties = WatchPartyCoordinator::new(
            deps.watch_parties,
            rooms.clone(),
            broadcaster.clone(),
            deps.notifications,
            deps.persister.clone(),
        );
        let (grace, grace_expired) = ExpiryScheduler::spawn();

        let hub = Arc::new(Self {
            settings,
            sessions: deps.sessions,
            persister: deps.persister,
            directory,
            rooms,
            presence,
            typing,
            rate_limiter,
            broadcaster,
            watch_parties,
            grace,
            grace_generation: AtomicU64::new(0),
            tasks: Mutex::new(Vec::new()),
        });

        let listener = hub.broadcaster.spawn_remote_listener();
        let grace_task = tokio::spawn(grace_loop(Arc::downgrade(&hub), grace_expired));
        let sweep_task = tokio::spawn(sweep_loop(Arc::downgrade(&hub), hub.settings.sweep_interval));
        if let Ok(mut tasks) = hub.tasks.lock() {
            tasks.extend([listener, typing_task, grace_task, sweep_task]);
        }

        tracing::info!(instance_id = %hub.broadcaster.instance_id(), "realtime hub started");
        hub
    }

    pub fn instance_id(&self) -> domain::InstanceId {
        self.broadcaster.instance_id()
    }

    pub fn settings(&self) -> &HubSettings {
        &self.settings
    }

    /// 通知所有挂载的连接以 1001 关闭，并停止后台任务
    pub fn shutdown(&self) {
        let attached = self.directory.all();
        for connection_id in &attached {
            self.directory.send(
                *connection_id,
                Outbound::Close {
                    code: CLOSE_GOING_AWAY,
                    reason: "server shutting down".to_string(),
                },
            );
        }
        if let Ok(mut tasks) = self.tasks.lock() {
            for task in tasks.drain(..) {
                task.abort();
            }
        }
        tracing::info!(
            instance_id = %self.instance_id(),
            connections = attached.len(),
            "realtime hub stopped"
        );
    }

    /// 认证并挂载一条连接
    ///
    /// 认证失败（无效、过期、封禁、限流、连接数超限）发生在任何状态变更之前。
    /// 新连接收到的第一条事件一定是 `users:online` 快照。
    pub async fn accept(self: &Arc<Self>, token: &str) -> Result<ConnectionSession, ApplicationError> {
        let session = self
            .sessions
            .lookup(token)
            .await?
            .ok_or(AuthError::InvalidToken)?;
        if session.is_expired(Utc::now()) {
            return Err(AuthError::Expired.into());
        }
        if session.identity.role.is_banned() {
            tracing::info!(user_id = %session.identity.user_id, "banned account refused");
            return Err(AuthError::Banned.into());
        }

        let user_id = session.identity.user_id;
        if let Admission::Denied { .. } = self
            .rate_limiter
            .admit(&RateLimiter::identity(user_id), 1)
            .await?
        {
            return Err(AuthError::RateLimited.into());
        }
        self.rate_limiter.acquire_connection(user_id)?;

        let connection = Connection {
            id: ConnectionId::generate(),
            identity: session.identity,
            created_at: Utc::now(),
        };
        let (sender, receiver) = mpsc::channel(self.settings.outbound_buffer.max(1));

        if let Err(err) = self.attach(&connection, sender).await {
            tracing::error!(user_id = %user_id, error = %err, "failed to attach connection");
            self.directory.unregister(connection.id);
            self.detach(&connection, "attach failed").await;
            return Err(err);
        }

        tracing::info!(
            user_id = %user_id,
            connection_id = %connection.id,
            username = %connection.identity.username,
            "connection accepted"
        );
        Ok(ConnectionSession {
            hub: self.clone(),
            connection,
            outbound: Some(receiver),
            closed: false,
        })
    }

    async fn attach(
        &self,
        connection: &Connection,
        sender: mpsc::Sender<Outbound>,
    ) -> Result<(), ApplicationError> {
        let user_id = connection.user_id();
        self.grace.cancel(user_id);

        let transition = self.presence.connection_opened(user_id, connection.id).await?;
        let online: Vec<String> = self
            .presence
            .online_users()
            .await?
            .into_iter()
            .map(|user| user.to_string())
            .collect();
        let snapshot = WireMessage::new(event_types::USERS_ONLINE, json!({ "users": online }));
        // 新队列必然有空位，且注册前没有其他发送方
        if sender.try_send(Outbound::Event(Arc::new(snapshot))).is_err() {
            return Err(ApplicationError::infrastructure("outbound queue unavailable"));
        }
        self.directory.register(connection.id, user_id, sender);

        self.rooms
            .join_unchecked(user_id, connection.id, &RoomName::user(user_id))
            .await?;
        self.rooms
            .join_unchecked(user_id, connection.id, &RoomName::followers(user_id))
            .await?;

        if let Some(transition) = transition {
            let envelope = transition.envelope().excluding(connection.id);
            self.publish_presence(transition, envelope).await;
        }
        Ok(())
    }

    async fn publish_transition(&self, transition: PresenceTransition) {
        self.publish_presence(transition, transition.envelope()).await;
    }

    async fn publish_presence(&self, transition: PresenceTransition, envelope: Envelope) {
        if let Err(err) = self.broadcaster.publish(envelope).await {
            tracing::error!(user_id = %transition.user_id, to = %transition.to, error = %err, "presence broadcast failed");
        }
    }

    /// 断开清理，幂等。未完成认证的连接也可以安全调用
    pub async fn disconnect(&self, connection: &Connection, reason: &str) {
        if self.directory.unregister(connection.id).is_none() {
            return;
        }
        self.detach(connection, reason).await;
    }

    async fn detach(&self, connection: &Connection, reason: &str) {
        let user_id = connection.user_id();
        self.typing.clear_all_for_connection(connection.id).await;

        for room in self.rooms.rooms_of_connection(connection.id) {
            if let Err(err) = self.leave_room(connection, &room).await {
                tracing::warn!(connection_id = %connection.id, room = %room, error = %err, "room cleanup failed");
            }
        }
        self.rate_limiter.release_connection(user_id);

        match self.presence.connection_closed(user_id, connection.id).await {
            Ok(0) => self.schedule_grace(user_id).await,
            Ok(_) => {}
            Err(err) => {
                tracing::error!(user_id = %user_id, error = %err, "presence unregister failed");
                self.schedule_grace(user_id).await;
            }
        }
        tracing::info!(user_id = %user_id, connection_id = %connection.id, reason, "connection closed");
    }

    /// 最后一条连接断开后延迟结算 offline，期间重连会取消计时
    async fn schedule_grace(&self, user_id: UserId) {
        if self.settings.grace_period.is_zero() {
            self.settle(user_id).await;
            return;
        }
        let generation = self.grace_generation.fetch_add(1, Ordering::Relaxed) + 1;
        self.grace.schedule(user_id, generation, self.settings.grace_period);
    }

    async fn settle(&self, user_id: UserId) {
        match self.presence.settle_offline(user_id).await {
            Ok(Some(transition)) => self.publish_transition(transition).await,
            Ok(None) => {}
            Err(err) => tracing::error!(user_id = %user_id, error = %err, "presence settle failed"),
        }
    }

    /// 心跳：刷新在线状态
    pub async fn heartbeat(&self, connection: &Connection) {
        if let Err(err) = self.presence.touch(connection.user_id(), connection.id).await {
            tracing::warn!(connection_id = %connection.id, error = %err, "presence touch failed");
        }
    }

    /// 定期清扫：先为本进程的存活连接续期，再剔除陈旧连接并回收它们的房间成员
    pub async fn sweep(&self) -> usize {
        for (user_id, connection_id) in self.directory.attached() {
            if let Err(err) = self.presence.touch(user_id, connection_id).await {
                tracing::warn!(connection_id = %connection_id, error = %err, "presence refresh failed");
            }
        }
        let report = match self.presence.sweep().await {
            Ok(report) => report,
            Err(err) => {
                tracing::error!(error = %err, "presence sweep failed");
                SweepReport::default()
            }
        };
        for (user_id, connection_id) in &report.pruned {
            if self.directory.contains(*connection_id) {
                continue;
            }
            if let Err(err) = self.rooms.purge_connection(*user_id, *connection_id).await {
                tracing::warn!(connection_id = %connection_id, error = %err, "room cleanup for stale connection failed");
            }
        }
        for transition in &report.transitions {
            self.publish_transition(*transition).await;
        }
        self.rate_limiter.cleanup().await;
        report.transitions.len()
    }

    /// 供内部 HTTP 接口发布领域事件
    pub async fn publish(&self, envelope: Envelope) -> Result<usize, ApplicationError> {
        Ok(self.broadcaster.publish(envelope).await?)
    }

    pub async fn presence_of(&self, user_id: UserId) -> Result<PresenceEntry, ApplicationError> {
        self.presence.status(user_id).await
    }

    pub async fn is_online(&self, user_id: UserId) -> Result<bool, ApplicationError> {
        self.presence.is_online(user_id).await
    }

    pub async fn room_members(&self, room: &RoomName) -> Result<Vec<UserId>, ApplicationError> {
        self.rooms.members_of(room).await
    }

    pub fn rooms_of(&self, connection_id: ConnectionId) -> Vec<RoomName> {
        self.rooms.rooms_of_connection(connection_id)
    }

    pub fn is_typing(&self, user_id: UserId, channel: &RoomName) -> bool {
        self.typing.is_typing(user_id, channel)
    }

    pub fn connection_count(&self) -> usize {
        self.directory.len()
    }

    pub fn watch_parties(&self) -> &WatchPartyCoordinator {
        &self.watch_parties
    }

    /// 处理原始文本帧
    pub async fn dispatch_text(&self, connection: &Connection, text: &str) -> DispatchOutcome {
        match serde_json::from_str::<WireMessage>(text) {
            Ok(message) => self.dispatch(connection, message).await,
            Err(err) => {
                if let Some(outcome) = self.admit_action(connection, None).await {
                    return outcome;
                }
                let err = ApplicationError::from(DomainError::validation("message", err.to_string()));
                tracing::debug!(connection_id = %connection.id, error = %err, "malformed frame");
                self.reply_error(connection.id, &err, None);
                DispatchOutcome::Continue
            }
        }
    }

    /// 处理一条入站消息。错误只回给发送者，不影响其他连接
    pub async fn dispatch(&self, connection: &Connection, message: WireMessage) -> DispatchOutcome {
        self.heartbeat(connection).await;
        let request_id = message.id.clone();
        if let Some(outcome) = self.admit_action(connection, request_id.clone()).await {
            return outcome;
        }

        let parsed = match ClientMessage::parse(&message) {
            Ok(parsed) => parsed,
            Err(err) => {
                tracing::debug!(
                    connection_id = %connection.id,
                    message_type = %message.message_type,
                    error = %err,
                    "invalid client message"
                );
                self.reply_error(connection.id, &err.into(), request_id);
                return DispatchOutcome::Continue;
            }
        };

        let name = parsed.name();
        tracing::debug!(connection_id = %connection.id, user_id = %connection.user_id(), message_type = name, "dispatch");
        if let Err(err) = self.route(connection, parsed).await {
            match &err {
                ApplicationError::Validation(_) => {
                    tracing::debug!(connection_id = %connection.id, message_type = name, error = %err, "message rejected")
                }
                err if err.is_internal() => {
                    tracing::error!(connection_id = %connection.id, message_type = name, error = %err, "message handling failed")
                }
                _ => {
                    tracing::info!(connection_id = %connection.id, message_type = name, error = %err, "message denied")
                }
            }
            self.reply_error(connection.id, &err, request_id);
        }
        DispatchOutcome::Continue
    }

    /// 限流检查；返回 `Some` 表示动作被拒绝
    async fn admit_action(
        &self,
        connection: &Connection,
        request_id: Option<String>,
    ) -> Option<DispatchOutcome> {
        let identity = RateLimiter::identity(connection.user_id());
        match self.rate_limiter.admit(&identity, 1).await {
            Ok(Admission::Allowed) => None,
            Ok(Admission::Denied { abusive }) => {
                self.reply_error(connection.id, &ApplicationError::RateLimited, request_id);
                if abusive {
                    tracing::warn!(user_id = %connection.user_id(), connection_id = %connection.id, "closing abusive connection");
                    return Some(DispatchOutcome::Close {
                        code: CLOSE_POLICY_VIOLATION,
                        reason: "rate limit exceeded repeatedly".to_string(),
                    });
                }
                Some(DispatchOutcome::Continue)
            }
            Err(err) => {
                tracing::error!(connection_id = %connection.id, error = %err, "rate limiter unavailable");
                self.reply_error(connection.id, &err, request_id);
                Some(DispatchOutcome::Continue)
            }
        }
    }

    fn reply_error(&self, connection_id: ConnectionId, err: &ApplicationError, request_id: Option<String>) {
        let frame = WireMessage::error(err.client_message(), Some(err.code()), request_id);
        self.broadcaster.send_to_connection(connection_id, frame);
    }

    async fn route(&self, connection: &Connection, message: ClientMessage) -> Result<(), ApplicationError> {
        let identity = &connection.identity;
        let user_id = identity.user_id;
        match message {
            ClientMessage::JoinRoom { room } | ClientMessage::CollabJoin { space: room } => {
                self.join_room(connection, &room).await
            }
            ClientMessage::LeaveRoom { room } | ClientMessage::CollabLeave { space: room } => {
                self.leave_room(connection, &room).await
            }
            ClientMessage::PresenceUpdate { status } => {
                let transition = match status {
                    PresenceStatus::Online => self.presence.mark_online(user_id).await?,
                    PresenceStatus::Away => self.presence.mark_away(user_id).await?,
                    PresenceStatus::Offline => {
                        return Err(DomainError::validation("status", "offline is derived from disconnects").into())
                    }
                };
                if let Some(transition) = transition {
                    self.broadcaster.publish(transition.envelope()).await?;
                }
                Ok(())
            }
            ClientMessage::PresencePing => Ok(()),
            ClientMessage::TypingStart { channel, display_name } => {
                self.start_typing(connection, &channel, display_name).await
            }
            ClientMessage::TypingStop { channel } => {
                self.typing.stop(user_id, &channel).await?;
                Ok(())
            }
            ClientMessage::MessageTyping { conversation, is_typing } => {
                if is_typing {
                    self.start_typing(connection, &conversation, None).await
                } else {
                    self.typing.stop(user_id, &conversation).await?;
                    Ok(())
                }
            }
            ClientMessage::MessageSend { conversation, content, extra } => {
                self.send_message(connection, conversation, content, extra).await
            }
            ClientMessage::MessageMarkRead { conversation, message_id } => {
                self.ensure_room_access(connection, &conversation).await?;
                let envelope = Envelope::new(
                    event_types::MESSAGE_READ,
                    json!({
                        "conversationId": conversation.key(),
                        "messageId": message_id,
                        "userId": user_id.to_string(),
                        "readAt": Utc::now(),
                    }),
                )
                .to_room(conversation)
                .excluding(connection.id);
                self.persister.persist(&envelope).await?;
                self.broadcaster.publish(envelope).await?;
                Ok(())
            }
            ClientMessage::FollowUser { user_id: target } => {
                if target == user_id {
                    return Err(DomainError::validation("userId", "cannot follow yourself").into());
                }
                self.rooms
                    .join_unchecked(user_id, connection.id, &RoomName::followers(target))
                    .await?;
                Ok(())
            }
            ClientMessage::UnfollowUser { user_id: target } => {
                self.rooms
                    .leave(user_id, connection.id, &RoomName::followers(target))
                    .await?;
                Ok(())
            }
            ClientMessage::WatchPartyJoin { party_id } => self.join_party(connection, &party_id).await,
            ClientMessage::WatchPartyLeave { party_id } => {
                self.watch_parties.leave(identity, connection.id, &party_id).await
            }
            ClientMessage::WatchPartySync { party_id, position, is_playing } => {
                self.watch_parties
                    .sync(identity, connection.id, &party_id, position, is_playing)
                    .await
            }
            ClientMessage::WatchPartySendMessage { party_id, content } => {
                self.watch_parties
                    .send_message(identity, connection.id, &party_id, content)
                    .await
            }
            ClientMessage::WatchPartyStart { party_id } => self.watch_parties.start(identity, &party_id).await,
            ClientMessage::WatchPartyEnd { party_id } => self.watch_parties.end(identity, &party_id).await,
            ClientMessage::WatchPartyCancel { party_id } => {
                self.watch_parties.cancel(identity, &party_id).await
            }
            ClientMessage::WatchPartyApprove { party_id, user_id: guest } => {
                self.watch_parties.approve(identity, &party_id, guest).await
            }
            ClientMessage::CollabCursor { space, cursor } => {
                self.ensure_joined(connection, &space)?;
                let envelope = Envelope::new(
                    event_types::COLLAB_CURSOR,
                    json!({ "spaceId": space.key(), "userId": user_id.to_string(), "cursor": cursor }),
                )
                .to_room(space)
                .excluding(connection.id);
                self.broadcaster.publish(envelope).await?;
                Ok(())
            }
            ClientMessage::CollabChange { space, change } => {
                self.ensure_joined(connection, &space)?;
                let envelope = Envelope::new(
                    event_types::COLLAB_CHANGE,
                    json!({
                        "spaceId": space.key(),
                        "changeId": Uuid::new_v4().to_string(),
                        "userId": user_id.to_string(),
                        "change": change,
                    }),
                )
                .to_room(space)
                .excluding(connection.id);
                self.persister.persist(&envelope).await?;
                self.broadcaster.publish(envelope).await?;
                Ok(())
            }
        }
    }

    async fn join_room(&self, connection: &Connection, room: &RoomName) -> Result<(), ApplicationError> {
        if room.kind() == RoomKind::WatchParty {
            return self.join_party(connection, room.key()).await;
        }
        let user_id = connection.user_id();
        let membership = self.rooms.join(user_id, connection.id, room).await?;
        if room.kind() == RoomKind::Collab && membership.is_first_for_user() {
            let envelope = Envelope::new(
                event_types::COLLAB_USER_JOINED,
                json!({
                    "spaceId": room.key(),
                    "userId": user_id.to_string(),
                    "username": connection.identity.username,
                }),
            )
            .to_room(room.clone());
            self.broadcaster.publish(envelope).await?;
        }
        Ok(())
    }

    async fn join_party(&self, connection: &Connection, party_id: &str) -> Result<(), ApplicationError> {
        let outcome = self
            .watch_parties
            .join(&connection.identity, connection.id, party_id)
            .await?;
        if outcome == JoinOutcome::Pending {
            let ack = Envelope::new(event_types::WATCH_PARTY_JOIN_PENDING, json!({ "partyId": party_id }));
            self.broadcaster
                .send_to_connection(connection.id, WireMessage::from_envelope(&ack));
        }
        Ok(())
    }

    async fn leave_room(&self, connection: &Connection, room: &RoomName) -> Result<(), ApplicationError> {
        let user_id = connection.user_id();
        if room.kind() == RoomKind::WatchParty {
            return self
                .watch_parties
                .leave(&connection.identity, connection.id, room.key())
                .await;
        }
        let user_left = self.rooms.leave(user_id, connection.id, room).await?;
        if user_left {
            self.typing.stop(user_id, room).await?;
            if room.kind() == RoomKind::Collab {
                let envelope = Envelope::new(
                    event_types::COLLAB_USER_LEFT,
                    json!({ "spaceId": room.key(), "userId": user_id.to_string() }),
                )
                .to_room(room.clone());
                self.broadcaster.publish(envelope).await?;
            }
        }
        Ok(())
    }

    async fn start_typing(
        &self,
        connection: &Connection,
        channel: &RoomName,
        display_name: Option<String>,
    ) -> Result<(), ApplicationError> {
        self.ensure_joined(connection, channel)?;
        let display_name = display_name.or_else(|| Some(connection.identity.username.clone()));
        self.typing
            .start(connection.user_id(), connection.id, channel, display_name)
            .await?;
        Ok(())
    }

    async fn send_message(
        &self,
        connection: &Connection,
        conversation: RoomName,
        content: String,
        extra: Value,
    ) -> Result<(), ApplicationError> {
        self.ensure_room_access(connection, &conversation).await?;
        let user_id = connection.user_id();
        let message_id = Uuid::new_v4().to_string();

        let mut payload = match extra {
            Value::Object(map) => map,
            _ => serde_json::Map::new(),
        };
        payload.insert("conversationId".into(), json!(conversation.key()));
        payload.insert("messageId".into(), json!(message_id));
        payload.insert("senderId".into(), json!(user_id.to_string()));
        payload.insert("senderName".into(), json!(connection.identity.username));
        payload.insert("content".into(), json!(content));
        payload.insert("createdAt".into(), json!(Utc::now()));

        let mut envelope =
            Envelope::new(event_types::MESSAGE_NEW, Value::Object(payload)).to_room(conversation.clone());
        envelope.id = Some(message_id);

        // 持久化失败则整个动作失败，不做广播
        self.persister.persist(&envelope).await?;
        self.typing.stop(user_id, &conversation).await?;
        self.broadcaster.publish(envelope).await?;
        Ok(())
    }

    fn ensure_joined(&self, connection: &Connection, room: &RoomName) -> Result<(), ApplicationError> {
        if self.rooms.is_connection_in(connection.id, room) {
            Ok(())
        } else {
            Err(ApplicationError::access_denied(room))
        }
    }

    /// 已加入即放行，否则询问外部谓词
    async fn ensure_room_access(&self, connection: &Connection, room: &RoomName) -> Result<(), ApplicationError> {
        if self.rooms.is_connection_in(connection.id, room) {
            return Ok(());
        }
        if self.rooms.authorize(connection.user_id(), room).await? {
            Ok(())
        } else {
            Err(ApplicationError::access_denied(room))
        }
    }
}

async fn grace_loop(hub: Weak<RealtimeHub>, mut expired: mpsc::UnboundedReceiver<Expired<UserId>>) {
    while let Some(item) = expired.recv().await {
        let Some(hub) = hub.upgrade() else {
            break;
        };
        hub.settle(item.key).await;
    }
}

async fn sweep_loop(hub: Weak<RealtimeHub>, period: Duration) {
    let period = period.max(Duration::from_millis(10));
    let mut ticker = tokio::time::interval_at(tokio::time::Instant::now() + period, period);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    loop {
        ticker.tick().await;
        let Some(hub) = hub.upgrade() else {
            break;
        };
        hub.sweep().await;
    }
}

/// 传输层持有的连接会话
///
/// 未调用 [`ConnectionSession::close`] 就被丢弃时，会在后台补做断开清理。
pub struct ConnectionSession {
    hub: Arc<RealtimeHub>,
    connection: Connection,
    outbound: Option<mpsc::Receiver<Outbound>>,
    closed: bool,
}

impl ConnectionSession {
    pub fn connection(&self) -> &Connection {
        &self.connection
    }

    pub fn id(&self) -> ConnectionId {
        self.connection.id
    }

    pub fn user_id(&self) -> UserId {
        self.connection.user_id()
    }

    /// 出站队列，只能取一次
    pub fn take_outbound(&mut self) -> Option<mpsc::Receiver<Outbound>> {
        self.outbound.take()
    }

    pub fn rooms(&self) -> Vec<RoomName> {
        self.hub.rooms_of(self.connection.id)
    }

    pub async fn handle_text(&self, text: &str) -> DispatchOutcome {
        self.hub.dispatch_text(&self.connection, text).await
    }

    pub async fn handle(&self, message: WireMessage) -> DispatchOutcome {
        self.hub.dispatch(&self.connection, message).await
    }

    pub async fn heartbeat(&self) {
        self.hub.heartbeat(&self.connection).await;
    }

    pub async fn close(mut self, reason: &str) {
        self.closed = true;
        self.hub.disconnect(&self.connection, reason).await;
    }
}

impl Drop for ConnectionSession {
    fn drop(&mut self) {
        if self.closed {
            return;
        }
        let Ok(runtime) = tokio::runtime::Handle::try_current() else {
            tracing::warn!(connection_id = %self.connection.id, "session dropped outside runtime, cleanup skipped");
            return;
        };
        let hub = self.hub.clone();
        let connection = self.connection.clone();
        runtime.spawn(async move {
            hub.disconnect(&connection, "dropped").await;
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::MemoryEventBus;
    use crate::collaborators::local::{
        InMemoryWatchPartyDirectory, LoggingNotificationQueue, LoggingPersister, PermissiveAccess,
    };
    use crate::collaborators::{MockEventPersister, MockSessionLookup};
    use crate::presence::memory::MemoryPresenceBackend;
    use crate::rate_limiter::memory::MemoryRateLimitStore;
    use crate::rooms::memory::MemoryMembershipBackend;
    use domain::{Role, Session};

    fn session(role: Role, ttl: chrono::Duration) -> Session {
        Session {
            identity: Identity {
                user_id: UserId::from(Uuid::new_v4()),
                username: "tester".into(),
                role,
            },
            expires_at: Utc::now() + ttl,
        }
    }

    fn hub_with(sessions: MockSessionLookup, persister: Arc<dyn EventPersister>, settings: HubSettings) -> Arc<RealtimeHub> {
        RealtimeHub::new(HubDependencies {
            settings,
            bus: Arc::new(MemoryEventBus::new(64)),
            presence: Arc::new(MemoryPresenceBackend::new()),
            membership: Arc::new(MemoryMembershipBackend::new()),
            rate_limits: Arc::new(MemoryRateLimitStore::new()),
            sessions: Arc::new(sessions),
            access: Arc::new(PermissiveAccess),
            persister,
            notifications: Arc::new(LoggingNotificationQueue),
            watch_parties: Arc::new(InMemoryWatchPartyDirectory::new()),
        })
    }

    fn sessions_returning(session: Option<Session>) -> MockSessionLookup {
        let mut sessions = MockSessionLookup::new();
        sessions
            .expect_lookup()
            .returning(move |_| Ok(session.clone()));
        sessions
    }

    fn next_event(rx: &mut mpsc::Receiver<Outbound>) -> Option<Arc<WireMessage>> {
        match rx.try_recv().ok()? {
            Outbound::Event(message) => Some(message),
            Outbound::Close { .. } => None,
        }
    }

    #[tokio::test]
    async fn test_auth_failures_leave_no_state() {
        let cases = [
            (None, "AUTH_FAILED"),
            (Some(session(Role::Member, chrono::Duration::seconds(-1))), "AUTH_FAILED"),
            (Some(session(Role::Banned, chrono::Duration::hours(1))), "AUTH_FAILED"),
        ];
        for (lookup, code) in cases {
            let hub = hub_with(sessions_returning(lookup), Arc::new(LoggingPersister), HubSettings::default());
            let err = hub.accept("token").await.err().expect("refused");
            assert_eq!(err.code(), code);
            assert_eq!(hub.connection_count(), 0);
        }
    }

    #[tokio::test]
    async fn test_specific_auth_errors() {
        let banned = session(Role::Banned, chrono::Duration::hours(1));
        let hub = hub_with(sessions_returning(Some(banned)), Arc::new(LoggingPersister), HubSettings::default());
        assert!(matches!(
            hub.accept("t").await.err(),
            Some(ApplicationError::Auth(AuthError::Banned))
        ));

        let expired = session(Role::Member, chrono::Duration::seconds(-5));
        let hub = hub_with(sessions_returning(Some(expired)), Arc::new(LoggingPersister), HubSettings::default());
        assert!(matches!(
            hub.accept("t").await.err(),
            Some(ApplicationError::Auth(AuthError::Expired))
        ));
    }

    #[tokio::test]
    async fn test_snapshot_is_first_event() {
        let member = session(Role::Member, chrono::Duration::hours(1));
        let user_id = member.identity.user_id;
        let hub = hub_with(sessions_returning(Some(member)), Arc::new(LoggingPersister), HubSettings::default());

        let mut session = hub.accept("t").await.unwrap();
        let mut rx = session.take_outbound().unwrap();
        let first = next_event(&mut rx).unwrap();
        assert_eq!(first.message_type, "users:online");
        assert_eq!(first.payload["users"], json!([user_id.to_string()]));

        let rooms = session.rooms();
        assert!(rooms.contains(&RoomName::user(user_id)));
        assert!(rooms.contains(&RoomName::followers(user_id)));
        session.close("test").await;
    }

    #[tokio::test]
    async fn test_persist_failure_fails_closed() {
        let member = session(Role::Member, chrono::Duration::hours(1));
        let mut persister = MockEventPersister::new();
        persister
            .expect_persist()
            .returning(|_| Err(ApplicationError::infrastructure("db unavailable")));
        let hub = hub_with(sessions_returning(Some(member)), Arc::new(persister), HubSettings::default());

        let mut sender = hub.accept("a").await.unwrap();
        let mut rx = sender.take_outbound().unwrap();
        rx.try_recv().unwrap();

        let conversation = RoomName::parse("conversation:c1").unwrap();
        let join = WireMessage::new("join:room", json!({ "room": conversation.to_string() }));
        assert_eq!(sender.handle(join).await, DispatchOutcome::Continue);

        let mut send = WireMessage::new(
            "message:send",
            json!({ "conversationId": "c1", "content": "hello" }),
        );
        send.id = Some("req-7".into());
        sender.handle(send).await;

        let reply = next_event(&mut rx).unwrap();
        assert_eq!(reply.message_type, "error");
        assert_eq!(reply.payload["code"], "INTERNAL_ERROR");
        assert_eq!(reply.id.as_deref(), Some("req-7"));
        assert!(!reply.payload["message"].as_str().unwrap().contains("db unavailable"));
        assert!(next_event(&mut rx).is_none(), "nothing was broadcast");
    }

    #[tokio::test]
    async fn test_invalid_frames_get_error_reply() {
        let member = session(Role::Member, chrono::Duration::hours(1));
        let hub = hub_with(sessions_returning(Some(member)), Arc::new(LoggingPersister), HubSettings::default());
        let mut sender = hub.accept("a").await.unwrap();
        let mut rx = sender.take_outbound().unwrap();
        rx.try_recv().unwrap();

        assert_eq!(sender.handle_text("not json").await, DispatchOutcome::Continue);
        assert_eq!(next_event(&mut rx).unwrap().payload["code"], "VALIDATION_FAILED");

        sender
            .handle_text(r#"{"type":"join:room","payload":{"room":"followers:x"}}"#)
            .await;
        assert_eq!(next_event(&mut rx).unwrap().payload["code"], "VALIDATION_FAILED");

        sender
            .handle_text(r#"{"type":"typing:start","payload":{"channel":"post:1"}}"#)
            .await;
        assert_eq!(
            next_event(&mut rx).unwrap().payload["code"],
            "ACCESS_DENIED",
            "typing requires membership"
        );
    }

    #[tokio::test]
    async fn test_abusive_connection_is_closed() {
        let member = session(Role::Member, chrono::Duration::hours(1));
        let settings = HubSettings {
            rate_budget: 3,
            abuse_threshold: 2,
            ..HubSettings::default()
        };
        let hub = hub_with(sessions_returning(Some(member)), Arc::new(LoggingPersister), settings);
        let sender = hub.accept("a").await.unwrap();

        // accept 已消耗一次预算
        let ping = || WireMessage::new("presence:ping", json!({}));
        assert_eq!(sender.handle(ping()).await, DispatchOutcome::Continue);
        assert_eq!(sender.handle(ping()).await, DispatchOutcome::Continue);
        assert_eq!(sender.handle(ping()).await, DispatchOutcome::Continue, "first denial only rejects");
        assert!(matches!(
            sender.handle(ping()).await,
            DispatchOutcome::Close { code: CLOSE_POLICY_VIOLATION, .. }
        ));
    }

    #[tokio::test]
    async fn test_connection_cap() {
        let member = session(Role::Member, chrono::Duration::hours(1));
        let settings = HubSettings {
            max_connections_per_user: 1,
            ..HubSettings::default()
        };
        let hub = hub_with(sessions_returning(Some(member)), Arc::new(LoggingPersister), settings);
        let first = hub.accept("a").await.unwrap();
        assert!(matches!(
            hub.accept("a").await.err(),
            Some(ApplicationError::Auth(AuthError::TooManyConnections { current: 1, max: 1 }))
        ));
        first.close("done").await;
        assert!(hub.accept("a").await.is_ok());
    }

    #[tokio::test]
    async fn test_disconnect_is_idempotent() {
        let member = session(Role::Member, chrono::Duration::hours(1));
        let hub = hub_with(sessions_returning(Some(member)), Arc::new(LoggingPersister), HubSettings::default());
        let session = hub.accept("a").await.unwrap();
        let connection = session.connection().clone();

        session.close("first").await;
        hub.disconnect(&connection, "second").await;
        assert_eq!(hub.connection_count(), 0);
        assert!(hub.rooms_of(connection.id).is_empty());
    }

    #[tokio::test]
    async fn test_shutdown_closes_attached_connections() {
        let member = session(Role::Member, chrono::Duration::hours(1));
        let hub = hub_with(sessions_returning(Some(member)), Arc::new(LoggingPersister), HubSettings::default());
        let mut session = hub.accept("a").await.unwrap();
        let mut rx = session.take_outbound().unwrap();
        assert_eq!(next_event(&mut rx).unwrap().message_type, "users:online");

        hub.shutdown();
        match rx.try_recv() {
            Ok(Outbound::Close { code, reason }) => {
                assert_eq!(code, CLOSE_GOING_AWAY);
                assert_eq!(reason, "server shutting down");
            }
            other => panic!("expected close request, got {other:?}"),
        }
        session.close("server shutting down").await;
        assert_eq!(hub.connection_count(), 0);
    }
}
