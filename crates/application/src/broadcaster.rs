//! 事件广播器
//!
//! `publish` 总是做两件事：投递给本进程挂载的匹配连接，再发到共享总线。
//! 总线送来的其他实例的帧只做本地投递，绝不重新发布。

use std::collections::HashSet;
use std::sync::{Arc, Weak};

use dashmap::DashMap;
use domain::{event_types, ConnectionId, Envelope, EventTarget, InstanceId, UserId, WireMessage};
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::bus::{BusFrame, EventBus};
use crate::error::BroadcastError;
use crate::rooms::RoomRegistry;

/// 推送给单条连接的出站项
#[derive(Debug, Clone)]
pub enum Outbound {
    Event(Arc<WireMessage>),
    /// 要求套接字循环以给定关闭码断开
    Close { code: u16, reason: String },
}

struct Attached {
    user_id: UserId,
    sender: mpsc::Sender<Outbound>,
}

/// 本进程挂载的连接
#[derive(Default)]
pub struct ConnectionDirectory {
    connections: DashMap<ConnectionId, Attached>,
    by_user: DashMap<UserId, HashSet<ConnectionId>>,
}

impl ConnectionDirectory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, connection_id: ConnectionId, user_id: UserId, sender: mpsc::Sender<Outbound>) {
        self.connections
            .insert(connection_id, Attached { user_id, sender });
        self.by_user.entry(user_id).or_default().insert(connection_id);
    }

    /// 注销连接；返回 `None` 表示早已注销，供断开清理做幂等判断
    pub fn unregister(&self, connection_id: ConnectionId) -> Option<UserId> {
        let (_, attached) = self.connections.remove(&connection_id)?;
        if let Some(mut connections) = self.by_user.get_mut(&attached.user_id) {
            connections.remove(&connection_id);
        }
        self.by_user
            .remove_if(&attached.user_id, |_, connections| connections.is_empty());
        Some(attached.user_id)
    }

    /// 非阻塞投递；队列满或连接已关闭时丢弃（至多一次语义）
    pub fn send(&self, connection_id: ConnectionId, item: Outbound) -> bool {
        let Some(attached) = self.connections.get(&connection_id) else {
            return false;
        };
        match attached.sender.try_send(item) {
            Ok(()) => true,
            Err(mpsc::error::TrySendError::Full(_)) => {
                tracing::warn!(
                    connection_id = %connection_id,
                    user_id = %attached.user_id,
                    "outbound queue full, event dropped"
                );
                false
            }
            Err(mpsc::error::TrySendError::Closed(_)) => false,
        }
    }

    pub fn connections_of(&self, user_id: UserId) -> Vec<ConnectionId> {
        self.by_user
            .get(&user_id)
            .map(|connections| connections.iter().copied().collect())
            .unwrap_or_default()
    }

    pub fn all(&self) -> Vec<ConnectionId> {
        self.connections.iter().map(|entry| *entry.key()).collect()
    }

    /// 所有 (用户, 连接) 对
    pub fn attached(&self) -> Vec<(UserId, ConnectionId)> {
        self.connections
            .iter()
            .map(|entry| (entry.value().user_id, *entry.key()))
            .collect()
    }

    pub fn contains(&self, connection_id: ConnectionId) -> bool {
        self.connections.contains_key(&connection_id)
    }

    pub fn len(&self) -> usize {
        self.connections.len()
    }

    pub fn is_empty(&self) -> bool {
        self.connections.is_empty()
    }
}

pub struct EventBroadcaster {
    instance_id: InstanceId,
    bus: Arc<dyn EventBus>,
    rooms: Arc<RoomRegistry>,
    directory: Arc<ConnectionDirectory>,
}

impl EventBroadcaster {
    pub fn new(
        instance_id: InstanceId,
        bus: Arc<dyn EventBus>,
        rooms: Arc<RoomRegistry>,
        directory: Arc<ConnectionDirectory>,
    ) -> Self {
        Self {
            instance_id,
            bus,
            rooms,
            directory,
        }
    }

    pub fn instance_id(&self) -> InstanceId {
        self.instance_id
    }

    /// 发布事件，返回本地投递的连接数。无法路由的事件记录后丢弃
    pub async fn publish(&self, mut envelope: Envelope) -> Result<usize, BroadcastError> {
        let Some(target) = envelope.resolve_target() else {
            tracing::warn!(event_type = %envelope.event_type, "unroutable event dropped");
            return Err(BroadcastError::Unroutable(envelope.event_type));
        };
        envelope.target = Some(target);

        let delivered = self.deliver_local(&envelope);
        let frame = BusFrame {
            origin: self.instance_id,
            envelope,
        };
        self.bus.publish(&frame).await.inspect_err(|err| {
            tracing::error!(
                event_type = %frame.envelope.event_type,
                error = %err,
                "bus publish failed"
            )
        })?;
        Ok(delivered)
    }

    /// 处理总线帧：跳过本实例发出的帧，其余只做本地投递
    pub fn on_remote_event(&self, frame: &BusFrame) -> usize {
        if frame.origin == self.instance_id {
            return 0;
        }
        let delivered = self.deliver_local(&frame.envelope);

        // 房间已在发起实例上被拆除，本地索引随之清理
        if event_types::is_room_teardown(&frame.envelope.event_type) {
            if let Some(EventTarget::Room(room)) = &frame.envelope.target {
                self.rooms.forget_local_room(room);
            }
        }
        delivered
    }

    fn deliver_local(&self, envelope: &Envelope) -> usize {
        let Some(target) = envelope.resolve_target() else {
            return 0;
        };
        let recipients = match &target {
            EventTarget::User(user_id) => self.directory.connections_of(*user_id),
            EventTarget::Room(room) => self.rooms.local_connections(room),
            EventTarget::Broadcast => self.directory.all(),
        };
        if recipients.is_empty() {
            return 0;
        }

        let message = Arc::new(WireMessage::from_envelope(envelope));
        let delivered = recipients
            .into_iter()
            .filter(|connection_id| envelope.exclude_connection != Some(*connection_id))
            .filter(|connection_id| {
                self.directory
                    .send(*connection_id, Outbound::Event(message.clone()))
            })
            .count();
        tracing::trace!(event_type = %envelope.event_type, delivered, "delivered locally");
        delivered
    }

    /// 只发给某条连接（错误帧、在线快照）
    pub fn send_to_connection(&self, connection_id: ConnectionId, message: WireMessage) -> bool {
        self.directory
            .send(connection_id, Outbound::Event(Arc::new(message)))
    }

    /// 订阅总线并在后台做本地扇入。先订阅再返回，调用返回后发布的帧不会丢失
    pub fn spawn_remote_listener(self: &Arc<Self>) -> JoinHandle<()> {
        let mut receiver = self.bus.subscribe();
        let broadcaster: Weak<Self> = Arc::downgrade(self);
        tokio::spawn(async move {
            loop {
                match receiver.recv().await {
                    Ok(frame) => {
                        let Some(broadcaster) = broadcaster.upgrade() else {
                            break;
                        };
                        broadcaster.on_remote_event(&frame);
                    }
                    Err(RecvError::Lagged(skipped)) => {
                        tracing::warn!(skipped, "bus listener lagged, events skipped");
                    }
                    Err(RecvError::Closed) => break,
                }
            }
            tracing::debug!("bus listener stopped");
        })
    }
}
