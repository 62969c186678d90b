//! 事件信封与默认路由表
//!
//! 信封是总线上传播、最终推送给客户端的最小单位。发布后不可变。

use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::value_objects::{ConnectionId, RoomKind, RoomName, Timestamp, UserId};

/// 服务端推送给客户端的事件类型
pub mod event_types {
    pub const USERS_ONLINE: &str = "users:online";
    pub const ERROR: &str = "error";

    pub const USER_ONLINE: &str = "user.online";
    pub const USER_OFFLINE: &str = "user.offline";
    pub const USER_AWAY: &str = "user.away";

    pub const TYPING_START: &str = "typing.start";
    pub const TYPING_STOP: &str = "typing.stop";

    pub const MESSAGE_NEW: &str = "message.new";
    pub const MESSAGE_READ: &str = "message.read";

    pub const WATCH_PARTY_USER_JOINED: &str = "watchParty.userJoined";
    pub const WATCH_PARTY_USER_LEFT: &str = "watchParty.userLeft";
    pub const WATCH_PARTY_PLAYBACK_SYNC: &str = "watchParty.playbackSync";
    pub const WATCH_PARTY_MESSAGE: &str = "watchParty.message";
    pub const WATCH_PARTY_JOIN_REQUEST: &str = "watchParty.joinRequest";
    pub const WATCH_PARTY_JOIN_APPROVED: &str = "watchParty.joinApproved";
    pub const WATCH_PARTY_JOIN_PENDING: &str = "watchParty.joinPending";
    pub const WATCH_PARTY_STARTED: &str = "watchParty.started";
    pub const WATCH_PARTY_ENDED: &str = "watchParty.ended";
    pub const WATCH_PARTY_CANCELLED: &str = "watchParty.cancelled";

    pub const COLLAB_USER_JOINED: &str = "collab.userJoined";
    pub const COLLAB_USER_LEFT: &str = "collab.userLeft";
    pub const COLLAB_CURSOR: &str = "collab.cursor";
    pub const COLLAB_CHANGE: &str = "collab.change";

    /// 发出后目标房间即被删除的事件
    pub fn is_room_teardown(event_type: &str) -> bool {
        matches!(event_type, WATCH_PARTY_ENDED | WATCH_PARTY_CANCELLED)
    }
}

/// 投递目标
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "kind", content = "id", rename_all = "camelCase")]
pub enum EventTarget {
    User(UserId),
    Room(RoomName),
    Broadcast,
}

/// 事件信封
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Envelope {
    #[serde(rename = "type")]
    pub event_type: String,
    #[serde(default)]
    pub payload: Value,
    /// 显式目标；为空时按事件类型查默认路由表
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target: Option<EventTarget>,
    #[serde(default = "Utc::now")]
    pub timestamp: Timestamp,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    /// 不投递给该连接（通常是事件的发起者）
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub exclude_connection: Option<ConnectionId>,
}

impl Envelope {
    pub fn new(event_type: impl Into<String>, payload: Value) -> Self {
        Self {
            event_type: event_type.into(),
            payload,
            target: None,
            timestamp: Utc::now(),
            id: None,
            exclude_connection: None,
        }
    }

    pub fn to_user(mut self, user_id: UserId) -> Self {
        self.target = Some(EventTarget::User(user_id));
        self
    }

    pub fn to_room(mut self, room: RoomName) -> Self {
        self.target = Some(EventTarget::Room(room));
        self
    }

    pub fn to_everyone(mut self) -> Self {
        self.target = Some(EventTarget::Broadcast);
        self
    }

    pub fn excluding(mut self, connection_id: ConnectionId) -> Self {
        self.exclude_connection = Some(connection_id);
        self
    }

    /// 面向客户端的类型名：首个 `.` 换成 `:`（`comment.created` -> `comment:created`）
    pub fn wire_type(&self) -> String {
        self.event_type.replacen('.', ":", 1)
    }

    /// 解析投递目标：显式目标优先，其次按事件类型查默认路由表。
    /// 返回 `None` 表示无法路由，调用方应记录并丢弃，绝不退化为全局广播。
    pub fn resolve_target(&self) -> Option<EventTarget> {
        if let Some(target) = &self.target {
            return Some(target.clone());
        }
        contextual_target(&self.event_type, &self.payload)
    }
}

/// 按 `family` 与 `action` 拆分事件类型，`.` 与 `:` 都可作分隔符
fn split_event_type(event_type: &str) -> (&str, &str) {
    match event_type.find(['.', ':']) {
        Some(idx) => (&event_type[..idx], &event_type[idx + 1..]),
        None => (event_type, ""),
    }
}

/// 默认路由表
///
/// | 前缀 | 默认目标 |
/// |---|---|
/// | `notification.*` | `user:<userId>` |
/// | `comment.*` | `post:<postId>` |
/// | `post.updated` / `post.deleted` | `post:<postId>` |
/// | `watchParty.*` | `watchParty:<partyId>` |
/// | `user.online` / `user.offline` | `followers:<userId>` |
pub fn contextual_target(event_type: &str, payload: &Value) -> Option<EventTarget> {
    let (family, action) = split_event_type(event_type);
    match (family, action) {
        ("notification", _) => payload_user(payload, "userId").map(EventTarget::User),
        ("comment", _) | ("post", "updated") | ("post", "deleted") => {
            payload_room(payload, "postId", RoomKind::Post)
        }
        ("watchParty", _) => payload_room(payload, "partyId", RoomKind::WatchParty),
        ("user", "online") | ("user", "offline") => payload_user(payload, "userId")
            .map(|user_id| EventTarget::Room(RoomName::followers(user_id))),
        _ => None,
    }
}

/// 读取字符串或数字形式的字段
fn payload_key(payload: &Value, field: &str) -> Option<String> {
    match payload.get(field)? {
        Value::String(s) => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

fn payload_user(payload: &Value, field: &str) -> Option<UserId> {
    payload_key(payload, field)?.parse().ok()
}

fn payload_room(payload: &Value, field: &str, kind: RoomKind) -> Option<EventTarget> {
    let key = payload_key(payload, field)?;
    RoomName::new(kind, key).ok().map(EventTarget::Room)
}
