//! 线协议
//!
//! 双向统一的 JSON 结构：`{ "type", "payload", "timestamp", "id"? }`。
//! 入站消息在这里完成形状与房间名语法校验，之后的处理器只见到强类型的 [`ClientMessage`]。

use chrono::Utc;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use crate::envelope::{event_types, Envelope};
use crate::errors::DomainError;
use crate::presence::PresenceStatus;
use crate::value_objects::{RoomKind, RoomName, Timestamp, UserId};

/// 单条消息正文上限
pub const MAX_MESSAGE_CONTENT_LEN: usize = 4000;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WireMessage {
    #[serde(rename = "type")]
    pub message_type: String,
    #[serde(default)]
    pub payload: Value,
    #[serde(default = "Utc::now")]
    pub timestamp: Timestamp,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
}

impl WireMessage {
    pub fn new(message_type: impl Into<String>, payload: Value) -> Self {
        Self {
            message_type: message_type.into(),
            payload,
            timestamp: Utc::now(),
            id: None,
        }
    }

    /// 信封 -> 客户端帧
    pub fn from_envelope(envelope: &Envelope) -> Self {
        Self {
            message_type: envelope.wire_type(),
            payload: envelope.payload.clone(),
            timestamp: envelope.timestamp,
            id: envelope.id.clone(),
        }
    }

    /// 只发给请求者的错误帧
    pub fn error(message: impl Into<String>, code: Option<&str>, request_id: Option<String>) -> Self {
        let mut payload = json!({ "message": message.into() });
        if let Some(code) = code {
            payload["code"] = Value::String(code.to_string());
        }
        Self {
            message_type: event_types::ERROR.to_string(),
            payload,
            timestamp: Utc::now(),
            id: request_id,
        }
    }
}

/// 客户端可发送的消息
#[derive(Debug, Clone, PartialEq)]
pub enum ClientMessage {
    JoinRoom { room: RoomName },
    LeaveRoom { room: RoomName },
    PresenceUpdate { status: PresenceStatus },
    PresencePing,
    TypingStart { channel: RoomName, display_name: Option<String> },
    TypingStop { channel: RoomName },
    MessageSend { conversation: RoomName, content: String, extra: Value },
    MessageMarkRead { conversation: RoomName, message_id: String },
    MessageTyping { conversation: RoomName, is_typing: bool },
    FollowUser { user_id: UserId },
    UnfollowUser { user_id: UserId },
    WatchPartyJoin { party_id: String },
    WatchPartyLeave { party_id: String },
    WatchPartySync { party_id: String, position: f64, is_playing: bool },
    WatchPartySendMessage { party_id: String, content: String },
    WatchPartyStart { party_id: String },
    WatchPartyEnd { party_id: String },
    WatchPartyCancel { party_id: String },
    WatchPartyApprove { party_id: String, user_id: UserId },
    CollabJoin { space: RoomName },
    CollabLeave { space: RoomName },
    CollabCursor { space: RoomName, cursor: Value },
    CollabChange { space: RoomName, change: Value },
}

#[derive(Deserialize)]
struct RoomPayload {
    room: String,
}

#[derive(Deserialize)]
struct PresencePayload {
    status: PresenceStatus,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct TypingPayload {
    channel: String,
    #[serde(default)]
    display_name: Option<String>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct SendMessagePayload {
    conversation_id: String,
    content: String,
    #[serde(flatten)]
    extra: serde_json::Map<String, Value>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct MarkReadPayload {
    conversation_id: String,
    message_id: String,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct ConversationTypingPayload {
    conversation_id: String,
    is_typing: bool,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct UserPayload {
    user_id: UserId,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct PartyPayload {
    party_id: String,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct PartySyncPayload {
    party_id: String,
    position: f64,
    is_playing: bool,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct PartyMessagePayload {
    party_id: String,
    content: String,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct PartyApprovePayload {
    party_id: String,
    user_id: UserId,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct SpacePayload {
    space_id: String,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct CursorPayload {
    space_id: String,
    cursor: Value,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct ChangePayload {
    space_id: String,
    change: Value,
}

fn payload<T: DeserializeOwned>(message: &WireMessage) -> Result<T, DomainError> {
    serde_json::from_value(message.payload.clone())
        .map_err(|e| DomainError::validation("payload", e.to_string()))
}

fn content(value: String) -> Result<String, DomainError> {
    if value.trim().is_empty() {
        return Err(DomainError::validation("content", "cannot be empty"));
    }
    if value.chars().count() > MAX_MESSAGE_CONTENT_LEN {
        return Err(DomainError::validation("content", "too long"));
    }
    Ok(value)
}

fn party_id(value: String) -> Result<String, DomainError> {
    // 与房间键同一套语法，保证能映射到 watchParty:<id>
    RoomName::new(RoomKind::WatchParty, value).map(|room| room.key().to_string())
}

impl ClientMessage {
    /// 校验并解析入站帧
    pub fn parse(message: &WireMessage) -> Result<Self, DomainError> {
        let parsed = match message.message_type.as_str() {
            "join:room" => {
                let p: RoomPayload = payload(message)?;
                ClientMessage::JoinRoom {
                    room: RoomName::parse_client(&p.room)?,
                }
            }
            "leave:room" => {
                let p: RoomPayload = payload(message)?;
                ClientMessage::LeaveRoom {
                    room: RoomName::parse_client(&p.room)?,
                }
            }
            "presence:update" => {
                let p: PresencePayload = payload(message)?;
                if p.status == PresenceStatus::Offline {
                    return Err(DomainError::validation(
                        "status",
                        "offline is derived from disconnects",
                    ));
                }
                ClientMessage::PresenceUpdate { status: p.status }
            }
            "presence:ping" => ClientMessage::PresencePing,
            "typing:start" => {
                let p: TypingPayload = payload(message)?;
                ClientMessage::TypingStart {
                    channel: RoomName::parse_client(&p.channel)?,
                    display_name: p.display_name,
                }
            }
            "typing:stop" => {
                let p: TypingPayload = payload(message)?;
                ClientMessage::TypingStop {
                    channel: RoomName::parse_client(&p.channel)?,
                }
            }
            "message:send" => {
                let p: SendMessagePayload = payload(message)?;
                ClientMessage::MessageSend {
                    conversation: RoomName::new(RoomKind::Conversation, p.conversation_id)?,
                    content: content(p.content)?,
                    extra: Value::Object(p.extra),
                }
            }
            "message:markRead" => {
                let p: MarkReadPayload = payload(message)?;
                ClientMessage::MessageMarkRead {
                    conversation: RoomName::new(RoomKind::Conversation, p.conversation_id)?,
                    message_id: p.message_id,
                }
            }
            "message:typing" => {
                let p: ConversationTypingPayload = payload(message)?;
                ClientMessage::MessageTyping {
                    conversation: RoomName::new(RoomKind::Conversation, p.conversation_id)?,
                    is_typing: p.is_typing,
                }
            }
            "follow:user" => {
                let p: UserPayload = payload(message)?;
                ClientMessage::FollowUser { user_id: p.user_id }
            }
            "unfollow:user" => {
                let p: UserPayload = payload(message)?;
                ClientMessage::UnfollowUser { user_id: p.user_id }
            }
            "watchParty:join" => {
                let p: PartyPayload = payload(message)?;
                ClientMessage::WatchPartyJoin {
                    party_id: party_id(p.party_id)?,
                }
            }
            "watchParty:leave" => {
                let p: PartyPayload = payload(message)?;
                ClientMessage::WatchPartyLeave {
                    party_id: party_id(p.party_id)?,
                }
            }
            "watchParty:sync" => {
                let p: PartySyncPayload = payload(message)?;
                if !p.position.is_finite() || p.position < 0.0 {
                    return Err(DomainError::validation("position", "must be a non-negative number"));
                }
                ClientMessage::WatchPartySync {
                    party_id: party_id(p.party_id)?,
                    position: p.position,
                    is_playing: p.is_playing,
                }
            }
            "watchParty:sendMessage" => {
                let p: PartyMessagePayload = payload(message)?;
                ClientMessage::WatchPartySendMessage {
                    party_id: party_id(p.party_id)?,
                    content: content(p.content)?,
                }
            }
            "watchParty:start" => {
                let p: PartyPayload = payload(message)?;
                ClientMessage::WatchPartyStart {
                    party_id: party_id(p.party_id)?,
                }
            }
            "watchParty:end" => {
                let p: PartyPayload = payload(message)?;
                ClientMessage::WatchPartyEnd {
                    party_id: party_id(p.party_id)?,
                }
            }
            "watchParty:cancel" => {
                let p: PartyPayload = payload(message)?;
                ClientMessage::WatchPartyCancel {
                    party_id: party_id(p.party_id)?,
                }
            }
            "watchParty:approve" => {
                let p: PartyApprovePayload = payload(message)?;
                ClientMessage::WatchPartyApprove {
                    party_id: party_id(p.party_id)?,
                    user_id: p.user_id,
                }
            }
            "collab:join" => {
                let p: SpacePayload = payload(message)?;
                ClientMessage::CollabJoin {
                    space: RoomName::new(RoomKind::Collab, p.space_id)?,
                }
            }
            "collab:leave" => {
                let p: SpacePayload = payload(message)?;
                ClientMessage::CollabLeave {
                    space: RoomName::new(RoomKind::Collab, p.space_id)?,
                }
            }
            "collab:cursor" => {
                let p: CursorPayload = payload(message)?;
                ClientMessage::CollabCursor {
                    space: RoomName::new(RoomKind::Collab, p.space_id)?,
                    cursor: p.cursor,
                }
            }
            "collab:change" => {
                let p: ChangePayload = payload(message)?;
                ClientMessage::CollabChange {
                    space: RoomName::new(RoomKind::Collab, p.space_id)?,
                    change: p.change,
                }
            }
            other => return Err(DomainError::UnknownMessageType(other.to_string())),
        };
        Ok(parsed)
    }

    /// 用于日志
    pub fn name(&self) -> &'static str {
        match self {
            ClientMessage::JoinRoom { .. } => "join:room",
            ClientMessage::LeaveRoom { .. } => "leave:room",
            ClientMessage::PresenceUpdate { .. } => "presence:update",
            ClientMessage::PresencePing => "presence:ping",
            ClientMessage::TypingStart { .. } => "typing:start",
            ClientMessage::TypingStop { .. } => "typing:stop",
            ClientMessage::MessageSend { .. } => "message:send",
            ClientMessage::MessageMarkRead { .. } => "message:markRead",
            ClientMessage::MessageTyping { .. } => "message:typing",
            ClientMessage::FollowUser { .. } => "follow:user",
            ClientMessage::UnfollowUser { .. } => "unfollow:user",
            ClientMessage::WatchPartyJoin { .. } => "watchParty:join",
            ClientMessage::WatchPartyLeave { .. } => "watchParty:leave",
            ClientMessage::WatchPartySync { .. } => "watchParty:sync",
            ClientMessage::WatchPartySendMessage { .. } => "watchParty:sendMessage",
            ClientMessage::WatchPartyStart { .. } => "watchParty:start",
            ClientMessage::WatchPartyEnd { .. } => "watchParty:end",
            ClientMessage::WatchPartyCancel { .. } => "watchParty:cancel",
            ClientMessage::WatchPartyApprove { .. } => "watchParty:approve",
            ClientMessage::CollabJoin { .. } => "collab:join",
            ClientMessage::CollabLeave { .. } => "collab:leave",
            ClientMessage::CollabCursor { .. } => "collab:cursor",
            ClientMessage::CollabChange { .. } => "collab:change",
        }
    }
}
