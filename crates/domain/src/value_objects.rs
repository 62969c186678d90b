use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::errors::DomainError;

/// 统一的时间戳类型。
pub type Timestamp = DateTime<Utc>;

/// 房间键的最大长度
pub const MAX_ROOM_KEY_LEN: usize = 128;

/// 用户唯一标识。
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct UserId(pub Uuid);

impl UserId {
    pub fn new(id: Uuid) -> Self {
        Self(id)
    }
}

impl fmt::Display for UserId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<Uuid> for UserId {
    fn from(value: Uuid) -> Self {
        Self(value)
    }
}

impl From<UserId> for Uuid {
    fn from(value: UserId) -> Self {
        value.0
    }
}

impl FromStr for UserId {
    type Err = DomainError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        s.parse::<Uuid>()
            .map(Self)
            .map_err(|_| DomainError::validation("userId", "must be a uuid"))
    }
}

/// 单条传输连接的唯一标识。
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ConnectionId(pub Uuid);

impl ConnectionId {
    pub fn generate() -> Self {
        Self(Uuid::new_v4())
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for ConnectionId {
    type Err = DomainError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        s.parse::<Uuid>()
            .map(Self)
            .map_err(|_| DomainError::validation("connectionId", "must be a uuid"))
    }
}

/// 枢纽进程实例标识，用于识别总线上的回环帧。
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct InstanceId(pub Uuid);

impl InstanceId {
    pub fn generate() -> Self {
        Self(Uuid::new_v4())
    }
}

impl fmt::Display for InstanceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// 房间类别。`Followers` 只由服务端创建，客户端不能直接加入。
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum RoomKind {
    Post,
    User,
    Group,
    Conversation,
    WatchParty,
    Collab,
    Followers,
}

impl RoomKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            RoomKind::Post => "post",
            RoomKind::User => "user",
            RoomKind::Group => "group",
            RoomKind::Conversation => "conversation",
            RoomKind::WatchParty => "watchParty",
            RoomKind::Collab => "collab",
            RoomKind::Followers => "followers",
        }
    }

    fn from_prefix(prefix: &str) -> Option<Self> {
        match prefix {
            "post" => Some(RoomKind::Post),
            "user" => Some(RoomKind::User),
            "group" => Some(RoomKind::Group),
            "conversation" => Some(RoomKind::Conversation),
            "watchParty" => Some(RoomKind::WatchParty),
            "collab" => Some(RoomKind::Collab),
            "followers" => Some(RoomKind::Followers),
            _ => None,
        }
    }

    /// 是否允许出现在客户端提交的房间名中
    pub fn is_client_joinable(&self) -> bool {
        !matches!(self, RoomKind::Followers)
    }
}

impl fmt::Display for RoomKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// 带命名空间的房间名：`kind:key`，key 仅允许 `[A-Za-z0-9_-]`。
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct RoomName {
    kind: RoomKind,
    key: String,
}

impl RoomName {
    pub fn new(kind: RoomKind, key: impl Into<String>) -> Result<Self, DomainError> {
        let key = key.into();
        validate_room_key(&key)?;
        Ok(Self { kind, key })
    }

    /// 解析任意类别的房间名（服务端内部、总线帧）
    pub fn parse(value: &str) -> Result<Self, DomainError> {
        let (prefix, key) = value
            .split_once(':')
            .ok_or_else(|| DomainError::validation("room", "expected kind:id"))?;
        let kind = RoomKind::from_prefix(prefix)
            .ok_or_else(|| DomainError::validation("room", format!("unknown room kind '{prefix}'")))?;
        Self::new(kind, key)
    }

    /// 解析客户端提交的房间名：`^(post|user|group|watchParty|collab|conversation):[A-Za-z0-9_-]+$`
    pub fn parse_client(value: &str) -> Result<Self, DomainError> {
        let room = Self::parse(value)?;
        if !room.kind.is_client_joinable() {
            return Err(DomainError::validation(
                "room",
                format!("room kind '{}' is not joinable", room.kind),
            ));
        }
        Ok(room)
    }

    pub fn user(user_id: UserId) -> Self {
        Self {
            kind: RoomKind::User,
            key: user_id.to_string(),
        }
    }

    pub fn followers(user_id: UserId) -> Self {
        Self {
            kind: RoomKind::Followers,
            key: user_id.to_string(),
        }
    }

    pub fn kind(&self) -> RoomKind {
        self.kind
    }

    pub fn key(&self) -> &str {
        &self.key
    }
}

fn validate_room_key(key: &str) -> Result<(), DomainError> {
    if key.is_empty() {
        return Err(DomainError::validation("room", "id cannot be empty"));
    }
    if key.len() > MAX_ROOM_KEY_LEN {
        return Err(DomainError::validation("room", "id too long"));
    }
    if !key
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-')
    {
        return Err(DomainError::validation(
            "room",
            "id may only contain letters, digits, '_' and '-'",
        ));
    }
    Ok(())
}

impl fmt::Display for RoomName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.kind, self.key)
    }
}

impl FromStr for RoomName {
    type Err = DomainError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl TryFrom<String> for RoomName {
    type Error = DomainError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::parse(&value)
    }
}

impl From<RoomName> for String {
    fn from(value: RoomName) -> Self {
        value.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_client_grammar_accepts_known_kinds() {
        for raw in [
            "post:123",
            "user:abc_DEF-9",
            "group:g1",
            "watchParty:party-1",
            "collab:space_2",
            "conversation:c-42",
        ] {
            let room = RoomName::parse_client(raw).expect(raw);
            assert_eq!(room.to_string(), raw);
        }
    }

    #[test]
    fn test_client_grammar_rejects_malformed_names() {
        for raw in [
            "post",
            "post:",
            "post:12 3",
            "post:12/3",
            "posts:1",
            "Post:1",
            ":1",
            "post:1:2",
            "followers:1",
        ] {
            assert!(RoomName::parse_client(raw).is_err(), "{raw} should be rejected");
        }
    }

    #[test]
    fn test_followers_room_is_server_only() {
        let user = UserId::from(Uuid::new_v4());
        let room = RoomName::followers(user);
        assert_eq!(room.kind(), RoomKind::Followers);
        assert!(RoomName::parse(&room.to_string()).is_ok());
        assert!(RoomName::parse_client(&room.to_string()).is_err());
    }

    #[test]
    fn test_room_name_serializes_as_string() {
        let room = RoomName::parse("watchParty:p1").unwrap();
        let json = serde_json::to_string(&room).unwrap();
        assert_eq!(json, "\"watchParty:p1\"");
        let back: RoomName = serde_json::from_str(&json).unwrap();
        assert_eq!(back, room);
        assert!(serde_json::from_str::<RoomName>("\"nope\"").is_err());
    }

    #[test]
    fn test_overlong_key_rejected() {
        let key = "a".repeat(MAX_ROOM_KEY_LEN + 1);
        assert!(RoomName::new(RoomKind::Post, key).is_err());
    }
}
