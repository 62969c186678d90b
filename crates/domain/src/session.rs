//! 会话与身份快照

use serde::{Deserialize, Serialize};

use crate::value_objects::{Timestamp, UserId};

/// 账号角色
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    Member,
    Moderator,
    Admin,
    Banned,
}

impl Role {
    pub fn is_banned(&self) -> bool {
        matches!(self, Role::Banned)
    }
}

/// 认证时建立的身份快照，连接生命周期内不可变
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Identity {
    pub user_id: UserId,
    pub username: String,
    pub role: Role,
}

/// 外部会话查询的结果
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Session {
    pub identity: Identity,
    pub expires_at: Timestamp,
}

impl Session {
    pub fn is_expired(&self, now: Timestamp) -> bool {
        self.expires_at <= now
    }
}
