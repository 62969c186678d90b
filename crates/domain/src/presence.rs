//! 在线状态

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::value_objects::{Timestamp, UserId};

/// 用户在线状态
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PresenceStatus {
    Online,
    Away,
    Offline,
}

impl PresenceStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            PresenceStatus::Online => "online",
            PresenceStatus::Away => "away",
            PresenceStatus::Offline => "offline",
        }
    }

    /// 在线或离开都算作“有连接”
    pub fn is_connected(&self) -> bool {
        !matches!(self, PresenceStatus::Offline)
    }
}

impl fmt::Display for PresenceStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// 在线状态条目，按用户存储在共享存储中
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PresenceEntry {
    pub user_id: UserId,
    pub status: PresenceStatus,
    pub last_active: Timestamp,
}

impl PresenceEntry {
    pub fn offline(user_id: UserId, last_active: Timestamp) -> Self {
        Self {
            user_id,
            status: PresenceStatus::Offline,
            last_active,
        }
    }
}
