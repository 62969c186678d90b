//! 观影派对状态机
//!
//! `scheduled -> live -> ended`，`cancelled` 可从 `scheduled`/`live` 进入；
//! `ended` 与 `cancelled` 都是终态。

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::errors::DomainError;
use crate::value_objects::{Timestamp, UserId};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum WatchPartyStatus {
    Scheduled,
    Live,
    Ended,
    Cancelled,
}

impl WatchPartyStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            WatchPartyStatus::Scheduled => "scheduled",
            WatchPartyStatus::Live => "live",
            WatchPartyStatus::Ended => "ended",
            WatchPartyStatus::Cancelled => "cancelled",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, WatchPartyStatus::Ended | WatchPartyStatus::Cancelled)
    }

    pub fn can_transition_to(&self, next: WatchPartyStatus) -> bool {
        use WatchPartyStatus::*;
        matches!(
            (self, next),
            (Scheduled, Live) | (Live, Ended) | (Scheduled, Cancelled) | (Live, Cancelled)
        )
    }

    pub fn transition(self, next: WatchPartyStatus) -> Result<WatchPartyStatus, DomainError> {
        if self.can_transition_to(next) {
            Ok(next)
        } else {
            Err(DomainError::invalid_transition(self, next))
        }
    }
}

impl fmt::Display for WatchPartyStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// CRUD 层保存的派对记录
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WatchPartyRecord {
    pub id: String,
    pub host_id: UserId,
    pub status: WatchPartyStatus,
    #[serde(default)]
    pub requires_approval: bool,
}

/// 主持人广播的播放进度
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PlaybackState {
    pub position: f64,
    pub is_playing: bool,
    pub updated_at: Timestamp,
}
