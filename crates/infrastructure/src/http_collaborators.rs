//! CRUD 层协作方的 HTTP 实现
//!
//! 房间访问判定、领域事件持久化、通知入队、观影派对目录都由 CRUD 层负责，
//! 这里只是调用它的内部接口。任何传输失败或非 2xx 响应都映射为基础设施错误，
//! 触发该调用的动作随之失败。

use std::time::Duration;

use application::{
    ApplicationError, EventPersister, NotificationQueue, ParticipantStatus, RoomAccessChecker,
    WatchPartyDirectory,
};
use async_trait::async_trait;
use domain::{Envelope, RoomName, UserId, WatchPartyRecord, WatchPartyStatus};
use reqwest::{Client, Response, StatusCode};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;
use tracing::{debug, warn};

const API_PREFIX: &str = "internal/realtime";

#[derive(Debug, Error)]
pub enum CollaboratorError {
    #[error("collaborator request failed: {0}")]
    Transport(#[from] reqwest::Error),
    #[error("collaborator returned {status} for {endpoint}")]
    Status { status: StatusCode, endpoint: String },
    #[error("invalid collaborator configuration: {0}")]
    Config(String),
}

impl From<CollaboratorError> for ApplicationError {
    fn from(err: CollaboratorError) -> Self {
        ApplicationError::infrastructure(err.to_string())
    }
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct AccessRequest<'a> {
    user_id: UserId,
    room: &'a RoomName,
}

#[derive(Deserialize)]
struct AccessResponse {
    allowed: bool,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct NotificationRequest<'a> {
    user_id: UserId,
    payload: &'a Value,
}

#[derive(Serialize, Deserialize)]
struct StatusBody<T> {
    status: T,
}

/// 基于 `reqwest` 的协作方客户端
#[derive(Clone)]
pub struct HttpCollaborators {
    client: Client,
    base_url: String,
}

impl HttpCollaborators {
    pub fn new(base_url: &str, timeout: Duration) -> Result<Self, CollaboratorError> {
        if !(base_url.starts_with("http://") || base_url.starts_with("https://")) {
            return Err(CollaboratorError::Config(format!(
                "base url must be http(s): {base_url}"
            )));
        }
        let client = Client::builder().timeout(timeout).build()?;
        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
        })
    }

    fn url(&self, path: &str) -> String {
        format!("{}/{}/{}", self.base_url, API_PREFIX, path)
    }

    /// 非 2xx 转为错误
    fn check(response: Response, endpoint: &str) -> Result<Response, CollaboratorError> {
        let status = response.status();
        if status.is_success() {
            Ok(response)
        } else {
            warn!(endpoint, status = %status, "collaborator call rejected");
            Err(CollaboratorError::Status {
                status,
                endpoint: endpoint.to_string(),
            })
        }
    }
}

#[async_trait]
impl RoomAccessChecker for HttpCollaborators {
    async fn check_access(&self, user_id: UserId, room: &RoomName) -> Result<bool, ApplicationError> {
        let response = self
            .client
            .post(self.url("access"))
            .json(&AccessRequest { user_id, room })
            .send()
            .await
            .map_err(CollaboratorError::from)?;
        let body: AccessResponse = Self::check(response, "access")?
            .json()
            .await
            .map_err(CollaboratorError::from)?;
        debug!(user_id = %user_id, room = %room, allowed = body.allowed, "room access checked");
        Ok(body.allowed)
    }
}

#[async_trait]
impl EventPersister for HttpCollaborators {
    async fn persist(&self, envelope: &Envelope) -> Result<(), ApplicationError> {
        let response = self
            .client
            .post(self.url("events"))
            .json(envelope)
            .send()
            .await
            .map_err(CollaboratorError::from)?;
        Self::check(response, "events")?;
        Ok(())
    }
}

#[async_trait]
impl NotificationQueue for HttpCollaborators {
    async fn enqueue(&self, user_id: UserId, payload: Value) -> Result<(), ApplicationError> {
        let response = self
            .client
            .post(self.url("notifications"))
            .json(&NotificationRequest {
                user_id,
                payload: &payload,
            })
            .send()
            .await
            .map_err(CollaboratorError::from)?;
        Self::check(response, "notifications")?;
        Ok(())
    }
}

#[async_trait]
impl WatchPartyDirectory for HttpCollaborators {
    async fn fetch(&self, party_id: &str) -> Result<Option<WatchPartyRecord>, ApplicationError> {
        let response = self
            .client
            .get(self.url(&format!("watch-parties/{party_id}")))
            .send()
            .await
            .map_err(CollaboratorError::from)?;
        if response.status() == StatusCode::NOT_FOUND {
            return Ok(None);
        }
        let record = Self::check(response, "watch-parties")?
            .json()
            .await
            .map_err(CollaboratorError::from)?;
        Ok(Some(record))
    }

    async fn update_status(
        &self,
        party_id: &str,
        status: WatchPartyStatus,
    ) -> Result<(), ApplicationError> {
        let response = self
            .client
            .put(self.url(&format!("watch-parties/{party_id}/status")))
            .json(&StatusBody { status })
            .send()
            .await
            .map_err(CollaboratorError::from)?;
        Self::check(response, "watch-parties/status")?;
        Ok(())
    }

    async fn participant(
        &self,
        party_id: &str,
        user_id: UserId,
    ) -> Result<Option<ParticipantStatus>, ApplicationError> {
        let response = self
            .client
            .get(self.url(&format!("watch-parties/{party_id}/participants/{user_id}")))
            .send()
            .await
            .map_err(CollaboratorError::from)?;
        if response.status() == StatusCode::NOT_FOUND {
            return Ok(None);
        }
        let body: StatusBody<ParticipantStatus> = Self::check(response, "watch-parties/participants")?
            .json()
            .await
            .map_err(CollaboratorError::from)?;
        Ok(Some(body.status))
    }

    async fn set_participant(
        &self,
        party_id: &str,
        user_id: UserId,
        status: ParticipantStatus,
    ) -> Result<(), ApplicationError> {
        let response = self
            .client
            .put(self.url(&format!("watch-parties/{party_id}/participants/{user_id}")))
            .json(&StatusBody { status })
            .send()
            .await
            .map_err(CollaboratorError::from)?;
        Self::check(response, "watch-parties/participants")?;
        Ok(())
    }
}
