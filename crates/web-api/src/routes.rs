use axum::{
    extract::{ws::WebSocketUpgrade, Path, Query, State},
    http::{HeaderMap, StatusCode},
    response::Response,
    routing::{get, post},
    Json, Router,
};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tower::ServiceBuilder;
use tower_http::trace::TraceLayer;
use uuid::Uuid;

use application::ApplicationError;
use domain::{Envelope, PresenceEntry, RoomName, UserId};

use crate::auth::bearer_token;
use crate::ws_connection::WebSocketConnection;
use crate::{error::ApiError, state::AppState};

/// 内部接口使用的共享密钥头
pub const INTERNAL_TOKEN_HEADER: &str = "x-internal-token";

#[derive(Debug, Deserialize)]
struct WsQuery {
    token: Option<String>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct RoomMembersResponse {
    room: RoomName,
    members: Vec<UserId>,
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/ws", get(websocket_upgrade))
        .nest("/api/v1", api_routes())
        .layer(ServiceBuilder::new().layer(TraceLayer::new_for_http()))
        .with_state(state)
}

fn api_routes() -> Router<AppState> {
    Router::new()
        .route("/events", post(publish_event))
        .route("/presence/{user_id}", get(get_presence))
        .route("/rooms/{room}/members", get(get_room_members))
}

async fn health(State(state): State<AppState>) -> Json<Value> {
    Json(json!({
        "status": "ok",
        "instanceId": state.hub.instance_id(),
        "connections": state.hub.connection_count(),
    }))
}

/// 认证在升级之前完成，失败时直接返回 HTTP 错误
async fn websocket_upgrade(
    State(state): State<AppState>,
    Query(query): Query<WsQuery>,
    headers: HeaderMap,
    ws: WebSocketUpgrade,
) -> Result<Response, ApiError> {
    let token = query
        .token
        .as_deref()
        .or_else(|| bearer_token(&headers))
        .ok_or_else(|| ApiError::unauthorized("missing session token"))?;

    let session = state.hub.accept(token).await.map_err(|err| {
        tracing::info!(error = %err, "websocket handshake rejected");
        ApiError::from(err)
    })?;

    Ok(ws.on_upgrade(move |socket| WebSocketConnection::new(socket, session).run()))
}

fn require_internal(state: &AppState, headers: &HeaderMap) -> Result<(), ApiError> {
    let provided = headers
        .get(INTERNAL_TOKEN_HEADER)
        .and_then(|value| value.to_str().ok());
    match (state.internal_token.as_deref(), provided) {
        (Some(expected), Some(provided)) if expected == provided => Ok(()),
        _ => Err(ApiError::unauthorized("invalid internal token")),
    }
}

/// CRUD 层注入领域事件
async fn publish_event(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(envelope): Json<Envelope>,
) -> Result<(StatusCode, Json<Value>), ApiError> {
    require_internal(&state, &headers)?;
    let event_type = envelope.event_type.clone();
    let delivered = state.hub.publish(envelope).await?;
    tracing::debug!(event_type, delivered, "internal event published");
    Ok((StatusCode::ACCEPTED, Json(json!({ "delivered": delivered }))))
}

async fn get_presence(
    State(state): State<AppState>,
    Path(user_id): Path<Uuid>,
) -> Result<Json<PresenceEntry>, ApiError> {
    let entry = state.hub.presence_of(UserId::from(user_id)).await?;
    Ok(Json(entry))
}

async fn get_room_members(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(room): Path<String>,
) -> Result<Json<RoomMembersResponse>, ApiError> {
    require_internal(&state, &headers)?;
    let room = RoomName::parse(&room).map_err(ApplicationError::from)?;
    let members = state.hub.room_members(&room).await?;
    Ok(Json(RoomMembersResponse { room, members }))
}
