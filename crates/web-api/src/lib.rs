//! Web API 层。
//!
//! 提供 Axum 路由：WebSocket 升级与连接循环、JWT 会话查询、
//! 内部事件发布接口，以及在线状态和房间成员查询。

mod auth;
mod error;
mod routes;
mod state;
mod ws_connection;

pub use auth::{bearer_token, Claims, JwtSessionLookup};
pub use error::{ApiError, ErrorBody};
pub use routes::{router, INTERNAL_TOKEN_HEADER};
pub use state::AppState;
