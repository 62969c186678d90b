#![allow(dead_code)]

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use application::collaborators::local::{
    InMemoryWatchPartyDirectory, LoggingNotificationQueue, LoggingPersister, PermissiveAccess,
};
use application::{
    HubDependencies, HubSettings, MemoryEventBus, MemoryMembershipBackend, MemoryPresenceBackend,
    MemoryRateLimitStore, RealtimeHub,
};
use chrono::Utc;
use config::JwtConfig;
use domain::{Role, UserId};
use futures_util::{SinkExt, StreamExt};
use serde_json::{json, Value};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::oneshot;
use tokio_tungstenite::tungstenite::Message as TungsteniteMessage;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use uuid::Uuid;
use web_api::{router, AppState, Claims, JwtSessionLookup};

pub const INTERNAL_TOKEN: &str = "internal-test-token";

pub type Socket = WebSocketStream<MaybeTlsStream<TcpStream>>;

pub struct TestServer {
    pub addr: SocketAddr,
    pub hub: Arc<RealtimeHub>,
    pub jwt: JwtSessionLookup,
    shutdown: Option<oneshot::Sender<()>>,
}

impl TestServer {
    /// 内存后端、零宽限期
    pub async fn start() -> TestServer {
        Self::start_with(HubSettings {
            grace_period: Duration::ZERO,
            ..HubSettings::default()
        })
        .await
    }

    pub async fn start_with(settings: HubSettings) -> TestServer {
        let jwt = JwtSessionLookup::new(&JwtConfig::default());
        let hub = RealtimeHub::new(HubDependencies {
            settings,
            bus: Arc::new(MemoryEventBus::new(256)),
            presence: Arc::new(MemoryPresenceBackend::new()),
            membership: Arc::new(MemoryMembershipBackend::new()),
            rate_limits: Arc::new(MemoryRateLimitStore::new()),
            sessions: Arc::new(jwt.clone()),
            access: Arc::new(PermissiveAccess),
            persister: Arc::new(LoggingPersister),
            notifications: Arc::new(LoggingNotificationQueue),
            watch_parties: Arc::new(InMemoryWatchPartyDirectory::new()),
        });

        let app = router(AppState::new(hub.clone(), Some(INTERNAL_TOKEN.to_string())));
        let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
        let addr = listener.local_addr().expect("addr");
        let (shutdown_tx, shutdown_rx) = oneshot::channel::<()>();
        tokio::spawn(async move {
            axum::serve(listener, app.into_make_service())
                .with_graceful_shutdown(async {
                    let _ = shutdown_rx.await;
                })
                .await
                .ok();
        });

        TestServer {
            addr,
            hub,
            jwt,
            shutdown: Some(shutdown_tx),
        }
    }

    pub fn http(&self, path: &str) -> String {
        format!("http://{}{}", self.addr, path)
    }

    pub fn token(&self, username: &str, role: Role) -> (UserId, String) {
        self.token_expiring(username, role, Utc::now().timestamp() + 3600)
    }

    pub fn token_expiring(&self, username: &str, role: Role, exp: i64) -> (UserId, String) {
        let sub = Uuid::new_v4();
        let token = self
            .jwt
            .issue(&Claims {
                sub,
                username: username.to_string(),
                role,
                exp,
            })
            .expect("issue token");
        (UserId::from(sub), token)
    }

    /// 建立 WebSocket 连接并吞掉 `users:online` 快照
    pub async fn connect(&self, token: &str) -> Socket {
        let url = format!("ws://{}/ws?token={}", self.addr, token);
        let (mut socket, _) = connect_async(url).await.expect("websocket handshake");
        let snapshot = next_json(&mut socket).await;
        assert_eq!(snapshot["type"], "users:online");
        socket
    }

    /// 握手失败时的 HTTP 状态码
    pub async fn handshake_status(&self, query: &str) -> u16 {
        let url = format!("ws://{}/ws{}", self.addr, query);
        match connect_async(url).await {
            Ok(_) => 101,
            Err(tokio_tungstenite::tungstenite::Error::Http(response)) => {
                response.status().as_u16()
            }
            Err(other) => panic!("unexpected handshake error: {other}"),
        }
    }
}

impl Drop for TestServer {
    fn drop(&mut self) {
        if let Some(tx) = self.shutdown.take() {
            let _ = tx.send(());
        }
        self.hub.shutdown();
    }
}

pub async fn send_json(socket: &mut Socket, message_type: &str, payload: Value) {
    let frame = json!({ "type": message_type, "payload": payload });
    socket
        .send(TungsteniteMessage::Text(frame.to_string().into()))
        .await
        .expect("send frame");
}

/// 下一条 JSON 文本帧，跳过控制帧
pub async fn next_json(socket: &mut Socket) -> Value {
    loop {
        let message = tokio::time::timeout(Duration::from_secs(5), socket.next())
            .await
            .expect("frame in time")
            .expect("stream open")
            .expect("frame ok");
        match message {
            TungsteniteMessage::Text(text) => {
                return serde_json::from_str(text.as_str()).expect("json frame")
            }
            TungsteniteMessage::Close(frame) => panic!("socket closed: {frame:?}"),
            _ => continue,
        }
    }
}

/// 等待指定类型的帧，途中的其他帧被丢弃
pub async fn next_of_type(socket: &mut Socket, message_type: &str) -> Value {
    loop {
        let frame = next_json(socket).await;
        if frame["type"] == message_type {
            return frame;
        }
    }
}

/// 在超时内没有指定类型的帧
pub async fn assert_no_frame(socket: &mut Socket, message_type: &str, within: Duration) {
    let deadline = tokio::time::Instant::now() + within;
    loop {
        let remaining = deadline.saturating_duration_since(tokio::time::Instant::now());
        if remaining.is_zero() {
            return;
        }
        match tokio::time::timeout(remaining, socket.next()).await {
            Err(_) => return,
            Ok(Some(Ok(TungsteniteMessage::Text(text)))) => {
                let frame: Value = serde_json::from_str(text.as_str()).expect("json frame");
                assert_ne!(frame["type"], message_type, "unexpected frame: {frame}");
            }
            Ok(Some(Ok(_))) => continue,
            Ok(_) => return,
        }
    }
}
