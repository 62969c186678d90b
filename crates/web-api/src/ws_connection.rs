use std::time::Duration;

use application::{ConnectionSession, DispatchOutcome, Outbound};
use axum::body::Bytes;
use axum::extract::ws::{CloseFrame, Message as WsMessage, WebSocket};
use futures_util::stream::SplitSink;
use futures_util::{SinkExt, StreamExt};
use tokio::sync::mpsc;

/// 服务端主动 ping 的间隔
const PING_INTERVAL: Duration = Duration::from_secs(30);
/// 正常关闭
const CLOSE_NORMAL: u16 = 1000;

/// WebSocket 连接
///
/// 把一条已认证的 [`ConnectionSession`] 挂到套接字上：
/// - 出站队列里的事件序列化后写给客户端
/// - 入站文本交给枢纽分发
/// - ping/pong 刷新在线心跳
pub struct WebSocketConnection {
    socket: WebSocket,
    session: ConnectionSession,
}

/// WebSocket 写操作命令
#[derive(Debug)]
enum WsCommand {
    Close { code: u16, reason: String },
}

impl WebSocketConnection {
    pub fn new(socket: WebSocket, session: ConnectionSession) -> Self {
        tracing::info!(
            connection_id = %session.id(),
            user_id = %session.user_id(),
            "WebSocket 连接已建立"
        );
        Self { socket, session }
    }

    /// 运行连接主循环，直到任意一端关闭
    pub async fn run(self) {
        let Self { socket, mut session } = self;
        let Some(outbound) = session.take_outbound() else {
            tracing::error!(connection_id = %session.id(), "outbound queue already taken");
            session.close("transport error").await;
            return;
        };

        let (sender, mut incoming) = socket.split();
        let (cmd_tx, cmd_rx) = mpsc::channel::<WsCommand>(4);
        let mut send_task = tokio::spawn(send_loop(sender, outbound, cmd_rx));
        let mut send_finished = false;
        let mut server_close = false;

        let reason = loop {
            tokio::select! {
                message = incoming.next() => {
                    let Some(Ok(message)) = message else {
                        break "socket closed";
                    };
                    match Self::handle_incoming(&session, message).await {
                        Ok(DispatchOutcome::Continue) => {}
                        Ok(DispatchOutcome::Close { code, reason }) => {
                            server_close = cmd_tx.send(WsCommand::Close { code, reason }).await.is_ok();
                            break "closed by server";
                        }
                        Err(()) => break "client closed",
                    }
                }
                _ = &mut send_task => {
                    send_finished = true;
                    break "send task finished";
                }
            }
        };

        // 服务端主动关闭时给发送任务一点时间写出关闭帧
        drop(cmd_tx);
        if !send_finished {
            if !server_close
                || tokio::time::timeout(Duration::from_secs(1), &mut send_task)
                    .await
                    .is_err()
            {
                send_task.abort();
            }
        }

        let connection_id = session.id();
        let user_id = session.user_id();
        session.close(reason).await;
        tracing::info!(connection_id = %connection_id, user_id = %user_id, reason, "WebSocket 连接已断开");
    }

    /// 处理一条客户端帧；`Err` 表示客户端要求关闭
    async fn handle_incoming(
        session: &ConnectionSession,
        message: WsMessage,
    ) -> Result<DispatchOutcome, ()> {
        match message {
            WsMessage::Close(_) => {
                tracing::debug!(connection_id = %session.id(), "收到关闭消息");
                Err(())
            }
            WsMessage::Ping(_) | WsMessage::Pong(_) => {
                session.heartbeat().await;
                Ok(DispatchOutcome::Continue)
            }
            WsMessage::Text(text) => Ok(session.handle_text(text.as_str()).await),
            WsMessage::Binary(data) => match std::str::from_utf8(&data) {
                Ok(text) => Ok(session.handle_text(text).await),
                Err(_) => {
                    tracing::debug!(connection_id = %session.id(), "non-utf8 binary frame ignored");
                    Ok(DispatchOutcome::Continue)
                }
            },
        }
    }
}

/// 发送任务：统一处理所有对 WebSocket sender 的写操作
async fn send_loop(
    mut sender: SplitSink<WebSocket, WsMessage>,
    mut outbound: mpsc::Receiver<Outbound>,
    mut commands: mpsc::Receiver<WsCommand>,
) {
    let mut ping = tokio::time::interval_at(tokio::time::Instant::now() + PING_INTERVAL, PING_INTERVAL);
    loop {
        let frame = tokio::select! {
            item = outbound.recv() => match item {
                Some(Outbound::Event(message)) => match serde_json::to_string(&*message) {
                    Ok(json) => WsMessage::Text(json.into()),
                    Err(err) => {
                        tracing::warn!(error = %err, "failed to serialize websocket payload");
                        continue;
                    }
                },
                Some(Outbound::Close { code, reason }) => close_frame(code, reason),
                None => close_frame(CLOSE_NORMAL, "hub closed connection".into()),
            },
            Some(command) = commands.recv() => match command {
                WsCommand::Close { code, reason } => close_frame(code, reason),
            },
            _ = ping.tick() => WsMessage::Ping(Bytes::new()),
        };
        let closing = matches!(frame, WsMessage::Close(_));
        if sender.send(frame).await.is_err() {
            tracing::debug!("websocket send failed");
            break;
        }
        if closing {
            break;
        }
    }
    let _ = sender.close().await;
}

fn close_frame(code: u16, reason: String) -> WsMessage {
    WsMessage::Close(Some(CloseFrame {
        code,
        reason: reason.into(),
    }))
}
