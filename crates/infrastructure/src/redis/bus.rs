//! Redis Pub/Sub 事件总线
//!
//! 发布走共享的 `ConnectionManager`；订阅由一个后台任务持有独立的 PubSub 连接，
//! 把收到的帧转进本地 `broadcast` 通道。连接断开后按指数退避重连。

use std::time::Duration;

use application::{BroadcastError, BusFrame, EventBus};
use async_trait::async_trait;
use futures_util::StreamExt;
use redis::aio::ConnectionManager;
use redis::{AsyncCommands, Client};
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::redis::{RedisError, RedisResult};
use crate::retry::Backoff;

/// Redis 事件总线
pub struct RedisEventBus {
    connection: ConnectionManager,
    channel: String,
    sender: broadcast::Sender<BusFrame>,
    listener: JoinHandle<()>,
}

impl RedisEventBus {
    /// 使用已建立的发布连接，并启动订阅任务。必须在 tokio 运行时内调用
    pub fn new(client: Client, connection: ConnectionManager, channel: &str, capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        let listener = tokio::spawn(listen_loop(client, channel.to_string(), sender.clone()));
        info!(channel, "Redis 事件总线已启动");
        Self {
            connection,
            channel: channel.to_string(),
            sender,
            listener,
        }
    }

    pub fn channel(&self) -> &str {
        &self.channel
    }

    async fn publish_payload(&self, payload: String) -> RedisResult<usize> {
        let mut connection = self.connection.clone();
        let receivers: usize = connection.publish(&self.channel, payload).await?;
        Ok(receivers)
    }
}

#[async_trait]
impl EventBus for RedisEventBus {
    async fn publish(&self, frame: &BusFrame) -> Result<(), BroadcastError> {
        let payload = serde_json::to_string(frame).map_err(RedisError::from)?;
        let receivers = self.publish_payload(payload).await.map_err(|err| {
            error!(channel = %self.channel, event_type = %frame.envelope.event_type, error = %err, "发布到总线失败");
            err
        })?;
        debug!(channel = %self.channel, receivers, "已发布到总线");
        Ok(())
    }

    fn subscribe(&self) -> broadcast::Receiver<BusFrame> {
        self.sender.subscribe()
    }
}

impl Drop for RedisEventBus {
    fn drop(&mut self) {
        self.listener.abort();
        info!(channel = %self.channel, "Redis 事件总线正在关闭");
    }
}

/// 订阅循环：断线后退避重连，直到任务被取消
async fn listen_loop(client: Client, channel: String, sender: broadcast::Sender<BusFrame>) {
    let mut backoff = Backoff::exponential(Duration::from_millis(200), Duration::from_secs(30));
    loop {
        match listen_once(&client, &channel, &sender, &mut backoff).await {
            Ok(()) => warn!(channel = %channel, "总线订阅流已结束"),
            Err(err) => error!(channel = %channel, error = %err, "总线订阅失败"),
        }
        let delay = backoff.next_delay();
        warn!(channel = %channel, attempt = backoff.attempts(), delay_ms = delay.as_millis() as u64, "准备重连总线");
        tokio::time::sleep(delay).await;
    }
}

async fn listen_once(
    client: &Client,
    channel: &str,
    sender: &broadcast::Sender<BusFrame>,
    backoff: &mut Backoff,
) -> RedisResult<()> {
    let mut pubsub = client.get_async_pubsub().await?;
    pubsub.subscribe(channel).await?;
    info!(channel, "已订阅总线频道");
    backoff.reset();

    let mut messages = pubsub.on_message();
    while let Some(message) = messages.next().await {
        let payload: String = match message.get_payload() {
            Ok(payload) => payload,
            Err(err) => {
                warn!(channel, error = %err, "总线消息负载无法读取");
                continue;
            }
        };
        match serde_json::from_str::<BusFrame>(&payload) {
            Ok(frame) => {
                // 没有本地订阅者时丢弃
                let _ = sender.send(frame);
            }
            Err(err) => warn!(channel, error = %err, "丢弃无法解析的总线帧"),
        }
    }
    Ok(())
}
