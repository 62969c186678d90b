//! 输入中提示
//!
//! 每个 (用户, 频道) 一条短期状态。重复的 start 只刷新到期时间，不会再次广播；
//! 到期、显式 stop 或连接断开都会清除状态并广播 stop。

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use domain::{event_types, ConnectionId, Envelope, RoomName, UserId};
use serde_json::json;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::broadcaster::EventBroadcaster;
use crate::error::BroadcastError;
use crate::scheduler::{Expired, ExpiryScheduler};

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct TypingKey {
    pub user_id: UserId,
    pub channel: RoomName,
}

#[derive(Debug, Clone)]
struct TypingState {
    connection_id: ConnectionId,
    display_name: Option<String>,
    generation: u64,
}

pub struct TypingManager {
    states: DashMap<TypingKey, TypingState>,
    scheduler: ExpiryScheduler<TypingKey>,
    generation: AtomicU64,
    broadcaster: Arc<EventBroadcaster>,
    expiry: Duration,
}

impl TypingManager {
    /// 创建管理器并启动到期处理任务
    pub fn spawn(broadcaster: Arc<EventBroadcaster>, expiry: Duration) -> (Arc<Self>, JoinHandle<()>) {
        let (scheduler, expired) = ExpiryScheduler::spawn();
        let manager = Arc::new(Self {
            states: DashMap::new(),
            scheduler,
            generation: AtomicU64::new(0),
            broadcaster,
            expiry,
        });
        let handle = tokio::spawn(expiry_loop(Arc::downgrade(&manager), expired));
        (manager, handle)
    }

    /// 开始输入；返回是否广播了 start（已处于输入中时只刷新到期时间）
    pub async fn start(
        &self,
        user_id: UserId,
        connection_id: ConnectionId,
        channel: &RoomName,
        display_name: Option<String>,
    ) -> Result<bool, BroadcastError> {
        let generation = self.generation.fetch_add(1, Ordering::Relaxed) + 1;
        let key = TypingKey {
            user_id,
            channel: channel.clone(),
        };

        let first = match self.states.entry(key.clone()) {
            Entry::Occupied(mut entry) => {
                let state = entry.get_mut();
                state.generation = generation;
                state.connection_id = connection_id;
                false
            }
            Entry::Vacant(entry) => {
                entry.insert(TypingState {
                    connection_id,
                    display_name: display_name.clone(),
                    generation,
                });
                true
            }
        };
        self.scheduler.schedule(key.clone(), generation, self.expiry);

        if first {
            let envelope = Envelope::new(
                event_types::TYPING_START,
                json!({
                    "userId": user_id.to_string(),
                    "channel": channel.to_string(),
                    "displayName": display_name,
                }),
            )
            .to_room(channel.clone())
            .excluding(connection_id);
            if let Err(err) = self.broadcaster.publish(envelope).await {
                // start 没有发出去：撤销状态，下一次 start 会重新广播
                if self
                    .states
                    .remove_if(&key, |_, state| state.generation == generation)
                    .is_some()
                {
                    self.scheduler.cancel(key);
                }
                return Err(err);
            }
        }
        Ok(first)
    }

    /// 停止输入；未处于输入中时无操作
    pub async fn stop(&self, user_id: UserId, channel: &RoomName) -> Result<bool, BroadcastError> {
        let key = TypingKey {
            user_id,
            channel: channel.clone(),
        };
        let Some((key, state)) = self.states.remove(&key) else {
            return Ok(false);
        };
        self.scheduler.cancel(key.clone());
        self.emit_stop(&key, &state, "stopped").await?;
        Ok(true)
    }

    /// 连接断开时清掉它名下的全部输入状态
    pub async fn clear_all_for_connection(&self, connection_id: ConnectionId) {
        let keys: Vec<TypingKey> = self
            .states
            .iter()
            .filter(|entry| entry.value().connection_id == connection_id)
            .map(|entry| entry.key().clone())
            .collect();

        for key in keys {
            let Some((key, state)) = self
                .states
                .remove_if(&key, |_, state| state.connection_id == connection_id)
            else {
                continue;
            };
            self.scheduler.cancel(key.clone());
            if let Err(err) = self.emit_stop(&key, &state, "disconnected").await {
                tracing::warn!(user_id = %key.user_id, channel = %key.channel, error = %err, "typing stop broadcast failed");
            }
        }
    }

    /// 到期：只有代数一致才清除，被刷新过的状态保持不变
    pub async fn handle_expiry(&self, expired: Expired<TypingKey>) {
        let Some((key, state)) = self
            .states
            .remove_if(&expired.key, |_, state| state.generation == expired.generation)
        else {
            return;
        };
        if let Err(err) = self.emit_stop(&key, &state, "expired").await {
            tracing::warn!(user_id = %key.user_id, channel = %key.channel, error = %err, "typing stop broadcast failed");
        }
    }

    pub fn is_typing(&self, user_id: UserId, channel: &RoomName) -> bool {
        self.states.contains_key(&TypingKey {
            user_id,
            channel: channel.clone(),
        })
    }

    async fn emit_stop(
        &self,
        key: &TypingKey,
        state: &TypingState,
        reason: &str,
    ) -> Result<(), BroadcastError> {
        let envelope = Envelope::new(
            event_types::TYPING_STOP,
            json!({
                "userId": key.user_id.to_string(),
                "channel": key.channel.to_string(),
                "displayName": state.display_name,
                "reason": reason,
            }),
        )
        .to_room(key.channel.clone())
        .excluding(state.connection_id);
        self.broadcaster.publish(envelope).await.map(|_| ())
    }
}

async fn expiry_loop(manager: Weak<TypingManager>, mut expired: mpsc::UnboundedReceiver<Expired<TypingKey>>) {
    while let Some(item) = expired.recv().await {
        let Some(manager) = manager.upgrade() else {
            break;
        };
        manager.handle_expiry(item).await;
    }
}
