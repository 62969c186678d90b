//! 跨进程事件总线
//!
//! 每个枢纽实例把自己发布的信封包进 [`BusFrame`]，带上实例标识，
//! 订阅方据此跳过自己发出的帧，避免循环扇出。

use async_trait::async_trait;
use domain::{Envelope, InstanceId};
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

use crate::error::BroadcastError;

/// 总线上的一帧
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BusFrame {
    pub origin: InstanceId,
    pub envelope: Envelope,
}

#[async_trait]
pub trait EventBus: Send + Sync {
    async fn publish(&self, frame: &BusFrame) -> Result<(), BroadcastError>;

    /// 订阅后续帧（包括本实例发出的帧）
    fn subscribe(&self) -> broadcast::Receiver<BusFrame>;
}

/// 进程内总线，多个枢纽实例可共享同一个克隆
#[derive(Clone)]
pub struct MemoryEventBus {
    sender: broadcast::Sender<BusFrame>,
}

impl MemoryEventBus {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self { sender }
    }
}

impl Default for MemoryEventBus {
    fn default() -> Self {
        Self::new(1024)
    }
}

#[async_trait]
impl EventBus for MemoryEventBus {
    async fn publish(&self, frame: &BusFrame) -> Result<(), BroadcastError> {
        // 没有订阅者不算失败：单实例部署时总线上本来就没人听
        let _ = self.sender.send(frame.clone());
        Ok(())
    }

    fn subscribe(&self) -> broadcast::Receiver<BusFrame> {
        self.sender.subscribe()
    }
}
