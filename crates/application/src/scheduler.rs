//! 可取消的到期调度器
//!
//! 单个后台任务持有一个 `DelayQueue`，通过命令通道接收 `schedule` / `cancel`，
//! 到期后把 `(key, generation)` 发到输出通道。同一个 key 重新调度会替换旧的截止时间。
//! 消费方需自行比较 generation：已被刷新的条目不应被过期事件清除。

use std::collections::HashMap;
use std::hash::Hash;
use std::time::Duration;

use futures_util::StreamExt;
use tokio::sync::mpsc;
use tokio_util::time::{delay_queue, DelayQueue};

/// 到期通知
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Expired<K> {
    pub key: K,
    pub generation: u64,
}

enum Command<K> {
    Schedule {
        key: K,
        generation: u64,
        delay: Duration,
    },
    Cancel {
        key: K,
    },
}

/// 调度器句柄，可克隆；所有句柄释放后后台任务退出
pub struct ExpiryScheduler<K> {
    commands: mpsc::UnboundedSender<Command<K>>,
}

impl<K> Clone for ExpiryScheduler<K> {
    fn clone(&self) -> Self {
        Self {
            commands: self.commands.clone(),
        }
    }
}

impl<K> ExpiryScheduler<K>
where
    K: Clone + Eq + Hash + Send + 'static,
{
    /// 启动后台任务，必须在 tokio 运行时内调用
    pub fn spawn() -> (Self, mpsc::UnboundedReceiver<Expired<K>>) {
        let (command_tx, command_rx) = mpsc::unbounded_channel();
        let (expired_tx, expired_rx) = mpsc::unbounded_channel();
        tokio::spawn(run(command_rx, expired_tx));
        (
            Self {
                commands: command_tx,
            },
            expired_rx,
        )
    }

    /// 安排（或重新安排）`key` 在 `delay` 后到期
    pub fn schedule(&self, key: K, generation: u64, delay: Duration) {
        if self
            .commands
            .send(Command::Schedule {
                key,
                generation,
                delay,
            })
            .is_err()
        {
            tracing::warn!("expiry scheduler stopped, schedule ignored");
        }
    }

    pub fn cancel(&self, key: K) {
        if self.commands.send(Command::Cancel { key }).is_err() {
            tracing::warn!("expiry scheduler stopped, cancel ignored");
        }
    }
}

async fn run<K>(
    mut commands: mpsc::UnboundedReceiver<Command<K>>,
    expired: mpsc::UnboundedSender<Expired<K>>,
) where
    K: Clone + Eq + Hash + Send + 'static,
{
    let mut queue: DelayQueue<(K, u64)> = DelayQueue::new();
    let mut keys: HashMap<K, delay_queue::Key> = HashMap::new();

    loop {
        tokio::select! {
            command = commands.recv() => match command {
                Some(Command::Schedule { key, generation, delay }) => {
                    if let Some(previous) = keys.remove(&key) {
                        queue.remove(&previous);
                    }
                    let queue_key = queue.insert((key.clone(), generation), delay);
                    keys.insert(key, queue_key);
                }
                Some(Command::Cancel { key }) => {
                    if let Some(previous) = keys.remove(&key) {
                        queue.remove(&previous);
                    }
                }
                None => break,
            },
            Some(entry) = queue.next(), if !queue.is_empty() => {
                let (key, generation) = entry.into_inner();
                keys.remove(&key);
                if expired.send(Expired { key, generation }).is_err() {
                    break;
                }
            }
        }
    }

    tracing::debug!("expiry scheduler stopped");
}
