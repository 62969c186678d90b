//! 集成测试共用的夹具：共享内存后端的多实例集群

#![allow(dead_code)]

use std::sync::Arc;
use std::time::Duration;

use application::collaborators::local::{
    InMemoryWatchPartyDirectory, LoggingNotificationQueue, LoggingPersister, PermissiveAccess,
};
use application::{
    ApplicationError, ConnectionSession, HubDependencies, HubSettings, MemoryEventBus,
    MemoryMembershipBackend, MemoryPresenceBackend, MemoryRateLimitStore, Outbound, RealtimeHub,
    SessionLookup,
};
use async_trait::async_trait;
use chrono::Utc;
use dashmap::DashMap;
use domain::{Identity, Role, Session, UserId, WireMessage};
use serde_json::Value;
use tokio::sync::mpsc;
use uuid::Uuid;

/// 令牌即用户名的会话表
#[derive(Default)]
pub struct StaticSessions {
    sessions: DashMap<String, Session>,
}

impl StaticSessions {
    pub fn add(&self, username: &str, role: Role) -> UserId {
        let user_id = UserId::from(Uuid::new_v4());
        self.sessions.insert(
            username.to_string(),
            Session {
                identity: Identity {
                    user_id,
                    username: username.to_string(),
                    role,
                },
                expires_at: Utc::now() + chrono::Duration::hours(1),
            },
        );
        user_id
    }
}

#[async_trait]
impl SessionLookup for StaticSessions {
    async fn lookup(&self, token: &str) -> Result<Option<Session>, ApplicationError> {
        Ok(self.sessions.get(token).map(|s| s.clone()))
    }
}

/// 多个枢纽实例共享的后端
pub struct Cluster {
    pub sessions: Arc<StaticSessions>,
    pub bus: Arc<MemoryEventBus>,
    pub presence: Arc<MemoryPresenceBackend>,
    pub membership: Arc<MemoryMembershipBackend>,
    pub rate_limits: Arc<MemoryRateLimitStore>,
    pub parties: InMemoryWatchPartyDirectory,
}

impl Cluster {
    pub fn new() -> Self {
        Self {
            sessions: Arc::new(StaticSessions::default()),
            bus: Arc::new(MemoryEventBus::new(256)),
            presence: Arc::new(MemoryPresenceBackend::new()),
            membership: Arc::new(MemoryMembershipBackend::new()),
            rate_limits: Arc::new(MemoryRateLimitStore::new()),
            parties: InMemoryWatchPartyDirectory::new(),
        }
    }

    pub fn hub(&self, settings: HubSettings) -> Arc<RealtimeHub> {
        RealtimeHub::new(HubDependencies {
            settings,
            bus: self.bus.clone(),
            presence: self.presence.clone(),
            membership: self.membership.clone(),
            rate_limits: self.rate_limits.clone(),
            sessions: self.sessions.clone(),
            access: Arc::new(PermissiveAccess),
            persister: Arc::new(LoggingPersister),
            notifications: Arc::new(LoggingNotificationQueue),
            watch_parties: Arc::new(self.parties.clone()),
        })
    }
}

pub fn settings() -> HubSettings {
    HubSettings {
        grace_period: Duration::from_secs(10),
        typing_expiry: Duration::from_secs(3),
        ..HubSettings::default()
    }
}

/// 已建立的客户端：会话加上出站队列
pub struct Client {
    pub session: ConnectionSession,
    pub rx: mpsc::Receiver<Outbound>,
}

impl Client {
    /// 建连并吞掉 `users:online` 快照
    pub async fn connect(hub: &Arc<RealtimeHub>, token: &str) -> Client {
        let mut session = hub.accept(token).await.expect("accepted");
        let mut rx = session.take_outbound().expect("outbound queue");
        let snapshot = next(&mut rx).expect("snapshot");
        assert_eq!(snapshot.message_type, "users:online");
        Client { session, rx }
    }

    pub async fn send(&self, message_type: &str, payload: Value) {
        self.session
            .handle(WireMessage::new(message_type, payload))
            .await;
    }

    /// 让后台任务跑完后取出所有已到达的事件
    pub async fn drain(&mut self) -> Vec<Arc<WireMessage>> {
        settle().await;
        let mut events = Vec::new();
        while let Some(event) = next(&mut self.rx) {
            events.push(event);
        }
        events
    }

    pub async fn received(&mut self, message_type: &str) -> Vec<Arc<WireMessage>> {
        self.drain()
            .await
            .into_iter()
            .filter(|event| event.message_type == message_type)
            .collect()
    }
}

pub fn next(rx: &mut mpsc::Receiver<Outbound>) -> Option<Arc<WireMessage>> {
    loop {
        match rx.try_recv().ok()? {
            Outbound::Event(message) => return Some(message),
            Outbound::Close { .. } => continue,
        }
    }
}

pub async fn settle() {
    tokio::time::sleep(Duration::from_millis(20)).await;
}
