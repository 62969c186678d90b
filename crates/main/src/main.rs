//! 主应用程序入口
//!
//! 加载配置、选择共享状态后端与协作方实现、启动 Axum 服务，收到信号后优雅退出。

use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use application::collaborators::local::{
    InMemoryWatchPartyDirectory, LoggingNotificationQueue, LoggingPersister, PermissiveAccess,
};
use application::{
    EventBus, EventPersister, HubDependencies, HubSettings, MemoryEventBus,
    MemoryMembershipBackend, MemoryPresenceBackend, MemoryRateLimitStore, MembershipBackend,
    NotificationQueue, PresenceBackend, RateLimitStore, RealtimeHub, RoomAccessChecker,
    WatchPartyDirectory,
};
use config::{HubConfig, LogConfig};
use infrastructure::{HttpCollaborators, RedisBackends, DEFAULT_KEY_PREFIX};
use tracing_subscriber::EnvFilter;
use web_api::{router, AppState, JwtSessionLookup};

/// 关闭时等待连接退出的最长时间
const DRAIN_TIMEOUT: Duration = Duration::from_secs(2);

/// 跨进程共享的状态后端
struct SharedState {
    bus: Arc<dyn EventBus>,
    presence: Arc<dyn PresenceBackend>,
    membership: Arc<dyn MembershipBackend>,
    rate_limits: Arc<dyn RateLimitStore>,
}

/// CRUD 层协作方
struct Collaborators {
    access: Arc<dyn RoomAccessChecker>,
    persister: Arc<dyn EventPersister>,
    notifications: Arc<dyn NotificationQueue>,
    watch_parties: Arc<dyn WatchPartyDirectory>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = HubConfig::load().context("加载配置失败")?;
    init_tracing(&config.log);
    tracing::info!(config = %config.sanitize(), "配置已加载");

    let shared = shared_state(&config).await?;
    let collaborators = collaborators(&config)?;

    let hub = RealtimeHub::new(HubDependencies {
        settings: HubSettings::from(&config),
        bus: shared.bus,
        presence: shared.presence,
        membership: shared.membership,
        rate_limits: shared.rate_limits,
        sessions: Arc::new(JwtSessionLookup::new(&config.jwt)),
        access: collaborators.access,
        persister: collaborators.persister,
        notifications: collaborators.notifications,
        watch_parties: collaborators.watch_parties,
    });

    if config.server.internal_token.is_none() {
        tracing::warn!("server.internal_token 未设置，内部接口将拒绝所有请求");
    }
    let app = router(AppState::new(hub.clone(), config.server.internal_token.clone()));

    let address = format!("{}:{}", config.server.host, config.server.port);
    let listener = tokio::net::TcpListener::bind(&address)
        .await
        .with_context(|| format!("监听 {address} 失败"))?;

    tracing::info!("实时服务启动在 http://{}", address);
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    hub.shutdown();
    drain_connections(&hub).await;
    Ok(())
}

/// 等待已升级的 WebSocket 连接写出关闭帧并完成清理
async fn drain_connections(hub: &RealtimeHub) {
    let drained = tokio::time::timeout(DRAIN_TIMEOUT, async {
        while hub.connection_count() > 0 {
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
    })
    .await;
    if drained.is_err() {
        tracing::warn!(remaining = hub.connection_count(), "连接未在期限内全部关闭");
    }
}

fn init_tracing(log: &LogConfig) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let builder = tracing_subscriber::fmt().with_env_filter(filter);
    if log.json {
        builder.json().init();
    } else {
        builder.init();
    }
}

/// 配置了 Redis 时使用 Redis 后端，否则退回进程内实现（单节点）
async fn shared_state(config: &HubConfig) -> anyhow::Result<SharedState> {
    match config.bus.redis_url.as_deref() {
        Some(url) => {
            let backends = RedisBackends::connect(
                url,
                &config.bus.channel,
                config.bus.capacity,
                DEFAULT_KEY_PREFIX,
            )
            .await
            .context("连接 Redis 失败")?;
            Ok(SharedState {
                bus: backends.bus,
                presence: backends.presence,
                membership: backends.membership,
                rate_limits: backends.rate_limits,
            })
        }
        None => {
            tracing::warn!("未配置 bus.redis_url，使用进程内后端，仅适用于单节点部署");
            Ok(SharedState {
                bus: Arc::new(MemoryEventBus::new(config.bus.capacity)),
                presence: Arc::new(MemoryPresenceBackend::new()),
                membership: Arc::new(MemoryMembershipBackend::new()),
                rate_limits: Arc::new(MemoryRateLimitStore::new()),
            })
        }
    }
}

fn collaborators(config: &HubConfig) -> anyhow::Result<Collaborators> {
    match config.collaborators.base_url.as_deref() {
        Some(base_url) => {
            let http = Arc::new(
                HttpCollaborators::new(base_url, config.collaborators.timeout())
                    .context("创建协作方客户端失败")?,
            );
            Ok(Collaborators {
                access: http.clone(),
                persister: http.clone(),
                notifications: http.clone(),
                watch_parties: http,
            })
        }
        None => {
            tracing::warn!("未配置 collaborators.base_url，使用宽松的本地协作方（仅开发环境）");
            Ok(Collaborators {
                access: Arc::new(PermissiveAccess),
                persister: Arc::new(LoggingPersister),
                notifications: Arc::new(LoggingNotificationQueue),
                watch_parties: Arc::new(InMemoryWatchPartyDirectory::new()),
            })
        }
    }
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(err) = tokio::signal::ctrl_c().await {
            tracing::error!(error = %err, "无法监听 Ctrl+C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(err) => {
                tracing::error!(error = %err, "无法监听 SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
    tracing::info!("收到退出信号，开始优雅关闭");
}
