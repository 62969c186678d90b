//! 统一配置中心
//!
//! 实时枢纽的全部可调参数：
//! - 监听地址与内部令牌
//! - 事件总线（Redis）连接
//! - 在线状态、输入提示、限流的时间窗口
//! - CRUD 层协作方地址
//!
//! 加载顺序：默认值 -> 可选文件（`HUB_CONFIG_FILE`）-> 环境变量（`HUB_*`，`__` 分隔层级）。

use std::time::Duration;

use figment::providers::{Env, Format, Json, Serialized, Toml, Yaml};
use figment::Figment;
use serde::{Deserialize, Serialize};
use validator::Validate;

/// 环境变量前缀
pub const ENV_PREFIX: &str = "HUB_";
/// 配置文件路径环境变量
pub const CONFIG_FILE_ENV: &str = "HUB_CONFIG_FILE";

/// 全局配置
#[derive(Debug, Clone, Default, Serialize, Deserialize, Validate)]
pub struct HubConfig {
    #[serde(default)]
    #[validate(nested)]
    pub server: ServerConfig,
    #[serde(default)]
    #[validate(nested)]
    pub bus: BusConfig,
    #[serde(default)]
    #[validate(nested)]
    pub presence: PresenceConfig,
    #[serde(default)]
    #[validate(nested)]
    pub typing: TypingConfig,
    #[serde(default)]
    #[validate(nested)]
    pub rate_limit: RateLimitConfig,
    #[serde(default)]
    #[validate(nested)]
    pub jwt: JwtConfig,
    #[serde(default)]
    #[validate(nested)]
    pub collaborators: CollaboratorConfig,
    #[serde(default)]
    pub log: LogConfig,
}

/// 服务器配置
#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
pub struct ServerConfig {
    #[validate(length(min = 1))]
    pub host: String,
    #[validate(range(min = 1))]
    pub port: u16,
    /// 内部发布接口的共享密钥，未设置时接口拒绝所有请求
    #[serde(default)]
    pub internal_token: Option<String>,
    /// 单连接出站队列容量
    #[validate(range(min = 1))]
    pub outbound_buffer: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".into(),
            port: 8080,
            internal_token: None,
            outbound_buffer: 256,
        }
    }
}

/// 事件总线配置
#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
pub struct BusConfig {
    /// 为空时使用进程内总线（单节点部署）
    #[serde(default)]
    #[validate(url)]
    pub redis_url: Option<String>,
    #[validate(length(min = 1))]
    pub channel: String,
    #[validate(range(min = 16))]
    pub capacity: usize,
}

impl Default for BusConfig {
    fn default() -> Self {
        Self {
            redis_url: None,
            channel: "realtime:events".into(),
            capacity: 1024,
        }
    }
}

/// 在线状态配置
#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
pub struct PresenceConfig {
    #[validate(range(min = 1))]
    pub staleness_secs: u64,
    #[validate(range(min = 1))]
    pub sweep_interval_secs: u64,
    pub grace_period_secs: u64,
}

impl Default for PresenceConfig {
    fn default() -> Self {
        Self {
            staleness_secs: 300,
            sweep_interval_secs: 60,
            grace_period_secs: 10,
        }
    }
}

impl PresenceConfig {
    pub fn staleness(&self) -> Duration {
        Duration::from_secs(self.staleness_secs)
    }

    pub fn sweep_interval(&self) -> Duration {
        Duration::from_secs(self.sweep_interval_secs)
    }

    pub fn grace_period(&self) -> Duration {
        Duration::from_secs(self.grace_period_secs)
    }
}

/// 输入提示配置
#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
pub struct TypingConfig {
    #[validate(range(min = 100))]
    pub expiry_ms: u64,
}

impl Default for TypingConfig {
    fn default() -> Self {
        Self { expiry_ms: 3000 }
    }
}

impl TypingConfig {
    pub fn expiry(&self) -> Duration {
        Duration::from_millis(self.expiry_ms)
    }
}

/// 限流配置
#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
pub struct RateLimitConfig {
    #[validate(range(min = 1))]
    pub budget: u32,
    #[validate(range(min = 1))]
    pub window_secs: u64,
    /// 连续被拒次数达到该值即断开连接
    #[validate(range(min = 1))]
    pub abuse_threshold: u32,
    #[validate(range(min = 1))]
    pub max_connections_per_user: u32,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            budget: 100,
            window_secs: 60,
            abuse_threshold: 20,
            max_connections_per_user: 10,
        }
    }
}

impl RateLimitConfig {
    pub fn window(&self) -> Duration {
        Duration::from_secs(self.window_secs)
    }
}

/// JWT配置
#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
pub struct JwtConfig {
    #[validate(length(min = 32))]
    pub secret: String,
}

impl Default for JwtConfig {
    fn default() -> Self {
        Self {
            secret: "dev-secret-key-not-for-production-use-minimum-32-chars".into(),
        }
    }
}

/// CRUD 层协作方配置
#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
pub struct CollaboratorConfig {
    /// 为空时使用宽松的本地实现（仅开发环境）
    #[serde(default)]
    #[validate(url)]
    pub base_url: Option<String>,
    #[validate(range(min = 1))]
    pub timeout_ms: u64,
}

impl Default for CollaboratorConfig {
    fn default() -> Self {
        Self {
            base_url: None,
            timeout_ms: 2000,
        }
    }
}

impl CollaboratorConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }
}

/// 日志配置
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct LogConfig {
    #[serde(default)]
    pub json: bool,
}

impl HubConfig {
    /// 按 默认值 -> 文件 -> 环境变量 的顺序加载并校验
    pub fn load() -> Result<Self, ConfigError> {
        let mut figment = Figment::from(Serialized::defaults(HubConfig::default()));
        if let Ok(path) = std::env::var(CONFIG_FILE_ENV) {
            figment = Self::merge_file(figment, &path);
        }
        Self::extract(figment.merge(Env::prefixed(ENV_PREFIX).split("__")))
    }

    /// 仅从指定文件加载（环境变量仍然覆盖）
    pub fn load_from(path: &str) -> Result<Self, ConfigError> {
        let figment = Self::merge_file(Figment::from(Serialized::defaults(HubConfig::default())), path);
        Self::extract(figment.merge(Env::prefixed(ENV_PREFIX).split("__")))
    }

    fn merge_file(figment: Figment, path: &str) -> Figment {
        if path.ends_with(".yml") || path.ends_with(".yaml") {
            figment.merge(Yaml::file(path))
        } else if path.ends_with(".json") {
            figment.merge(Json::file(path))
        } else {
            figment.merge(Toml::file(path))
        }
    }

    fn extract(figment: Figment) -> Result<Self, ConfigError> {
        let config: HubConfig = figment
            .extract()
            .map_err(|e| ConfigError::Load(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// 日志用的脱敏描述
    pub fn sanitize(&self) -> String {
        format!(
            "server={}:{} bus={} collaborators={} grace={}s typing={}ms budget={}/{}s",
            self.server.host,
            self.server.port,
            self.bus
                .redis_url
                .as_deref()
                .map(redact_url)
                .unwrap_or_else(|| "memory".into()),
            self.collaborators.base_url.as_deref().unwrap_or("local"),
            self.presence.grace_period_secs,
            self.typing.expiry_ms,
            self.rate_limit.budget,
            self.rate_limit.window_secs,
        )
    }
}

fn redact_url(url: &str) -> String {
    match (url.find("://"), url.rfind('@')) {
        (Some(scheme_end), Some(at)) if at > scheme_end => {
            format!("{}://***@{}", &url[..scheme_end], &url[at + 1..])
        }
        _ => url.to_string(),
    }
}

/// 配置错误类型
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to load configuration: {0}")]
    Load(String),
    #[error("invalid configuration: {0}")]
    Invalid(#[from] validator::ValidationErrors),
}
