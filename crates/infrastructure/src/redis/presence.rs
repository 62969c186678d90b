//! Redis 在线状态后端
//!
//! 键布局（`{prefix}` 默认 `rt`）：
//! - `{prefix}:presence:{user}` 哈希，字段 `status`、`last_active`，
//!   以及 `last_seen`（最近一次心跳或连接注销，毫秒）
//! - `{prefix}:presence:{user}:conns` 有序集合，成员为连接 ID，分数为最近心跳（毫秒）
//! - `{prefix}:presence:online` 集合，状态为 online/away 的用户
//!
//! 状态变更通过 Lua 脚本做原子比较交换，多个进程并发更新同一用户时不会丢失迁移。

use std::str::FromStr;
use std::time::Duration;

use application::{ApplicationError, PresenceBackend, PrunedConnections};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use domain::{ConnectionId, PresenceEntry, PresenceStatus, UserId};
use redis::aio::ConnectionManager;
use redis::{AsyncCommands, Script};

use crate::redis::{RedisError, RedisResult};

const CAS_SCRIPT: &str = r#"
local current = redis.call('HGET', KEYS[1], 'status')
if not current then
    current = 'offline'
end
if current ~= ARGV[1] then
    return 0
end
redis.call('HSET', KEYS[1], 'status', ARGV[2], 'last_active', ARGV[3])
if ARGV[2] == 'offline' then
    redis.call('SREM', KEYS[2], ARGV[4])
else
    redis.call('SADD', KEYS[2], ARGV[4])
end
return 1
"#;

/// 只刷新已登记的连接，已被清扫的连接不会被心跳复活
const TOUCH_SCRIPT: &str = r#"
if redis.call('ZSCORE', KEYS[1], ARGV[1]) then
    redis.call('ZADD', KEYS[1], ARGV[2], ARGV[1])
    redis.call('HSET', KEYS[2], 'last_active', ARGV[3], 'last_seen', ARGV[2])
    return 1
end
return 0
"#;

/// 有陈旧连接，或已无连接且 `last_seen` 早于截止时间的在线用户。
/// 宽限期内的用户连接已注销但 `last_seen` 仍新，不会被选中
const STALE_SCRIPT: &str = r#"
local stale = {}
for _, user in ipairs(redis.call('SMEMBERS', KEYS[1])) do
    local entry = ARGV[1] .. user
    local conns = entry .. ':conns'
    if redis.call('ZCOUNT', conns, '-inf', ARGV[2]) > 0 then
        table.insert(stale, user)
    elseif redis.call('ZCARD', conns) == 0 then
        local seen = tonumber(redis.call('HGET', entry, 'last_seen'))
        if not seen or seen <= tonumber(ARGV[2]) then
            table.insert(stale, user)
        end
    end
end
return stale
"#;

pub struct RedisPresenceBackend {
    connection: ConnectionManager,
    prefix: String,
    cas: Script,
    touch: Script,
    stale: Script,
}

impl RedisPresenceBackend {
    pub fn new(connection: ConnectionManager, prefix: impl Into<String>) -> Self {
        Self {
            connection,
            prefix: prefix.into(),
            cas: Script::new(CAS_SCRIPT),
            touch: Script::new(TOUCH_SCRIPT),
            stale: Script::new(STALE_SCRIPT),
        }
    }

    fn entry_prefix(&self) -> String {
        format!("{}:presence:", self.prefix)
    }

    fn entry_key(&self, user_id: UserId) -> String {
        format!("{}{}", self.entry_prefix(), user_id)
    }

    fn connections_key(&self, user_id: UserId) -> String {
        format!("{}:presence:{}:conns", self.prefix, user_id)
    }

    fn online_key(&self) -> String {
        format!("{}:presence:online", self.prefix)
    }

    fn now_millis() -> i64 {
        Utc::now().timestamp_millis()
    }

    fn cutoff(threshold: Duration) -> i64 {
        Self::now_millis() - i64::try_from(threshold.as_millis()).unwrap_or(i64::MAX)
    }

    async fn load_entry(&self, user_id: UserId) -> RedisResult<Option<PresenceEntry>> {
        let mut conn = self.connection.clone();
        let (status, last_active): (Option<String>, Option<String>) = conn
            .hget(self.entry_key(user_id), &["status", "last_active"])
            .await?;
        let Some(status) = status else {
            return Ok(None);
        };
        let status = parse_status(&status)?;
        let last_active = match last_active {
            Some(raw) => DateTime::parse_from_rfc3339(&raw)
                .map(|ts| ts.with_timezone(&Utc))
                .map_err(|err| RedisError::CorruptData {
                    message: format!("last_active for {user_id}: {err}"),
                })?,
            None => Utc::now(),
        };
        Ok(Some(PresenceEntry {
            user_id,
            status,
            last_active,
        }))
    }
}

fn parse_status(raw: &str) -> RedisResult<PresenceStatus> {
    match raw {
        "online" => Ok(PresenceStatus::Online),
        "away" => Ok(PresenceStatus::Away),
        "offline" => Ok(PresenceStatus::Offline),
        other => Err(RedisError::CorruptData {
            message: format!("unknown presence status '{other}'"),
        }),
    }
}

fn parse_connections(user_id: UserId, raw: Vec<String>) -> Vec<ConnectionId> {
    raw.into_iter()
        .filter_map(|value| match ConnectionId::from_str(&value) {
            Ok(connection_id) => Some(connection_id),
            Err(_) => {
                tracing::warn!(user_id = %user_id, value, "skipping malformed connection id");
                None
            }
        })
        .collect()
}

fn parse_users(raw: Vec<String>) -> Vec<UserId> {
    raw.into_iter()
        .filter_map(|value| match UserId::from_str(&value) {
            Ok(user_id) => Some(user_id),
            Err(_) => {
                tracing::warn!(value, "skipping malformed user id in presence set");
                None
            }
        })
        .collect()
}

#[async_trait]
impl PresenceBackend for RedisPresenceBackend {
    async fn register_connection(
        &self,
        user_id: UserId,
        connection_id: ConnectionId,
    ) -> Result<usize, ApplicationError> {
        let mut conn = self.connection.clone();
        let now = Self::now_millis();
        let (_, _, count): ((), (), usize) = redis::pipe()
            .atomic()
            .zadd(self.connections_key(user_id), connection_id.to_string(), now)
            .hset_multiple(
                self.entry_key(user_id),
                &[
                    ("last_active", Utc::now().to_rfc3339()),
                    ("last_seen", now.to_string()),
                ],
            )
            .zcard(self.connections_key(user_id))
            .query_async(&mut conn)
            .await
            .map_err(RedisError::from)?;
        Ok(count)
    }

    async fn unregister_connection(
        &self,
        user_id: UserId,
        connection_id: ConnectionId,
    ) -> Result<usize, ApplicationError> {
        let mut conn = self.connection.clone();
        let (_, _, count): ((), (), usize) = redis::pipe()
            .atomic()
            .zrem(self.connections_key(user_id), connection_id.to_string())
            .hset(self.entry_key(user_id), "last_seen", Self::now_millis())
            .zcard(self.connections_key(user_id))
            .query_async(&mut conn)
            .await
            .map_err(RedisError::from)?;
        Ok(count)
    }

    async fn touch(&self, user_id: UserId, connection_id: ConnectionId) -> Result<(), ApplicationError> {
        let mut conn = self.connection.clone();
        let _: i32 = self
            .touch
            .key(self.connections_key(user_id))
            .key(self.entry_key(user_id))
            .arg(connection_id.to_string())
            .arg(Self::now_millis())
            .arg(Utc::now().to_rfc3339())
            .invoke_async(&mut conn)
            .await
            .map_err(RedisError::from)?;
        Ok(())
    }

    async fn live_connections(&self, user_id: UserId) -> Result<usize, ApplicationError> {
        let mut conn = self.connection.clone();
        let count: usize = conn
            .zcard(self.connections_key(user_id))
            .await
            .map_err(RedisError::from)?;
        Ok(count)
    }

    async fn entry(&self, user_id: UserId) -> Result<Option<PresenceEntry>, ApplicationError> {
        Ok(self.load_entry(user_id).await?)
    }

    async fn compare_and_set(
        &self,
        user_id: UserId,
        expected: PresenceStatus,
        new: PresenceStatus,
    ) -> Result<bool, ApplicationError> {
        let mut conn = self.connection.clone();
        let swapped: i32 = self
            .cas
            .key(self.entry_key(user_id))
            .key(self.online_key())
            .arg(expected.as_str())
            .arg(new.as_str())
            .arg(Utc::now().to_rfc3339())
            .arg(user_id.to_string())
            .invoke_async(&mut conn)
            .await
            .map_err(RedisError::from)?;
        Ok(swapped == 1)
    }

    async fn online_users(&self) -> Result<Vec<UserId>, ApplicationError> {
        let mut conn = self.connection.clone();
        let members: Vec<String> = conn
            .smembers(self.online_key())
            .await
            .map_err(RedisError::from)?;
        Ok(parse_users(members))
    }

    async fn stale_users(&self, threshold: Duration) -> Result<Vec<UserId>, ApplicationError> {
        let mut conn = self.connection.clone();
        let raw: Vec<String> = self
            .stale
            .key(self.online_key())
            .arg(self.entry_prefix())
            .arg(Self::cutoff(threshold))
            .invoke_async(&mut conn)
            .await
            .map_err(RedisError::from)?;
        Ok(parse_users(raw))
    }

    async fn prune_connections(
        &self,
        user_id: UserId,
        threshold: Duration,
    ) -> Result<PrunedConnections, ApplicationError> {
        let mut conn = self.connection.clone();
        let cutoff = Self::cutoff(threshold);
        let (pruned, _, remaining): (Vec<String>, (), usize) = redis::pipe()
            .atomic()
            .zrangebyscore(self.connections_key(user_id), "-inf", cutoff)
            .zrembyscore(self.connections_key(user_id), "-inf", cutoff)
            .zcard(self.connections_key(user_id))
            .query_async(&mut conn)
            .await
            .map_err(RedisError::from)?;
        Ok(PrunedConnections {
            pruned: parse_connections(user_id, pruned),
            remaining,
        })
    }
}
