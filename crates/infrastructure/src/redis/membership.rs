//! Redis 房间成员后端
//!
//! `{prefix}:room:{room}:members` 保存成员用户，`{prefix}:room:{room}:user:{user}`
//! 保存该用户在房间里的连接，`{prefix}:conn:{conn}:rooms` 反向记录连接所在的房间，
//! 供清扫时回收失效连接。集合清空后 Redis 自动删除键，空房间不会残留。

use std::str::FromStr;

use application::{ApplicationError, MembershipBackend};
use async_trait::async_trait;
use domain::{ConnectionId, RoomName, UserId};
use redis::aio::ConnectionManager;
use redis::{AsyncCommands, Script};

use crate::redis::RedisError;

const ADD_SCRIPT: &str = r#"
local before = redis.call('SCARD', KEYS[2])
redis.call('SADD', KEYS[2], ARGV[2])
redis.call('SADD', KEYS[1], ARGV[1])
redis.call('SADD', KEYS[3], ARGV[3])
if before == 0 then
    return 1
end
return 0
"#;

const REMOVE_SCRIPT: &str = r#"
if redis.call('SREM', KEYS[2], ARGV[2]) == 0 then
    return 0
end
redis.call('SREM', KEYS[3], ARGV[3])
if redis.call('SCARD', KEYS[2]) == 0 then
    redis.call('SREM', KEYS[1], ARGV[1])
    return 1
end
return 0
"#;

/// ARGV[1] 为用户连接集合的键前缀，ARGV[2] 为连接反向索引的键前缀，ARGV[3] 为房间名
const CLEAR_SCRIPT: &str = r#"
local users = redis.call('SMEMBERS', KEYS[1])
for _, user in ipairs(users) do
    local conns = ARGV[1] .. user
    for _, conn in ipairs(redis.call('SMEMBERS', conns)) do
        redis.call('SREM', ARGV[2] .. conn .. ':rooms', ARGV[3])
    end
    redis.call('DEL', conns)
end
redis.call('DEL', KEYS[1])
return users
"#;

/// KEYS[1] 为连接的房间索引；ARGV[1] 为房间键前缀，ARGV[2] 用户，ARGV[3] 连接
const PURGE_SCRIPT: &str = r#"
local left = {}
for _, room in ipairs(redis.call('SMEMBERS', KEYS[1])) do
    local conns = ARGV[1] .. room .. ':user:' .. ARGV[2]
    if redis.call('SREM', conns, ARGV[3]) == 1 and redis.call('SCARD', conns) == 0 then
        redis.call('SREM', ARGV[1] .. room .. ':members', ARGV[2])
        table.insert(left, room)
    end
end
redis.call('DEL', KEYS[1])
return left
"#;

pub struct RedisMembershipBackend {
    connection: ConnectionManager,
    prefix: String,
    add: Script,
    remove: Script,
    clear: Script,
    purge: Script,
}

impl RedisMembershipBackend {
    pub fn new(connection: ConnectionManager, prefix: impl Into<String>) -> Self {
        Self {
            connection,
            prefix: prefix.into(),
            add: Script::new(ADD_SCRIPT),
            remove: Script::new(REMOVE_SCRIPT),
            clear: Script::new(CLEAR_SCRIPT),
            purge: Script::new(PURGE_SCRIPT),
        }
    }

    fn room_prefix(&self) -> String {
        format!("{}:room:", self.prefix)
    }

    fn members_key(&self, room: &RoomName) -> String {
        format!("{}{}:members", self.room_prefix(), room)
    }

    fn user_prefix(&self, room: &RoomName) -> String {
        format!("{}{}:user:", self.room_prefix(), room)
    }

    fn conn_prefix(&self) -> String {
        format!("{}:conn:", self.prefix)
    }

    fn rooms_key(&self, connection_id: ConnectionId) -> String {
        format!("{}{}:rooms", self.conn_prefix(), connection_id)
    }

    fn connections_key(&self, room: &RoomName, user_id: UserId) -> String {
        format!("{}{}", self.user_prefix(room), user_id)
    }
}

fn parse_members(room: &RoomName, raw: Vec<String>) -> Vec<UserId> {
    raw.into_iter()
        .filter_map(|value| match UserId::from_str(&value) {
            Ok(user_id) => Some(user_id),
            Err(_) => {
                tracing::warn!(room = %room, value, "skipping malformed member id");
                None
            }
        })
        .collect()
}

fn parse_rooms(connection_id: ConnectionId, raw: Vec<String>) -> Vec<RoomName> {
    raw.into_iter()
        .filter_map(|value| match RoomName::from_str(&value) {
            Ok(room) => Some(room),
            Err(_) => {
                tracing::warn!(connection_id = %connection_id, value, "skipping malformed room name");
                None
            }
        })
        .collect()
}

#[async_trait]
impl MembershipBackend for RedisMembershipBackend {
    async fn add(
        &self,
        room: &RoomName,
        user_id: UserId,
        connection_id: ConnectionId,
    ) -> Result<bool, ApplicationError> {
        let mut conn = self.connection.clone();
        let newly_member: i32 = self
            .add
            .key(self.members_key(room))
            .key(self.connections_key(room, user_id))
            .key(self.rooms_key(connection_id))
            .arg(user_id.to_string())
            .arg(connection_id.to_string())
            .arg(room.to_string())
            .invoke_async(&mut conn)
            .await
            .map_err(RedisError::from)?;
        Ok(newly_member == 1)
    }

    async fn remove(
        &self,
        room: &RoomName,
        user_id: UserId,
        connection_id: ConnectionId,
    ) -> Result<bool, ApplicationError> {
        let mut conn = self.connection.clone();
        let user_left: i32 = self
            .remove
            .key(self.members_key(room))
            .key(self.connections_key(room, user_id))
            .key(self.rooms_key(connection_id))
            .arg(user_id.to_string())
            .arg(connection_id.to_string())
            .arg(room.to_string())
            .invoke_async(&mut conn)
            .await
            .map_err(RedisError::from)?;
        Ok(user_left == 1)
    }

    async fn members(&self, room: &RoomName) -> Result<Vec<UserId>, ApplicationError> {
        let mut conn = self.connection.clone();
        let raw: Vec<String> = conn
            .smembers(self.members_key(room))
            .await
            .map_err(RedisError::from)?;
        Ok(parse_members(room, raw))
    }

    async fn contains(&self, room: &RoomName, user_id: UserId) -> Result<bool, ApplicationError> {
        let mut conn = self.connection.clone();
        let member: bool = conn
            .sismember(self.members_key(room), user_id.to_string())
            .await
            .map_err(RedisError::from)?;
        Ok(member)
    }

    async fn clear_room(&self, room: &RoomName) -> Result<Vec<UserId>, ApplicationError> {
        let mut conn = self.connection.clone();
        let raw: Vec<String> = self
            .clear
            .key(self.members_key(room))
            .arg(self.user_prefix(room))
            .arg(self.conn_prefix())
            .arg(room.to_string())
            .invoke_async(&mut conn)
            .await
            .map_err(RedisError::from)?;
        Ok(parse_members(room, raw))
    }

    async fn remove_connection(
        &self,
        user_id: UserId,
        connection_id: ConnectionId,
    ) -> Result<Vec<RoomName>, ApplicationError> {
        let mut conn = self.connection.clone();
        let raw: Vec<String> = self
            .purge
            .key(self.rooms_key(connection_id))
            .arg(self.room_prefix())
            .arg(user_id.to_string())
            .arg(connection_id.to_string())
            .invoke_async(&mut conn)
            .await
            .map_err(RedisError::from)?;
        Ok(parse_rooms(connection_id, raw))
    }
}
