//! 房间注册表
//!
//! 跨进程的成员集合放在 [`MembershipBackend`] 里（用户粒度，带连接集合），
//! 本进程挂载的连接另有一份本地索引，供广播器做本地投递。
//! 房间没有独立生命周期：第一个成员加入时出现，最后一个成员离开时条目被删除。

use std::collections::HashSet;
use std::sync::Arc;

use async_trait::async_trait;
use dashmap::DashMap;
use domain::{ConnectionId, RoomKind, RoomName, UserId};

use crate::collaborators::RoomAccessChecker;
use crate::error::ApplicationError;

/// 共享的房间成员存储
#[async_trait]
pub trait MembershipBackend: Send + Sync {
    /// 记录 (user, connection) 加入房间，返回该用户是否是新成员
    async fn add(
        &self,
        room: &RoomName,
        user_id: UserId,
        connection_id: ConnectionId,
    ) -> Result<bool, ApplicationError>;

    /// 移除一条连接，返回该用户是否因此离开房间
    async fn remove(
        &self,
        room: &RoomName,
        user_id: UserId,
        connection_id: ConnectionId,
    ) -> Result<bool, ApplicationError>;

    async fn members(&self, room: &RoomName) -> Result<Vec<UserId>, ApplicationError>;

    async fn contains(&self, room: &RoomName, user_id: UserId) -> Result<bool, ApplicationError>;

    /// 删除整个房间，返回原有成员
    async fn clear_room(&self, room: &RoomName) -> Result<Vec<UserId>, ApplicationError>;

    /// 把一条连接从它加入的所有房间移除（失效连接回收），返回用户因此离开的房间
    async fn remove_connection(
        &self,
        user_id: UserId,
        connection_id: ConnectionId,
    ) -> Result<Vec<RoomName>, ApplicationError>;
}

/// 内存实现（单进程部署与测试）
pub mod memory {
    use super::*;
    use std::collections::HashMap;

    #[derive(Default)]
    pub struct MemoryMembershipBackend {
        rooms: DashMap<RoomName, HashMap<UserId, HashSet<ConnectionId>>>,
        /// 连接 -> 它所在的房间
        by_connection: DashMap<ConnectionId, HashSet<RoomName>>,
    }

    impl MemoryMembershipBackend {
        pub fn new() -> Self {
            Self::default()
        }

        /// 当前存在的房间条目数
        pub fn room_count(&self) -> usize {
            self.rooms.len()
        }

        /// 仍有房间记录的连接数
        pub fn connection_count(&self) -> usize {
            self.by_connection.len()
        }

        fn unindex(&self, connection_id: ConnectionId, room: &RoomName) {
            if let Some(mut rooms) = self.by_connection.get_mut(&connection_id) {
                rooms.remove(room);
            }
            self.by_connection
                .remove_if(&connection_id, |_, rooms| rooms.is_empty());
        }
    }

    #[async_trait]
    impl MembershipBackend for MemoryMembershipBackend {
        async fn add(
            &self,
            room: &RoomName,
            user_id: UserId,
            connection_id: ConnectionId,
        ) -> Result<bool, ApplicationError> {
            let newly_member = {
                let mut members = self.rooms.entry(room.clone()).or_default();
                let connections = members.entry(user_id).or_default();
                let newly_member = connections.is_empty();
                connections.insert(connection_id);
                newly_member
            };
            self.by_connection
                .entry(connection_id)
                .or_default()
                .insert(room.clone());
            Ok(newly_member)
        }

        async fn remove(
            &self,
            room: &RoomName,
            user_id: UserId,
            connection_id: ConnectionId,
        ) -> Result<bool, ApplicationError> {
            let (removed, user_left) = {
                let Some(mut members) = self.rooms.get_mut(room) else {
                    return Ok(false);
                };
                let (removed, user_left) = match members.get_mut(&user_id) {
                    Some(connections) => {
                        let removed = connections.remove(&connection_id);
                        (removed, removed && connections.is_empty())
                    }
                    None => (false, false),
                };
                if user_left {
                    members.remove(&user_id);
                }
                (removed, user_left)
            };
            self.rooms.remove_if(room, |_, members| members.is_empty());
            if removed {
                self.unindex(connection_id, room);
            }
            Ok(user_left)
        }

        async fn members(&self, room: &RoomName) -> Result<Vec<UserId>, ApplicationError> {
            Ok(self
                .rooms
                .get(room)
                .map(|members| members.keys().copied().collect())
                .unwrap_or_default())
        }

        async fn contains(&self, room: &RoomName, user_id: UserId) -> Result<bool, ApplicationError> {
            Ok(self
                .rooms
                .get(room)
                .map(|members| members.contains_key(&user_id))
                .unwrap_or(false))
        }

        async fn clear_room(&self, room: &RoomName) -> Result<Vec<UserId>, ApplicationError> {
            let Some((_, members)) = self.rooms.remove(room) else {
                return Ok(Vec::new());
            };
            for connection_id in members.values().flatten() {
                self.unindex(*connection_id, room);
            }
            Ok(members.into_keys().collect())
        }

        async fn remove_connection(
            &self,
            user_id: UserId,
            connection_id: ConnectionId,
        ) -> Result<Vec<RoomName>, ApplicationError> {
            let Some((_, rooms)) = self.by_connection.remove(&connection_id) else {
                return Ok(Vec::new());
            };
            let mut left = Vec::new();
            for room in rooms {
                if self.remove(&room, user_id, connection_id).await? {
                    left.push(room);
                }
            }
            Ok(left)
        }
    }
}

/// 加入结果
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Membership {
    /// 新加入；`first_for_user` 表示这是该用户在房间里的第一条连接
    Joined { first_for_user: bool },
    /// 该连接早已在房间中，无变化
    AlreadyJoined,
}

impl Membership {
    pub fn is_first_for_user(&self) -> bool {
        matches!(self, Membership::Joined { first_for_user: true })
    }
}

pub struct RoomRegistry {
    backend: Arc<dyn MembershipBackend>,
    access: Arc<dyn RoomAccessChecker>,
    /// 本进程：房间 -> 挂载的连接
    local: DashMap<RoomName, HashSet<ConnectionId>>,
    /// 本进程：连接 -> 已加入的房间
    by_connection: DashMap<ConnectionId, HashSet<RoomName>>,
}

impl RoomRegistry {
    pub fn new(backend: Arc<dyn MembershipBackend>, access: Arc<dyn RoomAccessChecker>) -> Self {
        Self {
            backend,
            access,
            local: DashMap::new(),
            by_connection: DashMap::new(),
        }
    }

    /// 准入判断：个人房间只属于本人，粉丝房间由服务端管理，其余交给外部谓词
    pub async fn authorize(&self, user_id: UserId, room: &RoomName) -> Result<bool, ApplicationError> {
        match room.kind() {
            RoomKind::User => Ok(room.key() == user_id.to_string()),
            RoomKind::Followers => Ok(true),
            _ => self.access.check_access(user_id, room).await,
        }
    }

    /// 带准入检查的加入，幂等
    pub async fn join(
        &self,
        user_id: UserId,
        connection_id: ConnectionId,
        room: &RoomName,
    ) -> Result<Membership, ApplicationError> {
        if self.is_connection_in(connection_id, room) {
            return Ok(Membership::AlreadyJoined);
        }
        if !self.authorize(user_id, room).await? {
            tracing::info!(user_id = %user_id, room = %room, "room access denied");
            return Err(ApplicationError::access_denied(room));
        }
        self.join_unchecked(user_id, connection_id, room).await
    }

    /// 跳过准入检查（服务端自动加入、已审批的派对成员）
    pub async fn join_unchecked(
        &self,
        user_id: UserId,
        connection_id: ConnectionId,
        room: &RoomName,
    ) -> Result<Membership, ApplicationError> {
        if self.is_connection_in(connection_id, room) {
            return Ok(Membership::AlreadyJoined);
        }

        let first_for_user = self.backend.add(room, user_id, connection_id).await?;
        self.local
            .entry(room.clone())
            .or_default()
            .insert(connection_id);
        self.by_connection
            .entry(connection_id)
            .or_default()
            .insert(room.clone());

        tracing::debug!(
            user_id = %user_id,
            connection_id = %connection_id,
            room = %room,
            first_for_user,
            "joined room"
        );
        Ok(Membership::Joined { first_for_user })
    }

    /// 离开房间，返回用户是否因此不再是成员。未加入时是无操作
    pub async fn leave(
        &self,
        user_id: UserId,
        connection_id: ConnectionId,
        room: &RoomName,
    ) -> Result<bool, ApplicationError> {
        if !self.forget_local(connection_id, room) {
            return Ok(false);
        }
        let user_left = self.backend.remove(room, user_id, connection_id).await?;
        tracing::debug!(
            user_id = %user_id,
            connection_id = %connection_id,
            room = %room,
            user_left,
            "left room"
        );
        Ok(user_left)
    }

    fn forget_local(&self, connection_id: ConnectionId, room: &RoomName) -> bool {
        let removed = match self.by_connection.get_mut(&connection_id) {
            Some(mut rooms) => rooms.remove(room),
            None => false,
        };
        self.by_connection
            .remove_if(&connection_id, |_, rooms| rooms.is_empty());

        if let Some(mut connections) = self.local.get_mut(room) {
            connections.remove(&connection_id);
        }
        self.local.remove_if(room, |_, connections| connections.is_empty());
        removed
    }

    /// 跨进程成员
    pub async fn members_of(&self, room: &RoomName) -> Result<Vec<UserId>, ApplicationError> {
        self.backend.members(room).await
    }

    pub async fn is_member(&self, room: &RoomName, user_id: UserId) -> Result<bool, ApplicationError> {
        self.backend.contains(room, user_id).await
    }

    /// 删除房间：共享成员集合与本地索引一并清空，返回原有成员
    pub async fn clear_room(&self, room: &RoomName) -> Result<Vec<UserId>, ApplicationError> {
        let members = self.backend.clear_room(room).await?;
        self.forget_local_room(room);
        Ok(members)
    }

    /// 回收失效连接（通常来自已崩溃的进程）在共享存储和本地索引里的全部房间记录，
    /// 返回用户因此离开的房间
    pub async fn purge_connection(
        &self,
        user_id: UserId,
        connection_id: ConnectionId,
    ) -> Result<Vec<RoomName>, ApplicationError> {
        for room in self.rooms_of_connection(connection_id) {
            self.forget_local(connection_id, &room);
        }
        let left = self.backend.remove_connection(user_id, connection_id).await?;
        if !left.is_empty() {
            tracing::info!(
                user_id = %user_id,
                connection_id = %connection_id,
                rooms = left.len(),
                "stale connection removed from rooms"
            );
        }
        Ok(left)
    }

    /// 只清本地索引（其他实例已经删除了共享成员集合）
    pub fn forget_local_room(&self, room: &RoomName) {
        let Some((_, connections)) = self.local.remove(room) else {
            return;
        };
        for connection_id in connections {
            if let Some(mut rooms) = self.by_connection.get_mut(&connection_id) {
                rooms.remove(room);
            }
            self.by_connection
                .remove_if(&connection_id, |_, rooms| rooms.is_empty());
        }
    }

    pub fn is_connection_in(&self, connection_id: ConnectionId, room: &RoomName) -> bool {
        self.by_connection
            .get(&connection_id)
            .map(|rooms| rooms.contains(room))
            .unwrap_or(false)
    }

    /// 本进程中挂在该房间的连接
    pub fn local_connections(&self, room: &RoomName) -> Vec<ConnectionId> {
        self.local
            .get(room)
            .map(|connections| connections.iter().copied().collect())
            .unwrap_or_default()
    }

    pub fn rooms_of_connection(&self, connection_id: ConnectionId) -> Vec<RoomName> {
        self.by_connection
            .get(&connection_id)
            .map(|rooms| rooms.iter().cloned().collect())
            .unwrap_or_default()
    }

    pub fn local_room_count(&self) -> usize {
        self.local.len()
    }
}
