//! 应用层实现。
//!
//! 实时枢纽的核心：在线状态、房间注册表、输入提示、限流、事件广播、
//! 观影派对协调，以及把它们串起来的连接网关 [`RealtimeHub`]。
//! 跨进程状态通过 [`PresenceBackend`]、[`MembershipBackend`]、[`RateLimitStore`]
//! 与 [`EventBus`] 抽象，本 crate 自带内存实现，Redis 实现位于基础设施层。

pub mod broadcaster;
pub mod bus;
pub mod collaborators;
pub mod error;
pub mod gateway;
pub mod presence;
pub mod rate_limiter;
pub mod rooms;
pub mod scheduler;
pub mod typing;
pub mod watch_party;

pub use broadcaster::{ConnectionDirectory, EventBroadcaster, Outbound};
pub use bus::{BusFrame, EventBus, MemoryEventBus};
pub use collaborators::{
    EventPersister, NotificationQueue, ParticipantStatus, RoomAccessChecker, SessionLookup,
    WatchPartyDirectory,
};
pub use error::{ApplicationError, AuthError, BroadcastError};
pub use gateway::{
    Connection, ConnectionSession, DispatchOutcome, HubDependencies, HubSettings, RealtimeHub,
    CLOSE_GOING_AWAY, CLOSE_POLICY_VIOLATION,
};
pub use presence::{
    memory::MemoryPresenceBackend, PresenceBackend, PresenceStore, PresenceTransition,
    PrunedConnections, SweepReport,
};
pub use rate_limiter::{memory::MemoryRateLimitStore, Admission, RateLimitStore, RateLimiter};
pub use rooms::{memory::MemoryMembershipBackend, Membership, MembershipBackend, RoomRegistry};
pub use scheduler::{Expired, ExpiryScheduler};
pub use typing::TypingManager;
pub use watch_party::{JoinOutcome, WatchPartyCoordinator};
