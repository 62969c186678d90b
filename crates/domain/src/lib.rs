//! 实时枢纽领域模型
//!
//! 房间命名、事件信封与默认路由表、线协议消息、在线状态、观影派对状态机。
//! 这里只有纯数据与校验，不涉及任何 I/O。

pub mod envelope;
pub mod errors;
pub mod presence;
pub mod session;
pub mod value_objects;
pub mod watch_party;
pub mod wire;

// 重新导出常用类型
pub use envelope::*;
pub use errors::*;
pub use presence::*;
pub use session::*;
pub use value_objects::*;
pub use watch_party::*;
pub use wire::*;
