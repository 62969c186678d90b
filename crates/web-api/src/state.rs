use std::sync::Arc;

use application::RealtimeHub;

#[derive(Clone)]
pub struct AppState {
    pub hub: Arc<RealtimeHub>,
    /// 内部发布接口的共享密钥；为空时接口拒绝所有请求
    pub internal_token: Option<Arc<str>>,
}

impl AppState {
    pub fn new(hub: Arc<RealtimeHub>, internal_token: Option<String>) -> Self {
        Self {
            hub,
            internal_token: internal_token.map(Arc::from),
        }
    }
}
