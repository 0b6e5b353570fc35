use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// 资源等待请求
///
/// 等待队列中单个请求的对外快照，按（优先级降序，到达时间升序）排队。
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResourceRequest {
    pub agent_id: String,
    pub priority: i32,
    pub requested_at: DateTime<Utc>,
}

/// 资源分配状态快照
///
/// 不变量：任意时刻至多一个持有者；等待队列中每个Agent至多一个条目。
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResourceStatus {
    pub resource_id: String,
    pub holder: Option<String>,
    pub waiting: Vec<ResourceRequest>,
}

impl ResourceStatus {
    pub fn is_free(&self) -> bool {
        self.holder.is_none()
    }

    pub fn is_contended(&self) -> bool {
        !self.waiting.is_empty()
    }
}
