use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Agent档案
///
/// 由外部Agent管理层注册，调度核心只读不写。
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentProfile {
    pub id: String,
    pub capabilities: Vec<String>,
    pub priority: i32,
    pub agent_type: String,
}

impl AgentProfile {
    pub fn new<S: Into<String>>(id: S, agent_type: S) -> Self {
        Self {
            id: id.into(),
            capabilities: Vec::new(),
            priority: 0,
            agent_type: agent_type.into(),
        }
    }

    /// 检查Agent能力是否覆盖任务要求
    pub fn has_capabilities(&self, required: &[String]) -> bool {
        required
            .iter()
            .all(|capability| self.capabilities.contains(capability))
    }
}

/// Agent负载快照
///
/// 由周期性负载上报刷新，仅用于窃取/选择决策，不做持久化。
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentWorkload {
    pub agent_id: String,
    pub task_count: usize,
    pub avg_task_duration_ms: f64,
    pub cpu_usage: Option<f64>,
    pub memory_usage_mb: Option<u64>,
    pub priority: i32,
    pub capabilities: Vec<String>,
    pub updated_at: DateTime<Utc>,
}

impl AgentWorkload {
    pub fn new<S: Into<String>>(agent_id: S, task_count: usize) -> Self {
        Self {
            agent_id: agent_id.into(),
            task_count,
            avg_task_duration_ms: 0.0,
            cpu_usage: None,
            memory_usage_mb: None,
            priority: 0,
            capabilities: Vec::new(),
            updated_at: Utc::now(),
        }
    }

    /// 检查Agent能力是否覆盖任务要求
    pub fn has_capabilities(&self, required: &[String]) -> bool {
        required
            .iter()
            .all(|capability| self.capabilities.contains(capability))
    }

    /// 负载上报是否已过期
    pub fn is_stale(&self, max_age_seconds: i64) -> bool {
        (Utc::now() - self.updated_at).num_seconds() > max_age_seconds
    }
}
