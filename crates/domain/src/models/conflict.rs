use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// 资源冲突
///
/// 同一时间窗口内两个及以上Agent争用同一资源时登记，
/// 裁决完成后保留一个窗口期用于审计，随后由维护任务清理。
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResourceConflict {
    pub id: String,
    pub resource_id: String,
    pub agents: Vec<String>,
    pub detected_at: DateTime<Utc>,
    pub resolved: bool,
    pub resolution: Option<ConflictResolution>,
}

impl ResourceConflict {
    pub fn new(resource_id: String, agents: Vec<String>) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            resource_id,
            agents,
            detected_at: Utc::now(),
            resolved: false,
            resolution: None,
        }
    }
}

/// 任务冲突种类
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum TaskConflictKind {
    /// 多个Agent同时认领同一任务
    #[serde(rename = "DUPLICATE_CLAIM")]
    DuplicateClaim,
    /// 对任务结果/元数据的并发写入
    #[serde(rename = "CONCURRENT_UPDATE")]
    ConcurrentUpdate,
}

/// 任务冲突
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskConflict {
    pub id: String,
    pub task_id: String,
    pub agents: Vec<String>,
    pub kind: TaskConflictKind,
    pub detected_at: DateTime<Utc>,
    pub resolved: bool,
    pub resolution: Option<ConflictResolution>,
}

impl TaskConflict {
    pub fn new(task_id: String, agents: Vec<String>, kind: TaskConflictKind) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            task_id,
            agents,
            kind,
            detected_at: Utc::now(),
            resolved: false,
            resolution: None,
        }
    }
}

/// 冲突裁决记录
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConflictResolution {
    pub winner: String,
    pub losers: Vec<String>,
    pub strategy: String,
    pub reason: String,
    pub resolved_at: DateTime<Utc>,
}

/// 冲突裁决上下文
///
/// 由调用方提供的裁决输入：各Agent的优先级、请求时间与投票。
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ConflictContext {
    pub agent_priorities: HashMap<String, i32>,
    pub request_timestamps: HashMap<String, DateTime<Utc>>,
    /// 投票人 -> 所投Agent
    pub votes: HashMap<String, String>,
}

impl ConflictContext {
    pub fn with_priorities(priorities: HashMap<String, i32>) -> Self {
        Self {
            agent_priorities: priorities,
            ..Default::default()
        }
    }
}
