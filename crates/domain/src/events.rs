//! 协调事件
//!
//! 跨组件通知统一走事件总线，事件名即 `event_type()` 返回的字符串

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// 协调核心对外发布的事件
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum CoordinationEvent {
    TaskAssigned {
        task_id: String,
        agent_id: String,
        occurred_at: DateTime<Utc>,
    },
    TaskCompleted {
        task_id: String,
        agent_id: String,
        duration_ms: Option<u64>,
        occurred_at: DateTime<Utc>,
    },
    TaskFailed {
        task_id: String,
        agent_id: String,
        error: String,
        attempts: u32,
        occurred_at: DateTime<Utc>,
    },
    TaskCancelled {
        task_id: String,
        reason: String,
        occurred_at: DateTime<Utc>,
    },
    TaskRetried {
        task_id: String,
        agent_id: String,
        attempt: u32,
        occurred_at: DateTime<Utc>,
    },
    ResourceAcquired {
        resource_id: String,
        agent_id: String,
        occurred_at: DateTime<Utc>,
    },
    ResourceReleased {
        resource_id: String,
        agent_id: String,
        occurred_at: DateTime<Utc>,
    },
    ConflictDetected {
        conflict_id: String,
        subject_id: String,
        agents: Vec<String>,
        occurred_at: DateTime<Utc>,
    },
    ConflictResolved {
        conflict_id: String,
        winner: String,
        strategy: String,
        occurred_at: DateTime<Utc>,
    },
    DeadlockDetected {
        agents: Vec<String>,
        resources: Vec<String>,
        occurred_at: DateTime<Utc>,
    },
    WorkloadRebalanced {
        from_agent: String,
        to_agent: String,
        task_count: usize,
        occurred_at: DateTime<Utc>,
    },
    CircuitOpened {
        name: String,
        occurred_at: DateTime<Utc>,
    },
    CircuitClosed {
        name: String,
        occurred_at: DateTime<Utc>,
    },
}

impl CoordinationEvent {
    pub fn event_type(&self) -> &'static str {
        match self {
            CoordinationEvent::TaskAssigned { .. } => "task:assigned",
            CoordinationEvent::TaskCompleted { .. } => "task:completed",
            CoordinationEvent::TaskFailed { .. } => "task:failed",
            CoordinationEvent::TaskCancelled { .. } => "task:cancelled",
            CoordinationEvent::TaskRetried { .. } => "task:retried",
            CoordinationEvent::ResourceAcquired { .. } => "resource:acquired",
            CoordinationEvent::ResourceReleased { .. } => "resource:released",
            CoordinationEvent::ConflictDetected { .. } => "conflict:detected",
            CoordinationEvent::ConflictResolved { .. } => "conflict:resolved",
            CoordinationEvent::DeadlockDetected { .. } => "deadlock:detected",
            CoordinationEvent::WorkloadRebalanced { .. } => "workload:rebalanced",
            CoordinationEvent::CircuitOpened { .. } => "circuit:opened",
            CoordinationEvent::CircuitClosed { .. } => "circuit:closed",
        }
    }

    pub fn occurred_at(&self) -> DateTime<Utc> {
        match self {
            CoordinationEvent::TaskAssigned { occurred_at, .. }
            | CoordinationEvent::TaskCompleted { occurred_at, .. }
            | CoordinationEvent::TaskFailed { occurred_at, .. }
            | CoordinationEvent::TaskCancelled { occurred_at, .. }
            | CoordinationEvent::TaskRetried { occurred_at, .. }
            | CoordinationEvent::ResourceAcquired { occurred_at, .. }
            | CoordinationEvent::ResourceReleased { occurred_at, .. }
            | CoordinationEvent::ConflictDetected { occurred_at, .. }
            | CoordinationEvent::ConflictResolved { occurred_at, .. }
            | CoordinationEvent::DeadlockDetected { occurred_at, .. }
            | CoordinationEvent::WorkloadRebalanced { occurred_at, .. }
            | CoordinationEvent::CircuitOpened { occurred_at, .. }
            | CoordinationEvent::CircuitClosed { occurred_at, .. } => *occurred_at,
        }
    }
}
