use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// 任务定义
///
/// 表示由Agent执行的一个工作单元，由调度器负责其完整的生命周期管理。
///
/// # 字段说明
///
/// - `id`: 任务的唯一标识符
/// - `task_type`: 任务类型，如 "code-review"、"terminal" 等
/// - `description`: 任务的人类可读描述
/// - `priority`: 任务优先级，数值越大越紧急
/// - `dependencies`: 依赖的任务 ID 列表，全部完成后任务才可执行
/// - `required_capabilities`: 执行该任务所需的Agent能力
/// - `parameters`: 任务执行所需的参数，JSON 格式
/// - `timeout_seconds`: 单任务超时时间（秒），缺省使用全局配置
/// - `status`: 任务调度状态
/// - `assigned_agent`: 被指派执行的Agent
/// - `progress`: 执行进度（0-100），由Agent上报
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Task {
    pub id: String,
    pub task_type: String,
    pub description: String,
    pub priority: i32,
    pub dependencies: Vec<String>,
    pub required_capabilities: Vec<String>,
    pub parameters: serde_json::Value,
    pub timeout_seconds: Option<i64>,
    pub status: TaskStatus,
    pub assigned_agent: Option<String>,
    pub progress: u8,
    pub error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
}

/// 任务状态
///
/// 状态机: Pending -> Ready -> Running -> {Completed | Failed | Cancelled}
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum TaskStatus {
    #[serde(rename = "PENDING")]
    Pending,
    #[serde(rename = "READY")]
    Ready,
    #[serde(rename = "RUNNING")]
    Running,
    #[serde(rename = "COMPLETED")]
    Completed,
    #[serde(rename = "FAILED")]
    Failed,
    #[serde(rename = "CANCELLED")]
    Cancelled,
}

impl TaskStatus {
    /// 终态任务不再参与调度
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            TaskStatus::Completed | TaskStatus::Failed | TaskStatus::Cancelled
        )
    }
}

impl Task {
    /// 创建新任务
    pub fn new<S: Into<String>>(id: S, task_type: S, description: S) -> Self {
        Self {
            id: id.into(),
            task_type: task_type.into(),
            description: description.into(),
            priority: 0,
            dependencies: Vec::new(),
            required_capabilities: Vec::new(),
            parameters: serde_json::Value::Null,
            timeout_seconds: None,
            status: TaskStatus::Pending,
            assigned_agent: None,
            progress: 0,
            error: None,
            created_at: Utc::now(),
            completed_at: None,
        }
    }

    /// 检查任务是否有依赖
    pub fn has_dependencies(&self) -> bool {
        !self.dependencies.is_empty()
    }

    /// 检查任务是否处于终态
    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }

    /// 任务尚未上报任何执行进度
    pub fn is_unstarted(&self) -> bool {
        self.progress == 0 && !matches!(self.status, TaskStatus::Completed)
    }
}

/// 已调度任务
///
/// 在调度器内部包装 [`Task`]，记录指派、重试与超时信息。
/// 在任务被指派时创建，重试时更新，进入终态后由维护任务按保留窗口清理。
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScheduledTask {
    pub task: Task,
    pub agent_id: String,
    pub attempts: u32,
    pub last_attempt: Option<DateTime<Utc>>,
    pub next_retry_at: Option<DateTime<Utc>>,
    pub result: Option<serde_json::Value>,
}

impl ScheduledTask {
    pub fn new(task: Task, agent_id: String) -> Self {
        Self {
            task,
            agent_id,
            attempts: 0,
            last_attempt: None,
            next_retry_at: None,
            result: None,
        }
    }

    /// 任务是否正在等待重试窗口
    pub fn is_awaiting_retry(&self, now: DateTime<Utc>) -> bool {
        self.next_retry_at.map(|at| at > now).unwrap_or(false)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_task_status_terminal() {
        assert!(TaskStatus::Completed.is_terminal());
        assert!(TaskStatus::Failed.is_terminal());
        assert!(TaskStatus::Cancelled.is_terminal());
        assert!(!TaskStatus::Pending.is_terminal());
        assert!(!TaskStatus::Ready.is_terminal());
        assert!(!TaskStatus::Running.is_terminal());
    }

    #[test]
    fn test_new_task_defaults() {
        let task = Task::new("task-1", "code-review", "审查PR");
        assert_eq!(task.status, TaskStatus::Pending);
        assert_eq!(task.progress, 0);
        assert!(!task.has_dependencies());
        assert!(task.is_unstarted());
        assert!(task.assigned_agent.is_none());
    }

    #[test]
    fn test_scheduled_task_retry_window() {
        let task = Task::new("task-1", "shell", "执行脚本");
        let mut scheduled = ScheduledTask::new(task, "agent-1".to_string());
        let now = Utc::now();

        assert!(!scheduled.is_awaiting_retry(now));

        scheduled.next_retry_at = Some(now + chrono::Duration::seconds(30));
        assert!(scheduled.is_awaiting_retry(now));

        scheduled.next_retry_at = Some(now - chrono::Duration::seconds(30));
        assert!(!scheduled.is_awaiting_retry(now));
    }
}
