use std::collections::HashMap;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use coordinator_domain::models::{AgentProfile, ScheduledTask, Task};
use coordinator_errors::{CoordinationError, CoordinationResult};

/// 调度器统计快照
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SchedulerMetrics {
    pub total_tasks: usize,
    pub pending_tasks: usize,
    pub ready_tasks: usize,
    pub running_tasks: usize,
    pub completed_tasks: usize,
    pub failed_tasks: usize,
    pub cancelled_tasks: usize,
    /// 各Agent当前持有的非终态任务数
    pub agent_task_counts: HashMap<String, usize>,
    /// 已完成任务的平均执行时长（毫秒）
    pub avg_completion_ms: f64,
}

/// 任务调度服务
///
/// 基础实现与高级实现（策略化Agent选择）都实现该接口，
/// 协调管理器据此在运行时切换。
#[async_trait]
pub trait TaskSchedulerService: Send + Sync {
    /// 将任务指派给指定Agent；依赖未满足时任务保持pending，
    /// 依赖满足后自动进入running
    async fn assign_task(&self, task: Task, agent_id: &str) -> CoordinationResult<()>;

    /// 从候选Agent中选择一个并指派任务，返回被选中的Agent
    async fn schedule(
        &self,
        task: Task,
        candidates: &[AgentProfile],
    ) -> CoordinationResult<String>;

    /// 标记任务完成并解锁其依赖者；对已完成任务重复调用是空操作
    async fn complete_task(
        &self,
        task_id: &str,
        result: Option<serde_json::Value>,
    ) -> CoordinationResult<()>;

    /// 上报任务失败；可重试错误按退避重新排队，否则终态失败并
    /// 级联取消依赖者。熔断拒绝不消耗重试次数
    async fn fail_task(&self, task_id: &str, error: CoordinationError) -> CoordinationResult<()>;

    /// 取消任务并级联取消其依赖者
    async fn cancel_task(&self, task_id: &str, reason: &str) -> CoordinationResult<()>;

    /// 取消某Agent的全部在途任务（Agent丢失时使用），返回取消数量
    async fn cancel_agent_tasks(&self, agent_id: &str) -> CoordinationResult<usize>;

    /// 将某Agent的在途任务改派给其他合格Agent，不丢失依赖状态；
    /// 返回 (任务ID, 新Agent) 列表
    async fn reschedule_agent_tasks(
        &self,
        agent_id: &str,
        candidates: &[AgentProfile],
    ) -> CoordinationResult<Vec<(String, String)>>;

    /// 将最多 `max_tasks` 个未开始的任务从 `from` 迁移到 `recipient`，
    /// 返回被迁移的任务ID（工作窃取的落地动作）
    async fn transfer_unstarted_tasks(
        &self,
        from: &str,
        recipient: &AgentProfile,
        max_tasks: usize,
    ) -> CoordinationResult<Vec<String>>;

    /// 更新任务执行进度（0-100）
    async fn update_progress(&self, task_id: &str, progress: u8) -> CoordinationResult<()>;

    async fn get_task(&self, task_id: &str) -> Option<ScheduledTask>;

    async fn get_agent_tasks(&self, agent_id: &str) -> Vec<ScheduledTask>;

    async fn metrics(&self) -> SchedulerMetrics;

    /// 清理过期的终态任务记录等
    async fn perform_maintenance(&self) -> CoordinationResult<()>;
}
