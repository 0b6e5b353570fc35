use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use tokio::sync::{Mutex, RwLock};
use tracing::{debug, info};

use coordinator_core::circuit_breaker::CircuitBreakerManager;
use coordinator_core::config::RetryConfig;
use coordinator_core::traits::{SchedulerMetrics, TaskSchedulerService};
use coordinator_domain::models::{AgentProfile, ScheduledTask, Task, TaskStatus};
use coordinator_domain::ports::EventBus;
use coordinator_errors::{CoordinationError, CoordinationResult};

use crate::strategies::{
    AffinityStrategy, CapabilityStrategy, LeastLoadedStrategy, RoundRobinStrategy,
    SchedulingContext, SchedulingStrategy, TaskTypeStats,
};
use crate::task_scheduler::TaskScheduler;
use crate::work_stealing::WorkStealingCoordinator;

/// 高级任务调度器
///
/// 在基础调度器之上叠加：按名字注册、运行时可切换的Agent选择
/// 策略；按任务类型累积的执行统计（驱动亲和策略与指标）；
/// 工作窃取协调器与按工具名的熔断器。
pub struct AdvancedTaskScheduler {
    base: TaskScheduler,
    strategies: RwLock<HashMap<String, Arc<dyn SchedulingStrategy>>>,
    default_strategy: RwLock<String>,
    work_stealing: Arc<WorkStealingCoordinator>,
    circuit_breakers: Arc<CircuitBreakerManager>,
    task_stats: Mutex<HashMap<String, TaskTypeStats>>,
}

impl AdvancedTaskScheduler {
    pub fn new(
        retry_config: RetryConfig,
        task_retention_ms: u64,
        event_bus: Arc<dyn EventBus>,
        work_stealing: Arc<WorkStealingCoordinator>,
        circuit_breakers: Arc<CircuitBreakerManager>,
    ) -> Self {
        let mut strategies: HashMap<String, Arc<dyn SchedulingStrategy>> = HashMap::new();
        strategies.insert(
            "capability".to_string(),
            Arc::new(CapabilityStrategy::new()) as Arc<dyn SchedulingStrategy>,
        );
        strategies.insert("round-robin".to_string(), Arc::new(RoundRobinStrategy::new()));
        strategies.insert("least-loaded".to_string(), Arc::new(LeastLoadedStrategy::new()));
        strategies.insert("affinity".to_string(), Arc::new(AffinityStrategy::new()));

        Self {
            base: TaskScheduler::new(retry_config, task_retention_ms, event_bus),
            strategies: RwLock::new(strategies),
            default_strategy: RwLock::new("capability".to_string()),
            work_stealing,
            circuit_breakers,
            task_stats: Mutex::new(HashMap::new()),
        }
    }

    /// 注册自定义策略（同名覆盖）
    pub async fn register_strategy(&self, strategy: Arc<dyn SchedulingStrategy>) {
        let name = strategy.name().to_string();
        let mut strategies = self.strategies.write().await;
        info!(strategy = %name, "注册调度策略");
        strategies.insert(name, strategy);
    }

    /// 切换缺省策略；未注册的名字报配置错误
    pub async fn set_default_strategy(&self, name: &str) -> CoordinationResult<()> {
        let strategies = self.strategies.read().await;
        if !strategies.contains_key(name) {
            return Err(CoordinationError::config_error(format!(
                "未注册的调度策略: {name}"
            )));
        }
        drop(strategies);
        let mut default = self.default_strategy.write().await;
        info!(strategy = name, "切换缺省调度策略");
        *default = name.to_string();
        Ok(())
    }

    pub async fn default_strategy_name(&self) -> String {
        self.default_strategy.read().await.clone()
    }

    /// 按任务类型的执行统计快照
    pub async fn task_stats(&self) -> HashMap<String, TaskTypeStats> {
        self.task_stats.lock().await.clone()
    }

    pub fn work_stealing(&self) -> &Arc<WorkStealingCoordinator> {
        &self.work_stealing
    }

    pub fn circuit_breakers(&self) -> &Arc<CircuitBreakerManager> {
        &self.circuit_breakers
    }

    /// 经按名熔断器保护地执行一次工具/下游调用
    pub async fn execute_protected<F, Fut, T>(
        &self,
        tool_name: &str,
        operation: F,
    ) -> CoordinationResult<T>
    where
        F: FnOnce() -> Fut,
        Fut: std::future::Future<Output = CoordinationResult<T>>,
    {
        self.circuit_breakers.execute(tool_name, operation).await
    }

    /// 用指定策略挑选Agent并指派
    pub async fn schedule_with_strategy(
        &self,
        task: Task,
        candidates: &[AgentProfile],
        strategy_name: &str,
    ) -> CoordinationResult<String> {
        let strategy = {
            let strategies = self.strategies.read().await;
            strategies.get(strategy_name).cloned()
        }
        .ok_or_else(|| {
            CoordinationError::config_error(format!("未注册的调度策略: {strategy_name}"))
        })?;

        let context = self.build_context().await;
        let selected = strategy.select_agent(&task, candidates, &context).await?;
        let agent_id = selected.ok_or_else(|| CoordinationError::NoEligibleAgent {
            task_id: task.id.clone(),
        })?;
        debug!(
            task_id = %task.id,
            agent_id = %agent_id,
            strategy = strategy_name,
            "策略选择Agent完成"
        );
        self.base.assign_task(task, &agent_id).await?;
        Ok(agent_id)
    }

    async fn build_context(&self) -> SchedulingContext {
        let metrics = self.base.metrics().await;
        let task_stats = self.task_stats.lock().await.clone();
        SchedulingContext {
            agent_task_counts: metrics.agent_task_counts,
            task_stats,
        }
    }

    async fn record_completion(&self, scheduled: &ScheduledTask) {
        let duration_ms = scheduled
            .last_attempt
            .map(|started| (Utc::now() - started).num_milliseconds().max(0) as u64)
            .unwrap_or(0);
        let mut stats = self.task_stats.lock().await;
        let entry = stats
            .entry(scheduled.task.task_type.clone())
            .or_default();
        entry.executions += 1;
        entry.successes += 1;
        entry.total_duration_ms += duration_ms;
        entry.last_agent = Some(scheduled.agent_id.clone());
    }

    async fn record_failure(&self, task_type: &str) {
        let mut stats = self.task_stats.lock().await;
        let entry = stats.entry(task_type.to_string()).or_default();
        entry.executions += 1;
        entry.failures += 1;
    }
}

#[async_trait]
impl TaskSchedulerService for AdvancedTaskScheduler {
    async fn assign_task(&self, task: Task, agent_id: &str) -> CoordinationResult<()> {
        self.base.assign_task(task, agent_id).await
    }

    async fn schedule(
        &self,
        task: Task,
        candidates: &[AgentProfile],
    ) -> CoordinationResult<String> {
        let strategy_name = self.default_strategy_name().await;
        self.schedule_with_strategy(task, candidates, &strategy_name)
            .await
    }

    async fn complete_task(
        &self,
        task_id: &str,
        result: Option<serde_json::Value>,
    ) -> CoordinationResult<()> {
        // 统计在终态化之前采样，拿到运行时长与执行Agent
        let snapshot = self.base.get_task(task_id).await;
        let newly_terminal = snapshot
            .as_ref()
            .map(|s| !s.task.is_terminal())
            .unwrap_or(false);
        self.base.complete_task(task_id, result).await?;
        if newly_terminal {
            if let Some(scheduled) = snapshot {
                self.record_completion(&scheduled).await;
            }
        }
        Ok(())
    }

    async fn fail_task(&self, task_id: &str, error: CoordinationError) -> CoordinationResult<()> {
        let before = self.base.get_task(task_id).await;
        self.base.fail_task(task_id, error).await?;
        let after = self.base.get_task(task_id).await;
        // 只有真正进入终态失败才计入统计；重试中的失败不计
        let became_failed = matches!(
            (&before, &after),
            (Some(b), Some(a))
                if !b.task.is_terminal() && a.task.status == TaskStatus::Failed
        );
        if became_failed {
            if let Some(scheduled) = after {
                self.record_failure(&scheduled.task.task_type).await;
            }
        }
        Ok(())
    }

    async fn cancel_task(&self, task_id: &str, reason: &str) -> CoordinationResult<()> {
        self.base.cancel_task(task_id, reason).await
    }

    async fn cancel_agent_tasks(&self, agent_id: &str) -> CoordinationResult<usize> {
        self.base.cancel_agent_tasks(agent_id).await
    }

    async fn reschedule_agent_tasks(
        &self,
        agent_id: &str,
        candidates: &[AgentProfile],
    ) -> CoordinationResult<Vec<(String, String)>> {
        self.base.reschedule_agent_tasks(agent_id, candidates).await
    }

    async fn transfer_unstarted_tasks(
        &self,
        from: &str,
        recipient: &AgentProfile,
        max_tasks: usize,
    ) -> CoordinationResult<Vec<String>> {
        self.base
            .transfer_unstarted_tasks(from, recipient, max_tasks)
            .await
    }

    async fn update_progress(&self, task_id: &str, progress: u8) -> CoordinationResult<()> {
        self.base.update_progress(task_id, progress).await
    }

    async fn get_task(&self, task_id: &str) -> Option<ScheduledTask> {
        self.base.get_task(task_id).await
    }

    async fn get_agent_tasks(&self, agent_id: &str) -> Vec<ScheduledTask> {
        self.base.get_agent_tasks(agent_id).await
    }

    async fn metrics(&self) -> SchedulerMetrics {
        self.base.metrics().await
    }

    async fn perform_maintenance(&self) -> CoordinationResult<()> {
        self.base.perform_maintenance().await
    }
}
