use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use coordinator_core::config::RetryConfig;
use coordinator_core::traits::{SchedulerMetrics, TaskSchedulerService};
use coordinator_domain::events::CoordinationEvent;
use coordinator_domain::models::{AgentProfile, ScheduledTask, Task, TaskStatus};
use coordinator_domain::ports::EventBus;
use coordinator_errors::{CoordinationError, CoordinationResult};

use crate::dependency_graph::DependencyGraph;

struct SchedulerState {
    tasks: HashMap<String, ScheduledTask>,
    graph: DependencyGraph,
    /// Agent -> 运行中的任务集合（pending任务不计入）
    agent_tasks: HashMap<String, HashSet<String>>,
    completed_count: u64,
    total_completion_ms: u64,
}

impl SchedulerState {
    fn new() -> Self {
        Self {
            tasks: HashMap::new(),
            graph: DependencyGraph::new(),
            agent_tasks: HashMap::new(),
            completed_count: 0,
            total_completion_ms: 0,
        }
    }

    /// Agent当前的非终态任务数（含pending）
    fn agent_load(&self, agent_id: &str) -> usize {
        self.tasks
            .values()
            .filter(|s| !s.task.is_terminal() && s.agent_id == agent_id)
            .count()
    }

    /// 把一个就绪任务转入running并挂到Agent任务集
    fn start_task(&mut self, task_id: &str, events: &mut Vec<CoordinationEvent>) {
        let Some(scheduled) = self.tasks.get_mut(task_id) else {
            return;
        };
        if !matches!(
            scheduled.task.status,
            TaskStatus::Pending | TaskStatus::Ready
        ) {
            return;
        }
        scheduled.task.status = TaskStatus::Running;
        scheduled.last_attempt = Some(Utc::now());
        scheduled.next_retry_at = None;
        self.agent_tasks
            .entry(scheduled.agent_id.clone())
            .or_default()
            .insert(task_id.to_string());
        events.push(CoordinationEvent::TaskAssigned {
            task_id: task_id.to_string(),
            agent_id: scheduled.agent_id.clone(),
            occurred_at: Utc::now(),
        });
    }

    /// 终态化一个任务并级联取消其依赖者
    fn cancel_cascade(
        &mut self,
        task_id: &str,
        reason: &str,
        events: &mut Vec<CoordinationEvent>,
    ) {
        let cascade = self.graph.mark_failed(task_id);
        for dependent_id in cascade {
            if let Some(dependent) = self.tasks.get_mut(&dependent_id) {
                if dependent.task.is_terminal() {
                    continue;
                }
                dependent.task.status = TaskStatus::Cancelled;
                dependent.task.error = Some(reason.to_string());
                dependent.task.completed_at = Some(Utc::now());
                if let Some(set) = self.agent_tasks.get_mut(&dependent.agent_id) {
                    set.remove(&dependent_id);
                }
                events.push(CoordinationEvent::TaskCancelled {
                    task_id: dependent_id.clone(),
                    reason: reason.to_string(),
                    occurred_at: Utc::now(),
                });
            }
        }
    }
}

/// 任务调度器
///
/// 按 pending -> ready -> running -> {completed | failed | cancelled}
/// 状态机管理任务生命周期。全部状态变更串行经过同一把锁，
/// 保证依赖因果序：依赖者绝不先于其全部依赖完成之前进入running。
pub struct TaskScheduler {
    state: Arc<Mutex<SchedulerState>>,
    event_bus: Arc<dyn EventBus>,
    retry_config: RetryConfig,
    task_retention: chrono::Duration,
}

impl TaskScheduler {
    pub fn new(
        retry_config: RetryConfig,
        task_retention_ms: u64,
        event_bus: Arc<dyn EventBus>,
    ) -> Self {
        Self {
            state: Arc::new(Mutex::new(SchedulerState::new())),
            event_bus,
            retry_config,
            task_retention: chrono::Duration::milliseconds(task_retention_ms as i64),
        }
    }

    async fn publish_all(&self, events: Vec<CoordinationEvent>) {
        for event in events {
            if let Err(e) = self.event_bus.publish(event).await {
                warn!("调度事件发布失败: {}", e);
            }
        }
    }

    /// 指数退避加抖动，避免重试雷群
    fn retry_delay(&self, attempts: u32) -> Duration {
        let base = self.retry_config.retry_delay_ms as f64;
        let exponential = base * 2f64.powi(attempts.saturating_sub(1) as i32);
        let capped = exponential.min(self.retry_config.max_retry_delay_ms as f64);
        let jitter = capped * self.retry_config.jitter_factor * (rand::random::<f64>() - 0.5) * 2.0;
        Duration::from_millis((capped + jitter).max(base) as u64)
    }

    /// 重试窗口到期后把任务重新投入运行
    fn spawn_retry_dispatch(&self, task_id: String, delay: Duration) {
        let state = self.state.clone();
        let event_bus = self.event_bus.clone();
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            let mut events = Vec::new();
            {
                let mut state = state.lock().await;
                let ready = state
                    .tasks
                    .get(&task_id)
                    .map(|s| {
                        s.task.status == TaskStatus::Ready && state.graph.is_task_ready(&task_id)
                    })
                    .unwrap_or(false);
                if ready {
                    state.start_task(&task_id, &mut events);
                } else {
                    debug!(task_id, "重试窗口到期时任务已不可运行，跳过重派");
                }
            }
            for event in events {
                let _ = event_bus.publish(event).await;
            }
        });
    }

    /// 从候选中挑一个合格且负载最低的Agent，按ID字典序决胜
    fn pick_least_loaded<'a>(
        state: &SchedulerState,
        task: &Task,
        candidates: &'a [AgentProfile],
        exclude: Option<&str>,
    ) -> Option<&'a AgentProfile> {
        candidates
            .iter()
            .filter(|profile| Some(profile.id.as_str()) != exclude)
            .filter(|profile| profile.has_capabilities(&task.required_capabilities))
            .min_by(|a, b| {
                state
                    .agent_load(&a.id)
                    .cmp(&state.agent_load(&b.id))
                    .then_with(|| a.id.cmp(&b.id))
            })
    }
}

#[async_trait]
impl TaskSchedulerService for TaskScheduler {
    async fn assign_task(&self, task: Task, agent_id: &str) -> CoordinationResult<()> {
        let task_id = task.id.clone();
        let mut events = Vec::new();
        {
            let mut state = self.state.lock().await;
            if state.tasks.contains_key(&task_id) {
                return Err(CoordinationError::TaskAlreadyScheduled { id: task_id });
            }

            // 依赖已失败的任务永远无法就绪，直接拒绝
            if task
                .dependencies
                .iter()
                .any(|dep| state.graph.is_failed(dep))
            {
                return Err(CoordinationError::dependency(
                    task_id.clone(),
                    "依赖任务已失败",
                ));
            }

            state.graph.add_task(&task);
            let cycles = state.graph.detect_cycles();
            if cycles.iter().any(|cycle| cycle.contains(&task_id)) {
                state.graph.remove_task(&task_id);
                return Err(CoordinationError::dependency(
                    task_id.clone(),
                    "依赖形成环",
                ));
            }

            let mut scheduled = ScheduledTask::new(task, agent_id.to_string());
            scheduled.task.assigned_agent = Some(agent_id.to_string());
            let ready = state.graph.is_task_ready(&task_id);
            if !ready {
                debug!(task_id, agent_id, "任务依赖未满足，保持pending");
                scheduled.task.status = TaskStatus::Pending;
            }
            state.tasks.insert(task_id.clone(), scheduled);
            if ready {
                state.start_task(&task_id, &mut events);
            }
        }
        self.publish_all(events).await;
        Ok(())
    }

    async fn schedule(
        &self,
        task: Task,
        candidates: &[AgentProfile],
    ) -> CoordinationResult<String> {
        let chosen = {
            let state = self.state.lock().await;
            Self::pick_least_loaded(&state, &task, candidates, None)
                .map(|profile| profile.id.clone())
        };
        let agent_id = chosen.ok_or_else(|| CoordinationError::NoEligibleAgent {
            task_id: task.id.clone(),
        })?;
        self.assign_task(task, &agent_id).await?;
        Ok(agent_id)
    }

    async fn complete_task(
        &self,
        task_id: &str,
        result: Option<serde_json::Value>,
    ) -> CoordinationResult<()> {
        let mut events = Vec::new();
        {
            let mut state = self.state.lock().await;
            let Some(scheduled) = state.tasks.get_mut(task_id) else {
                return Err(CoordinationError::task_not_found(task_id));
            };
            if scheduled.task.is_terminal() {
                debug!(task_id, "任务已处于终态，忽略重复的完成上报");
                return Ok(());
            }

            let agent_id = scheduled.agent_id.clone();
            let duration_ms = scheduled
                .last_attempt
                .map(|started| (Utc::now() - started).num_milliseconds().max(0) as u64);
            scheduled.task.status = TaskStatus::Completed;
            scheduled.task.progress = 100;
            scheduled.task.completed_at = Some(Utc::now());
            scheduled.result = result;
            if let Some(ms) = duration_ms {
                state.completed_count += 1;
                state.total_completion_ms += ms;
            }
            if let Some(set) = state.agent_tasks.get_mut(&agent_id) {
                set.remove(task_id);
            }

            events.push(CoordinationEvent::TaskCompleted {
                task_id: task_id.to_string(),
                agent_id,
                duration_ms,
                occurred_at: Utc::now(),
            });

            // 解锁依赖者
            let newly_ready = state.graph.mark_completed(task_id);
            for ready_id in newly_ready {
                state.start_task(&ready_id, &mut events);
            }
        }
        self.publish_all(events).await;
        Ok(())
    }

    async fn fail_task(&self, task_id: &str, error: CoordinationError) -> CoordinationResult<()> {
        let mut events = Vec::new();
        let mut retry_after: Option<Duration> = None;
        {
            let mut state = self.state.lock().await;
            let Some(scheduled) = state.tasks.get_mut(task_id) else {
                return Err(CoordinationError::task_not_found(task_id));
            };
            if scheduled.task.is_terminal() {
                debug!(task_id, "任务已处于终态，忽略失败上报");
                return Ok(());
            }

            let agent_id = scheduled.agent_id.clone();
            let circuit_rejected = error.is_circuit_rejection();
            if !circuit_rejected {
                scheduled.attempts += 1;
            }
            scheduled.last_attempt = Some(Utc::now());

            let retryable = circuit_rejected || error.is_retryable();
            let attempts_left =
                circuit_rejected || scheduled.attempts < self.retry_config.max_retries;

            if retryable && attempts_left {
                // 熔断拒绝不消耗重试次数，按基础间隔重新排队
                let delay = if circuit_rejected {
                    Duration::from_millis(self.retry_config.retry_delay_ms)
                } else {
                    self.retry_delay(scheduled.attempts)
                };
                let attempt = scheduled.attempts;
                scheduled.task.status = TaskStatus::Ready;
                scheduled.next_retry_at =
                    Some(Utc::now() + chrono::Duration::from_std(delay).unwrap_or_default());
                info!(
                    task_id,
                    attempt,
                    delay_ms = delay.as_millis() as u64,
                    "任务失败，安排重试: {}",
                    error
                );
                if let Some(set) = state.agent_tasks.get_mut(&agent_id) {
                    set.remove(task_id);
                }
                events.push(CoordinationEvent::TaskRetried {
                    task_id: task_id.to_string(),
                    agent_id,
                    attempt,
                    occurred_at: Utc::now(),
                });
                retry_after = Some(delay);
            } else {
                let attempts = scheduled.attempts;
                scheduled.task.status = TaskStatus::Failed;
                scheduled.task.error = Some(error.to_string());
                scheduled.task.completed_at = Some(Utc::now());
                if let Some(set) = state.agent_tasks.get_mut(&agent_id) {
                    set.remove(task_id);
                }
                warn!(task_id, attempts, "任务终态失败: {}", error);
                events.push(CoordinationEvent::TaskFailed {
                    task_id: task_id.to_string(),
                    agent_id,
                    error: error.to_string(),
                    attempts,
                    occurred_at: Utc::now(),
                });
                // 依赖链失败必须级联，绝不静默重试
                state.cancel_cascade(task_id, "依赖任务失败", &mut events);
            }
        }
        if let Some(delay) = retry_after {
            self.spawn_retry_dispatch(task_id.to_string(), delay);
        }
        self.publish_all(events).await;
        Ok(())
    }

    async fn cancel_task(&self, task_id: &str, reason: &str) -> CoordinationResult<()> {
        let mut events = Vec::new();
        {
            let mut state = self.state.lock().await;
            let Some(scheduled) = state.tasks.get_mut(task_id) else {
                return Err(CoordinationError::task_not_found(task_id));
            };
            if scheduled.task.is_terminal() {
                return Ok(());
            }

            let agent_id = scheduled.agent_id.clone();
            scheduled.task.status = TaskStatus::Cancelled;
            scheduled.task.error = Some(reason.to_string());
            scheduled.task.completed_at = Some(Utc::now());
            if let Some(set) = state.agent_tasks.get_mut(&agent_id) {
                set.remove(task_id);
            }
            info!(task_id, reason, "任务已取消");
            events.push(CoordinationEvent::TaskCancelled {
                task_id: task_id.to_string(),
                reason: reason.to_string(),
                occurred_at: Utc::now(),
            });
            state.cancel_cascade(task_id, "上游任务被取消", &mut events);
        }
        self.publish_all(events).await;
        Ok(())
    }

    async fn cancel_agent_tasks(&self, agent_id: &str) -> CoordinationResult<usize> {
        let task_ids: Vec<String> = {
            let state = self.state.lock().await;
            state
                .tasks
                .values()
                .filter(|s| s.agent_id == agent_id && !s.task.is_terminal())
                .map(|s| s.task.id.clone())
                .collect()
        };
        let mut cancelled = 0;
        for task_id in task_ids {
            // 前序取消的级联可能已经终态化了后续任务
            let already_terminal = {
                let state = self.state.lock().await;
                state
                    .tasks
                    .get(&task_id)
                    .map(|s| s.task.is_terminal())
                    .unwrap_or(true)
            };
            if already_terminal {
                continue;
            }
            self.cancel_task(&task_id, "Agent已丢失").await?;
            cancelled += 1;
        }
        if cancelled > 0 {
            info!(agent_id, cancelled, "已取消该Agent的全部在途任务");
        }
        Ok(cancelled)
    }

    async fn reschedule_agent_tasks(
        &self,
        agent_id: &str,
        candidates: &[AgentProfile],
    ) -> CoordinationResult<Vec<(String, String)>> {
        let mut events = Vec::new();
        let mut moved = Vec::new();
        {
            let mut state = self.state.lock().await;
            let task_ids: Vec<String> = state
                .tasks
                .values()
                .filter(|s| s.agent_id == agent_id && !s.task.is_terminal())
                .map(|s| s.task.id.clone())
                .collect();

            for task_id in task_ids {
                let task_snapshot = state.tasks[&task_id].task.clone();
                let Some(new_agent) =
                    Self::pick_least_loaded(&state, &task_snapshot, candidates, Some(agent_id))
                        .map(|p| p.id.clone())
                else {
                    warn!(task_id, "没有可接手的Agent，任务保持原指派");
                    continue;
                };

                let Some(scheduled) = state.tasks.get_mut(&task_id) else {
                    continue;
                };
                let was_running = scheduled.task.status == TaskStatus::Running;
                scheduled.agent_id = new_agent.clone();
                scheduled.task.assigned_agent = Some(new_agent.clone());
                if let Some(set) = state.agent_tasks.get_mut(agent_id) {
                    set.remove(&task_id);
                }
                if was_running {
                    state
                        .agent_tasks
                        .entry(new_agent.clone())
                        .or_default()
                        .insert(task_id.clone());
                    events.push(CoordinationEvent::TaskAssigned {
                        task_id: task_id.clone(),
                        agent_id: new_agent.clone(),
                        occurred_at: Utc::now(),
                    });
                }
                info!(task_id, from = agent_id, to = %new_agent, "任务已改派");
                moved.push((task_id, new_agent));
            }
        }
        self.publish_all(events).await;
        Ok(moved)
    }

    async fn transfer_unstarted_tasks(
        &self,
        from: &str,
        recipient: &AgentProfile,
        max_tasks: usize,
    ) -> CoordinationResult<Vec<String>> {
        let mut events = Vec::new();
        let mut moved = Vec::new();
        {
            let mut state = self.state.lock().await;
            // 优先迁移尚未上报进度的任务，最小化迁移代价
            let mut movable: Vec<(TaskStatus, chrono::DateTime<Utc>, String)> = state
                .tasks
                .values()
                .filter(|s| s.agent_id == from && !s.task.is_terminal())
                .filter(|s| s.task.progress == 0)
                .filter(|s| recipient.has_capabilities(&s.task.required_capabilities))
                .map(|s| (s.task.status, s.task.created_at, s.task.id.clone()))
                .collect();
            movable.sort_by(|a, b| {
                let rank = |status: TaskStatus| match status {
                    TaskStatus::Pending => 0,
                    TaskStatus::Ready => 1,
                    _ => 2,
                };
                rank(a.0).cmp(&rank(b.0)).then_with(|| a.1.cmp(&b.1))
            });

            for (status, _, task_id) in movable.into_iter().take(max_tasks) {
                let Some(scheduled) = state.tasks.get_mut(&task_id) else {
                    continue;
                };
                scheduled.agent_id = recipient.id.clone();
                scheduled.task.assigned_agent = Some(recipient.id.clone());
                if let Some(set) = state.agent_tasks.get_mut(from) {
                    set.remove(&task_id);
                }
                if status == TaskStatus::Running {
                    state
                        .agent_tasks
                        .entry(recipient.id.clone())
                        .or_default()
                        .insert(task_id.clone());
                }
                events.push(CoordinationEvent::TaskAssigned {
                    task_id: task_id.clone(),
                    agent_id: recipient.id.clone(),
                    occurred_at: Utc::now(),
                });
                moved.push(task_id);
            }
        }
        if !moved.is_empty() {
            info!(
                from,
                to = %recipient.id,
                count = moved.len(),
                "工作窃取迁移了未开始的任务"
            );
        }
        self.publish_all(events).await;
        Ok(moved)
    }

    async fn update_progress(&self, task_id: &str, progress: u8) -> CoordinationResult<()> {
        let mut state = self.state.lock().await;
        let Some(scheduled) = state.tasks.get_mut(task_id) else {
            return Err(CoordinationError::task_not_found(task_id));
        };
        if scheduled.task.is_terminal() {
            return Ok(());
        }
        scheduled.task.progress = progress.min(100);
        Ok(())
    }

    async fn get_task(&self, task_id: &str) -> Option<ScheduledTask> {
        let state = self.state.lock().await;
        state.tasks.get(task_id).cloned()
    }

    async fn get_agent_tasks(&self, agent_id: &str) -> Vec<ScheduledTask> {
        let state = self.state.lock().await;
        let mut tasks: Vec<ScheduledTask> = state
            .tasks
            .values()
            .filter(|s| s.agent_id == agent_id && !s.task.is_terminal())
            .cloned()
            .collect();
        tasks.sort_by(|a, b| a.task.id.cmp(&b.task.id));
        tasks
    }

    async fn metrics(&self) -> SchedulerMetrics {
        let state = self.state.lock().await;
        let mut metrics = SchedulerMetrics::default();
        for scheduled in state.tasks.values() {
            metrics.total_tasks += 1;
            match scheduled.task.status {
                TaskStatus::Pending => metrics.pending_tasks += 1,
                TaskStatus::Ready => metrics.ready_tasks += 1,
                TaskStatus::Running => metrics.running_tasks += 1,
                TaskStatus::Completed => metrics.completed_tasks += 1,
                TaskStatus::Failed => metrics.failed_tasks += 1,
                TaskStatus::Cancelled => metrics.cancelled_tasks += 1,
            }
            if !scheduled.task.is_terminal() {
                *metrics
                    .agent_task_counts
                    .entry(scheduled.agent_id.clone())
                    .or_insert(0) += 1;
            }
        }
        if state.completed_count > 0 {
            metrics.avg_completion_ms =
                state.total_completion_ms as f64 / state.completed_count as f64;
        }
        metrics
    }

    async fn perform_maintenance(&self) -> CoordinationResult<()> {
        let mut state = self.state.lock().await;
        let cutoff = Utc::now() - self.task_retention;
        let expired: Vec<String> = state
            .tasks
            .values()
            .filter(|s| s.task.is_terminal())
            .filter(|s| s.task.completed_at.map(|at| at < cutoff).unwrap_or(true))
            .map(|s| s.task.id.clone())
            .collect();
        for task_id in &expired {
            state.tasks.remove(task_id);
            state.graph.remove_task(task_id);
        }
        if !expired.is_empty() {
            debug!(count = expired.len(), "清理过期的终态任务记录");
        }
        Ok(())
    }
}
