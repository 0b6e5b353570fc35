use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;
use tracing::{debug, error, info, warn};

use coordinator_core::circuit_breaker::{CircuitBreakerManager, CircuitBreakerSummary};
use coordinator_core::config::{ConfigValidator, CoordinationConfig};
use coordinator_core::traits::{SchedulerMetrics, TaskSchedulerService};
use coordinator_domain::events::CoordinationEvent;
use coordinator_domain::models::{
    AgentMessage, AgentProfile, AgentWorkload, ConflictContext, ConflictResolution,
    ResourceRequest, Task,
};
use coordinator_domain::ports::{EventBus, MessageRouter};
use coordinator_errors::{CoordinationError, CoordinationResult};

use crate::advanced_scheduler::AdvancedTaskScheduler;
use crate::conflict_resolver::ConflictResolver;
use crate::resource_manager::ResourceManager;
use crate::task_scheduler::TaskScheduler;
use crate::work_stealing::WorkStealingCoordinator;

/// 协调指标汇总
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CoordinationMetrics {
    pub scheduler: SchedulerMetrics,
    pub registered_agents: usize,
    pub held_resources: usize,
    pub waiting_requests: usize,
    pub active_conflicts: usize,
    pub resolved_conflicts: u64,
    pub deadlocks_detected: u64,
    pub circuit_breakers: Vec<CircuitBreakerSummary>,
    pub advanced_scheduling: bool,
}

/// 健康状态
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthStatus {
    pub healthy: bool,
    pub error: Option<String>,
    pub metrics: Option<CoordinationMetrics>,
}

/// 协调管理器
///
/// 顶层门面：组合任务调度器（运行时可切换为高级调度器）、
/// 资源管理器、冲突裁决器、工作窃取协调器与外部消息路由。
/// 后台循环负责死锁检测、周期维护与工作窃取。
pub struct CoordinationManager {
    config: CoordinationConfig,
    event_bus: Arc<dyn EventBus>,
    scheduler: RwLock<Arc<dyn TaskSchedulerService>>,
    resource_manager: Arc<ResourceManager>,
    conflict_resolver: Arc<ConflictResolver>,
    work_stealing: Arc<WorkStealingCoordinator>,
    circuit_breakers: Arc<CircuitBreakerManager>,
    message_router: Arc<dyn MessageRouter>,
    agents: RwLock<HashMap<String, AgentProfile>>,
    running: RwLock<bool>,
    advanced: RwLock<bool>,
    deadlocks_detected: AtomicU64,
}

impl CoordinationManager {
    pub fn new(
        config: CoordinationConfig,
        event_bus: Arc<dyn EventBus>,
        message_router: Arc<dyn MessageRouter>,
    ) -> CoordinationResult<Self> {
        config.validate()?;

        let scheduler: Arc<dyn TaskSchedulerService> = Arc::new(TaskScheduler::new(
            config.retry.clone(),
            config.task_retention_ms,
            event_bus.clone(),
        ));
        let resource_manager = Arc::new(ResourceManager::new(
            config.resource_timeout(),
            event_bus.clone(),
        ));
        let conflict_resolver = Arc::new(ConflictResolver::new(
            config.conflict_retention_ms,
            event_bus.clone(),
        ));
        let work_stealing = Arc::new(WorkStealingCoordinator::new(config.work_stealing.clone()));
        let circuit_breakers = Arc::new(CircuitBreakerManager::with_event_bus(
            config.circuit_breaker.clone(),
            event_bus.clone(),
        ));

        Ok(Self {
            config,
            event_bus,
            scheduler: RwLock::new(scheduler),
            resource_manager,
            conflict_resolver,
            work_stealing,
            circuit_breakers,
            message_router,
            agents: RwLock::new(HashMap::new()),
            running: RwLock::new(false),
            advanced: RwLock::new(false),
            deadlocks_detected: AtomicU64::new(0),
        })
    }

    /// 切换为策略化的高级调度器。
    /// 应在指派任务之前调用：已登记的任务不会迁移到新调度器。
    pub async fn enable_advanced_scheduling(&self) {
        let current_tasks = {
            let scheduler = self.scheduler.read().await;
            scheduler.metrics().await.total_tasks
        };
        if current_tasks > 0 {
            warn!(
                current_tasks,
                "切换高级调度器时已有登记任务，这些任务不会被迁移"
            );
        }
        let advanced_scheduler: Arc<dyn TaskSchedulerService> =
            Arc::new(AdvancedTaskScheduler::new(
                self.config.retry.clone(),
                self.config.task_retention_ms,
                self.event_bus.clone(),
                self.work_stealing.clone(),
                self.circuit_breakers.clone(),
            ));
        let mut scheduler = self.scheduler.write().await;
        *scheduler = advanced_scheduler;
        let mut advanced = self.advanced.write().await;
        *advanced = true;
        info!("已启用高级调度器");
    }

    pub async fn is_advanced_scheduling(&self) -> bool {
        *self.advanced.read().await
    }

    pub fn resource_manager(&self) -> &Arc<ResourceManager> {
        &self.resource_manager
    }

    pub fn conflict_resolver(&self) -> &Arc<ConflictResolver> {
        &self.conflict_resolver
    }

    pub fn work_stealing(&self) -> &Arc<WorkStealingCoordinator> {
        &self.work_stealing
    }

    pub fn circuit_breakers(&self) -> &Arc<CircuitBreakerManager> {
        &self.circuit_breakers
    }

    pub async fn scheduler(&self) -> Arc<dyn TaskSchedulerService> {
        self.scheduler.read().await.clone()
    }

    // ---- Agent登记 ----

    pub async fn register_agent(&self, profile: AgentProfile) {
        info!(agent_id = %profile.id, agent_type = %profile.agent_type, "注册Agent");
        let mut workload = AgentWorkload::new(profile.id.clone(), 0);
        workload.priority = profile.priority;
        workload.capabilities = profile.capabilities.clone();
        self.work_stealing.update_agent_workload(workload).await;
        let mut agents = self.agents.write().await;
        agents.insert(profile.id.clone(), profile);
    }

    /// 优雅下线：任务改派给其他Agent，释放资源持有
    pub async fn unregister_agent(&self, agent_id: &str) -> CoordinationResult<()> {
        info!(agent_id, "注销Agent");
        let candidates = self.agent_snapshot_excluding(agent_id).await;
        let scheduler = self.scheduler().await;
        scheduler
            .reschedule_agent_tasks(agent_id, &candidates)
            .await?;
        // 改派不走的任务（无人能接手）直接取消
        scheduler.cancel_agent_tasks(agent_id).await?;
        self.resource_manager.release_all_for_agent(agent_id).await;
        self.resource_manager
            .cancel_pending_for_agent(agent_id, "Agent已注销")
            .await;
        self.work_stealing.remove_agent(agent_id).await;
        let mut agents = self.agents.write().await;
        agents.remove(agent_id);
        Ok(())
    }

    /// Agent失联处理：释放锁、中止等待、改派在途任务
    pub async fn handle_agent_failure(&self, agent_id: &str) -> CoordinationResult<()> {
        warn!(agent_id, "处理失联Agent");
        self.resource_manager.release_all_for_agent(agent_id).await;
        self.resource_manager
            .cancel_pending_for_agent(agent_id, "Agent已失联")
            .await;
        let candidates = self.agent_snapshot_excluding(agent_id).await;
        let scheduler = self.scheduler().await;
        let moved = scheduler
            .reschedule_agent_tasks(agent_id, &candidates)
            .await?;
        let cancelled = scheduler.cancel_agent_tasks(agent_id).await?;
        info!(
            agent_id,
            rescheduled = moved.len(),
            cancelled,
            "失联Agent的任务处理完成"
        );
        self.work_stealing.remove_agent(agent_id).await;
        let mut agents = self.agents.write().await;
        agents.remove(agent_id);
        Ok(())
    }

    pub async fn get_agent(&self, agent_id: &str) -> Option<AgentProfile> {
        let agents = self.agents.read().await;
        agents.get(agent_id).cloned()
    }

    async fn agent_snapshot(&self) -> Vec<AgentProfile> {
        let agents = self.agents.read().await;
        let mut profiles: Vec<AgentProfile> = agents.values().cloned().collect();
        profiles.sort_by(|a, b| a.id.cmp(&b.id));
        profiles
    }

    async fn agent_snapshot_excluding(&self, excluded: &str) -> Vec<AgentProfile> {
        self.agent_snapshot()
            .await
            .into_iter()
            .filter(|profile| profile.id != excluded)
            .collect()
    }

    // ---- 任务操作 ----

    /// 指派任务。`agent_id` 为 None 时由调度器按策略挑选Agent。
    pub async fn assign_task(
        &self,
        task: Task,
        agent_id: Option<&str>,
    ) -> CoordinationResult<String> {
        let scheduler = self.scheduler().await;
        match agent_id {
            Some(agent_id) => {
                if self.get_agent(agent_id).await.is_none() {
                    return Err(CoordinationError::agent_not_found(agent_id));
                }
                scheduler.assign_task(task, agent_id).await?;
                Ok(agent_id.to_string())
            }
            None => {
                let candidates = self.agent_snapshot().await;
                scheduler.schedule(task, &candidates).await
            }
        }
    }

    pub async fn complete_task(
        &self,
        task_id: &str,
        result: Option<serde_json::Value>,
    ) -> CoordinationResult<()> {
        self.scheduler().await.complete_task(task_id, result).await
    }

    pub async fn fail_task(
        &self,
        task_id: &str,
        error: CoordinationError,
    ) -> CoordinationResult<()> {
        self.scheduler().await.fail_task(task_id, error).await
    }

    pub async fn cancel_task(&self, task_id: &str, reason: &str) -> CoordinationResult<()> {
        self.scheduler().await.cancel_task(task_id, reason).await
    }

    pub async fn update_task_progress(
        &self,
        task_id: &str,
        progress: u8,
    ) -> CoordinationResult<()> {
        self.scheduler().await.update_progress(task_id, progress).await
    }

    // ---- 资源操作 ----

    /// 获取资源，等待优先级取自Agent档案
    pub async fn acquire_resource(
        &self,
        resource_id: &str,
        agent_id: &str,
    ) -> CoordinationResult<()> {
        let priority = self
            .get_agent(agent_id)
            .await
            .map(|profile| profile.priority)
            .unwrap_or(0);
        self.resource_manager
            .acquire(resource_id, agent_id, priority)
            .await
    }

    pub async fn release_resource(
        &self,
        resource_id: &str,
        agent_id: &str,
    ) -> CoordinationResult<()> {
        self.resource_manager.release(resource_id, agent_id).await
    }

    // ---- 消息 ----

    pub async fn send_message(&self, message: AgentMessage) -> CoordinationResult<()> {
        self.message_router.send(message).await
    }

    /// 发送并等待应答，超时由 `message_timeout_ms` 配置
    pub async fn send_with_response(
        &self,
        message: AgentMessage,
    ) -> CoordinationResult<AgentMessage> {
        self.message_router
            .send_with_response(message, self.config.message_timeout())
            .await
    }

    // ---- 冲突与负载 ----

    pub async fn report_conflict(
        &self,
        resource_id: &str,
        agents: Vec<String>,
    ) -> CoordinationResult<ConflictResolution> {
        let conflict = self
            .conflict_resolver
            .report_resource_conflict(resource_id, agents)
            .await;
        let context = self.build_conflict_context(&conflict.agents).await;
        self.conflict_resolver
            .auto_resolve(&conflict.id, &context, None)
            .await
    }

    pub async fn update_agent_workload(&self, workload: AgentWorkload) {
        self.work_stealing.update_agent_workload(workload).await;
    }

    async fn build_conflict_context(&self, contenders: &[String]) -> ConflictContext {
        let agents = self.agents.read().await;
        let mut context = ConflictContext::default();
        for agent_id in contenders {
            if let Some(profile) = agents.get(agent_id) {
                context
                    .agent_priorities
                    .insert(agent_id.clone(), profile.priority);
            }
        }
        context
    }

    // ---- 生命周期 ----

    /// 启动后台循环：死锁检测、周期维护、工作窃取
    pub async fn start(self: Arc<Self>) -> CoordinationResult<()> {
        {
            let mut running = self.running.write().await;
            if *running {
                return Err(CoordinationError::internal("协调管理器已在运行"));
            }
            *running = true;
        }
        info!("协调管理器启动");

        if self.config.deadlock_detection {
            Self::spawn_loop(
                Arc::downgrade(&self),
                self.config.deadlock_detection_interval(),
                "死锁检测",
                |manager| async move {
                    manager.run_deadlock_detection().await;
                },
            );
        }
        Self::spawn_loop(
            Arc::downgrade(&self),
            self.config.maintenance_interval(),
            "周期维护",
            |manager| async move {
                if let Err(e) = manager.perform_maintenance().await {
                    error!("周期维护出错: {}", e);
                }
            },
        );
        if self.config.work_stealing.enabled {
            Self::spawn_loop(
                Arc::downgrade(&self),
                Duration::from_millis(self.config.work_stealing.steal_interval_ms),
                "工作窃取",
                |manager| async move {
                    manager.run_work_stealing_cycle().await;
                },
            );
        }
        Ok(())
    }

    pub async fn stop(&self) {
        let mut running = self.running.write().await;
        *running = false;
        info!("协调管理器停止");
    }

    pub async fn is_running(&self) -> bool {
        *self.running.read().await
    }

    fn spawn_loop<F, Fut>(
        manager: Weak<CoordinationManager>,
        interval: Duration,
        name: &'static str,
        tick: F,
    ) where
        F: Fn(Arc<CoordinationManager>) -> Fut + Send + 'static,
        Fut: std::future::Future<Output = ()> + Send,
    {
        tokio::spawn(async move {
            debug!(name, interval_ms = interval.as_millis() as u64, "后台循环启动");
            loop {
                tokio::time::sleep(interval).await;
                let Some(manager) = manager.upgrade() else {
                    break;
                };
                if !manager.is_running().await {
                    debug!(name, "收到停止信号，退出后台循环");
                    break;
                }
                tick(manager).await;
            }
        });
    }

    /// 周期维护：调度器终态清理、资源等待清理、冲突归档清理
    pub async fn perform_maintenance(&self) -> CoordinationResult<()> {
        self.scheduler().await.perform_maintenance().await?;
        let purged_waiters = self.resource_manager.perform_maintenance().await;
        let purged_conflicts = self.conflict_resolver.perform_maintenance().await;
        debug!(purged_waiters, purged_conflicts, "周期维护完成");
        Ok(())
    }

    // ---- 工作窃取周期 ----

    pub async fn run_work_stealing_cycle(&self) {
        let operations = self.work_stealing.compute_steal_operations().await;
        for operation in operations {
            let Some(recipient) = self.get_agent(&operation.to).await else {
                debug!(to = %operation.to, "窃取接收方未注册，跳过");
                continue;
            };
            let scheduler = self.scheduler().await;
            match scheduler
                .transfer_unstarted_tasks(&operation.from, &recipient, operation.task_count)
                .await
            {
                Ok(moved) if !moved.is_empty() => {
                    self.work_stealing
                        .apply_transfer(&operation.from, &operation.to, moved.len())
                        .await;
                    let _ = self
                        .event_bus
                        .publish(CoordinationEvent::WorkloadRebalanced {
                            from_agent: operation.from.clone(),
                            to_agent: operation.to.clone(),
                            task_count: moved.len(),
                            occurred_at: Utc::now(),
                        })
                        .await;
                }
                Ok(_) => {
                    debug!(
                        from = %operation.from,
                        to = %operation.to,
                        "本周期没有可迁移的任务"
                    );
                }
                Err(e) => {
                    error!("工作窃取迁移失败: {}", e);
                }
            }
        }
    }

    // ---- 死锁检测 ----

    /// 从资源管理器状态构建Agent等待图，检出环并裁决打破。
    /// 检测到的死锁要么被裁决，要么升级为错误日志，绝不无声放过。
    pub async fn run_deadlock_detection(&self) {
        let allocations = self.resource_manager.get_allocations().await;
        let waiting = self.resource_manager.get_waiting_requests().await;

        let Some(cycle) = Self::find_wait_cycle(&allocations, &waiting) else {
            return;
        };

        self.deadlocks_detected.fetch_add(1, Ordering::Relaxed);
        let resources: Vec<String> = waiting
            .iter()
            .filter(|(resource_id, requests)| {
                requests.iter().any(|r| cycle.agents.contains(&r.agent_id))
                    && allocations
                        .get(*resource_id)
                        .map(|holder| cycle.agents.contains(holder))
                        .unwrap_or(false)
            })
            .map(|(resource_id, _)| resource_id.clone())
            .collect();

        warn!(
            agents = ?cycle.agents,
            resources = ?resources,
            "检测到资源死锁"
        );
        let _ = self
            .event_bus
            .publish(CoordinationEvent::DeadlockDetected {
                agents: cycle.agents.clone(),
                resources: resources.clone(),
                occurred_at: Utc::now(),
            })
            .await;

        if let Err(e) = self.resolve_deadlock(&cycle, &resources, &waiting).await {
            // 升级：裁决失败必须留下痕迹，等待下个周期重试
            error!(
                agents = ?cycle.agents,
                "死锁裁决失败，升级告警: {}",
                e
            );
        }
    }

    async fn resolve_deadlock(
        &self,
        cycle: &WaitCycle,
        resources: &[String],
        waiting: &HashMap<String, Vec<ResourceRequest>>,
    ) -> CoordinationResult<()> {
        // 受害者：等待优先级最低，其次请求最早，再次ID字典序
        let victim = Self::select_victim(&cycle.agents, waiting).ok_or_else(|| {
            CoordinationError::Deadlock {
                agents: cycle.agents.clone(),
                resources: resources.to_vec(),
            }
        })?;

        // 登记冲突并用优先级策略裁决，留下可审计的裁决记录
        let subject = resources.first().cloned().unwrap_or_default();
        let conflict = self
            .conflict_resolver
            .report_resource_conflict(&subject, cycle.agents.clone())
            .await;
        let mut context = self.build_conflict_context(&cycle.agents).await;
        for requests in waiting.values() {
            for request in requests {
                if cycle.agents.contains(&request.agent_id) {
                    context
                        .agent_priorities
                        .entry(request.agent_id.clone())
                        .or_insert(request.priority);
                    context
                        .request_timestamps
                        .entry(request.agent_id.clone())
                        .or_insert(request.requested_at);
                }
            }
        }
        let resolution = self
            .conflict_resolver
            .auto_resolve(&conflict.id, &context, Some("priority"))
            .await?;

        info!(
            victim = %victim,
            winner = %resolution.winner,
            "死锁裁决：中止受害者的等待并释放其持有"
        );

        // 打破环：中止受害者的等待并强制释放其持有的资源
        self.resource_manager
            .cancel_pending_for_agent(&victim, "死锁裁决中止等待")
            .await;
        self.resource_manager.release_all_for_agent(&victim).await;

        // 受害者被阻塞的任务改派给环外的Agent
        let candidates = self.agent_snapshot_excluding(&victim).await;
        let scheduler = self.scheduler().await;
        if let Err(e) = scheduler.reschedule_agent_tasks(&victim, &candidates).await {
            warn!(victim = %victim, "死锁受害者任务改派失败: {}", e);
        }
        Ok(())
    }

    /// 在等待图（等待者 -> 持有者）中找环，返回环上的Agent
    fn find_wait_cycle(
        allocations: &HashMap<String, String>,
        waiting: &HashMap<String, Vec<ResourceRequest>>,
    ) -> Option<WaitCycle> {
        let mut edges: HashMap<&str, HashSet<&str>> = HashMap::new();
        for (resource_id, requests) in waiting {
            let Some(holder) = allocations.get(resource_id) else {
                continue;
            };
            for request in requests {
                if request.agent_id != *holder {
                    edges
                        .entry(request.agent_id.as_str())
                        .or_default()
                        .insert(holder.as_str());
                }
            }
        }
        if edges.is_empty() {
            return None;
        }

        let mut visited: HashSet<&str> = HashSet::new();
        let mut roots: Vec<&&str> = edges.keys().collect();
        roots.sort();

        for root in roots {
            if visited.contains(*root) {
                continue;
            }
            let mut path: Vec<&str> = Vec::new();
            let mut on_path: HashSet<&str> = HashSet::new();
            if let Some(cycle) =
                Self::dfs_cycle(*root, &edges, &mut visited, &mut path, &mut on_path)
            {
                return Some(WaitCycle { agents: cycle });
            }
        }
        None
    }

    fn dfs_cycle<'a>(
        current: &'a str,
        edges: &HashMap<&'a str, HashSet<&'a str>>,
        visited: &mut HashSet<&'a str>,
        path: &mut Vec<&'a str>,
        on_path: &mut HashSet<&'a str>,
    ) -> Option<Vec<String>> {
        visited.insert(current);
        path.push(current);
        on_path.insert(current);

        if let Some(targets) = edges.get(current) {
            let mut sorted: Vec<&&str> = targets.iter().collect();
            sorted.sort();
            for target in sorted {
                if on_path.contains(*target) {
                    let start = path.iter().position(|agent| agent == target)?;
                    return Some(path[start..].iter().map(|s| s.to_string()).collect());
                }
                if !visited.contains(*target) {
                    if let Some(cycle) = Self::dfs_cycle(*target, edges, visited, path, on_path)
                    {
                        return Some(cycle);
                    }
                }
            }
        }

        path.pop();
        on_path.remove(current);
        None
    }

    /// 受害者选择：最低等待优先级，最早请求时间，ID字典序
    fn select_victim(
        cycle_agents: &[String],
        waiting: &HashMap<String, Vec<ResourceRequest>>,
    ) -> Option<String> {
        let mut candidates: Vec<(i32, DateTime<Utc>, String)> = Vec::new();
        for agent_id in cycle_agents {
            let request = waiting
                .values()
                .flatten()
                .filter(|request| request.agent_id == *agent_id)
                .min_by_key(|request| request.requested_at);
            if let Some(request) = request {
                candidates.push((request.priority, request.requested_at, agent_id.clone()));
            }
        }
        candidates
            .into_iter()
            .min_by(|a, b| a.0.cmp(&b.0).then_with(|| a.1.cmp(&b.1)).then_with(|| a.2.cmp(&b.2)))
            .map(|(_, _, agent_id)| agent_id)
    }

    // ---- 指标与健康 ----

    pub async fn get_coordination_metrics(&self) -> CoordinationMetrics {
        let scheduler_metrics = self.scheduler().await.metrics().await;
        let (held_resources, waiting_requests) = self.resource_manager.counts().await;
        let (active_conflicts, resolved_conflicts) = self.conflict_resolver.counts().await;
        let registered_agents = self.agents.read().await.len();
        CoordinationMetrics {
            scheduler: scheduler_metrics,
            registered_agents,
            held_resources,
            waiting_requests,
            active_conflicts,
            resolved_conflicts,
            deadlocks_detected: self.deadlocks_detected.load(Ordering::Relaxed),
            circuit_breakers: self.circuit_breakers.summaries().await,
            advanced_scheduling: self.is_advanced_scheduling().await,
        }
    }

    pub async fn get_health_status(&self) -> HealthStatus {
        if !self.is_running().await {
            return HealthStatus {
                healthy: false,
                error: Some("协调管理器未启动".to_string()),
                metrics: None,
            };
        }
        let metrics = self.get_coordination_metrics().await;
        let open_breakers = self.circuit_breakers.open_breakers().await;
        let error = if open_breakers.is_empty() {
            None
        } else {
            Some(format!("熔断器未闭合: {}", open_breakers.join(", ")))
        };
        HealthStatus {
            healthy: true,
            error,
            metrics: Some(metrics),
        }
    }
}

struct WaitCycle {
    agents: Vec<String>,
}
