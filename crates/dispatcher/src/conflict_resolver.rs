use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use tokio::sync::{Mutex, RwLock};
use tracing::{debug, info, warn};

use coordinator_domain::events::CoordinationEvent;
use coordinator_domain::models::{
    ConflictContext, ConflictResolution, ResourceConflict, TaskConflict, TaskConflictKind,
};
use coordinator_domain::ports::EventBus;
use coordinator_errors::{CoordinationError, CoordinationResult};

/// 冲突裁决策略
///
/// 从争用者中裁出胜者；无法裁决时返回 None，由调用方决定后续，
/// 绝不猜测
#[async_trait]
pub trait ConflictResolutionStrategy: Send + Sync {
    async fn resolve(
        &self,
        agents: &[String],
        context: &ConflictContext,
    ) -> CoordinationResult<Option<ConflictResolution>>;

    fn name(&self) -> &str;
}

fn build_resolution(
    winner: String,
    agents: &[String],
    strategy: &str,
    reason: String,
) -> ConflictResolution {
    ConflictResolution {
        losers: agents
            .iter()
            .filter(|agent| **agent != winner)
            .cloned()
            .collect(),
        winner,
        strategy: strategy.to_string(),
        reason,
        resolved_at: Utc::now(),
    }
}

/// 优先级策略：最高优先级胜出，并列取请求时间最早者，
/// 再并列按Agent ID字典序（确定性兜底）
pub struct PriorityResolutionStrategy;

#[async_trait]
impl ConflictResolutionStrategy for PriorityResolutionStrategy {
    async fn resolve(
        &self,
        agents: &[String],
        context: &ConflictContext,
    ) -> CoordinationResult<Option<ConflictResolution>> {
        let winner = agents.iter().max_by(|a, b| {
            let priority_a = context.agent_priorities.get(*a).copied().unwrap_or(0);
            let priority_b = context.agent_priorities.get(*b).copied().unwrap_or(0);
            priority_a
                .cmp(&priority_b)
                .then_with(|| {
                    let ts_a = context
                        .request_timestamps
                        .get(*a)
                        .copied()
                        .unwrap_or(chrono::DateTime::<Utc>::MAX_UTC);
                    let ts_b = context
                        .request_timestamps
                        .get(*b)
                        .copied()
                        .unwrap_or(chrono::DateTime::<Utc>::MAX_UTC);
                    // 时间早者优先，max_by 语义下要反转
                    ts_b.cmp(&ts_a)
                })
                .then_with(|| b.cmp(a))
        });

        Ok(winner.map(|winner| {
            let priority = context.agent_priorities.get(winner).copied().unwrap_or(0);
            build_resolution(
                winner.clone(),
                agents,
                self.name(),
                format!("优先级最高（{priority}）"),
            )
        }))
    }

    fn name(&self) -> &str {
        "priority"
    }
}

/// 时间戳策略：严格先到先得
pub struct TimestampResolutionStrategy;

#[async_trait]
impl ConflictResolutionStrategy for TimestampResolutionStrategy {
    async fn resolve(
        &self,
        agents: &[String],
        context: &ConflictContext,
    ) -> CoordinationResult<Option<ConflictResolution>> {
        let winner = agents.iter().min_by(|a, b| {
            let ts_a = context
                .request_timestamps
                .get(*a)
                .copied()
                .unwrap_or(chrono::DateTime::<Utc>::MAX_UTC);
            let ts_b = context
                .request_timestamps
                .get(*b)
                .copied()
                .unwrap_or(chrono::DateTime::<Utc>::MAX_UTC);
            ts_a.cmp(&ts_b).then_with(|| a.cmp(b))
        });

        Ok(winner.map(|winner| {
            build_resolution(
                winner.clone(),
                agents,
                self.name(),
                "请求时间最早".to_string(),
            )
        }))
    }

    fn name(&self) -> &str {
        "timestamp"
    }
}

/// 投票策略：得票最多者胜出；票数持平视为无法裁决，
/// 交还调用方而不是擅自挑选
pub struct VotingResolutionStrategy;

#[async_trait]
impl ConflictResolutionStrategy for VotingResolutionStrategy {
    async fn resolve(
        &self,
        agents: &[String],
        context: &ConflictContext,
    ) -> CoordinationResult<Option<ConflictResolution>> {
        let mut tally: HashMap<&str, usize> = HashMap::new();
        for candidate in context.votes.values() {
            if agents.iter().any(|agent| agent == candidate) {
                *tally.entry(candidate.as_str()).or_insert(0) += 1;
            }
        }
        if tally.is_empty() {
            return Ok(None);
        }

        let max_votes = tally.values().copied().max().unwrap_or(0);
        let mut leaders: Vec<&str> = tally
            .iter()
            .filter(|(_, votes)| **votes == max_votes)
            .map(|(agent, _)| *agent)
            .collect();
        if leaders.len() > 1 {
            leaders.sort();
            debug!(?leaders, max_votes, "投票持平，无法裁决");
            return Ok(None);
        }

        let winner = leaders[0].to_string();
        Ok(Some(build_resolution(
            winner,
            agents,
            self.name(),
            format!("得票最多（{max_votes}票）"),
        )))
    }

    fn name(&self) -> &str {
        "voting"
    }
}

#[derive(Default)]
struct ResolverState {
    resource_conflicts: HashMap<String, ResourceConflict>,
    task_conflicts: HashMap<String, TaskConflict>,
    resolved_total: u64,
}

/// 冲突裁决器
///
/// 登记资源/任务冲突并按命名策略裁决。已裁决的冲突保留一个
/// 窗口期供审计，由维护任务清理。
pub struct ConflictResolver {
    state: Mutex<ResolverState>,
    strategies: RwLock<HashMap<String, Arc<dyn ConflictResolutionStrategy>>>,
    event_bus: Arc<dyn EventBus>,
    retention: chrono::Duration,
}

impl ConflictResolver {
    pub fn new(retention_ms: u64, event_bus: Arc<dyn EventBus>) -> Self {
        let mut strategies: HashMap<String, Arc<dyn ConflictResolutionStrategy>> = HashMap::new();
        strategies.insert(
            "priority".to_string(),
            Arc::new(PriorityResolutionStrategy) as Arc<dyn ConflictResolutionStrategy>,
        );
        strategies.insert(
            "timestamp".to_string(),
            Arc::new(TimestampResolutionStrategy),
        );
        strategies.insert("voting".to_string(), Arc::new(VotingResolutionStrategy));

        Self {
            state: Mutex::new(ResolverState::default()),
            strategies: RwLock::new(strategies),
            event_bus,
            retention: chrono::Duration::milliseconds(retention_ms as i64),
        }
    }

    /// 注册自定义裁决策略（同名覆盖）
    pub async fn register_strategy(&self, strategy: Arc<dyn ConflictResolutionStrategy>) {
        let mut strategies = self.strategies.write().await;
        strategies.insert(strategy.name().to_string(), strategy);
    }

    /// 登记一次资源争用冲突
    pub async fn report_resource_conflict(
        &self,
        resource_id: &str,
        agents: Vec<String>,
    ) -> ResourceConflict {
        let conflict = ResourceConflict::new(resource_id.to_string(), agents);
        {
            let mut state = self.state.lock().await;
            state
                .resource_conflicts
                .insert(conflict.id.clone(), conflict.clone());
        }
        warn!(
            conflict_id = %conflict.id,
            resource_id,
            agents = ?conflict.agents,
            "登记资源冲突"
        );
        let _ = self
            .event_bus
            .publish(CoordinationEvent::ConflictDetected {
                conflict_id: conflict.id.clone(),
                subject_id: resource_id.to_string(),
                agents: conflict.agents.clone(),
                occurred_at: Utc::now(),
            })
            .await;
        conflict
    }

    /// 登记一次任务认领冲突
    pub async fn report_task_conflict(
        &self,
        task_id: &str,
        agents: Vec<String>,
        kind: TaskConflictKind,
    ) -> TaskConflict {
        let conflict = TaskConflict::new(task_id.to_string(), agents, kind);
        {
            let mut state = self.state.lock().await;
            state
                .task_conflicts
                .insert(conflict.id.clone(), conflict.clone());
        }
        warn!(
            conflict_id = %conflict.id,
            task_id,
            agents = ?conflict.agents,
            "登记任务冲突"
        );
        let _ = self
            .event_bus
            .publish(CoordinationEvent::ConflictDetected {
                conflict_id: conflict.id.clone(),
                subject_id: task_id.to_string(),
                agents: conflict.agents.clone(),
                occurred_at: Utc::now(),
            })
            .await;
        conflict
    }

    /// 按命名策略裁决冲突。已裁决的冲突直接返回既有结果。
    pub async fn resolve_conflict(
        &self,
        conflict_id: &str,
        strategy_name: &str,
        context: &ConflictContext,
    ) -> CoordinationResult<ConflictResolution> {
        let agents = {
            let state = self.state.lock().await;
            if let Some(conflict) = state.resource_conflicts.get(conflict_id) {
                if let Some(resolution) = &conflict.resolution {
                    return Ok(resolution.clone());
                }
                conflict.agents.clone()
            } else if let Some(conflict) = state.task_conflicts.get(conflict_id) {
                if let Some(resolution) = &conflict.resolution {
                    return Ok(resolution.clone());
                }
                conflict.agents.clone()
            } else {
                return Err(CoordinationError::ConflictNotFound {
                    id: conflict_id.to_string(),
                });
            }
        };

        let strategy = {
            let strategies = self.strategies.read().await;
            strategies.get(strategy_name).cloned()
        }
        .ok_or_else(|| {
            CoordinationError::config_error(format!("未知的冲突裁决策略: {strategy_name}"))
        })?;

        let resolution = strategy.resolve(&agents, context).await?.ok_or_else(|| {
            CoordinationError::ConflictUnresolved {
                conflict_id: conflict_id.to_string(),
                reason: format!("策略 {strategy_name} 无法裁出胜者"),
            }
        })?;

        {
            let mut state = self.state.lock().await;
            if let Some(conflict) = state.resource_conflicts.get_mut(conflict_id) {
                conflict.resolved = true;
                conflict.resolution = Some(resolution.clone());
            } else if let Some(conflict) = state.task_conflicts.get_mut(conflict_id) {
                conflict.resolved = true;
                conflict.resolution = Some(resolution.clone());
            }
            state.resolved_total += 1;
        }

        info!(
            conflict_id,
            winner = %resolution.winner,
            strategy = strategy_name,
            "冲突已裁决"
        );
        let _ = self
            .event_bus
            .publish(CoordinationEvent::ConflictResolved {
                conflict_id: conflict_id.to_string(),
                winner: resolution.winner.clone(),
                strategy: strategy_name.to_string(),
                occurred_at: Utc::now(),
            })
            .await;
        Ok(resolution)
    }

    /// 自动裁决：未指定偏好时缺省用优先级策略
    pub async fn auto_resolve(
        &self,
        conflict_id: &str,
        context: &ConflictContext,
        preferred_strategy: Option<&str>,
    ) -> CoordinationResult<ConflictResolution> {
        let strategy = preferred_strategy.unwrap_or("priority");
        self.resolve_conflict(conflict_id, strategy, context).await
    }

    pub async fn get_resource_conflict(&self, conflict_id: &str) -> Option<ResourceConflict> {
        let state = self.state.lock().await;
        state.resource_conflicts.get(conflict_id).cloned()
    }

    pub async fn get_task_conflict(&self, conflict_id: &str) -> Option<TaskConflict> {
        let state = self.state.lock().await;
        state.task_conflicts.get(conflict_id).cloned()
    }

    /// (未裁决冲突数, 历史裁决总数)
    pub async fn counts(&self) -> (usize, u64) {
        let state = self.state.lock().await;
        let active = state
            .resource_conflicts
            .values()
            .filter(|c| !c.resolved)
            .count()
            + state.task_conflicts.values().filter(|c| !c.resolved).count();
        (active, state.resolved_total)
    }

    /// 清理保留窗口之外的已裁决冲突
    pub async fn perform_maintenance(&self) -> usize {
        let cutoff = Utc::now() - self.retention;
        let mut state = self.state.lock().await;
        let before =
            state.resource_conflicts.len() + state.task_conflicts.len();
        state.resource_conflicts.retain(|_, conflict| {
            !conflict.resolved
                || conflict
                    .resolution
                    .as_ref()
                    .map(|r| r.resolved_at >= cutoff)
                    .unwrap_or(true)
        });
        state.task_conflicts.retain(|_, conflict| {
            !conflict.resolved
                || conflict
                    .resolution
                    .as_ref()
                    .map(|r| r.resolved_at >= cutoff)
                    .unwrap_or(true)
        });
        before - (state.resource_conflicts.len() + state.task_conflicts.len())
    }
}
