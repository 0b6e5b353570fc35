use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::debug;

use coordinator_domain::models::{AgentProfile, Task};
use coordinator_errors::CoordinationResult;

/// 单一任务类型的执行统计，驱动亲和调度与指标上报
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TaskTypeStats {
    pub executions: u64,
    pub successes: u64,
    pub failures: u64,
    pub total_duration_ms: u64,
    /// 最近一次成功执行该类型任务的Agent
    pub last_agent: Option<String>,
}

impl TaskTypeStats {
    pub fn avg_duration_ms(&self) -> f64 {
        if self.executions == 0 {
            0.0
        } else {
            self.total_duration_ms as f64 / self.executions as f64
        }
    }

    pub fn success_rate(&self) -> f64 {
        if self.executions == 0 {
            0.0
        } else {
            self.successes as f64 / self.executions as f64
        }
    }
}

/// 策略决策输入：当前各Agent负载与按类型的历史统计快照
#[derive(Debug, Clone, Default)]
pub struct SchedulingContext {
    pub agent_task_counts: HashMap<String, usize>,
    pub task_stats: HashMap<String, TaskTypeStats>,
}

impl SchedulingContext {
    pub fn agent_load(&self, agent_id: &str) -> usize {
        self.agent_task_counts.get(agent_id).copied().unwrap_or(0)
    }

    /// 候选集合的平均负载
    fn mean_load(&self, candidates: &[AgentProfile]) -> f64 {
        if candidates.is_empty() {
            return 0.0;
        }
        let total: usize = candidates.iter().map(|c| self.agent_load(&c.id)).sum();
        total as f64 / candidates.len() as f64
    }
}

/// Agent选择策略
#[async_trait]
pub trait SchedulingStrategy: Send + Sync {
    async fn select_agent(
        &self,
        task: &Task,
        candidates: &[AgentProfile],
        context: &SchedulingContext,
    ) -> CoordinationResult<Option<String>>;

    fn name(&self) -> &str;
}

/// 能力过滤后按负载最低挑选，负载相同按ID字典序
fn least_loaded_capable(
    task: &Task,
    candidates: &[AgentProfile],
    context: &SchedulingContext,
) -> Option<String> {
    candidates
        .iter()
        .filter(|agent| agent.has_capabilities(&task.required_capabilities))
        .min_by(|a, b| {
            context
                .agent_load(&a.id)
                .cmp(&context.agent_load(&b.id))
                .then_with(|| a.id.cmp(&b.id))
        })
        .map(|agent| agent.id.clone())
}

/// 能力匹配策略：能力覆盖为硬条件，幸存者中取当前任务最少者，
/// 并列时按Agent ID字典序决胜（确定性，可测试）
pub struct CapabilityStrategy;

impl CapabilityStrategy {
    pub fn new() -> Self {
        Self
    }
}

impl Default for CapabilityStrategy {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl SchedulingStrategy for CapabilityStrategy {
    async fn select_agent(
        &self,
        task: &Task,
        candidates: &[AgentProfile],
        context: &SchedulingContext,
    ) -> CoordinationResult<Option<String>> {
        if candidates.is_empty() {
            debug!("没有可用的候选Agent");
            return Ok(None);
        }
        let selected = least_loaded_capable(task, candidates, context);
        if let Some(agent_id) = &selected {
            debug!(
                task_id = %task.id,
                agent_id = %agent_id,
                "能力匹配策略选择Agent"
            );
        } else {
            debug!(
                task_id = %task.id,
                required = ?task.required_capabilities,
                "没有满足能力要求的Agent"
            );
        }
        Ok(selected)
    }

    fn name(&self) -> &str {
        "capability"
    }
}

/// 轮询策略：持久索引对列表长度取模，忽略负载，
/// 只跳过缺少所需能力的Agent
pub struct RoundRobinStrategy {
    counter: AtomicUsize,
}

impl RoundRobinStrategy {
    pub fn new() -> Self {
        Self {
            counter: AtomicUsize::new(0),
        }
    }
}

impl Default for RoundRobinStrategy {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl SchedulingStrategy for RoundRobinStrategy {
    async fn select_agent(
        &self,
        task: &Task,
        candidates: &[AgentProfile],
        _context: &SchedulingContext,
    ) -> CoordinationResult<Option<String>> {
        if candidates.is_empty() {
            debug!("没有可用的候选Agent");
            return Ok(None);
        }
        let start = self.counter.fetch_add(1, Ordering::Relaxed);
        for offset in 0..candidates.len() {
            let index = (start + offset) % candidates.len();
            let agent = &candidates[index];
            if agent.has_capabilities(&task.required_capabilities) {
                debug!(
                    task_id = %task.id,
                    agent_id = %agent.id,
                    index,
                    "轮询策略选择Agent"
                );
                return Ok(Some(agent.id.clone()));
            }
        }
        debug!(task_id = %task.id, "轮询未找到满足能力要求的Agent");
        Ok(None)
    }

    fn name(&self) -> &str {
        "round-robin"
    }
}

/// 最低负载策略：全局取负载最低的合格Agent，不考虑亲和历史
pub struct LeastLoadedStrategy;

impl LeastLoadedStrategy {
    pub fn new() -> Self {
        Self
    }
}

impl Default for LeastLoadedStrategy {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl SchedulingStrategy for LeastLoadedStrategy {
    async fn select_agent(
        &self,
        task: &Task,
        candidates: &[AgentProfile],
        context: &SchedulingContext,
    ) -> CoordinationResult<Option<String>> {
        if candidates.is_empty() {
            debug!("没有可用的候选Agent");
            return Ok(None);
        }
        let selected = least_loaded_capable(task, candidates, context);
        if let Some(agent_id) = &selected {
            debug!(
                task_id = %task.id,
                agent_id = %agent_id,
                load = context.agent_load(agent_id),
                "最低负载策略选择Agent"
            );
        }
        Ok(selected)
    }

    fn name(&self) -> &str {
        "least-loaded"
    }
}

/// 亲和策略：优先选择最近一次成功执行同类型任务的Agent；
/// 无历史或该Agent负载超过均值两倍时退回最低负载策略
pub struct AffinityStrategy;

impl AffinityStrategy {
    pub fn new() -> Self {
        Self
    }
}

impl Default for AffinityStrategy {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl SchedulingStrategy for AffinityStrategy {
    async fn select_agent(
        &self,
        task: &Task,
        candidates: &[AgentProfile],
        context: &SchedulingContext,
    ) -> CoordinationResult<Option<String>> {
        if candidates.is_empty() {
            debug!("没有可用的候选Agent");
            return Ok(None);
        }

        if let Some(last_agent) = context
            .task_stats
            .get(&task.task_type)
            .and_then(|stats| stats.last_agent.as_deref())
        {
            let affine = candidates.iter().find(|agent| {
                agent.id == last_agent && agent.has_capabilities(&task.required_capabilities)
            });
            if let Some(agent) = affine {
                let load = context.agent_load(&agent.id) as f64;
                let mean = context.mean_load(candidates);
                // 过载判定：超过均值两倍即放弃亲和
                if mean == 0.0 || load <= mean * 2.0 {
                    debug!(
                        task_id = %task.id,
                        task_type = %task.task_type,
                        agent_id = %agent.id,
                        "亲和策略复用历史Agent"
                    );
                    return Ok(Some(agent.id.clone()));
                }
                debug!(
                    task_id = %task.id,
                    agent_id = %agent.id,
                    load,
                    mean,
                    "历史Agent已过载，退回最低负载选择"
                );
            }
        }

        Ok(least_loaded_capable(task, candidates, context))
    }

    fn name(&self) -> &str {
        "affinity"
    }
}
