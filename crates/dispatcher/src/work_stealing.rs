use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;
use tracing::{debug, info};

use coordinator_core::config::WorkStealingConfig;
use coordinator_domain::models::{AgentProfile, AgentWorkload, Task};

/// 一次窃取决策：从过载Agent向空闲Agent迁移若干任务
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StealOperation {
    pub from: String,
    pub to: String,
    pub task_count: usize,
}

/// 工作窃取协调器
///
/// 维护各Agent的负载快照（由周期性上报刷新），按固定周期计算
/// 迁移决策：任务数超过 `均值 * steal_threshold` 的Agent为供给方，
/// 低于均值的为接收方，单周期最多迁移 `max_steal_batch` 个任务。
/// 决策的落地（实际改派任务）由协调管理器调用调度器完成。
pub struct WorkStealingCoordinator {
    workloads: RwLock<HashMap<String, AgentWorkload>>,
    config: WorkStealingConfig,
}

impl WorkStealingCoordinator {
    pub fn new(config: WorkStealingConfig) -> Self {
        Self {
            workloads: RwLock::new(HashMap::new()),
            config,
        }
    }

    pub fn config(&self) -> &WorkStealingConfig {
        &self.config
    }

    /// 刷新某Agent的负载快照
    pub async fn update_agent_workload(&self, workload: AgentWorkload) {
        let mut workloads = self.workloads.write().await;
        debug!(
            agent_id = %workload.agent_id,
            task_count = workload.task_count,
            "刷新Agent负载上报"
        );
        workloads.insert(workload.agent_id.clone(), workload);
    }

    pub async fn remove_agent(&self, agent_id: &str) {
        let mut workloads = self.workloads.write().await;
        workloads.remove(agent_id);
    }

    pub async fn get_workload(&self, agent_id: &str) -> Option<AgentWorkload> {
        let workloads = self.workloads.read().await;
        workloads.get(agent_id).cloned()
    }

    pub async fn workload_count(&self) -> usize {
        self.workloads.read().await.len()
    }

    /// 计算本周期的窃取决策。
    /// 最多产生一笔迁移：最重的供给方 -> 最轻的接收方。
    pub async fn compute_steal_operations(&self) -> Vec<StealOperation> {
        let workloads = self.workloads.read().await;
        let active: Vec<&AgentWorkload> = workloads
            .values()
            .filter(|w| !w.is_stale(self.config.workload_stale_seconds))
            .collect();
        if active.len() < 2 {
            return Vec::new();
        }

        let total: usize = active.iter().map(|w| w.task_count).sum();
        let mean = total as f64 / active.len() as f64;
        if mean == 0.0 {
            return Vec::new();
        }

        let donor = active
            .iter()
            .filter(|w| w.task_count as f64 > mean * self.config.steal_threshold)
            .max_by(|a, b| {
                a.task_count
                    .cmp(&b.task_count)
                    .then_with(|| b.agent_id.cmp(&a.agent_id))
            });
        let recipient = active
            .iter()
            .filter(|w| (w.task_count as f64) < mean)
            .min_by(|a, b| {
                a.task_count
                    .cmp(&b.task_count)
                    .then_with(|| a.agent_id.cmp(&b.agent_id))
            });

        let (Some(donor), Some(recipient)) = (donor, recipient) else {
            return Vec::new();
        };
        if donor.agent_id == recipient.agent_id {
            return Vec::new();
        }

        // 迁移差值的一半，封顶 max_steal_batch
        let gap = donor.task_count.saturating_sub(recipient.task_count);
        let task_count = (gap / 2).clamp(1, self.config.max_steal_batch);

        info!(
            from = %donor.agent_id,
            to = %recipient.agent_id,
            task_count,
            mean,
            "计算出工作窃取决策"
        );
        vec![StealOperation {
            from: donor.agent_id.clone(),
            to: recipient.agent_id.clone(),
            task_count,
        }]
    }

    /// 窃取落地后同步负载快照，避免下一次上报前重复窃取
    pub async fn apply_transfer(&self, from: &str, to: &str, moved: usize) {
        if moved == 0 {
            return;
        }
        let mut workloads = self.workloads.write().await;
        if let Some(donor) = workloads.get_mut(from) {
            donor.task_count = donor.task_count.saturating_sub(moved);
        }
        if let Some(recipient) = workloads.get_mut(to) {
            recipient.task_count += moved;
        }
    }

    /// 周期外的直接查询：按上报负载取合格且最轻的Agent
    pub async fn find_best_agent(
        &self,
        task: &Task,
        candidates: &[AgentProfile],
    ) -> Option<String> {
        let workloads = self.workloads.read().await;
        candidates
            .iter()
            .filter(|agent| agent.has_capabilities(&task.required_capabilities))
            .min_by(|a, b| {
                let load_a = workloads.get(&a.id).map(|w| w.task_count).unwrap_or(0);
                let load_b = workloads.get(&b.id).map(|w| w.task_count).unwrap_or(0);
                load_a.cmp(&load_b).then_with(|| a.id.cmp(&b.id))
            })
            .map(|agent| agent.id.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn workload(agent_id: &str, task_count: usize) -> AgentWorkload {
        AgentWorkload::new(agent_id, task_count)
    }

    fn coordinator(threshold: f64, max_batch: usize) -> WorkStealingCoordinator {
        WorkStealingCoordinator::new(WorkStealingConfig {
            enabled: true,
            steal_interval_ms: 1000,
            steal_threshold: threshold,
            max_steal_batch: max_batch,
            workload_stale_seconds: 120,
        })
    }

    #[tokio::test]
    async fn test_steal_from_overloaded_to_underloaded() {
        let ws = coordinator(1.5, 3);
        ws.update_agent_workload(workload("a", 10)).await;
        ws.update_agent_workload(workload("b", 1)).await;

        let ops = ws.compute_steal_operations().await;
        assert_eq!(ops.len(), 1);
        assert_eq!(ops[0].from, "a");
        assert_eq!(ops[0].to, "b");
        assert!(ops[0].task_count >= 1);
        assert!(ops[0].task_count <= 3);
    }

    #[tokio::test]
    async fn test_no_steal_when_balanced() {
        let ws = coordinator(1.5, 3);
        ws.update_agent_workload(workload("a", 4)).await;
        ws.update_agent_workload(workload("b", 5)).await;
        ws.update_agent_workload(workload("c", 4)).await;

        assert!(ws.compute_steal_operations().await.is_empty());
    }

    #[tokio::test]
    async fn test_no_steal_with_single_agent() {
        let ws = coordinator(1.5, 3);
        ws.update_agent_workload(workload("a", 10)).await;

        assert!(ws.compute_steal_operations().await.is_empty());
    }

    #[tokio::test]
    async fn test_steal_batch_is_capped() {
        let ws = coordinator(1.5, 2);
        ws.update_agent_workload(workload("a", 20)).await;
        ws.update_agent_workload(workload("b", 0)).await;

        let ops = ws.compute_steal_operations().await;
        assert_eq!(ops[0].task_count, 2);
    }

    #[tokio::test]
    async fn test_stale_workloads_excluded() {
        let ws = coordinator(1.5, 3);
        let mut stale = workload("a", 10);
        stale.updated_at = chrono::Utc::now() - chrono::Duration::seconds(600);
        ws.update_agent_workload(stale).await;
        ws.update_agent_workload(workload("b", 1)).await;

        // 过期上报不参与决策，只剩一个活跃Agent
        assert!(ws.compute_steal_operations().await.is_empty());
    }

    #[tokio::test]
    async fn test_apply_transfer_updates_snapshot() {
        let ws = coordinator(1.5, 3);
        ws.update_agent_workload(workload("a", 10)).await;
        ws.update_agent_workload(workload("b", 1)).await;

        ws.apply_transfer("a", "b", 3).await;
        assert_eq!(ws.get_workload("a").await.expect("a").task_count, 7);
        assert_eq!(ws.get_workload("b").await.expect("b").task_count, 4);
    }

    #[tokio::test]
    async fn test_find_best_agent_by_capability_and_load() {
        let ws = coordinator(1.5, 3);
        ws.update_agent_workload(workload("a", 5)).await;
        ws.update_agent_workload(workload("b", 2)).await;

        let mut profile_a = AgentProfile::new("a", "worker");
        profile_a.capabilities = vec!["shell".to_string()];
        let mut profile_b = AgentProfile::new("b", "worker");
        profile_b.capabilities = vec!["shell".to_string()];
        let mut profile_c = AgentProfile::new("c", "worker");
        profile_c.capabilities = vec!["gpu".to_string()];

        let mut task = Task::new("t1", "shell", "测试");
        task.required_capabilities = vec!["shell".to_string()];

        let best = ws
            .find_best_agent(&task, &[profile_a, profile_b, profile_c])
            .await;
        assert_eq!(best.as_deref(), Some("b"));
    }
}
