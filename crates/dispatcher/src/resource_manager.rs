use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use tokio::sync::{oneshot, Mutex};
use tracing::{debug, info, warn};

use coordinator_domain::events::CoordinationEvent;
use coordinator_domain::models::{ResourceRequest, ResourceStatus};
use coordinator_domain::ports::EventBus;
use coordinator_errors::{CoordinationError, CoordinationResult};

/// 等待队列条目，授予通过 oneshot 异步通知
struct Waiter {
    agent_id: String,
    priority: i32,
    enqueued_at: Instant,
    requested_at: DateTime<Utc>,
    responder: oneshot::Sender<CoordinationResult<()>>,
}

#[derive(Default)]
struct ResourceEntry {
    holder: Option<String>,
    /// 始终保持（优先级降序，到达时间升序）
    queue: Vec<Waiter>,
}

#[derive(Default)]
struct ResourceState {
    resources: HashMap<String, ResourceEntry>,
    /// Agent -> 持有的资源，支持按Agent批量释放
    agent_holdings: HashMap<String, HashSet<String>>,
}

/// 资源管理器
///
/// 互斥资源锁：任意时刻每个资源至多一个持有者，等待者按
/// （优先级降序，到达时间升序）排队，授予与释放在同一把锁内
/// 原子完成。死锁检测不在这里做，本组件只暴露分配与等待快照，
/// 由协调管理器构建等待图并裁决。
pub struct ResourceManager {
    state: Mutex<ResourceState>,
    resource_timeout: Duration,
    event_bus: Arc<dyn EventBus>,
}

impl ResourceManager {
    pub fn new(resource_timeout: Duration, event_bus: Arc<dyn EventBus>) -> Self {
        Self {
            state: Mutex::new(ResourceState::default()),
            resource_timeout,
            event_bus,
        }
    }

    /// 获取资源的排它锁。
    ///
    /// 资源空闲时立即授予；否则排队挂起，直到被授予或超过
    /// `resource_timeout`（超时以资源锁错误失败）。持有者重复获取
    /// 直接返回成功，不产生重复队列条目。
    pub async fn acquire(
        &self,
        resource_id: &str,
        agent_id: &str,
        priority: i32,
    ) -> CoordinationResult<()> {
        let receiver = {
            let mut guard = self.state.lock().await;
            let state = &mut *guard;
            let entry = state.resources.entry(resource_id.to_string()).or_default();

            match entry.holder.as_deref() {
                None => {
                    entry.holder = Some(agent_id.to_string());
                    state
                        .agent_holdings
                        .entry(agent_id.to_string())
                        .or_default()
                        .insert(resource_id.to_string());
                    drop(guard);
                    debug!(resource_id, agent_id, "资源空闲，立即授予");
                    self.emit_acquired(resource_id, agent_id).await;
                    return Ok(());
                }
                Some(holder) if holder == agent_id => {
                    // 幂等：持有者重复获取
                    return Ok(());
                }
                Some(_) => {
                    if entry.queue.iter().any(|w| w.agent_id == agent_id) {
                        return Err(CoordinationError::resource_lock(
                            resource_id,
                            "该Agent已在等待队列中",
                        ));
                    }
                    let (tx, rx) = oneshot::channel();
                    let position = entry
                        .queue
                        .iter()
                        .position(|w| w.priority < priority)
                        .unwrap_or(entry.queue.len());
                    entry.queue.insert(
                        position,
                        Waiter {
                            agent_id: agent_id.to_string(),
                            priority,
                            enqueued_at: Instant::now(),
                            requested_at: Utc::now(),
                            responder: tx,
                        },
                    );
                    debug!(
                        resource_id,
                        agent_id, priority, position, "资源被占用，进入等待队列"
                    );
                    rx
                }
            }
        };

        // 授予方（release/grant_next）负责发布 resource:acquired 事件
        match tokio::time::timeout(self.resource_timeout, receiver).await {
            Ok(Ok(grant)) => grant,
            Ok(Err(_)) => Err(CoordinationError::internal("资源授予通道被关闭")),
            Err(_) => {
                // 超时。授予可能恰好与超时竞争，以锁内状态为准
                let mut state = self.state.lock().await;
                let already_granted = state
                    .resources
                    .get(resource_id)
                    .map(|entry| entry.holder.as_deref() == Some(agent_id))
                    .unwrap_or(false);
                if already_granted {
                    return Ok(());
                }
                if let Some(entry) = state.resources.get_mut(resource_id) {
                    entry.queue.retain(|w| w.agent_id != agent_id);
                }
                warn!(resource_id, agent_id, "资源等待超时");
                Err(CoordinationError::resource_lock(resource_id, "等待超时"))
            }
        }
    }

    /// 释放资源。非持有者释放返回资源锁错误；
    /// 存在等待者时原子地授予最高优先级的等待者。
    pub async fn release(&self, resource_id: &str, agent_id: &str) -> CoordinationResult<()> {
        let next_holder = {
            let mut guard = self.state.lock().await;
            let state = &mut *guard;
            let entry = state.resources.get_mut(resource_id).ok_or_else(|| {
                CoordinationError::resource_lock(resource_id, "资源不存在")
            })?;
            if entry.holder.as_deref() != Some(agent_id) {
                return Err(CoordinationError::resource_lock(
                    resource_id,
                    "释放者并未持有该资源",
                ));
            }

            entry.holder = None;
            if let Some(held) = state.agent_holdings.get_mut(agent_id) {
                held.remove(resource_id);
            }
            Self::grant_next(entry, &mut state.agent_holdings, resource_id)
        };

        debug!(resource_id, agent_id, "资源已释放");
        self.emit_released(resource_id, agent_id).await;
        if let Some(next) = next_holder {
            self.emit_acquired(resource_id, &next).await;
        }
        Ok(())
    }

    /// Agent终止/取消时释放其全部持有，避免孤儿锁。
    /// 返回被释放的资源列表。
    pub async fn release_all_for_agent(&self, agent_id: &str) -> Vec<String> {
        let (released, granted) = {
            let mut guard = self.state.lock().await;
            let state = &mut *guard;
            let held: Vec<String> = state
                .agent_holdings
                .remove(agent_id)
                .map(|set| set.into_iter().collect())
                .unwrap_or_default();

            let mut granted = Vec::new();
            for resource_id in &held {
                if let Some(entry) = state.resources.get_mut(resource_id) {
                    entry.holder = None;
                    if let Some(next) =
                        Self::grant_next(entry, &mut state.agent_holdings, resource_id)
                    {
                        granted.push((resource_id.clone(), next));
                    }
                }
            }
            (held, granted)
        };

        if !released.is_empty() {
            info!(
                agent_id,
                count = released.len(),
                "已释放该Agent持有的全部资源"
            );
        }
        for resource_id in &released {
            self.emit_released(resource_id, agent_id).await;
        }
        for (resource_id, next) in &granted {
            self.emit_acquired(resource_id, next).await;
        }
        released
    }

    /// 中止某Agent的全部挂起等待（死锁裁决、Agent终止时使用），
    /// 等待方以资源锁错误失败。返回中止的等待数。
    pub async fn cancel_pending_for_agent(&self, agent_id: &str, reason: &str) -> usize {
        let mut cancelled = 0;
        let mut state = self.state.lock().await;
        for (resource_id, entry) in state.resources.iter_mut() {
            let mut index = 0;
            while index < entry.queue.len() {
                if entry.queue[index].agent_id == agent_id {
                    let waiter = entry.queue.remove(index);
                    let _ = waiter.responder.send(Err(CoordinationError::resource_lock(
                        resource_id,
                        reason,
                    )));
                    cancelled += 1;
                } else {
                    index += 1;
                }
            }
        }
        if cancelled > 0 {
            info!(agent_id, cancelled, reason, "已中止该Agent的挂起等待");
        }
        cancelled
    }

    /// 清理超过 `resource_timeout` 的等待者，对应的 acquire 以失败告终。
    /// 兜底路径：正常情况下 acquire 自身的超时已经处理。
    pub async fn perform_maintenance(&self) -> usize {
        let mut purged = 0;
        let mut state = self.state.lock().await;
        let timeout = self.resource_timeout;
        for (resource_id, entry) in state.resources.iter_mut() {
            let mut index = 0;
            while index < entry.queue.len() {
                if entry.queue[index].enqueued_at.elapsed() > timeout {
                    let waiter = entry.queue.remove(index);
                    debug!(
                        resource_id,
                        agent_id = %waiter.agent_id,
                        "清理已超时的资源等待者"
                    );
                    let _ = waiter.responder.send(Err(CoordinationError::resource_lock(
                        resource_id,
                        "等待超时",
                    )));
                    purged += 1;
                } else {
                    index += 1;
                }
            }
        }
        // 无人持有且无人等待的资源条目一并清掉
        state
            .resources
            .retain(|_, entry| entry.holder.is_some() || !entry.queue.is_empty());
        purged
    }

    /// 当前资源分配：资源 -> 持有者
    pub async fn get_allocations(&self) -> HashMap<String, String> {
        let state = self.state.lock().await;
        state
            .resources
            .iter()
            .filter_map(|(id, entry)| entry.holder.clone().map(|holder| (id.clone(), holder)))
            .collect()
    }

    /// 当前等待情况：资源 -> 等待请求（按授予顺序）
    pub async fn get_waiting_requests(&self) -> HashMap<String, Vec<ResourceRequest>> {
        let state = self.state.lock().await;
        state
            .resources
            .iter()
            .filter(|(_, entry)| !entry.queue.is_empty())
            .map(|(id, entry)| {
                let waiting = entry
                    .queue
                    .iter()
                    .map(|w| ResourceRequest {
                        agent_id: w.agent_id.clone(),
                        priority: w.priority,
                        requested_at: w.requested_at,
                    })
                    .collect();
                (id.clone(), waiting)
            })
            .collect()
    }

    pub async fn get_status(&self, resource_id: &str) -> Option<ResourceStatus> {
        let state = self.state.lock().await;
        state.resources.get(resource_id).map(|entry| ResourceStatus {
            resource_id: resource_id.to_string(),
            holder: entry.holder.clone(),
            waiting: entry
                .queue
                .iter()
                .map(|w| ResourceRequest {
                    agent_id: w.agent_id.clone(),
                    priority: w.priority,
                    requested_at: w.requested_at,
                })
                .collect(),
        })
    }

    /// 某Agent当前持有的资源
    pub async fn held_by(&self, agent_id: &str) -> Vec<String> {
        let state = self.state.lock().await;
        let mut held: Vec<String> = state
            .agent_holdings
            .get(agent_id)
            .map(|set| set.iter().cloned().collect())
            .unwrap_or_default();
        held.sort();
        held
    }

    /// (持有中的资源数, 等待中的请求数)
    pub async fn counts(&self) -> (usize, usize) {
        let state = self.state.lock().await;
        let held = state
            .resources
            .values()
            .filter(|entry| entry.holder.is_some())
            .count();
        let waiting = state.resources.values().map(|entry| entry.queue.len()).sum();
        (held, waiting)
    }

    /// 把资源授予队首等待者；等待方已放弃时顺延。
    /// 必须在状态锁内调用。
    fn grant_next(
        entry: &mut ResourceEntry,
        agent_holdings: &mut HashMap<String, HashSet<String>>,
        resource_id: &str,
    ) -> Option<String> {
        while !entry.queue.is_empty() {
            let waiter = entry.queue.remove(0);
            let agent_id = waiter.agent_id.clone();
            entry.holder = Some(agent_id.clone());
            if waiter.responder.send(Ok(())).is_ok() {
                agent_holdings
                    .entry(agent_id.clone())
                    .or_default()
                    .insert(resource_id.to_string());
                debug!(resource_id, agent_id = %agent_id, "资源转授给队首等待者");
                return Some(agent_id);
            }
            // 等待方已超时离开，尝试下一个
            entry.holder = None;
        }
        None
    }

    async fn emit_acquired(&self, resource_id: &str, agent_id: &str) {
        let _ = self
            .event_bus
            .publish(CoordinationEvent::ResourceAcquired {
                resource_id: resource_id.to_string(),
                agent_id: agent_id.to_string(),
                occurred_at: Utc::now(),
            })
            .await;
    }

    async fn emit_released(&self, resource_id: &str, agent_id: &str) {
        let _ = self
            .event_bus
            .publish(CoordinationEvent::ResourceReleased {
                resource_id: resource_id.to_string(),
                agent_id: agent_id.to_string(),
                occurred_at: Utc::now(),
            })
            .await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::mocks::RecordingEventBus;

    fn manager(timeout_ms: u64) -> (Arc<ResourceManager>, Arc<RecordingEventBus>) {
        let bus = Arc::new(RecordingEventBus::new());
        let manager = Arc::new(ResourceManager::new(
            Duration::from_millis(timeout_ms),
            bus.clone(),
        ));
        (manager, bus)
    }

    #[tokio::test]
    async fn test_acquire_free_resource_grants_immediately() {
        let (manager, bus) = manager(1000);

        manager.acquire("r1", "agent-1", 0).await.expect("acquire");

        let allocations = manager.get_allocations().await;
        assert_eq!(allocations.get("r1"), Some(&"agent-1".to_string()));
        assert_eq!(bus.count_of("resource:acquired").await, 1);
    }

    #[tokio::test]
    async fn test_holder_reacquire_is_idempotent() {
        let (manager, _) = manager(1000);
        manager.acquire("r1", "agent-1", 0).await.expect("first");
        manager.acquire("r1", "agent-1", 0).await.expect("second");

        let status = manager.get_status("r1").await.expect("status");
        assert!(status.waiting.is_empty());
    }

    #[tokio::test]
    async fn test_release_by_non_holder_fails() {
        let (manager, _) = manager(1000);
        manager.acquire("r1", "agent-1", 0).await.expect("acquire");

        let result = manager.release("r1", "agent-2").await;
        assert!(matches!(
            result,
            Err(CoordinationError::ResourceLock { .. })
        ));

        let result = manager.release("missing", "agent-1").await;
        assert!(matches!(
            result,
            Err(CoordinationError::ResourceLock { .. })
        ));
    }

    #[tokio::test]
    async fn test_acquire_timeout() {
        let (manager, _) = manager(50);
        manager.acquire("r1", "agent-1", 0).await.expect("acquire");

        let result = manager.acquire("r1", "agent-2", 0).await;
        assert!(matches!(
            result,
            Err(CoordinationError::ResourceLock { .. })
        ));

        // 超时后等待队列应当已被清空
        let status = manager.get_status("r1").await.expect("status");
        assert!(status.waiting.is_empty());
    }

    #[tokio::test]
    async fn test_waiters_granted_in_priority_then_fifo_order() {
        let (manager, _) = manager(2000);
        manager.acquire("r1", "holder", 0).await.expect("acquire");

        // 两个优先级5的请求先到，再来一个优先级10的
        let low_first = tokio::spawn({
            let manager = manager.clone();
            async move { manager.acquire("r1", "low-first", 5).await }
        });
        tokio::time::sleep(Duration::from_millis(20)).await;
        let low_second = tokio::spawn({
            let manager = manager.clone();
            async move { manager.acquire("r1", "low-second", 5).await }
        });
        tokio::time::sleep(Duration::from_millis(20)).await;
        let high = tokio::spawn({
            let manager = manager.clone();
            async move { manager.acquire("r1", "high", 10).await }
        });
        tokio::time::sleep(Duration::from_millis(20)).await;

        let waiting = manager.get_waiting_requests().await;
        let order: Vec<&str> = waiting["r1"].iter().map(|r| r.agent_id.as_str()).collect();
        assert_eq!(order, vec!["high", "low-first", "low-second"]);

        // 依次释放，授予顺序应为 high -> low-first -> low-second
        manager.release("r1", "holder").await.expect("release");
        high.await.expect("join").expect("high granted");
        assert_eq!(
            manager.get_allocations().await.get("r1"),
            Some(&"high".to_string())
        );

        manager.release("r1", "high").await.expect("release");
        low_first.await.expect("join").expect("low-first granted");
        assert_eq!(
            manager.get_allocations().await.get("r1"),
            Some(&"low-first".to_string())
        );

        manager.release("r1", "low-first").await.expect("release");
        low_second.await.expect("join").expect("low-second granted");
    }

    #[tokio::test]
    async fn test_duplicate_wait_entry_rejected() {
        let (manager, _) = manager(500);
        manager.acquire("r1", "holder", 0).await.expect("acquire");

        let waiting = tokio::spawn({
            let manager = manager.clone();
            async move { manager.acquire("r1", "agent-2", 0).await }
        });
        tokio::time::sleep(Duration::from_millis(20)).await;

        // 同一Agent重复排队被拒绝
        let duplicate = manager.acquire("r1", "agent-2", 0).await;
        assert!(matches!(
            duplicate,
            Err(CoordinationError::ResourceLock { .. })
        ));

        manager.release("r1", "holder").await.expect("release");
        waiting.await.expect("join").expect("granted");
    }

    #[tokio::test]
    async fn test_release_all_for_agent() {
        let (manager, _) = manager(1000);
        manager.acquire("r1", "agent-1", 0).await.expect("r1");
        manager.acquire("r2", "agent-1", 0).await.expect("r2");

        let waiting = tokio::spawn({
            let manager = manager.clone();
            async move { manager.acquire("r1", "agent-2", 0).await }
        });
        tokio::time::sleep(Duration::from_millis(20)).await;

        let mut released = manager.release_all_for_agent("agent-1").await;
        released.sort();
        assert_eq!(released, vec!["r1".to_string(), "r2".to_string()]);

        // 等待者接手 r1
        waiting.await.expect("join").expect("granted");
        assert_eq!(
            manager.get_allocations().await.get("r1"),
            Some(&"agent-2".to_string())
        );
        assert_eq!(manager.held_by("agent-1").await, Vec::<String>::new());
    }

    #[tokio::test]
    async fn test_cancel_pending_for_agent() {
        let (manager, _) = manager(5000);
        manager.acquire("r1", "holder", 0).await.expect("acquire");

        let waiting = tokio::spawn({
            let manager = manager.clone();
            async move { manager.acquire("r1", "victim", 3).await }
        });
        tokio::time::sleep(Duration::from_millis(20)).await;

        let cancelled = manager.cancel_pending_for_agent("victim", "死锁裁决").await;
        assert_eq!(cancelled, 1);

        let result = waiting.await.expect("join");
        assert!(matches!(
            result,
            Err(CoordinationError::ResourceLock { .. })
        ));
    }

    #[tokio::test]
    async fn test_maintenance_prunes_idle_entries() {
        let (manager, _) = manager(1000);
        manager.acquire("r1", "agent-1", 0).await.expect("acquire");
        manager.release("r1", "agent-1").await.expect("release");

        manager.perform_maintenance().await;
        assert!(manager.get_status("r1").await.is_none());
    }
}
