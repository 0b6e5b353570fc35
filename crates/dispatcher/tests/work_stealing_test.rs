use std::sync::Arc;

use coordinator_core::config::CoordinationConfig;
use coordinator_core::traits::TaskSchedulerService;
use coordinator_dispatcher::CoordinationManager;
use coordinator_testing_utils::{
    AgentProfileBuilder, AgentWorkloadBuilder, EchoMessageRouter, RecordingEventBus, TaskBuilder,
};

fn stealing_config() -> CoordinationConfig {
    let mut config = CoordinationConfig::default();
    config.deadlock_detection = false;
    config.work_stealing.enabled = true;
    config.work_stealing.steal_threshold = 1.5;
    config.work_stealing.max_steal_batch = 3;
    config
}

fn build_manager(config: CoordinationConfig) -> (Arc<CoordinationManager>, Arc<RecordingEventBus>) {
    let bus = Arc::new(RecordingEventBus::new());
    let router = Arc::new(EchoMessageRouter::new());
    let manager =
        Arc::new(CoordinationManager::new(config, bus.clone(), router).expect("valid config"));
    (manager, bus)
}

/// a 有 10 个任务、b 有 1 个，阈值 1.5：一个窃取周期至少迁移一个
/// 任务到 b，且不超过 max_steal_batch。
#[tokio::test]
async fn test_steal_cycle_moves_tasks_to_underloaded_agent() {
    let (manager, bus) = build_manager(stealing_config());
    manager
        .register_agent(AgentProfileBuilder::new("agent-a").build())
        .await;
    manager
        .register_agent(AgentProfileBuilder::new("agent-b").build())
        .await;

    for index in 0..10 {
        manager
            .assign_task(
                TaskBuilder::new(&format!("task-{index}")).build(),
                Some("agent-a"),
            )
            .await
            .expect("assign to a");
    }
    manager
        .assign_task(TaskBuilder::new("task-b").build(), Some("agent-b"))
        .await
        .expect("assign to b");

    manager
        .update_agent_workload(AgentWorkloadBuilder::new("agent-a").with_task_count(10).build())
        .await;
    manager
        .update_agent_workload(AgentWorkloadBuilder::new("agent-b").with_task_count(1).build())
        .await;

    manager.run_work_stealing_cycle().await;

    let scheduler = manager.scheduler().await;
    let moved_to_b = scheduler.get_agent_tasks("agent-b").await.len() - 1;
    assert!(moved_to_b >= 1, "至少迁移一个任务");
    assert!(moved_to_b <= 3, "不超过批次上限");
    assert_eq!(
        scheduler.get_agent_tasks("agent-a").await.len(),
        10 - moved_to_b
    );
    assert_eq!(bus.count_of("workload:rebalanced").await, 1);

    // 负载快照同步，紧接着的周期不会把任务再偷回去
    let workload_a = manager
        .work_stealing()
        .get_workload("agent-a")
        .await
        .expect("a");
    assert_eq!(workload_a.task_count, 10 - moved_to_b);
}

/// 接收方缺少任务要求的能力时不迁移
#[tokio::test]
async fn test_steal_skips_tasks_recipient_cannot_run() {
    let (manager, bus) = build_manager(stealing_config());
    manager
        .register_agent(
            AgentProfileBuilder::new("agent-a")
                .with_capabilities(&["shell", "gpu"])
                .build(),
        )
        .await;
    manager
        .register_agent(
            AgentProfileBuilder::new("agent-b")
                .with_capabilities(&["shell"])
                .build(),
        )
        .await;

    for index in 0..8 {
        manager
            .assign_task(
                TaskBuilder::new(&format!("gpu-task-{index}"))
                    .with_capabilities(&["gpu"])
                    .build(),
                Some("agent-a"),
            )
            .await
            .expect("assign");
    }
    manager
        .update_agent_workload(AgentWorkloadBuilder::new("agent-a").with_task_count(8).build())
        .await;
    manager
        .update_agent_workload(AgentWorkloadBuilder::new("agent-b").with_task_count(0).build())
        .await;

    manager.run_work_stealing_cycle().await;

    let scheduler = manager.scheduler().await;
    assert_eq!(scheduler.get_agent_tasks("agent-b").await.len(), 0);
    assert_eq!(bus.count_of("workload:rebalanced").await, 0);
}

/// 已上报进度的任务不参与迁移
#[tokio::test]
async fn test_steal_prefers_unstarted_tasks() {
    let (manager, _) = build_manager(stealing_config());
    manager
        .register_agent(AgentProfileBuilder::new("agent-a").build())
        .await;
    manager
        .register_agent(AgentProfileBuilder::new("agent-b").build())
        .await;

    for index in 0..6 {
        manager
            .assign_task(
                TaskBuilder::new(&format!("task-{index}")).build(),
                Some("agent-a"),
            )
            .await
            .expect("assign");
    }
    // 前4个已经在执行中
    for index in 0..4 {
        manager
            .update_task_progress(&format!("task-{index}"), 50)
            .await
            .expect("progress");
    }
    manager
        .update_agent_workload(AgentWorkloadBuilder::new("agent-a").with_task_count(6).build())
        .await;
    manager
        .update_agent_workload(AgentWorkloadBuilder::new("agent-b").with_task_count(0).build())
        .await;

    manager.run_work_stealing_cycle().await;

    let scheduler = manager.scheduler().await;
    let moved: Vec<String> = scheduler
        .get_agent_tasks("agent-b")
        .await
        .iter()
        .map(|s| s.task.id.clone())
        .collect();
    // 只有未上报进度的 task-4 / task-5 可被迁移
    assert!(!moved.is_empty());
    assert!(moved.iter().all(|id| id == "task-4" || id == "task-5"));
}
