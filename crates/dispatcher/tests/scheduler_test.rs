use std::sync::Arc;
use std::time::Duration;

use coordinator_core::config::RetryConfig;
use coordinator_core::traits::TaskSchedulerService;
use coordinator_dispatcher::TaskScheduler;
use coordinator_domain::models::TaskStatus;
use coordinator_errors::CoordinationError;
use coordinator_testing_utils::{AgentProfileBuilder, RecordingEventBus, TaskBuilder};

fn fast_retry_config() -> RetryConfig {
    RetryConfig {
        max_retries: 3,
        retry_delay_ms: 20,
        max_retry_delay_ms: 100,
        jitter_factor: 0.0,
    }
}

fn scheduler() -> (Arc<TaskScheduler>, Arc<RecordingEventBus>) {
    let bus = Arc::new(RecordingEventBus::new());
    let scheduler = Arc::new(TaskScheduler::new(fast_retry_config(), 300_000, bus.clone()));
    (scheduler, bus)
}

async fn status_of(scheduler: &TaskScheduler, task_id: &str) -> TaskStatus {
    scheduler
        .get_task(task_id)
        .await
        .expect("task exists")
        .task
        .status
}

#[tokio::test]
async fn test_task_without_dependencies_starts_immediately() {
    let (scheduler, bus) = scheduler();

    scheduler
        .assign_task(TaskBuilder::new("a").build(), "agent-1")
        .await
        .expect("assign");

    assert_eq!(status_of(&scheduler, "a").await, TaskStatus::Running);
    assert_eq!(bus.count_of("task:assigned").await, 1);
}

#[tokio::test]
async fn test_dependent_never_runs_before_dependency_completes() {
    let (scheduler, _) = scheduler();

    scheduler
        .assign_task(TaskBuilder::new("a").build(), "agent-1")
        .await
        .expect("assign a");
    scheduler
        .assign_task(
            TaskBuilder::new("b").with_dependencies(&["a"]).build(),
            "agent-2",
        )
        .await
        .expect("assign b");

    // 依赖未完成之前 b 必须保持 pending
    assert_eq!(status_of(&scheduler, "b").await, TaskStatus::Pending);
    assert!(scheduler.get_agent_tasks("agent-2").await[0].task.status == TaskStatus::Pending);

    scheduler.complete_task("a", None).await.expect("complete a");

    assert_eq!(status_of(&scheduler, "a").await, TaskStatus::Completed);
    assert_eq!(status_of(&scheduler, "b").await, TaskStatus::Running);
}

#[tokio::test]
async fn test_duplicate_task_id_rejected() {
    let (scheduler, _) = scheduler();

    scheduler
        .assign_task(TaskBuilder::new("a").build(), "agent-1")
        .await
        .expect("assign");
    let result = scheduler
        .assign_task(TaskBuilder::new("a").build(), "agent-2")
        .await;

    assert!(matches!(
        result,
        Err(CoordinationError::TaskAlreadyScheduled { .. })
    ));
}

#[tokio::test]
async fn test_cyclic_dependency_rejected_on_insert() {
    let (scheduler, _) = scheduler();

    scheduler
        .assign_task(
            TaskBuilder::new("a").with_dependencies(&["b"]).build(),
            "agent-1",
        )
        .await
        .expect("assign a");
    let result = scheduler
        .assign_task(
            TaskBuilder::new("b").with_dependencies(&["a"]).build(),
            "agent-1",
        )
        .await;

    assert!(matches!(
        result,
        Err(CoordinationError::TaskDependency { .. })
    ));
    // 被拒绝的任务不应该留下任何登记
    assert!(scheduler.get_task("b").await.is_none());
}

#[tokio::test]
async fn test_complete_task_is_idempotent() {
    let (scheduler, bus) = scheduler();

    scheduler
        .assign_task(TaskBuilder::new("a").build(), "agent-1")
        .await
        .expect("assign a");
    scheduler
        .assign_task(
            TaskBuilder::new("b").with_dependencies(&["a"]).build(),
            "agent-1",
        )
        .await
        .expect("assign b");

    scheduler.complete_task("a", None).await.expect("first");
    scheduler.complete_task("a", None).await.expect("second");

    // 第二次完成是空操作：b 只被解锁（指派）一次
    let assigned_to_b = bus
        .events()
        .await
        .iter()
        .filter(|event| {
            matches!(
                event,
                coordinator_domain::events::CoordinationEvent::TaskAssigned { task_id, .. }
                    if task_id == "b"
            )
        })
        .count();
    assert_eq!(assigned_to_b, 1);
    assert_eq!(bus.count_of("task:completed").await, 1);
}

#[tokio::test]
async fn test_retryable_failure_requeues_with_backoff() {
    let (scheduler, bus) = scheduler();

    scheduler
        .assign_task(TaskBuilder::new("a").build(), "agent-1")
        .await
        .expect("assign");
    scheduler
        .fail_task("a", CoordinationError::Timeout("网络抖动".to_string()))
        .await
        .expect("fail");

    let scheduled = scheduler.get_task("a").await.expect("task");
    assert_eq!(scheduled.task.status, TaskStatus::Ready);
    assert_eq!(scheduled.attempts, 1);
    assert!(scheduled.next_retry_at.is_some());
    assert_eq!(bus.count_of("task:retried").await, 1);

    // 重试窗口过后任务自动回到running
    tokio::time::sleep(Duration::from_millis(120)).await;
    assert_eq!(status_of(&scheduler, "a").await, TaskStatus::Running);
}

#[tokio::test]
async fn test_exhausted_retries_fail_terminally() {
    let (scheduler, bus) = scheduler();

    scheduler
        .assign_task(TaskBuilder::new("a").build(), "agent-1")
        .await
        .expect("assign");

    for _ in 0..3 {
        scheduler
            .fail_task("a", CoordinationError::Timeout("还是不行".to_string()))
            .await
            .expect("fail");
        tokio::time::sleep(Duration::from_millis(150)).await;
    }

    assert_eq!(status_of(&scheduler, "a").await, TaskStatus::Failed);
    assert_eq!(bus.count_of("task:failed").await, 1);
}

#[tokio::test]
async fn test_non_retryable_failure_cascades_cancellation() {
    let (scheduler, bus) = scheduler();

    scheduler
        .assign_task(TaskBuilder::new("a").build(), "agent-1")
        .await
        .expect("assign a");
    scheduler
        .assign_task(
            TaskBuilder::new("b").with_dependencies(&["a"]).build(),
            "agent-1",
        )
        .await
        .expect("assign b");
    scheduler
        .assign_task(
            TaskBuilder::new("c").with_dependencies(&["b"]).build(),
            "agent-2",
        )
        .await
        .expect("assign c");

    scheduler
        .fail_task("a", CoordinationError::internal("不可恢复"))
        .await
        .expect("fail");

    assert_eq!(status_of(&scheduler, "a").await, TaskStatus::Failed);
    assert_eq!(status_of(&scheduler, "b").await, TaskStatus::Cancelled);
    assert_eq!(status_of(&scheduler, "c").await, TaskStatus::Cancelled);
    assert_eq!(bus.count_of("task:failed").await, 1);
    assert_eq!(bus.count_of("task:cancelled").await, 2);
}

#[tokio::test]
async fn test_circuit_rejection_does_not_consume_attempt() {
    let (scheduler, bus) = scheduler();

    scheduler
        .assign_task(TaskBuilder::new("a").build(), "agent-1")
        .await
        .expect("assign");
    scheduler
        .fail_task(
            "a",
            CoordinationError::CircuitBreakerOpen {
                name: "terminal".to_string(),
            },
        )
        .await
        .expect("fail");

    let scheduled = scheduler.get_task("a").await.expect("task");
    // 熔断快速失败不计入重试次数
    assert_eq!(scheduled.attempts, 0);
    assert_eq!(scheduled.task.status, TaskStatus::Ready);
    assert_eq!(bus.count_of("task:retried").await, 1);
}

#[tokio::test]
async fn test_cancel_task_cascades_to_dependents() {
    let (scheduler, _) = scheduler();

    scheduler
        .assign_task(TaskBuilder::new("a").build(), "agent-1")
        .await
        .expect("assign a");
    scheduler
        .assign_task(
            TaskBuilder::new("b").with_dependencies(&["a"]).build(),
            "agent-1",
        )
        .await
        .expect("assign b");

    scheduler.cancel_task("a", "人工取消").await.expect("cancel");

    assert_eq!(status_of(&scheduler, "a").await, TaskStatus::Cancelled);
    assert_eq!(status_of(&scheduler, "b").await, TaskStatus::Cancelled);

    // 终态任务的重复取消是空操作
    scheduler.cancel_task("a", "再次取消").await.expect("noop");
}

#[tokio::test]
async fn test_cancel_agent_tasks() {
    let (scheduler, _) = scheduler();

    scheduler
        .assign_task(TaskBuilder::new("a").build(), "agent-1")
        .await
        .expect("assign");
    scheduler
        .assign_task(TaskBuilder::new("b").build(), "agent-1")
        .await
        .expect("assign");
    scheduler
        .assign_task(TaskBuilder::new("c").build(), "agent-2")
        .await
        .expect("assign");

    let cancelled = scheduler.cancel_agent_tasks("agent-1").await.expect("cancel");
    assert_eq!(cancelled, 2);
    assert_eq!(status_of(&scheduler, "a").await, TaskStatus::Cancelled);
    assert_eq!(status_of(&scheduler, "b").await, TaskStatus::Cancelled);
    assert_eq!(status_of(&scheduler, "c").await, TaskStatus::Running);
}

#[tokio::test]
async fn test_reschedule_agent_tasks_preserves_dependency_state() {
    let (scheduler, _) = scheduler();

    scheduler
        .assign_task(TaskBuilder::new("a").build(), "agent-1")
        .await
        .expect("assign a");
    scheduler
        .assign_task(
            TaskBuilder::new("b").with_dependencies(&["a"]).build(),
            "agent-1",
        )
        .await
        .expect("assign b");

    let candidates = vec![AgentProfileBuilder::new("agent-2").build()];
    let moved = scheduler
        .reschedule_agent_tasks("agent-1", &candidates)
        .await
        .expect("reschedule");
    assert_eq!(moved.len(), 2);
    assert!(moved.iter().all(|(_, agent)| agent == "agent-2"));

    // 依赖状态不丢：b 仍然要等 a 完成
    assert_eq!(status_of(&scheduler, "b").await, TaskStatus::Pending);
    scheduler.complete_task("a", None).await.expect("complete");
    assert_eq!(status_of(&scheduler, "b").await, TaskStatus::Running);
}

#[tokio::test]
async fn test_scheduler_metrics() {
    let (scheduler, _) = scheduler();

    scheduler
        .assign_task(TaskBuilder::new("a").build(), "agent-1")
        .await
        .expect("assign");
    scheduler
        .assign_task(
            TaskBuilder::new("b").with_dependencies(&["a"]).build(),
            "agent-1",
        )
        .await
        .expect("assign");
    scheduler.complete_task("a", None).await.expect("complete");

    let metrics = scheduler.metrics().await;
    assert_eq!(metrics.total_tasks, 2);
    assert_eq!(metrics.completed_tasks, 1);
    assert_eq!(metrics.running_tasks, 1);
    assert_eq!(metrics.agent_task_counts.get("agent-1"), Some(&1));
}

#[tokio::test]
async fn test_maintenance_purges_terminal_tasks() {
    let bus = Arc::new(RecordingEventBus::new());
    // 保留窗口为0，终态任务在下一次维护即被清理
    let scheduler = Arc::new(TaskScheduler::new(fast_retry_config(), 0, bus));

    scheduler
        .assign_task(TaskBuilder::new("a").build(), "agent-1")
        .await
        .expect("assign");
    scheduler.complete_task("a", None).await.expect("complete");
    tokio::time::sleep(Duration::from_millis(10)).await;

    scheduler.perform_maintenance().await.expect("maintenance");
    assert!(scheduler.get_task("a").await.is_none());
}
