use std::sync::Arc;
use std::time::Duration;

use coordinator_core::circuit_breaker::{CircuitBreakerManager, CircuitState};
use coordinator_core::config::{CircuitBreakerConfig, RetryConfig, WorkStealingConfig};
use coordinator_core::traits::TaskSchedulerService;
use coordinator_dispatcher::{AdvancedTaskScheduler, WorkStealingCoordinator};
use coordinator_errors::CoordinationError;
use coordinator_testing_utils::{AgentProfileBuilder, RecordingEventBus, TaskBuilder};

fn build_scheduler() -> (Arc<AdvancedTaskScheduler>, Arc<RecordingEventBus>) {
    let bus = Arc::new(RecordingEventBus::new());
    let work_stealing = Arc::new(WorkStealingCoordinator::new(WorkStealingConfig::default()));
    let breakers = Arc::new(CircuitBreakerManager::with_event_bus(
        CircuitBreakerConfig {
            failure_threshold: 2,
            success_threshold: 1,
            timeout: Duration::from_millis(100),
            half_open_limit: 1,
        },
        bus.clone(),
    ));
    let scheduler = Arc::new(AdvancedTaskScheduler::new(
        RetryConfig {
            max_retries: 2,
            retry_delay_ms: 10,
            max_retry_delay_ms: 50,
            jitter_factor: 0.0,
        },
        300_000,
        bus.clone(),
        work_stealing,
        breakers,
    ));
    (scheduler, bus)
}

#[tokio::test]
async fn test_default_strategy_is_capability() {
    let (scheduler, _) = build_scheduler();
    assert_eq!(scheduler.default_strategy_name().await, "capability");

    let candidates = vec![
        AgentProfileBuilder::new("b").build(),
        AgentProfileBuilder::new("a").build(),
        AgentProfileBuilder::new("c").with_capabilities(&["gpu"]).build(),
    ];
    // 负载相同时按字典序
    let chosen = scheduler
        .schedule(
            TaskBuilder::new("t1").with_capabilities(&["shell"]).build(),
            &candidates,
        )
        .await
        .expect("schedule");
    assert_eq!(chosen, "a");
}

#[tokio::test]
async fn test_switch_default_strategy_to_round_robin() {
    let (scheduler, _) = build_scheduler();
    scheduler
        .set_default_strategy("round-robin")
        .await
        .expect("switch");

    let candidates = vec![
        AgentProfileBuilder::new("a").build(),
        AgentProfileBuilder::new("b").build(),
    ];
    let first = scheduler
        .schedule(TaskBuilder::new("t1").build(), &candidates)
        .await
        .expect("schedule");
    let second = scheduler
        .schedule(TaskBuilder::new("t2").build(), &candidates)
        .await
        .expect("schedule");
    assert_eq!(first, "a");
    assert_eq!(second, "b");
}

#[tokio::test]
async fn test_unknown_strategy_rejected() {
    let (scheduler, _) = build_scheduler();
    let result = scheduler.set_default_strategy("fancy").await;
    assert!(matches!(result, Err(CoordinationError::Configuration(_))));

    let result = scheduler
        .schedule_with_strategy(
            TaskBuilder::new("t1").build(),
            &[AgentProfileBuilder::new("a").build()],
            "fancy",
        )
        .await;
    assert!(matches!(result, Err(CoordinationError::Configuration(_))));
}

#[tokio::test]
async fn test_stats_drive_affinity_strategy() {
    let (scheduler, _) = build_scheduler();
    let candidates = vec![
        AgentProfileBuilder::new("a").build(),
        AgentProfileBuilder::new("b").build(),
    ];

    // 在 b 上完成一个 review 类型任务，建立亲和历史
    scheduler
        .assign_task(
            TaskBuilder::new("t1").with_type("review").build(),
            "b",
        )
        .await
        .expect("assign");
    scheduler.complete_task("t1", None).await.expect("complete");

    let stats = scheduler.task_stats().await;
    let review_stats = stats.get("review").expect("stats recorded");
    assert_eq!(review_stats.executions, 1);
    assert_eq!(review_stats.successes, 1);
    assert_eq!(review_stats.last_agent.as_deref(), Some("b"));

    let chosen = scheduler
        .schedule_with_strategy(
            TaskBuilder::new("t2").with_type("review").build(),
            &candidates,
            "affinity",
        )
        .await
        .expect("schedule");
    assert_eq!(chosen, "b");
}

#[tokio::test]
async fn test_terminal_failure_recorded_in_stats() {
    let (scheduler, _) = build_scheduler();

    scheduler
        .assign_task(TaskBuilder::new("t1").with_type("deploy").build(), "a")
        .await
        .expect("assign");
    // internal 错误不可重试，直接进入终态失败
    scheduler
        .fail_task("t1", CoordinationError::internal("部署脚本崩溃"))
        .await
        .expect("fail");

    let stats = scheduler.task_stats().await;
    let deploy_stats = stats.get("deploy").expect("stats recorded");
    assert_eq!(deploy_stats.failures, 1);
    assert_eq!(deploy_stats.executions, 1);
    assert!(deploy_stats.success_rate() < 1.0);
}

#[tokio::test]
async fn test_execute_protected_trips_breaker() {
    let (scheduler, bus) = build_scheduler();

    for _ in 0..2 {
        let result: Result<(), _> = scheduler
            .execute_protected("terminal", || async {
                Err(CoordinationError::Timeout("工具挂了".to_string()))
            })
            .await;
        assert!(result.is_err());
    }

    // 连续失败达到阈值，熔断器打开并发布事件
    assert_eq!(
        scheduler.circuit_breakers().get_state("terminal").await,
        Some(CircuitState::Open)
    );
    assert_eq!(bus.count_of("circuit:opened").await, 1);

    // 打开状态下快速拒绝，不再调用被保护的操作
    let result: Result<(), _> = scheduler
        .execute_protected("terminal", || async { Ok(()) })
        .await;
    assert!(matches!(
        result,
        Err(CoordinationError::CircuitBreakerOpen { .. })
    ));
}

#[tokio::test]
async fn test_retry_then_terminal_failure_counts_once() {
    let (scheduler, bus) = build_scheduler();

    scheduler
        .assign_task(TaskBuilder::new("t1").with_type("shell").build(), "a")
        .await
        .expect("assign");

    // 第一次可重试失败 -> 排队重试，不计入统计
    scheduler
        .fail_task("t1", CoordinationError::Timeout("抖动".to_string()))
        .await
        .expect("fail");
    assert!(scheduler.task_stats().await.get("shell").is_none());
    tokio::time::sleep(Duration::from_millis(50)).await;

    // 第二次失败超出 max_retries=1 -> 终态，计入统计
    scheduler
        .fail_task("t1", CoordinationError::Timeout("还是抖".to_string()))
        .await
        .expect("fail");
    let stats = scheduler.task_stats().await;
    assert_eq!(stats.get("shell").expect("stats").failures, 1);
    assert_eq!(bus.count_of("task:failed").await, 1);
}
