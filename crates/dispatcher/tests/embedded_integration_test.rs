//! 嵌入式部署形态的端到端测试：
//! 协调管理器 + 内存事件总线 + 内存消息路由

use std::sync::Arc;
use std::time::Duration;

use coordinator_core::config::CoordinationConfig;
use coordinator_dispatcher::CoordinationManager;
use coordinator_domain::events::CoordinationEvent;
use coordinator_domain::models::AgentMessage;
use coordinator_domain::EventBus;
use coordinator_infrastructure::{InMemoryEventBus, InMemoryMessageRouter};
use coordinator_testing_utils::{AgentProfileBuilder, TaskBuilder};

fn embedded_manager() -> (
    Arc<CoordinationManager>,
    Arc<InMemoryEventBus>,
    Arc<InMemoryMessageRouter>,
) {
    let mut config = CoordinationConfig::default();
    config.deadlock_detection = false;
    config.work_stealing.enabled = false;
    config.message_timeout_ms = 500;

    let bus = Arc::new(InMemoryEventBus::default());
    let router = Arc::new(InMemoryMessageRouter::new());
    let manager = Arc::new(
        CoordinationManager::new(config, bus.clone(), router.clone()).expect("valid config"),
    );
    (manager, bus, router)
}

#[tokio::test]
async fn test_task_lifecycle_events_reach_subscribers() {
    let (manager, bus, _) = embedded_manager();
    let mut events = bus.subscribe();

    manager
        .register_agent(AgentProfileBuilder::new("agent-1").build())
        .await;
    manager
        .assign_task(TaskBuilder::new("task-1").build(), Some("agent-1"))
        .await
        .expect("assign");
    manager
        .complete_task("task-1", Some(serde_json::json!({"lines": 42})))
        .await
        .expect("complete");

    let mut seen = Vec::new();
    while let Ok(Ok(event)) =
        tokio::time::timeout(Duration::from_millis(200), events.recv()).await
    {
        seen.push(event.event_type().to_string());
        if seen.len() == 2 {
            break;
        }
    }
    assert_eq!(seen, vec!["task:assigned", "task:completed"]);
    assert!(bus.published_count() >= 2);
}

#[tokio::test]
async fn test_resource_events_reach_subscribers() {
    let (manager, bus, _) = embedded_manager();
    let mut events = bus.subscribe();

    manager
        .register_agent(AgentProfileBuilder::new("agent-1").build())
        .await;
    manager
        .acquire_resource("file:/tmp/shared", "agent-1")
        .await
        .expect("acquire");
    manager
        .release_resource("file:/tmp/shared", "agent-1")
        .await
        .expect("release");

    let first = tokio::time::timeout(Duration::from_millis(200), events.recv())
        .await
        .expect("event")
        .expect("recv");
    assert_eq!(first.event_type(), "resource:acquired");
    match first {
        CoordinationEvent::ResourceAcquired {
            resource_id,
            agent_id,
            ..
        } => {
            assert_eq!(resource_id, "file:/tmp/shared");
            assert_eq!(agent_id, "agent-1");
        }
        other => panic!("意外的事件: {}", other.event_type()),
    }

    let second = tokio::time::timeout(Duration::from_millis(200), events.recv())
        .await
        .expect("event")
        .expect("recv");
    assert_eq!(second.event_type(), "resource:released");
}

#[tokio::test]
async fn test_message_roundtrip_through_router() {
    let (manager, _, router) = embedded_manager();

    // Agent侧：收到请求后回发应答
    let responder = router.clone();
    tokio::spawn(async move {
        loop {
            if let Some(incoming) = responder.try_receive("agent-1").await {
                let response =
                    AgentMessage::response_to(&incoming, serde_json::json!({"status": "ok"}));
                responder.deliver_response(response).await.expect("respond");
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    });

    let request = AgentMessage::new("coordinator", "agent-1", "health", serde_json::json!({}));
    let response = manager.send_with_response(request).await.expect("response");
    assert_eq!(response.payload["status"], "ok");
}

#[tokio::test]
async fn test_message_timeout_without_responder() {
    let (manager, _, _) = embedded_manager();

    let request = AgentMessage::new("coordinator", "agent-9", "health", serde_json::json!({}));
    let result = manager.send_with_response(request).await;
    assert!(result.is_err());
}
