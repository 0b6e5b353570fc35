use std::sync::atomic::{AtomicU64, Ordering};

use async_trait::async_trait;
use tokio::sync::broadcast;
use tracing::trace;

use coordinator_domain::events::CoordinationEvent;
use coordinator_domain::ports::EventBus;
use coordinator_errors::CoordinationResult;

/// 内存事件总线
///
/// 基于 Tokio broadcast channel 的事件总线实现，适用于嵌入式部署场景。
/// 没有订阅者时事件直接丢弃，不视为错误。
#[derive(Debug)]
pub struct InMemoryEventBus {
    sender: broadcast::Sender<CoordinationEvent>,
    published: AtomicU64,
    dropped: AtomicU64,
}

impl InMemoryEventBus {
    /// 创建事件总线，`capacity` 为每个订阅者的滞后缓冲大小
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self {
            sender,
            published: AtomicU64::new(0),
            dropped: AtomicU64::new(0),
        }
    }

    /// 已发布事件总数
    pub fn published_count(&self) -> u64 {
        self.published.load(Ordering::Relaxed)
    }

    /// 因无订阅者被丢弃的事件总数
    pub fn dropped_count(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }

    /// 当前订阅者数量
    pub fn subscriber_count(&self) -> usize {
        self.sender.receiver_count()
    }
}

impl Default for InMemoryEventBus {
    fn default() -> Self {
        Self::new(1024)
    }
}

#[async_trait]
impl EventBus for InMemoryEventBus {
    async fn publish(&self, event: CoordinationEvent) -> CoordinationResult<()> {
        trace!(event_type = event.event_type(), "发布协调事件");
        self.published.fetch_add(1, Ordering::Relaxed);
        if self.sender.send(event).is_err() {
            // broadcast 在无接收者时返回错误，事件丢弃但发布方不受影响
            self.dropped.fetch_add(1, Ordering::Relaxed);
        }
        Ok(())
    }

    fn subscribe(&self) -> broadcast::Receiver<CoordinationEvent> {
        self.sender.subscribe()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    #[tokio::test]
    async fn test_publish_and_subscribe() {
        let bus = InMemoryEventBus::default();
        let mut receiver = bus.subscribe();

        bus.publish(CoordinationEvent::TaskAssigned {
            task_id: "task-1".to_string(),
            agent_id: "agent-1".to_string(),
            occurred_at: Utc::now(),
        })
        .await
        .expect("publish");

        let event = receiver.recv().await.expect("receive");
        assert_eq!(event.event_type(), "task:assigned");
        assert_eq!(bus.published_count(), 1);
        assert_eq!(bus.dropped_count(), 0);
    }

    #[tokio::test]
    async fn test_publish_without_subscribers_is_ok() {
        let bus = InMemoryEventBus::default();

        let result = bus
            .publish(CoordinationEvent::CircuitOpened {
                name: "llm".to_string(),
                occurred_at: Utc::now(),
            })
            .await;

        assert!(result.is_ok());
        assert_eq!(bus.dropped_count(), 1);
    }

    #[tokio::test]
    async fn test_multiple_subscribers_each_receive() {
        let bus = InMemoryEventBus::default();
        let mut first = bus.subscribe();
        let mut second = bus.subscribe();
        assert_eq!(bus.subscriber_count(), 2);

        bus.publish(CoordinationEvent::ResourceReleased {
            resource_id: "r1".to_string(),
            agent_id: "agent-1".to_string(),
            occurred_at: Utc::now(),
        })
        .await
        .expect("publish");

        assert_eq!(
            first.recv().await.expect("first").event_type(),
            "resource:released"
        );
        assert_eq!(
            second.recv().await.expect("second").event_type(),
            "resource:released"
        );
    }
}
