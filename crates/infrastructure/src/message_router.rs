use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::{mpsc, oneshot, Mutex, RwLock};
use tracing::{debug, warn};

use coordinator_domain::models::AgentMessage;
use coordinator_domain::ports::MessageRouter;
use coordinator_errors::{CoordinationError, CoordinationResult};

/// 内存消息路由
///
/// 使用 Tokio channels 实现的Agent消息路由，适用于嵌入式部署与测试。
/// 每个Agent一个无界收件队列；请求/应答通过关联 ID 配对。
#[derive(Debug, Default)]
pub struct InMemoryMessageRouter {
    /// 收件队列：Agent ID -> (发送端, 接收端)
    inboxes: RwLock<HashMap<String, Inbox>>,
    /// 等待应答的请求：请求消息 ID -> 应答通道
    pending_responses: Mutex<HashMap<String, oneshot::Sender<AgentMessage>>>,
}

#[derive(Debug)]
struct Inbox {
    sender: mpsc::UnboundedSender<AgentMessage>,
    receiver: Arc<Mutex<mpsc::UnboundedReceiver<AgentMessage>>>,
}

impl InMemoryMessageRouter {
    pub fn new() -> Self {
        Self::default()
    }

    async fn inbox_sender(&self, agent_id: &str) -> mpsc::UnboundedSender<AgentMessage> {
        {
            let inboxes = self.inboxes.read().await;
            if let Some(inbox) = inboxes.get(agent_id) {
                return inbox.sender.clone();
            }
        }

        let mut inboxes = self.inboxes.write().await;
        inboxes
            .entry(agent_id.to_string())
            .or_insert_with(|| {
                debug!(agent_id, "为Agent创建收件队列");
                let (sender, receiver) = mpsc::unbounded_channel();
                Inbox {
                    sender,
                    receiver: Arc::new(Mutex::new(receiver)),
                }
            })
            .sender
            .clone()
    }

    /// 取出某Agent收件队列中的下一条消息（非阻塞）
    pub async fn try_receive(&self, agent_id: &str) -> Option<AgentMessage> {
        let receiver = {
            let inboxes = self.inboxes.read().await;
            inboxes.get(agent_id)?.receiver.clone()
        };
        let mut receiver = receiver.lock().await;
        receiver.try_recv().ok()
    }

    /// 收件队列当前长度
    pub async fn inbox_len(&self, agent_id: &str) -> usize {
        let receiver = {
            let inboxes = self.inboxes.read().await;
            match inboxes.get(agent_id) {
                Some(inbox) => inbox.receiver.clone(),
                None => return 0,
            }
        };
        let receiver = receiver.lock().await;
        receiver.len()
    }

    /// 投递应答消息，唤醒对应的 `send_with_response` 调用方。
    /// 无人等待该关联 ID 时按普通消息投递。
    pub async fn deliver_response(&self, response: AgentMessage) -> CoordinationResult<()> {
        let correlation_id = match &response.correlation_id {
            Some(id) => id.clone(),
            None => {
                return Err(CoordinationError::MessageRouting(
                    "应答消息缺少关联ID".to_string(),
                ))
            }
        };

        let waiter = {
            let mut pending = self.pending_responses.lock().await;
            pending.remove(&correlation_id)
        };

        match waiter {
            Some(sender) => {
                if sender.send(response).is_err() {
                    warn!(correlation_id, "应答到达时请求方已放弃等待");
                }
                Ok(())
            }
            None => self.send(response).await,
        }
    }
}

#[async_trait]
impl MessageRouter for InMemoryMessageRouter {
    async fn send(&self, message: AgentMessage) -> CoordinationResult<()> {
        let sender = self.inbox_sender(&message.to).await;
        sender
            .send(message)
            .map_err(|e| CoordinationError::MessageRouting(format!("消息投递失败: {e}")))
    }

    async fn send_with_response(
        &self,
        message: AgentMessage,
        timeout: Duration,
    ) -> CoordinationResult<AgentMessage> {
        let message_id = message.id.clone();
        let (tx, rx) = oneshot::channel();
        {
            let mut pending = self.pending_responses.lock().await;
            pending.insert(message_id.clone(), tx);
        }

        if let Err(e) = self.send(message).await {
            let mut pending = self.pending_responses.lock().await;
            pending.remove(&message_id);
            return Err(e);
        }

        match tokio::time::timeout(timeout, rx).await {
            Ok(Ok(response)) => Ok(response),
            Ok(Err(_)) => {
                let mut pending = self.pending_responses.lock().await;
                pending.remove(&message_id);
                Err(CoordinationError::MessageRouting(
                    "应答通道已关闭".to_string(),
                ))
            }
            Err(_) => {
                let mut pending = self.pending_responses.lock().await;
                pending.remove(&message_id);
                Err(CoordinationError::Timeout(format!(
                    "等待消息 {message_id} 的应答超时"
                )))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_send_and_receive() {
        let router = InMemoryMessageRouter::new();
        let message = AgentMessage::new("agent-1", "agent-2", "ping", serde_json::json!({}));

        router.send(message.clone()).await.expect("send");
        assert_eq!(router.inbox_len("agent-2").await, 1);

        let received = router.try_receive("agent-2").await.expect("message");
        assert_eq!(received.id, message.id);
        assert!(router.try_receive("agent-2").await.is_none());
    }

    #[tokio::test]
    async fn test_send_with_response_roundtrip() {
        let router = Arc::new(InMemoryMessageRouter::new());
        let request = AgentMessage::new("agent-1", "agent-2", "status", serde_json::json!({}));

        let responder = router.clone();
        let request_clone = request.clone();
        tokio::spawn(async move {
            // 模拟Agent侧取出请求并回发应答
            tokio::time::sleep(Duration::from_millis(10)).await;
            let incoming = responder.try_receive("agent-2").await.expect("request");
            assert_eq!(incoming.id, request_clone.id);
            let response =
                AgentMessage::response_to(&incoming, serde_json::json!({"progress": 42}));
            responder.deliver_response(response).await.expect("respond");
        });

        let response = router
            .send_with_response(request, Duration::from_secs(1))
            .await
            .expect("response");
        assert_eq!(response.payload["progress"], 42);
    }

    #[tokio::test]
    async fn test_send_with_response_timeout() {
        let router = InMemoryMessageRouter::new();
        let request = AgentMessage::new("agent-1", "agent-2", "status", serde_json::json!({}));

        let result = router
            .send_with_response(request, Duration::from_millis(20))
            .await;
        assert!(matches!(result, Err(CoordinationError::Timeout(_))));
    }

    #[tokio::test]
    async fn test_deliver_response_without_correlation_fails() {
        let router = InMemoryMessageRouter::new();
        let message = AgentMessage::new("agent-1", "agent-2", "ping", serde_json::json!({}));

        let result = router.deliver_response(message).await;
        assert!(matches!(result, Err(CoordinationError::MessageRouting(_))));
    }
}
