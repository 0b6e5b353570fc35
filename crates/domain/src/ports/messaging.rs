use std::time::Duration;

use async_trait::async_trait;
use coordinator_errors::CoordinationResult;
use tokio::sync::broadcast;

use crate::events::CoordinationEvent;
use crate::models::AgentMessage;

/// 事件总线端口
///
/// 协调核心的所有跨组件通知都经由该端口发布，实现由集成层提供。
#[async_trait]
pub trait EventBus: Send + Sync {
    async fn publish(&self, event: CoordinationEvent) -> CoordinationResult<()>;

    /// 订阅全部协调事件
    fn subscribe(&self) -> broadcast::Receiver<CoordinationEvent>;
}

/// Agent消息路由端口
///
/// 请求/应答语义由 `send_with_response` 承载，超时由调用方给定。
#[async_trait]
pub trait MessageRouter: Send + Sync {
    async fn send(&self, message: AgentMessage) -> CoordinationResult<()>;

    async fn send_with_response(
        &self,
        message: AgentMessage,
        timeout: Duration,
    ) -> CoordinationResult<AgentMessage>;
}
