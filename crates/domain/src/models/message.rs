use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Agent间消息
///
/// 经外部MessageRouter投递；协调核心只负责构造与关联应答。
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentMessage {
    pub id: String,
    pub from: String,
    pub to: String,
    pub message_type: String,
    pub payload: serde_json::Value,
    pub correlation_id: Option<String>,
    pub created_at: DateTime<Utc>,
}

impl AgentMessage {
    pub fn new<S: Into<String>>(
        from: S,
        to: S,
        message_type: S,
        payload: serde_json::Value,
    ) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            from: from.into(),
            to: to.into(),
            message_type: message_type.into(),
            payload,
            correlation_id: None,
            created_at: Utc::now(),
        }
    }

    /// 构造对 `request` 的应答消息，携带关联 ID
    pub fn response_to(request: &AgentMessage, payload: serde_json::Value) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            from: request.to.clone(),
            to: request.from.clone(),
            message_type: format!("{}:response", request.message_type),
            payload,
            correlation_id: Some(request.id.clone()),
            created_at: Utc::now(),
        }
    }

    pub fn is_response(&self) -> bool {
        self.correlation_id.is_some()
    }
}
