//! Mock implementations of the messaging ports for unit tests

use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::{broadcast, Mutex};

use coordinator_domain::events::CoordinationEvent;
use coordinator_domain::models::AgentMessage;
use coordinator_domain::ports::{EventBus, MessageRouter};
use coordinator_errors::CoordinationResult;

/// EventBus mock that records every published event for assertions
pub struct RecordingEventBus {
    sender: broadcast::Sender<CoordinationEvent>,
    events: Mutex<Vec<CoordinationEvent>>,
}

impl RecordingEventBus {
    pub fn new() -> Self {
        let (sender, _) = broadcast::channel(256);
        Self {
            sender,
            events: Mutex::new(Vec::new()),
        }
    }

    pub async fn events(&self) -> Vec<CoordinationEvent> {
        self.events.lock().await.clone()
    }

    pub async fn count_of(&self, event_type: &str) -> usize {
        self.events
            .lock()
            .await
            .iter()
            .filter(|event| event.event_type() == event_type)
            .count()
    }

    pub async fn clear(&self) {
        self.events.lock().await.clear();
    }
}

impl Default for RecordingEventBus {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl EventBus for RecordingEventBus {
    async fn publish(&self, event: CoordinationEvent) -> CoordinationResult<()> {
        self.events.lock().await.push(event.clone());
        let _ = self.sender.send(event);
        Ok(())
    }

    fn subscribe(&self) -> broadcast::Receiver<CoordinationEvent> {
        self.sender.subscribe()
    }
}

/// MessageRouter mock: records sends and echoes a canned response
pub struct EchoMessageRouter {
    sent: Mutex<Vec<AgentMessage>>,
}

impl EchoMessageRouter {
    pub fn new() -> Self {
        Self {
            sent: Mutex::new(Vec::new()),
        }
    }

    pub async fn sent(&self) -> Vec<AgentMessage> {
        self.sent.lock().await.clone()
    }
}

impl Default for EchoMessageRouter {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl MessageRouter for EchoMessageRouter {
    async fn send(&self, message: AgentMessage) -> CoordinationResult<()> {
        self.sent.lock().await.push(message);
        Ok(())
    }

    async fn send_with_response(
        &self,
        message: AgentMessage,
        _timeout: Duration,
    ) -> CoordinationResult<AgentMessage> {
        let response = AgentMessage::response_to(&message, serde_json::json!({ "echo": true }));
        self.sent.lock().await.push(message);
        Ok(response)
    }
}
