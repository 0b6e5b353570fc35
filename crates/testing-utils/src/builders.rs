//! Test data builders for creating test entities
//!
//! This module provides builder patterns for creating test data with
//! sensible defaults and easy customization.

use chrono::Utc;
use coordinator_domain::models::{AgentProfile, AgentWorkload, Task, TaskStatus};

/// Builder for creating test Task entities
pub struct TaskBuilder {
    task: Task,
}

impl TaskBuilder {
    pub fn new(id: &str) -> Self {
        Self {
            task: Task {
                id: id.to_string(),
                task_type: "shell".to_string(),
                description: "test task".to_string(),
                priority: 0,
                dependencies: vec![],
                required_capabilities: vec![],
                parameters: serde_json::json!({}),
                timeout_seconds: None,
                status: TaskStatus::Pending,
                assigned_agent: None,
                progress: 0,
                error: None,
                created_at: Utc::now(),
                completed_at: None,
            },
        }
    }

    pub fn with_type(mut self, task_type: &str) -> Self {
        self.task.task_type = task_type.to_string();
        self
    }

    pub fn with_description(mut self, description: &str) -> Self {
        self.task.description = description.to_string();
        self
    }

    pub fn with_priority(mut self, priority: i32) -> Self {
        self.task.priority = priority;
        self
    }

    pub fn with_dependencies(mut self, dependencies: &[&str]) -> Self {
        self.task.dependencies = dependencies.iter().map(|d| d.to_string()).collect();
        self
    }

    pub fn with_capabilities(mut self, capabilities: &[&str]) -> Self {
        self.task.required_capabilities =
            capabilities.iter().map(|c| c.to_string()).collect();
        self
    }

    pub fn with_parameters(mut self, parameters: serde_json::Value) -> Self {
        self.task.parameters = parameters;
        self
    }

    pub fn with_timeout(mut self, timeout_seconds: i64) -> Self {
        self.task.timeout_seconds = Some(timeout_seconds);
        self
    }

    pub fn build(self) -> Task {
        self.task
    }
}

/// Builder for creating test AgentProfile entities
pub struct AgentProfileBuilder {
    profile: AgentProfile,
}

impl AgentProfileBuilder {
    pub fn new(id: &str) -> Self {
        Self {
            profile: AgentProfile {
                id: id.to_string(),
                capabilities: vec!["shell".to_string()],
                priority: 0,
                agent_type: "worker".to_string(),
            },
        }
    }

    pub fn with_capabilities(mut self, capabilities: &[&str]) -> Self {
        self.profile.capabilities = capabilities.iter().map(|c| c.to_string()).collect();
        self
    }

    pub fn with_priority(mut self, priority: i32) -> Self {
        self.profile.priority = priority;
        self
    }

    pub fn with_type(mut self, agent_type: &str) -> Self {
        self.profile.agent_type = agent_type.to_string();
        self
    }

    pub fn build(self) -> AgentProfile {
        self.profile
    }
}

/// Builder for creating test AgentWorkload entities
pub struct AgentWorkloadBuilder {
    workload: AgentWorkload,
}

impl AgentWorkloadBuilder {
    pub fn new(agent_id: &str) -> Self {
        Self {
            workload: AgentWorkload::new(agent_id, 0),
        }
    }

    pub fn with_task_count(mut self, task_count: usize) -> Self {
        self.workload.task_count = task_count;
        self
    }

    pub fn with_avg_duration_ms(mut self, avg: f64) -> Self {
        self.workload.avg_task_duration_ms = avg;
        self
    }

    pub fn with_priority(mut self, priority: i32) -> Self {
        self.workload.priority = priority;
        self
    }

    pub fn with_capabilities(mut self, capabilities: &[&str]) -> Self {
        self.workload.capabilities = capabilities.iter().map(|c| c.to_string()).collect();
        self
    }

    pub fn build(self) -> AgentWorkload {
        self.workload
    }
}
