pub mod agent;
pub mod conflict;
pub mod message;
pub mod resource;
pub mod task;

pub use agent::{AgentProfile, AgentWorkload};
pub use conflict::{
    ConflictContext, ConflictResolution, ResourceConflict, TaskConflict, TaskConflictKind,
};
pub use message::AgentMessage;
pub use resource::{ResourceRequest, ResourceStatus};
pub use task::{ScheduledTask, Task, TaskStatus};
