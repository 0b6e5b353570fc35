//! Shared test utilities for the coordinator workspace
//!
//! Builder-pattern factories for test entities and mock implementations
//! of the messaging ports.

pub mod builders;
pub mod mocks;

pub use builders::{AgentProfileBuilder, AgentWorkloadBuilder, TaskBuilder};
pub use mocks::{EchoMessageRouter, RecordingEventBus};
