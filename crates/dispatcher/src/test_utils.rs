pub mod mocks {
    // Re-export shared mock implementations from testing-utils
    pub use coordinator_testing_utils::{
        AgentProfileBuilder, AgentWorkloadBuilder, EchoMessageRouter, RecordingEventBus,
        TaskBuilder,
    };
}
