pub mod messaging;

pub use messaging::{EventBus, MessageRouter};
