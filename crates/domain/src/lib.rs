pub mod events;
pub mod models;
pub mod ports;

pub use coordinator_errors::{CoordinationError, CoordinationResult};
pub use events::*;
pub use models::*;
pub use ports::*;
