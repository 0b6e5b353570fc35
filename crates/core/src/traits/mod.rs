pub mod scheduler;

pub use scheduler::{SchedulerMetrics, TaskSchedulerService};
