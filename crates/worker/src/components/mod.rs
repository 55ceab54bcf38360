pub mod heartbeat_manager;
pub mod task_execution;

pub use heartbeat_manager::{Heartbeat, HeartbeatManager};
pub use task_execution::{ExecutionPool, SlotContext};
