pub mod node;
pub mod task;
pub mod task_result;

pub use node::{
    from_epoch_seconds, to_epoch_seconds, NodeId, NodeRecord, NodeStatus, RegistrySnapshot,
    ResourceSnapshot,
};
pub use task::{Direction, ScenarioAction, TaskEnvelope, TaskIndex, TaskKind};
pub use task_result::TaskResultRecord;
