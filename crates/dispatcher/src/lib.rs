//! 调度端组件: 负载均衡、任务分发、失效检测、结果收集以及周期控制器

pub mod controller;
pub mod node_failure_detector;
pub mod result_collector;
pub mod strategies;
pub mod task_dispatcher;

pub use controller::{DispatcherController, TickReport};
pub use node_failure_detector::{FailureDetectorConfig, NodeFailureDetector, RecoveryReport};
pub use result_collector::ResultCollector;
pub use strategies::*;
pub use task_dispatcher::{AssignRetryPolicy, DrainOutcome, TaskDispatcher};
