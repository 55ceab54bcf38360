pub mod admission;
pub mod config;
pub mod errors;
pub mod keys;
pub mod models;
pub mod registry;
pub mod traits;

pub use admission::{AdmissionPolicy, LoadBand};
pub use config::{
    AppConfig, DispatcherConfig, LoadStrategyKind, LogFormat, ObservabilityConfig, StoreConfig,
    StoreType, WorkerConfig,
};
pub use errors::*;
pub use models::*;
pub use registry::{HeartbeatOutcome, NodeRegistry};
pub use traits::{CoordinationStore, ListEnd};

/// 统一的Result类型
pub type SchedulerResult<T> = std::result::Result<T, SchedulerError>;
