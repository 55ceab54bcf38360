pub mod app_config;
pub mod dispatcher_worker;
pub mod observability;
pub mod store;

pub use app_config::AppConfig;
pub use dispatcher_worker::{DispatcherConfig, LoadStrategyKind, WorkerConfig};
pub use observability::{LogFormat, ObservabilityConfig};
pub use store::{StoreConfig, StoreType};
