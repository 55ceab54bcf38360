pub mod in_memory_store;
pub mod redis_store;
pub mod resource_monitor;
pub mod store_factory;

pub use in_memory_store::InMemoryCoordinationStore;
pub use redis_store::{RedisConnectionManager, RedisCoordinationStore};
pub use resource_monitor::{ResourceProbe, StaticResourceProbe, SystemResourceProbe};
pub use store_factory::StoreFactory;
