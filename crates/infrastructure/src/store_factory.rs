use std::sync::Arc;

use taskmesh_core::{CoordinationStore, SchedulerResult, StoreConfig, StoreType};
use tracing::{debug, info};

use crate::{InMemoryCoordinationStore, RedisCoordinationStore};

pub struct StoreFactory;

impl StoreFactory {
    pub async fn create(config: &StoreConfig) -> SchedulerResult<Arc<dyn CoordinationStore>> {
        debug!("Creating coordination store with type: {:?}", config.r#type);

        match config.r#type {
            StoreType::Redis => {
                info!(
                    "Initializing Redis coordination store at {}:{}",
                    config.host, config.port
                );
                let store = RedisCoordinationStore::new(config.clone()).await?;
                Ok(Arc::new(store))
            }
            StoreType::InMemory => {
                info!("Initializing in-memory coordination store");
                Ok(Arc::new(InMemoryCoordinationStore::new()))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_create_in_memory_store() {
        let store = StoreFactory::create(&StoreConfig::in_memory()).await.unwrap();
        store.rpush("q", "a").await.unwrap();
        assert_eq!(store.llen("q").await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_unreachable_redis_is_an_error() {
        let config = StoreConfig {
            host: "127.0.0.1".to_string(),
            port: 1,
            max_retry_attempts: 1,
            connection_timeout_seconds: 1,
            ..StoreConfig::default()
        };
        assert!(StoreFactory::create(&config).await.is_err());
    }
}
