use std::time::Duration;

use redis::aio::{ConnectionManager, MultiplexedConnection};
use redis::Client;
use taskmesh_core::{SchedulerError, SchedulerResult, StoreConfig};
use tokio::sync::Mutex;
use tokio::time::sleep;
use tracing::{debug, error, warn};

/// Redis connections used by the coordination store.
///
/// Ordinary commands share an auto-reconnecting `ConnectionManager`. Blocking
/// pops go through a dedicated connection so a `BLPOP` never delays heartbeats
/// or counter updates issued from the same process.
pub struct RedisConnectionManager {
    client: Client,
    config: StoreConfig,
    shared: ConnectionManager,
    blocking: Mutex<Option<MultiplexedConnection>>,
}

impl RedisConnectionManager {
    pub async fn new(config: StoreConfig) -> SchedulerResult<Self> {
        let client = Client::open(config.build_url())
            .map_err(|e| SchedulerError::store(format!("Failed to create Redis client: {e}")))?;

        let shared = Self::connect_with_retry(&client, &config).await?;
        let manager = Self {
            client,
            config,
            shared,
            blocking: Mutex::new(None),
        };
        manager.ping().await?;
        debug!(
            "Successfully connected to Redis at {}:{}",
            manager.config.host, manager.config.port
        );

        Ok(manager)
    }

    async fn connect_with_retry(
        client: &Client,
        config: &StoreConfig,
    ) -> SchedulerResult<ConnectionManager> {
        let attempts = config.max_retry_attempts.max(1);
        let connect_timeout = Duration::from_secs(config.connection_timeout_seconds);
        let mut last_error = String::from("Unknown");

        for attempt in 0..attempts {
            match tokio::time::timeout(connect_timeout, client.get_connection_manager()).await {
                Ok(Ok(conn)) => {
                    if attempt > 0 {
                        debug!(
                            "Successfully reconnected to Redis after {} attempts",
                            attempt + 1
                        );
                    }
                    return Ok(conn);
                }
                Ok(Err(e)) => last_error = e.to_string(),
                Err(_) => last_error = format!("timed out after {connect_timeout:?}"),
            }

            if attempt + 1 < attempts {
                warn!(
                    "Failed to connect to Redis (attempt {}/{}): {}. Retrying in {}s...",
                    attempt + 1,
                    attempts,
                    last_error,
                    config.retry_delay_seconds
                );
                sleep(Duration::from_secs(config.retry_delay_seconds)).await;
            }
        }

        let error_msg = format!(
            "Failed to connect to Redis after {attempts} attempts. Last error: {last_error}"
        );
        error!("{}", error_msg);
        Err(SchedulerError::store(error_msg))
    }

    /// Handle to the shared multiplexed connection. Cloning is cheap.
    pub fn connection(&self) -> ConnectionManager {
        self.shared.clone()
    }

    /// Run a blocking command on the dedicated connection, opening it lazily.
    pub async fn blocking_query<T: redis::FromRedisValue>(
        &self,
        cmd: &redis::Cmd,
    ) -> SchedulerResult<T> {
        let mut guard = self.blocking.lock().await;
        if guard.is_none() {
            let conn = self
                .client
                .get_multiplexed_async_connection()
                .await
                .map_err(|e| SchedulerError::store(format!("Failed to open blocking connection: {e}")))?;
            *guard = Some(conn);
        }

        let Some(conn) = guard.as_mut() else {
            return Err(SchedulerError::store("Blocking connection unavailable"));
        };
        match cmd.query_async(conn).await {
            Ok(value) => Ok(value),
            Err(e) => {
                // Reopened on the next call.
                *guard = None;
                Err(SchedulerError::store(format!("Redis blocking command failed: {e}")))
            }
        }
    }

    pub async fn ping(&self) -> SchedulerResult<()> {
        let mut conn = self.connection();
        let response: String = redis::cmd("PING")
            .query_async(&mut conn)
            .await
            .map_err(|e| SchedulerError::store(format!("Redis PING failed: {e}")))?;
        if response != "PONG" {
            let error_msg = format!("Unexpected PING response: {response}");
            error!("{}", error_msg);
            return Err(SchedulerError::store(error_msg));
        }
        debug!("Redis connection test successful");
        Ok(())
    }

    pub async fn health_check(&self) -> bool {
        match self.ping().await {
            Ok(()) => true,
            Err(e) => {
                warn!("Redis health check failed: {}", e);
                false
            }
        }
    }
}
