//! Redis test infrastructure

use redis::Client;
use redis::aio::{ConnectionManager, MultiplexedConnection};
use testcontainers::runners::AsyncRunner;
use testcontainers::{ContainerAsync, ImageExt};
use testcontainers_modules::redis::Redis;

/// Redis 8 container that lives as long as this value
///
/// ```no_run
/// use test_utils::TestRedis;
///
/// # async fn example() {
/// let redis = TestRedis::new().await;
/// let manager = redis.connection_manager().await;
/// // Inspect keys written by the code under test
/// # }
/// ```
pub struct TestRedis {
    #[allow(dead_code)]
    container: ContainerAsync<Redis>,
    client: Client,
    connection: MultiplexedConnection,
    pub connection_string: String,
}

impl TestRedis {
    /// Start a `redis:8-alpine` container (streams, Lua and hash-tagged keys)
    pub async fn new() -> Self {
        let container = Redis::default()
            .with_tag("8-alpine")
            .start()
            .await
            .expect("Failed to start Redis container");

        let host_port = container
            .get_host_port_ipv4(6379)
            .await
            .expect("Failed to get Redis port");

        let connection_string = format!("redis://127.0.0.1:{}", host_port);

        let client =
            Client::open(connection_string.clone()).expect("Failed to create Redis client");

        let connection = client
            .get_multiplexed_async_connection()
            .await
            .expect("Failed to connect to Redis");

        tracing::info!(port = host_port, "Test Redis ready (Redis 8-alpine)");

        Self {
            container,
            client,
            connection,
            connection_string,
        }
    }

    /// A cloned multiplexed connection for direct assertions
    pub fn connection(&self) -> MultiplexedConnection {
        self.connection.clone()
    }

    /// A fresh `ConnectionManager`, the handle the broker runs on
    pub async fn connection_manager(&self) -> ConnectionManager {
        ConnectionManager::new(self.client.clone())
            .await
            .expect("Failed to create Redis connection manager")
    }

    pub fn connection_string(&self) -> &str {
        &self.connection_string
    }
}

impl Drop for TestRedis {
    fn drop(&mut self) {
        tracing::debug!("Cleaning up test Redis container");
    }
}
