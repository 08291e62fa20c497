//! Redis connection bootstrap

use redis::Client;
use redis::aio::{ConnectionManager, ConnectionManagerConfig};
use std::time::Duration;
use tracing::{info, warn};

/// Response timeout of the shared command connection
pub const COMMAND_TIMEOUT: Duration = Duration::from_secs(5);

/// Slack on top of the `BLOCK` time before a stream read is abandoned
const READ_GRACE: Duration = Duration::from_secs(2);

/// Response timeout for a connection that issues `XREADGROUP ... BLOCK block`
pub fn read_timeout(block: Duration) -> Duration {
    block.saturating_add(READ_GRACE)
}

/// Client plus the verified shared connection built from it.
///
/// Producers, acks, scripts and locks share `manager`. Blocking stream reads
/// get their own connection from `client` so they never queue in front of
/// those commands.
#[derive(Clone)]
pub struct RedisHandle {
    pub client: Client,
    pub manager: ConnectionManager,
}

/// Attempts and delays for [`connect_with_retry`]
#[derive(Debug, Clone)]
pub struct ConnectRetry {
    pub max_retries: u32,
    pub initial_delay: Duration,
    pub max_delay: Duration,
}

impl Default for ConnectRetry {
    fn default() -> Self {
        Self {
            max_retries: 5,
            initial_delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(5),
        }
    }
}

impl ConnectRetry {
    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries;
        self
    }

    pub fn with_initial_delay(mut self, delay: Duration) -> Self {
        self.initial_delay = delay;
        self
    }

    /// Delay before retry number `attempt` (1-based), doubled each time
    fn delay(&self, attempt: u32) -> Duration {
        let factor = 2u32.saturating_pow(attempt.saturating_sub(1));
        self.initial_delay
            .saturating_mul(factor)
            .min(self.max_delay)
    }
}

/// Open a `ConnectionManager` on `client` and verify it with PING
///
/// The manager reconnects on its own after the first successful connect.
pub async fn open(
    client: &Client,
    response_timeout: Duration,
) -> redis::RedisResult<ConnectionManager> {
    let config = ConnectionManagerConfig::new().set_response_timeout(Some(response_timeout));
    let manager = ConnectionManager::new_with_config(client.clone(), config).await?;

    let mut conn = manager.clone();
    let _: String = redis::cmd("PING").query_async(&mut conn).await?;
    Ok(manager)
}

/// Open the shared command connection for `url`
pub async fn connect(url: &str) -> redis::RedisResult<RedisHandle> {
    let client = Client::open(url)?;
    let manager = open(&client, COMMAND_TIMEOUT).await?;

    info!("Connected to Redis");
    Ok(RedisHandle { client, manager })
}

/// [`connect`] with exponential backoff between failed attempts
pub async fn connect_with_retry(
    url: &str,
    retry: ConnectRetry,
) -> redis::RedisResult<RedisHandle> {
    let mut attempt = 0;

    loop {
        match connect(url).await {
            Ok(handle) => return Ok(handle),
            Err(e) => {
                attempt += 1;
                if attempt > retry.max_retries {
                    warn!(attempts = attempt, error = %e, "Giving up connecting to Redis");
                    return Err(e);
                }

                let delay = retry.delay(attempt);
                warn!(
                    attempt,
                    delay_ms = delay.as_millis() as u64,
                    error = %e,
                    "Redis connection failed, retrying"
                );
                tokio::time::sleep(delay).await;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_delay_doubles_and_caps() {
        let retry = ConnectRetry::default();
        assert_eq!(retry.delay(1), Duration::from_millis(100));
        assert_eq!(retry.delay(2), Duration::from_millis(200));
        assert_eq!(retry.delay(4), Duration::from_millis(800));
        assert_eq!(retry.delay(20), Duration::from_secs(5));
    }

    #[test]
    fn test_read_timeout_outlasts_block() {
        let block = Duration::from_secs(1);
        assert!(read_timeout(block) > block);
        assert!(read_timeout(block) > Duration::from_millis(500));
        assert_eq!(read_timeout(Duration::MAX), Duration::MAX);
    }

    #[tokio::test]
    async fn test_connect_invalid_url() {
        assert!(connect("not-a-url").await.is_err());
    }

    #[tokio::test]
    async fn test_connect_with_retry_gives_up() {
        let retry = ConnectRetry::default()
            .with_max_retries(1)
            .with_initial_delay(Duration::from_millis(1));
        assert!(connect_with_retry("not-a-url", retry).await.is_err());
    }
}
