//! Shared collaborators of every broker, loop and engine

use crate::alert::{Alert, Alerter, LogAlerter};
use crate::config::BrokerConfig;
use crate::connection::{self, RedisHandle};
use crate::error::BrokerError;
use crate::keys::KeySpace;
use crate::log::{ProcessLog, RedisProcessLog};
use crate::retry::{Backoff, RetryExecutor};
use redis::Client;
use redis::aio::ConnectionManager;
use std::sync::Arc;

/// Redis connection, key space, configuration and the external sinks.
///
/// Cloning is cheap; every field is shared.
#[derive(Clone)]
pub struct BrokerContext {
    client: Client,
    redis: Arc<ConnectionManager>,
    keys: KeySpace,
    config: Arc<BrokerConfig>,
    log: Arc<dyn ProcessLog>,
    alerter: Arc<dyn Alerter>,
}

impl BrokerContext {
    /// Context with the Redis process log and the tracing alerter
    pub fn new(redis: RedisHandle, config: BrokerConfig) -> Self {
        let RedisHandle { client, manager } = redis;
        let redis = Arc::new(manager);
        let keys = KeySpace::new(config.prefix.clone());
        let log = RedisProcessLog::new(redis.clone(), keys.log_stream(), config.log_max_len);

        Self {
            client,
            redis,
            keys,
            config: Arc::new(config),
            log: Arc::new(log),
            alerter: Arc::new(LogAlerter),
        }
    }

    /// Replace the process log sink
    pub fn with_process_log(mut self, log: Arc<dyn ProcessLog>) -> Self {
        self.log = log;
        self
    }

    /// Replace the alerter
    pub fn with_alerter(mut self, alerter: Arc<dyn Alerter>) -> Self {
        self.alerter = alerter;
        self
    }

    pub fn redis(&self) -> Arc<ConnectionManager> {
        self.redis.clone()
    }

    /// A connection handle for one command sequence
    pub fn conn(&self) -> ConnectionManager {
        (*self.redis).clone()
    }

    /// A dedicated connection for blocking stream reads.
    ///
    /// Its response timeout outlasts `block_timeout`, so an idle `BLOCK` read
    /// returns nil instead of failing on the client side.
    pub async fn open_reader(&self) -> Result<ConnectionManager, BrokerError> {
        let timeout = connection::read_timeout(self.config.block_timeout);
        Ok(connection::open(&self.client, timeout).await?)
    }

    pub fn keys(&self) -> &KeySpace {
        &self.keys
    }

    pub fn config(&self) -> &BrokerConfig {
        &self.config
    }

    pub fn process_log(&self) -> Arc<dyn ProcessLog> {
        self.log.clone()
    }

    pub fn alert(&self, alert: Alert) {
        self.alerter.notify(alert);
    }

    pub fn retry_executor(&self) -> RetryExecutor {
        RetryExecutor::new(Backoff::new(
            self.config.retry_base,
            self.config.retry_cap,
            self.config.retry_floor,
        ))
    }
}
