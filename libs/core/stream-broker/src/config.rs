//! Broker configuration
//!
//! `BrokerConfig` holds the defaults applied to every route. Per-message fields
//! (`retry`, `max_len`, `time_to_run`, `lock_ttl`) override them when set.

use std::time::Duration;
use uuid::Uuid;

/// Configuration shared by all brokers built from one [`crate::Broker`]
#[derive(Debug, Clone)]
pub struct BrokerConfig {
    /// Key prefix for every Redis key the broker touches
    pub prefix: String,

    /// Consumer name prefix; each dispatch loop appends a unique suffix
    pub consumer_name: String,

    /// Default stream capacity for normal mode (exact trim)
    pub max_len: i64,

    /// Entries read per XREADGROUP call
    pub consumers: usize,

    /// Workers running handlers concurrently for one batch
    pub worker_pool_size: usize,

    /// XREADGROUP BLOCK timeout; bounds how long shutdown waits on a read
    pub block_timeout: Duration,

    /// Default re-attempts after the first failure
    pub job_max_retry: u32,

    /// Default per-message deadline
    pub time_to_run: Duration,

    /// Pending entries idle longer than this are reclaimed
    pub dead_letter_idle: Duration,

    /// Reclaim tick is drawn uniformly from this range
    pub dead_letter_tick: (Duration, Duration),

    /// TTL of the advisory locks guarding reclaim and promotion ticks
    pub advisory_lock_ttl: Duration,

    /// Promotion tick for scheduled mode
    pub schedule_tick: Duration,

    /// Due entries promoted per tick
    pub schedule_batch: usize,

    /// Default sequence lock TTL
    pub lock_ttl: Duration,

    /// How long sequential status records are kept
    pub status_retention: Duration,

    /// Approximate cap of the process log stream
    pub log_max_len: i64,

    /// Backoff between handler attempts: base, cap and floor
    pub retry_base: Duration,
    pub retry_cap: Duration,
    pub retry_floor: Duration,
}

/// `max(parallelism - 1, 2)`
pub fn default_worker_pool_size() -> usize {
    let cpus = std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(1);
    cpus.saturating_sub(1).max(2)
}

impl BrokerConfig {
    /// Create a config with the given key prefix and default tuning
    pub fn new(prefix: impl Into<String>) -> Self {
        Self {
            prefix: prefix.into(),
            consumer_name: "broker".to_string(),
            max_len: 2000,
            consumers: 100,
            worker_pool_size: default_worker_pool_size(),
            block_timeout: Duration::from_secs(1),
            job_max_retry: 3,
            time_to_run: Duration::from_secs(3600),
            dead_letter_idle: Duration::from_secs(60),
            dead_letter_tick: (Duration::from_secs(1), Duration::from_secs(9)),
            advisory_lock_ttl: Duration::from_secs(10),
            schedule_tick: Duration::from_secs(1),
            schedule_batch: 100,
            lock_ttl: Duration::from_secs(60),
            status_retention: Duration::from_secs(7 * 24 * 3600),
            log_max_len: 20_000,
            retry_base: Duration::from_millis(500),
            retry_cap: Duration::from_secs(1),
            retry_floor: Duration::from_millis(500),
        }
    }

    /// Unique consumer identity for one dispatch loop
    pub fn consumer_id(&self) -> String {
        format!("{}-{}", self.consumer_name, Uuid::new_v4())
    }

    pub fn with_consumer_name(mut self, name: impl Into<String>) -> Self {
        self.consumer_name = name.into();
        self
    }

    pub fn with_max_len(mut self, max_len: i64) -> Self {
        self.max_len = max_len.max(1);
        self
    }

    pub fn with_consumers(mut self, count: usize) -> Self {
        self.consumers = count.max(1);
        self
    }

    pub fn with_worker_pool_size(mut self, size: usize) -> Self {
        self.worker_pool_size = size.max(1);
        self
    }

    pub fn with_block_timeout(mut self, timeout: Duration) -> Self {
        self.block_timeout = timeout;
        self
    }

    pub fn with_job_max_retry(mut self, retry: u32) -> Self {
        self.job_max_retry = retry;
        self
    }

    pub fn with_time_to_run(mut self, ttr: Duration) -> Self {
        self.time_to_run = ttr;
        self
    }

    pub fn with_dead_letter_idle(mut self, idle: Duration) -> Self {
        self.dead_letter_idle = idle;
        self
    }

    /// Set the reclaim tick range; `min` is clamped to `max`
    pub fn with_dead_letter_tick(mut self, min: Duration, max: Duration) -> Self {
        self.dead_letter_tick = (min.min(max), max);
        self
    }

    pub fn with_advisory_lock_ttl(mut self, ttl: Duration) -> Self {
        self.advisory_lock_ttl = ttl;
        self
    }

    pub fn with_schedule_tick(mut self, tick: Duration) -> Self {
        self.schedule_tick = tick;
        self
    }

    pub fn with_schedule_batch(mut self, batch: usize) -> Self {
        self.schedule_batch = batch.max(1);
        self
    }

    pub fn with_lock_ttl(mut self, ttl: Duration) -> Self {
        self.lock_ttl = ttl;
        self
    }

    pub fn with_status_retention(mut self, retention: Duration) -> Self {
        self.status_retention = retention;
        self
    }

    pub fn with_log_max_len(mut self, len: i64) -> Self {
        self.log_max_len = len;
        self
    }

    pub fn with_retry_backoff(mut self, base: Duration, cap: Duration, floor: Duration) -> Self {
        self.retry_base = base;
        self.retry_cap = cap;
        self.retry_floor = floor;
        self
    }
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self::new("broker")
    }
}

/// Load BrokerConfig from environment variables
///
/// Every variable is optional; unset ones keep the defaults of
/// [`BrokerConfig::new`].
///
/// - `BROKER_PREFIX`, `BROKER_CONSUMER_NAME`
/// - `BROKER_MAX_LEN`, `BROKER_CONSUMERS`, `BROKER_WORKER_POOL_SIZE`
/// - `BROKER_JOB_MAX_RETRY`, `BROKER_TIME_TO_RUN_SECS`
/// - `BROKER_DEAD_LETTER_IDLE_SECS`, `BROKER_LOCK_TTL_SECS`
/// - `BROKER_BLOCK_TIMEOUT_MS`, `BROKER_LOG_MAX_LEN`
#[cfg(feature = "config")]
impl core_config::FromEnv for BrokerConfig {
    fn from_env() -> Result<Self, core_config::ConfigError> {
        use core_config::{env_or_default, env_parse};

        let defaults = Self::new(env_or_default("BROKER_PREFIX", "broker"));

        Ok(Self {
            consumer_name: env_or_default("BROKER_CONSUMER_NAME", &defaults.consumer_name),
            max_len: env_parse("BROKER_MAX_LEN", defaults.max_len)?.max(1),
            consumers: env_parse("BROKER_CONSUMERS", defaults.consumers)?.max(1),
            worker_pool_size: env_parse("BROKER_WORKER_POOL_SIZE", defaults.worker_pool_size)?
                .max(1),
            job_max_retry: env_parse("BROKER_JOB_MAX_RETRY", defaults.job_max_retry)?,
            time_to_run: Duration::from_secs(env_parse(
                "BROKER_TIME_TO_RUN_SECS",
                defaults.time_to_run.as_secs(),
            )?),
            dead_letter_idle: Duration::from_secs(env_parse(
                "BROKER_DEAD_LETTER_IDLE_SECS",
                defaults.dead_letter_idle.as_secs(),
            )?),
            lock_ttl: Duration::from_secs(env_parse(
                "BROKER_LOCK_TTL_SECS",
                defaults.lock_ttl.as_secs(),
            )?),
            block_timeout: Duration::from_millis(env_parse(
                "BROKER_BLOCK_TIMEOUT_MS",
                defaults.block_timeout.as_millis() as u64,
            )?),
            log_max_len: env_parse("BROKER_LOG_MAX_LEN", defaults.log_max_len)?,
            ..defaults
        })
    }
}
