#![allow(dead_code)]

use async_trait::async_trait;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use stream_broker::{
    Alert, Alerter, BoxError, BrokerConfig, BrokerContext, BrokerError, Handler, Message,
    ProcessLog, ProcessResult,
};
use test_utils::{TestDataBuilder, TestRedis};

/// Redis container plus an isolated prefix and route for one test
pub struct Harness {
    pub redis: TestRedis,
    pub ctx: BrokerContext,
    pub log: Arc<MemoryLog>,
    pub alerts: Arc<RecordingAlerter>,
    pub channel: String,
    pub topic: String,
}

/// Config with short timings so loops and reclaim ticks run quickly
pub fn fast_config(prefix: &str) -> BrokerConfig {
    BrokerConfig::new(prefix)
        .with_block_timeout(Duration::from_millis(100))
        .with_dead_letter_idle(Duration::from_millis(50))
        .with_dead_letter_tick(Duration::from_millis(50), Duration::from_millis(100))
        .with_schedule_tick(Duration::from_millis(50))
        .with_worker_pool_size(4)
        .with_retry_backoff(
            Duration::from_millis(2),
            Duration::from_millis(4),
            Duration::from_millis(1),
        )
}

impl Harness {
    pub async fn new(test_name: &str) -> Self {
        Self::with_config(test_name, fast_config).await
    }

    pub async fn with_config(
        test_name: &str,
        configure: impl FnOnce(&str) -> BrokerConfig,
    ) -> Self {
        let redis = TestRedis::new().await;
        let builder = TestDataBuilder::from_test_name(test_name);
        let (channel, topic) = builder.route("orders");
        let config = configure(&builder.prefix());

        let log = Arc::new(MemoryLog::default());
        let alerts = Arc::new(RecordingAlerter::default());
        let handle = stream_broker::connect(&redis.connection_string)
            .await
            .unwrap();
        let ctx = BrokerContext::new(handle, config)
            .with_process_log(log.clone())
            .with_alerter(alerts.clone());

        Self {
            redis,
            ctx,
            log,
            alerts,
            channel,
            topic,
        }
    }

    pub fn message(&self, payload: &str) -> Message {
        Message::new(self.channel.as_str(), self.topic.as_str(), payload)
    }
}

/// Process log that keeps records in memory and can be switched to fail
#[derive(Default)]
pub struct MemoryLog {
    records: Mutex<Vec<ProcessResult>>,
    failing: AtomicBool,
}

impl MemoryLog {
    pub fn records(&self) -> Vec<ProcessResult> {
        self.records.lock().unwrap().clone()
    }

    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }
}

#[async_trait]
impl ProcessLog for MemoryLog {
    async fn add_log(&self, result: &ProcessResult) -> Result<(), BrokerError> {
        if self.failing.load(Ordering::SeqCst) {
            return Err(BrokerError::Config("log sink unavailable".to_string()));
        }
        self.records.lock().unwrap().push(result.clone());
        Ok(())
    }
}

#[derive(Default)]
pub struct RecordingAlerter {
    alerts: Mutex<Vec<Alert>>,
}

impl RecordingAlerter {
    pub fn alerts(&self) -> Vec<Alert> {
        self.alerts.lock().unwrap().clone()
    }
}

impl Alerter for RecordingAlerter {
    fn notify(&self, alert: Alert) {
        self.alerts.lock().unwrap().push(alert);
    }
}

/// Succeeds and counts calls
#[derive(Default)]
pub struct CountingHandler {
    pub calls: AtomicU32,
}

#[async_trait]
impl Handler for CountingHandler {
    async fn handle(&self, _message: &Message) -> Result<(), BoxError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

/// Fails every attempt
#[derive(Default)]
pub struct FailingHandler {
    pub calls: AtomicU32,
    pub error_hooks: AtomicU32,
}

#[async_trait]
impl Handler for FailingHandler {
    async fn handle(&self, _message: &Message) -> Result<(), BoxError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Err("downstream unavailable".into())
    }

    async fn on_error(&self, _message: &Message, _error: &stream_broker::HandlerError) {
        self.error_hooks.fetch_add(1, Ordering::SeqCst);
    }
}

/// Counts calls and never completes, like a worker stuck mid-message
#[derive(Default)]
pub struct BlockingHandler {
    pub calls: AtomicU32,
}

#[async_trait]
impl Handler for BlockingHandler {
    async fn handle(&self, _message: &Message) -> Result<(), BoxError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        std::future::pending::<()>().await;
        Ok(())
    }
}

/// Panics on messages whose payload is `boom`
pub struct PanickingHandler;

#[async_trait]
impl Handler for PanickingHandler {
    async fn handle(&self, message: &Message) -> Result<(), BoxError> {
        if message.payload == "boom" {
            panic!("boom");
        }
        Ok(())
    }
}

pub async fn stream_len(harness: &Harness, key: &str) -> i64 {
    let mut conn = harness.redis.connection();
    redis::cmd("XLEN")
        .arg(key)
        .query_async(&mut conn)
        .await
        .unwrap()
}

pub async fn pending_count(harness: &Harness, key: &str, group: &str) -> i64 {
    let mut conn = harness.redis.connection();
    let summary: (i64, Option<String>, Option<String>, Option<Vec<(String, String)>>) =
        redis::cmd("XPENDING")
            .arg(key)
            .arg(group)
            .query_async(&mut conn)
            .await
            .unwrap();
    summary.0
}

pub fn shared<H: Handler + 'static>(handler: H) -> Arc<H> {
    Arc::new(handler)
}
