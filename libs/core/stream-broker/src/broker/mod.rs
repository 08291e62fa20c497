//! Delivery-mode brokers
//!
//! Every mode shares the same consumer side (dispatch + dead-letter reclaim,
//! plus promotion for scheduled mode) and differs in how `enqueue` admits a
//! message and what happens once it settles.
//!
//! | Mode           | Enqueue                                   | Guarantee                    |
//! |----------------|-------------------------------------------|------------------------------|
//! | Normal         | `XADD MAXLEN max_len`                     | at-least-once, unordered     |
//! | Sequential     | idempotent insert keyed by message id     | one admission per id         |
//! | SequentialLock | locked insert keyed by order key          | one in-flight per order key  |
//! | Scheduled      | `ZADD` at `due_ms + priority / 1000`      | visible after promotion      |

mod normal;
mod scheduled;
mod sequential;
mod sequential_lock;

pub use normal::NormalBroker;
pub use scheduled::ScheduledBroker;
pub use sequential::SequentialBroker;
pub use sequential_lock::{SequenceLockInfo, SequentialLockBroker};

use crate::connection::RedisHandle;
use crate::context::BrokerContext;
use crate::dispatch::DispatchEngine;
use crate::error::BrokerError;
use crate::handler::Handler;
use crate::keys;
use crate::log::DeadLetters;
use crate::message::{Message, Mode, Status};
use crate::policy::DeliveryPolicy;
use crate::reclaim::DeadLetterReclaimer;
use crate::status::StatusReader;
use async_trait::async_trait;
use futures::future::join_all;
use std::sync::Arc;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::error;

/// Handle of one background loop
pub type TaskHandle = JoinHandle<Result<(), BrokerError>>;

/// Common contract of the four delivery modes
#[async_trait]
pub trait DeliveryBroker: Send + Sync {
    fn mode(&self) -> Mode;

    /// Admit a message. Errors are returned synchronously; handler outcomes
    /// are only visible through the process log.
    async fn enqueue(&self, message: Message) -> Result<(), BrokerError>;

    /// Put a dead-lettered message back on its stream under this mode's
    /// admission rules, skipping checks that would reject the message's own
    /// earlier admission. Returns the new stream id.
    async fn readmit(&self, message: Message) -> Result<String, BrokerError>;

    /// Settle behavior shared by this mode's dispatch and reclaim loops
    fn policy(&self) -> Arc<dyn DeliveryPolicy>;

    /// Spawn the consumer loops for a route and return their handles
    fn start(
        &self,
        channel: &str,
        topic: &str,
        handler: Arc<dyn Handler>,
        shutdown: watch::Receiver<bool>,
    ) -> Vec<TaskHandle>;

    /// Consume a route until `shutdown` fires
    async fn dequeue(
        &self,
        channel: &str,
        topic: &str,
        handler: Arc<dyn Handler>,
        shutdown: watch::Receiver<bool>,
    ) -> Result<(), BrokerError> {
        join_tasks(self.start(channel, topic, handler, shutdown)).await
    }

    /// Drop the sequence lock of `order_key`. Returns whether a lock existed.
    async fn force_unlock(
        &self,
        _channel: &str,
        _topic: &str,
        _order_key: &str,
    ) -> Result<bool, BrokerError> {
        Ok(false)
    }
}

/// Await every task; the first error wins
pub async fn join_tasks(handles: Vec<TaskHandle>) -> Result<(), BrokerError> {
    let mut first_error = None;

    for joined in join_all(handles).await {
        let result = match joined {
            Ok(result) => result,
            Err(e) => {
                error!(error = %e, "Broker task panicked or was cancelled");
                Ok(())
            }
        };

        if let Err(e) = result {
            error!(error = %e, "Broker task failed");
            first_error.get_or_insert(e);
        }
    }

    first_error.map_or(Ok(()), Err)
}

/// Spawn dispatch and reclaim loops for one route
pub(crate) fn spawn_consumers(
    ctx: &BrokerContext,
    policy: Arc<dyn DeliveryPolicy>,
    channel: &str,
    topic: &str,
    handler: Arc<dyn Handler>,
    shutdown: watch::Receiver<bool>,
) -> Vec<TaskHandle> {
    let engine = DispatchEngine::new(ctx.clone(), policy.clone(), channel, topic, handler);
    let reclaimer = DeadLetterReclaimer::new(ctx.clone(), policy, channel, topic);

    let dispatch_shutdown = shutdown.clone();
    vec![
        tokio::spawn(async move { engine.run(dispatch_shutdown).await }),
        tokio::spawn(async move { reclaimer.run(shutdown).await }),
    ]
}

/// Fill configuration defaults and stamp the message for `mode`
pub(crate) fn prepare(ctx: &BrokerContext, mut message: Message, mode: Mode) -> Message {
    let config = ctx.config();

    if message.channel.is_empty() {
        message.channel = keys::DEFAULT_CHANNEL.to_string();
    }
    if message.topic.is_empty() {
        message.topic = keys::DEFAULT_TOPIC.to_string();
    }

    message.mode = mode;
    message.status = Status::Published;
    message.retry.get_or_insert(config.job_max_retry);
    message
        .time_to_run_ms
        .get_or_insert(config.time_to_run.as_millis() as u64);
    message
}

/// Entry point owning the shared context and one broker per mode
#[derive(Clone)]
pub struct Broker {
    ctx: BrokerContext,
    normal: Arc<NormalBroker>,
    sequential: Arc<SequentialBroker>,
    sequential_lock: Arc<SequentialLockBroker>,
    scheduled: Arc<ScheduledBroker>,
}

impl Broker {
    pub fn new(ctx: BrokerContext) -> Self {
        Self {
            normal: Arc::new(NormalBroker::new(ctx.clone())),
            sequential: Arc::new(SequentialBroker::new(ctx.clone())),
            sequential_lock: Arc::new(SequentialLockBroker::new(ctx.clone())),
            scheduled: Arc::new(ScheduledBroker::new(ctx.clone())),
            ctx,
        }
    }

    /// Broker with the default process log and alerter
    pub fn connect(redis: RedisHandle, config: crate::BrokerConfig) -> Self {
        Self::new(BrokerContext::new(redis, config))
    }

    pub fn context(&self) -> &BrokerContext {
        &self.ctx
    }

    pub fn normal(&self) -> Arc<NormalBroker> {
        self.normal.clone()
    }

    pub fn sequential(&self) -> Arc<SequentialBroker> {
        self.sequential.clone()
    }

    pub fn sequential_lock(&self) -> Arc<SequentialLockBroker> {
        self.sequential_lock.clone()
    }

    pub fn scheduled(&self) -> Arc<ScheduledBroker> {
        self.scheduled.clone()
    }

    pub fn for_mode(&self, mode: Mode) -> Arc<dyn DeliveryBroker> {
        match mode {
            Mode::Normal => self.normal.clone(),
            Mode::Sequential => self.sequential.clone(),
            Mode::SequentialLock => self.sequential_lock.clone(),
            Mode::Scheduled => self.scheduled.clone(),
        }
    }

    /// Enqueue through the broker matching `message.mode`
    pub async fn enqueue(&self, message: Message) -> Result<(), BrokerError> {
        self.for_mode(message.mode).enqueue(message).await
    }

    pub fn dead_letters(&self) -> DeadLetters {
        DeadLetters::new(self.clone())
    }

    pub fn status_reader(&self) -> StatusReader {
        StatusReader::new(self.ctx.redis(), self.ctx.keys().clone())
    }
}
