//! Stream Broker
//!
//! A multi-mode message broker on Redis Streams and consumer groups.
//!
//! ## Features
//!
//! - **Normal**: capped stream, at-least-once, no ordering
//! - **Sequential**: idempotent admission keyed by message id, with status tracking
//! - **Sequential lock**: at most one in-flight message per order key
//! - **Scheduled**: delayed delivery through a time-scored zset and a promotion loop
//! - **Dead-letter reclaim**: stuck pending entries are requeued or moved to the process log
//! - **Retry with jittered backoff** under a per-message deadline; handler panics are contained
//! - **Prometheus metrics** per stream and mode
//!
//! ## Example
//!
//! ```ignore
//! use stream_broker::{Broker, BrokerConfig, Message, Supervisor, connect};
//!
//! let redis = connect("redis://127.0.0.1:6379").await?;
//! let broker = Broker::connect(redis, BrokerConfig::new("shop"));
//!
//! broker.enqueue(Message::new("orders", "created", r#"{"id":1}"#)).await?;
//!
//! let mut supervisor = Supervisor::new();
//! supervisor.register(broker.normal().as_ref(), "orders", "created", Arc::new(MyHandler));
//! supervisor.run_until(shutdown_signal()).await?;
//! ```

pub mod alert;
pub mod broker;
mod config;
mod connection;
mod context;
mod dispatch;
mod error;
mod handler;
pub mod keys;
pub mod log;
mod message;
pub mod metrics;
mod policy;
mod reclaim;
mod result;
mod retry;
mod scheduler;
pub mod scripts;
mod status;
mod stream;
mod supervisor;

// Re-export main types
pub use alert::{Alert, AlertKind, Alerter, LogAlerter};
pub use broker::{
    Broker, DeliveryBroker, NormalBroker, ScheduledBroker, SequenceLockInfo, SequentialBroker,
    SequentialLockBroker, TaskHandle,
};
pub use config::{BrokerConfig, default_worker_pool_size};
pub use connection::{
    COMMAND_TIMEOUT, ConnectRetry, RedisHandle, connect, connect_with_retry, read_timeout,
};
pub use context::BrokerContext;
pub use dispatch::{BatchReport, DispatchEngine};
pub use error::{BoxError, BrokerError, ErrorCategory, HandlerError};
pub use handler::Handler;
pub use keys::KeySpace;
pub use log::{DeadLetterEntry, DeadLetters, LogStats, ProcessLog, RedisProcessLog};
pub use message::{JOB_FIELD, MAX_PRIORITY, Message, Mode, Status};
pub use self::metrics::{BrokerMetrics, init_metrics};
pub use policy::{DeliveryPolicy, PlainPolicy};
pub use reclaim::{DeadLetterReclaimer, ReclaimOutcome};
pub use result::{Level, LogType, ProcessResult};
pub use retry::{Backoff, RetryExecutor};
pub use scheduler::{PromoteOutcome, Scheduler};
pub use status::{MessageStatus, StatusReader};
pub use stream::{PendingEntry, Progress, RawEntry, RouteStream};
pub use supervisor::Supervisor;
