//! Shared consumer-group dispatch loop
//!
//! One `DispatchEngine` serves one (channel, topic, mode) stream:
//!
//! ```text
//! XREADGROUP (BLOCK, COUNT = consumers) on a dedicated reader connection
//!   -> worker pool: HSET received marker, decode, RetryExecutor(handler), ProcessResult
//!   -> process log writes (failed writes stay pending)
//!   -> XACK + XDEL + HDEL (one pipeline)
//!   -> policy.on_settled
//! ```
//!
//! An entry is marked received only once a worker holds a pool permit for it,
//! so after a crash the reclaimer requeues batch-mates that never started.
//! If the ack pipeline fails after the log writes, the entries are marked
//! settled and the reclaimer clears them without a second record.

use crate::alert::{Alert, AlertKind};
use crate::context::BrokerContext;
use crate::error::BrokerError;
use crate::handler::Handler;
use crate::keys;
use crate::message::{Message, Status};
use crate::metrics::BrokerMetrics;
use crate::policy::DeliveryPolicy;
use crate::result::ProcessResult;
use crate::stream::{RawEntry, RouteStream};
use redis::aio::ConnectionManager;
use chrono::Utc;
use futures::FutureExt;
use futures::future::join_all;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{OnceCell, Semaphore, watch};
use tokio::task::JoinSet;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

const MAX_BACKOFF_SECS: u64 = 30;

/// Counts for one processed batch
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BatchReport {
    pub received: usize,
    pub succeeded: usize,
    pub failed: usize,
    pub decode_errors: usize,
    pub log_failures: usize,
    pub acked: usize,
}

/// Outcome of one worker
struct Settled {
    stream_id: String,
    message: Option<Message>,
    result: ProcessResult,
}

pub struct DispatchEngine {
    ctx: BrokerContext,
    stream: RouteStream,
    policy: Arc<dyn DeliveryPolicy>,
    handler: Arc<dyn Handler>,
    consumer_id: String,
    semaphore: Arc<Semaphore>,
    reader: OnceCell<ConnectionManager>,
    metrics: BrokerMetrics,
}

impl DispatchEngine {
    pub fn new(
        ctx: BrokerContext,
        policy: Arc<dyn DeliveryPolicy>,
        channel: &str,
        topic: &str,
        handler: Arc<dyn Handler>,
    ) -> Self {
        let mode = policy.mode();
        let stream_key = ctx.keys().stream(mode, channel, topic);
        let stream = RouteStream::new(ctx.redis(), stream_key.clone(), keys::group_name(channel));
        let consumer_id = ctx.config().consumer_id();
        let semaphore = Arc::new(Semaphore::new(ctx.config().worker_pool_size));

        Self {
            metrics: BrokerMetrics::new(stream_key, mode.as_str()),
            ctx,
            stream,
            policy,
            handler,
            consumer_id,
            semaphore,
            reader: OnceCell::new(),
        }
    }

    pub fn stream(&self) -> &RouteStream {
        &self.stream
    }

    pub fn consumer_id(&self) -> &str {
        &self.consumer_id
    }

    /// Run until `shutdown` flips to true or its sender is dropped
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) -> Result<(), BrokerError> {
        info!(
            stream = %self.stream.stream(),
            group = %self.stream.group(),
            consumer_id = %self.consumer_id,
            handler = %self.handler.name(),
            workers = self.ctx.config().worker_pool_size,
            batch_size = self.ctx.config().consumers,
            "Starting dispatch loop"
        );

        self.stream.ensure_group().await?;

        let mut consecutive_errors: u32 = 0;

        loop {
            if *shutdown.borrow() {
                break;
            }

            // Only the blocking read is raced against shutdown; a batch in
            // flight runs to completion, bounded by each message's deadline.
            let read = tokio::select! {
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                    continue;
                }
                read = self.read() => read,
            };

            let result = match read {
                Ok(entries) if entries.is_empty() => Ok(()),
                Ok(entries) => self.process_batch(entries).await.map(|_| ()),
                Err(e) => Err(e),
            };

            match result {
                Ok(()) => {
                    if consecutive_errors > 0 {
                        info!(consecutive_errors, "Dispatch recovered");
                        consecutive_errors = 0;
                    }
                }
                Err(e) => {
                    consecutive_errors += 1;
                    let backoff = self.on_loop_error(&e, consecutive_errors).await;

                    tokio::select! {
                        changed = shutdown.changed() => {
                            if changed.is_err() || *shutdown.borrow() {
                                break;
                            }
                        }
                        _ = tokio::time::sleep(backoff) => {}
                    }
                }
            }
        }

        info!(
            stream = %self.stream.stream(),
            consumer_id = %self.consumer_id,
            "Dispatch loop stopped"
        );
        Ok(())
    }

    /// Read one batch and process it
    pub async fn poll_batch(&self) -> Result<BatchReport, BrokerError> {
        let entries = self.read().await?;
        if entries.is_empty() {
            return Ok(BatchReport::default());
        }
        self.process_batch(entries).await
    }

    async fn read(&self) -> Result<Vec<RawEntry>, BrokerError> {
        let reader = self
            .reader
            .get_or_try_init(|| self.ctx.open_reader())
            .await?;
        let mut conn = reader.clone();

        let config = self.ctx.config();
        self.stream
            .read_group(&mut conn, &self.consumer_id, config.consumers, config.block_timeout)
            .await
    }

    /// Log, alert and pick a backoff for a failed iteration
    async fn on_loop_error(&self, e: &BrokerError, consecutive_errors: u32) -> Duration {
        if e.is_nogroup_error() {
            warn!(stream = %self.stream.stream(), "Consumer group missing, recreating");
            if let Err(create_err) = self.stream.ensure_group().await {
                error!(error = %create_err, "Failed to recreate consumer group");
            }
            return Duration::from_millis(100);
        }

        if e.is_connection_error() {
            let backoff_secs = 2u64.pow(consecutive_errors.min(5)).min(MAX_BACKOFF_SECS);
            warn!(
                error = %e,
                consecutive_errors,
                backoff_secs,
                "Redis connection error, backing off"
            );
            if consecutive_errors == 1 {
                self.ctx.alert(Alert::new(
                    AlertKind::ReadFailure,
                    self.stream.stream(),
                    e.to_string(),
                ));
            }
            return Duration::from_secs(backoff_secs);
        }

        error!(stream = %self.stream.stream(), error = %e, "Dispatch iteration failed");
        self.ctx.alert(Alert::new(
            AlertKind::ReadFailure,
            self.stream.stream(),
            e.to_string(),
        ));
        Duration::from_secs(1)
    }

    /// Run a batch through the worker pool, log it and settle it
    pub async fn process_batch(&self, entries: Vec<RawEntry>) -> Result<BatchReport, BrokerError> {
        let mut report = BatchReport {
            received: entries.len(),
            ..Default::default()
        };
        self.metrics.batch_received(entries.len());

        let settled = self.fan_out(entries).await;

        let log = self.ctx.process_log();
        let written = join_all(settled.iter().map(|s| log.add_log(&s.result))).await;

        let mut ack_ids = Vec::with_capacity(settled.len());
        let mut to_settle = Vec::with_capacity(settled.len());

        for (settled, write) in settled.into_iter().zip(written) {
            match settled.result.status {
                Status::Success => report.succeeded += 1,
                _ if settled.message.is_none() => report.decode_errors += 1,
                _ => report.failed += 1,
            }

            if let Err(e) = write {
                report.log_failures += 1;
                self.metrics.log_write_failed();
                warn!(
                    stream_id = %settled.stream_id,
                    message_id = %settled.result.id,
                    error = %e,
                    "Process log write failed, leaving entry pending"
                );
                continue;
            }

            ack_ids.push(settled.stream_id);
            if let Some(message) = settled.message {
                to_settle.push((message, settled.result));
            }
        }

        let acked = self.stream.ack_and_delete(&ack_ids).await;
        if let Err(e) = &acked {
            warn!(
                stream = %self.stream.stream(),
                count = ack_ids.len(),
                error = %e,
                "Ack failed after logging, marking entries settled"
            );
            if let Err(mark_err) = self.stream.mark_settled(&ack_ids).await {
                error!(error = %mark_err, "Failed to mark entries settled");
            }
        } else {
            report.acked = ack_ids.len();
        }

        // The outcome is already logged, so the hooks run even if the ack failed
        for (message, result) in &to_settle {
            if let Err(e) = self.policy.on_settled(message, result).await {
                warn!(message_id = %message.id, error = %e, "Settle hook failed");
            }
        }

        acked?;
        debug!(stream = %self.stream.stream(), report = ?report, "Batch settled");
        Ok(report)
    }

    /// Process every entry on the bounded worker pool
    async fn fan_out(&self, entries: Vec<RawEntry>) -> Vec<Settled> {
        let mut join_set: JoinSet<Option<Settled>> = JoinSet::new();

        for entry in entries {
            let semaphore = Arc::clone(&self.semaphore);
            let handler = Arc::clone(&self.handler);
            let ctx = self.ctx.clone();
            let stream = self.stream.clone();
            let metrics = self.metrics.clone();

            join_set.spawn(async move {
                // The semaphore is never closed
                let _permit = semaphore.acquire_owned().await.ok();

                if let Err(e) = stream.mark_received(std::slice::from_ref(&entry.id)).await {
                    // Unmarked and unacked, so the reclaimer requeues it
                    warn!(stream_id = %entry.id, error = %e, "Failed to mark entry received");
                    return None;
                }
                Some(run_entry(ctx, handler, metrics, stream.stream(), entry).await)
            });
        }

        let mut settled = Vec::new();
        while let Some(joined) = join_set.join_next().await {
            match joined {
                Ok(Some(s)) => settled.push(s),
                Ok(None) => {}
                // The entry stays pending and is picked up by the reclaimer
                Err(e) => error!(error = %e, "Worker task aborted"),
            }
        }
        settled
    }
}

/// Decode and handle one entry
async fn run_entry(
    ctx: BrokerContext,
    handler: Arc<dyn Handler>,
    metrics: BrokerMetrics,
    stream_key: &str,
    entry: RawEntry,
) -> Settled {
    let mut message = match Message::from_fields(&entry.id, &entry.fields) {
        Ok(message) => message,
        Err(e) => {
            metrics.decode_failed();
            warn!(stream_id = %entry.id, error = %e, "Dropping undecodable entry");
            return Settled {
                result: ProcessResult::decode_error(
                    stream_key,
                    &entry.id,
                    entry.job().unwrap_or_default(),
                    &e.to_string(),
                ),
                stream_id: entry.id,
                message: None,
            };
        }
    };
    message.status = Status::Received;

    let config = ctx.config();
    let ttr = message.time_to_run().unwrap_or(config.time_to_run);
    let budget = message.retry.unwrap_or(config.job_max_retry);
    let deadline = Instant::now() + ttr;
    let begin = Utc::now();
    let started = std::time::Instant::now();

    let (retries, outcome) = ctx
        .retry_executor()
        .run(deadline, budget, || handler.handle(&message))
        .await;

    if let Err(err) = &outcome {
        warn!(
            message_id = %message.id,
            stream_id = %entry.id,
            handler = %handler.name(),
            retries,
            error = %err,
            "Handler failed"
        );
        if AssertUnwindSafe(handler.on_error(&message, err))
            .catch_unwind()
            .await
            .is_err()
        {
            error!(message_id = %message.id, "Error hook panicked");
        }
    }

    let result = ProcessResult::finished(
        &message,
        stream_key,
        &entry.id,
        begin,
        retries,
        outcome.as_ref().map(|_| ()),
    );
    metrics.message_processed(result.status.as_str(), retries, started.elapsed());
    message.status = result.status;

    Settled {
        stream_id: entry.id,
        message: Some(message),
        result,
    }
}
