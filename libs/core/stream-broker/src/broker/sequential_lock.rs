use super::{DeliveryBroker, TaskHandle, prepare, spawn_consumers};
use crate::context::BrokerContext;
use crate::error::BrokerError;
use crate::handler::Handler;
use crate::message::{Message, Mode};
use crate::metrics::BrokerMetrics;
use crate::policy::DeliveryPolicy;
use crate::result::ProcessResult;
use crate::scripts;
use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{debug, info, warn};

/// Current holder of an order-key lock
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SequenceLockInfo {
    pub order_key: String,
    pub message_id: String,
    pub stream_id: String,
    pub locked_at: Option<DateTime<Utc>>,
    /// Remaining lifetime; `None` when the key has no expiry
    pub ttl: Option<Duration>,
}

/// At most one in-flight message per order key
///
/// Enqueue is rejected with [`BrokerError::SequentialLockBusy`] while an
/// earlier message with the same order key is unsettled. The lock is freed
/// when that message is acknowledged or dead-lettered, when its TTL runs out,
/// or through [`DeliveryBroker::force_unlock`].
pub struct SequentialLockBroker {
    ctx: BrokerContext,
}

impl SequentialLockBroker {
    pub fn new(ctx: BrokerContext) -> Self {
        Self { ctx }
    }

    /// Locked insert. Returns the stream id.
    async fn admit(&self, message: Message) -> Result<String, BrokerError> {
        let message = prepare(&self.ctx, message, Mode::SequentialLock);
        let order_key = match message.order_key.as_deref() {
            Some(key) if !key.is_empty() => key.to_string(),
            _ => {
                return Err(BrokerError::InvalidMessage(
                    "sequential-lock messages need an order key".to_string(),
                ));
            }
        };

        let keys = self.ctx.keys();
        let stream_key = keys.stream(Mode::SequentialLock, &message.channel, &message.topic);
        let lock_key = keys.lock(&message.channel, &message.topic, &order_key);
        let ttl = message
            .lock_ttl_secs
            .map(Duration::from_secs)
            .unwrap_or(self.ctx.config().lock_ttl);
        let metrics = BrokerMetrics::new(stream_key.as_str(), Mode::SequentialLock.as_str());

        let mut conn = self.ctx.conn();
        let admitted = scripts::sequence_locked_insert(
            &mut conn,
            &stream_key,
            &lock_key,
            ttl,
            &message.encode()?,
            &message.id,
        )
        .await?;

        match admitted {
            Some(stream_id) => {
                metrics.message_enqueued();
                debug!(
                    stream = %stream_key,
                    stream_id = %stream_id,
                    message_id = %message.id,
                    order_key = %order_key,
                    "Enqueued"
                );
                Ok(stream_id)
            }
            None => {
                metrics.lock_busy();
                info!(stream = %stream_key, order_key = %order_key, "Order key is locked");
                Err(BrokerError::SequentialLockBusy { order_key })
            }
        }
    }

    pub async fn lock_info(
        &self,
        channel: &str,
        topic: &str,
        order_key: &str,
    ) -> Result<Option<SequenceLockInfo>, BrokerError> {
        let lock_key = self.ctx.keys().lock(channel, topic, order_key);
        let mut conn = self.ctx.conn();

        let (fields, ttl): (HashMap<String, String>, i64) = redis::pipe()
            .cmd("HGETALL")
            .arg(&lock_key)
            .cmd("TTL")
            .arg(&lock_key)
            .query_async(&mut conn)
            .await?;

        let Some(message_id) = fields.get("id") else {
            return Ok(None);
        };

        Ok(Some(SequenceLockInfo {
            order_key: order_key.to_string(),
            message_id: message_id.clone(),
            stream_id: fields.get("stream_id").cloned().unwrap_or_default(),
            locked_at: fields
                .get("locked_at")
                .and_then(|v| v.parse::<i64>().ok())
                .and_then(|ms| Utc.timestamp_millis_opt(ms).single()),
            ttl: u64::try_from(ttl).ok().map(Duration::from_secs),
        }))
    }
}

#[async_trait]
impl DeliveryBroker for SequentialLockBroker {
    fn mode(&self) -> Mode {
        Mode::SequentialLock
    }

    async fn enqueue(&self, message: Message) -> Result<(), BrokerError> {
        self.admit(message).await.map(|_| ())
    }

    /// Goes through the locked insert like any new message, so a requeue never
    /// puts a second message in flight for the order key
    async fn readmit(&self, message: Message) -> Result<String, BrokerError> {
        self.admit(message).await
    }

    fn policy(&self) -> Arc<dyn DeliveryPolicy> {
        Arc::new(SequentialLockPolicy {
            ctx: self.ctx.clone(),
        })
    }

    fn start(
        &self,
        channel: &str,
        topic: &str,
        handler: Arc<dyn Handler>,
        shutdown: watch::Receiver<bool>,
    ) -> Vec<TaskHandle> {
        spawn_consumers(&self.ctx, self.policy(), channel, topic, handler, shutdown)
    }

    async fn force_unlock(
        &self,
        channel: &str,
        topic: &str,
        order_key: &str,
    ) -> Result<bool, BrokerError> {
        let lock_key = self.ctx.keys().lock(channel, topic, order_key);
        let mut conn = self.ctx.conn();

        let removed: i64 = redis::cmd("DEL")
            .arg(&lock_key)
            .query_async(&mut conn)
            .await?;

        if removed > 0 {
            warn!(lock = %lock_key, order_key, "Sequence lock forcibly released");
        }
        Ok(removed > 0)
    }
}

/// Frees the order-key lock once its holder settles
struct SequentialLockPolicy {
    ctx: BrokerContext,
}

#[async_trait]
impl DeliveryPolicy for SequentialLockPolicy {
    fn mode(&self) -> Mode {
        Mode::SequentialLock
    }

    async fn on_settled(
        &self,
        message: &Message,
        _result: &ProcessResult,
    ) -> Result<(), BrokerError> {
        let Some(order_key) = message.order_key.as_deref() else {
            return Ok(());
        };

        let lock_key = self
            .ctx
            .keys()
            .lock(&message.channel, &message.topic, order_key);
        let mut conn = self.ctx.conn();

        // A lock taken over by a later message after TTL expiry is left alone
        if !scripts::release_sequence_lock(&mut conn, &lock_key, &message.id).await? {
            debug!(lock = %lock_key, message_id = %message.id, "Lock no longer held by message");
        }
        Ok(())
    }
}
