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
use std::sync::Arc;
use tokio::sync::watch;
use tracing::{debug, info};

/// Idempotent admission keyed by message id
///
/// The status hash written on admission doubles as the dedup marker and as
/// the record `StatusReader` reads back. It expires after `status_retention`.
pub struct SequentialBroker {
    ctx: BrokerContext,
}

impl SequentialBroker {
    pub fn new(ctx: BrokerContext) -> Self {
        Self { ctx }
    }
}

#[async_trait]
impl DeliveryBroker for SequentialBroker {
    fn mode(&self) -> Mode {
        Mode::Sequential
    }

    async fn enqueue(&self, message: Message) -> Result<(), BrokerError> {
        let message = prepare(&self.ctx, message, Mode::Sequential);
        let keys = self.ctx.keys();
        let stream_key = keys.stream(Mode::Sequential, &message.channel, &message.topic);
        let status_key = keys.status(&message.channel, &message.topic, &message.id);
        let metrics = BrokerMetrics::new(stream_key.as_str(), Mode::Sequential.as_str());

        let mut conn = self.ctx.conn();
        let duplicate = scripts::check_idempotent_insert(
            &mut conn,
            &status_key,
            &stream_key,
            &message.encode()?,
            self.ctx.config().status_retention,
        )
        .await?;

        if duplicate {
            metrics.duplicate_rejected();
            info!(stream = %stream_key, message_id = %message.id, "Rejected duplicate message");
            return Err(BrokerError::IdempotentDuplicate { id: message.id });
        }

        metrics.message_enqueued();
        debug!(stream = %stream_key, message_id = %message.id, "Enqueued");
        Ok(())
    }

    /// The status hash of the id already exists, so the dedup check is skipped
    async fn readmit(&self, message: Message) -> Result<String, BrokerError> {
        let message = prepare(&self.ctx, message, Mode::Sequential);
        let keys = self.ctx.keys();
        let stream_key = keys.stream(Mode::Sequential, &message.channel, &message.topic);
        let status_key = keys.status(&message.channel, &message.topic, &message.id);

        let mut conn = self.ctx.conn();
        let stream_id = scripts::readmit_sequential(
            &mut conn,
            &status_key,
            &stream_key,
            &message.encode()?,
            self.ctx.config().status_retention,
        )
        .await?;

        debug!(stream = %stream_key, message_id = %message.id, "Readmitted");
        Ok(stream_id)
    }

    fn policy(&self) -> Arc<dyn DeliveryPolicy> {
        Arc::new(SequentialPolicy {
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
}

/// Records the final outcome in the message's status hash
struct SequentialPolicy {
    ctx: BrokerContext,
}

#[async_trait]
impl DeliveryPolicy for SequentialPolicy {
    fn mode(&self) -> Mode {
        Mode::Sequential
    }

    async fn on_settled(
        &self,
        message: &Message,
        result: &ProcessResult,
    ) -> Result<(), BrokerError> {
        let status_key = self
            .ctx
            .keys()
            .status(&message.channel, &message.topic, &message.id);
        let retention = self.ctx.config().status_retention.as_secs().max(1);

        let mut conn = self.ctx.conn();
        redis::pipe()
            .cmd("HSET")
            .arg(&status_key)
            .arg("status")
            .arg(result.status.as_str())
            .arg("retry")
            .arg(result.retry)
            .arg("info")
            .arg(result.info.as_deref().unwrap_or_default())
            .arg("end_time")
            .arg(result.end_time.timestamp_millis())
            .ignore()
            .cmd("EXPIRE")
            .arg(&status_key)
            .arg(retention)
            .ignore()
            .query_async::<()>(&mut conn)
            .await?;

        Ok(())
    }
}
