use super::{DeliveryBroker, TaskHandle, prepare, spawn_consumers};
use crate::context::BrokerContext;
use crate::error::BrokerError;
use crate::handler::Handler;
use crate::message::{JOB_FIELD, Message, Mode};
use crate::metrics::BrokerMetrics;
use crate::policy::{DeliveryPolicy, PlainPolicy};
use async_trait::async_trait;
use std::sync::Arc;
use tokio::sync::watch;
use tracing::debug;

/// At-least-once delivery on a capped stream
pub struct NormalBroker {
    ctx: BrokerContext,
}

impl NormalBroker {
    pub fn new(ctx: BrokerContext) -> Self {
        Self { ctx }
    }

    /// Append and return the stream id
    pub async fn publish(&self, message: Message) -> Result<String, BrokerError> {
        let message = prepare(&self.ctx, message, Mode::Normal);
        let stream_key = self
            .ctx
            .keys()
            .stream(Mode::Normal, &message.channel, &message.topic);
        let max_len = message.max_len.unwrap_or(self.ctx.config().max_len).max(1);

        let mut conn = self.ctx.conn();
        let stream_id: String = redis::cmd("XADD")
            .arg(&stream_key)
            .arg("MAXLEN")
            .arg("=")
            .arg(max_len)
            .arg("*")
            .arg(JOB_FIELD)
            .arg(message.encode()?)
            .query_async(&mut conn)
            .await?;

        BrokerMetrics::new(stream_key.as_str(), Mode::Normal.as_str()).message_enqueued();
        debug!(stream = %stream_key, stream_id = %stream_id, message_id = %message.id, "Enqueued");
        Ok(stream_id)
    }
}

#[async_trait]
impl DeliveryBroker for NormalBroker {
    fn mode(&self) -> Mode {
        Mode::Normal
    }

    async fn enqueue(&self, message: Message) -> Result<(), BrokerError> {
        self.publish(message).await.map(|_| ())
    }

    async fn readmit(&self, message: Message) -> Result<String, BrokerError> {
        self.publish(message).await
    }

    fn policy(&self) -> Arc<dyn DeliveryPolicy> {
        Arc::new(PlainPolicy(Mode::Normal))
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
