use super::{DeliveryBroker, TaskHandle, prepare, spawn_consumers};
use crate::context::BrokerContext;
use crate::error::BrokerError;
use crate::handler::Handler;
use crate::message::{JOB_FIELD, Message, Mode};
use crate::metrics::BrokerMetrics;
use crate::policy::{DeliveryPolicy, PlainPolicy};
use crate::scheduler::Scheduler;
use async_trait::async_trait;
use std::sync::Arc;
use tokio::sync::watch;
use tracing::debug;

/// Delayed delivery through a time-scored zset
///
/// Messages become visible to consumers only after the [`Scheduler`] moves
/// them onto the delay stream; `start` runs it next to the consumer loops.
pub struct ScheduledBroker {
    ctx: BrokerContext,
}

impl ScheduledBroker {
    pub fn new(ctx: BrokerContext) -> Self {
        Self { ctx }
    }

    pub fn scheduler(&self, channel: &str, topic: &str) -> Scheduler {
        Scheduler::new(self.ctx.clone(), channel, topic)
    }

    /// Messages still waiting for promotion
    pub async fn waiting(&self, channel: &str, topic: &str) -> Result<i64, BrokerError> {
        let mut conn = self.ctx.conn();
        let count: i64 = redis::cmd("ZCARD")
            .arg(self.ctx.keys().zset(channel, topic))
            .query_async(&mut conn)
            .await?;
        Ok(count)
    }
}

#[async_trait]
impl DeliveryBroker for ScheduledBroker {
    fn mode(&self) -> Mode {
        Mode::Scheduled
    }

    async fn enqueue(&self, message: Message) -> Result<(), BrokerError> {
        let message = prepare(&self.ctx, message, Mode::Scheduled);
        let zset_key = self.ctx.keys().zset(&message.channel, &message.topic);
        let stream_key = self
            .ctx
            .keys()
            .stream(Mode::Scheduled, &message.channel, &message.topic);

        let mut conn = self.ctx.conn();
        let _: i64 = redis::cmd("ZADD")
            .arg(&zset_key)
            .arg(message.score())
            .arg(message.encode()?)
            .query_async(&mut conn)
            .await?;

        BrokerMetrics::new(stream_key, Mode::Scheduled.as_str()).message_enqueued();
        debug!(
            zset = %zset_key,
            message_id = %message.id,
            due_at = %message.due_at(),
            "Scheduled"
        );
        Ok(())
    }

    /// Dead letters come off the delay stream, so they go back onto it
    /// directly instead of waiting for another promotion
    async fn readmit(&self, message: Message) -> Result<String, BrokerError> {
        let message = prepare(&self.ctx, message, Mode::Scheduled);
        let stream_key = self
            .ctx
            .keys()
            .stream(Mode::Scheduled, &message.channel, &message.topic);

        let mut conn = self.ctx.conn();
        let stream_id: String = redis::cmd("XADD")
            .arg(&stream_key)
            .arg("*")
            .arg(JOB_FIELD)
            .arg(message.encode()?)
            .query_async(&mut conn)
            .await?;

        debug!(
            stream = %stream_key,
            stream_id = %stream_id,
            message_id = %message.id,
            "Readmitted"
        );
        Ok(stream_id)
    }

    fn policy(&self) -> Arc<dyn DeliveryPolicy> {
        Arc::new(PlainPolicy(Mode::Scheduled))
    }

    fn start(
        &self,
        channel: &str,
        topic: &str,
        handler: Arc<dyn Handler>,
        shutdown: watch::Receiver<bool>,
    ) -> Vec<TaskHandle> {
        let scheduler = self.scheduler(channel, topic);
        let scheduler_shutdown = shutdown.clone();

        let mut handles =
            spawn_consumers(&self.ctx, self.policy(), channel, topic, handler, shutdown);
        handles.push(tokio::spawn(async move {
            scheduler.run(scheduler_shutdown).await
        }));
        handles
    }
}
