use async_trait::async_trait;
use stream_broker::{BoxError, Handler, HandlerError, Message};
use tracing::{error, info};

/// Logs each delivered message and acknowledges it
pub struct LoggingHandler;

#[async_trait]
impl Handler for LoggingHandler {
    async fn handle(&self, message: &Message) -> Result<(), BoxError> {
        if message.payload.is_empty() {
            return Err("empty payload".into());
        }

        info!(
            message_id = %message.id,
            channel = %message.channel,
            topic = %message.topic,
            mode = %message.mode,
            priority = message.priority,
            payload_bytes = message.payload.len(),
            "Message delivered"
        );
        Ok(())
    }

    async fn on_error(&self, message: &Message, err: &HandlerError) {
        error!(message_id = %message.id, error = %err, "Giving up on message");
    }

    fn name(&self) -> &'static str {
        "LoggingHandler"
    }
}
