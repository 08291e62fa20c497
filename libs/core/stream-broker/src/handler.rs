//! Consumer-side handler trait

use crate::error::{BoxError, HandlerError};
use crate::message::Message;
use async_trait::async_trait;

/// Processes messages delivered on a route.
///
/// Delivery is at-least-once: a handler may see the same message again after a
/// crash or a dead-letter requeue, so side effects should be idempotent.
///
/// # Example
///
/// ```rust,ignore
/// use stream_broker::{BoxError, Handler, Message};
///
/// struct ReceiptMailer {
///     mailer: Arc<dyn Mailer>,
/// }
///
/// #[async_trait]
/// impl Handler for ReceiptMailer {
///     async fn handle(&self, message: &Message) -> Result<(), BoxError> {
///         let order: Order = message.payload_json()?;
///         self.mailer.send_receipt(&order).await?;
///         Ok(())
///     }
///
///     fn name(&self) -> &'static str {
///         "ReceiptMailer"
///     }
/// }
/// ```
#[async_trait]
pub trait Handler: Send + Sync {
    /// Handle one message. Errors and panics are retried up to the message's
    /// retry budget.
    async fn handle(&self, message: &Message) -> Result<(), BoxError>;

    /// Called once after the retry budget is spent or the deadline passed
    async fn on_error(&self, _message: &Message, _error: &HandlerError) {}

    /// Name used in logs and metric labels
    fn name(&self) -> &'static str {
        "handler"
    }
}
