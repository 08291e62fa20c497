//! Per-mode behavior plugged into the shared loops

use crate::error::BrokerError;
use crate::message::{Message, Mode};
use crate::result::ProcessResult;
use async_trait::async_trait;

/// What a delivery mode adds on top of the shared dispatch and reclaim loops.
#[async_trait]
pub trait DeliveryPolicy: Send + Sync {
    fn mode(&self) -> Mode;

    /// Called once a message has left its stream for good: acknowledged after
    /// a handler run, or moved to the dead-letter log.
    async fn on_settled(
        &self,
        _message: &Message,
        _result: &ProcessResult,
    ) -> Result<(), BrokerError> {
        Ok(())
    }
}

/// Policy for modes with nothing to clean up
#[derive(Debug, Clone, Copy)]
pub struct PlainPolicy(pub Mode);

#[async_trait]
impl DeliveryPolicy for PlainPolicy {
    fn mode(&self) -> Mode {
        self.0
    }
}
