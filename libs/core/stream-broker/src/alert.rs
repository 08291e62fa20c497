//! Operator alerts
//!
//! Alerts are fire-and-forget: the broker never waits on delivery and never
//! fails because an alerter did.

use serde::Serialize;
use tracing::warn;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum AlertKind {
    DeadLetter,
    SchedulerFailure,
    ReadFailure,
}

#[derive(Debug, Clone, Serialize)]
pub struct Alert {
    pub kind: AlertKind,
    pub stream: String,
    pub message_id: Option<String>,
    pub detail: String,
}

impl Alert {
    pub fn new(kind: AlertKind, stream: impl Into<String>, detail: impl Into<String>) -> Self {
        Self {
            kind,
            stream: stream.into(),
            message_id: None,
            detail: detail.into(),
        }
    }

    pub fn with_message_id(mut self, id: impl Into<String>) -> Self {
        self.message_id = Some(id.into());
        self
    }
}

/// Receives alerts. Implementations must not block; spawn if delivery is slow.
pub trait Alerter: Send + Sync {
    fn notify(&self, alert: Alert);
}

/// Default alerter: a structured warning in the service log
#[derive(Debug, Clone, Copy, Default)]
pub struct LogAlerter;

impl Alerter for LogAlerter {
    fn notify(&self, alert: Alert) {
        warn!(
            kind = ?alert.kind,
            stream = %alert.stream,
            message_id = ?alert.message_id,
            detail = %alert.detail,
            "Broker alert"
        );
    }
}
