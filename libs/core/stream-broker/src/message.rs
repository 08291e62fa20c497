//! Message model
//!
//! A `Message` travels through Redis as JSON in a single `job` field. Everything
//! else in the crate works with the typed struct.

use crate::error::BrokerError;
use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use std::time::Duration;
use uuid::Uuid;

/// Highest accepted priority; larger values are clamped
pub const MAX_PRIORITY: u8 = 10;

/// Stream field carrying the encoded message
pub const JOB_FIELD: &str = "job";

/// Delivery semantics of a route
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Mode {
    Normal,
    Sequential,
    SequentialLock,
    Scheduled,
}

impl Mode {
    pub const ALL: [Mode; 4] = [
        Mode::Normal,
        Mode::Sequential,
        Mode::SequentialLock,
        Mode::Scheduled,
    ];

    /// Segment used in the stream key (`<segment>_stream`)
    pub fn key_segment(&self) -> &'static str {
        match self {
            Mode::Normal => "normal",
            Mode::Sequential => "sequential",
            Mode::SequentialLock => "sequential_lock",
            Mode::Scheduled => "delay",
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Mode::Normal => "normal",
            Mode::Sequential => "sequential",
            Mode::SequentialLock => "sequential_lock",
            Mode::Scheduled => "scheduled",
        }
    }
}

impl fmt::Display for Mode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Mode {
    type Err = BrokerError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "normal" => Ok(Mode::Normal),
            "sequential" => Ok(Mode::Sequential),
            "sequential_lock" | "sequential-lock" | "lock" => Ok(Mode::SequentialLock),
            "scheduled" | "delay" => Ok(Mode::Scheduled),
            other => Err(BrokerError::Config(format!("unknown delivery mode '{}'", other))),
        }
    }
}

/// Lifecycle of a message
///
/// `prepare -> published -> pending -> received -> {success | failed}`, with
/// `dead_letter` for entries taken over by the reclaimer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Status {
    Prepare,
    Published,
    Pending,
    Received,
    Success,
    Failed,
    DeadLetter,
}

impl Status {
    pub fn as_str(&self) -> &'static str {
        match self {
            Status::Prepare => "prepare",
            Status::Published => "published",
            Status::Pending => "pending",
            Status::Received => "received",
            Status::Success => "success",
            Status::Failed => "failed",
            Status::DeadLetter => "dead_letter",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Status::Success | Status::Failed | Status::DeadLetter)
    }
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Status {
    type Err = BrokerError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "prepare" => Ok(Status::Prepare),
            "published" => Ok(Status::Published),
            "pending" => Ok(Status::Pending),
            "received" => Ok(Status::Received),
            "success" => Ok(Status::Success),
            "failed" => Ok(Status::Failed),
            "dead_letter" => Ok(Status::DeadLetter),
            other => Err(BrokerError::InvalidMessage(format!("unknown status '{}'", other))),
        }
    }
}

/// A unit of work routed by (channel, topic)
///
/// Optional fields fall back to the broker configuration when the message is
/// enqueued.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    pub id: String,
    pub channel: String,
    pub topic: String,
    pub payload: String,
    pub mode: Mode,
    #[serde(default)]
    pub priority: u8,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_len: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub retry: Option<u32>,
    pub add_time: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub execute_time: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub time_to_run_ms: Option<u64>,
    pub status: Status,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub order_key: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub lock_ttl_secs: Option<u64>,
}

impl Message {
    /// Create a normal-mode message with a fresh time-ordered id
    pub fn new(
        channel: impl Into<String>,
        topic: impl Into<String>,
        payload: impl Into<String>,
    ) -> Self {
        Self {
            id: Uuid::now_v7().to_string(),
            channel: channel.into(),
            topic: topic.into(),
            payload: payload.into(),
            mode: Mode::Normal,
            priority: 0,
            max_len: None,
            retry: None,
            add_time: Utc::now(),
            execute_time: None,
            time_to_run_ms: None,
            status: Status::Prepare,
            order_key: None,
            lock_ttl_secs: None,
        }
    }

    /// Create a message whose payload is `value` encoded as JSON
    pub fn json<T: Serialize>(
        channel: impl Into<String>,
        topic: impl Into<String>,
        value: &T,
    ) -> Result<Self, BrokerError> {
        Ok(Self::new(channel, topic, serde_json::to_string(value)?))
    }

    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.id = id.into();
        self
    }

    pub fn with_mode(mut self, mode: Mode) -> Self {
        self.mode = mode;
        self
    }

    /// Priority breaks ties between messages due in the same millisecond
    pub fn with_priority(mut self, priority: u8) -> Self {
        self.priority = priority.min(MAX_PRIORITY);
        self
    }

    /// Stream cap for normal mode; at least 1 so the message itself survives
    pub fn with_max_len(mut self, max_len: i64) -> Self {
        self.max_len = Some(max_len.max(1));
        self
    }

    /// Number of re-attempts after the first failed attempt
    pub fn with_retry(mut self, retry: u32) -> Self {
        self.retry = Some(retry);
        self
    }

    pub fn with_execute_time(mut self, at: DateTime<Utc>) -> Self {
        self.execute_time = Some(at);
        self
    }

    pub fn with_delay(self, delay: Duration) -> Self {
        let delay = chrono::Duration::from_std(delay).unwrap_or(chrono::Duration::zero());
        self.with_execute_time(Utc::now() + delay)
    }

    pub fn with_time_to_run(mut self, ttr: Duration) -> Self {
        self.time_to_run_ms = Some(ttr.as_millis() as u64);
        self
    }

    pub fn with_order_key(mut self, order_key: impl Into<String>) -> Self {
        self.order_key = Some(order_key.into());
        self
    }

    pub fn with_lock_ttl(mut self, ttl: Duration) -> Self {
        self.lock_ttl_secs = Some(ttl.as_secs().max(1));
        self
    }

    /// Decode the payload as JSON
    pub fn payload_json<T: DeserializeOwned>(&self) -> Result<T, BrokerError> {
        serde_json::from_str(&self.payload).map_err(|e| BrokerError::decode(&self.id, e))
    }

    pub fn time_to_run(&self) -> Option<Duration> {
        self.time_to_run_ms.map(Duration::from_millis)
    }

    /// Due instant; messages without an execute time are due when added
    pub fn due_at(&self) -> DateTime<Utc> {
        self.execute_time.unwrap_or(self.add_time)
    }

    pub fn is_due(&self, now: DateTime<Utc>) -> bool {
        self.due_at() <= now
    }

    /// Zset score: due time in milliseconds, priority in the fractional part
    pub fn score(&self) -> f64 {
        self.due_at().timestamp_millis() as f64 + f64::from(self.priority) / 1000.0
    }

    /// Encode for the `job` stream field
    pub fn encode(&self) -> Result<String, BrokerError> {
        Ok(serde_json::to_string(self)?)
    }

    /// Decode a `job` field read from the entry `entry_id`
    pub fn decode(entry_id: &str, raw: &str) -> Result<Self, BrokerError> {
        serde_json::from_str(raw).map_err(|e| BrokerError::decode(entry_id, e))
    }

    /// Decode the `job` field out of a raw stream entry's field list
    pub fn from_fields(entry_id: &str, fields: &[(String, String)]) -> Result<Self, BrokerError> {
        let raw = fields
            .iter()
            .find(|(k, _)| k == JOB_FIELD)
            .map(|(_, v)| v.as_str())
            .ok_or_else(|| BrokerError::decode(entry_id, "missing 'job' field"))?;
        Self::decode(entry_id, raw)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn test_priority_is_clamped() {
        let msg = Message::new("c", "t", "p").with_priority(42);
        assert_eq!(msg.priority, MAX_PRIORITY);
    }

    #[test]
    fn test_max_len_keeps_at_least_one_entry() {
        assert_eq!(Message::new("c", "t", "p").with_max_len(0).max_len, Some(1));
        assert_eq!(Message::new("c", "t", "p").with_max_len(-5).max_len, Some(1));
        assert_eq!(Message::new("c", "t", "p").with_max_len(7).max_len, Some(7));
    }

    #[test]
    fn test_score_orders_by_time_then_priority() {
        let at = Utc.timestamp_millis_opt(1_700_000_000_000).unwrap();
        let low = Message::new("c", "t", "p").with_execute_time(at);
        let high = Message::new("c", "t", "p").with_execute_time(at).with_priority(9);
        let later = Message::new("c", "t", "p")
            .with_execute_time(at + chrono::Duration::milliseconds(1))
            .with_priority(0);

        assert_eq!(low.score(), 1_700_000_000_000.0);
        assert!(high.score() > low.score());
        assert!(later.score() > high.score());
    }

    #[test]
    fn test_due_defaults_to_add_time() {
        let msg = Message::new("c", "t", "p");
        assert_eq!(msg.due_at(), msg.add_time);
        assert!(msg.is_due(Utc::now()));

        let future = Message::new("c", "t", "p").with_delay(Duration::from_secs(60));
        assert!(!future.is_due(Utc::now()));
    }

    #[test]
    fn test_job_field_decoding() {
        let msg = Message::new("c", "t", r#"{"n":1}"#)
            .with_mode(Mode::SequentialLock)
            .with_order_key("o1")
            .with_lock_ttl(Duration::from_secs(30));
        let fields = vec![(JOB_FIELD.to_string(), msg.encode().unwrap())];

        let decoded = Message::from_fields("1-0", &fields).unwrap();
        assert_eq!(decoded, msg);

        #[derive(Deserialize)]
        struct Payload {
            n: u32,
        }
        assert_eq!(decoded.payload_json::<Payload>().unwrap().n, 1);
    }

    #[test]
    fn test_missing_or_malformed_job_field() {
        let err = Message::from_fields("1-0", &[("other".into(), "x".into())]).unwrap_err();
        assert!(matches!(err, BrokerError::Decode { .. }));

        let err = Message::decode("2-0", "{not json").unwrap_err();
        assert!(err.to_string().contains("2-0"));
    }

    #[test]
    fn test_mode_parsing() {
        assert_eq!("normal".parse::<Mode>().unwrap(), Mode::Normal);
        assert_eq!("Sequential".parse::<Mode>().unwrap(), Mode::Sequential);
        assert_eq!("sequential-lock".parse::<Mode>().unwrap(), Mode::SequentialLock);
        assert_eq!("delay".parse::<Mode>().unwrap(), Mode::Scheduled);
        assert!("fanout".parse::<Mode>().is_err());
    }

    #[test]
    fn test_status_round_trip_names() {
        assert_eq!("dead_letter".parse::<Status>().unwrap(), Status::DeadLetter);
        assert_eq!(Status::Published.to_string(), "published");
        assert!(Status::Failed.is_terminal());
        assert!(!Status::Received.is_terminal());
    }
}
