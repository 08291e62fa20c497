//! Status lookups for sequential-mode messages

use crate::error::BrokerError;
use crate::keys::KeySpace;
use crate::message::Status;
use chrono::{DateTime, TimeZone, Utc};
use redis::aio::ConnectionManager;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;

/// Snapshot of a status hash
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MessageStatus {
    pub id: String,
    pub status: Status,
    pub stream_id: Option<String>,
    pub retry: Option<u32>,
    pub info: Option<String>,
    pub end_time: Option<DateTime<Utc>>,
    /// Enqueue attempts rejected as duplicates
    pub duplicates: u64,
}

impl MessageStatus {
    fn from_hash(id: &str, mut fields: HashMap<String, String>) -> Result<Self, BrokerError> {
        let status = fields
            .get("status")
            .ok_or_else(|| {
                BrokerError::InvalidMessage(format!("status hash of {} has no status", id))
            })?
            .parse::<Status>()?;

        Ok(Self {
            id: id.to_string(),
            status,
            stream_id: fields.remove("stream_id"),
            retry: fields.get("retry").and_then(|v| v.parse().ok()),
            info: fields.remove("info").filter(|v| !v.is_empty()),
            end_time: fields
                .get("end_time")
                .and_then(|v| v.parse::<i64>().ok())
                .and_then(|ms| Utc.timestamp_millis_opt(ms).single()),
            duplicates: fields
                .get("duplicates")
                .and_then(|v| v.parse().ok())
                .unwrap_or_default(),
        })
    }
}

#[derive(Clone)]
pub struct StatusReader {
    redis: Arc<ConnectionManager>,
    keys: KeySpace,
}

impl StatusReader {
    pub fn new(redis: Arc<ConnectionManager>, keys: KeySpace) -> Self {
        Self { redis, keys }
    }

    /// `None` when the id was never admitted or its record expired
    pub async fn status(
        &self,
        channel: &str,
        topic: &str,
        id: &str,
    ) -> Result<Option<MessageStatus>, BrokerError> {
        let mut conn = (*self.redis).clone();

        let fields: HashMap<String, String> = redis::cmd("HGETALL")
            .arg(self.keys.status(channel, topic, id))
            .query_async(&mut conn)
            .await?;

        if fields.is_empty() {
            return Ok(None);
        }
        MessageStatus::from_hash(id, fields).map(Some)
    }

    /// Poll until the message reaches a terminal status or `timeout` elapses.
    /// Returns the last snapshot seen.
    pub async fn wait_for_terminal(
        &self,
        channel: &str,
        topic: &str,
        id: &str,
        timeout: Duration,
        poll: Duration,
    ) -> Result<Option<MessageStatus>, BrokerError> {
        let deadline = Instant::now() + timeout;

        loop {
            let current = self.status(channel, topic, id).await?;
            let terminal = current.as_ref().is_some_and(|s| s.status.is_terminal());

            if terminal || Instant::now() + poll > deadline {
                return Ok(current);
            }
            tokio::time::sleep(poll).await;
        }
    }
}
