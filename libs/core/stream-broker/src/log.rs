//! Process log sink and dead-letter inspection
//!
//! Every delivered message produces one [`ProcessResult`]. The default sink
//! appends results to a capped Redis stream; dead-letter and decode-error
//! records land in the same stream, tagged by `log_type`.

use crate::broker::Broker;
use crate::error::BrokerError;
use crate::message::Message;
use crate::result::{LogType, ProcessResult};
use async_trait::async_trait;
use redis::AsyncCommands;
use redis::aio::ConnectionManager;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{debug, error, info};

// Type alias for Redis stream entries
type StreamEntries = Vec<(String, Vec<(String, String)>)>;

const DATA_FIELD: &str = "data";
const LOG_TYPE_FIELD: &str = "log_type";

/// Destination for process results.
///
/// A failed write keeps the source message pending, so implementations must
/// tolerate receiving the same result again.
#[async_trait]
pub trait ProcessLog: Send + Sync {
    async fn add_log(&self, result: &ProcessResult) -> Result<(), BrokerError>;
}

/// Process log backed by a capped Redis stream
#[derive(Clone)]
pub struct RedisProcessLog {
    redis: Arc<ConnectionManager>,
    stream: String,
    max_len: i64,
}

impl RedisProcessLog {
    pub fn new(redis: Arc<ConnectionManager>, stream: impl Into<String>, max_len: i64) -> Self {
        Self {
            redis,
            stream: stream.into(),
            max_len,
        }
    }

    pub fn stream(&self) -> &str {
        &self.stream
    }
}

#[async_trait]
impl ProcessLog for RedisProcessLog {
    async fn add_log(&self, result: &ProcessResult) -> Result<(), BrokerError> {
        let data = serde_json::to_string(result)?;
        let mut conn = (*self.redis).clone();

        let _: String = redis::cmd("XADD")
            .arg(&self.stream)
            .arg("MAXLEN")
            .arg("~")
            .arg(self.max_len)
            .arg("*")
            .arg(LOG_TYPE_FIELD)
            .arg(result.log_type.to_string())
            .arg(DATA_FIELD)
            .arg(&data)
            .query_async(&mut conn)
            .await?;

        Ok(())
    }
}

/// A dead-letter record as stored in the log stream
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeadLetterEntry {
    /// Id of the record in the log stream
    pub log_id: String,
    pub result: ProcessResult,
}

/// Log stream statistics
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogStats {
    pub stream_name: String,
    pub length: i64,
    pub oldest_entry_id: Option<String>,
    pub newest_entry_id: Option<String>,
}

/// Operator view over dead-letter records
#[derive(Clone)]
pub struct DeadLetters {
    broker: Broker,
    redis: Arc<ConnectionManager>,
    log_stream: String,
}

impl DeadLetters {
    pub fn new(broker: Broker) -> Self {
        let ctx = broker.context();
        Self {
            redis: ctx.redis(),
            log_stream: ctx.keys().log_stream(),
            broker,
        }
    }

    /// Dead-letter records among the first `scan` log entries after `offset`
    pub async fn list(
        &self,
        scan: usize,
        offset: Option<&str>,
    ) -> Result<Vec<DeadLetterEntry>, BrokerError> {
        let mut conn = (*self.redis).clone();
        let start = offset.map(|id| format!("({}", id));

        let entries: StreamEntries = redis::cmd("XRANGE")
            .arg(&self.log_stream)
            .arg(start.as_deref().unwrap_or("-"))
            .arg("+")
            .arg("COUNT")
            .arg(scan)
            .query_async(&mut conn)
            .await?;

        Ok(entries
            .into_iter()
            .filter_map(|(id, fields)| parse_dead_letter(id, &fields))
            .collect())
    }

    /// Get one dead-letter record by log id
    pub async fn get(&self, log_id: &str) -> Result<Option<DeadLetterEntry>, BrokerError> {
        let mut conn = (*self.redis).clone();

        let entries: StreamEntries = redis::cmd("XRANGE")
            .arg(&self.log_stream)
            .arg(log_id)
            .arg(log_id)
            .query_async(&mut conn)
            .await?;

        Ok(entries
            .into_iter()
            .next()
            .and_then(|(id, fields)| parse_dead_letter(id, &fields)))
    }

    /// Put a dead-lettered message back through the broker of its mode.
    ///
    /// Sequential messages get their status hash reset and sequential-lock
    /// messages must win their order lock again, so a busy lock surfaces as
    /// [`BrokerError::SequentialLockBusy`] and the record stays in the log.
    /// Returns the new stream id, or `None` if the record does not exist.
    pub async fn requeue(&self, log_id: &str) -> Result<Option<String>, BrokerError> {
        let Some(entry) = self.get(log_id).await? else {
            return Ok(None);
        };

        let message = Message::decode(log_id, &entry.result.payload)?;
        let message_id = message.id.clone();
        let stream_id = self.broker.for_mode(message.mode).readmit(message).await?;

        let mut conn = (*self.redis).clone();
        let removed: Result<i64, _> = conn.xdel(&self.log_stream, &[log_id]).await;
        if let Err(e) = removed {
            error!(
                log_id = %log_id,
                stream_id = %stream_id,
                error = %e,
                "Requeued dead-letter message but could not remove its record"
            );
        }

        info!(
            log_id = %log_id,
            message_id = %message_id,
            stream = %entry.result.stream_key,
            stream_id = %stream_id,
            "Requeued dead-letter message"
        );

        Ok(Some(stream_id))
    }

    /// Delete a record from the log stream
    pub async fn delete(&self, log_id: &str) -> Result<bool, BrokerError> {
        let mut conn = (*self.redis).clone();

        let deleted: i64 = conn.xdel(&self.log_stream, &[log_id]).await?;

        debug!(log_id = %log_id, "Deleted dead-letter record");

        Ok(deleted > 0)
    }

    pub async fn stats(&self) -> Result<LogStats, BrokerError> {
        let mut conn = (*self.redis).clone();

        let len: i64 = conn.xlen(&self.log_stream).await?;

        let oldest: StreamEntries = redis::cmd("XRANGE")
            .arg(&self.log_stream)
            .arg("-")
            .arg("+")
            .arg("COUNT")
            .arg(1)
            .query_async(&mut conn)
            .await?;

        let newest: StreamEntries = redis::cmd("XREVRANGE")
            .arg(&self.log_stream)
            .arg("+")
            .arg("-")
            .arg("COUNT")
            .arg(1)
            .query_async(&mut conn)
            .await?;

        Ok(LogStats {
            stream_name: self.log_stream.clone(),
            length: len,
            oldest_entry_id: oldest.into_iter().next().map(|(id, _)| id),
            newest_entry_id: newest.into_iter().next().map(|(id, _)| id),
        })
    }
}

fn parse_dead_letter(log_id: String, fields: &[(String, String)]) -> Option<DeadLetterEntry> {
    let data = fields.iter().find(|(k, _)| k == DATA_FIELD).map(|(_, v)| v)?;
    let result: ProcessResult = serde_json::from_str(data).ok()?;
    (result.log_type == LogType::DeadLetter).then_some(DeadLetterEntry { log_id, result })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fields_for(result: &ProcessResult) -> Vec<(String, String)> {
        vec![
            (LOG_TYPE_FIELD.to_string(), result.log_type.to_string()),
            (DATA_FIELD.to_string(), serde_json::to_string(result).unwrap()),
        ]
    }

    #[test]
    fn test_parse_dead_letter_filters_by_type() {
        let msg = Message::new("c", "t", "p");
        let dead = ProcessResult::dead_letter(&msg, "s", "1-0", 61_000);
        let processed = ProcessResult::finished(&msg, "s", "1-0", chrono::Utc::now(), 0, Ok(()));

        let entry = parse_dead_letter("9-0".into(), &fields_for(&dead)).unwrap();
        assert_eq!(entry.log_id, "9-0");
        assert_eq!(entry.result.id, msg.id);

        assert!(parse_dead_letter("9-1".into(), &fields_for(&processed)).is_none());
        assert!(parse_dead_letter("9-2".into(), &[]).is_none());
    }
}
