//! Consumer-group operations on one route stream

use crate::error::BrokerError;
use crate::keys;
use redis::RedisResult;
use redis::aio::ConnectionManager;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info};

// Type alias for Redis stream entries
pub(crate) type StreamEntries = Vec<(String, Vec<(String, String)>)>;

/// Received-marker value of an entry whose outcome is logged but not acked
const SETTLED: &str = "settled";

/// How far a pending entry got, according to its received marker
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Progress {
    /// No worker started it
    Published,
    /// A worker started it; the outcome is unknown
    Started,
    /// Processed and logged; only the ack is missing
    Settled,
}

/// Raw entry read from a stream
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawEntry {
    pub id: String,
    pub fields: Vec<(String, String)>,
}

impl RawEntry {
    /// The `job` field, if present
    pub fn job(&self) -> Option<&str> {
        self.fields
            .iter()
            .find(|(k, _)| k == crate::message::JOB_FIELD)
            .map(|(_, v)| v.as_str())
    }
}

/// One row of `XPENDING <stream> <group> - + <count>`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PendingEntry {
    pub id: String,
    pub consumer: String,
    pub idle: Duration,
    pub deliveries: u64,
}

/// Stream plus its consumer group
#[derive(Clone)]
pub struct RouteStream {
    redis: Arc<ConnectionManager>,
    stream: String,
    group: String,
    received: String,
}

impl RouteStream {
    pub fn new(
        redis: Arc<ConnectionManager>,
        stream: impl Into<String>,
        group: impl Into<String>,
    ) -> Self {
        let stream = stream.into();
        Self {
            received: keys::received_key(&stream),
            redis,
            stream,
            group: group.into(),
        }
    }

    pub fn redis(&self) -> Arc<ConnectionManager> {
        self.redis.clone()
    }

    pub fn stream(&self) -> &str {
        &self.stream
    }

    pub fn group(&self) -> &str {
        &self.group
    }

    pub fn received_key(&self) -> &str {
        &self.received
    }

    /// Create the group at id 0, creating the stream if needed
    pub async fn ensure_group(&self) -> Result<(), BrokerError> {
        let mut conn = (*self.redis).clone();

        let result: RedisResult<()> = redis::cmd("XGROUP")
            .arg("CREATE")
            .arg(&self.stream)
            .arg(&self.group)
            .arg("0")
            .arg("MKSTREAM")
            .query_async(&mut conn)
            .await;

        match result {
            Ok(_) => {
                info!(stream = %self.stream, group = %self.group, "Created consumer group");
            }
            Err(e) if e.to_string().contains("BUSYGROUP") => {
                debug!(stream = %self.stream, group = %self.group, "Consumer group already exists");
            }
            Err(e) => return Err(BrokerError::Redis(e)),
        }

        Ok(())
    }

    /// Blocking read of new entries for `consumer` on the shared connection
    pub async fn read_new(
        &self,
        consumer: &str,
        count: usize,
        block: Duration,
    ) -> Result<Vec<RawEntry>, BrokerError> {
        let mut conn = (*self.redis).clone();
        self.read_group(&mut conn, consumer, count, block).await
    }

    /// Blocking read of new entries for `consumer` on `conn`
    pub async fn read_group(
        &self,
        conn: &mut ConnectionManager,
        consumer: &str,
        count: usize,
        block: Duration,
    ) -> Result<Vec<RawEntry>, BrokerError> {
        let result: Option<Vec<(String, StreamEntries)>> = redis::cmd("XREADGROUP")
            .arg("GROUP")
            .arg(&self.group)
            .arg(consumer)
            .arg("COUNT")
            .arg(count)
            .arg("BLOCK")
            .arg(block.as_millis() as u64)
            .arg("STREAMS")
            .arg(&self.stream)
            .arg(">")
            .query_async(conn)
            .await?;

        Ok(result
            .unwrap_or_default()
            .into_iter()
            .flat_map(|(_stream, entries)| entries)
            .map(|(id, fields)| RawEntry { id, fields })
            .collect())
    }

    /// Mark entries as started by a worker, in one round trip
    pub async fn mark_received(&self, ids: &[String]) -> Result<(), BrokerError> {
        if ids.is_empty() {
            return Ok(());
        }

        let now = chrono::Utc::now().timestamp_millis();
        let mut cmd = redis::cmd("HSET");
        cmd.arg(&self.received);
        for id in ids {
            cmd.arg(id).arg(now);
        }

        let mut conn = (*self.redis).clone();
        let _: i64 = cmd.query_async(&mut conn).await?;
        Ok(())
    }

    /// Mark logged entries whose ack failed
    pub async fn mark_settled(&self, ids: &[String]) -> Result<(), BrokerError> {
        if ids.is_empty() {
            return Ok(());
        }

        let mut cmd = redis::cmd("HSET");
        cmd.arg(&self.received);
        for id in ids {
            cmd.arg(id).arg(SETTLED);
        }

        let mut conn = (*self.redis).clone();
        let _: i64 = cmd.query_async(&mut conn).await?;
        Ok(())
    }

    pub async fn progress(&self, id: &str) -> Result<Progress, BrokerError> {
        let mut conn = (*self.redis).clone();
        let marker: Option<String> = redis::cmd("HGET")
            .arg(&self.received)
            .arg(id)
            .query_async(&mut conn)
            .await?;

        Ok(match marker.as_deref() {
            None => Progress::Published,
            Some(SETTLED) => Progress::Settled,
            Some(_) => Progress::Started,
        })
    }

    pub async fn is_received(&self, id: &str) -> Result<bool, BrokerError> {
        let mut conn = (*self.redis).clone();
        let exists: bool = redis::cmd("HEXISTS")
            .arg(&self.received)
            .arg(id)
            .query_async(&mut conn)
            .await?;
        Ok(exists)
    }

    /// XACK, XDEL and received-marker cleanup in one pipeline
    pub async fn ack_and_delete(&self, ids: &[String]) -> Result<(), BrokerError> {
        if ids.is_empty() {
            return Ok(());
        }

        let mut conn = (*self.redis).clone();
        let mut pipe = redis::pipe();
        pipe.cmd("XACK").arg(&self.stream).arg(&self.group).arg(ids).ignore();
        pipe.cmd("XDEL").arg(&self.stream).arg(ids).ignore();
        pipe.cmd("HDEL").arg(&self.received).arg(ids).ignore();
        pipe.query_async::<()>(&mut conn).await?;

        debug!(stream = %self.stream, count = ids.len(), "Acknowledged and deleted entries");
        Ok(())
    }

    /// First page of the group's pending entries list
    pub async fn pending(&self, count: usize) -> Result<Vec<PendingEntry>, BrokerError> {
        let mut conn = (*self.redis).clone();

        let result: RedisResult<Vec<(String, String, u64, u64)>> = redis::cmd("XPENDING")
            .arg(&self.stream)
            .arg(&self.group)
            .arg("-")
            .arg("+")
            .arg(count)
            .query_async(&mut conn)
            .await;

        let rows = match result {
            Ok(rows) => rows,
            Err(e) if e.to_string().contains("NOGROUP") => return Ok(vec![]),
            Err(e) => return Err(BrokerError::Redis(e)),
        };

        Ok(rows
            .into_iter()
            .map(|(id, consumer, idle_ms, deliveries)| PendingEntry {
                id,
                consumer,
                idle: Duration::from_millis(idle_ms),
                deliveries,
            })
            .collect())
    }

    /// Fetch one entry by id
    pub async fn entry(&self, id: &str) -> Result<Option<RawEntry>, BrokerError> {
        let mut conn = (*self.redis).clone();

        let entries: StreamEntries = redis::cmd("XRANGE")
            .arg(&self.stream)
            .arg(id)
            .arg(id)
            .query_async(&mut conn)
            .await?;

        Ok(entries
            .into_iter()
            .next()
            .map(|(id, fields)| RawEntry { id, fields }))
    }

    /// Append an encoded message as a fresh entry
    pub async fn add(&self, job: &str) -> Result<String, BrokerError> {
        let mut conn = (*self.redis).clone();

        let id: String = redis::cmd("XADD")
            .arg(&self.stream)
            .arg("*")
            .arg(crate::message::JOB_FIELD)
            .arg(job)
            .query_async(&mut conn)
            .await?;

        Ok(id)
    }

    pub async fn len(&self) -> Result<i64, BrokerError> {
        let mut conn = (*self.redis).clone();
        let len: i64 = redis::cmd("XLEN")
            .arg(&self.stream)
            .query_async(&mut conn)
            .await?;
        Ok(len)
    }
}
