//! Outcome records written to the process log

use crate::error::HandlerError;
use crate::message::{Message, Status};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Level {
    Info,
    Error,
}

/// What produced a log record
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LogType {
    /// A handler run finished
    Process,
    /// The reclaimer gave up on a started message
    DeadLetter,
    /// A persisted entry could not be decoded
    DecodeError,
}

impl fmt::Display for LogType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            LogType::Process => "process",
            LogType::DeadLetter => "dead_letter",
            LogType::DecodeError => "decode_error",
        })
    }
}

/// Outcome of one delivered message
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProcessResult {
    pub id: String,
    pub channel: String,
    pub topic: String,
    pub mode: String,
    pub stream_key: String,
    pub stream_id: String,
    pub status: Status,
    pub level: Level,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub info: Option<String>,
    pub retry: u32,
    pub begin_time: DateTime<Utc>,
    pub end_time: DateTime<Utc>,
    pub run_time_ms: u64,
    pub host: String,
    pub log_type: LogType,
    /// Encoded message, or the raw entry when it could not be decoded
    pub payload: String,
}

impl ProcessResult {
    /// Build the record for a finished handler run
    pub fn finished(
        message: &Message,
        stream_key: &str,
        stream_id: &str,
        begin_time: DateTime<Utc>,
        retry: u32,
        outcome: Result<(), &HandlerError>,
    ) -> Self {
        let end_time = Utc::now();
        let (status, level, info) = match outcome {
            Ok(()) => (Status::Success, Level::Info, None),
            Err(e) => (Status::Failed, Level::Error, Some(e.to_string())),
        };

        Self {
            id: message.id.clone(),
            channel: message.channel.clone(),
            topic: message.topic.clone(),
            mode: message.mode.to_string(),
            stream_key: stream_key.to_string(),
            stream_id: stream_id.to_string(),
            status,
            level,
            info,
            retry,
            begin_time,
            end_time,
            run_time_ms: (end_time - begin_time).num_milliseconds().max(0) as u64,
            host: host_name(),
            log_type: LogType::Process,
            payload: message.encode().unwrap_or_else(|_| message.payload.clone()),
        }
    }

    /// Record for an entry the reclaimer moved to the dead-letter log
    pub fn dead_letter(message: &Message, stream_key: &str, stream_id: &str, idle_ms: u64) -> Self {
        let now = Utc::now();
        Self {
            id: message.id.clone(),
            channel: message.channel.clone(),
            topic: message.topic.clone(),
            mode: message.mode.to_string(),
            stream_key: stream_key.to_string(),
            stream_id: stream_id.to_string(),
            status: Status::DeadLetter,
            level: Level::Error,
            info: Some(format!("pending without ack for {}ms", idle_ms)),
            retry: 0,
            begin_time: now,
            end_time: now,
            run_time_ms: 0,
            host: host_name(),
            log_type: LogType::DeadLetter,
            payload: message.encode().unwrap_or_else(|_| message.payload.clone()),
        }
    }

    /// Record for an undecodable entry; `raw` keeps the original bytes
    pub fn decode_error(source_key: &str, entry_id: &str, raw: &str, details: &str) -> Self {
        let now = Utc::now();
        Self {
            id: entry_id.to_string(),
            channel: String::new(),
            topic: String::new(),
            mode: String::new(),
            stream_key: source_key.to_string(),
            stream_id: entry_id.to_string(),
            status: Status::Failed,
            level: Level::Error,
            info: Some(details.to_string()),
            retry: 0,
            begin_time: now,
            end_time: now,
            run_time_ms: 0,
            host: host_name(),
            log_type: LogType::DecodeError,
            payload: raw.to_string(),
        }
    }

    pub fn is_success(&self) -> bool {
        self.status == Status::Success
    }
}

/// Host name for log records, from `HOSTNAME` (set by container runtimes)
pub fn host_name() -> String {
    std::env::var("HOSTNAME").unwrap_or_else(|_| "unknown".to_string())
}
