//! Broker error types and error categorization
//!
//! Errors are categorized to tell callers what to do next:
//! - **Transient**: backend hiccup, safe to retry the same call
//! - **Permanent**: retrying the same call gives the same answer
//! - **Busy**: the route is held by another message, retry later

use thiserror::Error;

/// Boxed error returned by user handlers
pub type BoxError = Box<dyn std::error::Error + Send + Sync + 'static>;

/// Category of error for deciding whether a caller should retry
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCategory {
    /// Temporary failure (Redis unavailable, connection reset)
    Transient,
    /// Unrecoverable for this input (malformed message, duplicate id)
    Permanent,
    /// Sequence lock held by an unacknowledged message
    Busy,
}

impl ErrorCategory {
    /// Whether repeating the same call can succeed
    pub fn is_retryable(&self) -> bool {
        !matches!(self, ErrorCategory::Permanent)
    }
}

/// Broker errors surfaced to producers and to background loops
#[derive(Error, Debug)]
pub enum BrokerError {
    /// Redis connection or command error
    #[error("Redis error: {0}")]
    Redis(#[from] redis::RedisError),

    /// Encoding a message for storage failed
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// A persisted entry could not be decoded
    #[error("Decode error for entry {entry_id}: {details}")]
    Decode { entry_id: String, details: String },

    /// Sequential mode: the id was already admitted
    #[error("Message {id} was already published")]
    IdempotentDuplicate { id: String },

    /// Sequential-lock mode: another message holds the order key
    #[error("Order key '{order_key}' is locked by an unacknowledged message")]
    SequentialLockBusy { order_key: String },

    /// The message is not valid for the broker it was sent to
    #[error("Invalid message: {0}")]
    InvalidMessage(String),

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),
}

impl BrokerError {
    /// Create a decode error for a stream or zset entry
    pub fn decode(entry_id: impl Into<String>, details: impl ToString) -> Self {
        BrokerError::Decode {
            entry_id: entry_id.into(),
            details: details.to_string(),
        }
    }

    /// Get the error category
    pub fn category(&self) -> ErrorCategory {
        match self {
            BrokerError::Redis(_) => ErrorCategory::Transient,
            BrokerError::Serialization(_) => ErrorCategory::Permanent,
            BrokerError::Decode { .. } => ErrorCategory::Permanent,
            BrokerError::IdempotentDuplicate { .. } => ErrorCategory::Permanent,
            BrokerError::SequentialLockBusy { .. } => ErrorCategory::Busy,
            BrokerError::InvalidMessage(_) => ErrorCategory::Permanent,
            BrokerError::Config(_) => ErrorCategory::Permanent,
        }
    }

    /// True when the Redis connection itself is gone, not just one command
    pub fn is_connection_error(&self) -> bool {
        match self {
            BrokerError::Redis(e) => {
                e.is_connection_dropped() || e.is_connection_refusal() || e.is_io_error()
            }
            _ => false,
        }
    }

    /// True when the consumer group or its stream was removed under us
    pub fn is_nogroup_error(&self) -> bool {
        matches!(self, BrokerError::Redis(e) if e.to_string().contains("NOGROUP"))
    }
}

impl From<serde_json::Error> for BrokerError {
    fn from(err: serde_json::Error) -> Self {
        BrokerError::Serialization(err.to_string())
    }
}

/// Terminal outcome of one handler attempt
#[derive(Error, Debug)]
pub enum HandlerError {
    /// The handler returned an error
    #[error("{0}")]
    Failed(BoxError),

    /// The handler panicked; the panic payload is kept as text
    #[error("handler panicked: {0}")]
    Panicked(String),

    /// The message's time-to-run elapsed
    #[error("deadline exceeded")]
    DeadlineExceeded,
}

impl HandlerError {
    /// Convert a caught panic payload into an error
    pub fn from_panic(payload: Box<dyn std::any::Any + Send>) -> Self {
        let message = if let Some(s) = payload.downcast_ref::<&'static str>() {
            (*s).to_string()
        } else if let Some(s) = payload.downcast_ref::<String>() {
            s.clone()
        } else {
            "unknown panic payload".to_string()
        };
        HandlerError::Panicked(message)
    }

    pub fn is_panic(&self) -> bool {
        matches!(self, HandlerError::Panicked(_))
    }
}
