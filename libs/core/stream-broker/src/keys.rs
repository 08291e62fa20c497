//! Redis key naming
//!
//! Every key for a (channel, topic) route wraps `channel:topic` in a hash tag,
//! so a route's stream, zset, status and lock keys land in one cluster slot.
//!
//! ```text
//! broker:{orders:created}:normal_stream:stream
//! broker:{orders:created}:zset
//! broker:{orders:created}:=-status-=:<id>
//! broker:{orders:created}:sequential_lock:<order_key>
//! ```

use crate::message::Mode;

pub const DEFAULT_CHANNEL: &str = "default-channel";
pub const DEFAULT_TOPIC: &str = "default-topic";

fn or_default<'a>(value: &'a str, default: &'a str) -> &'a str {
    if value.is_empty() { default } else { value }
}

/// `prefix:{channel:topic}`
fn route(prefix: &str, channel: &str, topic: &str) -> String {
    format!(
        "{}:{{{}:{}}}",
        prefix,
        or_default(channel, DEFAULT_CHANNEL),
        or_default(topic, DEFAULT_TOPIC)
    )
}

pub fn stream_key(mode: Mode, prefix: &str, channel: &str, topic: &str) -> String {
    format!(
        "{}:{}_stream:stream",
        route(prefix, channel, topic),
        mode.key_segment()
    )
}

pub fn zset_key(prefix: &str, channel: &str, topic: &str) -> String {
    format!("{}:zset", route(prefix, channel, topic))
}

pub fn status_key(prefix: &str, channel: &str, topic: &str, id: &str) -> String {
    format!("{}:=-status-=:{}", route(prefix, channel, topic), id)
}

pub fn lock_key(prefix: &str, channel: &str, topic: &str, order_key: &str) -> String {
    format!("{}:sequential_lock:{}", route(prefix, channel, topic), order_key)
}

/// Hash of entry ids a worker has started on
pub fn received_key(stream_key: &str) -> String {
    format!("{}:received", stream_key)
}

/// Advisory lock guarding one reclaim tick for a stream
pub fn dead_letter_lock_key(stream_key: &str) -> String {
    format!("{}:dead_letter_lock", stream_key)
}

/// Advisory lock guarding one promotion tick for a route
pub fn schedule_lock_key(prefix: &str, channel: &str, topic: &str) -> String {
    format!("{}:lock", route(prefix, channel, topic))
}

pub fn log_stream_key(prefix: &str) -> String {
    format!("{}:process_log", prefix)
}

/// Consumer group name for a route
pub fn group_name(channel: &str) -> &str {
    or_default(channel, DEFAULT_CHANNEL)
}

/// Key builder bound to one prefix
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeySpace {
    prefix: String,
}

impl KeySpace {
    pub fn new(prefix: impl Into<String>) -> Self {
        Self {
            prefix: prefix.into(),
        }
    }

    pub fn prefix(&self) -> &str {
        &self.prefix
    }

    pub fn stream(&self, mode: Mode, channel: &str, topic: &str) -> String {
        stream_key(mode, &self.prefix, channel, topic)
    }

    pub fn zset(&self, channel: &str, topic: &str) -> String {
        zset_key(&self.prefix, channel, topic)
    }

    pub fn status(&self, channel: &str, topic: &str, id: &str) -> String {
        status_key(&self.prefix, channel, topic, id)
    }

    pub fn lock(&self, channel: &str, topic: &str, order_key: &str) -> String {
        lock_key(&self.prefix, channel, topic, order_key)
    }

    pub fn schedule_lock(&self, channel: &str, topic: &str) -> String {
        schedule_lock_key(&self.prefix, channel, topic)
    }

    pub fn log_stream(&self) -> String {
        log_stream_key(&self.prefix)
    }
}
