//! Worker settings read from the environment

use core_config::{ConfigError, FromEnv, env_or_default, env_parse};
use std::str::FromStr;
use stream_broker::Mode;

/// One (channel, topic, mode) the worker consumes
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Route {
    pub channel: String,
    pub topic: String,
    pub mode: Mode,
}

impl FromStr for Route {
    type Err = String;

    /// `channel/topic/mode`; the mode defaults to normal when omitted
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let parts: Vec<&str> = s.trim().split('/').map(str::trim).collect();

        let (channel, topic, mode) = match parts.as_slice() {
            [channel, topic] => (*channel, *topic, Mode::Normal),
            [channel, topic, mode] => (
                *channel,
                *topic,
                mode.parse::<Mode>().map_err(|e| e.to_string())?,
            ),
            _ => return Err(format!("'{}' is not channel/topic[/mode]", s.trim())),
        };

        if channel.is_empty() || topic.is_empty() {
            return Err(format!("'{}' has an empty channel or topic", s.trim()));
        }

        Ok(Self {
            channel: channel.to_string(),
            topic: topic.to_string(),
            mode,
        })
    }
}

/// Parse a comma-separated route list, skipping empty items
pub fn parse_routes(raw: &str) -> Result<Vec<Route>, String> {
    raw.split(',')
        .filter(|item| !item.trim().is_empty())
        .map(str::parse)
        .collect()
}

#[derive(Debug, Clone)]
pub struct WorkerSettings {
    pub routes: Vec<Route>,
    pub health_port: u16,
}

/// - `BROKER_ROUTES`: `channel/topic/mode,...` (default `default-channel/default-topic/normal`)
/// - `BROKER_HEALTH_PORT`: probe and metrics port (default 8082)
impl FromEnv for WorkerSettings {
    fn from_env() -> Result<Self, ConfigError> {
        let raw = env_or_default("BROKER_ROUTES", "default-channel/default-topic/normal");
        let routes = parse_routes(&raw).map_err(|details| ConfigError::ParseError {
            key: "BROKER_ROUTES".to_string(),
            details,
        })?;

        if routes.is_empty() {
            return Err(ConfigError::ParseError {
                key: "BROKER_ROUTES".to_string(),
                details: "no routes configured".to_string(),
            });
        }

        Ok(Self {
            routes,
            health_port: env_parse("BROKER_HEALTH_PORT", 8082)?,
        })
    }
}
