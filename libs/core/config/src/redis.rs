use crate::{ConfigError, FromEnv};
use std::env;

/// Redis connection settings
#[derive(Clone, Debug)]
pub struct RedisConfig {
    pub url: String,
}

impl RedisConfig {
    pub fn new(url: impl Into<String>) -> Self {
        Self { url: url.into() }
    }
}

impl FromEnv for RedisConfig {
    /// Reads `REDIS_URL`, then `REDIS_HOST`; one of them must be set
    fn from_env() -> Result<Self, ConfigError> {
        let url = env::var("REDIS_URL")
            .or_else(|_| env::var("REDIS_HOST"))
            .map_err(|_| ConfigError::MissingEnvVar("REDIS_URL".to_string()))?;

        Ok(Self { url })
    }
}
