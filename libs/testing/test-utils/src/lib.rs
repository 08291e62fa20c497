//! Shared test utilities for the broker crates
//!
//! - `TestRedis`: Redis container with automatic cleanup (feature: "redis")
//! - `TestDataBuilder`: deterministic key prefixes and route names (always available)
//! - `assertions`: small assertion helpers (always available)
//!
//! # Redis Testing
//!
//! ```toml
//! [dev-dependencies]
//! test-utils = { workspace = true, features = ["redis"] }
//! ```
//!
//! ```rust,ignore
//! use test_utils::{TestDataBuilder, TestRedis};
//!
//! #[tokio::test]
//! async fn my_broker_test() {
//!     let redis = TestRedis::new().await;
//!     let manager = redis.connection_manager().await;
//!     let builder = TestDataBuilder::from_test_name("my_broker_test");
//!
//!     let prefix = builder.prefix();
//!     let (channel, topic) = builder.route("orders");
//! }
//! ```

#[cfg(feature = "redis")]
mod redis;

#[cfg(feature = "redis")]
pub use self::redis::TestRedis;

/// Deterministic names derived from a seed
///
/// Tests sharing one Redis container stay isolated by using a per-test prefix.
pub struct TestDataBuilder {
    seed: u64,
}

impl TestDataBuilder {
    pub fn new(seed: u64) -> Self {
        Self { seed }
    }

    /// Seed from the hash of a test name
    ///
    /// ```
    /// use test_utils::TestDataBuilder;
    ///
    /// let builder = TestDataBuilder::from_test_name("test_enqueue_normal");
    /// assert!(builder.prefix().starts_with("test-"));
    /// ```
    pub fn from_test_name(name: &str) -> Self {
        use std::collections::hash_map::DefaultHasher;
        use std::hash::{Hash, Hasher};

        let mut hasher = DefaultHasher::new();
        name.hash(&mut hasher);
        Self::new(hasher.finish())
    }

    /// Key prefix unique to this seed
    pub fn prefix(&self) -> String {
        format!("test-{}", self.seed)
    }

    /// `(channel, topic)` pair for a named route
    ///
    /// ```
    /// use test_utils::TestDataBuilder;
    ///
    /// let (channel, topic) = TestDataBuilder::new(7).route("orders");
    /// assert_eq!(channel, "orders-7");
    /// assert_eq!(topic, "orders-topic");
    /// ```
    pub fn route(&self, name: &str) -> (String, String) {
        (format!("{}-{}", name, self.seed), format!("{}-topic", name))
    }

    /// Message id unique within this seed
    pub fn message_id(&self, suffix: &str) -> String {
        format!("msg-{}-{}", self.seed, suffix)
    }
}

/// Test assertion helpers
pub mod assertions {
    use std::future::Future;
    use std::time::Duration;

    /// Assert that an optional value is Some
    pub fn assert_some<T>(value: Option<T>, context: &str) -> T {
        value.unwrap_or_else(|| panic!("{}: expected Some, got None", context))
    }

    /// Poll `check` every 50ms until it returns true, panicking after `timeout`
    pub async fn eventually<F, Fut>(timeout: Duration, context: &str, mut check: F)
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = bool>,
    {
        let deadline = tokio::time::Instant::now() + timeout;
        while tokio::time::Instant::now() < deadline {
            if check().await {
                return;
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
        panic!("{}: condition not met within {:?}", context, timeout);
    }
}
