//! Shared test utilities for messaging tests
//!
//! This crate provides reusable test infrastructure for the workspace crates:
//! - `TestRabbitMq`: RabbitMQ container with automatic cleanup (feature: "rabbitmq")
//! - `TestDataBuilder`: Deterministic test data generation (always available)
//! - `assertions`: Custom assertion helpers (always available)
//!
//! # Features
//!
//! - `rabbitmq` (default): Enables RabbitMQ test infrastructure
//!
//! # Usage
//!
//! ```rust,ignore
//! use test_utils::{TestDataBuilder, TestRabbitMq};
//!
//! #[tokio::test]
//! #[ignore = "requires Docker"]
//! async fn my_broker_test() {
//!     let broker = TestRabbitMq::new().await;
//!     let builder = TestDataBuilder::from_test_name("my_broker_test");
//!
//!     let queue = builder.queue("orders");
//!     let connector = AmqpConnector::from_config(&broker.config());
//! }
//! ```

use uuid::Uuid;

#[cfg(feature = "rabbitmq")]
mod rabbitmq;

#[cfg(feature = "rabbitmq")]
pub use rabbitmq::TestRabbitMq;

/// Builder for test data with deterministic randomization
///
/// Tests sharing one broker stay isolated by deriving queue names from the test name.
pub struct TestDataBuilder {
    seed: u64,
}

impl TestDataBuilder {
    /// Create a new builder with a seed (for deterministic tests)
    pub fn new(seed: u64) -> Self {
        Self { seed }
    }

    /// Create from test name (generates seed from test name hash)
    ///
    /// # Example
    ///
    /// ```
    /// use test_utils::TestDataBuilder;
    ///
    /// let builder = TestDataBuilder::from_test_name("test_publish_client");
    /// ```
    pub fn from_test_name(name: &str) -> Self {
        use std::collections::hash_map::DefaultHasher;
        use std::hash::{Hash, Hasher};

        let mut hasher = DefaultHasher::new();
        name.hash(&mut hasher);
        Self::new(hasher.finish())
    }

    /// Deterministic UUID for a payload
    pub fn uuid(&self) -> Uuid {
        let bytes = self.seed.to_le_bytes();
        let mut uuid_bytes = [0u8; 16];
        uuid_bytes[..8].copy_from_slice(&bytes);
        uuid_bytes[8..16].copy_from_slice(&bytes);
        Uuid::from_bytes(uuid_bytes)
    }

    /// Queue name unique to this builder
    ///
    /// ```
    /// use test_utils::TestDataBuilder;
    ///
    /// let builder = TestDataBuilder::new(7);
    /// assert_eq!(builder.queue("orders"), "test-7-orders");
    /// ```
    pub fn queue(&self, suffix: &str) -> String {
        format!("test-{}-{}", self.seed, suffix)
    }

    /// Display name for a payload, e.g. `"client-12345-main"`
    pub fn name(&self, prefix: &str, suffix: &str) -> String {
        format!("{}-{}-{}", prefix, self.seed, suffix)
    }
}

/// Test assertion helpers
pub mod assertions {
    use std::time::Duration;

    /// Poll `check` until it holds, panicking with `context` after `timeout`
    pub async fn eventually(context: &str, timeout: Duration, check: impl Fn() -> bool) {
        let deadline = tokio::time::Instant::now() + timeout;
        while !check() {
            if tokio::time::Instant::now() >= deadline {
                panic!("{}: condition not met within {:?}", context, timeout);
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    }

    /// Assert that an optional value is Some
    pub fn assert_some<T>(value: Option<T>, context: &str) -> T {
        value.unwrap_or_else(|| panic!("{}: expected Some, got None", context))
    }
}
