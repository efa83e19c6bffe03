//! Shared test utilities for the dead-letter pipeline
//!
//! - `TestNats`: NATS container with JetStream and automatic cleanup (feature: "nats")
//! - `TestDataBuilder`: deterministic, per-test stream and subject names (always available)
//! - `eventually`: polling helper for conditions reached by background tasks
//!
//! # Usage
//!
//! ```toml
//! [dev-dependencies]
//! test-utils = { workspace = true, features = ["nats"] }
//! ```
//!
//! ```rust,ignore
//! use test_utils::{TestDataBuilder, TestNats};
//!
//! #[tokio::test]
//! #[ignore] // Requires Docker
//! async fn my_jetstream_test() {
//!     let nats = TestNats::new().await;
//!     let names = TestDataBuilder::from_test_name("my_jetstream_test");
//!
//!     let stream = names.stream("ORDERS");
//!     let subject = names.subject("orders");
//! }
//! ```

use std::future::Future;
use std::time::Duration;

#[cfg(feature = "nats")]
mod nats;

#[cfg(feature = "nats")]
pub use nats::TestNats;

/// Builder for per-test names so tests sharing a server never collide.
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
    /// let builder = TestDataBuilder::from_test_name("test_exhausted_message_is_relocated");
    /// assert!(builder.stream("ORDERS").starts_with("ORDERS_"));
    /// ```
    pub fn from_test_name(name: &str) -> Self {
        use std::collections::hash_map::DefaultHasher;
        use std::hash::{Hash, Hasher};

        let mut hasher = DefaultHasher::new();
        name.hash(&mut hasher);
        Self::new(hasher.finish())
    }

    /// Stream name, upper case as JetStream streams usually are.
    pub fn stream(&self, prefix: &str) -> String {
        format!("{}_{:X}", prefix.to_uppercase(), self.seed)
    }

    /// Subject root unique to this test, e.g. `orders-1a2b`.
    pub fn subject(&self, prefix: &str) -> String {
        format!("{}-{:x}", prefix.to_lowercase(), self.seed)
    }

    /// `count` payloads `<prefix>_1 ..= <prefix>_count`.
    pub fn payloads(&self, prefix: &str, count: usize) -> Vec<String> {
        (1..=count).map(|i| format!("{prefix}_{i}")).collect()
    }
}

/// Poll `check` every `interval` until it returns true or `timeout` passes.
///
/// Returns whether the condition was met.
pub async fn eventually<F, Fut>(timeout: Duration, interval: Duration, mut check: F) -> bool
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        if check().await {
            return true;
        }
        if tokio::time::Instant::now() >= deadline {
            return false;
        }
        tokio::time::sleep(interval).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_data_builder_deterministic() {
        let builder1 = TestDataBuilder::from_test_name("my_test");
        let builder2 = TestDataBuilder::from_test_name("my_test");

        assert_eq!(builder1.stream("orders"), builder2.stream("orders"));
        assert_eq!(builder1.subject("ORDERS"), builder2.subject("ORDERS"));
    }

    #[test]
    fn test_data_builder_different_names() {
        let builder1 = TestDataBuilder::from_test_name("test1");
        let builder2 = TestDataBuilder::from_test_name("test2");

        // Different test names should generate different streams
        assert_ne!(builder1.stream("ORDERS"), builder2.stream("ORDERS"));
    }

    #[test]
    fn test_payloads() {
        let builder = TestDataBuilder::new(7);
        assert_eq!(builder.payloads("order", 3), vec!["order_1", "order_2", "order_3"]);
        assert_eq!(builder.stream("orders"), "ORDERS_7");
        assert_eq!(builder.subject("Orders"), "orders-7");
    }

    #[tokio::test(start_paused = true)]
    async fn test_eventually() {
        let mut calls = 0;
        let met = eventually(Duration::from_secs(1), Duration::from_millis(100), || {
            calls += 1;
            let done = calls >= 3;
            async move { done }
        })
        .await;
        assert!(met);

        let met = eventually(Duration::from_millis(300), Duration::from_millis(100), || async {
            false
        })
        .await;
        assert!(!met);
    }
}
