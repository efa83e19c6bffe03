//! Processor trait applied by the delivery loop.

use crate::broker::Delivery;
use crate::error::ProcessingError;
use async_trait::async_trait;
use std::collections::HashSet;
use std::fmt;

/// Processing step injected into the [`DeliveryLoop`](crate::DeliveryLoop).
///
/// Returning `Ok` acknowledges the delivery. Returning `Err` leaves it
/// pending so the broker redelivers it until the consumer's `max_deliver`
/// is reached, after which the message is dead-lettered.
///
/// # Example
///
/// ```rust
/// use async_trait::async_trait;
/// use dead_letter::{Delivery, ProcessingError, Processor};
///
/// struct RejectEmpty;
///
/// #[async_trait]
/// impl Processor for RejectEmpty {
///     async fn process(&self, delivery: &Delivery) -> Result<(), ProcessingError> {
///         if delivery.payload.is_empty() {
///             return Err(ProcessingError::new("empty payload"));
///         }
///         Ok(())
///     }
///
///     fn name(&self) -> &'static str {
///         "reject_empty"
///     }
/// }
/// ```
#[async_trait]
pub trait Processor: Send + Sync {
    async fn process(&self, delivery: &Delivery) -> Result<(), ProcessingError>;

    /// Used for logging and metrics labels.
    fn name(&self) -> &'static str;
}

/// Accepts everything.
#[derive(Debug, Clone, Default)]
pub struct NoOpProcessor;

#[async_trait]
impl Processor for NoOpProcessor {
    async fn process(&self, _delivery: &Delivery) -> Result<(), ProcessingError> {
        Ok(())
    }

    fn name(&self) -> &'static str {
        "noop_processor"
    }
}

/// Fails deterministically for a fixed set of payloads.
#[derive(Debug, Clone, Default)]
pub struct RejectPayloads {
    rejected: HashSet<Vec<u8>>,
}

impl RejectPayloads {
    pub fn new<I, P>(payloads: I) -> Self
    where
        I: IntoIterator<Item = P>,
        P: AsRef<[u8]>,
    {
        Self {
            rejected: payloads.into_iter().map(|p| p.as_ref().to_vec()).collect(),
        }
    }

    pub fn rejects(&self, payload: &[u8]) -> bool {
        self.rejected.contains(payload)
    }
}

#[async_trait]
impl Processor for RejectPayloads {
    async fn process(&self, delivery: &Delivery) -> Result<(), ProcessingError> {
        if self.rejects(&delivery.payload) {
            return Err(ProcessingError::new(format!(
                "payload {} is rejected",
                delivery.payload_str()
            )));
        }
        Ok(())
    }

    fn name(&self) -> &'static str {
        "reject_payloads"
    }
}

/// Processor backed by a closure.
pub struct FnProcessor<F> {
    name: &'static str,
    f: F,
}

impl<F> fmt::Debug for FnProcessor<F> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FnProcessor").field("name", &self.name).finish()
    }
}

/// Wrap a synchronous predicate as a [`Processor`].
pub fn processor_fn<F>(name: &'static str, f: F) -> FnProcessor<F>
where
    F: Fn(&Delivery) -> Result<(), ProcessingError> + Send + Sync,
{
    FnProcessor { name, f }
}

#[async_trait]
impl<F> Processor for FnProcessor<F>
where
    F: Fn(&Delivery) -> Result<(), ProcessingError> + Send + Sync,
{
    async fn process(&self, delivery: &Delivery) -> Result<(), ProcessingError> {
        (self.f)(delivery)
    }

    fn name(&self) -> &'static str {
        self.name
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broker::AckToken;
    use bytes::Bytes;

    fn delivery(payload: &'static str, delivered: u64) -> Delivery {
        Delivery::new(
            "orders.new",
            Bytes::from_static(payload.as_bytes()),
            Vec::new(),
            1,
            delivered,
            AckToken::new("t"),
        )
    }

    #[tokio::test]
    async fn test_reject_payloads() {
        let processor = RejectPayloads::new(["order_5"]);
        assert!(processor.process(&delivery("order_4", 1)).await.is_ok());

        let err = processor.process(&delivery("order_5", 1)).await.unwrap_err();
        assert_eq!(err.message, "payload order_5 is rejected");
    }

    #[tokio::test]
    async fn test_fn_processor_sees_attempt_counter() {
        let processor = processor_fn("second_try", |d: &Delivery| {
            if d.delivered < 2 {
                Err(ProcessingError::new("not yet"))
            } else {
                Ok(())
            }
        });

        assert!(processor.process(&delivery("order_1", 1)).await.is_err());
        assert!(processor.process(&delivery("order_1", 2)).await.is_ok());
        assert_eq!(processor.name(), "second_try");
    }
}
