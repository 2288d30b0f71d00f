//! Push provider traits.

use push_core::{DeliveryOutcome, Payload, Platform};

/// Sends one notification payload to one device token.
///
/// Implementations are the only components that perform network I/O, and they
/// must classify every failure as retryable or permanent.
#[async_trait::async_trait]
pub trait Pusher: Send + Sync {
    /// Platform this pusher delivers to.
    fn platform(&self) -> Platform;

    /// Attempt a single delivery.
    async fn send(&self, token: &str, payload: &Payload) -> DeliveryOutcome;
}
