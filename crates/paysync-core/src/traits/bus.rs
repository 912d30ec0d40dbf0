//! Message bus contract.

use async_trait::async_trait;

use crate::error::Result;
use crate::types::EventMessage;

/// Downstream transport. `Ok` means "accepted"; the bus itself is expected
/// to be durable and at-least-once.
#[async_trait]
pub trait MessageBus: Send + Sync {
    fn name(&self) -> &str;

    async fn publish(&self, message: &EventMessage) -> Result<()>;
}
