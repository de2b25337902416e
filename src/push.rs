//! Wake-up notification gateway.

use async_trait::async_trait;
use thiserror::Error;

use crate::types::call::CallNotification;

#[derive(Debug, Error)]
pub enum PushError {
    #[error("push delivery failed: {0}")]
    Delivery(String),
}

/// Out-of-band wake-up channel for the receiving device.
///
/// Strictly best-effort: the orchestrator fires notifications without
/// awaiting delivery, and a failure never blocks call setup.
#[async_trait]
pub trait WakeGateway: Send + Sync {
    async fn send_call_notification(&self, notification: CallNotification)
    -> Result<(), PushError>;
}

/// Gateway that drops notifications; for tests and headless deployments.
#[derive(Debug, Default)]
pub struct NoopWakeGateway;

#[async_trait]
impl WakeGateway for NoopWakeGateway {
    async fn send_call_notification(
        &self,
        _notification: CallNotification,
    ) -> Result<(), PushError> {
        Ok(())
    }
}
