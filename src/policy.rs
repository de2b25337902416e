//! Relationship policy check consulted before a call may start.

use async_trait::async_trait;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum PolicyError {
    #[error("policy backend error: {0}")]
    Backend(String),
}

/// Block-list style communication gate.
///
/// A `false` result short-circuits `start_call` before any signaling write.
#[async_trait]
pub trait CallPolicy: Send + Sync {
    async fn can_communicate(&self, caller_id: &str, receiver_id: &str)
    -> Result<bool, PolicyError>;
}

/// Policy that allows every pair of users.
#[derive(Debug, Default)]
pub struct AllowAllPolicy;

#[async_trait]
impl CallPolicy for AllowAllPolicy {
    async fn can_communicate(
        &self,
        _caller_id: &str,
        _receiver_id: &str,
    ) -> Result<bool, PolicyError> {
        Ok(true)
    }
}
