//! Call-related error types.

use thiserror::Error;

use crate::media::MediaError;
use crate::signaling::ChannelError;
use crate::state::InvalidTransition;
use crate::store::StoreError;

#[derive(Debug, Error)]
pub enum CallError {
    /// Policy check refused the call, or local media permission was denied.
    /// No signaling was attempted.
    #[error("not permitted: {0}")]
    PermissionDenied(String),

    /// The media engine could not establish or continue a session.
    #[error("media error: {0}")]
    Media(#[from] MediaError),

    /// Signaling writes failed after bounded retries.
    #[error("signaling channel error: {0}")]
    Channel(#[from] ChannelError),

    #[error("call not found: {0}")]
    NotFound(String),

    /// A call session is already active on this device.
    #[error("another call is already in progress")]
    Busy,

    #[error("invalid call state transition: {0}")]
    InvalidTransition(#[from] InvalidTransition),

    #[error("store error: {0}")]
    Store(#[from] StoreError),

    /// The call manager's driver task is no longer running.
    #[error("call manager stopped")]
    Stopped,
}
