//! Injected media-engine capability.
//!
//! The crate never talks to a real media stack directly. The negotiation
//! engine drives an opaque [`MediaSession`] obtained from a [`MediaEngine`],
//! and receives engine events (trickled candidates, connection state) over a
//! channel. This keeps the signaling and lifecycle logic fully unit-testable
//! with a fake engine.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::mpsc;

use crate::types::call::CallType;

/// Which half of the negotiation handshake a description belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SdpKind {
    Offer,
    Answer,
}

/// A session description as exchanged through the signaling channel.
///
/// Stored serialized (JSON) inside the shared call record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionDescription {
    pub kind: SdpKind,
    pub sdp: String,
}

impl SessionDescription {
    pub fn offer(sdp: impl Into<String>) -> Self {
        Self {
            kind: SdpKind::Offer,
            sdp: sdp.into(),
        }
    }

    pub fn answer(sdp: impl Into<String>) -> Self {
        Self {
            kind: SdpKind::Answer,
            sdp: sdp.into(),
        }
    }

    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }

    pub fn from_json(raw: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(raw)
    }
}

/// A discovered network path, trickled incrementally during negotiation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IceCandidate {
    /// The candidate string (e.g., "candidate:1 1 UDP 2130706431 192.168.1.1 8888 typ host")
    pub candidate: String,
    pub sdp_mid: Option<String>,
    pub sdp_m_line_index: Option<u16>,
}

impl IceCandidate {
    pub fn new(candidate: impl Into<String>) -> Self {
        Self {
            candidate: candidate.into(),
            sdp_mid: None,
            sdp_m_line_index: None,
        }
    }

    pub fn with_sdp_mid(mut self, sdp_mid: impl Into<String>) -> Self {
        self.sdp_mid = Some(sdp_mid.into());
        self
    }

    pub fn with_sdp_m_line_index(mut self, index: u16) -> Self {
        self.sdp_m_line_index = Some(index);
        self
    }
}

/// Which local tracks to acquire for a call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MediaConstraints {
    pub audio: bool,
    pub video: bool,
}

impl MediaConstraints {
    /// Audio track always; video track only for video calls.
    pub fn for_call_type(call_type: CallType) -> Self {
        Self {
            audio: true,
            video: call_type.is_video(),
        }
    }
}

/// Connection state of the underlying media transport.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MediaConnectionState {
    New,
    Connecting,
    Connected,
    Disconnected,
    Failed,
    Closed,
}

/// Events emitted by a media session toward the orchestrator.
#[derive(Debug, Clone)]
pub enum MediaEvent {
    /// A locally discovered candidate to trickle to the peer.
    IceCandidate(IceCandidate),
    /// A remote track became available.
    Track,
    ConnectionState(MediaConnectionState),
}

#[derive(Debug, Clone, Error)]
pub enum MediaError {
    #[error("media permission denied: {0}")]
    PermissionDenied(String),

    #[error("media device busy: {0}")]
    DeviceBusy(String),

    #[error("negotiation failed: {0}")]
    Negotiation(String),

    #[error("media session closed")]
    Closed,
}

/// Factory for media sessions, injected at manager construction.
#[async_trait]
pub trait MediaEngine: Send + Sync {
    /// Acquire local media and create a peer session.
    ///
    /// Engine events for the session are delivered through `events` until the
    /// session is closed.
    async fn create_session(
        &self,
        constraints: MediaConstraints,
        events: mpsc::UnboundedSender<MediaEvent>,
    ) -> Result<Box<dyn MediaSession>, MediaError>;
}

/// One live peer media session.
///
/// The toggle methods return the applied state and never fail; muting must
/// never surface an error to the user.
#[async_trait]
pub trait MediaSession: Send + Sync {
    async fn create_offer(&self) -> Result<SessionDescription, MediaError>;
    async fn create_answer(&self) -> Result<SessionDescription, MediaError>;
    async fn set_local_description(&self, desc: &SessionDescription) -> Result<(), MediaError>;
    async fn set_remote_description(&self, desc: &SessionDescription) -> Result<(), MediaError>;
    async fn add_ice_candidate(&self, candidate: &IceCandidate) -> Result<(), MediaError>;

    fn set_audio_enabled(&self, enabled: bool) -> bool;
    fn set_video_enabled(&self, enabled: bool) -> bool;
    /// Switch between front and back camera. Returns whether a switch happened.
    fn switch_camera(&self) -> bool;

    async fn close(&self);
}
