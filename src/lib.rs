//! Call signaling and lifecycle management for a mobile messenger.
//!
//! Establishes, tracks and tears down real-time voice/video calls between
//! two users by exchanging negotiation messages through a shared,
//! eventually-consistent document store, while keeping a consistent
//! call-state view on both devices and a symmetric call history for both
//! parties.
//!
//! # Architecture
//!
//! - [`SignalingChannel`]: publish/subscribe adapter over the shared
//!   per-call document and its append-only candidate list
//! - [`CallState`] & [`CallTransition`]: the call state machine
//!   (ringing → connecting → connected → terminal)
//! - [`NegotiationEngine`]: drives the injected media engine; owns offer and
//!   answer construction and candidate buffering
//! - [`CallManager`]: orchestrates the call lifecycle through one serialized
//!   event queue; the entry point for UI code
//! - [`CallLogger`]: dual-sided denormalized call history
//!
//! The media engine, document store, push gateway and block-list policy are
//! injected capabilities; [`store::MemoryStore`] is the in-process backend
//! used in tests.

pub mod call_log;
pub mod config;
pub mod error;
pub mod manager;
pub mod media;
pub mod negotiation;
pub mod policy;
pub mod push;
pub mod session;
pub mod signaling;
pub mod state;
pub mod store;
pub mod types;

pub use call_log::CallLogger;
pub use config::{CallManagerConfig, SignalingConfig};
pub use error::CallError;
pub use manager::{CallManager, CallManagerDeps, LocalIdentity};
pub use media::{
    IceCandidate, MediaConnectionState, MediaConstraints, MediaEngine, MediaError, MediaEvent,
    MediaSession, SdpKind, SessionDescription,
};
pub use negotiation::NegotiationEngine;
pub use policy::{AllowAllPolicy, CallPolicy, PolicyError};
pub use push::{NoopWakeGateway, PushError, WakeGateway};
pub use session::{CallListenerHandle, CallSession, CurrentCallStore};
pub use signaling::{ChannelError, SignalingChannel, SignalingHandler, SignalingSubscription};
pub use state::{CallState, CallTransition, InvalidTransition};
pub use types::call::{
    CallDirection, CallId, CallLogEntry, CallNotification, CallRecord, CallStatus, CallType, Peer,
};
