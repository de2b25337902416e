//! Core call data model shared between both participants.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Opaque call identifier, generated by the initiating device.
///
/// Rendered as 32 uppercase hex characters so ids sort and log cleanly.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct CallId(String);

impl CallId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Generate a fresh, globally unique call id.
    pub fn generate() -> Self {
        let bytes: [u8; 16] = rand::random();
        Self(hex::encode_upper(bytes))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for CallId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Media flavor of a call.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CallType {
    Voice,
    Video,
}

impl CallType {
    pub fn is_video(&self) -> bool {
        matches!(self, Self::Video)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Voice => "voice",
            Self::Video => "video",
        }
    }
}

impl fmt::Display for CallType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Direction of a call as seen from one device.
///
/// The same call is `Outgoing` on the caller's device and `Incoming` on the
/// receiver's; direction is never stored on the shared record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CallDirection {
    Incoming,
    Outgoing,
}

impl CallDirection {
    /// The same call as seen from the other participant's device.
    pub fn flipped(&self) -> Self {
        match self {
            Self::Incoming => Self::Outgoing,
            Self::Outgoing => Self::Incoming,
        }
    }
}

/// Call-level status, shared by both participants through the call record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CallStatus {
    Ringing,
    Connecting,
    Connected,
    Ended,
    Missed,
    Declined,
    Failed,
}

impl CallStatus {
    /// Whether no further transition may be applied from this status.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            Self::Ended | Self::Missed | Self::Declined | Self::Failed
        )
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Ringing => "ringing",
            Self::Connecting => "connecting",
            Self::Connected => "connected",
            Self::Ended => "ended",
            Self::Missed => "missed",
            Self::Declined => "declined",
            Self::Failed => "failed",
        }
    }
}

impl fmt::Display for CallStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One participant's identity as shown to the other side.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Peer {
    pub user_id: String,
    pub display_name: String,
    pub avatar_url: Option<String>,
}

impl Peer {
    pub fn new(user_id: impl Into<String>, display_name: impl Into<String>) -> Self {
        Self {
            user_id: user_id.into(),
            display_name: display_name.into(),
            avatar_url: None,
        }
    }

    pub fn with_avatar(mut self, url: impl Into<String>) -> Self {
        self.avatar_url = Some(url.into());
        self
    }
}

/// The authoritative shared record of one call attempt.
///
/// Both participants mutate this record through guarded partial updates;
/// trickled candidates live in the store's append-only sub-list, not here.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CallRecord {
    pub call_id: CallId,
    pub caller: Peer,
    pub receiver: Peer,
    pub call_type: CallType,
    pub status: CallStatus,
    pub start_time: DateTime<Utc>,
    pub end_time: Option<DateTime<Utc>>,
    /// Whole seconds, present only once the call has terminated after
    /// reaching at least `Connecting`.
    pub duration_secs: Option<i64>,
    /// Conversation that originated the call, if any.
    pub chat_id: Option<String>,
    /// Serialized session description published by the caller.
    pub offer: Option<String>,
    /// Serialized session description published by the receiver.
    pub answer: Option<String>,
}

impl CallRecord {
    pub fn new_outgoing(
        call_id: CallId,
        caller: Peer,
        receiver: Peer,
        call_type: CallType,
        chat_id: Option<String>,
    ) -> Self {
        Self {
            call_id,
            caller,
            receiver,
            call_type,
            status: CallStatus::Ringing,
            start_time: Utc::now(),
            end_time: None,
            duration_secs: None,
            chat_id,
            offer: None,
            answer: None,
        }
    }

    /// Direction of this call as seen by `user_id`.
    pub fn direction_for(&self, user_id: &str) -> CallDirection {
        if self.caller.user_id == user_id {
            CallDirection::Outgoing
        } else {
            CallDirection::Incoming
        }
    }

    /// The other participant as seen by `user_id`.
    pub fn counterparty_of(&self, user_id: &str) -> &Peer {
        if self.caller.user_id == user_id {
            &self.receiver
        } else {
            &self.caller
        }
    }
}

/// One user's denormalized view of a call, queryable without a join.
///
/// Keyed by `(owner_id, call_id)`; exactly two rows exist per call with two
/// known participants, each naming the *other* party.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CallLogEntry {
    pub owner_id: String,
    pub call_id: CallId,
    pub contact: Peer,
    pub call_type: CallType,
    pub direction: CallDirection,
    pub status: CallStatus,
    pub timestamp: DateTime<Utc>,
    pub duration_secs: Option<i64>,
}

/// Payload handed to the wake gateway when a call starts ringing.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CallNotification {
    pub recipient_id: String,
    pub caller_id: String,
    pub caller_name: String,
    pub call_type: CallType,
    pub call_id: CallId,
    pub chat_id: Option<String>,
}
