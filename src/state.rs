//! Call state machine implementation.

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::types::call::CallStatus;

/// Current state of a call as tracked on one device.
///
/// `Connecting` is entered when the answer is published (callee) or observed
/// (caller); both sides' machines key off the answer because the shared
/// record carries a single status.
#[derive(Debug, Clone, Serialize)]
pub enum CallState {
    /// Offer published (caller) or received (callee); waiting for an answer.
    Ringing { since: DateTime<Utc> },
    /// Answer exchanged, media path being established.
    Connecting {
        started: DateTime<Utc>,
        answered_at: DateTime<Utc>,
    },
    /// Media flowing.
    Connected {
        started: DateTime<Utc>,
        connected_at: DateTime<Utc>,
    },
    /// Absorbing terminal state.
    Terminal {
        status: CallStatus,
        ended_at: DateTime<Utc>,
        duration_secs: Option<i64>,
    },
}

impl CallState {
    pub fn ringing(since: DateTime<Utc>) -> Self {
        Self::Ringing { since }
    }

    pub fn status(&self) -> CallStatus {
        match self {
            Self::Ringing { .. } => CallStatus::Ringing,
            Self::Connecting { .. } => CallStatus::Connecting,
            Self::Connected { .. } => CallStatus::Connected,
            Self::Terminal { status, .. } => *status,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Terminal { .. })
    }

    pub fn is_ringing(&self) -> bool {
        matches!(self, Self::Ringing { .. })
    }

    /// Whether the answer was ever exchanged on this device.
    pub fn reached_connecting(&self) -> bool {
        matches!(self, Self::Connecting { .. } | Self::Connected { .. })
    }

    pub fn duration_secs(&self) -> Option<i64> {
        match self {
            Self::Terminal { duration_secs, .. } => *duration_secs,
            _ => None,
        }
    }

    /// Apply a state transition. Returns an error if the transition is not
    /// legal from the current state.
    pub fn apply_transition(&mut self, transition: CallTransition) -> Result<(), InvalidTransition> {
        let now = Utc::now();
        let new_state = match (&*self, &transition) {
            (CallState::Ringing { since }, CallTransition::Answered) => CallState::Connecting {
                started: *since,
                answered_at: now,
            },
            (CallState::Ringing { .. }, CallTransition::Terminated { status })
                if status.is_terminal() =>
            {
                // Never answered: no duration, whatever the terminal status.
                CallState::Terminal {
                    status: *status,
                    ended_at: now,
                    duration_secs: None,
                }
            }
            (CallState::Connecting { started, .. }, CallTransition::MediaConnected) => {
                CallState::Connected {
                    started: *started,
                    connected_at: now,
                }
            }
            (
                CallState::Connecting { started, .. } | CallState::Connected { started, .. },
                CallTransition::Terminated { status },
            ) if matches!(status, CallStatus::Ended | CallStatus::Failed) => {
                let duration_secs = match status {
                    CallStatus::Ended => {
                        Some(now.signed_duration_since(*started).num_seconds().max(0))
                    }
                    _ => None,
                };
                CallState::Terminal {
                    status: *status,
                    ended_at: now,
                    duration_secs,
                }
            }
            (current, attempted) => {
                return Err(InvalidTransition {
                    current_state: format!("{current:?}"),
                    attempted: format!("{attempted:?}"),
                });
            }
        };
        *self = new_state;
        Ok(())
    }
}

/// State transitions for calls.
#[derive(Debug, Clone)]
pub enum CallTransition {
    /// The answer was published (callee) or observed (caller).
    Answered,
    /// The media transport reached a connected state.
    MediaConnected,
    /// Either side terminated the call.
    Terminated { status: CallStatus },
}

#[derive(Debug, Clone)]
pub struct InvalidTransition {
    pub current_state: String,
    pub attempted: String,
}

impl std::fmt::Display for InvalidTransition {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "invalid transition {} in state {}",
            self.attempted, self.current_state
        )
    }
}

impl std::error::Error for InvalidTransition {}
