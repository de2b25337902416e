//! Local call session tracking.
//!
//! [`CallSession`] is the process-local view of the single call this device
//! is participating in; [`CurrentCallStore`] holds the current session and
//! fans out every mutation to registered listeners. All mutations funnel
//! through the orchestrator; listeners only observe.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex, MutexGuard};

use chrono::{DateTime, Utc};
use log::warn;
use serde::Serialize;

use crate::state::CallState;
use crate::types::call::{CallDirection, CallId, CallRecord, CallStatus, CallType, Peer};

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Observable snapshot of the call this device is currently on.
#[derive(Debug, Clone, Serialize)]
pub struct CallSession {
    pub call_id: CallId,
    /// The other participant.
    pub peer: Peer,
    pub direction: CallDirection,
    pub call_type: CallType,
    pub state: CallState,
    pub start_time: DateTime<Utc>,
    pub chat_id: Option<String>,
    pub muted: bool,
    pub video_enabled: bool,
}

impl CallSession {
    /// Build the local view of a shared record for `local_user_id`'s device.
    pub fn from_record(record: &CallRecord, local_user_id: &str) -> Self {
        Self {
            call_id: record.call_id.clone(),
            peer: record.counterparty_of(local_user_id).clone(),
            direction: record.direction_for(local_user_id),
            call_type: record.call_type,
            state: CallState::ringing(record.start_time),
            start_time: record.start_time,
            chat_id: record.chat_id.clone(),
            muted: false,
            video_enabled: record.call_type.is_video(),
        }
    }

    pub fn status(&self) -> CallStatus {
        self.state.status()
    }
}

type CallListener = Arc<dyn Fn(Option<&CallSession>) + Send + Sync>;

/// Removes a listener registered with [`CurrentCallStore::add_listener`].
pub struct CallListenerHandle {
    registry: Arc<Mutex<Inner>>,
    id: u64,
}

impl CallListenerHandle {
    /// Idempotent.
    pub fn remove(&self) {
        lock(&self.registry)
            .listeners
            .retain(|(id, _)| *id != self.id);
    }
}

struct Inner {
    current: Option<CallSession>,
    listeners: Vec<(u64, CallListener)>,
    next_id: u64,
    notifying: bool,
    pending: VecDeque<Option<CallSession>>,
}

/// Holder of the single current call session.
///
/// Listeners are notified synchronously after every mutation, in
/// registration order. A `set` issued from inside a listener callback is
/// queued and applied after the current notification pass completes, so
/// listeners never re-enter each other.
pub struct CurrentCallStore {
    inner: Arc<Mutex<Inner>>,
}

impl Default for CurrentCallStore {
    fn default() -> Self {
        Self::new()
    }
}

impl CurrentCallStore {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Mutex::new(Inner {
                current: None,
                listeners: Vec::new(),
                next_id: 1,
                notifying: false,
                pending: VecDeque::new(),
            })),
        }
    }

    pub fn get(&self) -> Option<CallSession> {
        lock(&self.inner).current.clone()
    }

    pub fn set(&self, session: Option<CallSession>) {
        let mut inner = lock(&self.inner);
        if inner.notifying {
            // Re-entrant mutation from a listener: apply after this pass.
            inner.pending.push_back(session);
            return;
        }
        inner.notifying = true;
        inner.current = session;
        loop {
            let snapshot = inner.current.clone();
            let listeners: Vec<CallListener> =
                inner.listeners.iter().map(|(_, l)| l.clone()).collect();
            drop(inner);
            for listener in &listeners {
                listener(snapshot.as_ref());
            }
            inner = lock(&self.inner);
            match inner.pending.pop_front() {
                Some(next) => inner.current = next,
                None => {
                    inner.notifying = false;
                    break;
                }
            }
        }
    }

    pub fn add_listener(
        &self,
        listener: impl Fn(Option<&CallSession>) + Send + Sync + 'static,
    ) -> CallListenerHandle {
        let mut inner = lock(&self.inner);
        let id = inner.next_id;
        inner.next_id += 1;
        inner.listeners.push((id, Arc::new(listener)));
        if inner.listeners.len() > 16 {
            warn!(
                "{} call listeners registered; listener leak?",
                inner.listeners.len()
            );
        }
        CallListenerHandle {
            registry: self.inner.clone(),
            id,
        }
    }
}
