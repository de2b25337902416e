//! Store traits modelling a hosted realtime document database.
//!
//! One document per call (offer, answer, status, timestamps) plus an
//! append-only sub-list of trickled candidates, and a flat collection of
//! per-user call-log rows. Delivery to watchers is at-least-once from the
//! point of view of consumers; all mutations are expressed as guarded
//! partial patches so concurrent writers cannot erase each other's updates.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::media::IceCandidate;
use crate::types::call::{CallId, CallLogEntry, CallRecord, CallStatus};

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("item not found: {0}")]
    NotFound(String),

    #[error("serialization error: {0}")]
    Serialization(String),

    #[error("backend unavailable: {0}")]
    Unavailable(String),

    #[error("backend error: {0}")]
    Backend(String),
}

pub type Result<T> = std::result::Result<T, StoreError>;

/// A candidate in the append-only sub-list, tagged with its author so each
/// side can ignore its own trickles.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TrickledCandidate {
    pub from: String,
    pub candidate: IceCandidate,
}

/// Partial, idempotent updates to a call document.
///
/// Each patch is applied atomically; the guard conditions make concurrent
/// application by both participants safe (applying the same terminal patch
/// twice changes nothing the second time).
#[derive(Debug, Clone)]
pub enum CallPatch {
    /// Set the serialized offer. Re-publishing replaces, never appends.
    Offer { offer: String },
    /// Set the serialized answer (idempotent replace) and move the record
    /// from `Ringing` to `Connecting`. The status part applies only while
    /// the record is still `Ringing`.
    Answered { answer: String },
    /// Move the record from `Connecting` to `Connected`; no-op otherwise.
    Connected,
    /// Resolve the record to a terminal status. Applies only while the
    /// record is not already terminal.
    Terminal {
        status: CallStatus,
        end_time: DateTime<Utc>,
        duration_secs: Option<i64>,
    },
    /// Resolve to `Missed`/`Declined` bookkeeping. Applies only while the
    /// record is still `Ringing`; a call that was answered in the meantime
    /// is left untouched.
    TerminalFromRinging {
        status: CallStatus,
        end_time: DateTime<Utc>,
    },
}

/// Cancels a watch registration when invoked or dropped.
///
/// `cancel` is idempotent; after it returns, the sink receives no further
/// deliveries.
pub struct WatchHandle {
    cancel: Option<Box<dyn FnOnce() + Send>>,
}

impl WatchHandle {
    pub fn new(cancel: impl FnOnce() + Send + 'static) -> Self {
        Self {
            cancel: Some(Box::new(cancel)),
        }
    }

    pub fn cancel(&mut self) {
        if let Some(cancel) = self.cancel.take() {
            cancel();
        }
    }
}

impl Drop for WatchHandle {
    fn drop(&mut self) {
        self.cancel();
    }
}

impl std::fmt::Debug for WatchHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WatchHandle")
            .field("active", &self.cancel.is_some())
            .finish()
    }
}

pub type CallRecordSink = Box<dyn Fn(CallRecord) + Send + Sync>;
pub type CandidateSink = Box<dyn Fn(u64, TrickledCandidate) + Send + Sync>;
pub type CallLogSink = Box<dyn Fn(Vec<CallLogEntry>) + Send + Sync>;

/// The shared per-call document plus its candidate sub-list.
///
/// Watch sinks are invoked synchronously with the current state at
/// registration time and then once per subsequent change; they must not call
/// back into the store.
#[async_trait]
pub trait CallStore: Send + Sync {
    async fn create_call(&self, record: &CallRecord) -> Result<()>;

    async fn fetch_call(&self, call_id: &CallId) -> Result<Option<CallRecord>>;

    /// Apply a guarded partial update. Returns whether anything changed.
    async fn apply_patch(&self, call_id: &CallId, patch: CallPatch) -> Result<bool>;

    /// Append a candidate, assigning the next publish-order sequence number.
    async fn append_candidate(&self, call_id: &CallId, candidate: &TrickledCandidate)
    -> Result<u64>;

    /// Remove the record and all candidates. Atomic from a watcher's point
    /// of view: no sink ever observes candidates without their record as a
    /// result of deletion. Deleting a missing call is a no-op.
    async fn delete_call(&self, call_id: &CallId) -> Result<()>;

    fn watch_call(&self, call_id: &CallId, sink: CallRecordSink) -> WatchHandle;

    /// Ordered candidate watch, replaying the existing sub-list from
    /// sequence 0 before live deliveries.
    fn watch_candidates(&self, call_id: &CallId, sink: CandidateSink) -> WatchHandle;

    /// Ringing records addressed to `user_id` (current and future).
    fn watch_incoming(&self, user_id: &str, sink: CallRecordSink) -> WatchHandle;
}

/// Per-user denormalized call history rows, keyed by `(owner_id, call_id)`.
#[async_trait]
pub trait CallLogStore: Send + Sync {
    /// Insert or update the row for `(entry.owner_id, entry.call_id)`.
    async fn upsert_log(&self, entry: &CallLogEntry) -> Result<()>;

    /// Rows for one user, newest first.
    async fn logs_for_user(&self, user_id: &str, limit: usize) -> Result<Vec<CallLogEntry>>;

    /// Snapshot subscription: the sink receives the user's newest-first rows
    /// at registration and after every change. Already-delivered items never
    /// reorder relative to each other.
    fn watch_logs(&self, user_id: &str, limit: usize, sink: CallLogSink) -> WatchHandle;
}
