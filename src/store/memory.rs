//! In-memory store backend.
//!
//! Reference implementation of the [`CallStore`]/[`CallLogStore`] contracts,
//! used by unit and integration tests. Watcher sinks are dispatched
//! synchronously while the relevant registry lock is held, so cancelling a
//! watch guarantees no further deliveries once `cancel` returns.

use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use async_trait::async_trait;

use crate::store::traits::{
    CallLogSink, CallLogStore, CallPatch, CallRecordSink, CallStore, CandidateSink, Result,
    StoreError, TrickledCandidate, WatchHandle,
};
use crate::types::call::{CallId, CallLogEntry, CallRecord, CallStatus};

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

struct CallDoc {
    record: CallRecord,
    candidates: Vec<TrickledCandidate>,
}

struct CallWatcher {
    id: u64,
    call_id: String,
    sink: CallRecordSink,
}

struct CandidateWatcher {
    id: u64,
    call_id: String,
    sink: CandidateSink,
}

struct IncomingWatcher {
    id: u64,
    user_id: String,
    sink: CallRecordSink,
}

struct LogWatcher {
    id: u64,
    user_id: String,
    limit: usize,
    sink: CallLogSink,
}

pub struct MemoryStore {
    calls: DashMap<String, CallDoc>,
    logs: DashMap<(String, String), CallLogEntry>,
    call_watchers: Arc<Mutex<Vec<CallWatcher>>>,
    candidate_watchers: Arc<Mutex<Vec<CandidateWatcher>>>,
    incoming_watchers: Arc<Mutex<Vec<IncomingWatcher>>>,
    log_watchers: Arc<Mutex<Vec<LogWatcher>>>,
    next_watcher_id: AtomicU64,
    writes: AtomicU64,
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryStore {
    pub fn new() -> Self {
        Self {
            calls: DashMap::new(),
            logs: DashMap::new(),
            call_watchers: Arc::new(Mutex::new(Vec::new())),
            candidate_watchers: Arc::new(Mutex::new(Vec::new())),
            incoming_watchers: Arc::new(Mutex::new(Vec::new())),
            log_watchers: Arc::new(Mutex::new(Vec::new())),
            next_watcher_id: AtomicU64::new(1),
            writes: AtomicU64::new(0),
        }
    }

    /// Number of mutating operations issued against this store. Lets tests
    /// assert that denied flows produced zero writes.
    pub fn write_ops(&self) -> u64 {
        self.writes.load(Ordering::SeqCst)
    }

    fn next_id(&self) -> u64 {
        self.next_watcher_id.fetch_add(1, Ordering::SeqCst)
    }

    fn count_write(&self) {
        self.writes.fetch_add(1, Ordering::SeqCst);
    }

    fn notify_call(&self, record: &CallRecord) {
        let watchers = lock(&self.call_watchers);
        for watcher in watchers
            .iter()
            .filter(|w| w.call_id == record.call_id.as_str())
        {
            (watcher.sink)(record.clone());
        }
    }

    fn notify_incoming(&self, record: &CallRecord) {
        let watchers = lock(&self.incoming_watchers);
        for watcher in watchers
            .iter()
            .filter(|w| w.user_id == record.receiver.user_id)
        {
            (watcher.sink)(record.clone());
        }
    }

    fn notify_candidate(&self, call_id: &str, seq: u64, candidate: &TrickledCandidate) {
        let watchers = lock(&self.candidate_watchers);
        for watcher in watchers.iter().filter(|w| w.call_id == call_id) {
            (watcher.sink)(seq, candidate.clone());
        }
    }

    fn log_snapshot(&self, user_id: &str, limit: usize) -> Vec<CallLogEntry> {
        let mut rows: Vec<CallLogEntry> = self
            .logs
            .iter()
            .filter(|entry| entry.owner_id == user_id)
            .map(|entry| entry.value().clone())
            .collect();
        // Newest first; call id tie-break keeps the order total and stable.
        rows.sort_by(|a, b| {
            b.timestamp
                .cmp(&a.timestamp)
                .then_with(|| a.call_id.as_str().cmp(b.call_id.as_str()))
        });
        rows.truncate(limit);
        rows
    }

    fn notify_logs(&self, owner_id: &str) {
        // Snapshots are computed before taking the registry lock; holding it
        // while iterating the log map would invert the lock order against a
        // concurrent upsert.
        let specs: Vec<(u64, usize)> = {
            let watchers = lock(&self.log_watchers);
            watchers
                .iter()
                .filter(|w| w.user_id == owner_id)
                .map(|w| (w.id, w.limit))
                .collect()
        };
        if specs.is_empty() {
            return;
        }
        let snapshots: Vec<(u64, Vec<CallLogEntry>)> = specs
            .into_iter()
            .map(|(id, limit)| (id, self.log_snapshot(owner_id, limit)))
            .collect();
        let watchers = lock(&self.log_watchers);
        for (id, rows) in snapshots {
            if let Some(watcher) = watchers.iter().find(|w| w.id == id) {
                (watcher.sink)(rows);
            }
        }
    }

    fn apply_to(record: &mut CallRecord, patch: &CallPatch) -> bool {
        match patch {
            CallPatch::Offer { offer } => {
                if record.offer.as_deref() == Some(offer.as_str()) {
                    false
                } else {
                    record.offer = Some(offer.clone());
                    true
                }
            }
            CallPatch::Answered { answer } => {
                let mut changed = false;
                if record.answer.as_deref() != Some(answer.as_str()) {
                    record.answer = Some(answer.clone());
                    changed = true;
                }
                if record.status == CallStatus::Ringing {
                    record.status = CallStatus::Connecting;
                    changed = true;
                }
                changed
            }
            CallPatch::Connected => {
                if record.status == CallStatus::Connecting {
                    record.status = CallStatus::Connected;
                    true
                } else {
                    false
                }
            }
            CallPatch::Terminal {
                status,
                end_time,
                duration_secs,
            } => {
                if record.status.is_terminal() {
                    false
                } else {
                    record.status = *status;
                    record.end_time = Some(*end_time);
                    record.duration_secs = *duration_secs;
                    true
                }
            }
            CallPatch::TerminalFromRinging { status, end_time } => {
                if record.status == CallStatus::Ringing {
                    record.status = *status;
                    record.end_time = Some(*end_time);
                    true
                } else {
                    false
                }
            }
        }
    }
}

#[async_trait]
impl CallStore for MemoryStore {
    async fn create_call(&self, record: &CallRecord) -> Result<()> {
        self.count_write();
        let key = record.call_id.as_str().to_string();
        match self.calls.entry(key) {
            Entry::Occupied(entry) => Err(StoreError::Backend(format!(
                "call already exists: {}",
                entry.key()
            ))),
            Entry::Vacant(entry) => {
                // The entry guard is held across dispatch so a concurrent
                // patch cannot notify ahead of the creation itself.
                let _doc = entry.insert(CallDoc {
                    record: record.clone(),
                    candidates: Vec::new(),
                });
                self.notify_call(record);
                if record.status == CallStatus::Ringing {
                    self.notify_incoming(record);
                }
                Ok(())
            }
        }
    }

    async fn fetch_call(&self, call_id: &CallId) -> Result<Option<CallRecord>> {
        Ok(self
            .calls
            .get(call_id.as_str())
            .map(|doc| doc.record.clone()))
    }

    async fn apply_patch(&self, call_id: &CallId, patch: CallPatch) -> Result<bool> {
        if let CallPatch::Terminal { status, .. } | CallPatch::TerminalFromRinging { status, .. } =
            &patch
            && !status.is_terminal()
        {
            return Err(StoreError::Backend(format!(
                "non-terminal status in terminal patch: {status}"
            )));
        }
        self.count_write();
        let mut doc = self
            .calls
            .get_mut(call_id.as_str())
            .ok_or_else(|| StoreError::NotFound(call_id.to_string()))?;
        let applied = Self::apply_to(&mut doc.record, &patch);
        if applied {
            // The document guard is held across dispatch so watchers observe
            // patches in application order.
            self.notify_call(&doc.record);
        }
        Ok(applied)
    }

    async fn append_candidate(
        &self,
        call_id: &CallId,
        candidate: &TrickledCandidate,
    ) -> Result<u64> {
        self.count_write();
        let mut doc = self
            .calls
            .get_mut(call_id.as_str())
            .ok_or_else(|| StoreError::NotFound(call_id.to_string()))?;
        doc.candidates.push(candidate.clone());
        let seq = (doc.candidates.len() - 1) as u64;
        self.notify_candidate(call_id.as_str(), seq, candidate);
        Ok(seq)
    }

    async fn delete_call(&self, call_id: &CallId) -> Result<()> {
        self.count_write();
        // Record and candidates live in one entry; removal is atomic.
        self.calls.remove(call_id.as_str());
        Ok(())
    }

    fn watch_call(&self, call_id: &CallId, sink: CallRecordSink) -> WatchHandle {
        let id = self.next_id();
        let current = self.calls.get(call_id.as_str());
        let mut watchers = lock(&self.call_watchers);
        if let Some(doc) = &current {
            (sink)(doc.record.clone());
        }
        watchers.push(CallWatcher {
            id,
            call_id: call_id.as_str().to_string(),
            sink,
        });
        drop(watchers);
        drop(current);
        let registry = self.call_watchers.clone();
        WatchHandle::new(move || lock(&registry).retain(|w| w.id != id))
    }

    fn watch_candidates(&self, call_id: &CallId, sink: CandidateSink) -> WatchHandle {
        let id = self.next_id();
        // The document guard is held across replay + registration so a
        // concurrent append can neither be skipped nor delivered twice.
        let current = self.calls.get(call_id.as_str());
        let mut watchers = lock(&self.candidate_watchers);
        if let Some(doc) = &current {
            for (seq, candidate) in doc.candidates.iter().enumerate() {
                (sink)(seq as u64, candidate.clone());
            }
        }
        watchers.push(CandidateWatcher {
            id,
            call_id: call_id.as_str().to_string(),
            sink,
        });
        drop(watchers);
        drop(current);
        let registry = self.candidate_watchers.clone();
        WatchHandle::new(move || lock(&registry).retain(|w| w.id != id))
    }

    fn watch_incoming(&self, user_id: &str, sink: CallRecordSink) -> WatchHandle {
        let id = self.next_id();
        let ringing: Vec<CallRecord> = self
            .calls
            .iter()
            .filter(|doc| {
                doc.record.status == CallStatus::Ringing && doc.record.receiver.user_id == user_id
            })
            .map(|doc| doc.record.clone())
            .collect();
        let mut watchers = lock(&self.incoming_watchers);
        for record in ringing {
            (sink)(record);
        }
        watchers.push(IncomingWatcher {
            id,
            user_id: user_id.to_string(),
            sink,
        });
        drop(watchers);
        let registry = self.incoming_watchers.clone();
        WatchHandle::new(move || lock(&registry).retain(|w| w.id != id))
    }
}

#[async_trait]
impl CallLogStore for MemoryStore {
    async fn upsert_log(&self, entry: &CallLogEntry) -> Result<()> {
        self.count_write();
        self.logs.insert(
            (entry.owner_id.clone(), entry.call_id.as_str().to_string()),
            entry.clone(),
        );
        self.notify_logs(&entry.owner_id);
        Ok(())
    }

    async fn logs_for_user(&self, user_id: &str, limit: usize) -> Result<Vec<CallLogEntry>> {
        Ok(self.log_snapshot(user_id, limit))
    }

    fn watch_logs(&self, user_id: &str, limit: usize, sink: CallLogSink) -> WatchHandle {
        let id = self.next_id();
        let initial = self.log_snapshot(user_id, limit);
        let mut watchers = lock(&self.log_watchers);
        (sink)(initial);
        watchers.push(LogWatcher {
            id,
            user_id: user_id.to_string(),
            limit,
            sink,
        });
        drop(watchers);
        let registry = self.log_watchers.clone();
        WatchHandle::new(move || lock(&registry).retain(|w| w.id != id))
    }
}
