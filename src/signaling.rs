//! Signaling channel adapter.
//!
//! Translates negotiation messages (offer, answer, trickled candidates) to
//! and from the shared per-call document and its append-only candidate list,
//! hiding the store's consistency model behind a publish/subscribe surface:
//!
//! - offer/answer publishes are idempotent replaces, never appends
//! - candidates are append-only and delivered in publish order
//! - every publish retries a bounded number of times before surfacing a
//!   [`ChannelError`]
//! - a subscription stops synchronously on unsubscribe
//!
//! The adapter is the only component that touches the call store; the
//! orchestrator and negotiation engine stay independent of the transport.

use log::{debug, warn};
use std::sync::{Arc, Mutex, MutexGuard};
use thiserror::Error;
use tokio::time::sleep;

use chrono::{DateTime, Utc};

use crate::config::SignalingConfig;
use crate::media::{IceCandidate, SessionDescription};
use crate::store::traits::{
    CallPatch, CallRecordSink, CallStore, StoreError, TrickledCandidate, WatchHandle,
};
use crate::types::call::{CallId, CallRecord, CallStatus};

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

#[derive(Debug, Error)]
pub enum ChannelError {
    #[error("signaling write failed after {attempts} attempts: {source}")]
    Exhausted {
        attempts: u32,
        #[source]
        source: StoreError,
    },

    #[error("no signaling record for call {0}")]
    NotFound(String),

    #[error("signaling payload corrupt: {0}")]
    Corrupt(String),

    #[error(transparent)]
    Store(#[from] StoreError),
}

/// Subscriber callbacks for one call's signaling stream.
///
/// Callbacks are synchronous and must not block; the orchestrator forwards
/// them into its serialized event queue. The adapter already filters out the
/// local side's own offer/answer/candidates and deduplicates repeated
/// snapshots, so `on_offer`/`on_answer` fire at most once per distinct
/// payload and candidates arrive exactly in publish order.
pub trait SignalingHandler: Send + Sync {
    fn on_offer(&self, offer: SessionDescription);
    fn on_answer(&self, answer: SessionDescription);
    fn on_candidate(&self, candidate: IceCandidate);
    /// Status changes on the shared record, including terminal writes made
    /// by the counterparty.
    fn on_status(&self, status: CallStatus);
    fn on_error(&self, error: ChannelError);
}

/// Active subscription to one call's signaling stream.
///
/// `unsubscribe` is idempotent and stops all deliveries synchronously: once
/// it returns, no further handler callbacks run. Dropping the subscription
/// unsubscribes.
pub struct SignalingSubscription {
    watches: Mutex<Option<(WatchHandle, WatchHandle)>>,
}

impl SignalingSubscription {
    pub fn unsubscribe(&self) {
        if let Some((mut doc, mut candidates)) = lock(&self.watches).take() {
            doc.cancel();
            candidates.cancel();
        }
    }
}

impl Drop for SignalingSubscription {
    fn drop(&mut self) {
        self.unsubscribe();
    }
}

struct DeliveryState {
    offer_delivered: Option<String>,
    answer_delivered: Option<String>,
    last_status: Option<CallStatus>,
    next_candidate: u64,
}

pub struct SignalingChannel {
    store: Arc<dyn CallStore>,
    local_user_id: String,
    config: SignalingConfig,
}

impl SignalingChannel {
    pub fn new(
        store: Arc<dyn CallStore>,
        local_user_id: impl Into<String>,
        config: SignalingConfig,
    ) -> Self {
        Self {
            store,
            local_user_id: local_user_id.into(),
            config,
        }
    }

    async fn retry_write<T, F, Fut>(
        &self,
        what: &str,
        call_id: &CallId,
        op: F,
    ) -> Result<T, ChannelError>
    where
        F: Fn() -> Fut,
        Fut: Future<Output = crate::store::Result<T>>,
    {
        let attempts = self.config.publish_attempts.max(1);
        let mut attempt = 0;
        loop {
            attempt += 1;
            match op().await {
                Ok(value) => return Ok(value),
                // A vanished record is a race with deletion, not a fault
                // worth retrying.
                Err(StoreError::NotFound(id)) => return Err(ChannelError::NotFound(id)),
                Err(err) if attempt < attempts => {
                    warn!("{what} for call {call_id} failed (attempt {attempt}/{attempts}): {err}");
                    sleep(self.config.retry_delay).await;
                }
                Err(err) => {
                    return Err(ChannelError::Exhausted {
                        attempts,
                        source: err,
                    });
                }
            }
        }
    }

    /// Create the shared record for a new call.
    pub async fn create_call(&self, record: &CallRecord) -> Result<(), ChannelError> {
        self.retry_write("create call record", &record.call_id, || {
            self.store.create_call(record)
        })
        .await
    }

    pub async fn fetch_call(&self, call_id: &CallId) -> Result<Option<CallRecord>, ChannelError> {
        Ok(self.store.fetch_call(call_id).await?)
    }

    pub async fn publish_offer(
        &self,
        call_id: &CallId,
        offer: &SessionDescription,
    ) -> Result<(), ChannelError> {
        let payload = offer
            .to_json()
            .map_err(|err| ChannelError::Corrupt(err.to_string()))?;
        self.retry_write("publish offer", call_id, || {
            self.store.apply_patch(
                call_id,
                CallPatch::Offer {
                    offer: payload.clone(),
                },
            )
        })
        .await?;
        debug!("published offer for call {call_id}");
        Ok(())
    }

    /// Publish the answer; the record moves from ringing to connecting as
    /// part of the same patch.
    pub async fn publish_answer(
        &self,
        call_id: &CallId,
        answer: &SessionDescription,
    ) -> Result<(), ChannelError> {
        let payload = answer
            .to_json()
            .map_err(|err| ChannelError::Corrupt(err.to_string()))?;
        self.retry_write("publish answer", call_id, || {
            self.store.apply_patch(
                call_id,
                CallPatch::Answered {
                    answer: payload.clone(),
                },
            )
        })
        .await?;
        debug!("published answer for call {call_id}");
        Ok(())
    }

    pub async fn publish_candidate(
        &self,
        call_id: &CallId,
        candidate: &IceCandidate,
    ) -> Result<(), ChannelError> {
        let trickled = TrickledCandidate {
            from: self.local_user_id.clone(),
            candidate: candidate.clone(),
        };
        let seq = self
            .retry_write("publish candidate", call_id, || {
                self.store.append_candidate(call_id, &trickled)
            })
            .await?;
        debug!("published candidate {seq} for call {call_id}");
        Ok(())
    }

    /// Mark the shared record connected. No-op unless currently connecting.
    pub async fn mark_connected(&self, call_id: &CallId) -> Result<bool, ChannelError> {
        self.retry_write("mark connected", call_id, || {
            self.store.apply_patch(call_id, CallPatch::Connected)
        })
        .await
    }

    /// Resolve the record to a terminal status unless the other side already
    /// did. Returns whether this side's write took effect; a missing record
    /// is a benign race.
    pub async fn resolve_terminal(
        &self,
        call_id: &CallId,
        status: CallStatus,
        end_time: DateTime<Utc>,
        duration_secs: Option<i64>,
    ) -> Result<bool, ChannelError> {
        let result = self
            .retry_write("resolve terminal status", call_id, || {
                self.store.apply_patch(
                    call_id,
                    CallPatch::Terminal {
                        status,
                        end_time,
                        duration_secs,
                    },
                )
            })
            .await;
        match result {
            Ok(applied) => Ok(applied),
            Err(ChannelError::NotFound(_)) => Ok(false),
            Err(err) => Err(err),
        }
    }

    /// Resolve a still-ringing call to `missed`/`declined` bookkeeping; a
    /// call that was answered meanwhile (or already deleted) is untouched.
    pub async fn resolve_from_ringing(
        &self,
        call_id: &CallId,
        status: CallStatus,
        end_time: DateTime<Utc>,
    ) -> Result<bool, ChannelError> {
        let result = self
            .retry_write("resolve ringing call", call_id, || {
                self.store
                    .apply_patch(call_id, CallPatch::TerminalFromRinging { status, end_time })
            })
            .await;
        match result {
            Ok(applied) => Ok(applied),
            Err(ChannelError::NotFound(_)) => Ok(false),
            Err(err) => Err(err),
        }
    }

    /// Remove the record, its offer/answer and all candidates. Atomic from
    /// a subscriber's point of view and idempotent.
    pub async fn delete_signaling_data(&self, call_id: &CallId) -> Result<(), ChannelError> {
        self.retry_write("delete signaling data", call_id, || {
            self.store.delete_call(call_id)
        })
        .await?;
        debug!("deleted signaling data for call {call_id}");
        Ok(())
    }

    /// Watch for ringing calls addressed to this device's user.
    pub fn watch_incoming(&self, sink: CallRecordSink) -> WatchHandle {
        self.store.watch_incoming(&self.local_user_id, sink)
    }

    /// Subscribe to one call's signaling stream.
    pub fn subscribe(
        &self,
        call_id: &CallId,
        handler: Arc<dyn SignalingHandler>,
    ) -> SignalingSubscription {
        let state = Arc::new(Mutex::new(DeliveryState {
            offer_delivered: None,
            answer_delivered: None,
            last_status: None,
            next_candidate: 0,
        }));

        let doc_state = state.clone();
        let doc_handler = handler.clone();
        let local = self.local_user_id.clone();
        let doc_watch = self.store.watch_call(
            call_id,
            Box::new(move |record: CallRecord| {
                let mut st = lock(&doc_state);
                if let Some(raw) = &record.offer
                    && record.caller.user_id != local
                    && st.offer_delivered.as_deref() != Some(raw.as_str())
                {
                    match SessionDescription::from_json(raw) {
                        Ok(offer) => {
                            st.offer_delivered = Some(raw.clone());
                            doc_handler.on_offer(offer);
                        }
                        Err(err) => doc_handler.on_error(ChannelError::Corrupt(err.to_string())),
                    }
                }
                if let Some(raw) = &record.answer
                    && record.receiver.user_id != local
                    && st.answer_delivered.as_deref() != Some(raw.as_str())
                {
                    match SessionDescription::from_json(raw) {
                        Ok(answer) => {
                            st.answer_delivered = Some(raw.clone());
                            doc_handler.on_answer(answer);
                        }
                        Err(err) => doc_handler.on_error(ChannelError::Corrupt(err.to_string())),
                    }
                }
                if st.last_status != Some(record.status) {
                    st.last_status = Some(record.status);
                    doc_handler.on_status(record.status);
                }
            }),
        );

        let cand_state = state;
        let cand_handler = handler;
        let local = self.local_user_id.clone();
        let cand_watch = self.store.watch_candidates(
            call_id,
            Box::new(move |seq, trickled: TrickledCandidate| {
                let mut st = lock(&cand_state);
                if seq < st.next_candidate {
                    // Duplicate delivery from the store.
                    return;
                }
                st.next_candidate = seq + 1;
                if trickled.from == local {
                    return;
                }
                cand_handler.on_candidate(trickled.candidate);
            }),
        );

        SignalingSubscription {
            watches: Mutex::new(Some((doc_watch, cand_watch))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;
    use crate::types::call::{CallType, Peer};
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::time::Duration;

    fn fast_config() -> SignalingConfig {
        SignalingConfig {
            publish_attempts: 3,
            retry_delay: Duration::from_millis(1),
        }
    }

    fn record(id: &str) -> CallRecord {
        CallRecord::new_outgoing(
            CallId::new(id),
            Peer::new("alice", "Alice"),
            Peer::new("bob", "Bob"),
            CallType::Voice,
            None,
        )
    }

    #[derive(Default)]
    struct RecordingHandler {
        events: Mutex<Vec<String>>,
    }

    impl RecordingHandler {
        fn events(&self) -> Vec<String> {
            lock(&self.events).clone()
        }
    }

    impl SignalingHandler for RecordingHandler {
        fn on_offer(&self, offer: SessionDescription) {
            lock(&self.events).push(format!("offer:{}", offer.sdp));
        }
        fn on_answer(&self, answer: SessionDescription) {
            lock(&self.events).push(format!("answer:{}", answer.sdp));
        }
        fn on_candidate(&self, candidate: IceCandidate) {
            lock(&self.events).push(format!("candidate:{}", candidate.candidate));
        }
        fn on_status(&self, status: CallStatus) {
            lock(&self.events).push(format!("status:{status}"));
        }
        fn on_error(&self, error: ChannelError) {
            lock(&self.events).push(format!("error:{error}"));
        }
    }

    /// Store wrapper that fails the first N writes.
    struct FlakyStore {
        inner: MemoryStore,
        failures_left: AtomicU32,
    }

    impl FlakyStore {
        fn new(failures: u32) -> Self {
            Self {
                inner: MemoryStore::new(),
                failures_left: AtomicU32::new(failures),
            }
        }

        fn maybe_fail(&self) -> crate::store::Result<()> {
            let left = self.failures_left.load(Ordering::SeqCst);
            if left > 0 {
                self.failures_left.store(left - 1, Ordering::SeqCst);
                return Err(StoreError::Unavailable("injected failure".into()));
            }
            Ok(())
        }
    }

    #[async_trait]
    impl CallStore for FlakyStore {
        async fn create_call(&self, record: &CallRecord) -> crate::store::Result<()> {
            self.maybe_fail()?;
            self.inner.create_call(record).await
        }
        async fn fetch_call(&self, call_id: &CallId) -> crate::store::Result<Option<CallRecord>> {
            self.inner.fetch_call(call_id).await
        }
        async fn apply_patch(
            &self,
            call_id: &CallId,
            patch: CallPatch,
        ) -> crate::store::Result<bool> {
            self.maybe_fail()?;
            self.inner.apply_patch(call_id, patch).await
        }
        async fn append_candidate(
            &self,
            call_id: &CallId,
            candidate: &TrickledCandidate,
        ) -> crate::store::Result<u64> {
            self.maybe_fail()?;
            self.inner.append_candidate(call_id, candidate).await
        }
        async fn delete_call(&self, call_id: &CallId) -> crate::store::Result<()> {
            self.maybe_fail()?;
            self.inner.delete_call(call_id).await
        }
        fn watch_call(&self, call_id: &CallId, sink: CallRecordSink) -> WatchHandle {
            self.inner.watch_call(call_id, sink)
        }
        fn watch_candidates(
            &self,
            call_id: &CallId,
            sink: crate::store::traits::CandidateSink,
        ) -> WatchHandle {
            self.inner.watch_candidates(call_id, sink)
        }
        fn watch_incoming(&self, user_id: &str, sink: CallRecordSink) -> WatchHandle {
            self.inner.watch_incoming(user_id, sink)
        }
    }

    #[tokio::test]
    async fn test_duplicate_offer_publish_keeps_single_offer() {
        let store = Arc::new(MemoryStore::new());
        let channel = SignalingChannel::new(store.clone(), "alice", fast_config());
        let id = CallId::new("CALL1");
        channel.create_call(&record("CALL1")).await.unwrap();

        let offer = SessionDescription::offer("sdp-offer");
        channel.publish_offer(&id, &offer).await.unwrap();
        channel.publish_offer(&id, &offer).await.unwrap();

        let fetched = channel.fetch_call(&id).await.unwrap().unwrap();
        assert_eq!(fetched.offer, Some(offer.to_json().unwrap()));

        // The callee-side subscriber observes exactly one offer.
        let bob = SignalingChannel::new(store, "bob", fast_config());
        let handler = Arc::new(RecordingHandler::default());
        let _sub = bob.subscribe(&id, handler.clone());
        let offers = handler
            .events()
            .iter()
            .filter(|e| e.starts_with("offer:"))
            .count();
        assert_eq!(offers, 1);
    }

    #[tokio::test]
    async fn test_subscriber_skips_own_candidates_and_keeps_order() {
        let store = Arc::new(MemoryStore::new());
        let alice = SignalingChannel::new(store.clone(), "alice", fast_config());
        let bob = SignalingChannel::new(store, "bob", fast_config());
        let id = CallId::new("CALL1");
        alice.create_call(&record("CALL1")).await.unwrap();

        let handler = Arc::new(RecordingHandler::default());
        let _sub = bob.subscribe(&id, handler.clone());

        for n in 0..3 {
            alice
                .publish_candidate(&id, &IceCandidate::new(format!("a{n}")))
                .await
                .unwrap();
        }
        bob.publish_candidate(&id, &IceCandidate::new("b0"))
            .await
            .unwrap();
        alice
            .publish_candidate(&id, &IceCandidate::new("a3"))
            .await
            .unwrap();

        let candidates: Vec<String> = handler
            .events()
            .into_iter()
            .filter(|e| e.starts_with("candidate:"))
            .collect();
        assert_eq!(
            candidates,
            vec![
                "candidate:a0".to_string(),
                "candidate:a1".to_string(),
                "candidate:a2".to_string(),
                "candidate:a3".to_string(),
            ]
        );
    }

    #[tokio::test]
    async fn test_unsubscribe_stops_callbacks_and_is_idempotent() {
        let store = Arc::new(MemoryStore::new());
        let alice = SignalingChannel::new(store.clone(), "alice", fast_config());
        let bob = SignalingChannel::new(store, "bob", fast_config());
        let id = CallId::new("CALL1");
        alice.create_call(&record("CALL1")).await.unwrap();

        let handler = Arc::new(RecordingHandler::default());
        let sub = bob.subscribe(&id, handler.clone());
        sub.unsubscribe();
        sub.unsubscribe();

        alice
            .publish_offer(&id, &SessionDescription::offer("late"))
            .await
            .unwrap();
        alice
            .publish_candidate(&id, &IceCandidate::new("late"))
            .await
            .unwrap();

        let after: Vec<String> = handler
            .events()
            .into_iter()
            .filter(|e| e.contains("late"))
            .collect();
        assert!(after.is_empty(), "late deliveries after unsubscribe: {after:?}");
    }

    #[tokio::test]
    async fn test_publish_retries_then_succeeds() {
        let store = Arc::new(FlakyStore::new(2));
        store.inner.create_call(&record("CALL1")).await.unwrap();
        let channel = SignalingChannel::new(store, "alice", fast_config());
        let id = CallId::new("CALL1");

        channel
            .publish_offer(&id, &SessionDescription::offer("sdp"))
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_publish_retries_exhausted() {
        let store = Arc::new(FlakyStore::new(10));
        store.inner.create_call(&record("CALL1")).await.unwrap();
        let channel = SignalingChannel::new(store, "alice", fast_config());
        let id = CallId::new("CALL1");

        let err = channel
            .publish_offer(&id, &SessionDescription::offer("sdp"))
            .await
            .unwrap_err();
        assert!(matches!(err, ChannelError::Exhausted { attempts: 3, .. }));
    }

    #[tokio::test]
    async fn test_resolve_terminal_on_missing_call_is_benign() {
        let store = Arc::new(MemoryStore::new());
        let channel = SignalingChannel::new(store, "alice", fast_config());
        let applied = channel
            .resolve_terminal(&CallId::new("GONE"), CallStatus::Ended, Utc::now(), None)
            .await
            .unwrap();
        assert!(!applied);
    }

    #[tokio::test]
    async fn test_delete_signaling_data_removes_everything() {
        let store = Arc::new(MemoryStore::new());
        let channel = SignalingChannel::new(store.clone(), "alice", fast_config());
        let id = CallId::new("CALL1");
        channel.create_call(&record("CALL1")).await.unwrap();
        channel
            .publish_offer(&id, &SessionDescription::offer("sdp"))
            .await
            .unwrap();
        channel
            .publish_candidate(&id, &IceCandidate::new("c0"))
            .await
            .unwrap();

        channel.delete_signaling_data(&id).await.unwrap();
        assert!(channel.fetch_call(&id).await.unwrap().is_none());

        // A fresh subscriber observes neither candidates nor an offer.
        let bob = SignalingChannel::new(store, "bob", fast_config());
        let handler = Arc::new(RecordingHandler::default());
        let _sub = bob.subscribe(&id, handler.clone());
        assert!(handler.events().is_empty());
    }
}
