//! Shared helpers for integration tests: a scriptable fake media engine and
//! a two-device harness over one in-memory store.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::mpsc;

use ringline::media::{
    IceCandidate, MediaConnectionState, MediaConstraints, MediaEngine, MediaError, MediaEvent,
    MediaSession, SessionDescription,
};
use ringline::policy::{AllowAllPolicy, CallPolicy, PolicyError};
use ringline::push::{PushError, WakeGateway};
use ringline::store::MemoryStore;
use ringline::types::call::CallNotification;
use ringline::{
    CallManager, CallManagerConfig, CallManagerDeps, LocalIdentity, SignalingConfig,
};

pub fn init_logging() {
    let _ = env_logger::builder().is_test(true).try_init();
}

/// Observable state of one fake media session, shared with the test.
#[derive(Default)]
pub struct FakeSessionState {
    events: Mutex<Option<mpsc::UnboundedSender<MediaEvent>>>,
    pub remote_descriptions: Mutex<Vec<SessionDescription>>,
    pub applied_candidates: Mutex<Vec<IceCandidate>>,
    pub audio_enabled: AtomicBool,
    pub video_enabled: AtomicBool,
    pub closed: AtomicBool,
}

impl FakeSessionState {
    pub fn emit(&self, event: MediaEvent) {
        if let Some(tx) = &*self.events.lock().unwrap() {
            let _ = tx.send(event);
        }
    }

    pub fn emit_candidate(&self, candidate: &str) {
        self.emit(MediaEvent::IceCandidate(IceCandidate::new(candidate)));
    }

    pub fn emit_connected(&self) {
        self.emit(MediaEvent::ConnectionState(MediaConnectionState::Connected));
    }

    pub fn emit_failed(&self) {
        self.emit(MediaEvent::ConnectionState(MediaConnectionState::Failed));
    }

    pub fn candidate_strings(&self) -> Vec<String> {
        self.applied_candidates
            .lock()
            .unwrap()
            .iter()
            .map(|c| c.candidate.clone())
            .collect()
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }
}

struct FakeSession {
    label: String,
    state: Arc<FakeSessionState>,
}

#[async_trait]
impl MediaSession for FakeSession {
    async fn create_offer(&self) -> Result<SessionDescription, MediaError> {
        Ok(SessionDescription::offer(format!("offer-from-{}", self.label)))
    }

    async fn create_answer(&self) -> Result<SessionDescription, MediaError> {
        Ok(SessionDescription::answer(format!(
            "answer-from-{}",
            self.label
        )))
    }

    async fn set_local_description(&self, _desc: &SessionDescription) -> Result<(), MediaError> {
        Ok(())
    }

    async fn set_remote_description(&self, desc: &SessionDescription) -> Result<(), MediaError> {
        self.state
            .remote_descriptions
            .lock()
            .unwrap()
            .push(desc.clone());
        Ok(())
    }

    async fn add_ice_candidate(&self, candidate: &IceCandidate) -> Result<(), MediaError> {
        self.state
            .applied_candidates
            .lock()
            .unwrap()
            .push(candidate.clone());
        Ok(())
    }

    fn set_audio_enabled(&self, enabled: bool) -> bool {
        self.state.audio_enabled.store(enabled, Ordering::SeqCst);
        enabled
    }

    fn set_video_enabled(&self, enabled: bool) -> bool {
        self.state.video_enabled.store(enabled, Ordering::SeqCst);
        enabled
    }

    fn switch_camera(&self) -> bool {
        true
    }

    async fn close(&self) {
        self.state.closed.store(true, Ordering::SeqCst);
        // Dropping the sender ends the manager's event forwarder.
        self.state.events.lock().unwrap().take();
    }
}

pub struct FakeMediaEngine {
    label: String,
    fail_next: Mutex<Option<MediaError>>,
    sessions: Mutex<Vec<Arc<FakeSessionState>>>,
}

impl FakeMediaEngine {
    pub fn new(label: &str) -> Arc<Self> {
        Arc::new(Self {
            label: label.to_string(),
            fail_next: Mutex::new(None),
            sessions: Mutex::new(Vec::new()),
        })
    }

    /// Make the next acquisition fail with `err`.
    pub fn fail_next(&self, err: MediaError) {
        *self.fail_next.lock().unwrap() = Some(err);
    }

    /// State of the n-th session this engine created.
    pub fn session(&self, index: usize) -> Arc<FakeSessionState> {
        self.sessions.lock().unwrap()[index].clone()
    }

    pub fn session_count(&self) -> usize {
        self.sessions.lock().unwrap().len()
    }
}

#[async_trait]
impl MediaEngine for FakeMediaEngine {
    async fn create_session(
        &self,
        constraints: MediaConstraints,
        events: mpsc::UnboundedSender<MediaEvent>,
    ) -> Result<Box<dyn MediaSession>, MediaError> {
        if let Some(err) = self.fail_next.lock().unwrap().take() {
            return Err(err);
        }
        let state = Arc::new(FakeSessionState::default());
        state.audio_enabled.store(constraints.audio, Ordering::SeqCst);
        state.video_enabled.store(constraints.video, Ordering::SeqCst);
        *state.events.lock().unwrap() = Some(events);
        self.sessions.lock().unwrap().push(state.clone());
        Ok(Box::new(FakeSession {
            label: self.label.clone(),
            state,
        }))
    }
}

#[derive(Default)]
pub struct RecordingGateway {
    pub notifications: Mutex<Vec<CallNotification>>,
}

#[async_trait]
impl WakeGateway for RecordingGateway {
    async fn send_call_notification(
        &self,
        notification: CallNotification,
    ) -> Result<(), PushError> {
        self.notifications.lock().unwrap().push(notification);
        Ok(())
    }
}

pub struct DenyAllPolicy;

#[async_trait]
impl CallPolicy for DenyAllPolicy {
    async fn can_communicate(
        &self,
        _caller_id: &str,
        _receiver_id: &str,
    ) -> Result<bool, PolicyError> {
        Ok(false)
    }
}

pub struct TestPeer {
    pub manager: Arc<CallManager>,
    pub media: Arc<FakeMediaEngine>,
    pub push: Arc<RecordingGateway>,
}

pub fn fast_config() -> CallManagerConfig {
    CallManagerConfig {
        signaling: SignalingConfig {
            publish_attempts: 3,
            retry_delay: Duration::from_millis(1),
        },
        // Long enough that cleanup never races the assertions.
        signaling_cleanup_delay: Duration::from_secs(120),
    }
}

pub fn make_peer(store: &Arc<MemoryStore>, user_id: &str, name: &str) -> TestPeer {
    make_peer_with_policy(store, user_id, name, Arc::new(AllowAllPolicy))
}

pub fn make_peer_with_policy(
    store: &Arc<MemoryStore>,
    user_id: &str,
    name: &str,
    policy: Arc<dyn CallPolicy>,
) -> TestPeer {
    let media = FakeMediaEngine::new(user_id);
    let push = Arc::new(RecordingGateway::default());
    let deps = CallManagerDeps {
        call_store: store.clone(),
        log_store: store.clone(),
        media: media.clone(),
        push: push.clone(),
        policy,
    };
    let manager = CallManager::new(LocalIdentity::new(user_id, name), deps, fast_config());
    TestPeer {
        manager,
        media,
        push,
    }
}

/// Poll `cond` until it holds or a couple of seconds pass.
pub async fn wait_for(what: &str, cond: impl Fn() -> bool) {
    for _ in 0..400 {
        if cond() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    panic!("timed out waiting for {what}");
}
