//! Peer media negotiation engine.
//!
//! Owns one [`MediaSession`] and the negotiation ordering rules: the remote
//! description is applied exactly once per call, and candidates that trickle
//! in before it are buffered and flushed in arrival order immediately after.
//! The engine is exclusively owned by the orchestrator's driver task, so it
//! needs no internal locking.

use log::{debug, warn};
use tokio::sync::mpsc;

use crate::media::{
    IceCandidate, MediaConstraints, MediaEngine, MediaError, MediaEvent, MediaSession,
    SessionDescription,
};

pub struct NegotiationEngine {
    session: Box<dyn MediaSession>,
    remote_applied: bool,
    pending_candidates: Vec<IceCandidate>,
    muted: bool,
    video_enabled: bool,
    closed: bool,
}

impl NegotiationEngine {
    /// Acquire local media and open a peer session.
    ///
    /// A typed acquisition failure (permission denied, device busy) is the
    /// caller's signal to fail the call without ever reaching `connecting`.
    pub async fn start(
        engine: &dyn MediaEngine,
        constraints: MediaConstraints,
        events: mpsc::UnboundedSender<MediaEvent>,
    ) -> Result<Self, MediaError> {
        let session = engine.create_session(constraints, events).await?;
        Ok(Self {
            session,
            remote_applied: false,
            pending_candidates: Vec::new(),
            muted: false,
            video_enabled: constraints.video,
            closed: false,
        })
    }

    /// Construct the local offer and apply it as the local description.
    pub async fn create_offer(&mut self) -> Result<SessionDescription, MediaError> {
        let offer = self.session.create_offer().await?;
        self.session.set_local_description(&offer).await?;
        Ok(offer)
    }

    /// Consume the remote offer and construct the local answer (callee side).
    pub async fn accept_offer(
        &mut self,
        offer: &SessionDescription,
    ) -> Result<SessionDescription, MediaError> {
        if self.remote_applied {
            return Err(MediaError::Negotiation(
                "remote description already applied".into(),
            ));
        }
        self.apply_remote(offer).await?;
        let answer = self.session.create_answer().await?;
        self.session.set_local_description(&answer).await?;
        Ok(answer)
    }

    /// Apply the remote answer (caller side). Duplicate deliveries are
    /// no-ops; the remote description is applied exactly once per call.
    pub async fn apply_remote_answer(
        &mut self,
        answer: &SessionDescription,
    ) -> Result<(), MediaError> {
        if self.remote_applied {
            debug!("duplicate remote answer ignored");
            return Ok(());
        }
        self.apply_remote(answer).await
    }

    async fn apply_remote(&mut self, desc: &SessionDescription) -> Result<(), MediaError> {
        self.session.set_remote_description(desc).await?;
        self.remote_applied = true;
        let buffered = std::mem::take(&mut self.pending_candidates);
        if !buffered.is_empty() {
            debug!("flushing {} buffered candidates", buffered.len());
        }
        for candidate in buffered {
            self.feed_candidate(&candidate).await;
        }
        Ok(())
    }

    /// Hand a trickled remote candidate to the media engine, buffering it if
    /// the remote description has not been applied yet.
    pub async fn add_remote_candidate(&mut self, candidate: IceCandidate) {
        if !self.remote_applied {
            self.pending_candidates.push(candidate);
            return;
        }
        self.feed_candidate(&candidate).await;
    }

    async fn feed_candidate(&self, candidate: &IceCandidate) {
        // Individual candidate failures are not fatal to the negotiation;
        // the transport keeps trying the remaining pairs.
        if let Err(err) = self.session.add_ice_candidate(candidate).await {
            warn!("failed to apply remote candidate: {err}");
        }
    }

    /// Toggle the microphone. Returns the new muted state; never fails.
    pub fn toggle_mute(&mut self) -> bool {
        let enabled = self.session.set_audio_enabled(self.muted);
        self.muted = !enabled;
        self.muted
    }

    /// Toggle the camera track. Returns whether video is now enabled.
    pub fn toggle_video(&mut self) -> bool {
        let enabled = self.session.set_video_enabled(!self.video_enabled);
        self.video_enabled = enabled;
        self.video_enabled
    }

    /// Switch between front and back camera. Returns whether a switch
    /// happened.
    pub fn switch_camera(&mut self) -> bool {
        self.session.switch_camera()
    }

    pub fn is_muted(&self) -> bool {
        self.muted
    }

    pub fn video_enabled(&self) -> bool {
        self.video_enabled
    }

    /// Release the media session. Idempotent.
    pub async fn close(&mut self) {
        if self.closed {
            return;
        }
        self.closed = true;
        self.session.close().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::{Arc, Mutex};

    #[derive(Default)]
    struct FakeState {
        ops: Mutex<Vec<String>>,
        audio_enabled: AtomicBool,
        video_enabled: AtomicBool,
        closed: AtomicBool,
    }

    impl FakeState {
        fn ops(&self) -> Vec<String> {
            self.ops.lock().unwrap().clone()
        }

        fn push(&self, op: impl Into<String>) {
            self.ops.lock().unwrap().push(op.into());
        }
    }

    struct FakeSession {
        state: Arc<FakeState>,
    }

    #[async_trait]
    impl MediaSession for FakeSession {
        async fn create_offer(&self) -> Result<SessionDescription, MediaError> {
            self.state.push("create_offer");
            Ok(SessionDescription::offer("fake-offer"))
        }
        async fn create_answer(&self) -> Result<SessionDescription, MediaError> {
            self.state.push("create_answer");
            Ok(SessionDescription::answer("fake-answer"))
        }
        async fn set_local_description(
            &self,
            desc: &SessionDescription,
        ) -> Result<(), MediaError> {
            self.state.push(format!("set_local:{}", desc.sdp));
            Ok(())
        }
        async fn set_remote_description(
            &self,
            desc: &SessionDescription,
        ) -> Result<(), MediaError> {
            self.state.push(format!("set_remote:{}", desc.sdp));
            Ok(())
        }
        async fn add_ice_candidate(&self, candidate: &IceCandidate) -> Result<(), MediaError> {
            self.state.push(format!("candidate:{}", candidate.candidate));
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
            self.state.push("switch_camera");
            true
        }
        async fn close(&self) {
            self.state.closed.store(true, Ordering::SeqCst);
            self.state.push("close");
        }
    }

    struct FakeEngine {
        state: Arc<FakeState>,
        fail: Option<MediaError>,
    }

    #[async_trait]
    impl MediaEngine for FakeEngine {
        async fn create_session(
            &self,
            _constraints: MediaConstraints,
            _events: mpsc::UnboundedSender<MediaEvent>,
        ) -> Result<Box<dyn MediaSession>, MediaError> {
            if let Some(err) = &self.fail {
                return Err(err.clone());
            }
            Ok(Box::new(FakeSession {
                state: self.state.clone(),
            }))
        }
    }

    async fn engine_with(
        constraints: MediaConstraints,
    ) -> (NegotiationEngine, Arc<FakeState>) {
        let state = Arc::new(FakeState::default());
        let fake = FakeEngine {
            state: state.clone(),
            fail: None,
        };
        let (tx, _rx) = mpsc::unbounded_channel();
        let engine = NegotiationEngine::start(&fake, constraints, tx).await.unwrap();
        (engine, state)
    }

    fn audio() -> MediaConstraints {
        MediaConstraints {
            audio: true,
            video: false,
        }
    }

    #[tokio::test]
    async fn test_acquisition_failure_is_typed() {
        let fake = FakeEngine {
            state: Arc::new(FakeState::default()),
            fail: Some(MediaError::PermissionDenied("microphone".into())),
        };
        let (tx, _rx) = mpsc::unbounded_channel();
        let err = NegotiationEngine::start(&fake, audio(), tx)
            .await
            .err()
            .unwrap();
        assert!(matches!(err, MediaError::PermissionDenied(_)));
    }

    #[tokio::test]
    async fn test_create_offer_sets_local_description() {
        let (mut engine, state) = engine_with(audio()).await;
        let offer = engine.create_offer().await.unwrap();
        assert_eq!(offer.sdp, "fake-offer");
        assert_eq!(state.ops(), vec!["create_offer", "set_local:fake-offer"]);
    }

    #[tokio::test]
    async fn test_candidates_buffered_until_remote_description() {
        let (mut engine, state) = engine_with(audio()).await;
        engine.create_offer().await.unwrap();

        engine.add_remote_candidate(IceCandidate::new("c0")).await;
        engine.add_remote_candidate(IceCandidate::new("c1")).await;
        assert!(state.ops().iter().all(|op| !op.starts_with("candidate:")));

        engine
            .apply_remote_answer(&SessionDescription::answer("remote"))
            .await
            .unwrap();
        engine.add_remote_candidate(IceCandidate::new("c2")).await;

        let ops = state.ops();
        let tail: Vec<&str> = ops.iter().map(String::as_str).skip(2).collect();
        assert_eq!(
            tail,
            vec![
                "set_remote:remote",
                "candidate:c0",
                "candidate:c1",
                "candidate:c2",
            ]
        );
    }

    #[tokio::test]
    async fn test_remote_answer_applied_exactly_once() {
        let (mut engine, state) = engine_with(audio()).await;
        let answer = SessionDescription::answer("remote");
        engine.apply_remote_answer(&answer).await.unwrap();
        engine.apply_remote_answer(&answer).await.unwrap();

        let remotes = state
            .ops()
            .iter()
            .filter(|op| op.starts_with("set_remote:"))
            .count();
        assert_eq!(remotes, 1);
    }

    #[tokio::test]
    async fn test_accept_offer_rejects_second_offer() {
        let (mut engine, state) = engine_with(audio()).await;
        let offer = SessionDescription::offer("remote-offer");
        let answer = engine.accept_offer(&offer).await.unwrap();
        assert_eq!(answer.sdp, "fake-answer");
        assert_eq!(
            state.ops(),
            vec![
                "set_remote:remote-offer",
                "create_answer",
                "set_local:fake-answer",
            ]
        );

        assert!(engine.accept_offer(&offer).await.is_err());
    }

    #[tokio::test]
    async fn test_mute_toggle_roundtrip() {
        let (mut engine, state) = engine_with(audio()).await;
        assert!(!engine.is_muted());
        assert!(engine.toggle_mute());
        assert!(engine.is_muted());
        assert!(!state.audio_enabled.load(Ordering::SeqCst));
        assert!(!engine.toggle_mute());
        assert!(!engine.is_muted());
        assert!(state.audio_enabled.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn test_video_toggle_roundtrip() {
        let (mut engine, state) = engine_with(MediaConstraints {
            audio: true,
            video: true,
        })
        .await;
        assert!(engine.video_enabled());
        assert!(!engine.toggle_video());
        assert!(!state.video_enabled.load(Ordering::SeqCst));
        assert!(engine.toggle_video());
        assert!(state.video_enabled.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn test_close_is_idempotent() {
        let (mut engine, state) = engine_with(audio()).await;
        engine.close().await;
        engine.close().await;
        let closes = state.ops().iter().filter(|op| *op == "close").count();
        assert_eq!(closes, 1);
    }
}
