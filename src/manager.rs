//! Call lifecycle orchestrator.
//!
//! [`CallManager`] owns the single active call session on this device and
//! the call-level state machine above the negotiation engine. Two event
//! streams race against the session: local user actions (start, answer,
//! hang up, mute) and inbound signaling/media events. Both funnel through
//! one command queue processed by a single driver task, so their application
//! is serialized: two terminal transitions can never interleave and no
//! candidate is applied after teardown has begun.
//!
//! Termination is deduplicated per call id: whichever path observes it first
//! (local hang-up, remote status write, timeout, media failure) applies the
//! state transition, releases media, stops the candidate publisher, closes
//! the subscription, resolves the shared record with a guarded patch and
//! writes the final log rows; every later request is a no-op.

use log::{debug, info, warn};
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot};

use chrono::Utc;

use crate::call_log::CallLogger;
use crate::config::CallManagerConfig;
use crate::error::CallError;
use crate::media::{
    IceCandidate, MediaConnectionState, MediaConstraints, MediaEngine, MediaEvent,
    SessionDescription,
};
use crate::negotiation::NegotiationEngine;
use crate::policy::CallPolicy;
use crate::push::WakeGateway;
use crate::session::{CallListenerHandle, CallSession, CurrentCallStore};
use crate::signaling::{ChannelError, SignalingChannel, SignalingHandler, SignalingSubscription};
use crate::state::{CallState, CallTransition};
use crate::store::traits::{CallLogStore, CallRecordSink, CallStore, WatchHandle};
use crate::types::call::{
    CallDirection, CallId, CallLogEntry, CallNotification, CallRecord, CallStatus, CallType, Peer,
};

/// This device's user as presented to counterparties.
#[derive(Debug, Clone)]
pub struct LocalIdentity {
    pub user_id: String,
    pub display_name: String,
    pub avatar_url: Option<String>,
}

impl LocalIdentity {
    pub fn new(user_id: impl Into<String>, display_name: impl Into<String>) -> Self {
        Self {
            user_id: user_id.into(),
            display_name: display_name.into(),
            avatar_url: None,
        }
    }

    pub fn as_peer(&self) -> Peer {
        Peer {
            user_id: self.user_id.clone(),
            display_name: self.display_name.clone(),
            avatar_url: self.avatar_url.clone(),
        }
    }
}

/// External collaborators injected at construction.
pub struct CallManagerDeps {
    pub call_store: Arc<dyn CallStore>,
    pub log_store: Arc<dyn CallLogStore>,
    pub media: Arc<dyn MediaEngine>,
    pub push: Arc<dyn WakeGateway>,
    pub policy: Arc<dyn CallPolicy>,
}

enum SignalEvent {
    Offer(SessionDescription),
    Answer(SessionDescription),
    Candidate(IceCandidate),
    Status(CallStatus),
    Error(ChannelError),
}

enum Command {
    Start {
        receiver: Peer,
        call_type: CallType,
        chat_id: Option<String>,
        reply: oneshot::Sender<Result<CallId, CallError>>,
    },
    Answer {
        call_id: CallId,
        reply: oneshot::Sender<Result<(), CallError>>,
    },
    Decline {
        call_id: CallId,
        reply: oneshot::Sender<Result<(), CallError>>,
    },
    End {
        reply: oneshot::Sender<Result<(), CallError>>,
    },
    RingTimeout {
        call_id: CallId,
        reply: oneshot::Sender<Result<(), CallError>>,
    },
    ToggleMute {
        reply: oneshot::Sender<bool>,
    },
    ToggleVideo {
        reply: oneshot::Sender<bool>,
    },
    SwitchCamera {
        reply: oneshot::Sender<bool>,
    },
    Signal {
        call_id: CallId,
        event: SignalEvent,
    },
    Media {
        call_id: CallId,
        event: MediaEvent,
    },
}

/// Forwards subscriber callbacks into the driver's command queue.
struct QueueHandler {
    call_id: CallId,
    commands: mpsc::UnboundedSender<Command>,
}

impl QueueHandler {
    fn forward(&self, event: SignalEvent) {
        let _ = self.commands.send(Command::Signal {
            call_id: self.call_id.clone(),
            event,
        });
    }
}

impl SignalingHandler for QueueHandler {
    fn on_offer(&self, offer: SessionDescription) {
        self.forward(SignalEvent::Offer(offer));
    }
    fn on_answer(&self, answer: SessionDescription) {
        self.forward(SignalEvent::Answer(answer));
    }
    fn on_candidate(&self, candidate: IceCandidate) {
        self.forward(SignalEvent::Candidate(candidate));
    }
    fn on_status(&self, status: CallStatus) {
        self.forward(SignalEvent::Status(status));
    }
    fn on_error(&self, error: ChannelError) {
        self.forward(SignalEvent::Error(error));
    }
}

fn spawn_media_forwarder(
    call_id: CallId,
    mut events: mpsc::UnboundedReceiver<MediaEvent>,
    commands: mpsc::UnboundedSender<Command>,
) {
    tokio::spawn(async move {
        while let Some(event) = events.recv().await {
            if commands
                .send(Command::Media {
                    call_id: call_id.clone(),
                    event,
                })
                .is_err()
            {
                break;
            }
        }
    });
}

struct ActiveCall {
    session: CallSession,
    /// Local copy of the shared record, kept current for log writes.
    record: CallRecord,
    engine: NegotiationEngine,
    subscription: SignalingSubscription,
    /// Feeds the per-call publisher task; dropping it stops publishing.
    candidate_tx: Option<mpsc::UnboundedSender<IceCandidate>>,
    /// Callee answered before the caller's offer reached the store.
    awaiting_offer: bool,
}

struct Driver {
    identity: LocalIdentity,
    channel: Arc<SignalingChannel>,
    logger: Arc<CallLogger>,
    media: Arc<dyn MediaEngine>,
    push: Arc<dyn WakeGateway>,
    policy: Arc<dyn CallPolicy>,
    current: Arc<CurrentCallStore>,
    config: CallManagerConfig,
    /// Weak so the driver does not keep its own queue alive: once the
    /// manager and all per-call artifacts are gone, the loop drains and
    /// stops. Per-call forwarders hold strong clones for their lifetime.
    commands: mpsc::WeakUnboundedSender<Command>,
    active: Option<ActiveCall>,
}

impl Driver {
    async fn run(mut self, mut commands: mpsc::UnboundedReceiver<Command>) {
        debug!("call driver started for {}", self.identity.user_id);
        // Observers must never see a stale session once the driver is gone.
        let _clear = scopeguard::guard(self.current.clone(), |current| current.set(None));
        while let Some(command) = commands.recv().await {
            self.handle(command).await;
        }
        if let Some(mut active) = self.active.take() {
            active.engine.close().await;
            active.subscription.unsubscribe();
        }
        debug!("call driver stopped for {}", self.identity.user_id);
    }

    async fn handle(&mut self, command: Command) {
        match command {
            Command::Start {
                receiver,
                call_type,
                chat_id,
                reply,
            } => {
                let _ = reply.send(self.handle_start(receiver, call_type, chat_id).await);
            }
            Command::Answer { call_id, reply } => {
                let _ = reply.send(self.handle_answer(call_id).await);
            }
            Command::Decline { call_id, reply } => {
                let _ = reply.send(self.handle_decline(call_id).await);
            }
            Command::End { reply } => {
                self.finish(CallStatus::Ended).await;
                let _ = reply.send(Ok(()));
            }
            Command::RingTimeout { call_id, reply } => {
                let _ = reply.send(self.handle_ring_timeout(call_id).await);
            }
            Command::ToggleMute { reply } => {
                let muted = match self.active.as_mut() {
                    Some(active) if !active.session.state.is_terminal() => {
                        let muted = active.engine.toggle_mute();
                        active.session.muted = muted;
                        self.current.set(Some(active.session.clone()));
                        muted
                    }
                    _ => false,
                };
                let _ = reply.send(muted);
            }
            Command::ToggleVideo { reply } => {
                let enabled = match self.active.as_mut() {
                    Some(active) if !active.session.state.is_terminal() => {
                        let enabled = active.engine.toggle_video();
                        active.session.video_enabled = enabled;
                        self.current.set(Some(active.session.clone()));
                        enabled
                    }
                    _ => false,
                };
                let _ = reply.send(enabled);
            }
            Command::SwitchCamera { reply } => {
                let switched = match self.active.as_mut() {
                    Some(active) if !active.session.state.is_terminal() => {
                        active.engine.switch_camera()
                    }
                    _ => false,
                };
                let _ = reply.send(switched);
            }
            Command::Signal { call_id, event } => self.handle_signal(call_id, event).await,
            Command::Media { call_id, event } => self.handle_media(call_id, event).await,
        }
    }

    async fn handle_start(
        &mut self,
        receiver: Peer,
        call_type: CallType,
        chat_id: Option<String>,
    ) -> Result<CallId, CallError> {
        if self.active.is_some() {
            return Err(CallError::Busy);
        }

        match self
            .policy
            .can_communicate(&self.identity.user_id, &receiver.user_id)
            .await
        {
            Ok(true) => {}
            Ok(false) => {
                info!("call to {} blocked by policy", receiver.user_id);
                return Err(CallError::PermissionDenied(
                    "calls to this user are not permitted".into(),
                ));
            }
            Err(err) => {
                warn!("policy check for {} failed: {err}", receiver.user_id);
                return Err(CallError::PermissionDenied(format!(
                    "policy check failed: {err}"
                )));
            }
        }

        let Some(commands) = self.commands.upgrade() else {
            return Err(CallError::Stopped);
        };

        let call_id = CallId::generate();
        let (media_tx, media_rx) = mpsc::unbounded_channel();
        spawn_media_forwarder(call_id.clone(), media_rx, commands.clone());

        let mut engine = NegotiationEngine::start(
            self.media.as_ref(),
            MediaConstraints::for_call_type(call_type),
            media_tx,
        )
        .await?;

        let offer = match engine.create_offer().await {
            Ok(offer) => offer,
            Err(err) => {
                engine.close().await;
                return Err(err.into());
            }
        };

        let record = CallRecord::new_outgoing(
            call_id.clone(),
            self.identity.as_peer(),
            receiver.clone(),
            call_type,
            chat_id,
        );
        if let Err(err) = self.channel.create_call(&record).await {
            engine.close().await;
            return Err(err.into());
        }
        if let Err(err) = self.channel.publish_offer(&call_id, &offer).await {
            engine.close().await;
            if let Err(del) = self.channel.delete_signaling_data(&call_id).await {
                warn!("failed to remove aborted call {call_id}: {del}");
            }
            return Err(err.into());
        }

        let subscription = self.channel.subscribe(
            &call_id,
            Arc::new(QueueHandler {
                call_id: call_id.clone(),
                commands: commands.clone(),
            }),
        );
        let candidate_tx = self.spawn_candidate_publisher(call_id.clone(), commands);

        let mut record = record;
        if let Ok(raw) = offer.to_json() {
            record.offer = Some(raw);
        }
        let session = CallSession::from_record(&record, &self.identity.user_id);
        self.active = Some(ActiveCall {
            session: session.clone(),
            record: record.clone(),
            engine,
            subscription,
            candidate_tx: Some(candidate_tx),
            awaiting_offer: false,
        });
        self.current.set(Some(session));

        let push = self.push.clone();
        let notification = CallNotification {
            recipient_id: receiver.user_id.clone(),
            caller_id: self.identity.user_id.clone(),
            caller_name: self.identity.display_name.clone(),
            call_type,
            call_id: call_id.clone(),
            chat_id: record.chat_id.clone(),
        };
        // Best effort: a dead push gateway must not block call setup.
        tokio::spawn(async move {
            if let Err(err) = push.send_call_notification(notification).await {
                warn!("call notification failed: {err}");
            }
        });

        if let Err(err) = self.logger.log_call(&record).await {
            warn!("failed to write call log rows for {call_id}: {err}");
        }

        info!(
            "started {} call {call_id} to {}",
            record.call_type, receiver.user_id
        );
        Ok(call_id)
    }

    async fn handle_answer(&mut self, call_id: CallId) -> Result<(), CallError> {
        if self.active.is_some() {
            return Err(CallError::Busy);
        }

        let record = match self.channel.fetch_call(&call_id).await? {
            Some(record) => record,
            None => {
                // Benign race: the caller cancelled before we answered.
                warn!("answering unknown call {call_id}, ignoring");
                return Ok(());
            }
        };
        if record.status.is_terminal() {
            warn!(
                "answering call {call_id} already resolved as {}, ignoring",
                record.status
            );
            return Ok(());
        }

        let Some(commands) = self.commands.upgrade() else {
            return Err(CallError::Stopped);
        };

        let (media_tx, media_rx) = mpsc::unbounded_channel();
        spawn_media_forwarder(call_id.clone(), media_rx, commands.clone());
        let mut engine = match NegotiationEngine::start(
            self.media.as_ref(),
            MediaConstraints::for_call_type(record.call_type),
            media_tx,
        )
        .await
        {
            Ok(engine) => engine,
            Err(err) => {
                self.resolve_failed(&record).await;
                return Err(err.into());
            }
        };

        // The offer is normally already on the record; if the caller's write
        // is still in flight, the subscription completes the answer later.
        let mut awaiting_offer = true;
        let mut answer = None;
        if let Some(raw) = &record.offer {
            let offer = match SessionDescription::from_json(raw) {
                Ok(offer) => offer,
                Err(err) => {
                    engine.close().await;
                    self.resolve_failed(&record).await;
                    return Err(ChannelError::Corrupt(err.to_string()).into());
                }
            };
            match engine.accept_offer(&offer).await {
                Ok(local_answer) => {
                    answer = Some(local_answer);
                    awaiting_offer = false;
                }
                Err(err) => {
                    engine.close().await;
                    self.resolve_failed(&record).await;
                    return Err(err.into());
                }
            }
        }

        let subscription = self.channel.subscribe(
            &call_id,
            Arc::new(QueueHandler {
                call_id: call_id.clone(),
                commands: commands.clone(),
            }),
        );
        let candidate_tx = self.spawn_candidate_publisher(call_id.clone(), commands);

        let mut record = record;
        let mut session = CallSession::from_record(&record, &self.identity.user_id);
        if let Some(answer) = &answer {
            match self.channel.publish_answer(&call_id, answer).await {
                Ok(()) => {}
                Err(ChannelError::NotFound(_)) => {
                    warn!("call {call_id} vanished while answering, ignoring");
                    engine.close().await;
                    subscription.unsubscribe();
                    return Ok(());
                }
                Err(err) => {
                    engine.close().await;
                    subscription.unsubscribe();
                    self.resolve_failed(&record).await;
                    return Err(err.into());
                }
            }
            if let Ok(raw) = answer.to_json() {
                record.answer = Some(raw);
            }
            record.status = CallStatus::Connecting;
            session.state.apply_transition(CallTransition::Answered)?;
        }

        self.active = Some(ActiveCall {
            session: session.clone(),
            record: record.clone(),
            engine,
            subscription,
            candidate_tx: Some(candidate_tx),
            awaiting_offer,
        });
        self.current.set(Some(session));

        if let Err(err) = self.logger.log_call(&record).await {
            warn!("failed to update call log rows for {call_id}: {err}");
        }
        info!("answered call {call_id}");
        Ok(())
    }

    async fn handle_decline(&mut self, call_id: CallId) -> Result<(), CallError> {
        let live_ringing = self
            .active
            .as_ref()
            .filter(|active| active.session.call_id == call_id)
            .map(|active| active.session.state.is_ringing());
        match live_ringing {
            Some(true) => {
                self.finish(CallStatus::Declined).await;
                Ok(())
            }
            Some(false) => {
                debug!("decline for call {call_id} ignored: past ringing");
                Ok(())
            }
            None => self.resolve_ringing(call_id, CallStatus::Declined).await,
        }
    }

    async fn handle_ring_timeout(&mut self, call_id: CallId) -> Result<(), CallError> {
        let live_ringing = self
            .active
            .as_ref()
            .filter(|active| active.session.call_id == call_id)
            .map(|active| active.session.state.is_ringing());
        match live_ringing {
            Some(true) => {
                info!("call {call_id} timed out while ringing");
                self.finish(CallStatus::Missed).await;
                Ok(())
            }
            Some(false) => Ok(()),
            None => self.resolve_ringing(call_id, CallStatus::Missed).await,
        }
    }

    /// Store-side resolution for a call this device has no session for
    /// (declining or timing out an unanswered incoming call).
    async fn resolve_ringing(&self, call_id: CallId, status: CallStatus) -> Result<(), CallError> {
        let applied = self
            .channel
            .resolve_from_ringing(&call_id, status, Utc::now())
            .await?;
        if !applied {
            debug!("{status} resolution for call {call_id} was a no-op");
            return Ok(());
        }
        info!("resolved call {call_id} as {status}");
        if let Some(record) = self.channel.fetch_call(&call_id).await? {
            if let Err(err) = self.logger.log_call(&record).await {
                warn!("failed to update call log rows for {call_id}: {err}");
            }
        }
        self.schedule_signaling_cleanup(call_id);
        Ok(())
    }

    /// Mark a call failed before a session ever existed (media acquisition
    /// or negotiation failure while answering).
    async fn resolve_failed(&self, record: &CallRecord) {
        let now = Utc::now();
        if let Err(err) = self
            .channel
            .resolve_terminal(&record.call_id, CallStatus::Failed, now, None)
            .await
        {
            warn!("failed to mark call {} failed: {err}", record.call_id);
        }
        let mut record = record.clone();
        record.status = CallStatus::Failed;
        record.end_time = Some(now);
        record.duration_secs = None;
        if let Err(err) = self.logger.log_call(&record).await {
            warn!(
                "failed to update call log rows for {}: {err}",
                record.call_id
            );
        }
        self.schedule_signaling_cleanup(record.call_id.clone());
    }

    async fn handle_signal(&mut self, call_id: CallId, event: SignalEvent) {
        let live = self
            .active
            .as_ref()
            .is_some_and(|active| active.session.call_id == call_id);
        if !live {
            debug!("signaling event for inactive call {call_id} dropped");
            return;
        }
        match event {
            SignalEvent::Offer(offer) => self.handle_remote_offer(offer).await,
            SignalEvent::Answer(answer) => self.handle_remote_answer(answer).await,
            SignalEvent::Candidate(candidate) => {
                if let Some(active) = self.active.as_mut() {
                    active.engine.add_remote_candidate(candidate).await;
                }
            }
            SignalEvent::Status(status) => self.handle_remote_status(status).await,
            SignalEvent::Error(err) => match err {
                ChannelError::NotFound(_) => {
                    debug!("signaling record for call {call_id} gone");
                }
                err => {
                    warn!("signaling channel failed for call {call_id}: {err}");
                    self.finish(CallStatus::Failed).await;
                }
            },
        }
    }

    /// Callee answered before the offer reached the store; complete the
    /// answer now that it arrived.
    async fn handle_remote_offer(&mut self, offer: SessionDescription) {
        let (call_id, accepted) = {
            let Some(active) = self.active.as_mut() else {
                return;
            };
            if !active.awaiting_offer {
                debug!(
                    "offer for call {} ignored: already applied",
                    active.session.call_id
                );
                return;
            }
            active.awaiting_offer = false;
            let call_id = active.session.call_id.clone();
            let accepted = active.engine.accept_offer(&offer).await;
            (call_id, accepted)
        };

        let answer = match accepted {
            Ok(answer) => answer,
            Err(err) => {
                warn!("failed to accept offer for call {call_id}: {err}");
                self.finish(CallStatus::Failed).await;
                return;
            }
        };

        match self.channel.publish_answer(&call_id, &answer).await {
            Ok(()) => {}
            Err(ChannelError::NotFound(_)) => {
                warn!("call {call_id} vanished before the answer was published");
                self.finish(CallStatus::Ended).await;
                return;
            }
            Err(err) => {
                warn!("failed to publish answer for call {call_id}: {err}");
                self.finish(CallStatus::Failed).await;
                return;
            }
        }

        let Some(active) = self.active.as_mut() else {
            return;
        };
        if let Ok(raw) = answer.to_json() {
            active.record.answer = Some(raw);
        }
        active.record.status = CallStatus::Connecting;
        if let Err(err) = active.session.state.apply_transition(CallTransition::Answered) {
            warn!("late answer for call {call_id}: {err}");
            return;
        }
        let record = active.record.clone();
        self.current.set(Some(active.session.clone()));
        if let Err(err) = self.logger.log_call(&record).await {
            warn!("failed to update call log rows for {call_id}: {err}");
        }
        info!("call {call_id} connecting");
    }

    async fn handle_remote_answer(&mut self, answer: SessionDescription) {
        let applied = {
            let Some(active) = self.active.as_mut() else {
                return;
            };
            if active.session.direction != CallDirection::Outgoing {
                debug!("answer event ignored on the callee side");
                return;
            }
            if !active.session.state.is_ringing() {
                debug!("duplicate answer for call {} ignored", active.session.call_id);
                return;
            }
            active.engine.apply_remote_answer(&answer).await
        };

        if let Err(err) = applied {
            warn!("failed to apply remote answer: {err}");
            self.finish(CallStatus::Failed).await;
            return;
        }

        let Some(active) = self.active.as_mut() else {
            return;
        };
        if let Err(err) = active.session.state.apply_transition(CallTransition::Answered) {
            warn!(
                "answer for call {} in state {:?}: {err}",
                active.session.call_id, active.session.state
            );
            return;
        }
        if let Ok(raw) = answer.to_json() {
            active.record.answer = Some(raw);
        }
        active.record.status = CallStatus::Connecting;
        let call_id = active.session.call_id.clone();
        let record = active.record.clone();
        self.current.set(Some(active.session.clone()));
        if let Err(err) = self.logger.log_call(&record).await {
            warn!("failed to update call log rows for {call_id}: {err}");
        }
        info!("call {call_id} connecting");
    }

    async fn handle_remote_status(&mut self, status: CallStatus) {
        if !status.is_terminal() {
            debug!("shared record moved to {status}");
            return;
        }
        let live = self
            .active
            .as_ref()
            .is_some_and(|active| !active.session.state.is_terminal());
        if !live {
            return;
        }
        info!("remote side resolved the call as {status}");
        self.finish(status).await;
    }

    async fn handle_media(&mut self, call_id: CallId, event: MediaEvent) {
        let live = self
            .active
            .as_ref()
            .is_some_and(|active| active.session.call_id == call_id);
        if !live {
            debug!("media event for inactive call {call_id} dropped");
            return;
        }
        match event {
            MediaEvent::IceCandidate(candidate) => {
                if let Some(active) = self.active.as_ref()
                    && let Some(tx) = &active.candidate_tx
                    && tx.send(candidate).is_err()
                {
                    debug!("candidate publisher for call {call_id} already stopped");
                }
            }
            MediaEvent::Track => debug!("remote track available for call {call_id}"),
            MediaEvent::ConnectionState(state) => self.handle_connection_state(state).await,
        }
    }

    async fn handle_connection_state(&mut self, state: MediaConnectionState) {
        match state {
            MediaConnectionState::Connected => {
                let call_id = {
                    let Some(active) = self.active.as_mut() else {
                        return;
                    };
                    if !matches!(active.session.state, CallState::Connecting { .. }) {
                        debug!(
                            "connected signal in state {} ignored",
                            active.session.status()
                        );
                        return;
                    }
                    if let Err(err) = active
                        .session
                        .state
                        .apply_transition(CallTransition::MediaConnected)
                    {
                        warn!("cannot mark call connected: {err}");
                        return;
                    }
                    active.record.status = CallStatus::Connected;
                    self.current.set(Some(active.session.clone()));
                    active.session.call_id.clone()
                };
                if let Err(err) = self.channel.mark_connected(&call_id).await {
                    warn!("failed to mark call {call_id} connected: {err}");
                }
                info!("call {call_id} connected");
            }
            MediaConnectionState::Failed => {
                warn!("media transport failed");
                self.finish(CallStatus::Failed).await;
            }
            MediaConnectionState::Disconnected => {
                debug!("media transport disconnected, waiting for recovery");
            }
            MediaConnectionState::New
            | MediaConnectionState::Connecting
            | MediaConnectionState::Closed => {}
        }
    }

    /// Single terminal path for the live session. Deduplicated: once the
    /// session is gone every further termination request is a no-op.
    async fn finish(&mut self, status: CallStatus) {
        let active = match self.active.take() {
            Some(active) if !active.session.state.is_terminal() => active,
            other => {
                self.active = other;
                return;
            }
        };
        let ActiveCall {
            mut session,
            mut record,
            mut engine,
            subscription,
            candidate_tx,
            ..
        } = active;

        // Missed/declined bookkeeping only applies before the answer; a
        // later termination is an ordinary hang-up.
        let effective = if session.state.reached_connecting()
            && matches!(status, CallStatus::Missed | CallStatus::Declined)
        {
            CallStatus::Ended
        } else {
            status
        };

        if session
            .state
            .apply_transition(CallTransition::Terminated { status: effective })
            .is_err()
        {
            // Unreachable with an adjusted status, but never leave the
            // session non-terminal.
            session.state = CallState::Terminal {
                status: effective,
                ended_at: Utc::now(),
                duration_secs: None,
            };
        }

        // Local resources are released on every terminal path before any
        // remote write is attempted.
        engine.close().await;
        drop(candidate_tx);
        subscription.unsubscribe();

        let (end_time, duration_secs) = match &session.state {
            CallState::Terminal {
                ended_at,
                duration_secs,
                ..
            } => (*ended_at, *duration_secs),
            _ => (Utc::now(), None),
        };

        let resolved = if matches!(effective, CallStatus::Missed | CallStatus::Declined) {
            self.channel
                .resolve_from_ringing(&session.call_id, effective, end_time)
                .await
        } else {
            self.channel
                .resolve_terminal(&session.call_id, effective, end_time, duration_secs)
                .await
        };
        if let Err(err) = resolved {
            // Hang-up still succeeds locally; the other side times out.
            warn!(
                "failed to publish terminal status for call {}: {err}",
                session.call_id
            );
        }

        record.status = effective;
        record.end_time = Some(end_time);
        record.duration_secs = duration_secs;
        if let Err(err) = self.logger.log_call(&record).await {
            warn!(
                "failed to update call log rows for {}: {err}",
                session.call_id
            );
        }

        self.schedule_signaling_cleanup(session.call_id.clone());

        info!("call {} finished as {effective}", session.call_id);
        self.current.set(Some(session));
        self.current.set(None);
    }

    fn schedule_signaling_cleanup(&self, call_id: CallId) {
        let channel = self.channel.clone();
        let delay = self.config.signaling_cleanup_delay;
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            if let Err(err) = channel.delete_signaling_data(&call_id).await {
                warn!("failed to delete signaling data for call {call_id}: {err}");
            }
        });
    }

    /// One publisher task per call keeps candidate publishes in emission
    /// order.
    fn spawn_candidate_publisher(
        &self,
        call_id: CallId,
        commands: mpsc::UnboundedSender<Command>,
    ) -> mpsc::UnboundedSender<IceCandidate> {
        let (tx, mut rx) = mpsc::unbounded_channel::<IceCandidate>();
        let channel = self.channel.clone();
        tokio::spawn(async move {
            while let Some(candidate) = rx.recv().await {
                match channel.publish_candidate(&call_id, &candidate).await {
                    Ok(()) => {}
                    Err(ChannelError::NotFound(_)) => {
                        debug!("candidate for deleted call {call_id} dropped");
                        break;
                    }
                    Err(err) => {
                        let _ = commands.send(Command::Signal {
                            call_id: call_id.clone(),
                            event: SignalEvent::Error(err),
                        });
                        break;
                    }
                }
            }
        });
        tx
    }
}

/// Entry point exposed to the UI and other collaborators.
pub struct CallManager {
    channel: Arc<SignalingChannel>,
    logger: Arc<CallLogger>,
    current: Arc<CurrentCallStore>,
    commands: mpsc::UnboundedSender<Command>,
}

impl CallManager {
    pub fn new(
        identity: LocalIdentity,
        deps: CallManagerDeps,
        config: CallManagerConfig,
    ) -> Arc<Self> {
        let channel = Arc::new(SignalingChannel::new(
            deps.call_store,
            identity.user_id.clone(),
            config.signaling.clone(),
        ));
        let logger = Arc::new(CallLogger::new(deps.log_store));
        let current = Arc::new(CurrentCallStore::new());
        let (commands, command_rx) = mpsc::unbounded_channel();
        let driver = Driver {
            identity,
            channel: channel.clone(),
            logger: logger.clone(),
            media: deps.media,
            push: deps.push,
            policy: deps.policy,
            current: current.clone(),
            config,
            commands: commands.downgrade(),
            active: None,
        };
        tokio::spawn(driver.run(command_rx));
        Arc::new(Self {
            channel,
            logger,
            current,
            commands,
        })
    }

    /// Start an outgoing call. Fails without any signaling write when the
    /// policy check denies the pair or local media cannot be acquired.
    pub async fn start_call(
        &self,
        receiver: Peer,
        call_type: CallType,
        chat_id: Option<String>,
    ) -> Result<CallId, CallError> {
        let (reply, rx) = oneshot::channel();
        self.commands
            .send(Command::Start {
                receiver,
                call_type,
                chat_id,
                reply,
            })
            .map_err(|_| CallError::Stopped)?;
        rx.await.map_err(|_| CallError::Stopped)?
    }

    /// Answer an incoming call. Answering a call that no longer exists (or
    /// was already resolved) is a benign race and returns `Ok`.
    pub async fn answer_call(&self, call_id: &CallId) -> Result<(), CallError> {
        let (reply, rx) = oneshot::channel();
        self.commands
            .send(Command::Answer {
                call_id: call_id.clone(),
                reply,
            })
            .map_err(|_| CallError::Stopped)?;
        rx.await.map_err(|_| CallError::Stopped)?
    }

    /// Decline a ringing incoming call without answering it.
    pub async fn decline_call(&self, call_id: &CallId) -> Result<(), CallError> {
        let (reply, rx) = oneshot::channel();
        self.commands
            .send(Command::Decline {
                call_id: call_id.clone(),
                reply,
            })
            .map_err(|_| CallError::Stopped)?;
        rx.await.map_err(|_| CallError::Stopped)?
    }

    /// Hang up the current call. Idempotent, and always succeeds locally
    /// even when the remote signaling write fails.
    pub async fn end_call(&self) -> Result<(), CallError> {
        let (reply, rx) = oneshot::channel();
        self.commands
            .send(Command::End { reply })
            .map_err(|_| CallError::Stopped)?;
        rx.await.map_err(|_| CallError::Stopped)?
    }

    /// External ring-timeout signal: resolves a still-ringing call to
    /// `missed`, exactly like a remote decline. No-op for answered calls.
    pub async fn handle_ring_timeout(&self, call_id: &CallId) -> Result<(), CallError> {
        let (reply, rx) = oneshot::channel();
        self.commands
            .send(Command::RingTimeout {
                call_id: call_id.clone(),
                reply,
            })
            .map_err(|_| CallError::Stopped)?;
        rx.await.map_err(|_| CallError::Stopped)?
    }

    /// Toggle the microphone. Returns the new muted state; never fails, and
    /// returns `false` (unmuted) when no call is active.
    pub async fn toggle_mute(&self) -> bool {
        let (reply, rx) = oneshot::channel();
        if self.commands.send(Command::ToggleMute { reply }).is_err() {
            return false;
        }
        rx.await.unwrap_or(false)
    }

    /// Toggle the camera track. Returns whether video is now enabled.
    pub async fn toggle_video(&self) -> bool {
        let (reply, rx) = oneshot::channel();
        if self.commands.send(Command::ToggleVideo { reply }).is_err() {
            return false;
        }
        rx.await.unwrap_or(false)
    }

    /// Switch between front and back camera. Returns whether a switch
    /// happened.
    pub async fn switch_camera(&self) -> bool {
        let (reply, rx) = oneshot::channel();
        if self.commands.send(Command::SwitchCamera { reply }).is_err() {
            return false;
        }
        rx.await.unwrap_or(false)
    }

    /// Snapshot of the call this device is currently on, if any.
    pub fn current_call(&self) -> Option<CallSession> {
        self.current.get()
    }

    /// Observe every session mutation. Listeners run synchronously in
    /// registration order and must not mutate call state from the callback.
    pub fn add_call_listener(
        &self,
        listener: impl Fn(Option<&CallSession>) + Send + Sync + 'static,
    ) -> CallListenerHandle {
        self.current.add_listener(listener)
    }

    /// Ringing calls addressed to this device's user.
    pub fn watch_incoming_calls(&self, sink: CallRecordSink) -> WatchHandle {
        self.channel.watch_incoming(sink)
    }

    /// One user's call history, newest first.
    pub async fn call_history(
        &self,
        user_id: &str,
        limit: usize,
    ) -> Result<Vec<CallLogEntry>, CallError> {
        Ok(self.logger.call_history(user_id, limit).await?)
    }

    /// Incremental call-history subscription with the same ordering as
    /// [`CallManager::call_history`].
    pub fn subscribe_call_history(
        &self,
        user_id: &str,
        limit: usize,
        sink: crate::store::traits::CallLogSink,
    ) -> WatchHandle {
        self.logger.subscribe_history(user_id, limit, sink)
    }
}
