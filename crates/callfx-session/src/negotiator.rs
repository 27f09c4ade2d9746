//! Offer/answer/ICE state machine.
//!
//! ```text
//! Idle ──start_call──▶ AwaitingAccept ──AcceptCall──▶ Negotiating ──Connected──▶ Connected
//!   └──IncomingCall──▶ Ringing ──accept──────────────▶ Negotiating
//! any live state ──hang_up / failure / timeout──▶ Closed
//! ```
//!
//! When both sides call each other at once, the participant with the
//! lexicographically smaller id stays the caller and makes the offer; the
//! other one accepts. Remote ICE candidates received before the remote
//! description are buffered and applied in arrival order once it is set.
//!
//! Processed video frames sent to [`NegotiatorHandle::video_sink`] go to the
//! transport of the connected call and are dropped otherwise.

use std::sync::Arc;
use std::time::Duration;

use callfx_common::{
    Error, IceCandidate, ParticipantId, Result, SessionDescription, SignalEnvelope, SignalKind,
};
use callfx_media::VideoFrame;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, info, trace, warn};

use crate::session::{CallSession, SessionState};
use crate::signaling::{SignalingChannel, SlotWatcher};
use crate::transport::{
    ConnectionState, IceServer, LocalTrack, TaggedTransportEvent, TransportConnection,
    TransportEvent, TransportEventSender, TransportFactory,
};

pub const DEFAULT_NEGOTIATION_TIMEOUT: Duration = Duration::from_secs(30);

/// Frames waiting between the scheduler and the negotiator task.
const VIDEO_QUEUE_DEPTH: usize = 2;

#[derive(Debug, Clone)]
pub struct NegotiatorConfig {
    /// How long a session may stay in `Negotiating` before it is torn down.
    pub negotiation_timeout: Duration,
    pub ice_servers: Vec<IceServer>,
    /// Tracks added to every new transport.
    pub tracks: Vec<LocalTrack>,
}

impl Default for NegotiatorConfig {
    fn default() -> Self {
        Self {
            negotiation_timeout: DEFAULT_NEGOTIATION_TIMEOUT,
            ice_servers: IceServer::default_servers(),
            tracks: vec![LocalTrack::audio("audio0"), LocalTrack::video("video0")],
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EndReason {
    LocalHangup,
    TransportFailed,
    NegotiationTimeout,
    /// A newer call took the session's place.
    Superseded,
}

/// Notifications for whoever drives the call UI.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CallEvent {
    Outgoing { peer: ParticipantId },
    Incoming { peer: ParticipantId },
    Negotiating { peer: ParticipantId },
    Connected { peer: ParticipantId },
    RemoteStream { peer: ParticipantId, stream_id: String },
    Ended { peer: ParticipantId, reason: EndReason },
}

pub struct SessionNegotiator {
    local_id: ParticipantId,
    channel: Arc<dyn SignalingChannel>,
    transports: Arc<dyn TransportFactory>,
    config: NegotiatorConfig,
    session: Option<CallSession>,
    next_generation: u64,
    transport_tx: mpsc::UnboundedSender<TaggedTransportEvent>,
    transport_rx: mpsc::UnboundedReceiver<TaggedTransportEvent>,
    events: mpsc::UnboundedSender<CallEvent>,
    state_tx: watch::Sender<SessionState>,
}

impl SessionNegotiator {
    pub fn new(
        local_id: ParticipantId,
        channel: Arc<dyn SignalingChannel>,
        transports: Arc<dyn TransportFactory>,
        config: NegotiatorConfig,
    ) -> (Self, mpsc::UnboundedReceiver<CallEvent>) {
        let (transport_tx, transport_rx) = mpsc::unbounded_channel();
        let (events, events_rx) = mpsc::unbounded_channel();
        let (state_tx, _) = watch::channel(SessionState::Idle);
        let negotiator = Self {
            local_id,
            channel,
            transports,
            config,
            session: None,
            next_generation: 0,
            transport_tx,
            transport_rx,
            events,
            state_tx,
        };
        (negotiator, events_rx)
    }

    pub fn local_id(&self) -> &ParticipantId {
        &self.local_id
    }

    pub fn state(&self) -> SessionState {
        self.session
            .as_ref()
            .map_or(SessionState::Idle, |session| session.state())
    }

    pub fn session(&self) -> Option<&CallSession> {
        self.session.as_ref()
    }

    pub fn subscribe_state(&self) -> watch::Receiver<SessionState> {
        self.state_tx.subscribe()
    }

    /// Deadline of the current negotiation, if one is running.
    pub fn negotiation_deadline(&self) -> Option<Instant> {
        self.session
            .as_ref()
            .filter(|session| session.state() == SessionState::Negotiating)
            .and_then(|session| session.negotiation_deadline())
    }

    /// Call `peer`, ending any call in progress first.
    pub async fn start_call(&mut self, peer: ParticipantId) {
        if peer.is_empty() || peer == self.local_id {
            warn!(peer = %peer, "refusing to call this participant");
            return;
        }
        if self.peer_in(SessionState::Ringing).as_ref() == Some(&peer) {
            info!(peer = %peer, "peer is already calling us, accepting");
            self.accept().await;
            return;
        }
        self.end_session(EndReason::Superseded).await;

        info!(peer = %peer, "starting call");
        self.begin_session(peer.clone(), SessionState::AwaitingAccept);
        self.send(&peer, SignalEnvelope::incoming_call(self.local_id.clone()))
            .await;
        self.emit(CallEvent::Outgoing { peer });
    }

    /// Accept the ringing call. The caller makes the offer; we only answer.
    pub async fn accept(&mut self) {
        let Some(peer) = self.peer_in(SessionState::Ringing) else {
            warn!(state = ?self.state(), "no ringing call to accept");
            return;
        };
        if let Err(e) = self.ensure_transport().await {
            self.fail(e).await;
            return;
        }
        self.send(&peer, SignalEnvelope::accept_call(self.local_id.clone()))
            .await;
        self.enter_negotiating();
    }

    pub async fn hang_up(&mut self) {
        if !self.state().is_live() {
            debug!("no call to hang up");
            self.clear_own_slot().await;
            return;
        }
        self.end_session(EndReason::LocalHangup).await;
    }

    pub async fn handle_signal(&mut self, envelope: SignalEnvelope) {
        let sender = envelope.participant_id.clone();
        if sender == self.local_id {
            debug!("ignoring envelope sent by ourselves");
            return;
        }
        debug!(peer = %sender, kind = ?envelope.kind, state = ?self.state(), "signal received");

        match envelope.kind {
            SignalKind::IncomingCall => self.on_incoming_call(sender).await,
            SignalKind::AcceptCall => self.on_accept_call(sender).await,
            SignalKind::Offer => match envelope.sdp().map(str::to_owned) {
                Ok(sdp) => self.on_offer(sender, sdp).await,
                Err(e) => warn!(peer = %sender, error = %e, "dropping malformed offer"),
            },
            SignalKind::Answer => match envelope.sdp().map(str::to_owned) {
                Ok(sdp) => self.on_answer(sender, sdp).await,
                Err(e) => warn!(peer = %sender, error = %e, "dropping malformed answer"),
            },
            SignalKind::Ice => match envelope.ice_candidate() {
                Ok(candidate) => self.on_ice(sender, candidate).await,
                Err(e) => warn!(peer = %sender, error = %e, "dropping malformed ICE candidate"),
            },
        }
    }

    pub async fn handle_transport_event(&mut self, generation: u64, event: TransportEvent) {
        let Some(session) = self.session.as_ref() else {
            return;
        };
        if session.generation() != generation || !session.has_transport() {
            debug!(generation, current = session.generation(), ?event, "ignoring stale transport event");
            return;
        }
        let peer = session.peer().clone();

        match event {
            TransportEvent::LocalIceCandidate(candidate) => {
                match SignalEnvelope::ice(self.local_id.clone(), &candidate) {
                    Ok(envelope) => self.send(&peer, envelope).await,
                    Err(e) => warn!(peer = %peer, error = %e, "failed to encode local candidate"),
                }
            }
            TransportEvent::RemoteStreamAdded(stream_id) => {
                info!(peer = %peer, stream_id = %stream_id, "remote stream added");
                self.emit(CallEvent::RemoteStream { peer, stream_id });
            }
            TransportEvent::ConnectionStateChanged(ConnectionState::Connected) => {
                if self.state() == SessionState::Connected {
                    return;
                }
                if let Some(session) = self.session.as_mut() {
                    session.set_state(SessionState::Connected);
                    session.set_negotiation_deadline(None);
                }
                self.publish_state();
                self.clear_own_slot().await;
                info!(peer = %peer, "call connected");
                self.emit(CallEvent::Connected { peer });
            }
            TransportEvent::ConnectionStateChanged(state) if state.is_terminal() => {
                warn!(peer = %peer, ?state, "transport went down");
                self.end_session(EndReason::TransportFailed).await;
            }
            TransportEvent::ConnectionStateChanged(state) => {
                debug!(peer = %peer, ?state, "transport state changed");
            }
        }
    }

    /// Handle every transport event queued so far. Returns how many ran.
    /// Hand a processed frame to the transport of the connected call.
    /// Returns whether the transport took it.
    pub async fn send_video_frame(&self, frame: VideoFrame) -> bool {
        let Some(session) = self
            .session
            .as_ref()
            .filter(|session| session.state() == SessionState::Connected)
        else {
            trace!(timestamp_us = frame.timestamp_us, "no connected call, dropping frame");
            return false;
        };
        let Some(transport) = session.transport() else {
            return false;
        };
        match transport.send_video_frame(frame).await {
            Ok(()) => true,
            Err(e) => {
                debug!(peer = %session.peer(), error = %e, "transport refused video frame");
                false
            }
        }
    }

    pub async fn process_transport_events(&mut self) -> usize {
        let mut handled = 0;
        while let Ok((generation, event)) = self.transport_rx.try_recv() {
            self.handle_transport_event(generation, event).await;
            handled += 1;
        }
        handled
    }

    /// Tear the session down if its negotiation deadline has passed.
    pub async fn expire_negotiation(&mut self) {
        match self.negotiation_deadline() {
            Some(deadline) if deadline <= Instant::now() => {
                warn!(peer = ?self.session.as_ref().map(|s| s.peer().clone()), "negotiation timed out");
                self.end_session(EndReason::NegotiationTimeout).await;
            }
            _ => {}
        }
    }

    async fn on_incoming_call(&mut self, sender: ParticipantId) {
        let current = self
            .session
            .as_ref()
            .filter(|session| session.state().is_live())
            .map(|session| (session.state(), session.peer() == &sender));

        match current {
            None => {
                info!(peer = %sender, "incoming call");
                self.begin_session(sender.clone(), SessionState::Ringing);
                self.emit(CallEvent::Incoming { peer: sender });
            }
            Some((SessionState::AwaitingAccept, true)) => {
                if self.local_id < sender {
                    info!(peer = %sender, "call glare, keeping the caller role");
                } else {
                    info!(peer = %sender, "call glare, yielding to peer");
                    self.set_state(SessionState::Ringing);
                    self.accept().await;
                }
            }
            Some((state, true)) => debug!(peer = %sender, ?state, "duplicate incoming call"),
            Some((state, false)) => {
                debug!(peer = %sender, ?state, "busy, ignoring incoming call");
            }
        }
    }

    async fn on_accept_call(&mut self, sender: ParticipantId) {
        if self.peer_in(SessionState::AwaitingAccept).as_ref() != Some(&sender) {
            debug!(peer = %sender, state = ?self.state(), "ignoring unexpected accept");
            return;
        }
        if let Err(e) = self.ensure_transport().await {
            self.fail(e).await;
            return;
        }
        let offer = match self.transport() {
            Some(transport) => transport.create_offer().await,
            None => Err(Error::invalid_state("no transport")),
        };
        match offer {
            Ok(sdp) => {
                self.send(&sender, SignalEnvelope::offer(self.local_id.clone(), sdp))
                    .await;
                self.enter_negotiating();
            }
            Err(e) => self.fail(e).await,
        }
    }

    async fn on_offer(&mut self, sender: ParticipantId, sdp: String) {
        if self.state() == SessionState::Connected {
            debug!(peer = %sender, "ignoring offer while connected");
            return;
        }
        if !self.is_live_peer(&sender) {
            self.end_session(EndReason::Superseded).await;
            info!(peer = %sender, "offer from new peer");
            self.begin_session(sender.clone(), SessionState::Negotiating);
        }
        if let Err(e) = self.ensure_transport().await {
            self.fail(e).await;
            return;
        }
        self.enter_negotiating();

        let applied = match self.transport() {
            Some(transport) => {
                transport
                    .set_remote_description(SessionDescription::offer(sdp))
                    .await
            }
            None => Err(Error::invalid_state("no transport")),
        };
        if let Err(e) = applied {
            warn!(peer = %sender, error = %e, "dropping offer the transport rejected");
            return;
        }
        self.on_remote_description_applied().await;

        let answer = match self.transport() {
            Some(transport) => transport.create_answer().await,
            None => Err(Error::invalid_state("no transport")),
        };
        match answer {
            Ok(sdp) => {
                self.send(&sender, SignalEnvelope::answer(self.local_id.clone(), sdp))
                    .await;
            }
            Err(e) => self.fail(e).await,
        }
    }

    async fn on_answer(&mut self, sender: ParticipantId, sdp: String) {
        let expected = self
            .session
            .as_ref()
            .filter(|s| s.state() == SessionState::Negotiating && s.peer() == &sender);
        match expected {
            None => {
                debug!(peer = %sender, state = ?self.state(), "ignoring unexpected answer");
                return;
            }
            Some(session) if session.remote_description_applied() => {
                debug!(peer = %sender, "ignoring duplicate answer");
                return;
            }
            Some(_) => {}
        }

        let applied = match self.transport() {
            Some(transport) => {
                transport
                    .set_remote_description(SessionDescription::answer(sdp))
                    .await
            }
            None => Err(Error::invalid_state("no transport")),
        };
        match applied {
            Ok(()) => self.on_remote_description_applied().await,
            Err(e) => warn!(peer = %sender, error = %e, "dropping answer the transport rejected"),
        }
    }

    async fn on_ice(&mut self, sender: ParticipantId, candidate: IceCandidate) {
        let Some(session) = self
            .session
            .as_mut()
            .filter(|s| s.state().is_live() && s.peer() == &sender)
        else {
            debug!(peer = %sender, "ignoring candidate without a matching call");
            return;
        };

        if !session.has_transport() || !session.remote_description_applied() {
            session.buffer_candidate(candidate);
            debug!(peer = %sender, pending = session.pending_candidates().len(), "buffered remote candidate");
            return;
        }
        if let Some(transport) = session.transport() {
            if let Err(e) = transport.add_ice_candidate(candidate).await {
                warn!(peer = %sender, error = %e, "transport rejected candidate");
            }
        }
    }

    /// Mark the remote description as set and apply buffered candidates.
    async fn on_remote_description_applied(&mut self) {
        let Some(session) = self.session.as_mut() else {
            return;
        };
        session.mark_remote_description_applied();
        let pending = session.take_pending_candidates();
        if pending.is_empty() {
            return;
        }
        debug!(peer = %session.peer(), count = pending.len(), "flushing buffered candidates");
        let Some(transport) = session.transport() else {
            return;
        };
        for candidate in pending {
            if let Err(e) = transport.add_ice_candidate(candidate).await {
                warn!(peer = %session.peer(), error = %e, "transport rejected buffered candidate");
            }
        }
    }

    async fn ensure_transport(&mut self) -> Result<()> {
        let Some(session) = self.session.as_mut() else {
            return Err(Error::invalid_state("no call in progress"));
        };
        if session.has_transport() {
            return Ok(());
        }
        let events = TransportEventSender::new(session.generation(), self.transport_tx.clone());
        let transport = self
            .transports
            .create(&self.config.ice_servers, events)
            .await?;
        for track in &self.config.tracks {
            if let Err(e) = transport.add_track(track.clone()).await {
                let _ = transport.close().await;
                return Err(e);
            }
        }
        debug!(peer = %session.peer(), generation = session.generation(), "transport created");
        session.attach_transport(transport);
        Ok(())
    }

    fn transport(&self) -> Option<&dyn TransportConnection> {
        self.session.as_ref()?.transport()
    }

    fn peer_in(&self, state: SessionState) -> Option<ParticipantId> {
        self.session
            .as_ref()
            .filter(|session| session.state() == state)
            .map(|session| session.peer().clone())
    }

    fn is_live_peer(&self, peer: &ParticipantId) -> bool {
        self.session
            .as_ref()
            .is_some_and(|session| session.state().is_live() && session.peer() == peer)
    }

    fn begin_session(&mut self, peer: ParticipantId, state: SessionState) {
        self.next_generation += 1;
        self.session = Some(CallSession::new(peer, state, self.next_generation));
        self.publish_state();
    }

    fn set_state(&mut self, state: SessionState) {
        if let Some(session) = self.session.as_mut() {
            session.set_state(state);
        }
        self.publish_state();
    }

    fn enter_negotiating(&mut self) {
        let deadline = Instant::now() + self.config.negotiation_timeout;
        let Some(session) = self.session.as_mut() else {
            return;
        };
        let entering = session.negotiation_deadline().is_none();
        session.set_state(SessionState::Negotiating);
        if entering {
            session.set_negotiation_deadline(Some(deadline));
        }
        let peer = session.peer().clone();
        self.publish_state();
        if entering {
            self.emit(CallEvent::Negotiating { peer });
        }
    }

    async fn end_session(&mut self, reason: EndReason) {
        let Some(session) = self.session.as_mut() else {
            return;
        };
        if !session.state().is_live() {
            return;
        }
        session.teardown().await;
        let peer = session.peer().clone();
        self.clear_own_slot().await;
        info!(peer = %peer, ?reason, "call ended");
        self.publish_state();
        self.emit(CallEvent::Ended { peer, reason });
    }

    async fn fail(&mut self, error: Error) {
        warn!(error = %error, "transport setup failed");
        self.end_session(EndReason::TransportFailed).await;
    }

    async fn send(&self, target: &ParticipantId, envelope: SignalEnvelope) {
        if let Err(e) = self.channel.write(target, &envelope).await {
            warn!(peer = %target, kind = ?envelope.kind, error = %e, "signaling write failed");
        }
    }

    async fn clear_own_slot(&self) {
        if let Err(e) = self.channel.clear(&self.local_id).await {
            warn!(error = %e, "failed to clear own signaling slot");
        }
    }

    fn publish_state(&self) {
        self.state_tx.send_replace(self.state());
    }

    fn emit(&self, event: CallEvent) {
        let _ = self.events.send(event);
    }
}

enum Command {
    StartCall(ParticipantId),
    Accept,
    HangUp,
    Shutdown,
}

/// Handle to a negotiator running on its own task.
pub struct NegotiatorHandle {
    local_id: ParticipantId,
    commands: mpsc::Sender<Command>,
    video: mpsc::Sender<VideoFrame>,
    state: watch::Receiver<SessionState>,
    task: JoinHandle<()>,
}

impl NegotiatorHandle {
    pub fn local_id(&self) -> &ParticipantId {
        &self.local_id
    }

    pub async fn start_call(&self, peer: impl Into<ParticipantId>) -> Result<()> {
        self.command(Command::StartCall(peer.into())).await
    }

    pub async fn accept(&self) -> Result<()> {
        self.command(Command::Accept).await
    }

    pub async fn hang_up(&self) -> Result<()> {
        self.command(Command::HangUp).await
    }

    /// Where processed frames for the outgoing video track go, for example
    /// the sink of a `FrameScheduler`.
    pub fn video_sink(&self) -> mpsc::Sender<VideoFrame> {
        self.video.clone()
    }

    pub fn state(&self) -> SessionState {
        *self.state.borrow()
    }

    pub fn subscribe_state(&self) -> watch::Receiver<SessionState> {
        self.state.clone()
    }

    pub async fn wait_for_state(&self, target: SessionState) -> Result<()> {
        let mut state = self.state.clone();
        state
            .wait_for(|current| *current == target)
            .await
            .map(|_| ())
            .map_err(|_| Error::invalid_state("negotiator stopped"))
    }

    /// Hang up any call and stop the task.
    pub async fn shutdown(self) {
        let _ = self.commands.send(Command::Shutdown).await;
        let _ = self.task.await;
    }

    async fn command(&self, command: Command) -> Result<()> {
        self.commands
            .send(command)
            .await
            .map_err(|_| Error::invalid_state("negotiator stopped"))
    }
}

/// Observe the negotiator's own slot and drive it on a new task.
pub async fn spawn_negotiator(negotiator: SessionNegotiator) -> Result<NegotiatorHandle> {
    let watcher = negotiator.channel.observe(&negotiator.local_id).await?;
    let (commands, rx) = mpsc::channel(16);
    let (video, video_rx) = mpsc::channel(VIDEO_QUEUE_DEPTH);
    let handle = NegotiatorHandle {
        local_id: negotiator.local_id.clone(),
        commands,
        video,
        state: negotiator.subscribe_state(),
        task: tokio::spawn(run(negotiator, watcher, rx, video_rx)),
    };
    Ok(handle)
}

async fn run(
    mut negotiator: SessionNegotiator,
    mut watcher: SlotWatcher,
    mut commands: mpsc::Receiver<Command>,
    mut video: mpsc::Receiver<VideoFrame>,
) {
    info!(id = %negotiator.local_id, "negotiator started");
    loop {
        let deadline = negotiator.negotiation_deadline();
        tokio::select! {
            command = commands.recv() => match command {
                Some(Command::StartCall(peer)) => negotiator.start_call(peer).await,
                Some(Command::Accept) => negotiator.accept().await,
                Some(Command::HangUp) => negotiator.hang_up().await,
                Some(Command::Shutdown) | None => break,
            },
            envelope = watcher.next() => match envelope {
                Some(envelope) => negotiator.handle_signal(envelope).await,
                None => {
                    warn!("signaling channel closed");
                    break;
                }
            },
            Some((generation, event)) = negotiator.transport_rx.recv() => {
                negotiator.handle_transport_event(generation, event).await;
            }
            Some(frame) = video.recv() => {
                negotiator.send_video_frame(frame).await;
            }
            _ = tokio::time::sleep_until(deadline.unwrap_or_else(Instant::now)), if deadline.is_some() => {
                negotiator.expire_negotiation().await;
            }
        }
    }
    negotiator.hang_up().await;
    info!(id = %negotiator.local_id, "negotiator stopped");
}
