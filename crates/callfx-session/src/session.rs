use callfx_common::{IceCandidate, ParticipantId};
use tokio::time::Instant;
use tracing::warn;

use crate::transport::TransportConnection;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SessionState {
    Idle,
    /// We called and wait for the peer to accept.
    AwaitingAccept,
    /// The peer called and waits for us to accept.
    Ringing,
    Negotiating,
    Connected,
    Closed,
}

impl SessionState {
    pub fn is_live(self) -> bool {
        !matches!(self, Self::Idle | Self::Closed)
    }
}

/// One call with one peer.
///
/// Owns its transport exclusively. A closed session is never reused; the
/// negotiator builds a new one with a fresh generation.
pub struct CallSession {
    peer: ParticipantId,
    state: SessionState,
    transport: Option<Box<dyn TransportConnection>>,
    pending_candidates: Vec<IceCandidate>,
    remote_description_applied: bool,
    generation: u64,
    negotiation_deadline: Option<Instant>,
}

impl CallSession {
    pub fn new(peer: ParticipantId, state: SessionState, generation: u64) -> Self {
        Self {
            peer,
            state,
            transport: None,
            pending_candidates: Vec::new(),
            remote_description_applied: false,
            generation,
            negotiation_deadline: None,
        }
    }

    pub fn peer(&self) -> &ParticipantId {
        &self.peer
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub(crate) fn set_state(&mut self, state: SessionState) {
        self.state = state;
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn transport(&self) -> Option<&dyn TransportConnection> {
        self.transport.as_deref()
    }

    pub fn has_transport(&self) -> bool {
        self.transport.is_some()
    }

    pub(crate) fn attach_transport(&mut self, transport: Box<dyn TransportConnection>) {
        self.transport = Some(transport);
    }

    pub fn remote_description_applied(&self) -> bool {
        self.remote_description_applied
    }

    pub(crate) fn mark_remote_description_applied(&mut self) {
        self.remote_description_applied = true;
    }

    pub fn pending_candidates(&self) -> &[IceCandidate] {
        &self.pending_candidates
    }

    pub(crate) fn buffer_candidate(&mut self, candidate: IceCandidate) {
        self.pending_candidates.push(candidate);
    }

    pub(crate) fn take_pending_candidates(&mut self) -> Vec<IceCandidate> {
        std::mem::take(&mut self.pending_candidates)
    }

    pub fn negotiation_deadline(&self) -> Option<Instant> {
        self.negotiation_deadline
    }

    pub(crate) fn set_negotiation_deadline(&mut self, deadline: Option<Instant>) {
        self.negotiation_deadline = deadline;
    }

    /// Close the transport and drop everything in flight.
    pub(crate) async fn teardown(&mut self) {
        if let Some(transport) = self.transport.take() {
            if let Err(e) = transport.close().await {
                warn!(peer = %self.peer, error = %e, "transport close failed");
            }
        }
        self.pending_candidates.clear();
        self.negotiation_deadline = None;
        self.state = SessionState::Closed;
    }
}

impl std::fmt::Debug for CallSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CallSession")
            .field("peer", &self.peer)
            .field("state", &self.state)
            .field("has_transport", &self.transport.is_some())
            .field("pending_candidates", &self.pending_candidates.len())
            .field("remote_description_applied", &self.remote_description_applied)
            .field("generation", &self.generation)
            .finish()
    }
}
