//! Peer transport seam.
//!
//! The negotiator only needs descriptions, candidates and connection state
//! from a peer connection. Processed video frames enter through
//! [`TransportConnection::send_video_frame`]; encoding and packetizing them
//! stays inside the implementation.

pub mod dummy;
#[cfg(feature = "webrtc")]
pub mod webrtc;

use async_trait::async_trait;
use callfx_common::{IceCandidate, Result, SessionDescription};
use callfx_media::VideoFrame;
use tokio::sync::mpsc;

pub const DEFAULT_STUN_SERVER: &str = "stun:stun.l.google.com:19302";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IceServer {
    pub urls: Vec<String>,
    pub username: Option<String>,
    pub credential: Option<String>,
}

impl IceServer {
    pub fn stun(url: impl Into<String>) -> Self {
        Self {
            urls: vec![url.into()],
            username: None,
            credential: None,
        }
    }

    pub fn default_servers() -> Vec<IceServer> {
        vec![Self::stun(DEFAULT_STUN_SERVER)]
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ConnectionState {
    New,
    Connecting,
    Connected,
    Disconnected,
    Failed,
    Closed,
}

impl ConnectionState {
    /// The connection cannot recover from this state.
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Failed | Self::Closed)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportEvent {
    LocalIceCandidate(IceCandidate),
    RemoteStreamAdded(String),
    ConnectionStateChanged(ConnectionState),
}

/// Event paired with the generation of the session whose transport raised it.
pub type TaggedTransportEvent = (u64, TransportEvent);

/// Sending half handed to a transport; every event carries the generation of
/// the session that created it.
#[derive(Debug, Clone)]
pub struct TransportEventSender {
    generation: u64,
    tx: mpsc::UnboundedSender<TaggedTransportEvent>,
}

impl TransportEventSender {
    pub fn new(generation: u64, tx: mpsc::UnboundedSender<TaggedTransportEvent>) -> Self {
        Self { generation, tx }
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    /// Returns `false` once nobody listens anymore.
    pub fn send(&self, event: TransportEvent) -> bool {
        self.tx.send((self.generation, event)).is_ok()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TrackKind {
    Audio,
    Video,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LocalTrack {
    pub id: String,
    pub stream_id: String,
    pub kind: TrackKind,
}

impl LocalTrack {
    pub fn audio(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            stream_id: "callfx".to_string(),
            kind: TrackKind::Audio,
        }
    }

    pub fn video(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            stream_id: "callfx".to_string(),
            kind: TrackKind::Video,
        }
    }
}

#[async_trait]
pub trait TransportConnection: Send + Sync {
    async fn add_track(&self, track: LocalTrack) -> Result<()>;

    async fn set_remote_description(&self, description: SessionDescription) -> Result<()>;

    /// Generate an offer and apply it as the local description.
    async fn create_offer(&self) -> Result<String>;

    /// Generate an answer to the applied remote offer and apply it locally.
    async fn create_answer(&self) -> Result<String>;

    async fn add_ice_candidate(&self, candidate: IceCandidate) -> Result<()>;

    /// Hand one processed frame to the outgoing video track. Fails when no
    /// video track was added or the connection is not up.
    async fn send_video_frame(&self, frame: VideoFrame) -> Result<()>;

    async fn close(&self) -> Result<()>;
}

#[async_trait]
pub trait TransportFactory: Send + Sync {
    async fn create(
        &self,
        ice_servers: &[IceServer],
        events: TransportEventSender,
    ) -> Result<Box<dyn TransportConnection>>;
}
