//! Call negotiation for callfx.
//!
//! A [`SessionNegotiator`] turns envelopes read from a [`SignalingChannel`]
//! into an offer/answer/ICE exchange on a [`TransportConnection`], one call
//! at a time.

#![forbid(unsafe_code)]

pub mod negotiator;
pub mod relay_client;
pub mod session;
pub mod signaling;
pub mod transport;

pub use negotiator::{
    spawn_negotiator, CallEvent, EndReason, NegotiatorConfig, NegotiatorHandle, SessionNegotiator,
};
pub use relay_client::RelaySignalingChannel;
pub use session::{CallSession, SessionState};
pub use signaling::{MemorySignalingChannel, SignalingChannel, SlotWatcher};
pub use transport::dummy::DummyTransportFactory;
pub use transport::{
    ConnectionState, IceServer, LocalTrack, TaggedTransportEvent, TrackKind, TransportConnection,
    TransportEvent, TransportEventSender, TransportFactory,
};

#[cfg(feature = "webrtc")]
pub use transport::webrtc::{VideoEncoder, WebRtcTransportFactory};
