//! Deterministic in-process transport.
//!
//! Produces fake SDP, raises one local candidate per local description and
//! reports `Connected` once both descriptions are applied. Like a real
//! stack it rejects remote candidates until the remote description is set.
//! Video frames are accepted only on a connected call with a video track;
//! the recorder keeps their timestamps and the last frame.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use callfx_common::{Error, IceCandidate, Result, SdpKind, SessionDescription};
use callfx_media::VideoFrame;
use tracing::debug;

use super::{
    ConnectionState, IceServer, LocalTrack, TrackKind, TransportConnection, TransportEvent,
    TransportEventSender, TransportFactory,
};

#[derive(Debug, Default)]
struct RecorderState {
    tracks: Vec<LocalTrack>,
    local: Option<SdpKind>,
    remote: Option<SessionDescription>,
    candidates: Vec<IceCandidate>,
    frame_timestamps: Vec<u64>,
    last_frame: Option<VideoFrame>,
    connected: bool,
    closed: bool,
}

/// Read-only view of one dummy connection.
#[derive(Debug)]
pub struct DummyRecorder {
    id: u64,
    generation: u64,
    state: Mutex<RecorderState>,
}

impl DummyRecorder {
    fn lock(&self) -> std::sync::MutexGuard<'_, RecorderState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn tracks(&self) -> Vec<LocalTrack> {
        self.lock().tracks.clone()
    }

    pub fn remote_description(&self) -> Option<SessionDescription> {
        self.lock().remote.clone()
    }

    /// Remote candidates accepted so far, in order.
    pub fn applied_candidates(&self) -> Vec<IceCandidate> {
        self.lock().candidates.clone()
    }

    /// Timestamps of the video frames sent so far, in order.
    pub fn frame_timestamps(&self) -> Vec<u64> {
        self.lock().frame_timestamps.clone()
    }

    pub fn last_frame(&self) -> Option<VideoFrame> {
        self.lock().last_frame.clone()
    }

    pub fn is_connected(&self) -> bool {
        self.lock().connected
    }

    pub fn is_closed(&self) -> bool {
        self.lock().closed
    }
}

#[derive(Debug, Default)]
pub struct DummyTransportFactory {
    next_id: AtomicU64,
    connections: Mutex<Vec<Arc<DummyRecorder>>>,
}

impl DummyTransportFactory {
    pub fn new() -> Self {
        Self::default()
    }

    /// Every connection created so far, oldest first.
    pub fn connections(&self) -> Vec<Arc<DummyRecorder>> {
        self.connections
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    pub fn latest(&self) -> Option<Arc<DummyRecorder>> {
        self.connections().pop()
    }
}

#[async_trait]
impl TransportFactory for DummyTransportFactory {
    async fn create(
        &self,
        ice_servers: &[IceServer],
        events: TransportEventSender,
    ) -> Result<Box<dyn TransportConnection>> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed) + 1;
        debug!(id, servers = ice_servers.len(), "creating dummy transport");
        let recorder = Arc::new(DummyRecorder {
            id,
            generation: events.generation(),
            state: Mutex::new(RecorderState::default()),
        });
        self.connections
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(recorder.clone());
        events.send(TransportEvent::ConnectionStateChanged(ConnectionState::New));
        Ok(Box::new(DummyTransport { recorder, events }))
    }
}

struct DummyTransport {
    recorder: Arc<DummyRecorder>,
    events: TransportEventSender,
}

impl DummyTransport {
    fn sdp(&self, kind: SdpKind, tracks: &[LocalTrack]) -> String {
        let mut sdp = format!(
            "v=0\r\no=callfx {} 1 IN IP4 127.0.0.1\r\ns={:?}\r\nt=0 0\r\n",
            self.recorder.id, kind
        );
        for track in tracks {
            sdp.push_str(&format!(
                "m={} 9 UDP/TLS/RTP/SAVPF 96\r\na=msid:{} {}\r\n",
                match track.kind {
                    TrackKind::Audio => "audio",
                    TrackKind::Video => "video",
                },
                track.stream_id,
                track.id
            ));
        }
        sdp
    }

    fn local_candidate(&self) -> IceCandidate {
        IceCandidate {
            candidate: format!(
                "candidate:{} 1 udp 2122260223 127.0.0.1 {} typ host",
                self.recorder.id,
                50000 + self.recorder.id
            ),
            sdp_mid: Some("0".to_string()),
            sdp_m_line_index: Some(0),
        }
    }

    fn apply_local(&self, kind: SdpKind) -> Result<String> {
        let (sdp, connected) = {
            let mut state = self.recorder.lock();
            if state.closed {
                return Err(Error::transport("connection closed"));
            }
            if kind == SdpKind::Answer
                && state.remote.as_ref().map(|r| r.kind) != Some(SdpKind::Offer)
            {
                return Err(Error::invalid_state("answer requires a remote offer"));
            }
            state.local = Some(kind);
            let sdp = self.sdp(kind, &state.tracks);
            (sdp, Self::check_connected(&mut state))
        };
        self.events
            .send(TransportEvent::LocalIceCandidate(self.local_candidate()));
        if connected {
            self.events
                .send(TransportEvent::ConnectionStateChanged(ConnectionState::Connected));
        }
        Ok(sdp)
    }

    fn check_connected(state: &mut RecorderState) -> bool {
        if state.connected || state.local.is_none() || state.remote.is_none() {
            return false;
        }
        state.connected = true;
        true
    }
}

#[async_trait]
impl TransportConnection for DummyTransport {
    async fn add_track(&self, track: LocalTrack) -> Result<()> {
        let mut state = self.recorder.lock();
        if state.closed {
            return Err(Error::transport("connection closed"));
        }
        state.tracks.push(track);
        Ok(())
    }

    async fn set_remote_description(&self, description: SessionDescription) -> Result<()> {
        if !description.sdp.starts_with("v=0") {
            return Err(Error::transport("remote description is not SDP"));
        }
        let connected = {
            let mut state = self.recorder.lock();
            if state.closed {
                return Err(Error::transport("connection closed"));
            }
            state.remote = Some(description);
            Self::check_connected(&mut state)
        };
        self.events.send(TransportEvent::RemoteStreamAdded(format!(
            "remote-{}",
            self.recorder.id
        )));
        if connected {
            self.events
                .send(TransportEvent::ConnectionStateChanged(ConnectionState::Connected));
        }
        Ok(())
    }

    async fn create_offer(&self) -> Result<String> {
        self.apply_local(SdpKind::Offer)
    }

    async fn create_answer(&self) -> Result<String> {
        self.apply_local(SdpKind::Answer)
    }

    async fn add_ice_candidate(&self, candidate: IceCandidate) -> Result<()> {
        let mut state = self.recorder.lock();
        if state.closed {
            return Err(Error::transport("connection closed"));
        }
        if state.remote.is_none() {
            return Err(Error::invalid_state(
                "remote description not set, candidate rejected",
            ));
        }
        state.candidates.push(candidate);
        Ok(())
    }

    async fn send_video_frame(&self, frame: VideoFrame) -> Result<()> {
        let mut state = self.recorder.lock();
        if state.closed || !state.connected {
            return Err(Error::transport("connection is not up"));
        }
        if !state.tracks.iter().any(|t| t.kind == TrackKind::Video) {
            return Err(Error::invalid_state("no video track"));
        }
        state.frame_timestamps.push(frame.timestamp_us);
        state.last_frame = Some(frame);
        Ok(())
    }

    async fn close(&self) -> Result<()> {
        let was_open = {
            let mut state = self.recorder.lock();
            !std::mem::replace(&mut state.closed, true)
        };
        if was_open {
            self.events
                .send(TransportEvent::ConnectionStateChanged(ConnectionState::Closed));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::TaggedTransportEvent;
    use tokio::sync::mpsc;

    async fn transport(
        factory: &DummyTransportFactory,
    ) -> (
        Box<dyn TransportConnection>,
        mpsc::UnboundedReceiver<TaggedTransportEvent>,
    ) {
        let (tx, rx) = mpsc::unbounded_channel();
        let conn = factory
            .create(&IceServer::default_servers(), TransportEventSender::new(3, tx))
            .await
            .unwrap();
        (conn, rx)
    }

    fn drain(
        rx: &mut mpsc::UnboundedReceiver<TaggedTransportEvent>,
    ) -> Vec<TransportEvent> {
        let mut out = Vec::new();
        while let Ok((generation, event)) = rx.try_recv() {
            assert_eq!(generation, 3);
            out.push(event);
        }
        out
    }

    #[tokio::test]
    async fn test_offerer_connects_after_answer() {
        let factory = DummyTransportFactory::new();
        let (conn, mut rx) = transport(&factory).await;
        conn.add_track(LocalTrack::video("v0")).await.unwrap();

        let offer = conn.create_offer().await.unwrap();
        assert!(offer.contains("m=video"));
        let events = drain(&mut rx);
        assert!(matches!(events.last(), Some(TransportEvent::LocalIceCandidate(_))));

        conn.set_remote_description(SessionDescription::answer("v=0\r\n"))
            .await
            .unwrap();
        let events = drain(&mut rx);
        assert_eq!(
            events.last(),
            Some(&TransportEvent::ConnectionStateChanged(ConnectionState::Connected))
        );
        assert!(factory.latest().unwrap().is_connected());
    }

    #[tokio::test]
    async fn test_candidates_rejected_before_remote_description() {
        let factory = DummyTransportFactory::new();
        let (conn, _rx) = transport(&factory).await;
        assert!(conn.add_ice_candidate(IceCandidate::new("candidate:a")).await.is_err());

        conn.set_remote_description(SessionDescription::offer("v=0\r\n"))
            .await
            .unwrap();
        conn.add_ice_candidate(IceCandidate::new("candidate:b"))
            .await
            .unwrap();
        assert_eq!(
            factory.latest().unwrap().applied_candidates(),
            vec![IceCandidate::new("candidate:b")]
        );
    }

    #[tokio::test]
    async fn test_answer_requires_remote_offer() {
        let factory = DummyTransportFactory::new();
        let (conn, _rx) = transport(&factory).await;
        assert!(conn.create_answer().await.is_err());
    }

    #[tokio::test]
    async fn test_video_frames_need_a_connected_video_track() {
        let factory = DummyTransportFactory::new();
        let (conn, _rx) = transport(&factory).await;
        let frame = || VideoFrame::new(7, image::RgbaImage::new(4, 4));
        conn.add_track(LocalTrack::audio("a0")).await.unwrap();
        conn.create_offer().await.unwrap();
        assert!(conn.send_video_frame(frame()).await.is_err());

        conn.set_remote_description(SessionDescription::answer("v=0\r\n"))
            .await
            .unwrap();
        // connected, but audio only
        assert!(conn.send_video_frame(frame()).await.is_err());

        let (conn, _rx) = transport(&factory).await;
        conn.add_track(LocalTrack::video("v0")).await.unwrap();
        conn.create_offer().await.unwrap();
        conn.set_remote_description(SessionDescription::answer("v=0\r\n"))
            .await
            .unwrap();
        conn.send_video_frame(frame()).await.unwrap();
        let recorder = factory.latest().unwrap();
        assert_eq!(recorder.frame_timestamps(), vec![7]);
        assert_eq!(recorder.last_frame().unwrap().resolution().width, 4);

        conn.close().await.unwrap();
        assert!(conn.send_video_frame(frame()).await.is_err());
    }

    #[tokio::test]
    async fn test_close_reports_once() {
        let factory = DummyTransportFactory::new();
        let (conn, mut rx) = transport(&factory).await;
        drain(&mut rx);
        conn.close().await.unwrap();
        conn.close().await.unwrap();
        assert_eq!(
            drain(&mut rx),
            vec![TransportEvent::ConnectionStateChanged(ConnectionState::Closed)]
        );
        assert!(conn.create_offer().await.is_err());
    }
}
