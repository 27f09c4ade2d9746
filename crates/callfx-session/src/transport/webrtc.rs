//! webrtc-rs backed transport.
//!
//! Video codecs are not part of callfx. Frames reach the wire only when the
//! factory was given a [`VideoEncoder`]; each video track then gets a writer
//! task that encodes the latest frame and writes it as a sample.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use callfx_common::{Error, IceCandidate, Result, SdpKind, SessionDescription};
use callfx_media::VideoFrame;
use tokio::sync::mpsc;
use tracing::{debug, info, trace, warn};
use webrtc::api::media_engine::{MediaEngine, MIME_TYPE_H264, MIME_TYPE_OPUS};
use webrtc::api::{APIBuilder, API};
use webrtc::ice_transport::ice_candidate::RTCIceCandidateInit;
use webrtc::ice_transport::ice_server::RTCIceServer;
use webrtc::media::Sample;
use webrtc::peer_connection::configuration::RTCConfiguration;
use webrtc::peer_connection::peer_connection_state::RTCPeerConnectionState;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;
use webrtc::peer_connection::RTCPeerConnection;
use webrtc::rtp_transceiver::rtp_codec::RTCRtpCodecCapability;
use webrtc::track::track_local::track_local_static_sample::TrackLocalStaticSample;
use webrtc::track::track_local::TrackLocal;

use super::{
    ConnectionState, IceServer, LocalTrack, TrackKind, TransportConnection, TransportEvent,
    TransportEventSender, TransportFactory,
};

/// Used for the first sample, before two timestamps are known.
const DEFAULT_FRAME_DURATION: Duration = Duration::from_millis(33);

/// Turns processed frames into samples of one negotiated codec.
pub trait VideoEncoder: Send + Sync {
    /// One of the codecs registered by `MediaEngine::register_default_codecs`.
    fn mime_type(&self) -> &'static str;

    fn encode(&self, frame: &VideoFrame) -> Result<Vec<u8>>;
}

pub struct WebRtcTransportFactory {
    api: API,
    video_encoder: Option<Arc<dyn VideoEncoder>>,
}

impl WebRtcTransportFactory {
    pub fn new() -> Result<Self> {
        let mut m = MediaEngine::default();
        m.register_default_codecs().map_err(Error::transport)?;
        let api = APIBuilder::new().with_media_engine(m).build();
        Ok(Self {
            api,
            video_encoder: None,
        })
    }

    pub fn with_video_encoder(mut self, encoder: Arc<dyn VideoEncoder>) -> Self {
        self.video_encoder = Some(encoder);
        self
    }
}

fn connection_state(state: RTCPeerConnectionState) -> Option<ConnectionState> {
    match state {
        RTCPeerConnectionState::New => Some(ConnectionState::New),
        RTCPeerConnectionState::Connecting => Some(ConnectionState::Connecting),
        RTCPeerConnectionState::Connected => Some(ConnectionState::Connected),
        RTCPeerConnectionState::Disconnected => Some(ConnectionState::Disconnected),
        RTCPeerConnectionState::Failed => Some(ConnectionState::Failed),
        RTCPeerConnectionState::Closed => Some(ConnectionState::Closed),
        _ => None,
    }
}

#[async_trait]
impl TransportFactory for WebRtcTransportFactory {
    async fn create(
        &self,
        ice_servers: &[IceServer],
        events: TransportEventSender,
    ) -> Result<Box<dyn TransportConnection>> {
        let config = RTCConfiguration {
            ice_servers: ice_servers
                .iter()
                .map(|server| RTCIceServer {
                    urls: server.urls.clone(),
                    username: server.username.clone().unwrap_or_default(),
                    credential: server.credential.clone().unwrap_or_default(),
                    ..Default::default()
                })
                .collect(),
            ..Default::default()
        };
        let pc = Arc::new(
            self.api
                .new_peer_connection(config)
                .await
                .map_err(Error::transport)?,
        );

        let candidate_events = events.clone();
        pc.on_ice_candidate(Box::new(move |c| {
            let events = candidate_events.clone();
            Box::pin(async move {
                let Some(candidate) = c else { return };
                match candidate.to_json() {
                    Ok(init) => {
                        events.send(TransportEvent::LocalIceCandidate(IceCandidate {
                            candidate: init.candidate,
                            sdp_mid: init.sdp_mid,
                            sdp_m_line_index: init.sdp_mline_index,
                        }));
                    }
                    Err(e) => warn!("Failed to serialize local ICE candidate: {}", e),
                }
            })
        }));

        let state_events = events.clone();
        pc.on_peer_connection_state_change(Box::new(move |s: RTCPeerConnectionState| {
            let events = state_events.clone();
            Box::pin(async move {
                debug!("Peer connection state changed: {}", s);
                if let Some(state) = connection_state(s) {
                    events.send(TransportEvent::ConnectionStateChanged(state));
                }
            })
        }));

        let track_events = events;
        pc.on_track(Box::new(move |track, _, _| {
            let events = track_events.clone();
            Box::pin(async move {
                info!("Remote track added: {}", track.id());
                events.send(TransportEvent::RemoteStreamAdded(track.stream_id()));
            })
        }));

        Ok(Box::new(WebRtcTransport {
            pc,
            video_encoder: self.video_encoder.clone(),
            video: Mutex::new(None),
        }))
    }
}

struct WebRtcTransport {
    pc: Arc<RTCPeerConnection>,
    video_encoder: Option<Arc<dyn VideoEncoder>>,
    /// Input of the video writer task, set once a video track is added.
    video: Mutex<Option<mpsc::Sender<VideoFrame>>>,
}

impl WebRtcTransport {
    fn video_sender(&self) -> Option<mpsc::Sender<VideoFrame>> {
        self.video
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }
}

fn sample_duration(previous_us: Option<u64>, timestamp_us: u64) -> Duration {
    match previous_us {
        Some(previous) if timestamp_us > previous => {
            Duration::from_micros(timestamp_us - previous)
        }
        _ => DEFAULT_FRAME_DURATION,
    }
}

async fn write_video(
    track: Arc<TrackLocalStaticSample>,
    encoder: Arc<dyn VideoEncoder>,
    mut frames: mpsc::Receiver<VideoFrame>,
) {
    let mut previous_us = None;
    while let Some(frame) = frames.recv().await {
        let duration = sample_duration(previous_us, frame.timestamp_us);
        previous_us = Some(frame.timestamp_us);

        let encoder = encoder.clone();
        let data = match tokio::task::spawn_blocking(move || encoder.encode(&frame)).await {
            Ok(Ok(data)) => data,
            Ok(Err(e)) => {
                debug!("Dropping frame the encoder rejected: {}", e);
                continue;
            }
            Err(e) => {
                warn!("Video encoder task failed: {}", e);
                break;
            }
        };
        let sample = Sample {
            data: data.into(),
            duration,
            ..Default::default()
        };
        if let Err(e) = track.write_sample(&sample).await {
            debug!("Failed to write video sample: {}", e);
        }
    }
    debug!("Video writer for track {} stopped", track.id());
}

#[async_trait]
impl TransportConnection for WebRtcTransport {
    async fn add_track(&self, track: LocalTrack) -> Result<()> {
        let mime_type = match (track.kind, &self.video_encoder) {
            (TrackKind::Audio, _) => MIME_TYPE_OPUS,
            (TrackKind::Video, Some(encoder)) => encoder.mime_type(),
            (TrackKind::Video, None) => MIME_TYPE_H264,
        };
        let local = Arc::new(TrackLocalStaticSample::new(
            RTCRtpCodecCapability {
                mime_type: mime_type.to_string(),
                ..Default::default()
            },
            track.id.clone(),
            track.stream_id,
        ));
        self.pc
            .add_track(local.clone() as Arc<dyn TrackLocal + Send + Sync>)
            .await
            .map_err(Error::transport)?;

        if track.kind == TrackKind::Video {
            match &self.video_encoder {
                Some(encoder) => {
                    let (tx, rx) = mpsc::channel(1);
                    tokio::spawn(write_video(local, encoder.clone(), rx));
                    *self.video.lock().unwrap_or_else(|e| e.into_inner()) = Some(tx);
                }
                None => info!(
                    "No video encoder configured, video track {} stays silent",
                    track.id
                ),
            }
        }
        Ok(())
    }

    async fn set_remote_description(&self, description: SessionDescription) -> Result<()> {
        let description = match description.kind {
            SdpKind::Offer => RTCSessionDescription::offer(description.sdp),
            SdpKind::Answer => RTCSessionDescription::answer(description.sdp),
        }
        .map_err(Error::transport)?;
        self.pc
            .set_remote_description(description)
            .await
            .map_err(Error::transport)
    }

    async fn create_offer(&self) -> Result<String> {
        let offer = self.pc.create_offer(None).await.map_err(Error::transport)?;
        self.pc
            .set_local_description(offer.clone())
            .await
            .map_err(Error::transport)?;
        Ok(offer.sdp)
    }

    async fn create_answer(&self) -> Result<String> {
        let answer = self.pc.create_answer(None).await.map_err(Error::transport)?;
        self.pc
            .set_local_description(answer.clone())
            .await
            .map_err(Error::transport)?;
        Ok(answer.sdp)
    }

    async fn add_ice_candidate(&self, candidate: IceCandidate) -> Result<()> {
        self.pc
            .add_ice_candidate(RTCIceCandidateInit {
                candidate: candidate.candidate,
                sdp_mid: candidate.sdp_mid,
                sdp_mline_index: candidate.sdp_m_line_index,
                username_fragment: None,
            })
            .await
            .map_err(Error::transport)
    }

    async fn send_video_frame(&self, frame: VideoFrame) -> Result<()> {
        let Some(video) = self.video_sender() else {
            return Err(Error::invalid_state("no encoded video track"));
        };
        if self.pc.connection_state() != RTCPeerConnectionState::Connected {
            return Err(Error::transport("peer connection is not up"));
        }
        match video.try_send(frame) {
            Ok(()) => Ok(()),
            Err(mpsc::error::TrySendError::Full(_)) => {
                trace!("Video encoder busy, dropping frame");
                Ok(())
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {
                Err(Error::transport("video writer stopped"))
            }
        }
    }

    async fn close(&self) -> Result<()> {
        self.video.lock().unwrap_or_else(|e| e.into_inner()).take();
        self.pc.close().await.map_err(Error::transport)
    }
}
