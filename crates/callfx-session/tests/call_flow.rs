//! Two negotiators talking through an in-memory channel.

use std::sync::Arc;
use std::time::Duration;

use callfx_common::config::{Effect, EnabledEffects, WatermarkLocation};
use callfx_common::{ParticipantId, SdpKind, SignalEnvelope};
use callfx_media::settings::WatermarkParams;
use callfx_media::{
    EffectsConfigHandle, EffectsSnapshot, FrameEffectsPipeline, FrameScheduler, PipelineConfig,
    UnavailableBackend, VideoFrame,
};
use callfx_session::{
    spawn_negotiator, CallEvent, DummyTransportFactory, EndReason, MemorySignalingChannel,
    NegotiatorConfig, NegotiatorHandle, SessionNegotiator, SessionState, SignalingChannel,
};
use image::{Rgba, RgbaImage};
use tokio::sync::mpsc;
use tokio::time::timeout;

struct Peer {
    handle: NegotiatorHandle,
    events: mpsc::UnboundedReceiver<CallEvent>,
    transports: Arc<DummyTransportFactory>,
}

async fn peer(name: &str, channel: &MemorySignalingChannel) -> Peer {
    let transports = Arc::new(DummyTransportFactory::new());
    let (negotiator, events) = SessionNegotiator::new(
        ParticipantId::from(name),
        Arc::new(channel.clone()),
        transports.clone(),
        NegotiatorConfig::default(),
    );
    Peer {
        handle: spawn_negotiator(negotiator).await.unwrap(),
        events,
        transports,
    }
}

async fn wait_for_event(peer: &mut Peer, wanted: impl Fn(&CallEvent) -> bool) -> CallEvent {
    timeout(Duration::from_secs(5), async {
        loop {
            let event = peer.events.recv().await.expect("negotiator stopped");
            if wanted(&event) {
                return event;
            }
        }
    })
    .await
    .expect("timed out waiting for call event")
}

async fn wait_connected(peer: &Peer) {
    timeout(
        Duration::from_secs(5),
        peer.handle.wait_for_state(SessionState::Connected),
    )
    .await
    .expect("timed out waiting for connection")
    .unwrap();
}

#[tokio::test]
async fn test_two_peers_connect() {
    let channel = MemorySignalingChannel::new();
    let mut alice = peer("alice", &channel).await;
    let mut bob = peer("bob", &channel).await;

    alice.handle.start_call("bob").await.unwrap();
    let ringing = wait_for_event(&mut bob, |e| matches!(e, CallEvent::Incoming { .. })).await;
    assert_eq!(
        ringing,
        CallEvent::Incoming {
            peer: ParticipantId::from("alice")
        }
    );
    bob.handle.accept().await.unwrap();

    wait_connected(&alice).await;
    wait_connected(&bob).await;

    let bob_side = bob.transports.latest().unwrap();
    assert_eq!(
        bob_side.remote_description().map(|d| d.kind),
        Some(SdpKind::Offer)
    );
    let alice_side = alice.transports.latest().unwrap();
    assert_eq!(
        alice_side.remote_description().map(|d| d.kind),
        Some(SdpKind::Answer)
    );

    // the offerer's trickled candidate reaches the answerer
    timeout(Duration::from_secs(5), async {
        while bob_side.applied_candidates().is_empty() {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .unwrap();

    alice.handle.shutdown().await;
    bob.handle.shutdown().await;
}

#[tokio::test]
async fn test_simultaneous_calls_settle_on_one_session() {
    let channel = MemorySignalingChannel::new();
    let alice = peer("alice", &channel).await;
    let bob = peer("bob", &channel).await;

    let (a, b) = tokio::join!(
        alice.handle.start_call("bob"),
        bob.handle.start_call("alice")
    );
    a.unwrap();
    b.unwrap();

    wait_connected(&alice).await;
    wait_connected(&bob).await;

    assert_eq!(alice.transports.connections().len(), 1);
    assert_eq!(bob.transports.connections().len(), 1);
    let alice_remote = alice.transports.latest().unwrap().remote_description();
    let bob_remote = bob.transports.latest().unwrap().remote_description();
    assert_ne!(
        alice_remote.map(|d| d.kind),
        bob_remote.map(|d| d.kind),
        "exactly one side offers"
    );
}

#[tokio::test]
async fn test_hang_up_reports_local_end() {
    let channel = MemorySignalingChannel::new();
    let mut alice = peer("alice", &channel).await;
    let bob = peer("bob", &channel).await;

    alice.handle.start_call("bob").await.unwrap();
    bob.handle.wait_for_state(SessionState::Ringing).await.unwrap();
    bob.handle.accept().await.unwrap();
    wait_connected(&alice).await;

    alice.handle.hang_up().await.unwrap();
    let ended = wait_for_event(&mut alice, |e| matches!(e, CallEvent::Ended { .. })).await;
    assert_eq!(
        ended,
        CallEvent::Ended {
            peer: ParticipantId::from("bob"),
            reason: EndReason::LocalHangup,
        }
    );
    assert_eq!(alice.handle.state(), SessionState::Closed);
    assert!(alice.transports.latest().unwrap().is_closed());
}

#[tokio::test(start_paused = true)]
async fn test_unanswered_negotiation_times_out() {
    let channel = MemorySignalingChannel::new();
    let mut bob = peer("bob", &channel).await;

    // a caller that never follows up with an offer
    channel
        .write(
            &ParticipantId::from("bob"),
            &SignalEnvelope::incoming_call(ParticipantId::from("ghost")),
        )
        .await
        .unwrap();
    wait_for_event(&mut bob, |e| matches!(e, CallEvent::Incoming { .. })).await;

    let started = tokio::time::Instant::now();
    bob.handle.accept().await.unwrap();
    // no real-time timeout here: the paused clock jumps straight to the deadline
    let ended = loop {
        match bob.events.recv().await {
            Some(event @ CallEvent::Ended { .. }) => break event,
            Some(_) => continue,
            None => panic!("negotiator stopped"),
        }
    };
    assert_eq!(
        ended,
        CallEvent::Ended {
            peer: ParticipantId::from("ghost"),
            reason: EndReason::NegotiationTimeout,
        }
    );
    assert!(started.elapsed() >= Duration::from_secs(30));
    assert_eq!(bob.handle.state(), SessionState::Closed);
}

#[tokio::test]
async fn test_shutdown_hangs_up_live_call() {
    let channel = MemorySignalingChannel::new();
    let alice = peer("alice", &channel).await;
    let bob = peer("bob", &channel).await;

    alice.handle.start_call("bob").await.unwrap();
    bob.handle.wait_for_state(SessionState::Ringing).await.unwrap();
    alice.handle.shutdown().await;

    // the caller went away without a hangup signal, so bob keeps ringing
    assert_eq!(bob.handle.state(), SessionState::Ringing);
    bob.handle.hang_up().await.unwrap();
    bob.handle.wait_for_state(SessionState::Closed).await.unwrap();
}

#[tokio::test]
async fn test_processed_frames_reach_the_connected_transport() {
    let channel = MemorySignalingChannel::new();
    let alice = peer("alice", &channel).await;
    let bob = peer("bob", &channel).await;

    alice.handle.start_call("bob").await.unwrap();
    bob.handle.wait_for_state(SessionState::Ringing).await.unwrap();
    bob.handle.accept().await.unwrap();
    wait_connected(&alice).await;

    let mut enabled = EnabledEffects::default();
    enabled.set(Effect::Watermark, true);
    let mut snapshot = EffectsSnapshot::with_enabled(enabled);
    snapshot.watermark = Some(WatermarkParams {
        image: Arc::new(RgbaImage::from_pixel(8, 8, Rgba([255, 0, 0, 255]))),
        location: WatermarkLocation::TopLeft,
        margin_px: 0.0,
        size_fraction: 0.5,
    });
    let pipeline = Arc::new(FrameEffectsPipeline::new(
        Arc::new(UnavailableBackend),
        &PipelineConfig::default(),
    ));
    let submitter = FrameScheduler::spawn(
        pipeline,
        EffectsConfigHandle::new(snapshot),
        alice.handle.video_sink(),
    );

    let black = RgbaImage::from_pixel(64, 48, Rgba([0, 0, 0, 255]));
    assert!(submitter.submit(VideoFrame::new(1_000, black)));

    let alice_side = alice.transports.latest().unwrap();
    let sent = timeout(Duration::from_secs(5), async {
        loop {
            if let Some(frame) = alice_side.last_frame() {
                return frame;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("frame never reached the transport");

    assert_eq!(sent.timestamp_us, 1_000);
    assert_eq!((sent.image.width(), sent.image.height()), (64, 48));
    assert_eq!(sent.image.get_pixel(2, 2), &Rgba([255, 0, 0, 255]));
    assert_eq!(sent.image.get_pixel(60, 40), &Rgba([0, 0, 0, 255]));
    // the callee never offered video frames of its own
    assert!(bob.transports.latest().unwrap().frame_timestamps().is_empty());

    submitter.shutdown().await;
    alice.handle.shutdown().await;
    bob.handle.shutdown().await;
}
