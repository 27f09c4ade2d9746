//! Latest-frame-wins scheduling.

use std::sync::Arc;
use std::time::Duration;

use callfx_common::config::{Effect, EnabledEffects};
use callfx_media::{
    EffectsConfigHandle, EffectsSnapshot, FrameEffectsPipeline, FrameScheduler, PipelineConfig,
    StaticBackend, UnavailableBackend, VideoFrame,
};
use image::RgbaImage;
use tokio::sync::mpsc;
use tokio::time::timeout;

fn frame(ts: u64) -> VideoFrame {
    VideoFrame::new(ts, RgbaImage::new(8, 8))
}

fn passthrough_pipeline() -> Arc<FrameEffectsPipeline> {
    Arc::new(FrameEffectsPipeline::new(
        Arc::new(UnavailableBackend),
        &PipelineConfig::default(),
    ))
}

async fn recv(rx: &mut mpsc::Receiver<VideoFrame>) -> Option<VideoFrame> {
    timeout(Duration::from_secs(5), rx.recv()).await.ok().flatten()
}

#[tokio::test]
async fn test_burst_keeps_only_latest_frame() {
    let (tx, mut rx) = mpsc::channel(4);
    let submitter = FrameScheduler::spawn(passthrough_pipeline(), EffectsConfigHandle::default(), tx);

    // the worker cannot run until this task yields
    for ts in 1..=5 {
        assert!(submitter.submit(frame(ts)));
    }
    let delivered = recv(&mut rx).await.unwrap();
    assert_eq!(delivered.timestamp_us, 5);

    let stats = submitter.stats();
    assert_eq!(stats.submitted(), 5);
    assert_eq!(stats.dropped(), 4);
    assert_eq!(stats.processed(), 1);
}

#[tokio::test]
async fn test_stale_frames_are_never_delivered() {
    let (tx, mut rx) = mpsc::channel(4);
    let submitter = FrameScheduler::spawn(passthrough_pipeline(), EffectsConfigHandle::default(), tx);

    submitter.submit(frame(10));
    assert_eq!(recv(&mut rx).await.unwrap().timestamp_us, 10);

    submitter.submit(frame(10));
    tokio::task::yield_now().await;
    submitter.submit(frame(3));
    tokio::task::yield_now().await;
    submitter.submit(frame(11));
    assert_eq!(recv(&mut rx).await.unwrap().timestamp_us, 11);
    assert_eq!(submitter.stats().dropped(), 2);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_delivery_is_monotonic_under_slow_inference() {
    let backend = StaticBackend {
        latency: Some(Duration::from_millis(3)),
        ..Default::default()
    };
    let pipeline = Arc::new(FrameEffectsPipeline::new(
        Arc::new(backend),
        &PipelineConfig::default(),
    ));
    let mut enabled = EnabledEffects::default();
    enabled.set(Effect::FaceOval, true);
    let config = EffectsConfigHandle::new(EffectsSnapshot::with_enabled(enabled));

    let (tx, mut rx) = mpsc::channel(64);
    let submitter = FrameScheduler::spawn(pipeline, config, tx);
    let producer = tokio::spawn(async move {
        // mostly increasing, with some late arrivals
        let order = [1u64, 2, 4, 3, 5, 9, 6, 7, 8, 12, 10, 11, 13, 20, 15, 21];
        for ts in order {
            submitter.submit(frame(ts));
            tokio::time::sleep(Duration::from_millis(1)).await;
        }
        submitter.shutdown().await;
    });

    let mut seen = Vec::new();
    while let Some(out) = recv(&mut rx).await {
        seen.push(out.timestamp_us);
    }
    producer.await.unwrap();
    assert!(!seen.is_empty());
    assert!(seen.windows(2).all(|w| w[0] < w[1]), "out of order: {seen:?}");
}

#[tokio::test]
async fn test_dropping_submitter_stops_worker() {
    let (tx, mut rx) = mpsc::channel(4);
    let submitter = FrameScheduler::spawn(passthrough_pipeline(), EffectsConfigHandle::default(), tx);
    drop(submitter);
    assert!(recv(&mut rx).await.is_none());
}

#[tokio::test]
async fn test_closed_sink_stops_accepting() {
    let (tx, rx) = mpsc::channel(1);
    let submitter = FrameScheduler::spawn(passthrough_pipeline(), EffectsConfigHandle::default(), tx);
    drop(rx);
    submitter.submit(frame(1));
    for _ in 0..100 {
        tokio::task::yield_now().await;
        if !submitter.submit(frame(u64::MAX)) {
            return;
        }
    }
    panic!("scheduler kept accepting frames after its sink closed");
}
