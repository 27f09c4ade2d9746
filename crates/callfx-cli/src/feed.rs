//! Outgoing video for calls: a synthetic camera feeding the effects pipeline
//! through the latest-frame-wins scheduler into a negotiator's video sink.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use callfx_common::config::ConfigStore;
use callfx_media::{
    EffectsConfigHandle, EffectsSnapshot, FrameEffectsPipeline, FrameScheduler, FrameSubmitter,
    PipelineConfig, SchedulerStats, SizeConstrainedEncoder, UnavailableBackend, VideoFrame,
};
use image::{Rgba, RgbaImage};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info};

pub const DEFAULT_FPS: u32 = 15;
pub const DEFAULT_WIDTH: u32 = 320;
pub const DEFAULT_HEIGHT: u32 = 240;

const BARS: [[u8; 3]; 6] = [
    [235, 235, 235],
    [235, 235, 16],
    [16, 235, 235],
    [16, 235, 16],
    [235, 16, 235],
    [235, 16, 16],
];

/// Scrolling color bars standing in for a camera.
pub struct TestPattern {
    width: u32,
    height: u32,
    interval: Duration,
    seq: u64,
}

impl TestPattern {
    pub fn new(width: u32, height: u32, fps: u32) -> Self {
        Self {
            width: width.max(1),
            height: height.max(1),
            interval: Duration::from_secs(1) / fps.max(1),
            seq: 0,
        }
    }

    pub fn interval(&self) -> Duration {
        self.interval
    }

    /// Frames are stamped from the frame counter, so timestamps only grow.
    pub fn next_frame(&mut self) -> VideoFrame {
        let timestamp_us = self.seq * self.interval.as_micros() as u64;
        let shift = (self.seq % u32::MAX as u64) as u32;
        let bar_width = (self.width / BARS.len() as u32).max(1);
        self.seq += 1;

        let image = RgbaImage::from_fn(self.width, self.height, |x, _| {
            let bar = (x.wrapping_add(shift.wrapping_mul(4)) / bar_width) as usize % BARS.len();
            let [r, g, b] = BARS[bar];
            Rgba([r, g, b, 255])
        });
        VideoFrame::new(timestamp_us, image)
    }
}

/// A running camera, effects pipeline and scheduler.
///
/// The effects config is read from the store when the feed starts and again
/// on [`LocalVideo::reload`], which the call commands run at every call setup.
pub struct LocalVideo {
    store: ConfigStore,
    encoder: SizeConstrainedEncoder,
    effects: EffectsConfigHandle,
    stats: Arc<SchedulerStats>,
    camera: JoinHandle<()>,
}

impl LocalVideo {
    pub async fn start(
        store: ConfigStore,
        sink: mpsc::Sender<VideoFrame>,
        pattern: TestPattern,
    ) -> Result<Self> {
        let encoder = SizeConstrainedEncoder::default();
        let effects = EffectsConfigHandle::default();
        effects
            .reload_from(&store, &encoder)
            .await
            .with_context(|| format!("loading effects config {}", store.path().display()))?;

        let pipeline = Arc::new(FrameEffectsPipeline::new(
            Arc::new(UnavailableBackend),
            &PipelineConfig::default(),
        ));
        let submitter = FrameScheduler::spawn(pipeline, effects.clone(), sink);
        let stats = submitter.stats();
        let camera = tokio::spawn(run_camera(submitter, pattern));

        Ok(Self {
            store,
            encoder,
            effects,
            stats,
            camera,
        })
    }

    /// Re-read the effects config. Returns the new snapshot.
    pub async fn reload(&self) -> Result<Arc<EffectsSnapshot>> {
        let snapshot = self.effects.reload_from(&self.store, &self.encoder).await?;
        Ok(snapshot)
    }

    pub fn effects(&self) -> Arc<EffectsSnapshot> {
        self.effects.current()
    }

    pub fn stats(&self) -> Arc<SchedulerStats> {
        self.stats.clone()
    }

    /// Stop the camera. Dropping its submitter stops the scheduler, which
    /// releases the pipeline.
    pub async fn stop(mut self) {
        self.camera.abort();
        let _ = (&mut self.camera).await;
        info!(
            processed = self.stats.processed(),
            dropped = self.stats.dropped(),
            "local video stopped"
        );
    }
}

impl Drop for LocalVideo {
    fn drop(&mut self) {
        self.camera.abort();
    }
}

async fn run_camera(submitter: FrameSubmitter, mut pattern: TestPattern) {
    let mut ticker = tokio::time::interval(pattern.interval());
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
    loop {
        ticker.tick().await;
        if !submitter.submit(pattern.next_frame()) {
            debug!("frame scheduler stopped, camera off");
            break;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use callfx_common::config::Effect;
    use tokio::time::timeout;

    #[test]
    fn test_pattern_timestamps_grow() {
        let mut pattern = TestPattern::new(60, 20, 10);
        let first = pattern.next_frame();
        let second = pattern.next_frame();
        assert_eq!(first.timestamp_us, 0);
        assert_eq!(second.timestamp_us, 100_000);
        assert_eq!(second.resolution().width, 60);
        assert_ne!(first.image, second.image);
    }

    #[tokio::test]
    async fn test_feed_delivers_frames_and_reloads() {
        let dir = tempfile::tempdir().unwrap();
        let store = ConfigStore::new(dir.path().join("callfx.json"));
        let (tx, mut rx) = mpsc::channel(4);

        let video = LocalVideo::start(store.clone(), tx, TestPattern::new(32, 24, 50))
            .await
            .unwrap();
        assert!(!video.effects().is_enabled(Effect::FaceOval));

        let frame = timeout(Duration::from_secs(5), rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!((frame.image.width(), frame.image.height()), (32, 24));

        store
            .update(|cfg| cfg.filters.set(Effect::FaceOval, true))
            .unwrap();
        let snapshot = video.reload().await.unwrap();
        assert!(snapshot.is_enabled(Effect::FaceOval));
        assert_eq!(snapshot.version, video.effects().version);

        let stats = video.stats();
        video.stop().await;
        assert!(stats.submitted() >= 1);
    }
}
