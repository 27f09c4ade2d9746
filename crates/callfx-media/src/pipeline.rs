//! Ordered effects chain applied to every outgoing frame.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use callfx_common::config::Effect;
use image::RgbaImage;
use tracing::{debug, info};

use crate::filters::{
    BackgroundFilter, FaceMeshFilter, FaceOvalFilter, Filter, ImageLabelingFilter,
    ObjectDetectionFilter, PoseDetectionFilter, TextRecognitionFilter, WatermarkFilter,
};
use crate::frame::VideoFrame;
use crate::inference::ModelBackend;
use crate::settings::EffectsSnapshot;

pub const DEFAULT_INFERENCE_TIMEOUT: Duration = Duration::from_millis(500);

#[derive(Debug, Clone)]
pub struct PipelineConfig {
    /// Upper bound for a single model call; a slower call passes the frame through.
    pub inference_timeout: Duration,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            inference_timeout: DEFAULT_INFERENCE_TIMEOUT,
        }
    }
}

/// Runs the enabled filters over a frame in a fixed order.
///
/// Owns every model handle; they are released on [`close`](Self::close) or
/// drop, whichever comes first.
pub struct FrameEffectsPipeline {
    filters: Vec<Box<dyn Filter>>,
    closed: AtomicBool,
}

impl FrameEffectsPipeline {
    pub fn new(backend: Arc<dyn ModelBackend>, config: &PipelineConfig) -> Self {
        let timeout = config.inference_timeout;
        info!(backend = backend.name(), ?timeout, "building effects pipeline");
        let filters: Vec<Box<dyn Filter>> = vec![
            Box::new(TextRecognitionFilter::new(backend.clone(), timeout)),
            Box::new(WatermarkFilter),
            Box::new(FaceOvalFilter::new(backend.clone(), timeout)),
            Box::new(FaceMeshFilter::new(backend.clone(), timeout)),
            Box::new(BackgroundFilter::new(backend.clone(), timeout)),
            Box::new(ImageLabelingFilter::new(backend.clone(), timeout)),
            Box::new(ObjectDetectionFilter::new(backend.clone(), timeout)),
            Box::new(PoseDetectionFilter::new(backend, timeout)),
        ];
        Self::with_filters(filters)
    }

    /// Build from an explicit chain, applied in the given order.
    pub fn with_filters(filters: Vec<Box<dyn Filter>>) -> Self {
        Self {
            filters,
            closed: AtomicBool::new(false),
        }
    }

    /// Effects in the order they are applied.
    pub fn stages(&self) -> Vec<Effect> {
        self.filters.iter().map(|f| f.effect()).collect()
    }

    pub async fn process_image(&self, image: RgbaImage, snapshot: &EffectsSnapshot) -> RgbaImage {
        if self.is_closed() {
            debug!("effects pipeline closed, passing frame through");
            return image;
        }
        let mut image = image;
        for filter in &self.filters {
            if filter.is_active(snapshot) {
                image = filter.apply(image, snapshot).await;
            }
        }
        image
    }

    pub async fn process(&self, frame: VideoFrame, snapshot: &EffectsSnapshot) -> VideoFrame {
        let timestamp_us = frame.timestamp_us;
        let image = self.process_image(frame.image, snapshot).await;
        VideoFrame::new(timestamp_us, image)
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Release all models. Safe to call more than once.
    pub fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        for filter in &self.filters {
            filter.close();
        }
        info!("effects pipeline closed");
    }
}

impl Drop for FrameEffectsPipeline {
    fn drop(&mut self) {
        self.close();
    }
}
