//! Inference seams used by the effect filters.
//!
//! Each model kind is an [`InferenceModel`] producing one result per call.
//! Models are built by a [`ModelBackend`] and held by a [`LazyModel`], which
//! acquires on first use and releases exactly once on close.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use callfx_common::{Error, Result};
use image::RgbaImage;
use tracing::{debug, info};

use crate::draw::RectF;

/// Mask confidence above which a pixel counts as foreground.
pub const FOREGROUND_THRESHOLD: f32 = 0.6;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Point {
    pub x: f32,
    pub y: f32,
}

impl Point {
    pub fn new(x: f32, y: f32) -> Self {
        Self { x, y }
    }
}

/// Per-pixel foreground confidence, row-major, same size as the frame.
#[derive(Debug, Clone, PartialEq)]
pub struct SegmentationMask {
    width: u32,
    height: u32,
    confidences: Vec<f32>,
}

impl SegmentationMask {
    pub fn new(width: u32, height: u32, confidences: Vec<f32>) -> Result<Self> {
        if confidences.len() != width as usize * height as usize {
            return Err(Error::inference(format!(
                "mask has {} values for {}x{}",
                confidences.len(),
                width,
                height
            )));
        }
        Ok(Self {
            width,
            height,
            confidences,
        })
    }

    pub fn uniform(width: u32, height: u32, confidence: f32) -> Self {
        Self {
            width,
            height,
            confidences: vec![confidence; width as usize * height as usize],
        }
    }

    pub fn width(&self) -> u32 {
        self.width
    }

    pub fn height(&self) -> u32 {
        self.height
    }

    pub fn confidence(&self, x: u32, y: u32) -> f32 {
        self.confidences[(y * self.width + x) as usize]
    }

    pub fn is_foreground(&self, x: u32, y: u32) -> bool {
        self.confidence(x, y) > FOREGROUND_THRESHOLD
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct DetectedFace {
    pub bounds: RectF,
}

#[derive(Debug, Clone, PartialEq)]
pub struct FaceMesh {
    pub points: Vec<Point>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct TextBlock {
    pub text: String,
    pub bounds: Option<RectF>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ImageLabel {
    pub text: String,
    pub confidence: f32,
}

#[derive(Debug, Clone, PartialEq)]
pub struct DetectedObject {
    pub bounds: RectF,
    pub tracking_id: Option<u32>,
    pub labels: Vec<ImageLabel>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PoseLandmark {
    Nose,
    LeftShoulder,
    RightShoulder,
    LeftElbow,
    RightElbow,
    LeftWrist,
    RightWrist,
    LeftHip,
    RightHip,
    LeftKnee,
    RightKnee,
    LeftAnkle,
    RightAnkle,
}

impl PoseLandmark {
    /// Bones drawn between landmarks.
    pub const SKELETON: [(PoseLandmark, PoseLandmark); 12] = [
        (PoseLandmark::LeftShoulder, PoseLandmark::RightShoulder),
        (PoseLandmark::LeftHip, PoseLandmark::RightHip),
        (PoseLandmark::LeftShoulder, PoseLandmark::LeftHip),
        (PoseLandmark::RightShoulder, PoseLandmark::RightHip),
        (PoseLandmark::LeftShoulder, PoseLandmark::LeftElbow),
        (PoseLandmark::LeftElbow, PoseLandmark::LeftWrist),
        (PoseLandmark::RightShoulder, PoseLandmark::RightElbow),
        (PoseLandmark::RightElbow, PoseLandmark::RightWrist),
        (PoseLandmark::LeftHip, PoseLandmark::LeftKnee),
        (PoseLandmark::LeftKnee, PoseLandmark::LeftAnkle),
        (PoseLandmark::RightHip, PoseLandmark::RightKnee),
        (PoseLandmark::RightKnee, PoseLandmark::RightAnkle),
    ];
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct Pose {
    pub landmarks: Vec<(PoseLandmark, Point)>,
}

impl Pose {
    pub fn landmark(&self, kind: PoseLandmark) -> Option<Point> {
        self.landmarks
            .iter()
            .find(|(k, _)| *k == kind)
            .map(|(_, p)| *p)
    }
}

/// One loaded model.
#[async_trait]
pub trait InferenceModel: Send + Sync {
    type Output: Send;

    async fn infer(&self, image: &RgbaImage) -> Result<Self::Output>;

    /// Release native resources. Called at most once by [`LazyModel`].
    fn close(&self) {}
}

pub type SharedModel<O> = Arc<dyn InferenceModel<Output = O>>;

/// Builds models on demand.
pub trait ModelBackend: Send + Sync {
    fn name(&self) -> &str;
    fn selfie_segmenter(&self) -> Result<SharedModel<SegmentationMask>>;
    fn face_detector(&self) -> Result<SharedModel<Vec<DetectedFace>>>;
    fn face_mesh_detector(&self) -> Result<SharedModel<Vec<FaceMesh>>>;
    fn text_recognizer(&self) -> Result<SharedModel<Vec<TextBlock>>>;
    fn image_labeler(&self) -> Result<SharedModel<Vec<ImageLabel>>>;
    fn object_detector(&self) -> Result<SharedModel<Vec<DetectedObject>>>;
    fn pose_detector(&self) -> Result<SharedModel<Pose>>;
}

type Loader<O> = Box<dyn Fn() -> Result<SharedModel<O>> + Send + Sync>;

enum Slot<O> {
    Unloaded,
    Loaded(SharedModel<O>),
    Closed,
}

/// A model acquired on first use and released exactly once.
pub struct LazyModel<O> {
    name: &'static str,
    timeout: Duration,
    loader: Loader<O>,
    slot: Mutex<Slot<O>>,
}

impl<O: Send + 'static> LazyModel<O> {
    pub fn new(
        name: &'static str,
        timeout: Duration,
        loader: impl Fn() -> Result<SharedModel<O>> + Send + Sync + 'static,
    ) -> Self {
        Self {
            name,
            timeout,
            loader: Box::new(loader),
            slot: Mutex::new(Slot::Unloaded),
        }
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    pub fn is_loaded(&self) -> bool {
        matches!(*self.lock(), Slot::Loaded(_))
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Slot<O>> {
        self.slot.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn acquire(&self) -> Result<SharedModel<O>> {
        let mut slot = self.lock();
        match &*slot {
            Slot::Loaded(model) => Ok(model.clone()),
            Slot::Closed => Err(Error::invalid_state(format!("{} model is closed", self.name))),
            Slot::Unloaded => {
                // A failed load leaves the slot unloaded so the next frame retries.
                let model = (self.loader)()?;
                info!(model = self.name, "inference model loaded");
                *slot = Slot::Loaded(model.clone());
                Ok(model)
            }
        }
    }

    /// Run one inference, bounded by the configured timeout.
    pub async fn infer(&self, image: &RgbaImage) -> Result<O> {
        let model = self.acquire()?;
        match tokio::time::timeout(self.timeout, model.infer(image)).await {
            Ok(result) => result,
            Err(_) => Err(Error::timeout(format!(
                "{} inference exceeded {:?}",
                self.name, self.timeout
            ))),
        }
    }

    /// Release the model if it was loaded. Later calls are no-ops.
    pub fn close(&self) {
        let previous = std::mem::replace(&mut *self.lock(), Slot::Closed);
        if let Slot::Loaded(model) = previous {
            debug!(model = self.name, "closing inference model");
            model.close();
        }
    }
}

/// Backend whose models can never be acquired; inference filters pass through.
#[derive(Debug, Default, Clone, Copy)]
pub struct UnavailableBackend;

impl UnavailableBackend {
    fn unavailable<O>(kind: &str) -> Result<SharedModel<O>> {
        Err(Error::inference(format!("no {kind} model available")))
    }
}

impl ModelBackend for UnavailableBackend {
    fn name(&self) -> &str {
        "unavailable"
    }

    fn selfie_segmenter(&self) -> Result<SharedModel<SegmentationMask>> {
        Self::unavailable("selfie segmentation")
    }

    fn face_detector(&self) -> Result<SharedModel<Vec<DetectedFace>>> {
        Self::unavailable("face detection")
    }

    fn face_mesh_detector(&self) -> Result<SharedModel<Vec<FaceMesh>>> {
        Self::unavailable("face mesh")
    }

    fn text_recognizer(&self) -> Result<SharedModel<Vec<TextBlock>>> {
        Self::unavailable("text recognition")
    }

    fn image_labeler(&self) -> Result<SharedModel<Vec<ImageLabel>>> {
        Self::unavailable("image labeling")
    }

    fn object_detector(&self) -> Result<SharedModel<Vec<DetectedObject>>> {
        Self::unavailable("object detection")
    }

    fn pose_detector(&self) -> Result<SharedModel<Pose>> {
        Self::unavailable("pose detection")
    }
}

/// Load/close counters shared by every model a [`StaticBackend`] hands out.
#[derive(Debug, Default)]
pub struct ModelCounters {
    pub loaded: AtomicUsize,
    pub closed: AtomicUsize,
}

impl ModelCounters {
    pub fn loaded(&self) -> usize {
        self.loaded.load(Ordering::SeqCst)
    }

    pub fn closed(&self) -> usize {
        self.closed.load(Ordering::SeqCst)
    }
}

/// Backend returning canned detections, for demos, benches and tests.
///
/// The segmenter answers with a uniform mask sized to the input frame.
#[derive(Debug, Clone, Default)]
pub struct StaticBackend {
    pub foreground_confidence: Option<f32>,
    pub faces: Vec<DetectedFace>,
    pub meshes: Vec<FaceMesh>,
    pub text: Vec<TextBlock>,
    pub labels: Vec<ImageLabel>,
    pub objects: Vec<DetectedObject>,
    pub pose: Option<Pose>,
    /// Every inference call fails.
    pub fail: bool,
    /// Every inference call sleeps this long first.
    pub latency: Option<Duration>,
    pub counters: Arc<ModelCounters>,
}

impl StaticBackend {
    fn model<O>(&self, respond: impl Fn(&RgbaImage) -> Result<O> + Send + Sync + 'static) -> SharedModel<O>
    where
        O: Send + 'static,
    {
        self.counters.loaded.fetch_add(1, Ordering::SeqCst);
        Arc::new(CannedModel {
            respond: Box::new(respond),
            fail: self.fail,
            latency: self.latency,
            counters: self.counters.clone(),
        })
    }
}

struct CannedModel<O> {
    respond: Box<dyn Fn(&RgbaImage) -> Result<O> + Send + Sync>,
    fail: bool,
    latency: Option<Duration>,
    counters: Arc<ModelCounters>,
}

#[async_trait]
impl<O: Send + 'static> InferenceModel for CannedModel<O> {
    type Output = O;

    async fn infer(&self, image: &RgbaImage) -> Result<O> {
        if let Some(latency) = self.latency {
            tokio::time::sleep(latency).await;
        }
        if self.fail {
            return Err(Error::inference("canned model configured to fail"));
        }
        (self.respond)(image)
    }

    fn close(&self) {
        self.counters.closed.fetch_add(1, Ordering::SeqCst);
    }
}

impl ModelBackend for StaticBackend {
    fn name(&self) -> &str {
        "static"
    }

    fn selfie_segmenter(&self) -> Result<SharedModel<SegmentationMask>> {
        let confidence = self
            .foreground_confidence
            .ok_or_else(|| Error::inference("no canned segmentation"))?;
        Ok(self.model(move |image| {
            Ok(SegmentationMask::uniform(
                image.width(),
                image.height(),
                confidence,
            ))
        }))
    }

    fn face_detector(&self) -> Result<SharedModel<Vec<DetectedFace>>> {
        let faces = self.faces.clone();
        Ok(self.model(move |_| Ok(faces.clone())))
    }

    fn face_mesh_detector(&self) -> Result<SharedModel<Vec<FaceMesh>>> {
        let meshes = self.meshes.clone();
        Ok(self.model(move |_| Ok(meshes.clone())))
    }

    fn text_recognizer(&self) -> Result<SharedModel<Vec<TextBlock>>> {
        let text = self.text.clone();
        Ok(self.model(move |_| Ok(text.clone())))
    }

    fn image_labeler(&self) -> Result<SharedModel<Vec<ImageLabel>>> {
        let labels = self.labels.clone();
        Ok(self.model(move |_| Ok(labels.clone())))
    }

    fn object_detector(&self) -> Result<SharedModel<Vec<DetectedObject>>> {
        let objects = self.objects.clone();
        Ok(self.model(move |_| Ok(objects.clone())))
    }

    fn pose_detector(&self) -> Result<SharedModel<Pose>> {
        let pose = self.pose.clone().unwrap_or_default();
        Ok(self.model(move |_| Ok(pose.clone())))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn lazy_segmenter(backend: StaticBackend, timeout: Duration) -> LazyModel<SegmentationMask> {
        LazyModel::new("selfie", timeout, move || backend.selfie_segmenter())
    }

    #[test]
    fn test_mask_threshold_is_strict() {
        let mask = SegmentationMask::new(3, 1, vec![0.6, 0.61, 1.0]).unwrap();
        assert!(!mask.is_foreground(0, 0));
        assert!(mask.is_foreground(1, 0));
        assert!(mask.is_foreground(2, 0));
        assert!(SegmentationMask::new(2, 2, vec![0.0; 3]).is_err());
    }

    #[tokio::test]
    async fn test_lazy_model_loads_once_and_closes_once() {
        let backend = StaticBackend {
            foreground_confidence: Some(1.0),
            ..Default::default()
        };
        let counters = backend.counters.clone();
        let model = lazy_segmenter(backend, Duration::from_millis(500));
        assert!(!model.is_loaded());
        assert_eq!(counters.loaded(), 0);

        let image = RgbaImage::new(4, 2);
        let mask = model.infer(&image).await.unwrap();
        assert_eq!((mask.width(), mask.height()), (4, 2));
        model.infer(&image).await.unwrap();
        assert_eq!(counters.loaded(), 1);

        model.close();
        model.close();
        assert_eq!(counters.closed(), 1);
        assert!(model.infer(&image).await.is_err());
    }

    #[test]
    fn test_close_without_use_releases_nothing() {
        let backend = StaticBackend::default();
        let counters = backend.counters.clone();
        let model = LazyModel::new("faces", Duration::from_millis(10), move || {
            backend.face_detector()
        });
        model.close();
        assert_eq!(counters.loaded(), 0);
        assert_eq!(counters.closed(), 0);
    }

    #[tokio::test]
    async fn test_close_after_failed_inference_still_releases() {
        let backend = StaticBackend {
            foreground_confidence: Some(0.0),
            fail: true,
            ..Default::default()
        };
        let counters = backend.counters.clone();
        let model = lazy_segmenter(backend, Duration::from_millis(500));
        assert!(model.infer(&RgbaImage::new(1, 1)).await.is_err());
        model.close();
        assert_eq!(counters.closed(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_slow_inference_times_out() {
        let backend = StaticBackend {
            foreground_confidence: Some(1.0),
            latency: Some(Duration::from_secs(5)),
            ..Default::default()
        };
        let model = lazy_segmenter(backend, Duration::from_millis(500));
        let err = model.infer(&RgbaImage::new(1, 1)).await.unwrap_err();
        assert!(matches!(err, Error::Timeout(_)));
    }

    #[tokio::test]
    async fn test_unavailable_backend_never_loads() {
        let model = LazyModel::new("pose", Duration::from_millis(10), || {
            UnavailableBackend.pose_detector()
        });
        assert!(model.infer(&RgbaImage::new(1, 1)).await.is_err());
        assert!(!model.is_loaded());
    }

    #[test]
    fn test_pose_landmark_lookup() {
        let pose = Pose {
            landmarks: vec![(PoseLandmark::LeftWrist, Point::new(1.0, 2.0))],
        };
        assert_eq!(pose.landmark(PoseLandmark::LeftWrist), Some(Point::new(1.0, 2.0)));
        assert_eq!(pose.landmark(PoseLandmark::Nose), None);
    }
}
