use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use callfx_common::config::Effect;
use callfx_common::Result;
use image::RgbaImage;

use super::{render, Filter};
use crate::draw;
use crate::inference::{LazyModel, ModelBackend, Pose, PoseLandmark};
use crate::settings::EffectsSnapshot;

/// Cyan skeleton and green joints for the detected pose.
pub struct PoseDetectionFilter {
    model: LazyModel<Pose>,
    draw_skeleton: bool,
    draw_points: bool,
}

impl PoseDetectionFilter {
    pub fn new(backend: Arc<dyn ModelBackend>, timeout: Duration) -> Self {
        Self {
            model: LazyModel::new("pose-detection", timeout, move || backend.pose_detector()),
            draw_skeleton: true,
            draw_points: true,
        }
    }

    pub fn with_style(mut self, draw_skeleton: bool, draw_points: bool) -> Self {
        self.draw_skeleton = draw_skeleton;
        self.draw_points = draw_points;
        self
    }
}

fn draw_pose(image: &mut RgbaImage, pose: &Pose, skeleton: bool, points: bool) {
    let width = image.width() as f32;
    let stroke = (width / 260.0).max(2.0);
    let radius = (width / 180.0).max(3.0);

    if skeleton {
        for (from, to) in PoseLandmark::SKELETON {
            if let (Some(a), Some(b)) = (pose.landmark(from), pose.landmark(to)) {
                draw::draw_line(image, (a.x, a.y), (b.x, b.y), stroke, draw::CYAN);
            }
        }
    }
    if points {
        for (_, point) in &pose.landmarks {
            draw::fill_circle(image, point.x, point.y, radius, draw::GREEN);
        }
    }
}

#[async_trait]
impl Filter for PoseDetectionFilter {
    fn effect(&self) -> Effect {
        Effect::PoseDetection
    }

    async fn try_apply(
        &self,
        frame: &RgbaImage,
        _snapshot: &EffectsSnapshot,
    ) -> Result<Option<RgbaImage>> {
        let pose = self.model.infer(frame).await?;
        if pose.landmarks.is_empty() {
            return Ok(None);
        }
        let (skeleton, points) = (self.draw_skeleton, self.draw_points);
        render(frame, move |out| draw_pose(out, &pose, skeleton, points))
            .await
            .map(Some)
    }

    fn close(&self) {
        self.model.close();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::inference::{Point, StaticBackend};
    use image::Rgba;

    const BLACK: Rgba<u8> = Rgba([0, 0, 0, 255]);

    fn arm() -> Pose {
        Pose {
            landmarks: vec![
                (PoseLandmark::LeftShoulder, Point::new(10.0, 50.0)),
                (PoseLandmark::LeftElbow, Point::new(90.0, 50.0)),
            ],
        }
    }

    #[tokio::test]
    async fn test_bone_and_joints_drawn() {
        let backend = StaticBackend {
            pose: Some(arm()),
            ..Default::default()
        };
        let filter = PoseDetectionFilter::new(Arc::new(backend), Duration::from_millis(500));
        let frame = RgbaImage::from_pixel(100, 100, BLACK);
        let out = filter
            .try_apply(&frame, &EffectsSnapshot::default())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(*out.get_pixel(50, 50), draw::CYAN);
        assert_eq!(*out.get_pixel(10, 50), draw::GREEN);
        assert_eq!(*out.get_pixel(50, 80), BLACK);
    }

    #[tokio::test]
    async fn test_points_only_style() {
        let backend = StaticBackend {
            pose: Some(arm()),
            ..Default::default()
        };
        let filter = PoseDetectionFilter::new(Arc::new(backend), Duration::from_millis(500))
            .with_style(false, true);
        let frame = RgbaImage::from_pixel(100, 100, BLACK);
        let out = filter
            .try_apply(&frame, &EffectsSnapshot::default())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(*out.get_pixel(50, 50), BLACK);
        assert_eq!(*out.get_pixel(90, 50), draw::GREEN);
    }

    #[tokio::test]
    async fn test_empty_pose_is_passthrough() {
        let filter =
            PoseDetectionFilter::new(Arc::new(StaticBackend::default()), Duration::from_millis(500));
        let frame = RgbaImage::from_pixel(10, 10, BLACK);
        assert!(filter
            .try_apply(&frame, &EffectsSnapshot::default())
            .await
            .unwrap()
            .is_none());
    }
}
