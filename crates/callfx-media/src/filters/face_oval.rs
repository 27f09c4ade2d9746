use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use callfx_common::config::Effect;
use callfx_common::Result;
use image::RgbaImage;

use super::{render, Filter};
use crate::draw;
use crate::inference::{DetectedFace, LazyModel, ModelBackend};
use crate::settings::EffectsSnapshot;

const OVAL_STROKE_PX: f32 = 4.0;

/// Red oval inscribed in each detected face's bounding box.
pub struct FaceOvalFilter {
    model: LazyModel<Vec<DetectedFace>>,
}

impl FaceOvalFilter {
    pub fn new(backend: Arc<dyn ModelBackend>, timeout: Duration) -> Self {
        Self {
            model: LazyModel::new("face-detection", timeout, move || backend.face_detector()),
        }
    }
}

#[async_trait]
impl Filter for FaceOvalFilter {
    fn effect(&self) -> Effect {
        Effect::FaceOval
    }

    async fn try_apply(
        &self,
        frame: &RgbaImage,
        _snapshot: &EffectsSnapshot,
    ) -> Result<Option<RgbaImage>> {
        let faces = self.model.infer(frame).await?;
        if faces.is_empty() {
            return Ok(None);
        }
        render(frame, move |out| {
            for face in &faces {
                draw::stroke_ellipse(out, face.bounds, OVAL_STROKE_PX, draw::RED);
            }
        })
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
    use crate::draw::RectF;
    use crate::inference::StaticBackend;
    use image::Rgba;

    #[tokio::test]
    async fn test_oval_outline_around_face() {
        let backend = StaticBackend {
            faces: vec![DetectedFace {
                bounds: RectF::new(20.0, 10.0, 60.0, 70.0),
            }],
            ..Default::default()
        };
        let counters = backend.counters.clone();
        let filter = FaceOvalFilter::new(Arc::new(backend), Duration::from_millis(500));
        let frame = RgbaImage::from_pixel(80, 80, Rgba([0, 0, 0, 255]));
        let out = filter
            .try_apply(&frame, &EffectsSnapshot::default())
            .await
            .unwrap()
            .unwrap();
        // leftmost point of the ellipse and its untouched centre
        assert_eq!(*out.get_pixel(20, 40), draw::RED);
        assert_eq!(*out.get_pixel(40, 40), Rgba([0, 0, 0, 255]));

        filter.close();
        filter.close();
        assert_eq!(counters.closed(), 1);
    }
}
