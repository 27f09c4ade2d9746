use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use callfx_common::config::Effect;
use callfx_common::Result;
use image::RgbaImage;

use super::{render, Filter, Tag};
use crate::draw;
use crate::inference::{DetectedObject, LazyModel, ModelBackend};
use crate::settings::EffectsSnapshot;

/// Yellow box and caption per tracked object.
pub struct ObjectDetectionFilter {
    model: LazyModel<Vec<DetectedObject>>,
}

impl ObjectDetectionFilter {
    pub fn new(backend: Arc<dyn ModelBackend>, timeout: Duration) -> Self {
        Self {
            model: LazyModel::new("object-detection", timeout, move || {
                backend.object_detector()
            }),
        }
    }
}

fn caption(object: &DetectedObject) -> String {
    match (object.labels.first(), object.tracking_id) {
        (Some(label), _) => format!("{} {}%", label.text, (label.confidence * 100.0) as u32),
        (None, Some(id)) => format!("Object {id}"),
        (None, None) => "Object".to_string(),
    }
}

fn draw_objects(image: &mut RgbaImage, objects: &[DetectedObject]) {
    let width = image.width() as f32;
    let stroke = (width / 250.0).max(2.0);
    let tag = Tag {
        text_px: (width / 25.0).max(18.0),
        padding: 8.0,
        color: draw::YELLOW,
        backdrop_alpha: 140,
    };
    for object in objects {
        draw::stroke_rect(image, object.bounds, stroke, draw::YELLOW);
        tag.draw_above(image, &object.bounds, &caption(object));
    }
}

#[async_trait]
impl Filter for ObjectDetectionFilter {
    fn effect(&self) -> Effect {
        Effect::ObjectDetection
    }

    async fn try_apply(
        &self,
        frame: &RgbaImage,
        _snapshot: &EffectsSnapshot,
    ) -> Result<Option<RgbaImage>> {
        let objects = self.model.infer(frame).await?;
        if objects.is_empty() {
            return Ok(None);
        }
        render(frame, move |out| draw_objects(out, &objects))
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
    use crate::inference::{ImageLabel, StaticBackend};
    use image::Rgba;

    fn object(labels: Vec<ImageLabel>, tracking_id: Option<u32>) -> DetectedObject {
        DetectedObject {
            bounds: RectF::new(50.0, 80.0, 150.0, 180.0),
            tracking_id,
            labels,
        }
    }

    #[test]
    fn test_caption_prefers_first_label() {
        let labelled = object(
            vec![
                ImageLabel {
                    text: "Food".into(),
                    confidence: 0.734,
                },
                ImageLabel {
                    text: "Plant".into(),
                    confidence: 0.9,
                },
            ],
            Some(3),
        );
        assert_eq!(caption(&labelled), "Food 73%");
        assert_eq!(caption(&object(vec![], Some(7))), "Object 7");
        assert_eq!(caption(&object(vec![], None)), "Object");
    }

    #[tokio::test]
    async fn test_box_is_drawn_in_yellow() {
        let backend = StaticBackend {
            objects: vec![object(vec![], Some(1))],
            ..Default::default()
        };
        let filter = ObjectDetectionFilter::new(Arc::new(backend), Duration::from_millis(500));
        let frame = RgbaImage::from_pixel(200, 200, Rgba([0, 0, 255, 255]));
        let out = filter
            .try_apply(&frame, &EffectsSnapshot::default())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(*out.get_pixel(150, 130), draw::YELLOW);
        assert_eq!(*out.get_pixel(100, 130), Rgba([0, 0, 255, 255]));
    }
}
