use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use callfx_common::config::Effect;
use callfx_common::Result;
use image::RgbaImage;

use super::{render, Filter};
use crate::draw::{self, RectF};
use crate::inference::{ImageLabel, LazyModel, ModelBackend};
use crate::settings::EffectsSnapshot;

/// Labels below this confidence are ignored.
pub const MIN_LABEL_CONFIDENCE: f32 = 0.65;
pub const MAX_LABELS: usize = 5;

/// Top scene labels listed in the top-left corner.
pub struct ImageLabelingFilter {
    model: LazyModel<Vec<ImageLabel>>,
}

impl ImageLabelingFilter {
    pub fn new(backend: Arc<dyn ModelBackend>, timeout: Duration) -> Self {
        Self {
            model: LazyModel::new("image-labeling", timeout, move || backend.image_labeler()),
        }
    }
}

/// `"text NN%"` lines for the most confident labels.
fn label_lines(labels: &[ImageLabel]) -> Vec<String> {
    let mut kept: Vec<&ImageLabel> = labels
        .iter()
        .filter(|label| label.confidence >= MIN_LABEL_CONFIDENCE)
        .collect();
    kept.sort_by(|a, b| b.confidence.total_cmp(&a.confidence));
    kept.into_iter()
        .take(MAX_LABELS)
        .map(|label| format!("{} {}%", label.text, (label.confidence * 100.0) as u32))
        .collect()
}

fn draw_labels(image: &mut RgbaImage, lines: &[String]) {
    let width = image.width() as f32;
    let text_px = (width / 22.0).max(28.0);
    let scale = draw::font_scale(text_px);
    let padding = (width / 60.0).max(16.0);
    let line_height = text_px * 1.25;
    let text_width = lines
        .iter()
        .map(|line| draw::text_size(line, scale).0)
        .max()
        .unwrap_or(0) as f32;

    let box_w = text_width + padding * 2.0;
    let box_h = padding * 2.0 + line_height * lines.len() as f32;
    draw::fill_rect(
        image,
        RectF::new(padding, padding, padding + box_w, padding + box_h),
        draw::backdrop(140),
    );

    let mut top = padding * 2.0;
    for line in lines {
        draw::draw_text(image, padding * 2.0, top, line, scale, draw::WHITE);
        top += line_height;
    }
}

#[async_trait]
impl Filter for ImageLabelingFilter {
    fn effect(&self) -> Effect {
        Effect::ImageLabeling
    }

    async fn try_apply(
        &self,
        frame: &RgbaImage,
        _snapshot: &EffectsSnapshot,
    ) -> Result<Option<RgbaImage>> {
        let lines = label_lines(&self.model.infer(frame).await?);
        if lines.is_empty() {
            return Ok(None);
        }
        render(frame, move |out| draw_labels(out, &lines))
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
    use crate::inference::StaticBackend;
    use image::Rgba;

    fn label(text: &str, confidence: f32) -> ImageLabel {
        ImageLabel {
            text: text.into(),
            confidence,
        }
    }

    #[test]
    fn test_lines_are_filtered_sorted_and_capped() {
        let labels = vec![
            label("Desk", 0.70),
            label("Cat", 0.99),
            label("Fog", 0.64),
            label("Lamp", 0.80),
            label("Sky", 0.90),
            label("Cup", 0.66),
            label("Pen", 0.75),
        ];
        assert_eq!(
            label_lines(&labels),
            vec!["Cat 99%", "Sky 90%", "Lamp 80%", "Pen 75%", "Desk 70%"]
        );
    }

    #[tokio::test]
    async fn test_only_weak_labels_leave_frame_alone() {
        let backend = StaticBackend {
            labels: vec![label("Fog", 0.3)],
            ..Default::default()
        };
        let filter = ImageLabelingFilter::new(Arc::new(backend), Duration::from_millis(500));
        let frame = RgbaImage::new(64, 64);
        assert!(filter
            .try_apply(&frame, &EffectsSnapshot::default())
            .await
            .unwrap()
            .is_none());
    }

    #[tokio::test]
    async fn test_overlay_darkens_top_left() {
        let backend = StaticBackend {
            labels: vec![label("Cat", 0.9)],
            ..Default::default()
        };
        let filter = ImageLabelingFilter::new(Arc::new(backend), Duration::from_millis(500));
        let white = Rgba([255, 255, 255, 255]);
        let frame = RgbaImage::from_pixel(640, 480, white);
        let out = filter
            .try_apply(&frame, &EffectsSnapshot::default())
            .await
            .unwrap()
            .unwrap();
        assert!(out.get_pixel(20, 20)[0] < 255);
        assert_eq!(*out.get_pixel(600, 400), white);
    }
}
