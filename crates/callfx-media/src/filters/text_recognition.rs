use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use callfx_common::config::Effect;
use callfx_common::Result;
use image::RgbaImage;

use super::{render, Filter, Tag};
use crate::draw;
use crate::inference::{LazyModel, ModelBackend, TextBlock};
use crate::settings::EffectsSnapshot;

/// Cyan boxes around recognised text, with the text repeated above each box.
pub struct TextRecognitionFilter {
    model: LazyModel<Vec<TextBlock>>,
}

impl TextRecognitionFilter {
    pub fn new(backend: Arc<dyn ModelBackend>, timeout: Duration) -> Self {
        Self {
            model: LazyModel::new("text-recognition", timeout, move || {
                backend.text_recognizer()
            }),
        }
    }
}

fn draw_blocks(image: &mut RgbaImage, blocks: &[TextBlock]) {
    let width = image.width() as f32;
    let stroke = (width / 300.0).max(2.0);
    let tag = Tag {
        text_px: (width / 28.0).max(18.0),
        padding: 8.0,
        color: draw::WHITE,
        backdrop_alpha: 160,
    };
    for block in blocks {
        let Some(bounds) = block.bounds else {
            continue;
        };
        draw::stroke_rect(image, bounds, stroke, draw::CYAN);
        let text = block.text.trim();
        if text.is_empty() {
            continue;
        }
        tag.draw_above(image, &bounds, text);
    }
}

#[async_trait]
impl Filter for TextRecognitionFilter {
    fn effect(&self) -> Effect {
        Effect::TextRecognition
    }

    async fn try_apply(
        &self,
        frame: &RgbaImage,
        _snapshot: &EffectsSnapshot,
    ) -> Result<Option<RgbaImage>> {
        let blocks = self.model.infer(frame).await?;
        if blocks.is_empty() {
            return Ok(None);
        }
        render(frame, move |out| draw_blocks(out, &blocks))
            .await
            .map(Some)
    }

    fn close(&self) {
        self.model.close();
    }
}
