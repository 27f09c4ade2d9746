//! Per-effect frame transforms.

mod background;
mod face_mesh;
mod face_oval;
mod image_labeling;
mod object_detection;
mod pose_detection;
mod text_recognition;
mod watermark;

pub use background::{box_blur, blur_frame, composite_with_mask, prepare_background, BackgroundFilter};
pub use face_mesh::FaceMeshFilter;
pub use face_oval::FaceOvalFilter;
pub use image_labeling::{ImageLabelingFilter, MAX_LABELS, MIN_LABEL_CONFIDENCE};
pub use object_detection::ObjectDetectionFilter;
pub use pose_detection::PoseDetectionFilter;
pub use text_recognition::TextRecognitionFilter;
pub use watermark::{composite_watermark, watermark_placement, WatermarkFilter};

use async_trait::async_trait;
use callfx_common::config::Effect;
use callfx_common::{Error, Result};
use image::RgbaImage;
use tracing::{debug, warn};

use crate::draw::{self, Color, RectF};
use crate::settings::EffectsSnapshot;

/// One stage of the effects pipeline.
#[async_trait]
pub trait Filter: Send + Sync {
    fn effect(&self) -> Effect;

    /// Whether this stage runs for the given snapshot.
    fn is_active(&self, snapshot: &EffectsSnapshot) -> bool {
        snapshot.is_enabled(self.effect())
    }

    /// Transform `frame`. `Ok(None)` leaves it unchanged.
    async fn try_apply(
        &self,
        frame: &RgbaImage,
        snapshot: &EffectsSnapshot,
    ) -> Result<Option<RgbaImage>>;

    /// Transform `frame`, passing it through unchanged on any failure.
    async fn apply(&self, frame: RgbaImage, snapshot: &EffectsSnapshot) -> RgbaImage {
        match self.try_apply(&frame, snapshot).await {
            Ok(Some(out)) if out.dimensions() == frame.dimensions() => out,
            Ok(Some(out)) => {
                warn!(
                    effect = %self.effect(),
                    "filter changed frame size to {:?}, discarding its output",
                    out.dimensions()
                );
                frame
            }
            Ok(None) => frame,
            Err(e) => {
                debug!(effect = %self.effect(), "filter failed, passing frame through: {}", e);
                frame
            }
        }
    }

    /// Release model resources. Must be idempotent.
    fn close(&self) {}
}

/// Draw on a copy of `frame` on the blocking pool.
pub(crate) async fn render<F>(frame: &RgbaImage, paint: F) -> Result<RgbaImage>
where
    F: FnOnce(&mut RgbaImage) + Send + 'static,
{
    let mut out = frame.clone();
    tokio::task::spawn_blocking(move || {
        paint(&mut out);
        out
    })
    .await
    .map_err(|e| Error::internal(format!("render task failed: {e}")))
}

/// Label text on a backing rectangle sitting just above `anchor`.
pub(crate) struct Tag {
    pub text_px: f32,
    pub padding: f32,
    pub color: Color,
    pub backdrop_alpha: u8,
}

impl Tag {
    pub fn draw_above(&self, image: &mut RgbaImage, anchor: &RectF, text: &str) {
        let scale = draw::font_scale(self.text_px);
        let (tw, th) = draw::text_size(text, scale);
        let (tw, th) = (tw as f32, th as f32);
        let left = anchor.left.max(0.0);
        let top = (anchor.top - th - self.padding * 2.0).max(0.0);
        draw::fill_rect(
            image,
            RectF::new(
                left,
                top,
                left + tw + self.padding * 2.0,
                top + th + self.padding * 2.0,
            ),
            draw::backdrop(self.backdrop_alpha),
        );
        draw::draw_text(
            image,
            left + self.padding,
            top + self.padding,
            text,
            scale,
            self.color,
        );
    }
}
