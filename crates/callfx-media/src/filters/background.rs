use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use callfx_common::config::{BackgroundScaleMode, Effect};
use callfx_common::{Error, Result};
use image::imageops::FilterType;
use image::{Rgba, RgbaImage};
use tracing::debug;

use super::{render, Filter};
use crate::inference::{LazyModel, ModelBackend, SegmentationMask};
use crate::settings::EffectsSnapshot;

/// Blurs or replaces everything the selfie segmenter marks as background.
///
/// Replace wins over blur when both are enabled and an image is configured;
/// without an image, replace falls back to blur.
pub struct BackgroundFilter {
    model: LazyModel<SegmentationMask>,
}

impl BackgroundFilter {
    pub fn new(backend: Arc<dyn ModelBackend>, timeout: Duration) -> Self {
        Self {
            model: LazyModel::new("selfie-segmentation", timeout, move || {
                backend.selfie_segmenter()
            }),
        }
    }
}

/// Separable box blur with clamped edges.
pub fn box_blur(image: &RgbaImage, radius: u32) -> RgbaImage {
    if radius == 0 || image.width() == 0 || image.height() == 0 {
        return image.clone();
    }
    let horizontal = blur_pass(image, radius, true);
    blur_pass(&horizontal, radius, false)
}

fn blur_pass(src: &RgbaImage, radius: u32, horizontal: bool) -> RgbaImage {
    let (w, h) = src.dimensions();
    let mut out = RgbaImage::new(w, h);
    let (outer, inner) = if horizontal { (h, w) } else { (w, h) };
    let r = radius as i64;
    let window = 2 * radius + 1;

    for o in 0..outer {
        let at = |i: i64| -> Rgba<u8> {
            let i = i.clamp(0, inner as i64 - 1) as u32;
            if horizontal {
                *src.get_pixel(i, o)
            } else {
                *src.get_pixel(o, i)
            }
        };
        let mut sum = [0u32; 4];
        for i in -r..=r {
            let p = at(i);
            for c in 0..4 {
                sum[c] += p[c] as u32;
            }
        }
        for i in 0..inner {
            let px = Rgba(sum.map(|s| (s / window) as u8));
            if horizontal {
                out.put_pixel(i, o, px);
            } else {
                out.put_pixel(o, i, px);
            }
            let add = at(i as i64 + r + 1);
            let sub = at(i as i64 - r);
            for c in 0..4 {
                sum[c] = sum[c] + add[c] as u32 - sub[c] as u32;
            }
        }
    }
    out
}

/// Blurred copy of `frame`: box radius of width/32, computed at half resolution.
pub fn blur_frame(frame: &RgbaImage) -> RgbaImage {
    let (w, h) = frame.dimensions();
    let radius = w / 32;
    if radius == 0 {
        return frame.clone();
    }
    if w < 2 || h < 2 {
        return box_blur(frame, radius);
    }
    let small = image::imageops::resize(frame, w / 2, h / 2, FilterType::Triangle);
    let blurred = box_blur(&small, (radius / 2).max(1));
    image::imageops::resize(&blurred, w, h, FilterType::Triangle)
}

/// Fit `background` to `width`×`height`.
pub fn prepare_background(
    background: &RgbaImage,
    width: u32,
    height: u32,
    mode: BackgroundScaleMode,
) -> RgbaImage {
    let (sw, sh) = background.dimensions();
    if (sw, sh) == (width, height) {
        return background.clone();
    }
    match mode {
        BackgroundScaleMode::Stretch => {
            image::imageops::resize(background, width, height, FilterType::Triangle)
        }
        BackgroundScaleMode::CenterCrop => {
            let scale = (width as f32 / sw.max(1) as f32).max(height as f32 / sh.max(1) as f32);
            let scaled_w = ((sw as f32 * scale).ceil() as u32).max(width);
            let scaled_h = ((sh as f32 * scale).ceil() as u32).max(height);
            let scaled = image::imageops::resize(background, scaled_w, scaled_h, FilterType::Triangle);
            let left = (scaled_w - width) / 2;
            let top = (scaled_h - height) / 2;
            image::imageops::crop_imm(&scaled, left, top, width, height).to_image()
        }
    }
}

/// Replace every background pixel of `frame` with the matching `fallback` pixel.
pub fn composite_with_mask(frame: &mut RgbaImage, fallback: &RgbaImage, mask: &SegmentationMask) {
    for (x, y, pixel) in frame.enumerate_pixels_mut() {
        if !mask.is_foreground(x, y) {
            *pixel = *fallback.get_pixel(x, y);
        }
    }
}

#[async_trait]
impl Filter for BackgroundFilter {
    fn effect(&self) -> Effect {
        Effect::BackgroundBlur
    }

    fn is_active(&self, snapshot: &EffectsSnapshot) -> bool {
        snapshot.is_enabled(Effect::BackgroundBlur) || snapshot.is_enabled(Effect::BackgroundReplace)
    }

    async fn try_apply(
        &self,
        frame: &RgbaImage,
        snapshot: &EffectsSnapshot,
    ) -> Result<Option<RgbaImage>> {
        let replacement = if snapshot.is_enabled(Effect::BackgroundReplace) {
            let image = snapshot.background.image.clone();
            if image.is_none() {
                debug!("background replace has no image, blurring instead");
            }
            image
        } else {
            None
        };
        let mode = snapshot.background.scale_mode;

        let mask = self.model.infer(frame).await?;
        if (mask.width(), mask.height()) != frame.dimensions() {
            return Err(Error::inference(format!(
                "mask is {}x{} for a {}x{} frame",
                mask.width(),
                mask.height(),
                frame.width(),
                frame.height()
            )));
        }

        render(frame, move |out| {
            let fallback = match replacement {
                Some(background) => {
                    prepare_background(&background, out.width(), out.height(), mode)
                }
                None => blur_frame(out),
            };
            composite_with_mask(out, &fallback, &mask);
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
    use crate::inference::StaticBackend;
    use crate::settings::BackgroundParams;
    use callfx_common::config::EnabledEffects;

    fn checkerboard(w: u32, h: u32) -> RgbaImage {
        RgbaImage::from_fn(w, h, |x, y| {
            if (x + y) % 2 == 0 {
                Rgba([255, 255, 255, 255])
            } else {
                Rgba([0, 0, 0, 255])
            }
        })
    }

    fn snapshot(blur: bool, replace: bool, image: Option<RgbaImage>) -> EffectsSnapshot {
        let mut enabled = EnabledEffects::default();
        enabled.background_blur = blur;
        enabled.background_replace = replace;
        EffectsSnapshot {
            background: BackgroundParams {
                image: image.map(Arc::new),
                scale_mode: BackgroundScaleMode::Stretch,
            },
            ..EffectsSnapshot::with_enabled(enabled)
        }
    }

    fn filter(confidence: f32) -> BackgroundFilter {
        let backend = StaticBackend {
            foreground_confidence: Some(confidence),
            ..Default::default()
        };
        BackgroundFilter::new(Arc::new(backend), Duration::from_millis(500))
    }

    #[test]
    fn test_mask_extremes() {
        let frame = checkerboard(6, 4);
        let fallback = RgbaImage::from_pixel(6, 4, Rgba([1, 2, 3, 255]));

        let mut kept = frame.clone();
        composite_with_mask(&mut kept, &fallback, &SegmentationMask::uniform(6, 4, 1.0));
        assert_eq!(kept, frame);

        let mut replaced = frame.clone();
        composite_with_mask(&mut replaced, &fallback, &SegmentationMask::uniform(6, 4, 0.0));
        assert_eq!(replaced, fallback);
    }

    #[test]
    fn test_box_blur_averages_and_keeps_flat_regions() {
        let flat = RgbaImage::from_pixel(10, 10, Rgba([80, 80, 80, 255]));
        assert_eq!(box_blur(&flat, 3), flat);
        let blurred = box_blur(&checkerboard(10, 10), 2);
        let v = blurred.get_pixel(5, 5)[0];
        assert!(v > 100 && v < 155, "got {v}");
    }

    #[test]
    fn test_prepare_background_modes() {
        // left half red, right half blue, 4:1
        let wide = RgbaImage::from_fn(400, 100, |x, _| {
            if x < 200 {
                Rgba([255, 0, 0, 255])
            } else {
                Rgba([0, 0, 255, 255])
            }
        });
        let cropped = prepare_background(&wide, 100, 100, BackgroundScaleMode::CenterCrop);
        assert_eq!(cropped.dimensions(), (100, 100));
        // the centre crop straddles the colour boundary
        assert_eq!(cropped.get_pixel(10, 50)[0], 255);
        assert_eq!(cropped.get_pixel(90, 50)[2], 255);

        let stretched = prepare_background(&wide, 100, 100, BackgroundScaleMode::Stretch);
        assert_eq!(stretched.dimensions(), (100, 100));
        assert_eq!(stretched.get_pixel(5, 50)[0], 255);
        assert_eq!(stretched.get_pixel(95, 50)[2], 255);
    }

    #[tokio::test]
    async fn test_replace_with_pure_background_mask() {
        let frame = checkerboard(16, 8);
        let bg = RgbaImage::from_pixel(16, 8, Rgba([0, 200, 0, 255]));
        let out = filter(0.0)
            .try_apply(&frame, &snapshot(true, true, Some(bg.clone())))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(out, bg);
    }

    #[tokio::test]
    async fn test_replace_without_image_falls_back_to_blur() {
        let frame = checkerboard(64, 8);
        let out = filter(0.0)
            .try_apply(&frame, &snapshot(false, true, None))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(out, blur_frame(&frame));
    }

    #[tokio::test]
    async fn test_pure_foreground_is_unchanged() {
        let frame = checkerboard(64, 8);
        let out = filter(1.0)
            .try_apply(&frame, &snapshot(true, false, None))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(out, frame);
    }

    #[test]
    fn test_active_for_either_toggle() {
        let f = filter(1.0);
        assert!(!f.is_active(&snapshot(false, false, None)));
        assert!(f.is_active(&snapshot(true, false, None)));
        assert!(f.is_active(&snapshot(false, true, None)));
    }
}
