use async_trait::async_trait;
use callfx_common::config::{Effect, WatermarkLocation};
use callfx_common::Result;
use image::imageops::FilterType;
use image::RgbaImage;

use super::{render, Filter};
use crate::draw;
use crate::settings::{EffectsSnapshot, WatermarkParams};

/// Where a scaled watermark lands on the frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Placement {
    pub left: u32,
    pub top: u32,
    pub width: u32,
    pub height: u32,
}

/// Scale and anchor a `wm_w`×`wm_h` watermark on a `frame_w`×`frame_h` frame.
///
/// The watermark keeps its aspect ratio and fits a square of `size_fraction`
/// (clamped to 0.01..=1.0) of the frame's smaller side. For `Center` the
/// margin moves the mark down instead of inwards. The result always lies
/// inside the frame.
pub fn watermark_placement(
    frame_w: u32,
    frame_h: u32,
    wm_w: u32,
    wm_h: u32,
    location: WatermarkLocation,
    margin_px: f32,
    size_fraction: f32,
) -> Placement {
    let fraction = size_fraction.clamp(0.01, 1.0);
    let target = ((frame_w.min(frame_h) as f32 * fraction) as u32).max(1) as f32;
    let scale = (target / wm_w.max(1) as f32).min(target / wm_h.max(1) as f32);
    let width = ((wm_w as f32 * scale) as u32).clamp(1, frame_w.max(1));
    let height = ((wm_h as f32 * scale) as u32).clamp(1, frame_h.max(1));

    let (fw, fh) = (frame_w as f32, frame_h as f32);
    let (w, h) = (width as f32, height as f32);
    let (left, top) = match location {
        WatermarkLocation::TopLeft => (margin_px, margin_px),
        WatermarkLocation::TopRight => (fw - w - margin_px, margin_px),
        WatermarkLocation::BottomLeft => (margin_px, fh - h - margin_px),
        WatermarkLocation::BottomRight => (fw - w - margin_px, fh - h - margin_px),
        WatermarkLocation::Center => ((fw - w) / 2.0, (fh - h) / 2.0 + margin_px),
    };

    Placement {
        left: left.clamp(0.0, (fw - w).max(0.0)) as u32,
        top: top.clamp(0.0, (fh - h).max(0.0)) as u32,
        width,
        height,
    }
}

/// Alpha-blend the configured watermark onto `frame` in place.
pub fn composite_watermark(frame: &mut RgbaImage, params: &WatermarkParams) {
    let placement = watermark_placement(
        frame.width(),
        frame.height(),
        params.image.width(),
        params.image.height(),
        params.location,
        params.margin_px,
        params.size_fraction,
    );
    if placement.width == params.image.width() && placement.height == params.image.height() {
        draw::blit(frame, &params.image, placement.left as i64, placement.top as i64);
    } else {
        let scaled = image::imageops::resize(
            params.image.as_ref(),
            placement.width,
            placement.height,
            FilterType::Triangle,
        );
        draw::blit(frame, &scaled, placement.left as i64, placement.top as i64);
    }
}

/// Pure compositing; needs no model.
#[derive(Debug, Default)]
pub struct WatermarkFilter;

#[async_trait]
impl Filter for WatermarkFilter {
    fn effect(&self) -> Effect {
        Effect::Watermark
    }

    async fn try_apply(
        &self,
        frame: &RgbaImage,
        snapshot: &EffectsSnapshot,
    ) -> Result<Option<RgbaImage>> {
        let Some(params) = snapshot.watermark.clone() else {
            return Ok(None);
        };
        render(frame, move |out| composite_watermark(out, &params))
            .await
            .map(Some)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    use image::Rgba;

    fn params(image: RgbaImage, location: WatermarkLocation, margin_px: f32, size_fraction: f32) -> WatermarkParams {
        WatermarkParams {
            image: Arc::new(image),
            location,
            margin_px,
            size_fraction,
        }
    }

    #[test]
    fn test_huge_margin_clamps_inside_frame() {
        let p = watermark_placement(200, 100, 50, 50, WatermarkLocation::TopRight, 500.0, 1.0);
        assert_eq!((p.width, p.height), (100, 100));
        assert_eq!((p.left, p.top), (0, 0));

        let p = watermark_placement(200, 100, 50, 50, WatermarkLocation::TopRight, 500.0, 0.2);
        assert_eq!((p.width, p.height), (20, 20));
        assert_eq!(p.left, 0);
        assert_eq!(p.top, 80);
    }

    #[test]
    fn test_anchor_positions() {
        let at = |loc| watermark_placement(400, 200, 100, 50, loc, 10.0, 0.25);
        // 25% of 200 → fits 50x50, so the 2:1 mark becomes 50x25
        assert_eq!(at(WatermarkLocation::TopLeft), Placement { left: 10, top: 10, width: 50, height: 25 });
        assert_eq!(at(WatermarkLocation::TopRight).left, 340);
        assert_eq!(at(WatermarkLocation::BottomLeft).top, 165);
        assert_eq!(at(WatermarkLocation::BottomRight).left, 340);
        let center = at(WatermarkLocation::Center);
        assert_eq!((center.left, center.top), (175, 97));
    }

    #[test]
    fn test_size_fraction_is_clamped() {
        let big = watermark_placement(100, 100, 10, 10, WatermarkLocation::TopLeft, 0.0, 5.0);
        assert_eq!((big.width, big.height), (100, 100));
        let tiny = watermark_placement(100, 100, 10, 10, WatermarkLocation::TopLeft, 0.0, 0.0);
        assert_eq!((tiny.width, tiny.height), (1, 1));
    }

    #[test]
    fn test_composite_blends_and_reapplies_in_bounds() {
        let mut frame = RgbaImage::from_pixel(200, 100, Rgba([0, 0, 0, 255]));
        let mark = RgbaImage::from_pixel(50, 50, Rgba([255, 255, 255, 255]));
        let p = params(mark, WatermarkLocation::TopRight, 500.0, 1.0);
        composite_watermark(&mut frame, &p);
        composite_watermark(&mut frame, &p);
        assert_eq!(frame.dimensions(), (200, 100));
        assert_eq!(*frame.get_pixel(50, 50), Rgba([255, 255, 255, 255]));
        assert_eq!(*frame.get_pixel(150, 50), Rgba([0, 0, 0, 255]));
    }

    #[test]
    fn test_transparent_pixels_keep_frame() {
        let mut frame = RgbaImage::from_pixel(40, 40, Rgba([10, 10, 10, 255]));
        let mark = RgbaImage::from_pixel(8, 8, Rgba([255, 0, 0, 0]));
        composite_watermark(&mut frame, &params(mark, WatermarkLocation::TopLeft, 0.0, 0.2));
        assert_eq!(*frame.get_pixel(2, 2), Rgba([10, 10, 10, 255]));
    }

    #[tokio::test]
    async fn test_filter_without_image_passes_through() {
        let frame = RgbaImage::new(4, 4);
        let out = WatermarkFilter
            .try_apply(&frame, &EffectsSnapshot::default())
            .await
            .unwrap();
        assert!(out.is_none());
    }
}
