//! Software drawing primitives for overlay filters.
//!
//! All primitives clip to the image and alpha-blend (source-over) into it.

use image::{Rgba, RgbaImage};

use crate::font::{self, GLYPH_ADVANCE, GLYPH_HEIGHT, GLYPH_WIDTH};

pub type Color = Rgba<u8>;

pub const RED: Color = Rgba([255, 0, 0, 255]);
pub const GREEN: Color = Rgba([0, 255, 0, 255]);
pub const CYAN: Color = Rgba([0, 255, 255, 255]);
pub const YELLOW: Color = Rgba([255, 255, 0, 255]);
pub const WHITE: Color = Rgba([255, 255, 255, 255]);

/// Semi-opaque black used behind label text.
pub const fn backdrop(alpha: u8) -> Color {
    Rgba([0, 0, 0, alpha])
}

/// Axis-aligned rectangle in pixel space.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RectF {
    pub left: f32,
    pub top: f32,
    pub right: f32,
    pub bottom: f32,
}

impl RectF {
    pub fn new(left: f32, top: f32, right: f32, bottom: f32) -> Self {
        Self {
            left,
            top,
            right,
            bottom,
        }
    }

    pub fn width(&self) -> f32 {
        self.right - self.left
    }

    pub fn height(&self) -> f32 {
        self.bottom - self.top
    }
}

/// Blend `color` over the pixel at `(x, y)`; out-of-bounds writes are ignored.
pub fn blend_pixel(image: &mut RgbaImage, x: i64, y: i64, color: Color) {
    if x < 0 || y < 0 || x >= image.width() as i64 || y >= image.height() as i64 {
        return;
    }
    let dst = image.get_pixel_mut(x as u32, y as u32);
    *dst = blend(*dst, color);
}

/// Source-over composite of `src` onto `dst`.
pub fn blend(dst: Color, src: Color) -> Color {
    let sa = src[3] as u32;
    if sa == 255 {
        return src;
    }
    if sa == 0 {
        return dst;
    }
    let inv = 255 - sa;
    let da = dst[3] as u32;
    let out_a = sa + da * inv / 255;
    let mut out = [0u8; 4];
    for c in 0..3 {
        let premul = src[c] as u32 * sa + dst[c] as u32 * da * inv / 255;
        out[c] = if out_a == 0 {
            0
        } else {
            (premul / out_a).min(255) as u8
        };
    }
    out[3] = out_a.min(255) as u8;
    Rgba(out)
}

fn clip_span(lo: f32, hi: f32, limit: u32) -> Option<(u32, u32)> {
    let start = lo.floor().max(0.0);
    let end = hi.ceil().min(limit as f32);
    if end <= start {
        return None;
    }
    Some((start as u32, end as u32))
}

pub fn fill_rect(image: &mut RgbaImage, rect: RectF, color: Color) {
    let Some((x0, x1)) = clip_span(rect.left, rect.right, image.width()) else {
        return;
    };
    let Some((y0, y1)) = clip_span(rect.top, rect.bottom, image.height()) else {
        return;
    };
    for y in y0..y1 {
        for x in x0..x1 {
            let dst = image.get_pixel_mut(x, y);
            *dst = blend(*dst, color);
        }
    }
}

/// Outline a rectangle with a stroke centred on its edges.
pub fn stroke_rect(image: &mut RgbaImage, rect: RectF, stroke: f32, color: Color) {
    let half = (stroke / 2.0).max(0.5);
    let outer = RectF::new(
        rect.left - half,
        rect.top - half,
        rect.right + half,
        rect.bottom + half,
    );
    // top, bottom, then the two sides between them
    fill_rect(
        image,
        RectF::new(outer.left, outer.top, outer.right, rect.top + half),
        color,
    );
    fill_rect(
        image,
        RectF::new(outer.left, rect.bottom - half, outer.right, outer.bottom),
        color,
    );
    fill_rect(
        image,
        RectF::new(outer.left, rect.top + half, rect.left + half, rect.bottom - half),
        color,
    );
    fill_rect(
        image,
        RectF::new(rect.right - half, rect.top + half, outer.right, rect.bottom - half),
        color,
    );
}

/// Outline the ellipse inscribed in `rect`.
pub fn stroke_ellipse(image: &mut RgbaImage, rect: RectF, stroke: f32, color: Color) {
    let half = (stroke / 2.0).max(0.5);
    let cx = (rect.left + rect.right) / 2.0;
    let cy = (rect.top + rect.bottom) / 2.0;
    let rx = rect.width().abs() / 2.0;
    let ry = rect.height().abs() / 2.0;
    if rx <= 0.0 || ry <= 0.0 {
        return;
    }
    let (orx, ory) = (rx + half, ry + half);
    let (irx, iry) = ((rx - half).max(0.0), (ry - half).max(0.0));

    let Some((x0, x1)) = clip_span(cx - orx, cx + orx, image.width()) else {
        return;
    };
    let Some((y0, y1)) = clip_span(cy - ory, cy + ory, image.height()) else {
        return;
    };
    for y in y0..y1 {
        let dy = y as f32 + 0.5 - cy;
        for x in x0..x1 {
            let dx = x as f32 + 0.5 - cx;
            let outside_inner =
                irx <= 0.0 || iry <= 0.0 || (dx / irx).powi(2) + (dy / iry).powi(2) >= 1.0;
            let inside_outer = (dx / orx).powi(2) + (dy / ory).powi(2) <= 1.0;
            if inside_outer && outside_inner {
                let dst = image.get_pixel_mut(x, y);
                *dst = blend(*dst, color);
            }
        }
    }
}

pub fn fill_circle(image: &mut RgbaImage, cx: f32, cy: f32, radius: f32, color: Color) {
    let r = radius.max(0.5);
    let Some((x0, x1)) = clip_span(cx - r, cx + r, image.width()) else {
        return;
    };
    let Some((y0, y1)) = clip_span(cy - r, cy + r, image.height()) else {
        return;
    };
    let r2 = r * r;
    for y in y0..y1 {
        let dy = y as f32 + 0.5 - cy;
        for x in x0..x1 {
            let dx = x as f32 + 0.5 - cx;
            if dx * dx + dy * dy <= r2 {
                let dst = image.get_pixel_mut(x, y);
                *dst = blend(*dst, color);
            }
        }
    }
}

/// Draw a segment of the given stroke width.
pub fn draw_line(
    image: &mut RgbaImage,
    from: (f32, f32),
    to: (f32, f32),
    stroke: f32,
    color: Color,
) {
    let half = (stroke / 2.0).max(0.5);
    let (ax, ay) = from;
    let (bx, by) = to;
    let Some((x0, x1)) = clip_span(ax.min(bx) - half, ax.max(bx) + half, image.width()) else {
        return;
    };
    let Some((y0, y1)) = clip_span(ay.min(by) - half, ay.max(by) + half, image.height()) else {
        return;
    };
    let (vx, vy) = (bx - ax, by - ay);
    let len2 = vx * vx + vy * vy;
    for y in y0..y1 {
        let py = y as f32 + 0.5;
        for x in x0..x1 {
            let px = x as f32 + 0.5;
            let t = if len2 == 0.0 {
                0.0
            } else {
                (((px - ax) * vx + (py - ay) * vy) / len2).clamp(0.0, 1.0)
            };
            let (qx, qy) = (ax + t * vx, ay + t * vy);
            if (px - qx).powi(2) + (py - qy).powi(2) <= half * half {
                let dst = image.get_pixel_mut(x, y);
                *dst = blend(*dst, color);
            }
        }
    }
}

/// Integer scale that renders the built-in font at roughly `text_px` tall.
pub fn font_scale(text_px: f32) -> u32 {
    ((text_px / GLYPH_HEIGHT as f32).round() as u32).max(1)
}

/// Width and height of `text` at the given font scale.
pub fn text_size(text: &str, scale: u32) -> (u32, u32) {
    let chars = text.chars().count() as u32;
    if chars == 0 {
        return (0, 0);
    }
    let width = (chars * GLYPH_ADVANCE - (GLYPH_ADVANCE - GLYPH_WIDTH)) * scale;
    (width, GLYPH_HEIGHT * scale)
}

/// Render `text` with its top-left corner at `(left, top)`.
pub fn draw_text(image: &mut RgbaImage, left: f32, top: f32, text: &str, scale: u32, color: Color) {
    let scale = scale.max(1);
    let origin_x = left.round() as i64;
    let origin_y = top.round() as i64;
    for (i, c) in text.chars().enumerate() {
        let glyph_x = origin_x + (i as u32 * GLYPH_ADVANCE * scale) as i64;
        if glyph_x >= image.width() as i64 {
            break;
        }
        for row in 0..GLYPH_HEIGHT {
            for col in 0..GLYPH_WIDTH {
                if !font::is_lit(c, col, row) {
                    continue;
                }
                for sy in 0..scale {
                    for sx in 0..scale {
                        blend_pixel(
                            image,
                            glyph_x + (col * scale + sx) as i64,
                            origin_y + (row * scale + sy) as i64,
                            color,
                        );
                    }
                }
            }
        }
    }
}

/// Composite `src` over `dst` with `src`'s top-left at `(left, top)`.
pub fn blit(dst: &mut RgbaImage, src: &RgbaImage, left: i64, top: i64) {
    for (x, y, pixel) in src.enumerate_pixels() {
        blend_pixel(dst, left + x as i64, top + y as i64, *pixel);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn canvas(w: u32, h: u32) -> RgbaImage {
        RgbaImage::from_pixel(w, h, Rgba([10, 20, 30, 255]))
    }

    #[test]
    fn test_blend_extremes() {
        let dst = Rgba([1, 2, 3, 255]);
        assert_eq!(blend(dst, Rgba([9, 9, 9, 0])), dst);
        assert_eq!(blend(dst, RED), RED);
        let half = blend(Rgba([0, 0, 0, 255]), Rgba([255, 255, 255, 128]));
        assert!(half[0] > 120 && half[0] < 135);
        assert_eq!(half[3], 255);
    }

    #[test]
    fn test_fill_rect_clips_to_image() {
        let mut img = canvas(10, 10);
        fill_rect(&mut img, RectF::new(-5.0, -5.0, 3.0, 3.0), RED);
        assert_eq!(*img.get_pixel(0, 0), RED);
        assert_eq!(*img.get_pixel(2, 2), RED);
        assert_ne!(*img.get_pixel(3, 3), RED);
        fill_rect(&mut img, RectF::new(20.0, 20.0, 30.0, 30.0), RED);
    }

    #[test]
    fn test_stroke_rect_leaves_interior() {
        let mut img = canvas(20, 20);
        stroke_rect(&mut img, RectF::new(2.0, 2.0, 17.0, 17.0), 2.0, CYAN);
        assert_eq!(*img.get_pixel(2, 10), CYAN);
        assert_eq!(*img.get_pixel(10, 2), CYAN);
        assert_ne!(*img.get_pixel(10, 10), CYAN);
    }

    #[test]
    fn test_ellipse_outline_is_hollow() {
        let mut img = canvas(40, 40);
        stroke_ellipse(&mut img, RectF::new(0.0, 0.0, 40.0, 40.0), 4.0, RED);
        assert_eq!(*img.get_pixel(20, 20), Rgba([10, 20, 30, 255]));
        assert_eq!(*img.get_pixel(20, 0), RED);
        assert_eq!(*img.get_pixel(0, 20), RED);
    }

    #[test]
    fn test_line_and_circle_touch_expected_pixels() {
        let mut img = canvas(20, 20);
        draw_line(&mut img, (0.0, 10.0), (20.0, 10.0), 2.0, GREEN);
        assert_eq!(*img.get_pixel(5, 10), GREEN);
        assert_ne!(*img.get_pixel(5, 15), GREEN);
        fill_circle(&mut img, 10.0, 4.0, 2.0, YELLOW);
        assert_eq!(*img.get_pixel(10, 4), YELLOW);
    }

    #[test]
    fn test_text_measurement_matches_rendering() {
        assert_eq!(text_size("", 2), (0, 0));
        assert_eq!(text_size("AB", 1), (11, 7));
        let mut img = canvas(40, 20);
        draw_text(&mut img, 1.0, 1.0, "HI", 2, WHITE);
        // left column of 'H'
        assert_eq!(*img.get_pixel(1, 1), WHITE);
        assert_eq!(*img.get_pixel(1, 14), WHITE);
    }

    #[test]
    fn test_blit_respects_alpha_and_bounds() {
        let mut dst = canvas(4, 4);
        let mut src = RgbaImage::from_pixel(2, 2, RED);
        src.put_pixel(1, 1, Rgba([0, 0, 0, 0]));
        blit(&mut dst, &src, 3, 3);
        assert_eq!(*dst.get_pixel(3, 3), RED);
        blit(&mut dst, &src, 0, 0);
        assert_eq!(*dst.get_pixel(1, 1), Rgba([10, 20, 30, 255]));
    }
}
