//! Size-constrained JPEG re-encoding.
//!
//! Searches quality first, then dimensions, and returns the first encoding
//! that fits the byte budget. When nothing fits, the smallest encoding
//! produced is returned instead of an error.
//!
//! JPEG input is decoded directly at the power-of-two pre-scale through DCT
//! scaling. Other formats are decoded at full size and then downsampled.

use std::io::Cursor;

use callfx_common::{Error, Result};
use image::codecs::jpeg::JpegEncoder;
use image::imageops::FilterType;
use image::{DynamicImage, GrayImage, ImageFormat, ImageReader, RgbImage, RgbaImage};
use jpeg_decoder::PixelFormat;
use tracing::debug;

pub const DEFAULT_MAX_DIMENSION: u32 = 1280;

const FAST_PATH_QUALITY: u8 = 95;
const QUALITY_START: u8 = 92;
const RESIZED_QUALITY_START: u8 = 85;
const QUALITY_STEP: usize = 7;
const QUALITY_FLOOR: u8 = 35;
const SCALE_STEP: f32 = 0.9;
const MIN_AXIS_PX: u32 = 320;
const STOP_MAX_SIDE_PX: u32 = 360;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EncoderConfig {
    /// Target for the power-of-two pre-scale applied before any encoding.
    pub max_dimension: u32,
}

impl Default for EncoderConfig {
    fn default() -> Self {
        Self {
            max_dimension: DEFAULT_MAX_DIMENSION,
        }
    }
}

/// Result of a size-constrained encode.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EncodedImage {
    pub bytes: Vec<u8>,
    pub width: u32,
    pub height: u32,
    pub quality: u8,
    /// Whether `bytes` fits the requested budget.
    pub within_budget: bool,
    /// Number of encodes performed.
    pub attempts: u32,
}

impl EncodedImage {
    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }

    pub fn decode(&self) -> Result<RgbaImage> {
        let image = image::load_from_memory(&self.bytes).map_err(Error::image)?;
        Ok(image.to_rgba8())
    }
}

#[derive(Debug, Clone, Default)]
pub struct SizeConstrainedEncoder {
    config: EncoderConfig,
}

/// Largest power-of-two divisor that keeps both halved axes at or above `target`.
pub fn sample_size(width: u32, height: u32, target: u32) -> u32 {
    let mut sample = 1u32;
    if width > target || height > target {
        let (half_w, half_h) = (width / 2, height / 2);
        while half_h / sample >= target && half_w / sample >= target {
            sample *= 2;
        }
    }
    sample
}

/// Decode a JPEG at `1/sample` of its size, resized to exactly
/// `width / sample`×`height / sample`. `None` when the decoder cannot scale
/// this input; the caller then decodes at full size.
fn decode_jpeg_scaled(data: &[u8], width: u32, height: u32, sample: u32) -> Option<DynamicImage> {
    let (target_w, target_h) = ((width / sample).max(1), (height / sample).max(1));
    let requested = (u16::try_from(target_w).ok()?, u16::try_from(target_h).ok()?);

    let mut decoder = jpeg_decoder::Decoder::new(Cursor::new(data));
    let scaled = decoder
        .read_info()
        .and_then(|_| decoder.scale(requested.0, requested.1));
    let (w, h) = match scaled {
        Ok((w, h)) => (u32::from(w), u32::from(h)),
        Err(e) => {
            debug!("jpeg scaling unavailable: {}", e);
            return None;
        }
    };
    let format = decoder.info()?.pixel_format;
    let pixels = match decoder.decode() {
        Ok(pixels) => pixels,
        Err(e) => {
            debug!("scaled jpeg decode failed: {}", e);
            return None;
        }
    };
    let image = match format {
        PixelFormat::RGB24 => DynamicImage::ImageRgb8(RgbImage::from_raw(w, h, pixels)?),
        PixelFormat::L8 => DynamicImage::ImageLuma8(GrayImage::from_raw(w, h, pixels)?),
        _ => return None,
    };
    if (w, h) == (target_w, target_h) {
        Some(image)
    } else {
        Some(image.resize_exact(target_w, target_h, FilterType::Triangle))
    }
}

/// Decode `data` with its larger side pre-scaled by the power-of-two
/// [`sample_size`] for `max_dimension`.
///
/// Only the header is read to pick the factor. JPEGs are then decoded
/// straight at that factor; other formats are decoded at full size and
/// downsampled afterwards.
pub fn decode_bounded(data: &[u8], max_dimension: u32) -> Result<DynamicImage> {
    if data.is_empty() {
        return Err(Error::image("empty input"));
    }
    let reader = ImageReader::new(Cursor::new(data)).with_guessed_format()?;
    let format = reader.format();
    let (width, height) = reader.into_dimensions().map_err(Error::image)?;
    if width == 0 || height == 0 {
        return Err(Error::image("image has no pixels"));
    }
    let sample = sample_size(width, height, max_dimension);
    if sample > 1 && format == Some(ImageFormat::Jpeg) {
        if let Some(image) = decode_jpeg_scaled(data, width, height, sample) {
            debug!(width, height, sample, "decoded jpeg at reduced scale");
            return Ok(image);
        }
    }

    let image = ImageReader::new(Cursor::new(data))
        .with_guessed_format()?
        .decode()
        .map_err(Error::image)?;
    if sample == 1 {
        return Ok(image);
    }
    Ok(image.resize_exact(width / sample, height / sample, FilterType::Triangle))
}

fn encode_jpeg(image: &RgbImage, quality: u8) -> Result<Vec<u8>> {
    let mut bytes = Vec::new();
    let mut encoder = JpegEncoder::new_with_quality(&mut bytes, quality);
    encoder.encode_image(image).map_err(Error::image)?;
    Ok(bytes)
}

/// Quality ladder from `start` down to the floor.
fn qualities(start: u8) -> impl Iterator<Item = u8> {
    (QUALITY_FLOOR..=start).rev().step_by(QUALITY_STEP)
}

struct Search {
    max_bytes: usize,
    attempts: u32,
    smallest: Option<EncodedImage>,
}

impl Search {
    /// Encode once; returns the result if it fits.
    fn attempt(&mut self, image: &RgbImage, quality: u8) -> Result<Option<EncodedImage>> {
        let bytes = encode_jpeg(image, quality)?;
        self.attempts += 1;
        let within_budget = bytes.len() <= self.max_bytes;
        let candidate = EncodedImage {
            bytes,
            width: image.width(),
            height: image.height(),
            quality,
            within_budget,
            attempts: self.attempts,
        };
        if within_budget {
            return Ok(Some(candidate));
        }
        let smaller = self
            .smallest
            .as_ref()
            .map_or(true, |best| candidate.len() < best.len());
        if smaller {
            self.smallest = Some(candidate);
        }
        Ok(None)
    }
}

impl SizeConstrainedEncoder {
    pub fn new(config: EncoderConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &EncoderConfig {
        &self.config
    }

    /// Re-encode an encoded image (any format the `image` crate reads).
    /// The pre-scale is applied while decoding, see [`decode_bounded`].
    pub fn encode_bytes(&self, data: &[u8], max_bytes: usize) -> Result<EncodedImage> {
        let decoded = decode_bounded(data, self.config.max_dimension)?;
        self.encode_image(&decoded, max_bytes)
    }

    /// Re-encode an already decoded image.
    pub fn encode_image(&self, image: &DynamicImage, max_bytes: usize) -> Result<EncodedImage> {
        let (width, height) = (image.width(), image.height());
        if width == 0 || height == 0 {
            return Err(Error::image("image has no pixels"));
        }
        let sample = sample_size(width, height, self.config.max_dimension);
        let original = if sample > 1 {
            image
                .resize_exact(width / sample, height / sample, FilterType::Triangle)
                .to_rgb8()
        } else {
            image.to_rgb8()
        };
        debug!(width, height, sample, max_bytes, "size-constrained encode");

        let mut search = Search {
            max_bytes,
            attempts: 0,
            smallest: None,
        };

        if let Some(done) = search.attempt(&original, FAST_PATH_QUALITY)? {
            return Ok(done);
        }

        for quality in qualities(QUALITY_START) {
            if let Some(done) = search.attempt(&original, quality)? {
                return Ok(done);
            }
        }

        let mut working = original;
        loop {
            let new_w = ((working.width() as f32 * SCALE_STEP) as u32).max(MIN_AXIS_PX);
            let new_h = ((working.height() as f32 * SCALE_STEP) as u32).max(MIN_AXIS_PX);
            if new_w == working.width() && new_h == working.height() {
                break;
            }
            working = image::imageops::resize(&working, new_w, new_h, FilterType::Triangle);

            for quality in qualities(RESIZED_QUALITY_START) {
                if let Some(done) = search.attempt(&working, quality)? {
                    return Ok(done);
                }
            }

            if working.width().max(working.height()) <= STOP_MAX_SIDE_PX {
                break;
            }
        }

        let attempts = search.attempts;
        let mut best = search
            .smallest
            .ok_or_else(|| Error::internal("no encoding attempt was made"))?;
        best.attempts = attempts;
        debug!(
            bytes = best.len(),
            max_bytes,
            attempts,
            "byte budget unreachable, returning smallest encoding"
        );
        Ok(best)
    }
}
