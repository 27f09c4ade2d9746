use std::path::Path;
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use callfx_common::config::{EffectsConfig, EnabledEffects};
use callfx_media::{
    EffectsSnapshot, EncoderConfig, FrameEffectsPipeline, PipelineConfig, SizeConstrainedEncoder,
    UnavailableBackend,
};
use image::{DynamicImage, RgbaImage};
use tracing::info;

pub fn shrink(input: &Path, output: &Path, max_bytes: usize, max_dim: u32) -> Result<String> {
    if max_bytes == 0 {
        bail!("--max-bytes must be positive");
    }
    let data = std::fs::read(input).with_context(|| format!("reading {}", input.display()))?;
    let encoder = SizeConstrainedEncoder::new(EncoderConfig {
        max_dimension: max_dim.max(1),
    });
    let encoded = encoder.encode_bytes(&data, max_bytes)?;
    std::fs::write(output, &encoded.bytes)
        .with_context(|| format!("writing {}", output.display()))?;

    let verdict = if encoded.within_budget {
        "within budget"
    } else {
        "best effort, over budget"
    };
    Ok(format!(
        "{} ({} bytes) -> {}: {} bytes ({}), {}x{} q{}, {} attempts",
        input.display(),
        data.len(),
        output.display(),
        encoded.len(),
        verdict,
        encoded.width,
        encoded.height,
        encoded.quality,
        encoded.attempts,
    ))
}

/// Run the pixel-only pipeline over a still image. Model-backed effects
/// have no models here and leave the image as is.
pub async fn apply_effects(
    config: &EffectsConfig,
    input: &Path,
    output: &Path,
    all: bool,
) -> Result<String> {
    let image = image::open(input)
        .with_context(|| format!("decoding {}", input.display()))?
        .to_rgba8();
    let (width, height) = image.dimensions();

    let mut snapshot = EffectsSnapshot::from_config(config, &SizeConstrainedEncoder::default());
    if all {
        snapshot.enabled = EnabledEffects::all();
    }
    let enabled: Vec<_> = snapshot.enabled.enabled().map(|e| e.name()).collect();
    info!(effects = ?enabled, "applying effects to {}", input.display());

    let pipeline = FrameEffectsPipeline::new(Arc::new(UnavailableBackend), &PipelineConfig::default());
    let processed = pipeline.process_image(image, &snapshot).await;
    pipeline.close();

    save(processed, output)?;
    Ok(format!(
        "{}x{} -> {} with [{}]",
        width,
        height,
        output.display(),
        enabled.join(", ")
    ))
}

fn save(image: RgbaImage, output: &Path) -> Result<()> {
    let is_jpeg = output
        .extension()
        .and_then(|ext| ext.to_str())
        .is_some_and(|ext| ext.eq_ignore_ascii_case("jpg") || ext.eq_ignore_ascii_case("jpeg"));
    let result = if is_jpeg {
        DynamicImage::ImageRgba8(image).to_rgb8().save(output)
    } else {
        image.save(output)
    };
    result.with_context(|| format!("writing {}", output.display()))
}
