use std::sync::Arc;

use callfx_common::config::{EnabledEffects, WatermarkLocation};
use callfx_media::filters::{blur_frame, composite_watermark};
use callfx_media::settings::WatermarkParams;
use callfx_media::{
    EffectsSnapshot, EncoderConfig, FrameEffectsPipeline, PipelineConfig, SizeConstrainedEncoder,
    StaticBackend,
};
use criterion::{criterion_group, criterion_main, Criterion};
use image::{DynamicImage, Rgba, RgbaImage};

fn frame_720p() -> RgbaImage {
    RgbaImage::from_fn(1280, 720, |x, y| {
        Rgba([(x % 256) as u8, (y % 256) as u8, ((x ^ y) % 256) as u8, 255])
    })
}

fn watermark() -> WatermarkParams {
    WatermarkParams {
        image: Arc::new(RgbaImage::from_pixel(256, 128, Rgba([255, 255, 255, 180]))),
        location: WatermarkLocation::BottomRight,
        margin_px: 16.0,
        size_fraction: 0.2,
    }
}

fn bench_compositing(c: &mut Criterion) {
    let frame = frame_720p();
    let params = watermark();

    c.bench_function("watermark_composite_720p", |b| {
        b.iter(|| {
            let mut out = frame.clone();
            composite_watermark(&mut out, &params);
            out
        })
    });

    c.bench_function("background_blur_720p", |b| b.iter(|| blur_frame(&frame)));
}

fn bench_pipeline(c: &mut Criterion) {
    let rt = tokio::runtime::Runtime::new().unwrap();
    let backend = StaticBackend {
        foreground_confidence: Some(0.8),
        ..Default::default()
    };
    let pipeline = FrameEffectsPipeline::new(Arc::new(backend), &PipelineConfig::default());
    let mut snapshot = EffectsSnapshot::with_enabled(EnabledEffects::all());
    snapshot.watermark = Some(watermark());
    let frame = frame_720p();

    c.bench_function("pipeline_all_effects_720p", |b| {
        b.to_async(&rt)
            .iter(|| async { pipeline.process_image(frame.clone(), &snapshot).await })
    });
}

fn bench_encoder(c: &mut Criterion) {
    let encoder = SizeConstrainedEncoder::new(EncoderConfig::default());
    let image = DynamicImage::ImageRgba8(frame_720p());

    c.bench_function("encode_under_200k", |b| {
        b.iter(|| encoder.encode_image(&image, 200 * 1024).unwrap())
    });
}

criterion_group!(benches, bench_compositing, bench_pipeline, bench_encoder);
criterion_main!(benches);
