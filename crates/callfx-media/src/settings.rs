//! Runtime effects settings.
//!
//! An [`EffectsSnapshot`] is an immutable view of the persisted config with
//! its images decoded. Frames read the current snapshot through an
//! [`EffectsConfigHandle`]; reloads swap the whole snapshot at once.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use callfx_common::config::{
    BackgroundScaleMode, ConfigStore, Effect, EffectsConfig, EnabledEffects, WatermarkLocation,
};
use callfx_common::{Error, Result};
use image::RgbaImage;
use tokio::sync::watch;
use tracing::{info, warn};

use crate::encoder::{decode_bounded, SizeConstrainedEncoder};

/// Byte budget applied to replacement backgrounds on load.
pub const BACKGROUND_MAX_BYTES: usize = 512 * 1024;

#[derive(Debug, Clone)]
pub struct WatermarkParams {
    pub image: Arc<RgbaImage>,
    pub location: WatermarkLocation,
    pub margin_px: f32,
    pub size_fraction: f32,
}

#[derive(Debug, Clone, Default)]
pub struct BackgroundParams {
    pub image: Option<Arc<RgbaImage>>,
    pub scale_mode: BackgroundScaleMode,
}

#[derive(Debug, Clone, Default)]
pub struct EffectsSnapshot {
    pub version: u64,
    pub enabled: EnabledEffects,
    /// `None` when no watermark image is configured or it failed to load.
    pub watermark: Option<WatermarkParams>,
    pub background: BackgroundParams,
}

impl EffectsSnapshot {
    pub fn with_enabled(enabled: EnabledEffects) -> Self {
        Self {
            enabled,
            ..Default::default()
        }
    }

    pub fn is_enabled(&self, effect: Effect) -> bool {
        self.enabled.is_enabled(effect)
    }

    /// Build a snapshot from the persisted document, decoding its images.
    ///
    /// Image failures are logged and leave that image unset.
    pub fn from_config(config: &EffectsConfig, encoder: &SizeConstrainedEncoder) -> Self {
        let watermark = config.watermark.uri.as_deref().and_then(|uri| {
            match load_effect_image(&resolve_uri(uri), None, encoder) {
                Ok(image) => Some(WatermarkParams {
                    image: Arc::new(image),
                    location: config.watermark.location,
                    margin_px: config.watermark.margin_px,
                    size_fraction: config.watermark.size_fraction,
                }),
                Err(e) => {
                    warn!(uri, "watermark image unavailable: {}", e);
                    None
                }
            }
        });

        let background_image = config.background.uri.as_deref().and_then(|uri| {
            match load_effect_image(&resolve_uri(uri), Some(BACKGROUND_MAX_BYTES), encoder) {
                Ok(image) => Some(Arc::new(image)),
                Err(e) => {
                    warn!(uri, "background image unavailable: {}", e);
                    None
                }
            }
        });

        Self {
            version: 0,
            enabled: config.filters,
            watermark,
            background: BackgroundParams {
                image: background_image,
                scale_mode: config.background.scale_mode,
            },
        }
    }
}

/// Map a stored URI to a local path. Only `file://` URIs and plain paths are supported.
pub fn resolve_uri(uri: &str) -> PathBuf {
    PathBuf::from(uri.strip_prefix("file://").unwrap_or(uri))
}

/// Decode an effect image from disk, bounded to the encoder's max dimension.
///
/// With `max_bytes`, a file larger than the budget is re-encoded through the
/// size-constrained encoder first (which drops alpha).
pub fn load_effect_image(
    path: &Path,
    max_bytes: Option<usize>,
    encoder: &SizeConstrainedEncoder,
) -> Result<RgbaImage> {
    let data = std::fs::read(path)?;
    if data.is_empty() {
        return Err(Error::image(format!("{} is empty", path.display())));
    }
    if let Some(budget) = max_bytes {
        if data.len() > budget {
            return encoder.encode_bytes(&data, budget)?.decode();
        }
    }
    Ok(decode_bounded(&data, encoder.config().max_dimension)?.to_rgba8())
}

/// Single-writer, many-reader holder of the current snapshot.
#[derive(Debug, Clone)]
pub struct EffectsConfigHandle {
    tx: Arc<watch::Sender<Arc<EffectsSnapshot>>>,
}

impl Default for EffectsConfigHandle {
    fn default() -> Self {
        Self::new(EffectsSnapshot::default())
    }
}

impl EffectsConfigHandle {
    pub fn new(initial: EffectsSnapshot) -> Self {
        let (tx, _rx) = watch::channel(Arc::new(initial));
        Self { tx: Arc::new(tx) }
    }

    pub fn current(&self) -> Arc<EffectsSnapshot> {
        self.tx.borrow().clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<Arc<EffectsSnapshot>> {
        self.tx.subscribe()
    }

    /// Publish a new snapshot; returns the version it was assigned.
    pub fn replace(&self, mut snapshot: EffectsSnapshot) -> u64 {
        let mut version = 0;
        self.tx.send_modify(|current| {
            version = current.version + 1;
            snapshot.version = version;
            *current = Arc::new(snapshot);
        });
        version
    }

    /// Re-read the store and publish the result.
    pub async fn reload_from(
        &self,
        store: &ConfigStore,
        encoder: &SizeConstrainedEncoder,
    ) -> Result<Arc<EffectsSnapshot>> {
        let store = store.clone();
        let encoder = encoder.clone();
        let snapshot = tokio::task::spawn_blocking(move || {
            EffectsSnapshot::from_config(&store.load(), &encoder)
        })
        .await
        .map_err(|e| Error::internal(format!("config reload task failed: {e}")))?;
        let version = self.replace(snapshot);
        info!(version, "effects configuration reloaded");
        Ok(self.current())
    }
}
