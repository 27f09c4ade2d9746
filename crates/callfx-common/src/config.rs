//! Persisted effects configuration.
//!
//! The UI side owns this document and mutates it; the call core only reads it
//! on setup and on explicit reload. Stored enum values are parsed leniently so
//! a stale or hand-edited file never prevents a call.

use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use serde::{Deserialize, Deserializer, Serialize};
use tracing::{debug, warn};

use crate::error::{Error, Result};

/// Default location of the config document.
pub const DEFAULT_CONFIG_PATH: &str = "callfx.json";

pub const DEFAULT_WATERMARK_MARGIN_PX: f32 = 12.0;
pub const DEFAULT_WATERMARK_SIZE_FRACTION: f32 = 0.20;

/// A single toggleable video effect.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Effect {
    TextRecognition,
    Watermark,
    FaceOval,
    FaceMesh,
    BackgroundBlur,
    ImageLabeling,
    ObjectDetection,
    PoseDetection,
    BackgroundReplace,
}

impl Effect {
    pub const ALL: [Effect; 9] = [
        Effect::TextRecognition,
        Effect::Watermark,
        Effect::FaceOval,
        Effect::FaceMesh,
        Effect::BackgroundBlur,
        Effect::ImageLabeling,
        Effect::ObjectDetection,
        Effect::PoseDetection,
        Effect::BackgroundReplace,
    ];

    pub fn name(self) -> &'static str {
        match self {
            Effect::TextRecognition => "text-recognition",
            Effect::Watermark => "watermark",
            Effect::FaceOval => "face-oval",
            Effect::FaceMesh => "face-mesh",
            Effect::BackgroundBlur => "background-blur",
            Effect::ImageLabeling => "image-labeling",
            Effect::ObjectDetection => "object-detection",
            Effect::PoseDetection => "pose-detection",
            Effect::BackgroundReplace => "background-replace",
        }
    }
}

impl fmt::Display for Effect {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for Effect {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        let wanted = s.trim().to_ascii_lowercase().replace('_', "-");
        Effect::ALL
            .into_iter()
            .find(|effect| effect.name() == wanted)
            .ok_or_else(|| Error::config(format!("unknown effect: {s}")))
    }
}

/// Enabled flag per effect. Missing keys read as disabled.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct EnabledEffects {
    pub text_recognition: bool,
    pub watermark: bool,
    pub face_oval: bool,
    pub face_mesh: bool,
    pub background_blur: bool,
    pub image_labeling: bool,
    pub object_detection: bool,
    pub pose_detection: bool,
    pub background_replace: bool,
}

impl EnabledEffects {
    pub fn all() -> Self {
        let mut enabled = Self::default();
        for effect in Effect::ALL {
            enabled.set(effect, true);
        }
        enabled
    }

    pub fn is_enabled(&self, effect: Effect) -> bool {
        match effect {
            Effect::TextRecognition => self.text_recognition,
            Effect::Watermark => self.watermark,
            Effect::FaceOval => self.face_oval,
            Effect::FaceMesh => self.face_mesh,
            Effect::BackgroundBlur => self.background_blur,
            Effect::ImageLabeling => self.image_labeling,
            Effect::ObjectDetection => self.object_detection,
            Effect::PoseDetection => self.pose_detection,
            Effect::BackgroundReplace => self.background_replace,
        }
    }

    pub fn set(&mut self, effect: Effect, enabled: bool) {
        let slot = match effect {
            Effect::TextRecognition => &mut self.text_recognition,
            Effect::Watermark => &mut self.watermark,
            Effect::FaceOval => &mut self.face_oval,
            Effect::FaceMesh => &mut self.face_mesh,
            Effect::BackgroundBlur => &mut self.background_blur,
            Effect::ImageLabeling => &mut self.image_labeling,
            Effect::ObjectDetection => &mut self.object_detection,
            Effect::PoseDetection => &mut self.pose_detection,
            Effect::BackgroundReplace => &mut self.background_replace,
        };
        *slot = enabled;
    }

    pub fn any(&self) -> bool {
        Effect::ALL.into_iter().any(|effect| self.is_enabled(effect))
    }

    pub fn enabled(&self) -> impl Iterator<Item = Effect> + '_ {
        Effect::ALL
            .into_iter()
            .filter(move |effect| self.is_enabled(*effect))
    }
}

/// Where the watermark is anchored on the frame.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum WatermarkLocation {
    #[default]
    TopLeft,
    TopRight,
    Center,
    BottomLeft,
    BottomRight,
}

impl WatermarkLocation {
    pub const ALL: [WatermarkLocation; 5] = [
        WatermarkLocation::TopLeft,
        WatermarkLocation::TopRight,
        WatermarkLocation::Center,
        WatermarkLocation::BottomLeft,
        WatermarkLocation::BottomRight,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            WatermarkLocation::TopLeft => "TOP_LEFT",
            WatermarkLocation::TopRight => "TOP_RIGHT",
            WatermarkLocation::Center => "CENTER",
            WatermarkLocation::BottomLeft => "BOTTOM_LEFT",
            WatermarkLocation::BottomRight => "BOTTOM_RIGHT",
        }
    }

    /// Parse a stored value, substituting `TOP_LEFT` for anything unknown.
    pub fn parse_lenient(raw: &str) -> Self {
        raw.parse().unwrap_or_else(|_| {
            debug!(value = raw, "unrecognised watermark location, using TOP_LEFT");
            WatermarkLocation::TopLeft
        })
    }
}

impl FromStr for WatermarkLocation {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        let wanted = s.trim().to_ascii_uppercase().replace('-', "_");
        WatermarkLocation::ALL
            .into_iter()
            .find(|loc| loc.as_str() == wanted)
            .ok_or_else(|| Error::config(format!("unknown watermark location: {s}")))
    }
}

impl<'de> Deserialize<'de> for WatermarkLocation {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        let raw = serde_json::Value::deserialize(deserializer)?;
        Ok(raw
            .as_str()
            .map(WatermarkLocation::parse_lenient)
            .unwrap_or_default())
    }
}

/// How a replacement background is fitted to the frame.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum BackgroundScaleMode {
    /// Uniform scale to cover the frame, then crop the overflow.
    #[default]
    CenterCrop,
    /// Independent X/Y scale to exactly fill the frame.
    Stretch,
}

impl BackgroundScaleMode {
    pub fn as_str(self) -> &'static str {
        match self {
            BackgroundScaleMode::CenterCrop => "CENTER_CROP",
            BackgroundScaleMode::Stretch => "STRETCH",
        }
    }

    /// Parse a stored value, substituting `CENTER_CROP` for anything unknown.
    pub fn parse_lenient(raw: &str) -> Self {
        raw.parse().unwrap_or_else(|_| {
            debug!(value = raw, "unrecognised background scale mode, using CENTER_CROP");
            BackgroundScaleMode::CenterCrop
        })
    }
}

impl FromStr for BackgroundScaleMode {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_uppercase().replace('-', "_").as_str() {
            "CENTER_CROP" => Ok(BackgroundScaleMode::CenterCrop),
            "STRETCH" => Ok(BackgroundScaleMode::Stretch),
            _ => Err(Error::config(format!("unknown background scale mode: {s}"))),
        }
    }
}

impl<'de> Deserialize<'de> for BackgroundScaleMode {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        let raw = serde_json::Value::deserialize(deserializer)?;
        Ok(raw
            .as_str()
            .map(BackgroundScaleMode::parse_lenient)
            .unwrap_or_default())
    }
}

fn default_watermark_location() -> WatermarkLocation {
    WatermarkLocation::BottomLeft
}

fn default_margin() -> f32 {
    DEFAULT_WATERMARK_MARGIN_PX
}

fn default_size_fraction() -> f32 {
    DEFAULT_WATERMARK_SIZE_FRACTION
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WatermarkSettings {
    #[serde(default)]
    pub uri: Option<String>,
    #[serde(default = "default_watermark_location")]
    pub location: WatermarkLocation,
    #[serde(default = "default_margin")]
    pub margin_px: f32,
    #[serde(default = "default_size_fraction")]
    pub size_fraction: f32,
}

impl Default for WatermarkSettings {
    fn default() -> Self {
        Self {
            uri: None,
            location: default_watermark_location(),
            margin_px: DEFAULT_WATERMARK_MARGIN_PX,
            size_fraction: DEFAULT_WATERMARK_SIZE_FRACTION,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BackgroundSettings {
    #[serde(default)]
    pub uri: Option<String>,
    #[serde(default)]
    pub scale_mode: BackgroundScaleMode,
}

/// The whole persisted document.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EffectsConfig {
    pub filters: EnabledEffects,
    pub watermark: WatermarkSettings,
    pub background: BackgroundSettings,
}

impl EffectsConfig {
    pub fn from_json(raw: &str) -> Result<Self> {
        Ok(serde_json::from_str(raw)?)
    }

    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string_pretty(self)?)
    }
}

/// File-backed store for [`EffectsConfig`].
#[derive(Debug, Clone)]
pub struct ConfigStore {
    path: PathBuf,
}

impl ConfigStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Load the document, falling back to defaults when it is missing or
    /// unreadable.
    pub fn load(&self) -> EffectsConfig {
        match self.try_load() {
            Ok(Some(config)) => config,
            Ok(None) => {
                debug!(path = %self.path.display(), "no effects config on disk, using defaults");
                EffectsConfig::default()
            }
            Err(e) => {
                warn!(path = %self.path.display(), "ignoring unreadable effects config: {}", e);
                EffectsConfig::default()
            }
        }
    }

    /// Load the document, reporting parse failures. `Ok(None)` when missing.
    pub fn try_load(&self) -> Result<Option<EffectsConfig>> {
        match std::fs::read_to_string(&self.path) {
            Ok(raw) => EffectsConfig::from_json(&raw).map(Some),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    pub fn save(&self, config: &EffectsConfig) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        let tmp = self.path.with_extension("json.tmp");
        std::fs::write(&tmp, config.to_json()?)?;
        std::fs::rename(&tmp, &self.path)?;
        Ok(())
    }

    /// Load, mutate and save in one step; returns the saved document.
    pub fn update(&self, mutate: impl FnOnce(&mut EffectsConfig)) -> Result<EffectsConfig> {
        let mut config = self.load();
        mutate(&mut config);
        self.save(&config)?;
        Ok(config)
    }
}
