use std::fmt::Write as _;

use anyhow::{bail, Result};
use callfx_common::config::{
    BackgroundScaleMode, ConfigStore, Effect, EffectsConfig, WatermarkLocation,
};
use clap::Subcommand;

#[derive(Subcommand, Debug)]
pub enum ConfigAction {
    /// Print the current config
    Show {
        /// Print the raw JSON document
        #[arg(long)]
        json: bool,
    },

    /// Enable or disable one effect
    Toggle {
        effect: Effect,

        /// Disable instead of enable
        #[arg(long)]
        off: bool,
    },

    /// Set watermark image and placement
    Watermark {
        #[arg(long)]
        uri: Option<String>,
        #[arg(long)]
        location: Option<WatermarkLocation>,
        #[arg(long)]
        margin: Option<f32>,
        #[arg(long)]
        size_fraction: Option<f32>,
        /// Forget the watermark image
        #[arg(long, conflicts_with = "uri")]
        clear: bool,
    },

    /// Set the replacement background image
    Background {
        #[arg(long)]
        uri: Option<String>,
        #[arg(long)]
        scale_mode: Option<BackgroundScaleMode>,
        /// Forget the background image
        #[arg(long, conflicts_with = "uri")]
        clear: bool,
    },
}

/// Apply `action` to the store and return what to print.
pub fn run(store: &ConfigStore, action: ConfigAction) -> Result<String> {
    match action {
        ConfigAction::Show { json } => {
            let config = store.load();
            if json {
                Ok(format!("{}\n", config.to_json()?))
            } else {
                Ok(describe(store, &config))
            }
        }
        other => {
            let mut config = store.load();
            apply(&mut config, other)?;
            store.save(&config)?;
            Ok(describe(store, &config))
        }
    }
}

fn apply(config: &mut EffectsConfig, action: ConfigAction) -> Result<()> {
    match action {
        ConfigAction::Show { .. } => {}
        ConfigAction::Toggle { effect, off } => config.filters.set(effect, !off),
        ConfigAction::Watermark {
            uri,
            location,
            margin,
            size_fraction,
            clear,
        } => {
            if let Some(margin) = margin {
                if !margin.is_finite() || margin < 0.0 {
                    bail!("margin must be a non-negative number of pixels");
                }
                config.watermark.margin_px = margin;
            }
            if let Some(fraction) = size_fraction {
                if !(fraction > 0.0 && fraction <= 1.0) {
                    bail!("size fraction must be in (0, 1]");
                }
                config.watermark.size_fraction = fraction;
            }
            if let Some(location) = location {
                config.watermark.location = location;
            }
            if clear {
                config.watermark.uri = None;
            } else if uri.is_some() {
                config.watermark.uri = uri;
            }
        }
        ConfigAction::Background {
            uri,
            scale_mode,
            clear,
        } => {
            if let Some(mode) = scale_mode {
                config.background.scale_mode = mode;
            }
            if clear {
                config.background.uri = None;
            } else if uri.is_some() {
                config.background.uri = uri;
            }
        }
    }
    Ok(())
}

fn describe(store: &ConfigStore, config: &EffectsConfig) -> String {
    let mut out = String::new();
    let _ = writeln!(out, "config: {}", store.path().display());
    for effect in Effect::ALL {
        let state = if config.filters.is_enabled(effect) {
            "on"
        } else {
            "off"
        };
        let _ = writeln!(out, "  {:<20} {}", effect.name(), state);
    }
    let _ = writeln!(
        out,
        "watermark: {} at {} (margin {}px, size {})",
        config.watermark.uri.as_deref().unwrap_or("<none>"),
        config.watermark.location.as_str(),
        config.watermark.margin_px,
        config.watermark.size_fraction,
    );
    let _ = writeln!(
        out,
        "background: {} ({})",
        config.background.uri.as_deref().unwrap_or("<none>"),
        config.background.scale_mode.as_str(),
    );
    out
}
