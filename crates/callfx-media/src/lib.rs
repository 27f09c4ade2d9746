//! Frame effects for callfx.
//!
//! Captured frames run through a [`FrameEffectsPipeline`] (ordered filters,
//! gated by an [`EffectsSnapshot`]) under a latest-frame-wins
//! [`FrameScheduler`]. [`SizeConstrainedEncoder`] bounds image payloads to a
//! byte budget.

#![forbid(unsafe_code)]

pub mod draw;
pub mod encoder;
pub mod filters;
pub mod font;
pub mod frame;
pub mod inference;
pub mod pipeline;
pub mod scheduler;
pub mod settings;

pub use encoder::{EncodedImage, EncoderConfig, SizeConstrainedEncoder};
pub use filters::Filter;
pub use frame::{Resolution, VideoFrame};
pub use inference::{ModelBackend, StaticBackend, UnavailableBackend};
pub use pipeline::{FrameEffectsPipeline, PipelineConfig};
pub use scheduler::{FrameScheduler, FrameSubmitter, SchedulerStats};
pub use settings::{EffectsConfigHandle, EffectsSnapshot};
