use image::RgbaImage;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub struct Resolution {
    pub width: u32,
    pub height: u32,
}

impl Resolution {
    pub fn of(image: &RgbaImage) -> Self {
        Self {
            width: image.width(),
            height: image.height(),
        }
    }

    pub fn min_side(&self) -> u32 {
        self.width.min(self.height)
    }

    pub fn max_side(&self) -> u32 {
        self.width.max(self.height)
    }
}

/// A captured (or processed) RGBA video frame.
#[derive(Debug, Clone, PartialEq)]
pub struct VideoFrame {
    pub timestamp_us: u64,
    pub image: RgbaImage,
}

impl VideoFrame {
    pub fn new(timestamp_us: u64, image: RgbaImage) -> Self {
        Self {
            timestamp_us,
            image,
        }
    }

    pub fn resolution(&self) -> Resolution {
        Resolution::of(&self.image)
    }
}
