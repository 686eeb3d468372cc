use core::fmt;

use serde::{Deserialize, Serialize};

/// Pixel formats encountered across platforms.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[non_exhaustive]
pub enum PixelFormat {
    /// Flexible YUV 4:2:0: one luma plane and two quarter-size chroma planes,
    /// each with its own row and pixel stride.
    Yuv420,
    /// Four bytes per pixel, red first.
    Rgba8,
}

/// Pixel dimensions of a frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Resolution {
    pub width: u32,
    pub height: u32,
}

impl Resolution {
    pub const fn new(width: u32, height: u32) -> Self {
        Resolution { width, height }
    }

    /// Number of luma samples.
    pub const fn pixel_count(&self) -> usize {
        self.width as usize * self.height as usize
    }

    /// L1 distance to the requested dimensions.
    pub fn distance_to(&self, width: u32, height: u32) -> u64 {
        u64::from(self.width.abs_diff(width)) + u64::from(self.height.abs_diff(height))
    }
}

impl fmt::Display for Resolution {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}x{}", self.width, self.height)
    }
}

/// Direction a camera faces relative to the device screen.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LensFacing {
    #[default]
    Back,
    Front,
    External,
}

impl fmt::Display for LensFacing {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Back => "back-facing",
            Self::Front => "front-facing",
            Self::External => "external",
        })
    }
}

/// Pick the supported size closest to the requested dimensions.
///
/// Closeness is `|w - width| + |h - height|`. On ties the candidate that
/// appears first wins, so callers control preference through ordering.
pub fn select_resolution(
    candidates: &[Resolution],
    width: u32,
    height: u32,
) -> Option<Resolution> {
    candidates
        .iter()
        .copied()
        .min_by_key(|r| r.distance_to(width, height))
}
