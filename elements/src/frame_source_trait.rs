// Copyright (c) 2025 Steven Rosenthal smr@dt3.org
// See LICENSE file in root directory for license terms.

use async_trait::async_trait;
use canonical_error::CanonicalError;
use image::RgbImage;

/// Illumination/readout regime requested for a capture.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BrightnessMode {
    Normal,
    Hdr,
    HighGain,
}

/// Abstract capture surface. Implementations must return frames of stable
/// dimensions for the lifetime of the source; the inspection engine fails
/// fast if a frame's dimensions diverge from the registered master.
#[async_trait]
pub trait FrameSource {
    /// Blocks until a frame is available. `focus` is 0..=100.
    /// Errors:
    ///   Unavailable: the capture hardware faulted; the caller may retry on
    ///     a later cycle.
    async fn capture(&self, mode: BrightnessMode, focus: u8)
                     -> Result<RgbImage, CanonicalError>;

    /// The (width, height) of frames this source produces.
    fn dimensions(&self) -> (u32, u32);

    /// Sweeps the focus setting, maximizing frame sharpness, and returns the
    /// best focus value found. Not part of the inspection cycle; used when
    /// setting up a program.
    async fn auto_optimize(&self, mode: BrightnessMode)
                           -> Result<u8, CanonicalError>;
}
