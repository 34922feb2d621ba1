// Copyright (c) 2025 Steven Rosenthal smr@dt3.org
// See LICENSE file in root directory for license terms.

use std::path::PathBuf;

use canonical_error::{CanonicalError, invalid_argument_error};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Number of physical output lines on this product.
pub const NUM_OUTPUT_LINES: usize = 8;

/// Maximum tools per program, position-adjust included.
pub const MAX_TOOLS: usize = 16;

pub const DEFAULT_CANNY_LOW: f32 = 50.0;
pub const DEFAULT_CANNY_HIGH: f32 = 150.0;
pub const DEFAULT_SEARCH_MARGIN: u32 = 50;

/// Binary inspection outcome, for a single tool or a whole program.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Verdict {
    Ok,
    Ng,
}

/// Axis-aligned rectangle in master-frame coordinates.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Roi {
    pub x: u32,
    pub y: u32,
    pub w: u32,
    pub h: u32,
}

impl Roi {
    pub fn new(x: u32, y: u32, w: u32, h: u32) -> Self {
        Roi { x, y, w, h }
    }

    pub fn validate(&self, dims: (u32, u32)) -> Result<(), CanonicalError> {
        let (fw, fh) = dims;
        if self.w == 0 || self.h == 0 {
            return Err(invalid_argument_error(
                &format!("Region {}x{} is empty", self.w, self.h)));
        }
        if self.x.checked_add(self.w).map_or(true, |r| r > fw) ||
            self.y.checked_add(self.h).map_or(true, |b| b > fh)
        {
            return Err(invalid_argument_error(
                &format!("Region {},{} {}x{} exceeds frame {}x{}",
                         self.x, self.y, self.w, self.h, fw, fh)));
        }
        Ok(())
    }

    /// Translates by (dx, dy), clamping each axis so the region stays within
    /// a frame of the given dimensions. The size is preserved.
    pub fn shifted_clamped(&self, dx: i32, dy: i32, dims: (u32, u32)) -> Roi {
        let (fw, fh) = dims;
        let max_x = fw.saturating_sub(self.w) as i64;
        let max_y = fh.saturating_sub(self.h) as i64;
        let x = (self.x as i64 + dx as i64).clamp(0, max_x) as u32;
        let y = (self.y as i64 + dy as i64).clamp(0, max_y) as u32;
        Roi { x, y, w: self.w, h: self.h }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ToolKind {
    Outline,
    Area,
    ColorArea,
    EdgeCount,
    PositionAdjust,
}

/// How a color-area tool picks its HSV center. `None` and `Auto` both derive
/// the center from the master region's median; `Explicit` supplies it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "mode", rename_all = "snake_case")]
pub enum ColorHint {
    None,
    Auto,
    Explicit { h: u8, s: u8, v: u8 },
}

impl Default for ColorHint {
    fn default() -> Self {
        ColorHint::Auto
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolConfig {
    /// Unique within the program; stable across edits.
    pub id: u32,
    pub kind: ToolKind,
    pub name: String,
    pub roi: Roi,

    /// Minimum matching rate (percent) for an OK verdict.
    pub threshold: f64,

    /// If set, matching rates above this are also NG (window judgment).
    #[serde(default)]
    pub upper_limit: Option<f64>,

    #[serde(default)]
    pub color_hint: ColorHint,

    // Edge detector parameters for outline and edge-count tools.
    #[serde(default = "default_canny_low")]
    pub canny_low: f32,
    #[serde(default = "default_canny_high")]
    pub canny_high: f32,

    /// Half-width of the search border around a position-adjust region.
    #[serde(default = "default_search_margin")]
    pub search_margin: u32,
}

fn default_canny_low() -> f32 {
    DEFAULT_CANNY_LOW
}
fn default_canny_high() -> f32 {
    DEFAULT_CANNY_HIGH
}
fn default_search_margin() -> u32 {
    DEFAULT_SEARCH_MARGIN
}

impl ToolConfig {
    pub fn new(id: u32, kind: ToolKind, name: &str, roi: Roi, threshold: f64)
               -> Self {
        ToolConfig {
            id,
            kind,
            name: name.to_string(),
            roi,
            threshold,
            upper_limit: None,
            color_hint: ColorHint::default(),
            canny_low: DEFAULT_CANNY_LOW,
            canny_high: DEFAULT_CANNY_HIGH,
            search_margin: DEFAULT_SEARCH_MARGIN,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TriggerMode {
    Internal,
    External,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TriggerSettings {
    pub mode: TriggerMode,

    /// Cycle period for internal triggering, 1..=10000.
    #[serde(default = "default_interval_ms")]
    pub interval_ms: u32,

    /// Capture delay after an external edge, 0..=1000.
    #[serde(default)]
    pub delay_ms: u32,
}

fn default_interval_ms() -> u32 {
    1000
}

impl Default for TriggerSettings {
    fn default() -> Self {
        TriggerSettings {
            mode: TriggerMode::Internal,
            interval_ms: default_interval_ms(),
            delay_ms: 0,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct CaptureSettings {
    pub brightness_mode: crate::frame_source_trait::BrightnessMode,

    /// 0..=100.
    pub focus: u8,
}

impl Default for CaptureSettings {
    fn default() -> Self {
        CaptureSettings {
            brightness_mode: crate::frame_source_trait::BrightnessMode::Normal,
            focus: 50,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OutputAssignment {
    AlwaysOn,
    AlwaysOff,
    Ok,
    Ng,
    NotUsed,
}

/// Assignment of each OUT line, index 0 = OUT1.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct OutputMapping(pub [OutputAssignment; NUM_OUTPUT_LINES]);

impl Default for OutputMapping {
    fn default() -> Self {
        OutputMapping([OutputAssignment::NotUsed; NUM_OUTPUT_LINES])
    }
}

/// The configurable portion of a program; everything except the id,
/// timestamps and master-image placement managed by the store.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProgramConfig {
    pub name: String,
    #[serde(default)]
    pub trigger: TriggerSettings,
    #[serde(default)]
    pub capture: CaptureSettings,
    #[serde(default)]
    pub tools: Vec<ToolConfig>,
    #[serde(default)]
    pub outputs: OutputMapping,
}

/// A persisted program. Immutable while an inspection engine holds it;
/// edits go through the store and take effect on the next load.
#[derive(Debug, Clone, PartialEq)]
pub struct ProgramRecord {
    pub id: i64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub config: ProgramConfig,

    /// Canonical lossless master image, relative to the data root.
    pub master_path: PathBuf,
}

/// Checks every program invariant against the master dimensions. Programs
/// that fail any check are rejected at the store boundary.
pub fn validate_program(config: &ProgramConfig, dims: (u32, u32))
                        -> Result<(), CanonicalError> {
    if config.name.trim().is_empty() {
        return Err(invalid_argument_error("Program name must not be empty"));
    }
    match config.trigger.mode {
        TriggerMode::Internal => {
            if !(1..=10000).contains(&config.trigger.interval_ms) {
                return Err(invalid_argument_error(
                    &format!("interval_ms {} outside 1..=10000",
                             config.trigger.interval_ms)));
            }
        },
        TriggerMode::External => {
            if config.trigger.delay_ms > 1000 {
                return Err(invalid_argument_error(
                    &format!("delay_ms {} outside 0..=1000",
                             config.trigger.delay_ms)));
            }
        },
    }
    if config.capture.focus > 100 {
        return Err(invalid_argument_error(
            &format!("focus {} outside 0..=100", config.capture.focus)));
    }
    if config.tools.len() > MAX_TOOLS {
        return Err(invalid_argument_error(
            &format!("{} tools exceeds the maximum of {}",
                     config.tools.len(), MAX_TOOLS)));
    }

    let mut seen_ids = std::collections::HashSet::new();
    for (index, tool) in config.tools.iter().enumerate() {
        if !seen_ids.insert(tool.id) {
            return Err(invalid_argument_error(
                &format!("Duplicate tool id {}", tool.id)));
        }
        if tool.kind == ToolKind::PositionAdjust && index != 0 {
            return Err(invalid_argument_error(
                "A position-adjust tool must be the first tool"));
        }
        validate_tool(tool, dims)?;
    }
    Ok(())
}

fn validate_tool(tool: &ToolConfig, dims: (u32, u32))
                 -> Result<(), CanonicalError> {
    tool.roi.validate(dims)?;
    if !(0.0..=100.0).contains(&tool.threshold) {
        return Err(invalid_argument_error(
            &format!("Tool {}: threshold {} outside 0..=100",
                     tool.id, tool.threshold)));
    }
    if let Some(upper) = tool.upper_limit {
        if upper <= tool.threshold || upper > 100.0 {
            return Err(invalid_argument_error(
                &format!("Tool {}: upper limit {} must be within ({}, 100]",
                         tool.id, upper, tool.threshold)));
        }
    }
    match tool.kind {
        ToolKind::Outline | ToolKind::EdgeCount => {
            if tool.canny_low <= 0.0 || tool.canny_high <= tool.canny_low {
                return Err(invalid_argument_error(
                    &format!("Tool {}: edge thresholds ({}, {}) must satisfy \
                              0 < low < high",
                             tool.id, tool.canny_low, tool.canny_high)));
            }
        },
        ToolKind::PositionAdjust => {
            let (fw, fh) = dims;
            let margin = tool.search_margin;
            if margin == 0 {
                return Err(invalid_argument_error(
                    &format!("Tool {}: search margin must be nonzero", tool.id)));
            }
            if tool.roi.w + 2 * margin > fw || tool.roi.h + 2 * margin > fh {
                return Err(invalid_argument_error(
                    &format!("Tool {}: region {}x{} plus search margin {} \
                              does not fit within frame {}x{}",
                             tool.id, tool.roi.w, tool.roi.h, margin, fw, fh)));
            }
        },
        _ => (),
    }
    Ok(())
}

// mod tests.
