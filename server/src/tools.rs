// Copyright (c) 2025 Steven Rosenthal smr@dt3.org
// See LICENSE file in root directory for license terms.

use canonical_error::{CanonicalError, failed_precondition_error};
use image::{GrayImage, RgbImage};
use log::warn;

use vigil_elements::image_ops::{
    canny, count_nonzero, crop, crop_gray, hu_distance, hu_moments,
    otsu_threshold, template_correlate, threshold_mask, to_gray, to_hsv};
use vigil_elements::program::{ColorHint, ToolConfig, ToolKind, Verdict};

// Hu-moment distances at or beyond this count as a total shape mismatch.
// Tune against labeled part images, not by eye.
pub const MAX_HU_DISTANCE: f64 = 20.0;

/// Features extracted from the master image, one variant per tool kind.
pub enum ToolFeatures {
    Outline(OutlineFeatures),
    Area(AreaFeatures),
    ColorArea(ColorAreaFeatures),
    EdgeCount(EdgeCountFeatures),
    PositionAdjust(PositionFeatures),
}

pub struct OutlineFeatures {
    // Canny mask of the master region; doubles as the correlation template.
    pub edge_mask: GrayImage,
    pub hu: [f64; 7],
}

pub struct AreaFeatures {
    // Otsu level frozen at configuration time. Recomputing per frame would
    // mask exactly the drift this tool exists to detect.
    pub threshold: u8,
    pub master_area: u64,
}

/// Inclusive HSV acceptance bounds. Hue wraps modulo 180.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct HsvBounds {
    pub h_lo: u8,
    pub h_hi: u8,
    pub s_lo: u8,
    pub s_hi: u8,
    pub v_lo: u8,
    pub v_hi: u8,
}

impl HsvBounds {
    pub fn around(center: (u8, u8, u8)) -> Self {
        let (h, s, v) = center;
        HsvBounds {
            h_lo: (h as i32 - 15).rem_euclid(180) as u8,
            h_hi: (h as i32 + 15).rem_euclid(180) as u8,
            s_lo: (s as i32 - 40).clamp(0, 255) as u8,
            s_hi: (s as i32 + 40).clamp(0, 255) as u8,
            v_lo: (v as i32 - 40).clamp(0, 255) as u8,
            v_hi: (v as i32 + 40).clamp(0, 255) as u8,
        }
    }

    pub fn contains(&self, h: u8, s: u8, v: u8) -> bool {
        let hue_ok = if self.h_lo <= self.h_hi {
            h >= self.h_lo && h <= self.h_hi
        } else {
            // Wrapped interval, e.g. reds around hue 0.
            h >= self.h_lo || h <= self.h_hi
        };
        hue_ok && s >= self.s_lo && s <= self.s_hi &&
            v >= self.v_lo && v <= self.v_hi
    }
}

pub struct ColorAreaFeatures {
    pub bounds: HsvBounds,
    pub master_color_pixels: u64,
}

pub struct EdgeCountFeatures {
    pub master_edge_pixels: u64,
}

pub struct PositionFeatures {
    // Master region grayscale, matched inside the runtime search window.
    pub template: GrayImage,
}

/// Outcome of one tool evaluation on one frame.
#[derive(Clone, Debug)]
pub struct ToolEvaluation {
    pub matching_rate: f64,
    pub verdict: Verdict,

    /// Populated by position-adjust tools: the detected translation of the
    /// scene relative to the master, in pixels.
    pub offset: Option<(i32, i32)>,

    pub diagnostics: String,
}

impl ToolEvaluation {
    fn failed(reason: &str) -> Self {
        ToolEvaluation {
            matching_rate: 0.0,
            verdict: Verdict::Ng,
            offset: None,
            diagnostics: reason.to_string(),
        }
    }
}

enum ToolState {
    Configured(ToolFeatures),
    FailedToConfigure(String),
}

/// A tool bound to the features extracted from its master region. Feature
/// extraction happens once at program load; a tool whose extraction failed
/// stays loaded but evaluates to a 0% NG until it is reconfigured.
pub struct ConfiguredTool {
    pub config: ToolConfig,
    state: ToolState,
}

impl ConfiguredTool {
    pub fn configure(config: ToolConfig, master: &RgbImage) -> Self {
        let state = match extract_features(&config, master) {
            Ok(features) => ToolState::Configured(features),
            Err(e) => {
                warn!("Tool {} ({}) failed to configure: {}",
                      config.id, config.name, e.message);
                ToolState::FailedToConfigure(e.message.clone())
            },
        };
        ConfiguredTool { config, state }
    }

    pub fn is_configured(&self) -> bool {
        matches!(self.state, ToolState::Configured(_))
    }

    pub fn configure_failure(&self) -> Option<&str> {
        match &self.state {
            ToolState::FailedToConfigure(reason) => Some(reason),
            _ => None,
        }
    }

    /// Evaluates the tool on `frame` with its region shifted by `offset`.
    /// Never fails; problems surface as an NG evaluation with diagnostics.
    pub fn evaluate(&self, frame: &RgbImage, offset: (i32, i32)) -> ToolEvaluation {
        let features = match &self.state {
            ToolState::Configured(features) => features,
            ToolState::FailedToConfigure(reason) => {
                return ToolEvaluation::failed(
                    &format!("not configured: {}", reason));
            },
        };
        match features {
            ToolFeatures::Outline(f) => self.evaluate_outline(f, frame, offset),
            ToolFeatures::Area(f) => self.evaluate_area(f, frame, offset),
            ToolFeatures::ColorArea(f) => self.evaluate_color_area(f, frame, offset),
            ToolFeatures::EdgeCount(f) => self.evaluate_edge_count(f, frame, offset),
            ToolFeatures::PositionAdjust(f) => self.evaluate_position(f, frame),
        }
    }

    fn judge(&self, matching_rate: f64) -> Verdict {
        let ok = match self.config.upper_limit {
            Some(upper) =>
                matching_rate >= self.config.threshold && matching_rate <= upper,
            None => matching_rate >= self.config.threshold,
        };
        if ok { Verdict::Ok } else { Verdict::Ng }
    }

    fn runtime_region(&self, frame: &RgbImage, offset: (i32, i32))
                      -> Result<RgbImage, CanonicalError> {
        let roi = self.config.roi.shifted_clamped(
            offset.0, offset.1, frame.dimensions());
        crop(frame, roi.x, roi.y, roi.w, roi.h)
    }

    fn evaluate_outline(&self, features: &OutlineFeatures, frame: &RgbImage,
                        offset: (i32, i32)) -> ToolEvaluation {
        let region = match self.runtime_region(frame, offset) {
            Ok(r) => r,
            Err(e) => return ToolEvaluation::failed(&e.message),
        };
        let test_mask = canny(&to_gray(&region),
                              self.config.canny_low, self.config.canny_high);
        if count_nonzero(&test_mask) == 0 {
            return ToolEvaluation {
                matching_rate: 0.0,
                verdict: self.judge(0.0),
                offset: None,
                diagnostics: "no edges in region".to_string(),
            };
        }
        let test_hu = hu_moments(&test_mask);
        let distance = hu_distance(&features.hu, &test_hu);
        let hu_rate = 100.0 * (1.0 - distance / MAX_HU_DISTANCE).max(0.0);

        // Hu moments tolerate scale/rotation but ignore position; template
        // correlation anchors position but is brittle to deformation. Blend
        // them so neither failure mode dominates.
        let correlation = match template_correlate(&test_mask, &features.edge_mask) {
            Ok((_, _, score)) => score,
            Err(e) => return ToolEvaluation::failed(&e.message),
        };
        let matching_rate = 0.5 * hu_rate + 0.5 * 100.0 * correlation;
        ToolEvaluation {
            matching_rate,
            verdict: self.judge(matching_rate),
            offset: None,
            diagnostics: format!("hu distance {:.3}, correlation {:.3}",
                                 distance, correlation),
        }
    }

    fn evaluate_area(&self, features: &AreaFeatures, frame: &RgbImage,
                     offset: (i32, i32)) -> ToolEvaluation {
        let region = match self.runtime_region(frame, offset) {
            Ok(r) => r,
            Err(e) => return ToolEvaluation::failed(&e.message),
        };
        let mask = threshold_mask(&to_gray(&region), features.threshold);
        let test_area = count_nonzero(&mask);
        let matching_rate = symmetric_ratio(test_area, features.master_area);
        ToolEvaluation {
            matching_rate,
            verdict: self.judge(matching_rate),
            offset: None,
            diagnostics: format!("area {} vs master {}",
                                 test_area, features.master_area),
        }
    }

    fn evaluate_color_area(&self, features: &ColorAreaFeatures, frame: &RgbImage,
                           offset: (i32, i32)) -> ToolEvaluation {
        let region = match self.runtime_region(frame, offset) {
            Ok(r) => r,
            Err(e) => return ToolEvaluation::failed(&e.message),
        };
        let test_pixels = count_in_bounds(&region, &features.bounds);
        let matching_rate =
            (100.0 * test_pixels as f64 / features.master_color_pixels as f64)
            .min(100.0);
        ToolEvaluation {
            matching_rate,
            verdict: self.judge(matching_rate),
            offset: None,
            diagnostics: format!("color pixels {} vs master {}",
                                 test_pixels, features.master_color_pixels),
        }
    }

    fn evaluate_edge_count(&self, features: &EdgeCountFeatures, frame: &RgbImage,
                           offset: (i32, i32)) -> ToolEvaluation {
        let region = match self.runtime_region(frame, offset) {
            Ok(r) => r,
            Err(e) => return ToolEvaluation::failed(&e.message),
        };
        let mask = canny(&to_gray(&region),
                         self.config.canny_low, self.config.canny_high);
        let test_edges = count_nonzero(&mask);
        let matching_rate = symmetric_ratio(test_edges, features.master_edge_pixels);
        ToolEvaluation {
            matching_rate,
            verdict: self.judge(matching_rate),
            offset: None,
            diagnostics: format!("edge pixels {} vs master {}",
                                 test_edges, features.master_edge_pixels),
        }
    }

    fn evaluate_position(&self, features: &PositionFeatures, frame: &RgbImage)
                         -> ToolEvaluation {
        let (fw, fh) = frame.dimensions();
        let roi = &self.config.roi;
        let margin = self.config.search_margin;

        // Search window: the master region grown by the margin on every
        // side, clipped to the frame.
        let x0 = roi.x.saturating_sub(margin);
        let y0 = roi.y.saturating_sub(margin);
        let x1 = (roi.x + roi.w + margin).min(fw);
        let y1 = (roi.y + roi.h + margin).min(fh);
        let search = match crop_gray(&to_gray(frame), x0, y0, x1 - x0, y1 - y0) {
            Ok(s) => s,
            Err(e) => return ToolEvaluation::failed(&e.message),
        };
        let (mx, my, score) =
            match template_correlate(&search, &features.template)
        {
            Ok(result) => result,
            Err(e) => return ToolEvaluation::failed(&e.message),
        };
        let dx = x0 as i32 + mx - roi.x as i32;
        let dy = y0 as i32 + my - roi.y as i32;
        let matching_rate = 100.0 * score;
        ToolEvaluation {
            matching_rate,
            verdict: self.judge(matching_rate),
            offset: Some((dx, dy)),
            diagnostics: format!("offset ({}, {}), score {:.3}", dx, dy, score),
        }
    }
}

/// Extracts a tool's master features. Errors here put the tool into the
/// failed state: the program still loads, but the tool judges NG until it
/// is reconfigured with a usable master region.
pub fn extract_features(config: &ToolConfig, master: &RgbImage)
                        -> Result<ToolFeatures, CanonicalError> {
    let roi = &config.roi;
    let region = crop(master, roi.x, roi.y, roi.w, roi.h)?;
    match config.kind {
        ToolKind::Outline => {
            let edge_mask = canny(&to_gray(&region),
                                  config.canny_low, config.canny_high);
            if count_nonzero(&edge_mask) == 0 {
                // A zero-variance template has no usable correlation peak.
                return Err(failed_precondition_error(
                    "Master region contains no edges"));
            }
            let hu = hu_moments(&edge_mask);
            Ok(ToolFeatures::Outline(OutlineFeatures { edge_mask, hu }))
        },
        ToolKind::Area => {
            let (threshold, mask) = otsu_threshold(&to_gray(&region));
            let master_area = count_nonzero(&mask);
            Ok(ToolFeatures::Area(AreaFeatures { threshold, master_area }))
        },
        ToolKind::ColorArea => {
            let center = match config.color_hint {
                ColorHint::Explicit { h, s, v } => (h, s, v),
                ColorHint::None | ColorHint::Auto => median_hsv(&region),
            };
            let bounds = HsvBounds::around(center);
            let master_color_pixels = count_in_bounds(&region, &bounds);
            if master_color_pixels == 0 {
                return Err(failed_precondition_error(
                    &format!("Master region has no pixels near HSV \
                              ({}, {}, {})", center.0, center.1, center.2)));
            }
            Ok(ToolFeatures::ColorArea(ColorAreaFeatures {
                bounds, master_color_pixels }))
        },
        ToolKind::EdgeCount => {
            let mask = canny(&to_gray(&region),
                             config.canny_low, config.canny_high);
            Ok(ToolFeatures::EdgeCount(EdgeCountFeatures {
                master_edge_pixels: count_nonzero(&mask) }))
        },
        ToolKind::PositionAdjust => {
            Ok(ToolFeatures::PositionAdjust(PositionFeatures {
                template: to_gray(&region) }))
        },
    }
}

/// Per-channel median HSV of a region.
fn median_hsv(region: &RgbImage) -> (u8, u8, u8) {
    let hsv = to_hsv(region);
    let mut h: Vec<u8> = Vec::with_capacity(hsv.pixels().len());
    let mut s: Vec<u8> = Vec::with_capacity(hsv.pixels().len());
    let mut v: Vec<u8> = Vec::with_capacity(hsv.pixels().len());
    for p in hsv.pixels() {
        h.push(p.0[0]);
        s.push(p.0[1]);
        v.push(p.0[2]);
    }
    let median = |values: &mut Vec<u8>| -> u8 {
        values.sort_unstable();
        values[values.len() / 2]
    };
    (median(&mut h), median(&mut s), median(&mut v))
}

fn count_in_bounds(region: &RgbImage, bounds: &HsvBounds) -> u64 {
    let hsv = to_hsv(region);
    hsv.pixels()
        .filter(|p| bounds.contains(p.0[0], p.0[1], p.0[2]))
        .count() as u64
}

/// 100·min/max, with an empty/empty pair counting as a perfect match.
fn symmetric_ratio(a: u64, b: u64) -> f64 {
    if a == 0 && b == 0 {
        return 100.0;
    }
    100.0 * a.min(b) as f64 / a.max(b) as f64
}

#[cfg(test)]
mod tests {
    extern crate approx;
    use approx::assert_abs_diff_eq;
    use image::Rgb;
    use imageproc::drawing::{draw_filled_circle_mut, draw_filled_rect_mut};
    use imageproc::rect::Rect;
    use vigil_elements::program::Roi;
    use super::*;

    // 640x480 scene translated by (dx, dy): a corner marker for position
    // adjustment, a centered disk for area/outline work, and a green square
    // for color work.
    fn scene(dx: i32, dy: i32) -> RgbImage {
        let mut img = RgbImage::from_pixel(640, 480, Rgb([10, 10, 10]));
        draw_filled_rect_mut(
            &mut img, Rect::at(30 + dx, 30 + dy).of_size(40, 40),
            Rgb([230, 230, 230]));
        draw_filled_circle_mut(
            &mut img, (50 + dx, 50 + dy), 12, Rgb([20, 20, 20]));
        draw_filled_circle_mut(
            &mut img, (320 + dx, 240 + dy), 100, Rgb([255, 255, 255]));
        // Green square with HSV approximately (60, 200, 200).
        draw_filled_rect_mut(
            &mut img, Rect::at(480 + dx, 60 + dy).of_size(100, 100),
            Rgb([43, 200, 43]));
        img
    }

    // Green square scene with an adjustable hue, saturation/value fixed at
    // 200. `hue` is in the halved 0..=179 convention.
    fn hue_square(hue: u8) -> RgbImage {
        let h_deg = hue as f64 * 2.0;
        let v = 200.0_f64;
        let s = 200.0_f64 / 255.0;
        let c = v * s;
        let x = c * (1.0 - ((h_deg / 60.0) % 2.0 - 1.0).abs());
        let m = v - c;
        let (r, g, b) = match h_deg as u32 {
            0..=59 => (c, x, 0.0),
            60..=119 => (x, c, 0.0),
            120..=179 => (0.0, c, x),
            180..=239 => (0.0, x, c),
            240..=299 => (x, 0.0, c),
            _ => (c, 0.0, x),
        };
        let px = Rgb([(r + m).round() as u8,
                      (g + m).round() as u8,
                      (b + m).round() as u8]);
        let mut img = RgbImage::from_pixel(200, 200, Rgb([10, 10, 10]));
        draw_filled_rect_mut(&mut img, Rect::at(40, 40).of_size(120, 120), px);
        img
    }

    #[test]
    fn test_area_tool_identical_frames() {
        let master = scene(0, 0);
        let config = ToolConfig::new(
            1, ToolKind::Area, "disk area", Roi::new(200, 140, 240, 200), 65.0);
        let tool = ConfiguredTool::configure(config, &master);
        assert!(tool.is_configured());

        let eval = tool.evaluate(&master, (0, 0));
        assert_eq!(eval.matching_rate, 100.0);
        assert_eq!(eval.verdict, Verdict::Ok);
    }

    #[test]
    fn test_area_tool_detects_shrunk_disk() {
        let master = scene(0, 0);
        let mut test = RgbImage::from_pixel(640, 480, Rgb([10, 10, 10]));
        draw_filled_circle_mut(&mut test, (320, 240), 50, Rgb([255, 255, 255]));
        let config = ToolConfig::new(
            1, ToolKind::Area, "disk area", Roi::new(200, 140, 240, 200), 65.0);
        let tool = ConfiguredTool::configure(config, &master);

        let eval = tool.evaluate(&test, (0, 0));
        // Quarter the area: symmetric ratio near 25%.
        assert!(eval.matching_rate < 30.0);
        assert_eq!(eval.verdict, Verdict::Ng);
    }

    #[test]
    fn test_color_area_tolerates_small_hue_drift() {
        let master = hue_square(60);
        let config = ToolConfig::new(
            1, ToolKind::ColorArea, "green", Roi::new(40, 40, 120, 120), 85.0);
        let tool = ConfiguredTool::configure(config, &master);
        assert!(tool.is_configured());

        let eval = tool.evaluate(&hue_square(70), (0, 0));
        assert!(eval.matching_rate >= 85.0);
        assert_eq!(eval.verdict, Verdict::Ok);
    }

    #[test]
    fn test_color_area_self_match() {
        let master = hue_square(60);
        let config = ToolConfig::new(
            1, ToolKind::ColorArea, "green", Roi::new(40, 40, 120, 120), 85.0);
        let tool = ConfiguredTool::configure(config, &master);
        let eval = tool.evaluate(&master, (0, 0));
        // HSV rounding can cost a fraction of a percent, no more.
        assert_abs_diff_eq!(eval.matching_rate, 100.0, epsilon = 0.5);
        assert_eq!(eval.verdict, Verdict::Ok);
    }

    #[test]
    fn test_color_area_rejects_large_hue_drift() {
        let master = hue_square(60);
        let config = ToolConfig::new(
            1, ToolKind::ColorArea, "green", Roi::new(40, 40, 120, 120), 85.0);
        let tool = ConfiguredTool::configure(config, &master);

        let eval = tool.evaluate(&hue_square(85), (0, 0));
        assert!(eval.matching_rate <= 30.0);
        assert_eq!(eval.verdict, Verdict::Ng);
    }

    #[test]
    fn test_color_area_zero_master_pixels_fails_configure() {
        // Explicit green hint over a region with nothing green in it.
        let master = RgbImage::from_pixel(200, 200, Rgb([10, 10, 10]));
        let mut config = ToolConfig::new(
            1, ToolKind::ColorArea, "green", Roi::new(40, 40, 120, 120), 85.0);
        config.color_hint = ColorHint::Explicit { h: 60, s: 200, v: 200 };
        let tool = ConfiguredTool::configure(config, &master);
        assert!(!tool.is_configured());
        assert!(tool.configure_failure().is_some());

        let eval = tool.evaluate(&master, (0, 0));
        assert_eq!(eval.matching_rate, 0.0);
        assert_eq!(eval.verdict, Verdict::Ng);
    }

    #[test]
    fn test_outline_tool_identical_frames() {
        let master = scene(0, 0);
        let config = ToolConfig::new(
            1, ToolKind::Outline, "disk outline",
            Roi::new(200, 140, 240, 200), 80.0);
        let tool = ConfiguredTool::configure(config, &master);
        assert!(tool.is_configured());

        let eval = tool.evaluate(&master, (0, 0));
        assert!(eval.matching_rate > 99.5);
        assert_eq!(eval.verdict, Verdict::Ok);
    }

    #[test]
    fn test_outline_tool_blank_master_fails_configure() {
        let master = RgbImage::from_pixel(640, 480, Rgb([10, 10, 10]));
        let config = ToolConfig::new(
            1, ToolKind::Outline, "outline", Roi::new(200, 140, 240, 200), 80.0);
        let tool = ConfiguredTool::configure(config, &master);
        assert!(!tool.is_configured());
    }

    #[test]
    fn test_edge_count_tool_identical_frames() {
        let master = scene(0, 0);
        let config = ToolConfig::new(
            1, ToolKind::EdgeCount, "edges", Roi::new(200, 140, 240, 200), 70.0);
        let tool = ConfiguredTool::configure(config, &master);

        let eval = tool.evaluate(&master, (0, 0));
        assert_eq!(eval.matching_rate, 100.0);
        assert_eq!(eval.verdict, Verdict::Ok);
    }

    #[test]
    fn test_position_tool_reports_shift_and_chains_offset() {
        let master = scene(0, 0);
        let test = scene(7, -4);

        let position_config = ToolConfig::new(
            1, ToolKind::PositionAdjust, "locate", Roi::new(10, 10, 80, 80),
            70.0);
        let position = ConfiguredTool::configure(position_config, &master);
        assert!(position.is_configured());

        let eval = position.evaluate(&test, (0, 0));
        assert_eq!(eval.offset, Some((7, -4)));
        assert!(eval.matching_rate >= 90.0);
        assert_eq!(eval.verdict, Verdict::Ok);

        // The downstream area tool evaluated at the detected offset should
        // see essentially the master content.
        let area_config = ToolConfig::new(
            2, ToolKind::Area, "disk area", Roi::new(300, 200, 100, 100), 90.0);
        let area = ConfiguredTool::configure(area_config, &master);
        let area_eval = area.evaluate(&test, eval.offset.unwrap());
        assert!(area_eval.matching_rate >= 98.0);

        // Without the offset the shifted disk is judged against the wrong
        // pixels and the rate drops.
        let unshifted = area.evaluate(&test, (0, 0));
        assert!(unshifted.matching_rate < area_eval.matching_rate);
    }

    #[test]
    fn test_position_tool_self_match_is_centered() {
        let master = scene(0, 0);
        let config = ToolConfig::new(
            1, ToolKind::PositionAdjust, "locate", Roi::new(10, 10, 80, 80),
            70.0);
        let tool = ConfiguredTool::configure(config, &master);
        let eval = tool.evaluate(&master, (0, 0));
        assert_eq!(eval.offset, Some((0, 0)));
        assert!(eval.matching_rate > 99.0);
    }

    #[test]
    fn test_upper_limit_window() {
        let master = scene(0, 0);
        let mut config = ToolConfig::new(
            1, ToolKind::Area, "windowed", Roi::new(200, 140, 240, 200), 60.0);
        config.upper_limit = Some(99.0);
        let tool = ConfiguredTool::configure(config, &master);

        // Perfect match exceeds the upper limit, so the window judges NG.
        let eval = tool.evaluate(&master, (0, 0));
        assert_eq!(eval.matching_rate, 100.0);
        assert_eq!(eval.verdict, Verdict::Ng);
    }

    #[test]
    fn test_hsv_bounds_wrap() {
        let bounds = HsvBounds::around((5, 200, 200));
        assert_eq!(bounds.h_lo, 170);
        assert_eq!(bounds.h_hi, 20);
        assert!(bounds.contains(175, 200, 200));
        assert!(bounds.contains(10, 200, 200));
        assert!(!bounds.contains(90, 200, 200));
    }

    #[test]
    fn test_symmetric_ratio() {
        assert_eq!(symmetric_ratio(0, 0), 100.0);
        assert_eq!(symmetric_ratio(0, 10), 0.0);
        assert_eq!(symmetric_ratio(50, 100), 50.0);
        assert_eq!(symmetric_ratio(100, 50), 50.0);
    }
}  // mod tests.
