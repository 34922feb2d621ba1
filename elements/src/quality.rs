// Copyright (c) 2025 Steven Rosenthal smr@dt3.org
// See LICENSE file in root directory for license terms.

use image::RgbImage;

use crate::image_ops::{laplacian_variance, to_gray};

/// Scalar quality components of a single frame, each in 0..=100.
#[derive(Clone, Copy, Debug, Default)]
pub struct QualityScore {
    pub brightness: f64,
    pub sharpness: f64,
    pub exposure: f64,
    pub overall: f64,
}

/// Outcome of comparing a master frame against a runtime frame. `issues`
/// block inspection (the frames are not comparable at all); `warnings` are
/// advisory only.
#[derive(Clone, Debug, Default)]
pub struct ConsistencyReport {
    pub consistent: bool,
    pub issues: Vec<String>,
    pub warnings: Vec<String>,
}

// Pixels at or above this count as blown highlights; at or below the low
// bound, crushed shadows.
const HIGHLIGHT_CLIP: u8 = 250;
const SHADOW_CLIP: u8 = 5;

pub fn score_frame(frame: &RgbImage) -> QualityScore {
    let gray = to_gray(frame);
    let n = (gray.width() * gray.height()) as f64;

    let mut sum = 0.0_f64;
    let mut high = 0_u64;
    let mut low = 0_u64;
    for p in gray.pixels() {
        let v = p.0[0];
        sum += v as f64;
        if v > HIGHLIGHT_CLIP {
            high += 1;
        } else if v < SHADOW_CLIP {
            low += 1;
        }
    }
    let mean = sum / n;

    let brightness = (100.0 * (1.0 - (mean - 125.0).abs() / 125.0)).max(0.0);
    let sharpness = (laplacian_variance(&gray) / 5.0).min(100.0);
    let exposure = 100.0 * (1.0 - high as f64 / n - low as f64 / n);
    let overall = 0.3 * brightness + 0.5 * sharpness + 0.2 * exposure;
    QualityScore { brightness, sharpness, exposure, overall }
}

/// Compares a master frame against a runtime frame. Mismatched dimensions
/// make the frames incomparable; brightness drift, sharpness drift and low
/// overall quality only produce warnings.
pub fn compare_frames(master: &RgbImage, test: &RgbImage) -> ConsistencyReport {
    let mut report = ConsistencyReport { consistent: true, ..Default::default() };
    if master.dimensions() != test.dimensions() {
        report.consistent = false;
        report.issues.push(format!(
            "Frame dimensions {}x{} do not match master {}x{}",
            test.width(), test.height(), master.width(), master.height()));
        return report;
    }

    let master_gray = to_gray(master);
    let test_gray = to_gray(test);
    let mean = |g: &image::GrayImage| -> f64 {
        let n = (g.width() * g.height()) as f64;
        g.pixels().map(|p| p.0[0] as f64).sum::<f64>() / n
    };
    let master_mean = mean(&master_gray);
    let test_mean = mean(&test_gray);
    if (master_mean - test_mean).abs() > 0.2 * master_mean {
        report.warnings.push(format!(
            "Mean brightness drift: master {:.1}, frame {:.1}",
            master_mean, test_mean));
    }

    let master_sharpness = laplacian_variance(&master_gray);
    let test_sharpness = laplacian_variance(&test_gray);
    if master_sharpness > 0.0 {
        let ratio = test_sharpness / master_sharpness;
        if !(0.7..=1.3).contains(&ratio) {
            report.warnings.push(format!(
                "Sharpness ratio {:.2} outside [0.70, 1.30]", ratio));
        }
    }

    let master_score = score_frame(master);
    let test_score = score_frame(test);
    if master_score.overall < 50.0 {
        report.warnings.push(format!(
            "Master overall quality {:.1} below 50", master_score.overall));
    }
    if test_score.overall < 50.0 {
        report.warnings.push(format!(
            "Frame overall quality {:.1} below 50", test_score.overall));
    }
    report
}

// mod tests.
