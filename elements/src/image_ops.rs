// Copyright (c) 2025 Steven Rosenthal smr@dt3.org
// See LICENSE file in root directory for license terms.

use canonical_error::{CanonicalError, invalid_argument_error};
use image::{GrayImage, Rgb, RgbImage};
use image::imageops;
use imageproc::edges;
use imageproc::contrast::otsu_level;
use imageproc::filter::laplacian_filter;
use imageproc::template_matching::{MatchTemplateMethod, match_template};

/// An RGB-shaped buffer whose channels hold (H, S, V). Hue is in 0..=179
/// (degrees halved, as 8 bits cannot hold 0..360), saturation and value are
/// 0..=255.
pub type HsvImage = RgbImage;

/// Returns the rectangular subregion of `frame`. The region must lie fully
/// within the frame.
pub fn crop(frame: &RgbImage, x: u32, y: u32, w: u32, h: u32)
            -> Result<RgbImage, CanonicalError> {
    check_bounds(frame.width(), frame.height(), x, y, w, h)?;
    Ok(imageops::crop_imm(frame, x, y, w, h).to_image())
}

/// Grayscale variant of crop().
pub fn crop_gray(image: &GrayImage, x: u32, y: u32, w: u32, h: u32)
                 -> Result<GrayImage, CanonicalError> {
    check_bounds(image.width(), image.height(), x, y, w, h)?;
    Ok(imageops::crop_imm(image, x, y, w, h).to_image())
}

fn check_bounds(fw: u32, fh: u32, x: u32, y: u32, w: u32, h: u32)
                -> Result<(), CanonicalError> {
    if w == 0 || h == 0 {
        return Err(invalid_argument_error(
            &format!("Empty crop region {}x{}", w, h)));
    }
    if x.checked_add(w).map_or(true, |r| r > fw) ||
        y.checked_add(h).map_or(true, |b| b > fh)
    {
        return Err(invalid_argument_error(
            &format!("Crop region {},{} {}x{} exceeds image {}x{}",
                     x, y, w, h, fw, fh)));
    }
    Ok(())
}

pub fn to_gray(frame: &RgbImage) -> GrayImage {
    imageops::grayscale(frame)
}

/// RGB to 8-bit HSV, hue halved into 0..=179.
pub fn to_hsv(frame: &RgbImage) -> HsvImage {
    let mut hsv = HsvImage::new(frame.width(), frame.height());
    for (src, dst) in frame.pixels().zip(hsv.pixels_mut()) {
        *dst = Rgb(rgb_to_hsv(src.0));
    }
    hsv
}

fn rgb_to_hsv(rgb: [u8; 3]) -> [u8; 3] {
    let r = rgb[0] as f64;
    let g = rgb[1] as f64;
    let b = rgb[2] as f64;
    let max = r.max(g).max(b);
    let min = r.min(g).min(b);
    let delta = max - min;

    let v = max;
    let s = if max > 0.0 { 255.0 * delta / max } else { 0.0 };
    let h_deg = if delta == 0.0 {
        0.0
    } else if max == r {
        60.0 * (((g - b) / delta) % 6.0)
    } else if max == g {
        60.0 * ((b - r) / delta + 2.0)
    } else {
        60.0 * ((r - g) / delta + 4.0)
    };
    let h_deg = if h_deg < 0.0 { h_deg + 360.0 } else { h_deg };
    let h = ((h_deg / 2.0).round() as u32).min(179) as u8;
    [h, s.round().min(255.0) as u8, v.round().min(255.0) as u8]
}

/// Binary edge map of `gray` using the Canny detector.
pub fn canny(gray: &GrayImage, low: f32, high: f32) -> GrayImage {
    edges::canny(gray, low, high)
}

/// Computes the Otsu threshold of `gray` and the corresponding binary mask
/// (pixels at or above the threshold are 255).
pub fn otsu_threshold(gray: &GrayImage) -> (u8, GrayImage) {
    let level = otsu_level(gray);
    (level, threshold_mask(gray, level))
}

/// Mask of pixels at or above `level`.
pub fn threshold_mask(gray: &GrayImage, level: u8) -> GrayImage {
    let mut mask = GrayImage::new(gray.width(), gray.height());
    for (src, dst) in gray.pixels().zip(mask.pixels_mut()) {
        dst.0[0] = if src.0[0] >= level { 255 } else { 0 };
    }
    mask
}

pub fn count_nonzero(mask: &GrayImage) -> u64 {
    mask.pixels().filter(|p| p.0[0] > 0).count() as u64
}

/// Finds the best placement of `template` within `search` by normalized
/// cross-correlation. Returns the template's top-left offset within `search`
/// and the unit-scaled peak score. Ties go to the first (row-major) peak so
/// the result is deterministic.
pub fn template_correlate(search: &GrayImage, template: &GrayImage)
                          -> Result<(i32, i32, f64), CanonicalError> {
    if template.width() > search.width() || template.height() > search.height() {
        return Err(invalid_argument_error(
            &format!("Template {}x{} exceeds search region {}x{}",
                     template.width(), template.height(),
                     search.width(), search.height())));
    }
    let scores = match_template(
        search, template, MatchTemplateMethod::CrossCorrelationNormalized);
    let mut best_x = 0_u32;
    let mut best_y = 0_u32;
    let mut best_score = f32::NEG_INFINITY;
    for (x, y, p) in scores.enumerate_pixels() {
        let score = p.0[0];
        if score.is_finite() && score > best_score {
            best_score = score;
            best_x = x;
            best_y = y;
        }
    }
    if !best_score.is_finite() {
        // Zero-variance template or search content; no meaningful peak.
        return Ok((0, 0, 0.0));
    }
    Ok((best_x as i32, best_y as i32, (best_score as f64).clamp(0.0, 1.0)))
}

/// Variance of the Laplacian response; a focus/sharpness proxy.
pub fn laplacian_variance(gray: &GrayImage) -> f64 {
    let lap = laplacian_filter(gray);
    let n = (lap.width() * lap.height()) as f64;
    if n == 0.0 {
        return 0.0;
    }
    let mut sum = 0.0_f64;
    for p in lap.pixels() {
        sum += p.0[0] as f64;
    }
    let mean = sum / n;
    let mut sum_sq = 0.0_f64;
    for p in lap.pixels() {
        let d = p.0[0] as f64 - mean;
        sum_sq += d * d;
    }
    sum_sq / n
}

/// The seven Hu moment invariants of a binary mask (nonzero pixels have unit
/// weight). All zeros if the mask is empty.
pub fn hu_moments(mask: &GrayImage) -> [f64; 7] {
    // Raw moments.
    let mut m00 = 0.0_f64;
    let mut m10 = 0.0_f64;
    let mut m01 = 0.0_f64;
    for (x, y, p) in mask.enumerate_pixels() {
        if p.0[0] > 0 {
            m00 += 1.0;
            m10 += x as f64;
            m01 += y as f64;
        }
    }
    if m00 == 0.0 {
        return [0.0; 7];
    }
    let cx = m10 / m00;
    let cy = m01 / m00;

    // Central moments up to third order.
    let mut mu = [[0.0_f64; 4]; 4];
    for (x, y, p) in mask.enumerate_pixels() {
        if p.0[0] > 0 {
            let dx = x as f64 - cx;
            let dy = y as f64 - cy;
            let dx2 = dx * dx;
            let dy2 = dy * dy;
            mu[2][0] += dx2;
            mu[1][1] += dx * dy;
            mu[0][2] += dy2;
            mu[3][0] += dx2 * dx;
            mu[2][1] += dx2 * dy;
            mu[1][2] += dx * dy2;
            mu[0][3] += dy2 * dy;
        }
    }

    // Scale-normalized moments.
    let norm = |p: usize, q: usize| -> f64 {
        mu[p][q] / m00.powf(1.0 + (p + q) as f64 / 2.0)
    };
    let n20 = norm(2, 0);
    let n11 = norm(1, 1);
    let n02 = norm(0, 2);
    let n30 = norm(3, 0);
    let n21 = norm(2, 1);
    let n12 = norm(1, 2);
    let n03 = norm(0, 3);

    [
        n20 + n02,
        (n20 - n02).powi(2) + 4.0 * n11.powi(2),
        (n30 - 3.0 * n12).powi(2) + (3.0 * n21 - n03).powi(2),
        (n30 + n12).powi(2) + (n21 + n03).powi(2),
        (n30 - 3.0 * n12) * (n30 + n12) *
            ((n30 + n12).powi(2) - 3.0 * (n21 + n03).powi(2)) +
            (3.0 * n21 - n03) * (n21 + n03) *
            (3.0 * (n30 + n12).powi(2) - (n21 + n03).powi(2)),
        (n20 - n02) * ((n30 + n12).powi(2) - (n21 + n03).powi(2)) +
            4.0 * n11 * (n30 + n12) * (n21 + n03),
        (3.0 * n21 - n03) * (n30 + n12) *
            ((n30 + n12).powi(2) - 3.0 * (n21 + n03).powi(2)) -
            (n30 - 3.0 * n12) * (n21 + n03) *
            (3.0 * (n30 + n12).powi(2) - (n21 + n03).powi(2)),
    ]
}

/// Sign-preserving log-magnitude comparison of two Hu moment vectors. Terms
/// where either magnitude underflows are skipped.
pub fn hu_distance(a: &[f64; 7], b: &[f64; 7]) -> f64 {
    const EPS: f64 = 1e-12;
    let mut distance = 0.0;
    for i in 0..7 {
        let (ma, mb) = (a[i].abs(), b[i].abs());
        if ma > EPS && mb > EPS {
            let la = a[i].signum() * ma.log10();
            let lb = b[i].signum() * mb.log10();
            distance += (la - lb).abs();
        }
    }
    distance
}

#[cfg(test)]
mod tests {
    extern crate approx;
    use approx::assert_abs_diff_eq;
    use image::Luma;
    use imageproc::drawing::draw_filled_circle_mut;
    use super::*;

    fn disk_image(width: u32, height: u32, cx: i32, cy: i32, radius: i32)
                  -> RgbImage {
        let mut img = RgbImage::new(width, height);
        draw_filled_circle_mut(&mut img, (cx, cy), radius, Rgb([255, 255, 255]));
        img
    }

    #[test]
    fn test_crop_bounds() {
        let img = RgbImage::new(100, 80);
        assert!(crop(&img, 10, 10, 50, 50).is_ok());
        assert!(crop(&img, 60, 10, 50, 50).is_err());
        assert!(crop(&img, 0, 0, 100, 81).is_err());
        assert!(crop(&img, 0, 0, 0, 10).is_err());
    }

    #[test]
    fn test_rgb_to_hsv_primaries() {
        assert_eq!(rgb_to_hsv([255, 0, 0]), [0, 255, 255]);
        assert_eq!(rgb_to_hsv([0, 255, 0]), [60, 255, 255]);
        assert_eq!(rgb_to_hsv([0, 0, 255]), [120, 255, 255]);
        assert_eq!(rgb_to_hsv([0, 0, 0]), [0, 0, 0]);
        assert_eq!(rgb_to_hsv([128, 128, 128]), [0, 0, 128]);
    }

    #[test]
    fn test_otsu_threshold_bimodal() {
        let mut gray = GrayImage::new(64, 64);
        for (x, _y, p) in gray.enumerate_pixels_mut() {
            p.0[0] = if x < 32 { 20 } else { 220 };
        }
        let (level, mask) = otsu_threshold(&gray);
        assert!(level > 20 && level <= 220);
        assert_eq!(count_nonzero(&mask), 32 * 64);
    }

    #[test]
    fn test_template_correlate_identity() {
        let img = to_gray(&disk_image(80, 80, 40, 40, 20));
        let (dx, dy, score) = template_correlate(&img, &img).unwrap();
        assert_eq!((dx, dy), (0, 0));
        assert_abs_diff_eq!(score, 1.0, epsilon = 1e-6);
    }

    #[test]
    fn test_template_correlate_finds_shift() {
        let scene = to_gray(&disk_image(200, 200, 107, 96, 25));
        // Template taken around the disk at its unshifted position.
        let template = crop_gray(
            &to_gray(&disk_image(200, 200, 100, 100, 25)), 70, 70, 60, 60)
            .unwrap();
        let (dx, dy, score) = template_correlate(&scene, &template).unwrap();
        // Peak should land where the disk actually is: (70+7, 70-4).
        assert_eq!((dx, dy), (77, 66));
        assert!(score > 0.9);
    }

    #[test]
    fn test_template_correlate_rejects_oversized_template() {
        let search = GrayImage::new(10, 10);
        let template = GrayImage::new(20, 20);
        assert!(template_correlate(&search, &template).is_err());
    }

    #[test]
    fn test_laplacian_variance_orders_sharpness() {
        let flat = GrayImage::from_pixel(64, 64, Luma([128]));
        let mut textured = GrayImage::new(64, 64);
        for (x, y, p) in textured.enumerate_pixels_mut() {
            p.0[0] = if (x + y) % 2 == 0 { 0 } else { 255 };
        }
        assert_eq!(laplacian_variance(&flat), 0.0);
        assert!(laplacian_variance(&textured) > 100.0);
    }

    #[test]
    fn test_hu_moments_translation_invariant() {
        let a = to_gray(&disk_image(200, 200, 60, 60, 30));
        let b = to_gray(&disk_image(200, 200, 130, 120, 30));
        let hu_a = hu_moments(&threshold_mask(&a, 128));
        let hu_b = hu_moments(&threshold_mask(&b, 128));
        assert_abs_diff_eq!(hu_distance(&hu_a, &hu_b), 0.0, epsilon = 0.05);
    }

    #[test]
    fn test_hu_moments_distinguish_shapes() {
        let disk = to_gray(&disk_image(200, 200, 100, 100, 40));
        let mut bar = GrayImage::new(200, 200);
        for (x, y, p) in bar.enumerate_pixels_mut() {
            if y >= 95 && y < 105 && x >= 20 && x < 180 {
                p.0[0] = 255;
            }
        }
        let hu_disk = hu_moments(&threshold_mask(&disk, 128));
        let hu_bar = hu_moments(&bar);
        assert!(hu_distance(&hu_disk, &hu_bar) > 0.5);
    }

    #[test]
    fn test_hu_moments_empty_mask() {
        let empty = GrayImage::new(32, 32);
        assert_eq!(hu_moments(&empty), [0.0; 7]);
    }
}  // mod tests.
