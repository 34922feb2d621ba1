// Copyright (c) 2025 Steven Rosenthal smr@dt3.org
// See LICENSE file in root directory for license terms.

use std::collections::VecDeque;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use canonical_error::{CanonicalError, invalid_argument_error, unavailable_error};
use image::{Rgb, RgbImage};
use imageproc::drawing::{draw_filled_circle_mut, draw_filled_rect_mut};
use imageproc::filter::gaussian_blur_f32;
use imageproc::rect::Rect;
use log::debug;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use vigil_elements::frame_source_trait::{BrightnessMode, FrameSource};
use vigil_elements::quality::score_frame;

// Focus setting at which the simulated optics are sharpest.
const BEST_FOCUS: u8 = 50;

/// One entry of a scripted capture sequence.
pub enum ScriptedCapture {
    Frame(RgbImage),
    Fault(String),
}

struct SimState {
    script: VecDeque<ScriptedCapture>,
    capture_delay: Duration,
    capture_count: u64,
}

/// Deterministic stand-in for the camera. With an empty script, every
/// capture renders the base scene through the requested brightness mode and
/// focus; tests push scripted frames and faults to drive exact sequences.
/// Honors the same dimension and error contract as real capture hardware.
#[derive(Clone)]
pub struct SimulatedFrameSource {
    base: Arc<RgbImage>,
    state: Arc<std::sync::Mutex<SimState>>,
}

impl SimulatedFrameSource {
    /// A synthetic bench scene: corner fiducial, center part, color patch,
    /// plus a fixed-seed noise floor so frames are not pathologically flat.
    pub fn new(width: u32, height: u32) -> Self {
        let mut img = RgbImage::from_pixel(width, height, Rgb([24, 24, 24]));
        let mut rng = StdRng::seed_from_u64(0x5EED);
        for p in img.pixels_mut() {
            let n: i16 = rng.gen_range(-6..=6);
            let v = (24 + n).clamp(0, 255) as u8;
            *p = Rgb([v, v, v]);
        }
        let w = width as i32;
        let h = height as i32;
        draw_filled_rect_mut(
            &mut img, Rect::at(w / 16, h / 16).of_size(width / 8, height / 8),
            Rgb([220, 220, 220]));
        draw_filled_circle_mut(
            &mut img, (w / 2, h / 2), (h / 5).max(1), Rgb([250, 250, 250]));
        draw_filled_rect_mut(
            &mut img,
            Rect::at(w * 3 / 4, h / 8).of_size(width / 8, height / 8),
            Rgb([43, 200, 43]));
        Self::with_base_frame(img)
    }

    pub fn with_base_frame(base: RgbImage) -> Self {
        SimulatedFrameSource {
            base: Arc::new(base),
            state: Arc::new(std::sync::Mutex::new(SimState {
                script: VecDeque::new(),
                capture_delay: Duration::ZERO,
                capture_count: 0,
            })),
        }
    }

    /// Appends a frame or fault to be returned by upcoming captures, in
    /// push order. When the script runs dry, captures render the base scene.
    pub fn push_scripted(&self, capture: ScriptedCapture) {
        self.state.lock().unwrap().script.push_back(capture);
    }

    /// Makes every capture block for `delay`, emulating exposure/readout.
    pub fn set_capture_delay(&self, delay: Duration) {
        self.state.lock().unwrap().capture_delay = delay;
    }

    pub fn capture_count(&self) -> u64 {
        self.state.lock().unwrap().capture_count
    }

    fn render(&self, mode: BrightnessMode, focus: u8) -> RgbImage {
        let mut frame = (*self.base).clone();
        match mode {
            BrightnessMode::Normal => (),
            BrightnessMode::Hdr => {
                // Tone-compress toward the highlights.
                for p in frame.pixels_mut() {
                    for c in &mut p.0 {
                        *c = (255.0 * (*c as f64 / 255.0).powf(0.7))
                            .round() as u8;
                    }
                }
            },
            BrightnessMode::HighGain => {
                for p in frame.pixels_mut() {
                    for c in &mut p.0 {
                        *c = ((*c as f64) * 1.6).min(255.0) as u8;
                    }
                }
            },
        }
        let sigma = (focus as i32 - BEST_FOCUS as i32).abs() as f32 / 15.0;
        if sigma > 0.1 {
            frame = gaussian_blur_f32(&frame, sigma);
        }
        frame
    }
}

#[async_trait]
impl FrameSource for SimulatedFrameSource {
    async fn capture(&self, mode: BrightnessMode, focus: u8)
                     -> Result<RgbImage, CanonicalError> {
        let (scripted, delay) = {
            let mut state = self.state.lock().unwrap();
            state.capture_count += 1;
            (state.script.pop_front(), state.capture_delay)
        };
        if delay > Duration::ZERO {
            tokio::time::sleep(delay).await;
        }
        match scripted {
            Some(ScriptedCapture::Fault(message)) =>
                Err(unavailable_error(&message)),
            Some(ScriptedCapture::Frame(frame)) => Ok(frame),
            None => Ok(self.render(mode, focus)),
        }
    }

    fn dimensions(&self) -> (u32, u32) {
        self.base.dimensions()
    }

    async fn auto_optimize(&self, mode: BrightnessMode)
                           -> Result<u8, CanonicalError> {
        let mut best_focus = 0_u8;
        let mut best_sharpness = f64::NEG_INFINITY;
        for focus in (0..=100_u8).step_by(5) {
            let sharpness = score_frame(&self.render(mode, focus)).sharpness;
            if sharpness > best_sharpness {
                best_sharpness = sharpness;
                best_focus = focus;
            }
        }
        debug!("Focus sweep: best focus {} (sharpness {:.1})",
               best_focus, best_sharpness);
        Ok(best_focus)
    }
}

/// Serves a fixed image from disk as the capture source; the bench
/// configuration for developing against recorded scenes.
pub struct ImageFrameSource {
    image: RgbImage,
}

impl ImageFrameSource {
    pub fn from_path(path: &Path) -> Result<Self, CanonicalError> {
        let image = image::open(path)
            .map_err(|e| invalid_argument_error(
                &format!("Cannot load {}: {}", path.display(), e)))?
            .to_rgb8();
        Ok(ImageFrameSource { image })
    }
}

#[async_trait]
impl FrameSource for ImageFrameSource {
    async fn capture(&self, _mode: BrightnessMode, _focus: u8)
                     -> Result<RgbImage, CanonicalError> {
        Ok(self.image.clone())
    }

    fn dimensions(&self) -> (u32, u32) {
        self.image.dimensions()
    }

    async fn auto_optimize(&self, _mode: BrightnessMode)
                           -> Result<u8, CanonicalError> {
        // A static image has no optics to sweep.
        Ok(BEST_FOCUS)
    }
}

// mod tests.
