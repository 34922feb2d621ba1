// Copyright (c) 2025 Steven Rosenthal smr@dt3.org
// See LICENSE file in root directory for license terms.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use canonical_error::{CanonicalError, invalid_argument_error, unavailable_error};
use log::info;
use rppal::gpio::{Gpio, OutputPin};

use vigil_elements::output_bank_trait::OutputBank;

// BCM pins used for OUT1..OUT8 unless overridden on the command line.
pub const DEFAULT_OUTPUT_PINS: [u8; 8] = [5, 6, 13, 16, 19, 20, 21, 26];

// Pulse bookkeeping shared by both bank implementations. `set()` records the
// base level; each pulse takes a fresh epoch and only the newest pulse
// restores the base level, so overlapping pulses extend the high period.
struct PulseGuard {
    base_level: AtomicBool,
    epoch: AtomicU64,
}

impl PulseGuard {
    fn new() -> Self {
        PulseGuard {
            base_level: AtomicBool::new(false),
            epoch: AtomicU64::new(0),
        }
    }

    fn begin_pulse(&self) -> u64 {
        self.epoch.fetch_add(1, Ordering::AcqRel) + 1
    }

    // Returns the level to restore, or None if a newer pulse owns the line.
    fn end_pulse(&self, my_epoch: u64) -> Option<bool> {
        if self.epoch.load(Ordering::Acquire) == my_epoch {
            Some(self.base_level.load(Ordering::Acquire))
        } else {
            None
        }
    }
}

fn check_line(line: usize, num_lines: usize) -> Result<(), CanonicalError> {
    if line >= num_lines {
        return Err(invalid_argument_error(
            &format!("Output line {} out of range 0..{}", line, num_lines)));
    }
    Ok(())
}

struct SimInner {
    guards: Vec<PulseGuard>,
    levels: std::sync::Mutex<Vec<bool>>,
    journal: std::sync::Mutex<Vec<(usize, bool)>>,
    fault: AtomicBool,
}

/// In-memory output bank. Records every drive in a journal so tests can
/// assert on the exact actuation sequence.
#[derive(Clone)]
pub struct SimOutputBank {
    inner: Arc<SimInner>,
}

impl SimOutputBank {
    pub fn new(num_lines: usize) -> Self {
        SimOutputBank {
            inner: Arc::new(SimInner {
                guards: (0..num_lines).map(|_| PulseGuard::new()).collect(),
                levels: std::sync::Mutex::new(vec![false; num_lines]),
                journal: std::sync::Mutex::new(Vec::new()),
                fault: AtomicBool::new(false),
            }),
        }
    }

    /// Makes subsequent set()/pulse() calls fail, emulating a driver fault.
    pub fn set_fault(&self, fault: bool) {
        self.inner.fault.store(fault, Ordering::Relaxed);
    }

    pub fn journal(&self) -> Vec<(usize, bool)> {
        self.inner.journal.lock().unwrap().clone()
    }

    fn write(&self, line: usize, level: bool) {
        self.inner.levels.lock().unwrap()[line] = level;
        self.inner.journal.lock().unwrap().push((line, level));
    }

    fn check_fault(&self) -> Result<(), CanonicalError> {
        if self.inner.fault.load(Ordering::Relaxed) {
            return Err(unavailable_error("Output driver fault"));
        }
        Ok(())
    }
}

#[async_trait]
impl OutputBank for SimOutputBank {
    fn num_lines(&self) -> usize {
        self.inner.guards.len()
    }

    async fn set(&self, line: usize, level: bool) -> Result<(), CanonicalError> {
        check_line(line, self.num_lines())?;
        self.check_fault()?;
        self.inner.guards[line].base_level.store(level, Ordering::Release);
        self.write(line, level);
        Ok(())
    }

    async fn pulse(&self, line: usize, duration: Duration)
                   -> Result<(), CanonicalError> {
        check_line(line, self.num_lines())?;
        self.check_fault()?;
        let my_epoch = self.inner.guards[line].begin_pulse();
        self.write(line, true);
        tokio::time::sleep(duration).await;
        if let Some(level) = self.inner.guards[line].end_pulse(my_epoch) {
            self.write(line, level);
        }
        Ok(())
    }

    async fn read_states(&self) -> Vec<bool> {
        self.inner.levels.lock().unwrap().clone()
    }
}

struct GpioLine {
    pin: std::sync::Mutex<OutputPin>,
    guard: PulseGuard,
}

impl GpioLine {
    fn write(&self, level: bool) {
        let mut pin = self.pin.lock().unwrap();
        if level {
            pin.set_high();
        } else {
            pin.set_low();
        }
    }
}

/// Output bank on Raspberry Pi GPIO. Lines are claimed at construction and
/// driven low; they are released (and revert per the GPIO driver) on drop.
pub struct GpioOutputBank {
    lines: Arc<Vec<GpioLine>>,
}

impl GpioOutputBank {
    pub fn new(bcm_pins: &[u8]) -> Result<Self, CanonicalError> {
        let gpio = Gpio::new().map_err(|e| unavailable_error(
            &format!("Failed to initialize GPIO: {:?}", e)))?;
        let mut lines = Vec::with_capacity(bcm_pins.len());
        for &bcm in bcm_pins {
            let pin = gpio.get(bcm)
                .map_err(|e| unavailable_error(
                    &format!("Failed to claim GPIO {}: {:?}", bcm, e)))?
                .into_output_low();
            lines.push(GpioLine {
                pin: std::sync::Mutex::new(pin),
                guard: PulseGuard::new(),
            });
        }
        info!("Claimed {} GPIO output lines: {:?}", lines.len(), bcm_pins);
        Ok(GpioOutputBank { lines: Arc::new(lines) })
    }
}

#[async_trait]
impl OutputBank for GpioOutputBank {
    fn num_lines(&self) -> usize {
        self.lines.len()
    }

    async fn set(&self, line: usize, level: bool) -> Result<(), CanonicalError> {
        check_line(line, self.num_lines())?;
        let gpio_line = &self.lines[line];
        gpio_line.guard.base_level.store(level, Ordering::Release);
        gpio_line.write(level);
        Ok(())
    }

    async fn pulse(&self, line: usize, duration: Duration)
                   -> Result<(), CanonicalError> {
        check_line(line, self.num_lines())?;
        let gpio_line = &self.lines[line];
        let my_epoch = gpio_line.guard.begin_pulse();
        gpio_line.write(true);
        tokio::time::sleep(duration).await;
        if let Some(level) = gpio_line.guard.end_pulse(my_epoch) {
            gpio_line.write(level);
        }
        Ok(())
    }

    async fn read_states(&self) -> Vec<bool> {
        self.lines.iter()
            .map(|l| l.pin.lock().unwrap().is_set_high())
            .collect()
    }
}

// mod tests.
