// Copyright (c) 2025 Steven Rosenthal smr@dt3.org
// See LICENSE file in root directory for license terms.

use medians::Medianf64;
use rolling_stats;
use statistical;

/// Distribution of recent cycle latencies (bounded window).
#[derive(Clone, Debug, Default)]
pub struct WindowStats {
    pub min: f64,
    pub max: f64,
    pub mean: f64,
    pub stddev: f64,
    pub median: Option<f64>,
}

/// Aggregates since engine start (or the last reset).
#[derive(Clone, Debug, Default)]
pub struct SessionStats {
    pub min: f64,
    pub max: f64,
    pub mean: f64,
    pub stddev: f64,
    pub count: u64,
}

#[derive(Clone, Debug, Default)]
pub struct LatencySnapshot {
    pub recent: WindowStats,
    pub session: SessionStats,
}

/// Accumulates per-cycle latency samples (seconds). The recent window is a
/// fixed-capacity ring; session aggregates roll forever.
pub struct LatencyAccumulator {
    snapshot: LatencySnapshot,

    window: Vec<f64>,
    window_start: usize,
    window_capacity: usize,

    rolling: rolling_stats::Stats<f64>,
}

impl LatencyAccumulator {
    pub fn new(window_capacity: usize) -> Self {
        assert!(window_capacity > 0);
        LatencyAccumulator {
            snapshot: LatencySnapshot::default(),
            window: Vec::with_capacity(window_capacity),
            window_start: 0,
            window_capacity,
            rolling: rolling_stats::Stats::<f64>::new(),
        }
    }

    pub fn add_sample(&mut self, seconds: f64) {
        if self.window.len() < self.window_capacity {
            self.window.push(seconds);
        } else {
            self.window[self.window_start] = seconds;
            self.window_start = (self.window_start + 1) % self.window_capacity;
        }
        self.rolling.update(seconds);

        let recent = &mut self.snapshot.recent;
        let values = self.window.as_slice();
        recent.min = *values.iter().min_by(|a, b| a.total_cmp(b)).unwrap();
        recent.max = *values.iter().max_by(|a, b| a.total_cmp(b)).unwrap();
        recent.mean = statistical::mean(values);
        if values.len() > 1 {
            recent.stddev =
                statistical::standard_deviation(values, Some(recent.mean));
        }
        recent.median = Some(values.medf_unchecked());

        let session = &mut self.snapshot.session;
        session.min = self.rolling.min;
        session.max = self.rolling.max;
        session.mean = self.rolling.mean;
        session.stddev = self.rolling.std_dev;
        session.count += 1;
    }

    pub fn snapshot(&self) -> LatencySnapshot {
        self.snapshot.clone()
    }

    pub fn reset_session(&mut self) {
        self.snapshot.session = SessionStats::default();
        self.rolling = rolling_stats::Stats::<f64>::new();
    }
}

// mod tests.
