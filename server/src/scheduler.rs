// Copyright (c) 2025 Steven Rosenthal smr@dt3.org
// See LICENSE file in root directory for license terms.

use std::sync::Arc;

use canonical_error::{CanonicalError, failed_precondition_error};
use log::{info, warn};
use tokio::sync::broadcast;

use vigil_elements::frame_source_trait::FrameSource;
use vigil_elements::output_bank_trait::OutputBank;

use crate::inspect_engine::{Counters, InspectionEngine, InspectionResult};
use crate::program_store::ProgramStore;

// Per-subscriber queue depth. A subscriber that falls further behind than
// this loses its oldest results rather than stalling the inspection loop.
const RESULT_QUEUE_CAPACITY: usize = 64;

#[derive(Clone, Debug, Default)]
pub struct SchedulerStatus {
    pub running: bool,
    pub program_id: Option<i64>,
    pub counters: Counters,
    pub fatal: Option<String>,
}

/// A live feed of inspection results, in cycle order. Dropping the
/// subscription unsubscribes. Results lost to overflow are counted in
/// `dropped`.
pub struct ResultSubscription {
    rx: broadcast::Receiver<InspectionResult>,
    pub dropped: u64,
}

impl ResultSubscription {
    /// The next result, in cycle_seq order. None once the scheduler is gone.
    pub async fn next(&mut self) -> Option<InspectionResult> {
        loop {
            match self.rx.recv().await {
                Ok(result) => return Some(result),
                Err(broadcast::error::RecvError::Lagged(n)) => {
                    self.dropped += n;
                    warn!("Subscriber lagged; dropped {} results (total {})",
                          n, self.dropped);
                },
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    }
}

struct RunningInspection {
    program_id: i64,
    engine: InspectionEngine,
}

/// Coordinates inspection runs: at most one engine holds the frame source
/// at a time, start/stop are serialized, and per-cycle results fan out to
/// subscribers without ever blocking the engine.
pub struct Scheduler {
    store: Arc<ProgramStore>,
    frame_source: Arc<tokio::sync::Mutex<Box<dyn FrameSource + Send>>>,
    output_bank: Arc<tokio::sync::Mutex<Box<dyn OutputBank + Send>>>,
    result_tx: broadcast::Sender<InspectionResult>,
    running: tokio::sync::Mutex<Option<RunningInspection>>,
}

impl Scheduler {
    pub fn new(store: Arc<ProgramStore>,
               frame_source: Arc<tokio::sync::Mutex<Box<dyn FrameSource + Send>>>,
               output_bank: Arc<tokio::sync::Mutex<Box<dyn OutputBank + Send>>>)
               -> Self {
        let (result_tx, _) = broadcast::channel(RESULT_QUEUE_CAPACITY);
        Scheduler {
            store,
            frame_source,
            output_bank,
            result_tx,
            running: tokio::sync::Mutex::new(None),
        }
    }

    /// Loads the program (master from disk, feature extraction) and begins
    /// cycling. Fails if another program currently holds the frame source.
    pub async fn start(&self, program_id: i64) -> Result<(), CanonicalError> {
        let mut running = self.running.lock().await;
        if let Some(current) = running.as_ref() {
            if !current.engine.is_done() {
                return Err(failed_precondition_error(
                    &format!("Program {} is already running",
                             current.program_id)));
            }
        }
        // Any previous engine died (engine-fatal error); clear it.
        *running = None;
        let record = self.store.get(program_id)?;
        let master = self.store.load_master(&record)?;
        let mut engine = InspectionEngine::load(
            record, master, self.frame_source.clone(),
            self.output_bank.clone(), self.result_tx.clone())?;
        engine.start();
        info!("Scheduler: started program {}", program_id);
        *running = Some(RunningInspection { program_id, engine });
        Ok(())
    }

    /// Signals the running engine and waits for its in-flight cycle to
    /// finish. The frame source and output bank are released on return.
    pub async fn stop(&self) -> Result<(), CanonicalError> {
        let mut running = self.running.lock().await;
        match running.take() {
            Some(mut current) => {
                current.engine.stop();
                info!("Scheduler: stopped program {}", current.program_id);
                Ok(())
            },
            None => Err(failed_precondition_error("No inspection is running")),
        }
    }

    pub async fn status(&self) -> SchedulerStatus {
        let mut running = self.running.lock().await;
        let status = match running.as_ref() {
            Some(current) => {
                let engine_status = current.engine.status().await;
                SchedulerStatus {
                    running: !current.engine.is_done(),
                    program_id: Some(current.program_id),
                    counters: engine_status.counters,
                    fatal: engine_status.fatal,
                }
            },
            None => SchedulerStatus::default(),
        };
        if !status.running && running.is_some() {
            // Engine-fatal exit; release the hardware claim.
            *running = None;
        }
        status
    }

    /// Registers for per-cycle results. Delivery is best-effort in cycle
    /// order; a slow subscriber drops its oldest results.
    pub fn subscribe(&self) -> ResultSubscription {
        ResultSubscription {
            rx: self.result_tx.subscribe(),
            dropped: 0,
        }
    }

    /// Forwards an external trigger edge to the running engine. Returns
    /// false if nothing is running or the edge was debounced.
    pub async fn signal_external_trigger(&self) -> bool {
        let running = self.running.lock().await;
        match running.as_ref() {
            Some(current) => current.engine.signal_external_trigger(),
            None => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use std::io::Cursor;
    use std::time::Duration;

    use image::{ImageFormat, Rgb, RgbImage};
    use imageproc::drawing::draw_filled_circle_mut;
    use tempfile::TempDir;
    use tokio::time::timeout;
    use vigil_elements::program::{
        CaptureSettings, OutputMapping, ProgramConfig, Roi, ToolConfig,
        ToolKind, TriggerMode, TriggerSettings, Verdict};

    use crate::output_bank::SimOutputBank;
    use crate::sim_frame_source::SimulatedFrameSource;
    use super::*;

    fn master_image() -> RgbImage {
        let mut img = RgbImage::from_pixel(640, 480, Rgb([10, 10, 10]));
        draw_filled_circle_mut(&mut img, (320, 240), 100, Rgb([255, 255, 255]));
        img
    }

    fn png_bytes(img: &RgbImage) -> Vec<u8> {
        let mut bytes = Vec::new();
        img.write_to(&mut Cursor::new(&mut bytes), ImageFormat::Png).unwrap();
        bytes
    }

    fn fast_config(name: &str) -> ProgramConfig {
        ProgramConfig {
            name: name.to_string(),
            trigger: TriggerSettings {
                mode: TriggerMode::Internal,
                interval_ms: 10,
                delay_ms: 0,
            },
            capture: CaptureSettings::default(),
            tools: vec![ToolConfig::new(
                1, ToolKind::Area, "disk", Roi::new(200, 140, 240, 200), 65.0)],
            outputs: OutputMapping::default(),
        }
    }

    fn scheduler_with_program() -> (TempDir, Scheduler, i64) {
        let dir = TempDir::new().unwrap();
        let store = Arc::new(ProgramStore::open(dir.path()).unwrap());
        let id = store.create(
            &fast_config("bench"), &png_bytes(&master_image())).unwrap();
        let frame_source: Arc<tokio::sync::Mutex<Box<dyn FrameSource + Send>>> =
            Arc::new(tokio::sync::Mutex::new(Box::new(
                SimulatedFrameSource::with_base_frame(master_image()))));
        let output_bank: Arc<tokio::sync::Mutex<Box<dyn OutputBank + Send>>> =
            Arc::new(tokio::sync::Mutex::new(Box::new(SimOutputBank::new(8))));
        let scheduler = Scheduler::new(store, frame_source, output_bank);
        (dir, scheduler, id)
    }

    #[tokio::test]
    async fn test_start_stop_and_status() {
        let _ = env_logger::builder().is_test(true).try_init();
        let (_dir, scheduler, id) = scheduler_with_program();

        assert!(!scheduler.status().await.running);
        scheduler.start(id).await.unwrap();

        let mut subscription = scheduler.subscribe();
        let result = timeout(Duration::from_secs(5), subscription.next())
            .await.unwrap().unwrap();
        assert_eq!(result.program_verdict, Verdict::Ok);

        let status = scheduler.status().await;
        assert!(status.running);
        assert_eq!(status.program_id, Some(id));
        assert!(status.counters.total >= 1);

        scheduler.stop().await.unwrap();
        assert!(!scheduler.status().await.running);
    }

    #[tokio::test]
    async fn test_single_holder_enforced() {
        let _ = env_logger::builder().is_test(true).try_init();
        let (_dir, scheduler, id) = scheduler_with_program();
        scheduler.start(id).await.unwrap();
        assert!(scheduler.start(id).await.is_err());
        scheduler.stop().await.unwrap();
        // Restart after stop is fine.
        scheduler.start(id).await.unwrap();
        scheduler.stop().await.unwrap();
    }

    #[tokio::test]
    async fn test_stop_without_run_fails() {
        let (_dir, scheduler, _id) = scheduler_with_program();
        assert!(scheduler.stop().await.is_err());
    }

    #[tokio::test]
    async fn test_unknown_program_fails() {
        let (_dir, scheduler, _id) = scheduler_with_program();
        assert!(scheduler.start(999).await.is_err());
        assert!(!scheduler.status().await.running);
    }

    #[tokio::test]
    async fn test_subscribers_see_results_in_order() {
        let _ = env_logger::builder().is_test(true).try_init();
        let (_dir, scheduler, id) = scheduler_with_program();
        let mut early = scheduler.subscribe();
        scheduler.start(id).await.unwrap();
        let mut late = scheduler.subscribe();

        let mut early_seqs = Vec::new();
        for _ in 0..4 {
            early_seqs.push(timeout(Duration::from_secs(5), early.next())
                            .await.unwrap().unwrap().cycle_seq);
        }
        let mut late_seqs = Vec::new();
        for _ in 0..2 {
            late_seqs.push(timeout(Duration::from_secs(5), late.next())
                           .await.unwrap().unwrap().cycle_seq);
        }
        scheduler.stop().await.unwrap();

        for window in early_seqs.windows(2) {
            assert!(window[1] > window[0]);
        }
        for window in late_seqs.windows(2) {
            assert!(window[1] > window[0]);
        }
    }
}  // mod tests.
