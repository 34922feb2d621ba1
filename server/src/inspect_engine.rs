// Copyright (c) 2025 Steven Rosenthal smr@dt3.org
// See LICENSE file in root directory for license terms.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant, SystemTime};

use canonical_error::CanonicalError;
use image::RgbImage;
use log::{debug, error, info, warn};
use tokio::sync::Notify;
use tokio::sync::broadcast;

use vigil_elements::cycle_stats::{LatencyAccumulator, LatencySnapshot};
use vigil_elements::frame_source_trait::FrameSource;
use vigil_elements::output_bank_trait::OutputBank;
use vigil_elements::program::{
    NUM_OUTPUT_LINES, OutputAssignment, ProgramRecord, ToolKind, TriggerMode,
    Verdict, validate_program};
use vigil_elements::quality::compare_frames;

use crate::tools::ConfiguredTool;

// Granularity of the stop-flag checks while waiting for a trigger.
const WAIT_SLICE: Duration = Duration::from_millis(50);

const LATENCY_STATS_CAPACITY: usize = 100;

/// One tool's contribution to a cycle result.
#[derive(Clone, Debug)]
pub struct ToolCycleResult {
    pub tool_id: u32,
    pub tool_name: String,
    pub matching_rate: f64,
    pub verdict: Verdict,
    pub diagnostics: String,
}

/// Everything that happened in one inspection cycle. Emitted to every
/// subscriber; ephemeral.
#[derive(Clone, Debug)]
pub struct InspectionResult {
    pub cycle_seq: u64,
    pub started_at: SystemTime,
    pub ended_at: SystemTime,
    pub duration: Duration,
    pub tools: Vec<ToolCycleResult>,

    /// The translation applied to non-position tool regions this cycle.
    /// None when the program has no position-adjust tool.
    pub offset: Option<(i32, i32)>,

    pub program_verdict: Verdict,

    /// Level each line was driven to; None for unassigned lines.
    pub outputs_driven: [Option<bool>; NUM_OUTPUT_LINES],

    /// Set when the cycle failed to capture a frame.
    pub capture_failure: Option<String>,
}

#[derive(Clone, Copy, Debug, Default)]
pub struct Counters {
    pub total: u64,
    pub ok: u64,
    pub ng: u64,
}

#[derive(Clone, Debug, Default)]
pub struct EngineStatus {
    pub cycle_seq: u64,
    pub counters: Counters,
    pub fatal: Option<String>,
    pub acquire_latency: LatencySnapshot,
    pub process_latency: LatencySnapshot,
}

/// Edge input for externally triggered programs. Edges arriving during a
/// cycle are coalesced to a single pending trigger; edges closer together
/// than the debounce interval are ignored.
pub struct ExternalTrigger {
    pending: AtomicBool,
    notify: Notify,
    debounce: Duration,
    last_edge: std::sync::Mutex<Option<Instant>>,
}

impl ExternalTrigger {
    fn new(debounce: Duration) -> Self {
        ExternalTrigger {
            pending: AtomicBool::new(false),
            notify: Notify::new(),
            debounce,
            last_edge: std::sync::Mutex::new(None),
        }
    }

    /// Registers a rising edge. Returns false if the edge was debounced.
    pub fn signal_edge(&self) -> bool {
        let mut last_edge = self.last_edge.lock().unwrap();
        let now = Instant::now();
        if let Some(prev) = *last_edge {
            if now.duration_since(prev) < self.debounce {
                debug!("External trigger edge debounced");
                return false;
            }
        }
        *last_edge = Some(now);
        self.pending.store(true, Ordering::Release);
        self.notify.notify_one();
        true
    }

    fn take_pending(&self) -> bool {
        self.pending.swap(false, Ordering::AcqRel)
    }
}

// State shared between the worker thread and the InspectionEngine methods.
struct EngineState {
    record: ProgramRecord,
    master: RgbImage,
    tools: Vec<ConfiguredTool>,

    cycle_seq: u64,
    counters: Counters,
    last_cycle_start: Option<Instant>,

    // The master/frame consistency check runs on the first successful
    // capture after a load; its warnings are logged once.
    consistency_checked: bool,

    fatal: Option<String>,

    acquire_latency: LatencyAccumulator,
    process_latency: LatencyAccumulator,
}

/// Per-program inspection runtime: owns the capture → evaluate → actuate
/// loop. Cycles are strictly serialized on a dedicated worker thread;
/// results go out through a broadcast channel that never blocks the loop.
pub struct InspectionEngine {
    state: Arc<tokio::sync::Mutex<EngineState>>,

    frame_source: Arc<tokio::sync::Mutex<Box<dyn FrameSource + Send>>>,
    output_bank: Arc<tokio::sync::Mutex<Box<dyn OutputBank + Send>>>,

    result_tx: broadcast::Sender<InspectionResult>,

    trigger: Arc<ExternalTrigger>,

    // Executes worker().
    worker_thread: Option<std::thread::JoinHandle<()>>,

    stop_request: Arc<AtomicBool>,

    // Signaled at worker_thread exit.
    worker_done: Arc<AtomicBool>,
}

impl InspectionEngine {
    /// Binds a program to the hardware: re-validates the configuration
    /// against the master dimensions and extracts every tool's features.
    /// Tool feature failures are not fatal; such tools judge NG each cycle.
    pub fn load(record: ProgramRecord,
                master: RgbImage,
                frame_source: Arc<tokio::sync::Mutex<Box<dyn FrameSource + Send>>>,
                output_bank: Arc<tokio::sync::Mutex<Box<dyn OutputBank + Send>>>,
                result_tx: broadcast::Sender<InspectionResult>)
                -> Result<Self, CanonicalError> {
        validate_program(&record.config, master.dimensions())?;
        let tools: Vec<ConfiguredTool> = record.config.tools.iter()
            .map(|t| ConfiguredTool::configure(t.clone(), &master))
            .collect();
        for tool in &tools {
            if let Some(reason) = tool.configure_failure() {
                error!("Program {}: tool {} loads in failed state: {}",
                       record.id, tool.config.id, reason);
            }
        }
        let debounce = Duration::from_millis(record.config.trigger.delay_ms as u64);
        Ok(InspectionEngine {
            state: Arc::new(tokio::sync::Mutex::new(EngineState {
                record,
                master,
                tools,
                cycle_seq: 0,
                counters: Counters::default(),
                last_cycle_start: None,
                consistency_checked: false,
                fatal: None,
                acquire_latency: LatencyAccumulator::new(LATENCY_STATS_CAPACITY),
                process_latency: LatencyAccumulator::new(LATENCY_STATS_CAPACITY),
            })),
            frame_source,
            output_bank,
            result_tx,
            trigger: Arc::new(ExternalTrigger::new(debounce)),
            worker_thread: None,
            stop_request: Arc::new(AtomicBool::new(false)),
            worker_done: Arc::new(AtomicBool::new(false)),
        })
    }

    /// Begins cycling. Idempotent while the worker is alive.
    pub fn start(&mut self) {
        if self.worker_thread.is_some() {
            return;
        }
        self.stop_request.store(false, Ordering::Relaxed);
        self.worker_done.store(false, Ordering::Relaxed);
        let cloned_state = self.state.clone();
        let cloned_frame_source = self.frame_source.clone();
        let cloned_output_bank = self.output_bank.clone();
        let cloned_result_tx = self.result_tx.clone();
        let cloned_stop = self.stop_request.clone();
        let cloned_trigger = self.trigger.clone();
        let cloned_done = self.worker_done.clone();

        // Tool evaluation is CPU-bound and can take tens of milliseconds,
        // well beyond what belongs on a shared async runtime. The worker
        // gets its own runtime on a dedicated thread.
        self.worker_thread = Some(std::thread::spawn(move || {
            let runtime = tokio::runtime::Builder::new_multi_thread()
                .enable_all()
                .thread_name("inspect_engine")
                .build().unwrap();
            runtime.block_on(async move {
                InspectionEngine::worker(
                    cloned_state, cloned_frame_source, cloned_output_bank,
                    cloned_result_tx, cloned_stop, cloned_trigger).await;
            });
            cloned_done.store(true, Ordering::Relaxed);
        }));
    }

    /// Signals the worker and waits for the in-flight cycle to complete.
    /// A cycle is never abandoned mid-way; output levels stay defined.
    pub fn stop(&mut self) {
        self.stop_request.store(true, Ordering::Relaxed);
        self.trigger.notify.notify_one();
        if let Some(worker) = self.worker_thread.take() {
            worker.join().unwrap();
        }
    }

    /// True once the worker has exited, whether by stop() or fatally.
    pub fn is_done(&self) -> bool {
        self.worker_done.load(Ordering::Relaxed)
    }

    /// Registers an external trigger edge. Returns false if debounced.
    pub fn signal_external_trigger(&self) -> bool {
        self.trigger.signal_edge()
    }

    pub async fn program_id(&self) -> i64 {
        self.state.lock().await.record.id
    }

    pub async fn status(&self) -> EngineStatus {
        let locked_state = self.state.lock().await;
        EngineStatus {
            cycle_seq: locked_state.cycle_seq,
            counters: locked_state.counters,
            fatal: locked_state.fatal.clone(),
            acquire_latency: locked_state.acquire_latency.snapshot(),
            process_latency: locked_state.process_latency.snapshot(),
        }
    }

    async fn worker(
        state: Arc<tokio::sync::Mutex<EngineState>>,
        frame_source: Arc<tokio::sync::Mutex<Box<dyn FrameSource + Send>>>,
        output_bank: Arc<tokio::sync::Mutex<Box<dyn OutputBank + Send>>>,
        result_tx: broadcast::Sender<InspectionResult>,
        stop: Arc<AtomicBool>,
        trigger: Arc<ExternalTrigger>) {
        // The program is immutable while we hold it.
        let (program_id, trigger_settings, capture_settings, output_mapping) = {
            let locked_state = state.lock().await;
            (locked_state.record.id,
             locked_state.record.config.trigger,
             locked_state.record.config.capture,
             locked_state.record.config.outputs)
        };
        info!("Starting inspection of program {}", program_id);

        loop {
            // Wait for the trigger; the stop flag is honored here and at
            // every suspension point, while a started cycle always runs to
            // completion.
            if stop.load(Ordering::Relaxed) {
                break;
            }
            match trigger_settings.mode {
                TriggerMode::Internal => {
                    let interval =
                        Duration::from_millis(trigger_settings.interval_ms as u64);
                    let next_start = state.lock().await.last_cycle_start
                        .map(|start| start + interval);
                    if let Some(next_start) = next_start {
                        let now = Instant::now();
                        // One millisecond of grace so scheduler jitter does
                        // not read as an overrun.
                        if now > next_start + Duration::from_millis(1) {
                            // Overrun: start immediately, no catch-up burst.
                            warn!("Program {}: cycle overran {}ms interval by \
                                   {}ms",
                                  program_id, trigger_settings.interval_ms,
                                  (now - next_start).as_millis());
                        }
                        while !stop.load(Ordering::Relaxed) {
                            let now = Instant::now();
                            if now >= next_start {
                                break;
                            }
                            tokio::time::sleep(
                                (next_start - now).min(WAIT_SLICE)).await;
                        }
                    }
                },
                TriggerMode::External => {
                    while !stop.load(Ordering::Relaxed) &&
                        !trigger.take_pending()
                    {
                        tokio::select! {
                            _ = trigger.notify.notified() => (),
                            _ = tokio::time::sleep(WAIT_SLICE) => (),
                        }
                    }
                    if !stop.load(Ordering::Relaxed) &&
                        trigger_settings.delay_ms > 0
                    {
                        tokio::time::sleep(Duration::from_millis(
                            trigger_settings.delay_ms as u64)).await;
                    }
                },
            }
            if stop.load(Ordering::Relaxed) {
                break;
            }

            let cycle_start = Instant::now();
            let started_at = SystemTime::now();

            // Capture.
            let capture_result = frame_source.lock().await.capture(
                capture_settings.brightness_mode, capture_settings.focus).await;
            {
                let mut locked_state = state.lock().await;
                locked_state.acquire_latency.add_sample(
                    cycle_start.elapsed().as_secs_f64());
            }
            let frame = match capture_result {
                Ok(frame) => frame,
                Err(e) => {
                    error!("Program {}: capture failed: {}",
                           program_id, e.message);
                    // The cycle is judged NG; the loop survives.
                    Self::finish_cycle(
                        &state, &output_bank, &result_tx, &output_mapping,
                        cycle_start, started_at, Vec::new(), None, Verdict::Ng,
                        Some(e.message.clone())).await;
                    continue;
                },
            };

            // First successful capture after a load: check that the frame
            // and the master are comparable.
            {
                let mut locked_state = state.lock().await;
                if !locked_state.consistency_checked {
                    let report = compare_frames(&locked_state.master, &frame);
                    if !report.consistent {
                        let detail = report.issues.join("; ");
                        error!("Program {}: stopping, master and camera \
                                frames are incomparable: {}",
                               program_id, detail);
                        locked_state.fatal = Some(detail);
                        break;
                    }
                    for warning in &report.warnings {
                        warn!("Program {}: {}", program_id, warning);
                    }
                    locked_state.consistency_checked = true;
                }
            }

            // Evaluate tools in program order. A leading position-adjust
            // tool determines the region offset for everything after it.
            let process_start = Instant::now();
            let mut tool_results = Vec::new();
            let mut offset = (0_i32, 0_i32);
            let mut offset_used: Option<(i32, i32)> = None;
            let mut all_ok = true;
            {
                let locked_state = state.lock().await;
                for (index, tool) in locked_state.tools.iter().enumerate() {
                    let evaluation =
                        if index == 0 &&
                           tool.config.kind == ToolKind::PositionAdjust
                    {
                        let evaluation = tool.evaluate(&frame, (0, 0));
                        if evaluation.verdict == Verdict::Ok {
                            offset = evaluation.offset.unwrap_or((0, 0));
                        }
                        offset_used = Some(offset);
                        evaluation
                    } else {
                        tool.evaluate(&frame, offset)
                    };
                    if evaluation.verdict == Verdict::Ng {
                        all_ok = false;
                    }
                    tool_results.push(ToolCycleResult {
                        tool_id: tool.config.id,
                        tool_name: tool.config.name.clone(),
                        matching_rate: evaluation.matching_rate,
                        verdict: evaluation.verdict,
                        diagnostics: evaluation.diagnostics,
                    });
                }
            }
            let program_verdict = if all_ok { Verdict::Ok } else { Verdict::Ng };
            {
                let mut locked_state = state.lock().await;
                locked_state.process_latency.add_sample(
                    process_start.elapsed().as_secs_f64());
            }

            Self::finish_cycle(
                &state, &output_bank, &result_tx, &output_mapping,
                cycle_start, started_at, tool_results, offset_used,
                program_verdict, None).await;
        }
        info!("Inspection of program {} stopped", program_id);
    }

    // Drives the outputs, updates the counters, and emits the result. Used
    // for both normal and capture-failed cycles.
    #[allow(clippy::too_many_arguments)]
    async fn finish_cycle(
        state: &Arc<tokio::sync::Mutex<EngineState>>,
        output_bank: &Arc<tokio::sync::Mutex<Box<dyn OutputBank + Send>>>,
        result_tx: &broadcast::Sender<InspectionResult>,
        output_mapping: &vigil_elements::program::OutputMapping,
        cycle_start: Instant,
        started_at: SystemTime,
        tools: Vec<ToolCycleResult>,
        offset: Option<(i32, i32)>,
        program_verdict: Verdict,
        capture_failure: Option<String>) {
        let cycle_seq = {
            let mut locked_state = state.lock().await;
            locked_state.cycle_seq += 1;
            locked_state.cycle_seq
        };

        // Every assigned line gets a defined level before the result goes
        // out. Output faults are logged but do not abort the cycle.
        let mut outputs_driven = [None; NUM_OUTPUT_LINES];
        {
            let locked_bank = output_bank.lock().await;
            for (line, assignment) in output_mapping.0.iter().enumerate() {
                let level = match assignment {
                    OutputAssignment::AlwaysOn => Some(true),
                    OutputAssignment::AlwaysOff => Some(false),
                    OutputAssignment::Ok =>
                        Some(program_verdict == Verdict::Ok),
                    OutputAssignment::Ng =>
                        Some(program_verdict == Verdict::Ng),
                    OutputAssignment::NotUsed => None,
                };
                if let Some(level) = level {
                    if let Err(e) = locked_bank.set(line, level).await {
                        error!("Cycle {}: output line {} fault: {}",
                               cycle_seq, line, e.message);
                    }
                    outputs_driven[line] = Some(level);
                }
            }
        }

        let ended_at = SystemTime::now();
        let result = InspectionResult {
            cycle_seq,
            started_at,
            ended_at,
            duration: cycle_start.elapsed(),
            tools,
            offset,
            program_verdict,
            outputs_driven,
            capture_failure,
        };
        {
            let mut locked_state = state.lock().await;
            locked_state.counters.total += 1;
            match program_verdict {
                Verdict::Ok => locked_state.counters.ok += 1,
                Verdict::Ng => locked_state.counters.ng += 1,
            }
            locked_state.last_cycle_start = Some(cycle_start);
        }
        // Best-effort: subscribers that lag drop oldest results; nobody
        // listening is fine.
        let _ = result_tx.send(result);
    }
}

// mod tests.
