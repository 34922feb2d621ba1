// Copyright (c) 2025 Steven Rosenthal smr@dt3.org
// See LICENSE file in root directory for license terms.

use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering as AtomicOrdering};
use std::time::Duration;

use log::{info, warn};
use pico_args::Arguments;

use tracing_subscriber::prelude::*;
use tracing_subscriber::{fmt, registry, EnvFilter};
use tracing_appender::non_blocking::NonBlockingBuilder;
use tracing_appender::rolling::{RollingFileAppender, Rotation};

use vigil_elements::frame_source_trait::FrameSource;
use vigil_elements::output_bank_trait::OutputBank;
use vigil_elements::program::NUM_OUTPUT_LINES;

use crate::output_bank::{DEFAULT_OUTPUT_PINS, GpioOutputBank, SimOutputBank};
use crate::program_store::ProgramStore;
use crate::scheduler::Scheduler;
use crate::sim_frame_source::{ImageFrameSource, SimulatedFrameSource};

struct AppArgs {
    data_dir: String,
    simulate: bool,
    test_image: Option<String>,
    program: Option<String>,
    gpio_pins: Option<Vec<u8>>,
    log_dir: String,
    log_file: String,
}

fn parse_pins(value: &str) -> Result<Vec<u8>, String> {
    let pins: Result<Vec<u8>, _> =
        value.split(',').map(|p| p.trim().parse::<u8>()).collect();
    match pins {
        Ok(pins) if pins.len() == NUM_OUTPUT_LINES => Ok(pins),
        Ok(pins) => Err(format!("Expected {} pins, got {}",
                                NUM_OUTPUT_LINES, pins.len())),
        Err(e) => Err(format!("Bad pin list: {}", e)),
    }
}

pub fn server_main(product_name: &str) {
    const HELP: &str = "\
    FLAGS:
      -h, --help                 Prints help information
      --simulate                 Use simulated camera and outputs

    OPTIONS:
      --data_dir <path>          .
      --test_image <path>        Serve a fixed image as the camera
      --program <name>           Start this program immediately
      --gpio_pins <p1,..,p8>     BCM pins for OUT1..OUT8
      --log_dir <path>           .
      --log_file <file>          vigil_log.txt
    ";

    let mut pargs = Arguments::from_env();
    if pargs.contains(["-h", "--help"]) {
        println!("{}", HELP);
        std::process::exit(0);
    }
    let args = AppArgs {
        data_dir: pargs.value_from_str("--data_dir")
            .unwrap_or(".".to_string()),
        simulate: pargs.contains("--simulate"),
        test_image: pargs.opt_value_from_str("--test_image").unwrap(),
        program: pargs.opt_value_from_str("--program").unwrap(),
        gpio_pins: pargs.opt_value_from_fn("--gpio_pins", parse_pins).unwrap(),
        log_dir: pargs.value_from_str("--log_dir")
            .unwrap_or(".".to_string()),
        log_file: pargs.value_from_str("--log_file")
            .unwrap_or("vigil_log.txt".to_string()),
    };

    // Set up logging.
    let file_appender = RollingFileAppender::builder()
        .rotation(Rotation::DAILY)
        .filename_prefix(&args.log_file)
        .max_log_files(10)
        .build(&args.log_dir).unwrap();

    // Create non-blocking writers for both the file and stdout.
    let (non_blocking_file, _guard1) = NonBlockingBuilder::default()
        .lossy(false)
        .finish(file_appender);
    let (non_blocking_stdout, _guard2) = NonBlockingBuilder::default()
        .lossy(false)
        .finish(std::io::stdout());
    registry()
        .with(EnvFilter::try_from_default_env()
              .unwrap_or_else(|_| EnvFilter::new("info")))
        .with(fmt::layer().with_writer(non_blocking_stdout))
        .with(fmt::layer().with_ansi(false).with_writer(non_blocking_file))
        .init();

    let got_signal = Arc::new(AtomicBool::new(false));
    let got_signal2 = got_signal.clone();
    ctrlc::set_handler(move || {
        info!("Got control-c");
        got_signal2.store(true, AtomicOrdering::Relaxed);
        std::thread::sleep(Duration::from_secs(1));
        info!("Exiting");
        std::process::exit(-1);
    }).unwrap();

    info!("{} starting", product_name);
    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build().unwrap();
    runtime.block_on(async move {
        async_main(args, got_signal).await;
    });
}

async fn async_main(args: AppArgs, got_signal: Arc<AtomicBool>) {
    let store = match ProgramStore::open(&PathBuf::from(&args.data_dir)) {
        Ok(store) => Arc::new(store),
        Err(e) => {
            warn!("Cannot open program store: {}", e.message);
            return;
        },
    };

    let frame_source: Arc<tokio::sync::Mutex<Box<dyn FrameSource + Send>>> =
        match &args.test_image {
            Some(path) => {
                match ImageFrameSource::from_path(&PathBuf::from(path)) {
                    Ok(source) => {
                        info!("Serving test image {} as the camera", path);
                        Arc::new(tokio::sync::Mutex::new(Box::new(source)))
                    },
                    Err(e) => {
                        warn!("{}", e.message);
                        return;
                    },
                }
            },
            None => {
                // The camera driver binds here once integrated; until then
                // everything runs against the simulated source.
                if !args.simulate {
                    warn!("No camera driver configured; using simulated \
                           frame source");
                }
                Arc::new(tokio::sync::Mutex::new(
                    Box::new(SimulatedFrameSource::new(640, 480))))
            },
        };

    let output_bank: Arc<tokio::sync::Mutex<Box<dyn OutputBank + Send>>> =
        if args.simulate {
            Arc::new(tokio::sync::Mutex::new(
                Box::new(SimOutputBank::new(NUM_OUTPUT_LINES))))
        } else {
            let pins = args.gpio_pins.clone()
                .unwrap_or_else(|| DEFAULT_OUTPUT_PINS.to_vec());
            match GpioOutputBank::new(&pins) {
                Ok(bank) => Arc::new(tokio::sync::Mutex::new(Box::new(bank))),
                Err(e) => {
                    warn!("{}; falling back to simulated outputs", e.message);
                    Arc::new(tokio::sync::Mutex::new(
                        Box::new(SimOutputBank::new(NUM_OUTPUT_LINES))))
                },
            }
        };

    let scheduler = Scheduler::new(store.clone(), frame_source, output_bank);

    match store.list() {
        Ok(records) => {
            info!("{} program(s) on file", records.len());
            for record in &records {
                info!("  {} {}", record.id, record.config.name);
            }
        },
        Err(e) => warn!("Cannot list programs: {}", e.message),
    }

    if let Some(name) = &args.program {
        let started = match store.find_by_name(name) {
            Ok(record) => scheduler.start(record.id).await,
            Err(e) => Err(e),
        };
        if let Err(e) = started {
            warn!("Cannot start {}: {}", name, e.message);
        }
    }

    // Log results until shutdown.
    let mut subscription = scheduler.subscribe();
    while !got_signal.load(AtomicOrdering::Relaxed) {
        tokio::select! {
            result = subscription.next() => {
                if let Some(result) = result {
                    info!("Cycle {}: {:?} ({} tools, {:.1}ms)",
                          result.cycle_seq, result.program_verdict,
                          result.tools.len(),
                          result.duration.as_secs_f64() * 1000.0);
                }
            },
            _ = tokio::time::sleep(Duration::from_millis(100)) => (),
        }
    }
    if scheduler.status().await.running {
        let _ = scheduler.stop().await;
    }
}
