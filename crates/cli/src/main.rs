//! CLI entry point for vidshrink
//!
//! Scans a folder, builds the batch request from settings plus flags, and runs
//! the batch. While it runs, `pause`, `resume` and `stop` on stdin drive the
//! batch; Ctrl+C cancels it.

use std::io::Write;
use std::path::PathBuf;
use std::process::ExitCode;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use clap::Parser;
use tokio::io::{AsyncBufReadExt, BufReader, Lines, Stdin};
use tokio::sync::{broadcast, Mutex};
use tracing::{debug, error, info, warn};
use tracing_subscriber::EnvFilter;

use vidshrink::config::Config;
use vidshrink::notify::{format_saved, Notifier};
use vidshrink::scan::{extension_set, scan_folder};
use vidshrink::{
    run_status_server, BatchControl, BatchEvent, BatchOrchestrator, BatchRequest, FpsChoice,
    ProcessingMode, ResolutionChoice, ResourceGate, StatusState,
};

/// vidshrink - batch video shrinking with ffmpeg
#[derive(Parser, Debug)]
#[command(name = "vidshrink")]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Folder to scan for videos (recursively)
    folder: PathBuf,

    /// Path to the settings file; defaults apply when it does not exist
    #[arg(short, long, default_value = "vidshrink.toml")]
    config: PathBuf,

    /// Processing mode: crf, target, copy or split
    #[arg(short, long, default_value = "crf", value_parser = ProcessingMode::from_str)]
    mode: ProcessingMode,

    /// Constant rate factor for crf mode
    #[arg(long)]
    crf: Option<u32>,

    /// Encoder label or codec id (e.g. libx265, hevc_nvenc)
    #[arg(long)]
    encoder: Option<String>,

    /// Target resolution label or width (e.g. "Full HD (1080p)" or 1920)
    #[arg(long, value_parser = ResolutionChoice::from_str)]
    resolution: Option<ResolutionChoice>,

    /// Target frame rate (Original, 60, 30, 24)
    #[arg(long, value_parser = FpsChoice::from_str)]
    fps: Option<FpsChoice>,

    /// Output size in MB for target mode
    #[arg(long)]
    target_mb: Option<u32>,

    /// Part size in MB for split mode
    #[arg(long)]
    split_mb: Option<u32>,

    /// Output container extension (e.g. .mp4, .mkv)
    #[arg(long)]
    format: Option<String>,

    /// Delete each source after a successful re-encode
    #[arg(long)]
    delete_original: bool,

    /// Also process files whose names mark them as already optimized
    #[arg(long)]
    reprocess: bool,

    /// Serve batch status on 127.0.0.1:<PORT>
    #[arg(long)]
    status_port: Option<u16>,

    /// Answer yes to confirmation prompts
    #[arg(short, long)]
    yes: bool,
}

type SharedInput = Arc<Mutex<Lines<BufReader<Stdin>>>>;

/// Notifications on the terminal; confirmations read the next stdin line.
struct TerminalNotifier {
    input: SharedInput,
    assume_yes: bool,
}

#[async_trait]
impl Notifier for TerminalNotifier {
    async fn info(&self, title: &str, message: &str) {
        info!(title, "{}", message);
    }

    async fn error(&self, title: &str, message: &str) {
        error!(title, "{}", message);
    }

    async fn confirm(&self, title: &str, question: &str) -> bool {
        if self.assume_yes {
            return true;
        }
        print!("{}: {} [y/N] ", title, question);
        let _ = std::io::stdout().flush();
        let answer = self.input.lock().await.next_line().await;
        matches!(
            answer.ok().flatten().map(|a| a.trim().to_lowercase()).as_deref(),
            Some("y") | Some("yes")
        )
    }
}

fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let args = Args::parse();

    let runtime = match tokio::runtime::Runtime::new() {
        Ok(runtime) => runtime,
        Err(e) => {
            error!("Failed to start async runtime: {}", e);
            return ExitCode::FAILURE;
        }
    };
    let code = runtime.block_on(run(args));
    // The stdin reader may still be parked in a blocking read
    runtime.shutdown_timeout(Duration::from_millis(100));
    code
}

async fn run(args: Args) -> ExitCode {
    let mut config = match Config::load_or_default(&args.config) {
        Ok(config) => config,
        Err(e) => {
            error!(path = %args.config.display(), "Failed to load settings: {}", e);
            return ExitCode::FAILURE;
        }
    };
    if args.reprocess {
        config.batch.process_already_optimized = true;
    }
    if args.delete_original {
        config.batch.delete_original = true;
    }
    if let Some(encoder) = &args.encoder {
        config.encode.encoder = encoder.clone();
    }
    if let Some(format) = &args.format {
        config.encode.output_format = format.clone();
    }

    let mut request = BatchRequest::from_config(&config, args.mode);
    if let Some(crf) = args.crf {
        request.crf = crf;
    }
    if let Some(resolution) = args.resolution {
        request.resolution = resolution;
    }
    if let Some(fps) = args.fps {
        request.fps = fps;
    }
    if let Some(mb) = args.target_mb {
        request.target_size_mb = mb;
    }
    if let Some(mb) = args.split_mb {
        request.split_size_mb = mb;
    }

    if !args.folder.is_dir() {
        error!(folder = %args.folder.display(), "Folder does not exist");
        return ExitCode::FAILURE;
    }
    let scan = scan_folder(&args.folder, &extension_set(&config.batch.custom_extensions));
    info!(
        folder = %args.folder.display(),
        videos = scan.candidates.len(),
        total_size = %format_saved(scan.total_bytes as i64),
        "Scan complete"
    );
    let mut items = scan.work_items();

    let input: SharedInput = Arc::new(Mutex::new(BufReader::new(tokio::io::stdin()).lines()));
    let notifier = Arc::new(TerminalNotifier {
        input: Arc::clone(&input),
        assume_yes: args.yes,
    });
    let gate = Arc::new(ResourceGate::for_system(
        &args.folder,
        request.low_disk_buffer_bytes,
    ));
    let orchestrator = BatchOrchestrator::new(config.tools.clone(), gate, notifier);
    let control = orchestrator.control();

    if let Some(port) = args.status_port {
        let state = StatusState {
            snapshot: orchestrator.snapshot(),
            control: control.clone(),
        };
        tokio::spawn(async move {
            if let Err(e) = run_status_server(state, port).await {
                error!("Status server error: {}", e);
            }
        });
    }

    let progress_task = tokio::spawn(log_progress(orchestrator.subscribe()));
    let command_task = tokio::spawn(read_commands(control.clone(), input));
    let interrupt_task = tokio::spawn(cancel_on_interrupt(control.clone()));

    let outcome = orchestrator.run(&mut items, &request).await;

    command_task.abort();
    interrupt_task.abort();
    progress_task.abort();

    match outcome {
        Ok(result) => {
            for failure in &result.failures {
                warn!(path = %failure.path.display(), reason = %failure.reason, "Not processed");
            }
            info!(
                completed = result.completed,
                failed = result.failures.len(),
                skipped = result.skipped.len(),
                saved = %format_saved(result.bytes_saved),
                cancelled = result.cancelled,
                "Done"
            );
            ExitCode::SUCCESS
        }
        Err(e) => {
            error!("Batch aborted: {}", e);
            ExitCode::FAILURE
        }
    }
}

/// Interactive commands: pause, resume, stop.
async fn read_commands(control: BatchControl, input: SharedInput) {
    loop {
        let line = { input.lock().await.next_line().await };
        let command = match line {
            Ok(Some(line)) => line,
            Ok(None) => break,
            Err(e) => {
                debug!(error = %e, "Stopped reading commands");
                break;
            }
        };
        match command.trim().to_lowercase().as_str() {
            "" => {}
            "pause" | "p" => {
                if let Err(e) = control.pause() {
                    warn!("{}", e);
                }
            }
            "resume" | "r" => {
                if let Err(e) = control.resume().await {
                    warn!("{}", e);
                }
            }
            "stop" | "s" => {
                if control.request_stop(false).await {
                    break;
                }
            }
            "status" => info!(state = %control.state(), "Status"),
            other => warn!(command = other, "Unknown command (use pause, resume, stop or status)"),
        }
    }
}

async fn cancel_on_interrupt(control: BatchControl) {
    if let Err(e) = tokio::signal::ctrl_c().await {
        warn!("Ctrl+C handler unavailable: {}", e);
        return;
    }
    info!("Interrupt received, cancelling");
    if let Err(e) = control.cancel() {
        debug!("{}", e);
    }
}

/// Log progress in 10% steps so the log stays readable.
async fn log_progress(mut events: broadcast::Receiver<BatchEvent>) {
    let mut last_step = None;
    loop {
        match events.recv().await {
            Ok(BatchEvent::ItemStarted { .. }) => last_step = None,
            Ok(BatchEvent::Progress {
                index,
                progress,
                eta,
            }) => {
                let step = (progress.percentage / 10.0).floor() as u32;
                if last_step != Some(step) {
                    last_step = Some(step);
                    info!(
                        item = index,
                        speed = %progress.speed,
                        fps = %progress.fps,
                        "{:.1}% - {}",
                        progress.percentage,
                        eta
                    );
                }
            }
            Ok(BatchEvent::StateChanged(state)) => info!(state = %state, "Batch state"),
            Ok(_) => {}
            Err(broadcast::error::RecvError::Lagged(skipped)) => {
                debug!(skipped, "Progress log lagged");
            }
            Err(broadcast::error::RecvError::Closed) => break,
        }
    }
}
