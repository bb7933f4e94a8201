//! Batch orchestrator.
//!
//! Runs the selected work items one at a time: wait for disk capacity, probe
//! the source, plan the encode, supervise the encoder invocation(s) while
//! forwarding progress, then verify and account for the output.
//!
//! The keep-running flag owned by [`BatchControl`] is checked at the top of
//! every item, inside the pause wait, between passes and right after the
//! encoder exits. A cancel kills the active encoder, so the flow always
//! reaches one of those checkpoints promptly.

use std::collections::VecDeque;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::broadcast;
use tracing::{debug, error, info, warn};

use crate::config::ToolsConfig;
use crate::control::{BatchControl, BatchState};
use crate::encode::{build_invocations, cleanup_pass_logs, pass_log_base, Invocation, MediaProber};
use crate::events::{BatchEvent, EVENT_CHANNEL_CAPACITY};
use crate::item::WorkItem;
use crate::naming::{first_segment_path, OutputKind, OutputNamer, SuffixNamer};
use crate::notify::{format_saved, summary_message, Notifier, NO_SELECTION_MESSAGE};
use crate::planner::{plan_encode, EncodeMode, EncodePlan, PlanError, PlanInputs, PlanOutcome};
use crate::progress::{ConversionProgress, ProgressParser};
use crate::request::BatchRequest;
use crate::resource_gate::{ResourceGate, SpaceCheck};
use crate::startup::{check_binaries, StartupError};
use crate::status::{new_shared_snapshot, SharedSnapshot};
use crate::supervisor::{ExitOutcome, ProcessSupervisor, SupervisorError};

const BYTES_PER_MB: u64 = 1024 * 1024;

/// Diagnostic lines kept to explain a failed encode.
const STDERR_TAIL_LINES: usize = 5;

/// Errors that abort the whole batch.
#[derive(Debug, Error)]
pub enum BatchError {
    #[error("{0}")]
    Launch(String),

    #[error("{0}")]
    Permission(String),

    #[error("a batch is already running")]
    AlreadyRunning,
}

impl From<StartupError> for BatchError {
    fn from(e: StartupError) -> Self {
        match e {
            StartupError::BinaryMissing { .. } => BatchError::Launch(e.to_string()),
            StartupError::NotExecutable { .. } => BatchError::Permission(e.to_string()),
        }
    }
}

impl From<SupervisorError> for BatchError {
    fn from(e: SupervisorError) -> Self {
        match &e {
            SupervisorError::Permission { program, .. } => BatchError::Permission(format!(
                "{}. Run: chmod +x \"{}\"",
                e,
                program.display()
            )),
            _ => BatchError::Launch(e.to_string()),
        }
    }
}

/// Reasons a single item failed. Recorded; the batch moves on.
#[derive(Debug, Error)]
pub enum ItemError {
    #[error(transparent)]
    Plan(#[from] PlanError),

    #[error("encoder exited with code {code}: {detail}")]
    Execution { code: i32, detail: String },

    #[error("output {0} is missing or empty")]
    OutputMissing(PathBuf),

    #[error(transparent)]
    Supervisor(#[from] SupervisorError),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ItemFailure {
    pub path: PathBuf,
    pub reason: String,
}

/// Totals for one run.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct BatchResult {
    pub completed: usize,
    /// Original size minus final size, summed. Negative when outputs grew.
    pub bytes_saved: i64,
    pub failures: Vec<ItemFailure>,
    /// Split-mode items that already fit in one part.
    pub skipped: Vec<PathBuf>,
    pub cancelled: bool,
}

/// Indexes of the items a run will process, in order.
pub fn select_queue(items: &[WorkItem], reprocess_optimized: bool) -> Vec<usize> {
    items
        .iter()
        .enumerate()
        .filter(|(_, item)| item.selected && !item.is_completed())
        .filter(|(_, item)| reprocess_optimized || !item.is_already_optimized())
        .map(|(index, _)| index)
        .collect()
}

enum ItemOutcome {
    Completed {
        output: PathBuf,
        final_bytes: u64,
        bytes_saved: i64,
    },
    NoSplitRequired,
    Cancelled,
}

pub struct BatchOrchestrator {
    tools: ToolsConfig,
    supervisor: ProcessSupervisor,
    gate: Arc<ResourceGate>,
    notifier: Arc<dyn Notifier>,
    namer: Arc<dyn OutputNamer>,
    control: BatchControl,
    snapshot: SharedSnapshot,
    events: broadcast::Sender<BatchEvent>,
    work_dir: PathBuf,
}

impl BatchOrchestrator {
    /// Orchestrator using the platform process control and the default namer.
    ///
    /// # Arguments
    /// * `tools` - Encoder and probe locations, resolved at the start of each run
    /// * `gate` - Free-space gate for the destination volume
    /// * `notifier` - Sink for user-facing messages
    pub fn new(tools: ToolsConfig, gate: Arc<ResourceGate>, notifier: Arc<dyn Notifier>) -> Self {
        Self::with_supervisor(tools, gate, notifier, ProcessSupervisor::default())
    }

    pub fn with_supervisor(
        tools: ToolsConfig,
        gate: Arc<ResourceGate>,
        notifier: Arc<dyn Notifier>,
        supervisor: ProcessSupervisor,
    ) -> Self {
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        let control = BatchControl::new(
            supervisor.clone(),
            Arc::clone(&gate),
            Arc::clone(&notifier),
            events.clone(),
        );
        Self {
            tools,
            supervisor,
            gate,
            notifier,
            namer: Arc::new(SuffixNamer),
            control,
            snapshot: new_shared_snapshot(),
            events,
            work_dir: std::env::temp_dir(),
        }
    }

    pub fn with_namer(mut self, namer: Arc<dyn OutputNamer>) -> Self {
        self.namer = namer;
        self
    }

    /// Directory for two-pass statistics files.
    pub fn with_work_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.work_dir = dir.into();
        self
    }

    /// Handle for pause, resume and cancel from other tasks.
    pub fn control(&self) -> BatchControl {
        self.control.clone()
    }

    pub fn snapshot(&self) -> SharedSnapshot {
        self.snapshot.clone()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<BatchEvent> {
        self.events.subscribe()
    }

    /// Process every eligible item in `items`.
    ///
    /// Items are eligible when selected, not completed and (unless the request
    /// reprocesses them) not already optimized. Per-item failures are recorded
    /// in the result; only launch and permission problems end the run early.
    ///
    /// # Returns
    /// * `Ok(BatchResult)` - Run finished or was cancelled
    /// * `Err(BatchError)` - Preflight failed, the encoder could not be launched,
    ///   or another run is in progress
    pub async fn run(
        &self,
        items: &mut [WorkItem],
        request: &BatchRequest,
    ) -> Result<BatchResult, BatchError> {
        if self.control.state().is_active() {
            return Err(BatchError::AlreadyRunning);
        }

        let queue = select_queue(items, request.reprocess_optimized);
        if queue.is_empty() {
            info!(items = items.len(), "Nothing to process");
            self.notifier.info("No Videos", NO_SELECTION_MESSAGE).await;
            return Ok(BatchResult::default());
        }
        let skipped_optimized = items
            .iter()
            .filter(|item| item.selected && !item.is_completed() && item.is_already_optimized())
            .count();
        if skipped_optimized > 0 && !request.reprocess_optimized {
            info!(count = skipped_optimized, "Skipping already optimized videos");
        }

        let tools = check_binaries(&self.tools)?;
        let prober = MediaProber::new(&tools.ffprobe);

        self.gate.set_threshold_bytes(request.low_disk_buffer_bytes);
        self.control
            .begin()
            .map_err(|_| BatchError::AlreadyRunning)?;
        {
            let mut snapshot = self.snapshot.write().await;
            snapshot.state = BatchState::Running;
            snapshot.items.clear();
            for (index, item) in items.iter().enumerate() {
                snapshot.update_row(index, item);
            }
            snapshot.queue_len = queue.len();
            snapshot.completed_items = 0;
            snapshot.failed_items = 0;
            snapshot.bytes_saved = 0;
        }
        info!(
            queued = queue.len(),
            mode = request.mode.as_str(),
            encoder = %request.encoder,
            "Batch started"
        );

        let (mut result, fatal) = self
            .process_queue(items, &queue, request, &tools.ffmpeg, &prober)
            .await;

        let final_state = self.control.finish();
        result.cancelled = final_state == BatchState::Cancelled;
        {
            let mut snapshot = self.snapshot.write().await;
            snapshot.state = final_state;
            snapshot.queue_len = 0;
            snapshot.reset_transient();
        }

        info!(
            state = %final_state,
            completed = result.completed,
            failed = result.failures.len(),
            saved = %format_saved(result.bytes_saved),
            "Batch finished"
        );
        if result.completed > 0 {
            self.notifier
                .info(
                    "Task Completed",
                    &summary_message(result.completed, result.bytes_saved),
                )
                .await;
        }
        let _ = self.events.send(BatchEvent::Finished(result.clone()));

        match fatal {
            Some(e) => {
                self.notifier.error("Encoder Unavailable", &e.to_string()).await;
                Err(e)
            }
            None => Ok(result),
        }
    }

    async fn process_queue(
        &self,
        items: &mut [WorkItem],
        queue: &[usize],
        request: &BatchRequest,
        ffmpeg: &Path,
        prober: &MediaProber,
    ) -> (BatchResult, Option<BatchError>) {
        let mut result = BatchResult::default();

        for (position, &index) in queue.iter().enumerate() {
            if !self.control.keep_running() {
                info!("Stop requested, not starting further videos");
                break;
            }
            if !self.wait_for_capacity(request).await {
                info!("Stopped while paused");
                break;
            }

            let item = &mut items[index];
            item.begin_processing();
            info!(
                "Processing ({}/{}): {}",
                position + 1,
                queue.len(),
                item.file_name()
            );
            let _ = self.events.send(BatchEvent::ItemStarted {
                index,
                path: item.path().to_path_buf(),
            });
            {
                let mut snapshot = self.snapshot.write().await;
                snapshot.current_item = Some(index);
                snapshot.update_row(index, item);
            }

            let outcome = self
                .process_item(index, item, request, ffmpeg, prober)
                .await;

            match outcome {
                Ok(ItemOutcome::Completed {
                    output,
                    final_bytes,
                    bytes_saved,
                }) => {
                    item.mark_completed();
                    result.completed += 1;
                    result.bytes_saved += bytes_saved;
                    info!(
                        output = %output.display(),
                        new_size_mb = %format!("{:.2}", final_bytes as f64 / BYTES_PER_MB as f64),
                        "Completed"
                    );
                    let _ = self.events.send(BatchEvent::ItemCompleted {
                        index,
                        output,
                        bytes_saved,
                    });
                    let mut snapshot = self.snapshot.write().await;
                    snapshot.completed_items += 1;
                    snapshot.bytes_saved = result.bytes_saved;
                    snapshot.update_row(index, item);
                }
                Ok(ItemOutcome::NoSplitRequired) => {
                    item.mark_completed();
                    result.skipped.push(item.path().to_path_buf());
                    let _ = self.events.send(BatchEvent::ItemSkipped {
                        index,
                        reason: "file already fits in one part".to_string(),
                    });
                    self.snapshot.write().await.update_row(index, item);
                }
                Ok(ItemOutcome::Cancelled) => {
                    info!(path = %item.path().display(), "Cancelled mid-item");
                    item.reset_to_pending();
                    self.snapshot.write().await.update_row(index, item);
                    break;
                }
                Err(ItemError::Supervisor(e)) if e.is_launch_failure() => {
                    error!(path = %item.path().display(), error = %e, "Encoder could not be launched");
                    self.record_failure(index, item, e.to_string(), &mut result)
                        .await;
                    return (result, Some(BatchError::from(e)));
                }
                Err(e) => {
                    error!(
                        path = %item.path().display(),
                        mode = request.mode.as_str(),
                        error = %e,
                        "Video processing failed"
                    );
                    self.record_failure(index, item, e.to_string(), &mut result)
                        .await;
                }
            }
        }

        (result, None)
    }

    async fn record_failure(
        &self,
        index: usize,
        item: &mut WorkItem,
        reason: String,
        result: &mut BatchResult,
    ) {
        item.mark_failed(reason.clone());
        result.failures.push(ItemFailure {
            path: item.path().to_path_buf(),
            reason: reason.clone(),
        });
        let _ = self.events.send(BatchEvent::ItemFailed { index, reason });
        let mut snapshot = self.snapshot.write().await;
        snapshot.failed_items += 1;
        snapshot.update_row(index, item);
    }

    /// Pause while the destination is low on space. Returns false once the
    /// batch has been cancelled.
    async fn wait_for_capacity(&self, request: &BatchRequest) -> bool {
        if let SpaceCheck::Low {
            available_bytes,
            threshold_bytes,
        } = self.gate.check()
        {
            if self.control.pause_for_low_resource() {
                warn!(available_bytes, threshold_bytes, "Low disk space, batch paused");
                self.notifier
                    .error(
                        "Low Disk Space",
                        &format!(
                            "Free space dropped below the {} buffer. Processing is paused; free up \
                             space and resume.",
                            format_saved(threshold_bytes as i64)
                        ),
                    )
                    .await;
            }
        }

        while self.control.is_paused() && self.control.keep_running() {
            tokio::time::sleep(request.pause_poll_interval).await;
        }
        self.control.keep_running()
    }

    async fn process_item(
        &self,
        index: usize,
        item: &mut WorkItem,
        request: &BatchRequest,
        ffmpeg: &Path,
        prober: &MediaProber,
    ) -> Result<ItemOutcome, ItemError> {
        let source = item.path().to_path_buf();
        self.probe_source(item, prober).await;
        let original_bytes = std::fs::metadata(&source)
            .map(|m| m.len())
            .unwrap_or_else(|_| item.size_bytes());
        info!(
            duration_secs = %format!("{:.2}", item.duration_secs()),
            original_size_mb = %format!("{:.2}", original_bytes as f64 / BYTES_PER_MB as f64),
            "Source info"
        );

        if !self.control.keep_running() {
            return Ok(ItemOutcome::Cancelled);
        }

        let inputs = PlanInputs {
            duration_secs: item.duration_secs(),
            original_bytes,
            source_width: item.source_width().unwrap_or(0),
            target_size_mb: item.overrides.target_size_mb,
            resolution: item.overrides.resolution,
            fps: item.overrides.fps,
            trim: item.trim_window(),
        };
        let plan = match plan_encode(request, &inputs)? {
            PlanOutcome::Encode(plan) => plan,
            PlanOutcome::NoSplitRequired => {
                warn!(path = %source.display(), "Split skipped: file already small");
                return Ok(ItemOutcome::NoSplitRequired);
            }
        };
        info!(
            mode = plan.mode.as_str(),
            encoder = %plan.encoder,
            resolution = %plan.resolution,
            fps = %plan.fps,
            trim = ?plan.trim,
            "Encoding settings"
        );

        let output = match &plan.mode {
            EncodeMode::Crf { crf, .. } => {
                self.namer
                    .output_path(&source, OutputKind::Crf(*crf), &request.output_format)
            }
            EncodeMode::TwoPass { target_mb, .. } => self.namer.output_path(
                &source,
                OutputKind::Target(*target_mb),
                &request.output_format,
            ),
            EncodeMode::StreamCopy => {
                self.namer
                    .output_path(&source, OutputKind::Remux, &request.output_format)
            }
            EncodeMode::Split { .. } => self.namer.segment_pattern(&source),
        };
        info!(output = %output.display(), "Output path");

        let pass_log = pass_log_base(&self.work_dir);
        let encoded = self
            .run_invocations(index, item, ffmpeg, &source, &output, &plan, &pass_log)
            .await;
        cleanup_pass_logs(&pass_log);

        if let Err(e) = encoded {
            if !plan.mode.writes_segments() {
                remove_partial_output(&output);
            }
            return Err(e);
        }

        if !self.control.keep_running() {
            if plan.mode.writes_segments() {
                info!(pattern = %output.display(), "Leaving split segments in place");
            } else {
                remove_partial_output(&output);
            }
            return Ok(ItemOutcome::Cancelled);
        }

        let written = if plan.mode.writes_segments() {
            first_segment_path(&output)
        } else {
            output.clone()
        };
        let output_bytes = match std::fs::metadata(&written) {
            Ok(meta) if meta.len() > 0 => meta.len(),
            _ => return Err(ItemError::OutputMissing(written)),
        };

        // Segment sizes are not summed; the split target stands in for them
        let final_bytes = if plan.mode.writes_segments() {
            item.overrides
                .target_size_mb
                .map(|mb| u64::from(mb) * BYTES_PER_MB)
                .unwrap_or(original_bytes)
        } else {
            output_bytes
        };
        let bytes_saved = original_bytes as i64 - final_bytes as i64;

        if request.delete_original && plan.mode.reencodes() {
            match std::fs::remove_file(&source) {
                Ok(()) => info!(path = %source.display(), "Deleted original"),
                Err(e) => warn!(path = %source.display(), error = %e, "Video deletion failed"),
            }
        }

        Ok(ItemOutcome::Completed {
            output,
            final_bytes,
            bytes_saved,
        })
    }

    /// Fill in duration and width once per item. Probe failures leave them unknown.
    async fn probe_source(&self, item: &mut WorkItem, prober: &MediaProber) {
        if !item.duration_loaded() {
            match prober.duration_secs(item.path()).await {
                Ok(duration) => item.set_duration(duration),
                Err(e) => warn!(path = %item.path().display(), error = %e, "Duration probe failed"),
            }
        }
        if item.source_width().is_none() {
            let width = prober.width(item.path()).await.unwrap_or_else(|e| {
                warn!(path = %item.path().display(), error = %e, "Width probe failed");
                0
            });
            item.set_source_width(width);
        }
    }

    #[allow(clippy::too_many_arguments)]
    async fn run_invocations(
        &self,
        index: usize,
        item: &mut WorkItem,
        ffmpeg: &Path,
        source: &Path,
        output: &Path,
        plan: &EncodePlan,
        pass_log: &Path,
    ) -> Result<(), ItemError> {
        let total = plan.progress_total(item.duration_secs());
        let invocations = build_invocations(source, output, plan, pass_log);
        let passes = invocations.len();
        for (pass, invocation) in invocations.iter().enumerate() {
            if !self.control.keep_running() {
                break;
            }
            if passes > 1 {
                info!(pass = pass + 1, passes, "Starting pass");
            }
            self.run_invocation(index, item, ffmpeg, invocation, total)
                .await?;
        }
        Ok(())
    }

    async fn run_invocation(
        &self,
        index: usize,
        item: &mut WorkItem,
        ffmpeg: &Path,
        invocation: &Invocation,
        total: Option<f64>,
    ) -> Result<(), ItemError> {
        let mut process = self.supervisor.start(ffmpeg, &invocation.args)?;

        // A control request may have landed before the process was tracked
        if !self.control.keep_running() {
            self.supervisor.kill();
        } else if self.control.is_paused() {
            self.supervisor.suspend();
        }

        let mut parser = match total {
            Some(seconds) => ProgressParser::with_total_duration(seconds),
            None => ProgressParser::new(),
        };
        let mut tail = VecDeque::with_capacity(STDERR_TAIL_LINES);
        while let Some(line) = process.next_line().await {
            match parser.parse_line(&line) {
                Some(progress) => {
                    self.report_progress(index, item, progress.remapped(invocation.window))
                        .await;
                }
                None => {
                    let line = line.trim();
                    if line.is_empty() {
                        continue;
                    }
                    if tail.len() == STDERR_TAIL_LINES {
                        tail.pop_front();
                    }
                    tail.push_back(line.to_string());
                }
            }
        }

        match process.wait().await? {
            ExitOutcome::Success => Ok(()),
            ExitOutcome::Terminated => {
                debug!(path = %item.path().display(), "Encoder terminated");
                Ok(())
            }
            ExitOutcome::Failed(code) => Err(ItemError::Execution {
                code,
                detail: Vec::from(tail).join(" | "),
            }),
        }
    }

    async fn report_progress(&self, index: usize, item: &mut WorkItem, progress: ConversionProgress) {
        item.apply_progress(&progress);
        let eta = item.eta();
        {
            let mut snapshot = self.snapshot.write().await;
            snapshot.current_speed.clone_from(&progress.speed);
            snapshot.update_row(index, item);
        }
        let _ = self.events.send(BatchEvent::Progress {
            index,
            progress,
            eta,
        });
    }
}

fn remove_partial_output(path: &Path) {
    match std::fs::remove_file(path) {
        Ok(()) => info!(path = %path.display(), "Removed partial output"),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
        Err(e) => warn!(path = %path.display(), error = %e, "Could not remove partial output"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::notify::testing::{Note, RecordingNotifier};
    use crate::resource_gate::testing::FixedSpace;

    fn gate(available: u64) -> Arc<ResourceGate> {
        Arc::new(ResourceGate::new(
            std::env::temp_dir(),
            0,
            Arc::new(FixedSpace::new(available)),
        ))
    }

    #[test]
    fn test_select_queue_filters() {
        let mut items = vec![
            WorkItem::new("/v/a.mp4", 10),
            WorkItem::new("/v/b-CRF28.mp4", 10),
            WorkItem::new("/v/c.mp4", 10),
            WorkItem::new("/v/d.mp4", 10),
        ];
        items[2].selected = false;
        items[3].mark_completed();

        assert_eq!(select_queue(&items, false), vec![0]);
        assert_eq!(select_queue(&items, true), vec![0, 1]);
    }

    #[test]
    fn test_batch_error_from_startup() {
        let missing = StartupError::BinaryMissing {
            name: "ffmpeg",
            requested: "ffmpeg".to_string(),
        };
        assert!(matches!(BatchError::from(missing), BatchError::Launch(_)));

        let denied = StartupError::NotExecutable {
            name: "ffmpeg",
            path: PathBuf::from("/opt/ffmpeg"),
            reason: "denied".to_string(),
        };
        let err = BatchError::from(denied);
        assert!(matches!(err, BatchError::Permission(_)));
        assert!(err.to_string().contains("chmod +x"));
    }

    #[tokio::test]
    async fn test_empty_queue_notifies_and_returns() {
        let notifier = Arc::new(RecordingNotifier::answering(true));
        let orchestrator = BatchOrchestrator::new(
            ToolsConfig {
                ffmpeg_path: "/nonexistent/ffmpeg".to_string(),
                ffprobe_path: "/nonexistent/ffprobe".to_string(),
            },
            gate(u64::MAX),
            notifier.clone(),
        );
        let mut items = vec![WorkItem::new("/v/a-Target25MB.mp4", 10)];

        let result = orchestrator
            .run(&mut items, &BatchRequest::default())
            .await
            .unwrap();
        assert_eq!(result, BatchResult::default());
        assert_eq!(orchestrator.control().state(), BatchState::Idle);
        assert_eq!(
            notifier.notes(),
            vec![Note::Info("No Videos".to_string(), NO_SELECTION_MESSAGE.to_string())]
        );
    }

    #[tokio::test]
    async fn test_missing_encoder_is_fatal_before_start() {
        let orchestrator = BatchOrchestrator::new(
            ToolsConfig {
                ffmpeg_path: "/nonexistent/vidshrink/ffmpeg".to_string(),
                ffprobe_path: "/nonexistent/vidshrink/ffprobe".to_string(),
            },
            gate(u64::MAX),
            Arc::new(RecordingNotifier::answering(true)),
        );
        let mut items = vec![WorkItem::new("/v/a.mp4", 10)];

        let err = orchestrator
            .run(&mut items, &BatchRequest::default())
            .await
            .unwrap_err();
        assert!(matches!(err, BatchError::Launch(_)));
        assert_eq!(orchestrator.control().state(), BatchState::Idle);
        assert!(!items[0].is_processing());
    }

    #[cfg(unix)]
    mod scenarios {
        use super::*;
        use crate::planner::TrimRange;
        use crate::request::ProcessingMode;
        use std::os::unix::fs::PermissionsExt;
        use std::time::Duration;
        use tempfile::TempDir;

        const PROBE: &str = r#"#!/bin/sh
case "$*" in
  *format=duration*) echo 600.000000 ;;
  *) echo 1920 ;;
esac
"#;

        const ENCODE_OK: &str = r#"#!/bin/sh
for last; do :; done
echo "  Duration: 00:10:00.00, start: 0.000000, bitrate: 1000 kb/s" >&2
printf 'frame=  100 fps=50 q=28.0 size=     256kB time=00:05:00.00 bitrate= 100.0kbits/s speed=2.5x\r' >&2
printf 'frame=  200 fps=50 q=28.0 size=     512kB time=00:10:00.00 bitrate= 100.0kbits/s speed=2.5x\r' >&2
printf 'encoded' > "$last"
"#;

        const ENCODE_SLOW: &str = r#"#!/bin/sh
for last; do :; done
printf 'partial' > "$last"
echo "  Duration: 00:10:00.00, start: 0.000000, bitrate: 1000 kb/s" >&2
echo "frame=   10 fps=25 q=28.0 size=      64kB time=00:00:30.00 bitrate= 100.0kbits/s speed=1.0x" >&2
sleep 30
printf 'encoded' > "$last"
"#;

        const ENCODE_FAILS_ON_BAD: &str = r#"#!/bin/sh
for last; do :; done
case "$*" in
  *bad.mp4*)
    echo "bad.mp4: Invalid data found when processing input" >&2
    printf 'junk' > "$last"
    exit 1 ;;
esac
echo "  Duration: 00:10:00.00, start: 0.000000, bitrate: 1000 kb/s" >&2
echo "frame=  200 fps=50 q=28.0 size=     512kB time=00:10:00.00 bitrate= 100.0kbits/s speed=2.5x" >&2
printf 'encoded' > "$last"
"#;

        const ENCODE_RECORDS_ARGS: &str = r#"#!/bin/sh
for last; do :; done
echo "$@" > "$(dirname "$last")/args.txt"
echo "  Duration: 00:10:00.00, start: 0.000000, bitrate: 1000 kb/s" >&2
printf 'encoded' > "$last"
"#;

        const ENCODE_PAUSABLE: &str = r#"#!/bin/sh
for last; do :; done
echo "  Duration: 00:10:00.00, start: 0.000000, bitrate: 1000 kb/s" >&2
echo "frame=  100 fps=50 q=28.0 size=     256kB time=00:05:00.00 bitrate= 100.0kbits/s speed=2.5x" >&2
sleep 1
echo "frame=  200 fps=50 q=28.0 size=     512kB time=00:10:00.00 bitrate= 100.0kbits/s speed=2.5x" >&2
printf 'encoded' > "$last"
"#;

        const ENCODE_SPLIT: &str = r#"#!/bin/sh
for last; do :; done
echo "  Duration: 00:10:00.00, start: 0.000000, bitrate: 1000 kb/s" >&2
echo "frame=  200 fps=50 q=-1.0 size=N/A time=00:10:00.00 bitrate=N/A speed= 40x" >&2
printf 'part' > "$(echo "$last" | sed 's/%03d/000/')"
printf 'part' > "$(echo "$last" | sed 's/%03d/001/')"
"#;

        const ENCODE_SPLIT_SLOW: &str = r#"#!/bin/sh
for last; do :; done
printf 'part' > "$(echo "$last" | sed 's/%03d/000/')"
echo "  Duration: 00:10:00.00, start: 0.000000, bitrate: 1000 kb/s" >&2
echo "frame=  100 fps=50 q=-1.0 size=N/A time=00:05:00.00 bitrate=N/A speed= 40x" >&2
sleep 30
printf 'part' > "$(echo "$last" | sed 's/%03d/001/')"
"#;

        /// Probe that also takes the execute bit off the encoder beside it.
        const PROBE_REVOKES_ENCODER: &str = r#"#!/bin/sh
chmod -x "$(dirname "$0")/ffmpeg"
case "$*" in
  *format=duration*) echo 600.000000 ;;
  *) echo 1920 ;;
esac
"#;

        const MIB: usize = 1024 * 1024;

        struct Fixture {
            dir: TempDir,
            tools: ToolsConfig,
        }

        impl Fixture {
            fn new(encoder: &str) -> Self {
                Self::with_probe(encoder, PROBE)
            }

            fn with_probe(encoder: &str, probe: &str) -> Self {
                let dir = TempDir::new().unwrap();
                let tools_dir = dir.path().join("tools");
                std::fs::create_dir(&tools_dir).unwrap();
                let write_tool = |name: &str, body: &str| {
                    let path = tools_dir.join(name);
                    std::fs::write(&path, body).unwrap();
                    std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();
                    path.display().to_string()
                };
                let tools = ToolsConfig {
                    ffmpeg_path: write_tool("ffmpeg", encoder),
                    ffprobe_path: write_tool("ffprobe", probe),
                };
                Self { dir, tools }
            }

            fn video(&self, name: &str, bytes: usize) -> WorkItem {
                let path = self.dir.path().join(name);
                std::fs::write(&path, vec![0u8; bytes]).unwrap();
                WorkItem::new(path, bytes as u64)
            }

            fn orchestrator(
                &self,
                gate: Arc<ResourceGate>,
                notifier: Arc<RecordingNotifier>,
            ) -> BatchOrchestrator {
                BatchOrchestrator::new(self.tools.clone(), gate, notifier)
                    .with_work_dir(self.dir.path())
            }
        }

        fn request(mode: ProcessingMode) -> BatchRequest {
            BatchRequest {
                mode,
                low_disk_buffer_bytes: 0,
                pause_poll_interval: Duration::from_millis(10),
                ..BatchRequest::default()
            }
        }

        fn drain(rx: &mut broadcast::Receiver<BatchEvent>) -> Vec<BatchEvent> {
            let mut events = Vec::new();
            while let Ok(event) = rx.try_recv() {
                events.push(event);
            }
            events
        }

        #[tokio::test]
        async fn test_crf_encode_reaches_one_hundred_and_completes() {
            let fixture = Fixture::new(ENCODE_OK);
            let notifier = Arc::new(RecordingNotifier::answering(true));
            let orchestrator = fixture.orchestrator(gate(u64::MAX), notifier.clone());
            let mut rx = orchestrator.subscribe();
            let mut items = vec![fixture.video("clip.mp4", 4096)];

            let result = orchestrator
                .run(&mut items, &request(ProcessingMode::Crf))
                .await
                .unwrap();

            assert_eq!(result.completed, 1);
            assert!(result.failures.is_empty());
            assert!(!result.cancelled);
            assert_eq!(result.bytes_saved, 4096 - "encoded".len() as i64);
            assert!(items[0].is_completed());
            assert_eq!(items[0].duration_secs(), 600.0);
            assert_eq!(items[0].source_width(), Some(1920));

            let output = fixture.dir.path().join("clip-CRF28.mp4");
            assert!(std::fs::metadata(&output).unwrap().len() > 0);
            assert!(items[0].path().exists(), "original kept unless configured");

            let events = drain(&mut rx);
            let percentages: Vec<f64> = events
                .iter()
                .filter_map(|e| match e {
                    BatchEvent::Progress { progress, .. } => Some(progress.percentage),
                    _ => None,
                })
                .collect();
            assert_eq!(percentages.len(), 2);
            assert!((percentages[1] - 100.0).abs() < 1e-9);
            assert!(percentages.windows(2).all(|w| w[0] <= w[1]));
            assert!(matches!(events.last(), Some(BatchEvent::Finished(_))));

            assert_eq!(orchestrator.control().state(), BatchState::Completed);
            let snapshot = orchestrator.snapshot().read().await.clone();
            assert_eq!(snapshot.completed_items, 1);
            assert_eq!(snapshot.current_item, None);
            assert!(notifier
                .notes()
                .iter()
                .any(|n| matches!(n, Note::Info(title, _) if title == "Task Completed")));
        }

        #[tokio::test]
        async fn test_two_pass_progress_spans_both_halves() {
            let fixture = Fixture::new(ENCODE_OK);
            let orchestrator = fixture.orchestrator(
                gate(u64::MAX),
                Arc::new(RecordingNotifier::answering(true)),
            );
            let mut rx = orchestrator.subscribe();
            let mut items = vec![fixture.video("talk.mp4", 4096)];
            items[0].overrides.target_size_mb = Some(10);

            let result = orchestrator
                .run(&mut items, &request(ProcessingMode::Crf))
                .await
                .unwrap();
            assert_eq!(result.completed, 1);
            assert!(fixture.dir.path().join("talk-Target10MB.mp4").exists());

            let percentages: Vec<f64> = drain(&mut rx)
                .into_iter()
                .filter_map(|e| match e {
                    BatchEvent::Progress { progress, .. } => Some(progress.percentage),
                    _ => None,
                })
                .collect();
            assert_eq!(percentages, vec![25.0, 50.0, 75.0, 100.0]);

            let leftovers: Vec<_> = std::fs::read_dir(fixture.dir.path())
                .unwrap()
                .filter_map(|e| e.ok())
                .filter(|e| e.file_name().to_string_lossy().starts_with("vidshrink2pass_"))
                .collect();
            assert!(leftovers.is_empty());
        }

        #[tokio::test]
        async fn test_failure_is_recorded_and_batch_continues() {
            let fixture = Fixture::new(ENCODE_FAILS_ON_BAD);
            let orchestrator = fixture.orchestrator(
                gate(u64::MAX),
                Arc::new(RecordingNotifier::answering(true)),
            );
            let mut items = vec![fixture.video("bad.mp4", 2048), fixture.video("good.mp4", 2048)];

            let result = orchestrator
                .run(&mut items, &request(ProcessingMode::Crf))
                .await
                .unwrap();

            assert_eq!(result.completed, 1);
            assert_eq!(result.failures.len(), 1);
            assert!(result.failures[0].path.ends_with("bad.mp4"));
            assert!(result.failures[0].reason.contains("code 1"));
            assert!(result.failures[0].reason.contains("Invalid data"));
            assert!(items[0].is_failed());
            assert!(items[1].is_completed());
            assert!(!fixture.dir.path().join("bad-CRF28.mp4").exists());
            assert_eq!(orchestrator.snapshot().read().await.failed_items, 1);
        }

        #[tokio::test]
        async fn test_cancel_mid_item_deletes_partial_and_stops() {
            let fixture = Fixture::new(ENCODE_SLOW);
            let orchestrator = fixture.orchestrator(
                gate(u64::MAX),
                Arc::new(RecordingNotifier::answering(true)),
            );
            let mut rx = orchestrator.subscribe();
            let control = orchestrator.control();
            let canceller = tokio::spawn(async move {
                loop {
                    match rx.recv().await {
                        Ok(BatchEvent::Progress { .. }) => {
                            control.cancel().unwrap();
                            break;
                        }
                        Ok(_) => continue,
                        Err(_) => break,
                    }
                }
            });
            let mut items = vec![fixture.video("first.mp4", 2048), fixture.video("second.mp4", 2048)];

            let result = tokio::time::timeout(
                Duration::from_secs(10),
                orchestrator.run(&mut items, &request(ProcessingMode::Crf)),
            )
            .await
            .expect("cancel should end the batch promptly")
            .unwrap();
            canceller.await.unwrap();

            assert!(result.cancelled);
            assert_eq!(result.completed, 0);
            assert!(!fixture.dir.path().join("first-CRF28.mp4").exists());
            assert!(!fixture.dir.path().join("second-CRF28.mp4").exists());
            assert!(!items[0].is_completed() && !items[0].is_processing());
            assert_eq!(items[1].status().as_str(), "pending");
            assert_eq!(items[1].duration_secs(), 0.0, "second item was never probed");
            assert_eq!(orchestrator.control().state(), BatchState::Cancelled);
        }

        #[tokio::test]
        async fn test_low_disk_pauses_until_resumed() {
            let fixture = Fixture::new(ENCODE_OK);
            let space = Arc::new(FixedSpace::new(0));
            let gate = Arc::new(ResourceGate::new(fixture.dir.path(), 0, space.clone()));
            let notifier = Arc::new(RecordingNotifier::answering(true));
            let orchestrator = fixture.orchestrator(gate, notifier.clone());
            let control = orchestrator.control();
            let resumer = tokio::spawn(async move {
                while control.state() != BatchState::Paused {
                    tokio::time::sleep(Duration::from_millis(5)).await;
                }
                assert!(control.resume().await.is_err(), "still low, resume refused");
                space.set(u64::MAX);
                control.resume().await.unwrap();
            });
            let mut items = vec![fixture.video("clip.mp4", 4096)];
            let request = BatchRequest {
                low_disk_buffer_bytes: 1_000,
                ..request(ProcessingMode::Crf)
            };

            let result = tokio::time::timeout(
                Duration::from_secs(10),
                orchestrator.run(&mut items, &request),
            )
            .await
            .expect("resume should release the batch")
            .unwrap();
            resumer.await.unwrap();

            assert_eq!(result.completed, 1);
            let notes = notifier.notes();
            assert!(notes
                .iter()
                .any(|n| matches!(n, Note::Error(title, _) if title == "Low Disk Space")));
        }

        #[tokio::test]
        async fn test_stream_copy_keeps_original_even_when_deleting() {
            let fixture = Fixture::new(ENCODE_OK);
            let orchestrator = fixture.orchestrator(
                gate(u64::MAX),
                Arc::new(RecordingNotifier::answering(true)),
            );
            let mut items = vec![fixture.video("raw.mkv", 4096)];
            let request = BatchRequest {
                delete_original: true,
                ..request(ProcessingMode::StreamCopy)
            };

            let result = orchestrator.run(&mut items, &request).await.unwrap();
            assert_eq!(result.completed, 1);
            assert!(fixture.dir.path().join("raw-Remux.mp4").exists());
            assert!(items[0].path().exists());
        }

        #[tokio::test]
        async fn test_crf_with_delete_original_removes_source() {
            let fixture = Fixture::new(ENCODE_OK);
            let orchestrator = fixture.orchestrator(
                gate(u64::MAX),
                Arc::new(RecordingNotifier::answering(true)),
            );
            let mut items = vec![fixture.video("old.mp4", 4096)];
            let request = BatchRequest {
                delete_original: true,
                ..request(ProcessingMode::Crf)
            };

            orchestrator.run(&mut items, &request).await.unwrap();
            assert!(!items[0].path().exists());
            assert!(fixture.dir.path().join("old-CRF28.mp4").exists());
        }

        #[tokio::test]
        async fn test_split_of_small_file_is_skipped() {
            let fixture = Fixture::new(ENCODE_OK);
            let orchestrator = fixture.orchestrator(
                gate(u64::MAX),
                Arc::new(RecordingNotifier::answering(true)),
            );
            let mut items = vec![fixture.video("short.mp4", 4096)];

            let result = orchestrator
                .run(&mut items, &request(ProcessingMode::Split))
                .await
                .unwrap();
            assert_eq!(result.completed, 0);
            assert_eq!(result.skipped.len(), 1);
            assert!(items[0].is_completed());
        }

        #[tokio::test]
        async fn test_trim_set_before_run_reaches_encoder() {
            let fixture = Fixture::new(ENCODE_RECORDS_ARGS);
            let orchestrator = fixture.orchestrator(
                gate(u64::MAX),
                Arc::new(RecordingNotifier::answering(true)),
            );
            let mut items = vec![fixture.video("clip.mp4", 4096)];
            items[0].set_trim_start(10.0);
            items[0].set_trim_end(45.0);

            let result = orchestrator
                .run(&mut items, &request(ProcessingMode::Crf))
                .await
                .unwrap();
            assert_eq!(result.completed, 1);
            assert_eq!(items[0].duration_secs(), 600.0);
            assert_eq!(items[0].trim(), TrimRange { start: 10.0, end: 45.0 });

            let args = std::fs::read_to_string(fixture.dir.path().join("args.txt")).unwrap();
            assert!(args.contains("-ss 10.000"), "args: {}", args);
            assert!(args.contains("-to 45.000"), "args: {}", args);
        }

        #[tokio::test]
        async fn test_launch_failure_mid_batch_is_reported_and_fatal() {
            let fixture = Fixture::with_probe(ENCODE_OK, PROBE_REVOKES_ENCODER);
            let notifier = Arc::new(RecordingNotifier::answering(true));
            let orchestrator = fixture.orchestrator(gate(u64::MAX), notifier.clone());
            let mut rx = orchestrator.subscribe();
            let mut items = vec![fixture.video("first.mp4", 2048), fixture.video("second.mp4", 2048)];

            let err = orchestrator
                .run(&mut items, &request(ProcessingMode::Crf))
                .await
                .unwrap_err();
            assert!(matches!(err, BatchError::Permission(_)));
            assert!(err.to_string().contains("chmod +x"));

            assert!(items[0].is_failed());
            assert_eq!(items[1].status().as_str(), "pending");
            let events = drain(&mut rx);
            assert!(events
                .iter()
                .any(|e| matches!(e, BatchEvent::ItemFailed { index: 0, .. })));
            assert!(matches!(events.last(), Some(BatchEvent::Finished(_))));
            assert_eq!(orchestrator.snapshot().read().await.failed_items, 1);
            assert!(notifier
                .notes()
                .iter()
                .any(|n| matches!(n, Note::Error(title, _) if title == "Encoder Unavailable")));
        }

        #[tokio::test]
        async fn test_pause_mid_encode_holds_encoder_until_resume() {
            let fixture = Fixture::new(ENCODE_PAUSABLE);
            let orchestrator = fixture.orchestrator(
                gate(u64::MAX),
                Arc::new(RecordingNotifier::answering(true)),
            );
            let mut rx = orchestrator.subscribe();
            let control = orchestrator.control();
            let output = fixture.dir.path().join("clip-CRF28.mp4");
            let watched = output.clone();
            let pauser = tokio::spawn(async move {
                loop {
                    match rx.recv().await {
                        Ok(BatchEvent::Progress { .. }) => break,
                        Ok(_) => continue,
                        Err(e) => panic!("events ended before any progress: {}", e),
                    }
                }
                control.pause().unwrap();
                assert_eq!(control.state(), BatchState::Paused);
                tokio::time::sleep(Duration::from_millis(1500)).await;
                let held = !watched.exists();
                let progressed = drain(&mut rx)
                    .iter()
                    .any(|e| matches!(e, BatchEvent::Progress { .. }));
                control.resume().await.unwrap();
                (held, progressed)
            });
            let mut items = vec![fixture.video("clip.mp4", 4096)];

            let result = tokio::time::timeout(
                Duration::from_secs(15),
                orchestrator.run(&mut items, &request(ProcessingMode::Crf)),
            )
            .await
            .expect("resume should let the encode finish")
            .unwrap();
            let (held, progressed) = pauser.await.unwrap();

            assert!(held, "encoder wrote its output while suspended");
            assert!(!progressed, "progress reported while suspended");
            assert_eq!(result.completed, 1);
            assert!(!result.cancelled);
            assert!(output.exists());
            assert_eq!(items[0].progress(), 100.0);
        }

        #[tokio::test]
        async fn test_split_writes_segments_and_approximates_savings() {
            let fixture = Fixture::new(ENCODE_SPLIT);
            let orchestrator = fixture.orchestrator(
                gate(u64::MAX),
                Arc::new(RecordingNotifier::answering(true)),
            );
            let mut rx = orchestrator.subscribe();
            let mut items = vec![fixture.video("long.mp4", 2 * MIB), fixture.video("longer.mp4", 2 * MIB)];
            items[1].overrides.target_size_mb = Some(1);
            let request = BatchRequest {
                split_size_mb: 1,
                delete_original: true,
                ..request(ProcessingMode::Split)
            };

            let result = orchestrator.run(&mut items, &request).await.unwrap();

            assert_eq!(result.completed, 2);
            assert!(result.skipped.is_empty());
            for stem in ["long", "longer"] {
                assert!(fixture.dir.path().join(format!("{}-Part000.mp4", stem)).exists());
                assert!(fixture.dir.path().join(format!("{}-Part001.mp4", stem)).exists());
            }
            // Splitting never re-encodes, so the sources stay
            assert!(items.iter().all(|item| item.path().exists()));

            let saved: Vec<(usize, i64)> = drain(&mut rx)
                .into_iter()
                .filter_map(|e| match e {
                    BatchEvent::ItemCompleted { index, bytes_saved, .. } => Some((index, bytes_saved)),
                    _ => None,
                })
                .collect();
            assert_eq!(saved, vec![(0, 0), (1, MIB as i64)]);
            assert_eq!(result.bytes_saved, MIB as i64);
        }

        #[tokio::test]
        async fn test_split_missing_first_segment_fails_item() {
            let fixture = Fixture::new(ENCODE_OK);
            let orchestrator = fixture.orchestrator(
                gate(u64::MAX),
                Arc::new(RecordingNotifier::answering(true)),
            );
            let mut items = vec![fixture.video("long.mp4", 2 * MIB)];
            let request = BatchRequest {
                split_size_mb: 1,
                ..request(ProcessingMode::Split)
            };

            let result = orchestrator.run(&mut items, &request).await.unwrap();

            assert_eq!(result.completed, 0);
            assert_eq!(result.failures.len(), 1);
            assert!(result.failures[0].reason.contains("long-Part000.mp4"));
            assert!(items[0].is_failed());
        }

        #[tokio::test]
        async fn test_cancel_during_split_leaves_segments() {
            let fixture = Fixture::new(ENCODE_SPLIT_SLOW);
            let orchestrator = fixture.orchestrator(
                gate(u64::MAX),
                Arc::new(RecordingNotifier::answering(true)),
            );
            let mut rx = orchestrator.subscribe();
            let control = orchestrator.control();
            let canceller = tokio::spawn(async move {
                loop {
                    match rx.recv().await {
                        Ok(BatchEvent::Progress { .. }) => {
                            control.cancel().unwrap();
                            break;
                        }
                        Ok(_) => continue,
                        Err(_) => break,
                    }
                }
            });
            let mut items = vec![fixture.video("long.mp4", 2 * MIB)];
            let request = BatchRequest {
                split_size_mb: 1,
                ..request(ProcessingMode::Split)
            };

            let result = tokio::time::timeout(Duration::from_secs(10), orchestrator.run(&mut items, &request))
                .await
                .expect("cancel should end the batch promptly")
                .unwrap();
            canceller.await.unwrap();

            assert!(result.cancelled);
            assert_eq!(result.completed, 0);
            assert!(result.failures.is_empty());
            assert!(fixture.dir.path().join("long-Part000.mp4").exists());
            assert!(!fixture.dir.path().join("long-Part001.mp4").exists());
            assert_eq!(items[0].status().as_str(), "pending");
        }
    }
}
