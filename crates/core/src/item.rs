//! Work items: one source file plus its per-item overrides and live state.
//!
//! Derived fields (ETA, badges, readiness) are computed on read so they can
//! never go stale relative to the fields they depend on.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::naming::is_already_optimized;
use crate::planner::{self, TrimRange, TrimWindow};
use crate::progress::ConversionProgress;
use crate::request::{FpsChoice, ResolutionChoice};

/// Lifecycle of an item within a batch.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ItemStatus {
    Pending,
    Processing,
    Completed,
    Failed(String),
}

impl ItemStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ItemStatus::Pending => "pending",
            ItemStatus::Processing => "processing",
            ItemStatus::Completed => "completed",
            ItemStatus::Failed(_) => "failed",
        }
    }
}

/// Settings that override the batch request for one item.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ItemOverrides {
    pub target_size_mb: Option<u32>,
    pub resolution: Option<ResolutionChoice>,
    pub fps: Option<FpsChoice>,
}

impl ItemOverrides {
    pub fn is_empty(&self) -> bool {
        self.target_size_mb.is_none() && self.resolution.is_none() && self.fps.is_none()
    }
}

/// One file queued for processing.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkItem {
    path: PathBuf,
    size_bytes: u64,
    duration_secs: f64,
    source_width: Option<u32>,
    pub selected: bool,
    pub overrides: ItemOverrides,
    trim: TrimRange,
    status: ItemStatus,
    progress: f64,
    speed: String,
    fps: String,
}

impl WorkItem {
    pub fn new(path: impl Into<PathBuf>, size_bytes: u64) -> Self {
        Self {
            path: path.into(),
            size_bytes,
            duration_secs: 0.0,
            source_width: None,
            selected: true,
            overrides: ItemOverrides::default(),
            trim: TrimRange { start: 0.0, end: 0.0 },
            status: ItemStatus::Pending,
            progress: 0.0,
            speed: String::new(),
            fps: String::new(),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn file_name(&self) -> String {
        self.path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default()
    }

    pub fn size_bytes(&self) -> u64 {
        self.size_bytes
    }

    /// Probed duration, 0 until known.
    pub fn duration_secs(&self) -> f64 {
        self.duration_secs
    }

    pub fn duration_loaded(&self) -> bool {
        self.duration_secs > 0.0
    }

    /// Record the probed duration. A trim set earlier is kept, clamped to the clip.
    pub fn set_duration(&mut self, duration_secs: f64) {
        if duration_secs > 0.0 && duration_secs.is_finite() {
            self.trim = planner::fit_trim_to_duration(self.trim, self.known_duration(), duration_secs);
            self.duration_secs = duration_secs;
        }
    }

    pub fn source_width(&self) -> Option<u32> {
        self.source_width
    }

    pub fn set_source_width(&mut self, width: u32) {
        self.source_width = Some(width);
    }

    pub fn status(&self) -> &ItemStatus {
        &self.status
    }

    pub fn is_processing(&self) -> bool {
        self.status == ItemStatus::Processing
    }

    pub fn is_completed(&self) -> bool {
        self.status == ItemStatus::Completed
    }

    pub fn is_failed(&self) -> bool {
        matches!(self.status, ItemStatus::Failed(_))
    }

    pub fn progress(&self) -> f64 {
        self.progress
    }

    pub fn speed(&self) -> &str {
        &self.speed
    }

    pub fn fps(&self) -> &str {
        &self.fps
    }

    pub fn trim(&self) -> TrimRange {
        self.trim
    }

    pub fn set_trim_start(&mut self, start: f64) {
        self.trim = planner::adjust_trim_start(start, self.trim.end, self.known_duration());
    }

    pub fn set_trim_end(&mut self, end: f64) {
        self.trim = planner::adjust_trim_end(end, self.trim.start, self.known_duration());
    }

    fn known_duration(&self) -> Option<f64> {
        self.duration_loaded().then_some(self.duration_secs)
    }

    pub fn is_trimmed(&self) -> bool {
        planner::is_trimmed(self.trim, self.duration_secs)
    }

    /// Trim window for the encoder, `None` when the whole clip is used.
    pub fn trim_window(&self) -> Option<TrimWindow> {
        if !self.is_trimmed() {
            return None;
        }
        let end = (self.trim.end > 0.0 && self.trim.end < self.duration_secs - planner::TRIM_EPSILON_SECS)
            .then_some(self.trim.end);
        Some(TrimWindow {
            start: self.trim.start,
            end,
        })
    }

    /// "01:05 - 02:30" when trimmed, empty otherwise.
    pub fn trim_display(&self) -> String {
        if !self.is_trimmed() {
            return String::new();
        }
        format!("{} - {}", format_clock(self.trim.start), format_clock(self.trim.end))
    }

    /// Filename carries a marker left by an earlier run.
    pub fn is_already_optimized(&self) -> bool {
        is_already_optimized(&self.path)
    }

    pub fn is_ready(&self) -> bool {
        !self.is_processing() && !self.is_completed() && !self.is_already_optimized()
    }

    /// Processing has started but no progress has been reported yet.
    pub fn show_indeterminate(&self) -> bool {
        self.is_processing() && self.progress <= 0.0
    }

    pub fn has_custom_settings(&self) -> bool {
        !self.overrides.is_empty() || self.is_trimmed()
    }

    /// Compact summary of overrides, e.g. "25MB | 1280 | 30 Fps | 00:10 - 01:00".
    pub fn custom_settings_badge(&self) -> String {
        let mut parts = Vec::new();
        if let Some(mb) = self.overrides.target_size_mb {
            parts.push(format!("{}MB", mb));
        }
        if let Some(ResolutionChoice::Width(w)) = self.overrides.resolution {
            parts.push(w.to_string());
        }
        if let Some(FpsChoice::Fixed(n)) = self.overrides.fps {
            parts.push(format!("{} Fps", n));
        }
        if self.is_trimmed() {
            parts.push(self.trim_display());
        }
        parts.join(" | ")
    }

    /// Drop overrides and restore the full-clip trim.
    pub fn reset_custom_settings(&mut self) {
        self.overrides = ItemOverrides::default();
        let end = if self.duration_loaded() { self.duration_secs } else { 0.0 };
        self.trim = TrimRange { start: 0.0, end };
    }

    /// Human-readable time remaining for the current encode.
    pub fn eta(&self) -> String {
        estimate_remaining(self.progress, &self.speed, self.duration_secs)
    }

    pub(crate) fn begin_processing(&mut self) {
        self.status = ItemStatus::Processing;
        self.progress = 0.0;
        self.speed.clear();
        self.fps.clear();
    }

    pub(crate) fn apply_progress(&mut self, progress: &ConversionProgress) {
        self.progress = progress.percentage.clamp(0.0, 100.0);
        self.speed.clone_from(&progress.speed);
        self.fps.clone_from(&progress.fps);
    }

    pub(crate) fn mark_completed(&mut self) {
        self.status = ItemStatus::Completed;
        self.progress = 100.0;
    }

    pub(crate) fn mark_failed(&mut self, reason: impl Into<String>) {
        self.status = ItemStatus::Failed(reason.into());
    }

    /// Return an interrupted item to the queue.
    pub(crate) fn reset_to_pending(&mut self) {
        self.status = ItemStatus::Pending;
        self.progress = 0.0;
        self.speed.clear();
        self.fps.clear();
    }
}

/// ETA text from percentage, speed string ("1.5x") and full duration.
pub fn estimate_remaining(percentage: f64, speed: &str, duration_secs: f64) -> String {
    if percentage >= 100.0 {
        return "Done".to_string();
    }
    let multiplier = speed
        .trim()
        .trim_end_matches('x')
        .parse::<f64>()
        .ok()
        .filter(|s| *s > 0.0 && s.is_finite());
    let Some(multiplier) = multiplier.filter(|_| duration_secs > 0.0) else {
        return "Calculating...".to_string();
    };

    let remaining = (duration_secs * (1.0 - percentage / 100.0) / multiplier).max(0.0) as u64;
    let hours = remaining / 3600;
    let minutes = (remaining % 3600) / 60;
    let seconds = remaining % 60;
    if hours >= 1 {
        format!("{}h {}m remaining", hours, minutes)
    } else {
        format!("{}m {}s remaining", minutes, seconds)
    }
}

/// "mm:ss", or "h:mm:ss" past an hour.
pub fn format_clock(secs: f64) -> String {
    let total = secs.max(0.0) as u64;
    let hours = total / 3600;
    let minutes = (total % 3600) / 60;
    let seconds = total % 60;
    if hours > 0 {
        format!("{}:{:02}:{:02}", hours, minutes, seconds)
    } else {
        format!("{:02}:{:02}", minutes, seconds)
    }
}
