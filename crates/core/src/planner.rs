//! Encode parameter planning.
//!
//! Everything in here is pure: explicit inputs, explicit outputs, no I/O.
//! "Not applicable" results are expressed with `Option` or dedicated enum
//! variants rather than magic numbers.

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::request::{BatchRequest, FpsChoice, ProcessingMode, ResolutionChoice};

/// Audio allowance subtracted from the total bitrate in constrained-size mode.
pub const AUDIO_BITRATE_KBPS: f64 = 128.0;
/// Lowest video bitrate ever planned.
pub const MIN_VIDEO_BITRATE_KBPS: u32 = 100;
/// Fraction of the split target actually aimed for, leaving room for container overhead.
pub const SPLIT_SAFETY_FACTOR: f64 = 0.9;
/// Minimum distance kept between trim start and trim end.
pub const TRIM_MARGIN_SECS: f64 = 0.1;
/// Tolerance used when deciding whether a trim range differs from the full clip.
pub const TRIM_EPSILON_SECS: f64 = 0.001;

const BYTES_PER_MB: f64 = 1024.0 * 1024.0;

/// Never upscale: a requested width at or above the source width means `Original`.
///
/// A source width of 0 means the width is unknown, which also yields `Original`.
pub fn clamp_resolution(source_width: u32, requested: ResolutionChoice) -> ResolutionChoice {
    match requested {
        ResolutionChoice::Width(w) if source_width > 0 && w < source_width => {
            ResolutionChoice::Width(w)
        }
        _ => ResolutionChoice::Original,
    }
}

/// Per-item override wins over the batch-global choice.
pub fn select_fps(item_override: Option<FpsChoice>, global: FpsChoice) -> FpsChoice {
    item_override.unwrap_or(global)
}

/// Video bitrate for a constrained-size encode, in kbps.
///
/// Returns `None` when the duration is unknown.
pub fn target_video_bitrate_kbps(target_mb: u32, duration_secs: f64) -> Option<u32> {
    if duration_secs <= 0.0 || !duration_secs.is_finite() {
        return None;
    }
    let total = f64::from(target_mb) * 8192.0 / duration_secs;
    let video = (total - AUDIO_BITRATE_KBPS).floor();
    if video < f64::from(MIN_VIDEO_BITRATE_KBPS) {
        Some(MIN_VIDEO_BITRATE_KBPS)
    } else {
        Some(video.min(f64::from(u32::MAX)) as u32)
    }
}

/// Result of sizing segments for split mode.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub enum SegmentPlan {
    /// The whole file already fits in one part.
    NoSplitRequired,
    /// Cut every this many seconds.
    SegmentSeconds(f64),
}

/// Segment length assuming bytes are spread evenly over playback time.
pub fn segment_duration(duration_secs: f64, original_bytes: u64, split_mb: u32) -> SegmentPlan {
    if duration_secs <= 0.0 || original_bytes == 0 || split_mb == 0 {
        return SegmentPlan::NoSplitRequired;
    }
    let split_bytes = f64::from(split_mb) * BYTES_PER_MB * SPLIT_SAFETY_FACTOR;
    let original = original_bytes as f64;
    if split_bytes >= original {
        return SegmentPlan::NoSplitRequired;
    }
    SegmentPlan::SegmentSeconds(duration_secs * (split_bytes / original))
}

/// Average source bitrate in kbps, used as a ceiling for CRF encodes.
///
/// Caps under [`MIN_VIDEO_BITRATE_KBPS`] are not worth applying and yield `None`.
pub fn source_bitrate_cap_kbps(original_bytes: u64, duration_secs: f64) -> Option<u32> {
    if duration_secs <= 0.0 || original_bytes == 0 {
        return None;
    }
    let kbps = (original_bytes as f64 * 8.0 / 1024.0 / duration_secs).floor();
    if kbps < f64::from(MIN_VIDEO_BITRATE_KBPS) {
        None
    } else {
        Some(kbps.min(f64::from(u32::MAX)) as u32)
    }
}

/// Trim bounds in seconds from the start of the source.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct TrimRange {
    pub start: f64,
    pub end: f64,
}

/// Move the trim start, pushing the end forward when the margin would be violated.
///
/// `duration` is `None` until the source has been probed; until then only the
/// lower bound is enforced.
pub fn adjust_trim_start(requested: f64, current_end: f64, duration: Option<f64>) -> TrimRange {
    let start = requested.max(0.0);
    let Some(duration) = duration.filter(|d| *d > 0.0) else {
        return TrimRange {
            start,
            end: current_end,
        };
    };
    if start + TRIM_MARGIN_SECS <= current_end {
        return TrimRange {
            start,
            end: current_end,
        };
    }
    let end = start + TRIM_MARGIN_SECS;
    if end <= duration {
        return TrimRange { start, end };
    }
    // Pushed past the end of the source: clamp the end and pull start back
    let end = duration;
    TrimRange {
        start: (end - TRIM_MARGIN_SECS).max(0.0).min(start),
        end,
    }
}

/// Move the trim end, pulling the start back when the margin would be violated.
pub fn adjust_trim_end(requested: f64, current_start: f64, duration: Option<f64>) -> TrimRange {
    let mut end = requested.max(0.0);
    if let Some(duration) = duration.filter(|d| *d > 0.0) {
        end = end.min(duration);
    }
    let start = if end - TRIM_MARGIN_SECS < current_start {
        (end - TRIM_MARGIN_SECS).max(0.0)
    } else {
        current_start
    };
    TrimRange { start, end }
}

/// Fit an existing trim range to a newly probed duration.
///
/// An unset end (0) or one covering the whole previously known clip follows
/// the new duration; otherwise both bounds are clamped into the clip.
pub fn fit_trim_to_duration(range: TrimRange, previous: Option<f64>, duration: f64) -> TrimRange {
    let covers_clip = range.end <= 0.0
        || previous.is_some_and(|p| p > 0.0 && range.end >= p - TRIM_EPSILON_SECS);
    let end = if covers_clip { duration } else { range.end.min(duration) };
    TrimRange {
        start: range.start.clamp(0.0, (end - TRIM_MARGIN_SECS).max(0.0)),
        end,
    }
}

/// Whether a trim range cuts anything off a clip of `duration` seconds.
pub fn is_trimmed(range: TrimRange, duration: f64) -> bool {
    if duration <= 0.0 {
        return false;
    }
    range.start > TRIM_EPSILON_SECS || range.end < duration - TRIM_EPSILON_SECS
}

/// Trim window handed to the argument builder.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct TrimWindow {
    pub start: f64,
    /// `None` encodes through to the end of the source.
    pub end: Option<f64>,
}

impl TrimWindow {
    /// Seconds covered by the window, given the full source duration.
    pub fn length(&self, duration: f64) -> f64 {
        (self.end.unwrap_or(duration) - self.start).max(0.0)
    }
}

/// Concrete encode decided for one item.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub enum EncodeMode {
    Crf {
        crf: u32,
        bitrate_cap_kbps: Option<u32>,
    },
    TwoPass {
        target_mb: u32,
        video_bitrate_kbps: u32,
    },
    StreamCopy,
    Split {
        segment_seconds: f64,
    },
}

impl EncodeMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            EncodeMode::Crf { .. } => "crf",
            EncodeMode::TwoPass { .. } => "two-pass",
            EncodeMode::StreamCopy => "stream-copy",
            EncodeMode::Split { .. } => "split",
        }
    }

    /// Split mode writes a numbered series of files instead of one output.
    pub fn writes_segments(&self) -> bool {
        matches!(self, EncodeMode::Split { .. })
    }

    /// Modes that re-encode video (and therefore honor scaling and fps filters).
    pub fn reencodes(&self) -> bool {
        matches!(self, EncodeMode::Crf { .. } | EncodeMode::TwoPass { .. })
    }
}

/// Full set of parameters for one item.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct EncodePlan {
    pub mode: EncodeMode,
    pub encoder: String,
    pub resolution: ResolutionChoice,
    pub fps: FpsChoice,
    pub strip_metadata: bool,
    pub trim: Option<TrimWindow>,
}

impl EncodePlan {
    /// Seconds the encoder will actually process, when known.
    pub fn progress_total(&self, duration_secs: f64) -> Option<f64> {
        match self.trim {
            Some(window) if duration_secs > 0.0 || window.end.is_some() => {
                Some(window.length(duration_secs)).filter(|len| *len > 0.0)
            }
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum PlanOutcome {
    Encode(EncodePlan),
    /// Split mode on a file that already fits in one part.
    NoSplitRequired,
}

#[derive(Debug, Error, PartialEq)]
pub enum PlanError {
    #[error("cannot size a {target_mb} MB encode: source duration is unknown")]
    DurationUnknown { target_mb: u32 },
}

/// Item-level facts and overrides the planner layers on top of the request.
#[derive(Debug, Clone, Copy, Default)]
pub struct PlanInputs {
    pub duration_secs: f64,
    pub original_bytes: u64,
    /// 0 when unknown.
    pub source_width: u32,
    pub target_size_mb: Option<u32>,
    pub resolution: Option<ResolutionChoice>,
    pub fps: Option<FpsChoice>,
    pub trim: Option<TrimWindow>,
}

/// Decide how to process one item.
///
/// A per-item target size turns a CRF batch into a two-pass encode for that
/// item. Split mode ignores trims and filters since it never re-encodes.
pub fn plan_encode(request: &BatchRequest, inputs: &PlanInputs) -> Result<PlanOutcome, PlanError> {
    let mode = match request.mode {
        ProcessingMode::Crf => match inputs.target_size_mb {
            Some(target_mb) => two_pass(target_mb, inputs.duration_secs)?,
            None => EncodeMode::Crf {
                crf: request.crf,
                bitrate_cap_kbps: if request.prevent_upsampling {
                    source_bitrate_cap_kbps(inputs.original_bytes, inputs.duration_secs)
                } else {
                    None
                },
            },
        },
        ProcessingMode::TargetSize => two_pass(
            inputs.target_size_mb.unwrap_or(request.target_size_mb),
            inputs.duration_secs,
        )?,
        ProcessingMode::StreamCopy => EncodeMode::StreamCopy,
        ProcessingMode::Split => {
            match segment_duration(inputs.duration_secs, inputs.original_bytes, request.split_size_mb) {
                SegmentPlan::NoSplitRequired => return Ok(PlanOutcome::NoSplitRequired),
                SegmentPlan::SegmentSeconds(segment_seconds) => EncodeMode::Split { segment_seconds },
            }
        }
    };

    let requested_resolution = inputs.resolution.unwrap_or(request.resolution);
    let (resolution, fps) = if mode.reencodes() {
        (
            clamp_resolution(inputs.source_width, requested_resolution),
            select_fps(inputs.fps, request.fps),
        )
    } else {
        (ResolutionChoice::Original, FpsChoice::Original)
    };
    let trim = if mode.writes_segments() { None } else { inputs.trim };

    Ok(PlanOutcome::Encode(EncodePlan {
        mode,
        encoder: request.encoder.clone(),
        resolution,
        fps,
        strip_metadata: request.strip_metadata,
        trim,
    }))
}

fn two_pass(target_mb: u32, duration_secs: f64) -> Result<EncodeMode, PlanError> {
    let video_bitrate_kbps = target_video_bitrate_kbps(target_mb, duration_secs)
        .ok_or(PlanError::DurationUnknown { target_mb })?;
    Ok(EncodeMode::TwoPass {
        target_mb,
        video_bitrate_kbps,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn request(mode: ProcessingMode) -> BatchRequest {
        BatchRequest {
            mode,
            ..BatchRequest::default()
        }
    }

    #[test]
    fn test_resolution_never_upscales() {
        assert_eq!(
            clamp_resolution(1280, ResolutionChoice::Width(1920)).to_string(),
            "Original"
        );
        assert_eq!(
            clamp_resolution(1920, ResolutionChoice::Width(1280)).to_string(),
            "1280"
        );
        assert_eq!(
            clamp_resolution(1920, ResolutionChoice::Width(1920)),
            ResolutionChoice::Original
        );
        // Unknown width never risks an upscale
        assert_eq!(
            clamp_resolution(0, ResolutionChoice::Width(640)),
            ResolutionChoice::Original
        );
    }

    #[test]
    fn test_fps_override_wins() {
        assert_eq!(select_fps(Some(FpsChoice::Fixed(24)), FpsChoice::Fixed(60)), FpsChoice::Fixed(24));
        assert_eq!(select_fps(None, FpsChoice::Fixed(60)), FpsChoice::Fixed(60));
        assert_eq!(select_fps(Some(FpsChoice::Original), FpsChoice::Fixed(30)), FpsChoice::Original);
    }

    #[test]
    fn test_bitrate_floor_for_tiny_target() {
        assert_eq!(target_video_bitrate_kbps(1, 600.0), Some(100));
    }

    #[test]
    fn test_bitrate_typical_target() {
        // 25 MB over 60s: 25*8192/60 = 3413.33, minus 128 audio
        assert_eq!(target_video_bitrate_kbps(25, 60.0), Some(3285));
        assert_eq!(target_video_bitrate_kbps(25, 0.0), None);
    }

    #[test]
    fn test_segment_skip_when_file_already_small() {
        let original = (10.0 * BYTES_PER_MB) as u64;
        assert_eq!(segment_duration(600.0, original, 25), SegmentPlan::NoSplitRequired);
        // Exactly at the threshold still skips
        let at_threshold = (25.0 * BYTES_PER_MB * SPLIT_SAFETY_FACTOR) as u64;
        assert_eq!(segment_duration(600.0, at_threshold, 25), SegmentPlan::NoSplitRequired);
    }

    #[test]
    fn test_segment_duration_is_linear_in_size() {
        let original = (100.0 * BYTES_PER_MB) as u64;
        match segment_duration(1000.0, original, 25) {
            SegmentPlan::SegmentSeconds(secs) => assert!((secs - 225.0).abs() < 1e-6),
            other => panic!("expected a segment length, got {:?}", other),
        }
    }

    #[test]
    fn test_segment_unknown_inputs_skip() {
        assert_eq!(segment_duration(0.0, 1 << 30, 25), SegmentPlan::NoSplitRequired);
        assert_eq!(segment_duration(600.0, 0, 25), SegmentPlan::NoSplitRequired);
        assert_eq!(segment_duration(600.0, 1 << 30, 0), SegmentPlan::NoSplitRequired);
    }

    #[test]
    fn test_bitrate_cap() {
        // 75 MB over 600s = 1024 kbps
        assert_eq!(source_bitrate_cap_kbps(75 * 1024 * 1024, 600.0), Some(1024));
        assert_eq!(source_bitrate_cap_kbps(1024, 600.0), None);
        assert_eq!(source_bitrate_cap_kbps(75 * 1024 * 1024, 0.0), None);
    }

    #[test]
    fn test_trim_start_pushes_end() {
        let range = adjust_trim_start(30.0, 20.0, Some(60.0));
        assert_eq!(range.start, 30.0);
        assert!((range.end - 30.1).abs() < 1e-9);
    }

    #[test]
    fn test_trim_end_pulls_start() {
        let range = adjust_trim_end(10.0, 20.0, Some(60.0));
        assert_eq!(range.end, 10.0);
        assert!((range.start - 9.9).abs() < 1e-9);

        let range = adjust_trim_end(0.05, 20.0, Some(60.0));
        assert_eq!(range.start, 0.0);
    }

    #[test]
    fn test_trim_clamps_to_source_bounds() {
        assert_eq!(adjust_trim_start(-5.0, 20.0, Some(60.0)).start, 0.0);
        assert_eq!(adjust_trim_end(90.0, 0.0, Some(60.0)).end, 60.0);

        let range = adjust_trim_start(60.0, 60.0, Some(60.0));
        assert_eq!(range.end, 60.0);
        assert!((range.start - 59.9).abs() < 1e-9);
    }

    #[test]
    fn test_trim_without_duration_only_clamps_start() {
        let range = adjust_trim_start(5.0, 1.0, None);
        assert_eq!(range, TrimRange { start: 5.0, end: 1.0 });
    }

    #[test]
    fn test_fit_trim_keeps_user_bounds() {
        let range = TrimRange { start: 10.0, end: 45.0 };
        assert_eq!(fit_trim_to_duration(range, None, 60.0), range);

        let open = TrimRange { start: 10.0, end: 0.0 };
        assert_eq!(fit_trim_to_duration(open, None, 60.0), TrimRange { start: 10.0, end: 60.0 });

        let past_end = TrimRange { start: 90.0, end: 120.0 };
        let fitted = fit_trim_to_duration(past_end, None, 60.0);
        assert_eq!(fitted.end, 60.0);
        assert!((fitted.start - 59.9).abs() < 1e-9);

        // Whole-clip range follows a re-probe
        let whole = TrimRange { start: 0.0, end: 60.0 };
        assert_eq!(fit_trim_to_duration(whole, Some(60.0), 90.0), TrimRange { start: 0.0, end: 90.0 });
    }

    #[test]
    fn test_is_trimmed() {
        assert!(!is_trimmed(TrimRange { start: 0.0, end: 60.0 }, 60.0));
        assert!(is_trimmed(TrimRange { start: 1.0, end: 60.0 }, 60.0));
        assert!(is_trimmed(TrimRange { start: 0.0, end: 59.0 }, 60.0));
        assert!(!is_trimmed(TrimRange { start: 5.0, end: 10.0 }, 0.0));
    }

    #[test]
    fn test_plan_crf_with_cap_and_clamp() {
        let inputs = PlanInputs {
            duration_secs: 600.0,
            original_bytes: 75 * 1024 * 1024,
            source_width: 1920,
            resolution: Some(ResolutionChoice::Width(1280)),
            ..Default::default()
        };
        let PlanOutcome::Encode(plan) = plan_encode(&request(ProcessingMode::Crf), &inputs).unwrap() else {
            panic!("expected an encode plan");
        };
        assert_eq!(
            plan.mode,
            EncodeMode::Crf {
                crf: 28,
                bitrate_cap_kbps: Some(1024)
            }
        );
        assert_eq!(plan.resolution, ResolutionChoice::Width(1280));
        assert_eq!(plan.encoder, "libx265");
    }

    #[test]
    fn test_plan_item_target_turns_crf_into_two_pass() {
        let inputs = PlanInputs {
            duration_secs: 60.0,
            original_bytes: 500 * 1024 * 1024,
            target_size_mb: Some(25),
            ..Default::default()
        };
        let PlanOutcome::Encode(plan) = plan_encode(&request(ProcessingMode::Crf), &inputs).unwrap() else {
            panic!("expected an encode plan");
        };
        assert_eq!(
            plan.mode,
            EncodeMode::TwoPass {
                target_mb: 25,
                video_bitrate_kbps: 3285
            }
        );
    }

    #[test]
    fn test_plan_two_pass_needs_duration() {
        let inputs = PlanInputs::default();
        assert_eq!(
            plan_encode(&request(ProcessingMode::TargetSize), &inputs),
            Err(PlanError::DurationUnknown { target_mb: 25 })
        );
    }

    #[test]
    fn test_plan_copy_and_split_ignore_filters() {
        let inputs = PlanInputs {
            duration_secs: 1000.0,
            original_bytes: 100 * 1024 * 1024,
            source_width: 3840,
            resolution: Some(ResolutionChoice::Width(1280)),
            fps: Some(FpsChoice::Fixed(30)),
            trim: Some(TrimWindow { start: 5.0, end: None }),
            ..Default::default()
        };
        let PlanOutcome::Encode(copy) = plan_encode(&request(ProcessingMode::StreamCopy), &inputs).unwrap() else {
            panic!("expected an encode plan");
        };
        assert_eq!(copy.resolution, ResolutionChoice::Original);
        assert_eq!(copy.fps, FpsChoice::Original);
        assert!(copy.trim.is_some());

        let PlanOutcome::Encode(split) = plan_encode(&request(ProcessingMode::Split), &inputs).unwrap() else {
            panic!("expected an encode plan");
        };
        assert!(split.mode.writes_segments());
        assert!(split.trim.is_none());
    }

    #[test]
    fn test_plan_split_small_file_is_skipped() {
        let inputs = PlanInputs {
            duration_secs: 100.0,
            original_bytes: 1024,
            ..Default::default()
        };
        assert_eq!(
            plan_encode(&request(ProcessingMode::Split), &inputs),
            Ok(PlanOutcome::NoSplitRequired)
        );
    }

    #[test]
    fn test_progress_total_uses_trim_length() {
        let plan = EncodePlan {
            mode: EncodeMode::StreamCopy,
            encoder: "libx265".to_string(),
            resolution: ResolutionChoice::Original,
            fps: FpsChoice::Original,
            strip_metadata: false,
            trim: Some(TrimWindow { start: 10.0, end: Some(40.0) }),
        };
        assert_eq!(plan.progress_total(600.0), Some(30.0));
        let open_ended = EncodePlan {
            trim: Some(TrimWindow { start: 100.0, end: None }),
            ..plan.clone()
        };
        assert_eq!(open_ended.progress_total(600.0), Some(500.0));
        let untrimmed = EncodePlan { trim: None, ..plan };
        assert_eq!(untrimmed.progress_total(600.0), None);
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(100))]

        // **Property: planned bitrate is never below the floor**
        #[test]
        fn prop_bitrate_never_below_floor(mb in 0u32..100_000, duration in 0.01f64..100_000.0) {
            let kbps = target_video_bitrate_kbps(mb, duration).unwrap();
            prop_assert!(kbps >= MIN_VIDEO_BITRATE_KBPS);
        }

        // **Property: clamped resolution is Original or strictly below the source width**
        #[test]
        fn prop_clamp_never_upscales(source in 0u32..8000, requested in 1u32..8000) {
            match clamp_resolution(source, ResolutionChoice::Width(requested)) {
                ResolutionChoice::Original => prop_assert!(source == 0 || requested >= source),
                ResolutionChoice::Width(w) => {
                    prop_assert_eq!(w, requested);
                    prop_assert!(w < source);
                }
            }
        }

        // **Property: a computed segment is shorter than the source**
        #[test]
        fn prop_segment_shorter_than_source(
            duration in 1.0f64..50_000.0,
            original in 1u64..(50u64 << 30),
            split_mb in 1u32..10_000,
        ) {
            if let SegmentPlan::SegmentSeconds(secs) = segment_duration(duration, original, split_mb) {
                prop_assert!(secs > 0.0);
                prop_assert!(secs < duration);
            }
        }

        // **Property: trim edits keep start >= 0, end <= duration and the margin when room allows**
        #[test]
        fn prop_trim_edits_respect_bounds(
            duration in 1.0f64..10_000.0,
            start in -100.0f64..11_000.0,
            end in -100.0f64..11_000.0,
        ) {
            let edited = adjust_trim_start(start, duration, Some(duration));
            prop_assert!(edited.start >= 0.0);
            prop_assert!(edited.end <= duration);
            prop_assert!(edited.end - edited.start >= TRIM_MARGIN_SECS - 1e-9);

            let edited = adjust_trim_end(end, duration / 2.0, Some(duration));
            prop_assert!(edited.start >= 0.0);
            prop_assert!(edited.end <= duration);
            prop_assert!(edited.start <= edited.end);
            prop_assert!(edited.start == 0.0 || edited.end - edited.start >= TRIM_MARGIN_SECS - 1e-9);
        }
    }
}
