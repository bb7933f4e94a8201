//! Per-run batch configuration.
//!
//! A [`BatchRequest`] is built once when a batch starts and is only ever
//! borrowed afterwards. Per-item overrides live on the work item and are
//! layered on top by the planner.

use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::config::Config;

/// Display labels offered for encoders, mapped to codec ids.
pub const ENCODER_LABELS: &[(&str, &str)] = &[
    ("Standard (Slow, Best Quality)", "libx265"),
    ("NVIDIA GeForce (Fastest)", "hevc_nvenc"),
    ("NVIDIA GeForce (Legacy)", "h264_nvenc"),
    ("AMD Radeon (Fastest)", "hevc_amf"),
    ("AMD Radeon (Legacy)", "h264_amf"),
    ("Intel Graphics (Fastest)", "hevc_qsv"),
    ("Intel Graphics (Legacy)", "h264_qsv"),
];

/// Display labels offered for output resolutions, mapped to target widths.
pub const RESOLUTION_LABELS: &[(&str, Option<u32>)] = &[
    ("Original Resolution", None),
    ("4K (3840p)", Some(3840)),
    ("2K (1440p)", Some(2560)),
    ("Full HD (1080p)", Some(1920)),
    ("HD (720p)", Some(1280)),
    ("SD (480p)", Some(854)),
    ("Mobile (360p)", Some(640)),
];

/// Frame-rate choices offered to the user.
pub const FPS_OPTIONS: &[&str] = &["Original", "60", "30", "24"];

/// Codec used when an encoder label is not recognized.
pub const DEFAULT_ENCODER: &str = "libx265";

#[derive(Debug, Error, PartialEq)]
pub enum ChoiceError {
    #[error("unrecognized resolution '{0}'")]
    Resolution(String),
    #[error("unrecognized frame rate '{0}'")]
    Fps(String),
    #[error("unrecognized processing mode '{0}' (expected crf, target, copy or split)")]
    Mode(String),
}

/// Requested output width. `Original` means no scaling filter.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ResolutionChoice {
    Original,
    Width(u32),
}

impl fmt::Display for ResolutionChoice {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ResolutionChoice::Original => write!(f, "Original"),
            ResolutionChoice::Width(w) => write!(f, "{}", w),
        }
    }
}

impl FromStr for ResolutionChoice {
    type Err = ChoiceError;

    /// Accepts a display label ("HD (720p)"), "Original" or a bare width ("1280").
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let trimmed = s.trim();
        if trimmed.eq_ignore_ascii_case("original") {
            return Ok(ResolutionChoice::Original);
        }
        if let Some((_, width)) = RESOLUTION_LABELS.iter().find(|(label, _)| *label == trimmed) {
            return Ok(width.map_or(ResolutionChoice::Original, ResolutionChoice::Width));
        }
        match trimmed.parse::<u32>() {
            Ok(w) if w > 0 => Ok(ResolutionChoice::Width(w)),
            _ => Err(ChoiceError::Resolution(s.to_string())),
        }
    }
}

/// Requested output frame rate. `Original` means no fps filter.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum FpsChoice {
    Original,
    Fixed(u32),
}

impl fmt::Display for FpsChoice {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FpsChoice::Original => write!(f, "Original"),
            FpsChoice::Fixed(n) => write!(f, "{}", n),
        }
    }
}

impl FromStr for FpsChoice {
    type Err = ChoiceError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let trimmed = s.trim();
        if trimmed.eq_ignore_ascii_case("original") {
            return Ok(FpsChoice::Original);
        }
        match trimmed.parse::<u32>() {
            Ok(n) if n > 0 => Ok(FpsChoice::Fixed(n)),
            _ => Err(ChoiceError::Fps(s.to_string())),
        }
    }
}

/// How each item of the batch is processed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProcessingMode {
    /// Single-pass constant-quality encode.
    Crf,
    /// Two-pass encode aiming at a file size.
    TargetSize,
    /// Remux without re-encoding.
    StreamCopy,
    /// Cut into size-bounded segments without re-encoding.
    Split,
}

impl ProcessingMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            ProcessingMode::Crf => "crf",
            ProcessingMode::TargetSize => "target",
            ProcessingMode::StreamCopy => "copy",
            ProcessingMode::Split => "split",
        }
    }
}

impl FromStr for ProcessingMode {
    type Err = ChoiceError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "crf" => Ok(ProcessingMode::Crf),
            "target" | "target_size" | "size" => Ok(ProcessingMode::TargetSize),
            "copy" | "remux" | "stream_copy" => Ok(ProcessingMode::StreamCopy),
            "split" => Ok(ProcessingMode::Split),
            _ => Err(ChoiceError::Mode(s.to_string())),
        }
    }
}

/// Resolve an encoder display label or raw codec id to a codec id.
///
/// Known labels map through [`ENCODER_LABELS`]; anything that looks like a
/// codec id (no spaces) is passed through; everything else falls back to
/// [`DEFAULT_ENCODER`].
pub fn resolve_encoder(label: &str) -> String {
    let trimmed = label.trim();
    if let Some((_, id)) = ENCODER_LABELS.iter().find(|(l, _)| *l == trimmed) {
        return (*id).to_string();
    }
    if !trimmed.is_empty() && !trimmed.contains(char::is_whitespace) {
        return trimmed.to_string();
    }
    DEFAULT_ENCODER.to_string()
}

/// Immutable per-run configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BatchRequest {
    pub crf: u32,
    /// Codec id, e.g. "libx265" or "hevc_nvenc".
    pub encoder: String,
    pub resolution: ResolutionChoice,
    pub fps: FpsChoice,
    pub strip_metadata: bool,
    pub delete_original: bool,
    /// Output container extension, with leading dot.
    pub output_format: String,
    pub mode: ProcessingMode,
    pub target_size_mb: u32,
    pub split_size_mb: u32,
    pub low_disk_buffer_bytes: u64,
    pub reprocess_optimized: bool,
    pub prevent_upsampling: bool,
    #[serde(with = "millis")]
    pub pause_poll_interval: Duration,
}

impl BatchRequest {
    /// Build a request from persisted settings.
    ///
    /// Unparseable resolution or fps settings fall back to `Original`.
    pub fn from_config(config: &Config, mode: ProcessingMode) -> Self {
        let encode = &config.encode;
        Self {
            crf: encode.crf,
            encoder: resolve_encoder(&encode.encoder),
            resolution: encode.resolution.parse().unwrap_or(ResolutionChoice::Original),
            fps: encode.fps.parse().unwrap_or(FpsChoice::Original),
            strip_metadata: encode.strip_metadata,
            delete_original: config.batch.delete_original,
            output_format: normalize_extension(&encode.output_format),
            mode,
            target_size_mb: encode.target_size_mb,
            split_size_mb: encode.split_size_mb,
            low_disk_buffer_bytes: config.low_disk_buffer_bytes(),
            reprocess_optimized: config.batch.process_already_optimized,
            prevent_upsampling: encode.prevent_upsampling,
            pause_poll_interval: Duration::from_millis(config.batch.pause_poll_interval_ms.max(1)),
        }
    }
}

impl Default for BatchRequest {
    fn default() -> Self {
        Self::from_config(&Config::default(), ProcessingMode::Crf)
    }
}

/// Ensure an extension carries its leading dot (".mp4").
pub fn normalize_extension(ext: &str) -> String {
    let trimmed = ext.trim();
    if trimmed.is_empty() {
        ".mp4".to_string()
    } else if trimmed.starts_with('.') {
        trimmed.to_string()
    } else {
        format!(".{}", trimmed)
    }
}

mod millis {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(d.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        Ok(Duration::from_millis(u64::deserialize(d)?))
    }
}
