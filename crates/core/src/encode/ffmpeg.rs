//! ffmpeg command-line construction.
//!
//! Argument lists are a pure function of the input, the output and the
//! [`EncodePlan`]. Two-pass plans expand into two invocations, each tagged
//! with the slice of the progress bar it reports into.

use std::ffi::OsString;
use std::path::{Path, PathBuf};

use tracing::debug;
use uuid::Uuid;

use crate::planner::{EncodeMode, EncodePlan, TrimWindow};
use crate::progress::PassWindow;
use crate::request::{FpsChoice, ResolutionChoice};

/// Audio bitrate used for the second pass of a constrained-size encode.
const TWO_PASS_AUDIO_BITRATE: &str = "128k";

/// Where the first pass of a two-pass encode discards its output.
pub fn null_device() -> &'static str {
    if cfg!(windows) {
        "NUL"
    } else {
        "/dev/null"
    }
}

/// Hardware vendor family of an encoder, detected from its codec id.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EncoderFamily {
    Nvenc,
    Amf,
    Qsv,
    Software,
}

impl EncoderFamily {
    pub fn detect(codec: &str) -> Self {
        let codec = codec.to_ascii_lowercase();
        if codec.contains("nvenc") {
            EncoderFamily::Nvenc
        } else if codec.contains("amf") {
            EncoderFamily::Amf
        } else if codec.contains("qsv") {
            EncoderFamily::Qsv
        } else {
            EncoderFamily::Software
        }
    }

    /// Codec selection plus constant-quality flags for this family.
    pub fn quality_args(&self, codec: &str, crf: u32) -> Vec<String> {
        let crf = crf.to_string();
        let crf = crf.as_str();
        let mut args = vec!["-vcodec".to_string(), codec.to_string()];
        let tail: Vec<&str> = match self {
            EncoderFamily::Nvenc => vec!["-preset", "p5", "-rc", "vbr", "-cq", crf],
            EncoderFamily::Amf => vec![
                "-rc", "vbr_peak", "-qp_i", crf, "-qp_p", crf, "-quality", "quality",
            ],
            EncoderFamily::Qsv => vec!["-preset", "veryfast", "-global_quality", crf],
            EncoderFamily::Software => vec!["-crf", crf],
        };
        args.extend(tail.into_iter().map(str::to_string));
        args
    }
}

/// One ffmpeg run.
#[derive(Debug, Clone, PartialEq)]
pub struct Invocation {
    pub args: Vec<OsString>,
    pub window: PassWindow,
}

/// Build every ffmpeg invocation needed to carry out `plan`.
///
/// # Arguments
/// * `input` - Source video
/// * `output` - Output file, or the segment pattern in split mode
/// * `plan` - Parameters decided by the planner
/// * `pass_log` - Base path for two-pass statistics; unused by other modes
pub fn build_invocations(
    input: &Path,
    output: &Path,
    plan: &EncodePlan,
    pass_log: &Path,
) -> Vec<Invocation> {
    match &plan.mode {
        EncodeMode::Crf {
            crf,
            bitrate_cap_kbps,
        } => vec![Invocation {
            args: crf_args(input, output, plan, *crf, *bitrate_cap_kbps),
            window: PassWindow::Full,
        }],
        EncodeMode::TwoPass {
            video_bitrate_kbps, ..
        } => vec![
            Invocation {
                args: two_pass_args(input, output, plan, *video_bitrate_kbps, 1, pass_log),
                window: PassWindow::FirstHalf,
            },
            Invocation {
                args: two_pass_args(input, output, plan, *video_bitrate_kbps, 2, pass_log),
                window: PassWindow::SecondHalf,
            },
        ],
        EncodeMode::StreamCopy => vec![Invocation {
            args: stream_copy_args(input, output, plan.trim),
            window: PassWindow::Full,
        }],
        EncodeMode::Split { segment_seconds } => vec![Invocation {
            args: split_args(input, output, *segment_seconds),
            window: PassWindow::Full,
        }],
    }
}

/// `-vf` value combining scale and fps filters, if any apply.
pub fn video_filter(resolution: ResolutionChoice, fps: FpsChoice) -> Option<String> {
    let mut filters = Vec::new();
    if let ResolutionChoice::Width(width) = resolution {
        filters.push(format!("scale={}:-2", width));
    }
    if let FpsChoice::Fixed(n) = fps {
        filters.push(format!("fps={}", n));
    }
    (!filters.is_empty()).then(|| filters.join(","))
}

fn crf_args(
    input: &Path,
    output: &Path,
    plan: &EncodePlan,
    crf: u32,
    bitrate_cap_kbps: Option<u32>,
) -> Vec<OsString> {
    let mut args = input_args(input, plan.trim);
    push_filter(&mut args, plan);
    args.extend(
        EncoderFamily::detect(&plan.encoder)
            .quality_args(&plan.encoder, crf)
            .into_iter()
            .map(OsString::from),
    );
    if let Some(cap) = bitrate_cap_kbps {
        let maxrate = format!("{}k", cap);
        let bufsize = format!("{}k", cap.saturating_mul(2));
        push_all(&mut args, ["-maxrate", maxrate.as_str()]);
        push_all(&mut args, ["-bufsize", bufsize.as_str()]);
    }
    push_strip(&mut args, plan.strip_metadata);
    args.push(output.as_os_str().to_owned());
    args
}

fn two_pass_args(
    input: &Path,
    output: &Path,
    plan: &EncodePlan,
    video_bitrate_kbps: u32,
    pass: u8,
    pass_log: &Path,
) -> Vec<OsString> {
    let mut args = input_args(input, plan.trim);
    push_filter(&mut args, plan);
    let bitrate = format!("{}k", video_bitrate_kbps);
    let pass_number = pass.to_string();
    push_all(&mut args, ["-c:v", plan.encoder.as_str()]);
    push_all(&mut args, ["-b:v", bitrate.as_str()]);
    push_all(&mut args, ["-pass", pass_number.as_str()]);
    args.push("-passlogfile".into());
    args.push(pass_log.as_os_str().to_owned());

    if pass == 1 {
        push_all(&mut args, ["-an", "-f", "null", null_device()]);
    } else {
        push_all(&mut args, ["-c:a", "aac", "-b:a", TWO_PASS_AUDIO_BITRATE]);
        push_strip(&mut args, plan.strip_metadata);
        args.push(output.as_os_str().to_owned());
    }
    args
}

fn stream_copy_args(input: &Path, output: &Path, trim: Option<TrimWindow>) -> Vec<OsString> {
    let mut args = input_args(input, trim);
    push_all(&mut args, ["-c", "copy", "-map", "0"]);
    args.push(output.as_os_str().to_owned());
    args
}

fn split_args(input: &Path, pattern: &Path, segment_seconds: f64) -> Vec<OsString> {
    let mut args = input_args(input, None);
    push_all(&mut args, ["-c", "copy", "-map", "0", "-f", "segment"]);
    let segment_time = format_seconds(segment_seconds);
    push_all(&mut args, ["-segment_time", segment_time.as_str()]);
    push_all(&mut args, ["-reset_timestamps", "1"]);
    args.push(pattern.as_os_str().to_owned());
    args
}

/// `-y`, trim seek options, then `-i <input>`.
fn input_args(input: &Path, trim: Option<TrimWindow>) -> Vec<OsString> {
    let mut args: Vec<OsString> = vec!["-y".into()];
    if let Some(window) = trim {
        let start = format_seconds(window.start);
        push_all(&mut args, ["-ss", start.as_str()]);
        if let Some(end) = window.end {
            let end = format_seconds(end);
            push_all(&mut args, ["-to", end.as_str()]);
        }
    }
    args.push("-i".into());
    args.push(input.as_os_str().to_owned());
    args
}

fn push_filter(args: &mut Vec<OsString>, plan: &EncodePlan) {
    if let Some(filter) = video_filter(plan.resolution, plan.fps) {
        push_all(args, ["-vf", filter.as_str()]);
    }
}

fn push_strip(args: &mut Vec<OsString>, strip_metadata: bool) {
    if strip_metadata {
        push_all(args, ["-map_metadata", "-1", "-map_chapters", "-1"]);
    }
}

fn push_all<const N: usize>(args: &mut Vec<OsString>, values: [&str; N]) {
    args.extend(values.into_iter().map(OsString::from));
}

fn format_seconds(secs: f64) -> String {
    format!("{:.3}", secs.max(0.0))
}

/// Fresh base path for two-pass statistics inside `dir`.
pub fn pass_log_base(dir: &Path) -> PathBuf {
    dir.join(format!("vidshrink2pass_{}", Uuid::new_v4().simple()))
}

/// Files the encoder may leave behind for a two-pass log base.
pub fn pass_log_files(base: &Path) -> Vec<PathBuf> {
    let base = base.as_os_str().to_string_lossy();
    vec![
        PathBuf::from(format!("{}-0.log", base)),
        PathBuf::from(format!("{}-0.log.mbtree", base)),
        PathBuf::from(format!("{}.log", base)),
    ]
}

/// Remove two-pass statistics; missing files are fine.
pub fn cleanup_pass_logs(base: &Path) {
    for file in pass_log_files(base) {
        match std::fs::remove_file(&file) {
            Ok(()) => debug!(path = %file.display(), "Removed pass log"),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => debug!(path = %file.display(), error = %e, "Could not remove pass log"),
        }
    }
}
