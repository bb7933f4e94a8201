//! Output naming.
//!
//! Outputs are written next to their source with a suffix describing how they
//! were produced. The same suffixes are what marks a file as already optimized
//! on later runs. That check is a plain substring match on the file name, so a
//! user file that happens to contain "-CRF" or "-Target" is skipped too.

use std::path::{Path, PathBuf};

/// Filename substrings left by earlier runs.
pub const OPTIMIZED_MARKERS: &[&str] = &["-CRF", "-Target"];

/// Placeholder the segment muxer replaces with the part number.
pub const SEGMENT_NUMBER_PLACEHOLDER: &str = "%03d";

/// How an output was produced, which decides its suffix.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutputKind {
    Crf(u32),
    Target(u32),
    Remux,
}

impl OutputKind {
    pub fn suffix(&self) -> String {
        match self {
            OutputKind::Crf(crf) => format!("-CRF{}", crf),
            OutputKind::Target(mb) => format!("-Target{}MB", mb),
            OutputKind::Remux => "-Remux".to_string(),
        }
    }
}

/// Produces output locations for the orchestrator.
pub trait OutputNamer: Send + Sync {
    /// Collision-free path for a single-file output.
    fn output_path(&self, input: &Path, kind: OutputKind, extension: &str) -> PathBuf;

    /// Path pattern for segment outputs, containing [`SEGMENT_NUMBER_PLACEHOLDER`].
    fn segment_pattern(&self, input: &Path) -> PathBuf;
}

/// Default namer: `<stem><suffix><ext>` beside the input, with " (n)" on collision.
#[derive(Debug, Clone, Copy, Default)]
pub struct SuffixNamer;

impl OutputNamer for SuffixNamer {
    fn output_path(&self, input: &Path, kind: OutputKind, extension: &str) -> PathBuf {
        let dir = input.parent().unwrap_or_else(|| Path::new(""));
        let stem = file_stem(input);
        let base = format!("{}{}", stem, kind.suffix());
        unique_path(dir, &base, extension)
    }

    fn segment_pattern(&self, input: &Path) -> PathBuf {
        let dir = input.parent().unwrap_or_else(|| Path::new(""));
        let ext = input
            .extension()
            .map(|e| format!(".{}", e.to_string_lossy()))
            .unwrap_or_default();
        dir.join(format!(
            "{}-Part{}{}",
            file_stem(input),
            SEGMENT_NUMBER_PLACEHOLDER,
            ext
        ))
    }
}

/// First file the segment muxer writes for `pattern`.
pub fn first_segment_path(pattern: &Path) -> PathBuf {
    PathBuf::from(
        pattern
            .to_string_lossy()
            .replacen(SEGMENT_NUMBER_PLACEHOLDER, "000", 1),
    )
}

/// Whether the file name carries a marker from an earlier run (case-insensitive).
pub fn is_already_optimized(path: &Path) -> bool {
    let Some(name) = path.file_name() else {
        return false;
    };
    let name = name.to_string_lossy().to_lowercase();
    OPTIMIZED_MARKERS
        .iter()
        .any(|marker| name.contains(&marker.to_lowercase()))
}

fn file_stem(path: &Path) -> String {
    path.file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_default()
}

fn unique_path(dir: &Path, base: &str, extension: &str) -> PathBuf {
    let candidate = dir.join(format!("{}{}", base, extension));
    if !candidate.exists() {
        return candidate;
    }
    let mut counter = 1u32;
    loop {
        let candidate = dir.join(format!("{} ({}){}", base, counter, extension));
        if !candidate.exists() {
            return candidate;
        }
        counter += 1;
    }
}
