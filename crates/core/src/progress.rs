//! Progress parsing for the encoder's diagnostic stream.
//!
//! The encoder prints `Duration: HH:MM:SS.ff` once while opening its input and then
//! periodic status lines carrying `time=HH:MM:SS.ff`, `speed=N.Nx` and `fps=N`.
//! [`ProgressParser`] turns those lines into [`ConversionProgress`] events.

use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};

static DURATION_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"Duration:\s(\d+):(\d+):(\d+\.\d+)").expect("valid duration regex"));
static TIME_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"time=(\d+):(\d+):(\d+\.\d+)").expect("valid time regex"));
static SPEED_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"speed=\s*(\d+\.\d+x)").expect("valid speed regex"));
static FPS_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"fps=\s*(\d+)").expect("valid fps regex"));

/// Speed reported when a status line carries no `speed=` field.
pub const UNKNOWN_SPEED: &str = "0x";
/// Frame rate reported when a status line carries no `fps=` field.
pub const UNKNOWN_FPS: &str = "0";

/// One progress observation for the running encode.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConversionProgress {
    /// Completion in [0, 100].
    pub percentage: f64,
    /// Speed multiplier as printed by the encoder, e.g. "1.5x".
    pub speed: String,
    /// Frames per second as printed by the encoder, e.g. "45".
    pub fps: String,
}

impl ConversionProgress {
    /// Map this event into the slice of the overall progress bar owned by `window`.
    pub fn remapped(self, window: PassWindow) -> Self {
        Self {
            percentage: window.remap(self.percentage),
            ..self
        }
    }
}

/// Which part of the composite progress bar an encoder invocation reports into.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PassWindow {
    /// Single invocation owns the whole [0, 100] range.
    Full,
    /// First pass of a two-pass encode reports into [0, 50].
    FirstHalf,
    /// Second pass of a two-pass encode reports into [50, 100].
    SecondHalf,
}

impl PassWindow {
    pub fn remap(self, percentage: f64) -> f64 {
        match self {
            PassWindow::Full => percentage,
            PassWindow::FirstHalf => percentage * 0.5,
            PassWindow::SecondHalf => 50.0 + percentage * 0.5,
        }
    }
}

/// Stateful parser for one encoder invocation.
///
/// Create a fresh parser per invocation: the cached total duration and the
/// monotonic floor both belong to a single run of the encoder.
#[derive(Debug, Clone, Default)]
pub struct ProgressParser {
    total_seconds: f64,
    last_percentage: f64,
}

impl ProgressParser {
    pub fn new() -> Self {
        Self::default()
    }

    /// Parser with a known total, used when the encode covers only part of the
    /// input (trimmed encodes report positions relative to the trim start).
    pub fn with_total_duration(total_seconds: f64) -> Self {
        Self {
            total_seconds: total_seconds.max(0.0),
            last_percentage: 0.0,
        }
    }

    /// Total duration in seconds, once discovered.
    pub fn total_duration(&self) -> Option<f64> {
        (self.total_seconds > 0.0).then_some(self.total_seconds)
    }

    /// Feed one line of diagnostic output.
    ///
    /// Returns an event only when the line carries a position and the total
    /// duration is already known. Percentages never decrease within one parser.
    pub fn parse_line(&mut self, line: &str) -> Option<ConversionProgress> {
        if self.total_seconds <= 0.0 {
            if let Some(total) = DURATION_RE.captures(line).and_then(|c| clock_seconds(&c)) {
                self.total_seconds = total;
            }
        }

        let current = TIME_RE.captures(line).and_then(|c| clock_seconds(&c))?;
        if self.total_seconds <= 0.0 {
            return None;
        }

        let raw = (current / self.total_seconds * 100.0).clamp(0.0, 100.0);
        let percentage = raw.max(self.last_percentage);
        self.last_percentage = percentage;

        let speed = SPEED_RE
            .captures(line)
            .and_then(|c| c.get(1))
            .map(|m| m.as_str().to_string())
            .unwrap_or_else(|| UNKNOWN_SPEED.to_string());
        let fps = FPS_RE
            .captures(line)
            .and_then(|c| c.get(1))
            .map(|m| m.as_str().to_string())
            .unwrap_or_else(|| UNKNOWN_FPS.to_string());

        Some(ConversionProgress {
            percentage,
            speed,
            fps,
        })
    }

    /// Lazily turn a sequence of lines into progress events.
    pub fn events<I>(self, lines: I) -> ProgressEvents<I::IntoIter>
    where
        I: IntoIterator,
        I::Item: AsRef<str>,
    {
        ProgressEvents {
            parser: self,
            lines: lines.into_iter(),
        }
    }
}

/// Iterator adapter returned by [`ProgressParser::events`].
pub struct ProgressEvents<I> {
    parser: ProgressParser,
    lines: I,
}

impl<I> Iterator for ProgressEvents<I>
where
    I: Iterator,
    I::Item: AsRef<str>,
{
    type Item = ConversionProgress;

    fn next(&mut self) -> Option<Self::Item> {
        for line in self.lines.by_ref() {
            if let Some(event) = self.parser.parse_line(line.as_ref()) {
                return Some(event);
            }
        }
        None
    }
}

/// Convert `HH`, `MM`, `SS.ff` capture groups into seconds.
fn clock_seconds(caps: &regex::Captures<'_>) -> Option<f64> {
    let hours: f64 = caps.get(1)?.as_str().parse().ok()?;
    let minutes: f64 = caps.get(2)?.as_str().parse().ok()?;
    let seconds: f64 = caps.get(3)?.as_str().parse().ok()?;
    Some(hours * 3600.0 + minutes * 60.0 + seconds)
}
