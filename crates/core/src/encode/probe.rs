//! Media probing through ffprobe.
//!
//! Two single-value queries per item: duration in seconds and the width of
//! the first video stream. Callers treat any failure as "unknown".

use std::path::{Path, PathBuf};

use thiserror::Error;
use tokio::process::Command;

#[derive(Debug, Error)]
pub enum ProbeError {
    /// ffprobe exited unsuccessfully.
    #[error("ffprobe failed: {0}")]
    FfprobeFailed(String),

    /// Output did not contain the expected value.
    #[error("Failed to parse ffprobe output: {0}")]
    ParseError(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

#[derive(Debug, Clone)]
pub struct MediaProber {
    ffprobe: PathBuf,
}

impl MediaProber {
    pub fn new(ffprobe: impl Into<PathBuf>) -> Self {
        Self {
            ffprobe: ffprobe.into(),
        }
    }

    pub fn program(&self) -> &Path {
        &self.ffprobe
    }

    /// Container duration in seconds.
    pub async fn duration_secs(&self, path: &Path) -> Result<f64, ProbeError> {
        let stdout = self
            .query(
                &[
                    "-v",
                    "error",
                    "-show_entries",
                    "format=duration",
                    "-of",
                    "default=noprint_wrappers=1:nokey=1",
                ],
                path,
            )
            .await?;
        parse_duration_output(&stdout)
    }

    /// Pixel width of the first video stream.
    pub async fn width(&self, path: &Path) -> Result<u32, ProbeError> {
        let stdout = self
            .query(
                &[
                    "-v",
                    "error",
                    "-select_streams",
                    "v:0",
                    "-show_entries",
                    "stream=width",
                    "-of",
                    "csv=p=0",
                ],
                path,
            )
            .await?;
        parse_width_output(&stdout)
    }

    async fn query(&self, args: &[&str], path: &Path) -> Result<String, ProbeError> {
        let output = Command::new(&self.ffprobe)
            .args(args)
            .arg(path)
            .kill_on_drop(true)
            .output()
            .await?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(ProbeError::FfprobeFailed(format!(
                "ffprobe exited with status {}: {}",
                output.status,
                stderr.trim()
            )));
        }
        Ok(String::from_utf8_lossy(&output.stdout).into_owned())
    }
}

/// Parse `format=duration` output ("600.040000").
pub fn parse_duration_output(stdout: &str) -> Result<f64, ProbeError> {
    let value = first_value(stdout)?;
    match value.parse::<f64>() {
        Ok(secs) if secs.is_finite() && secs > 0.0 => Ok(secs),
        _ => Err(ProbeError::ParseError(format!("not a duration: '{}'", value))),
    }
}

/// Parse `stream=width` csv output ("1920", sometimes with a trailing comma).
pub fn parse_width_output(stdout: &str) -> Result<u32, ProbeError> {
    let value = first_value(stdout)?;
    let value = value.trim_end_matches(',');
    match value.parse::<u32>() {
        Ok(width) if width > 0 => Ok(width),
        _ => Err(ProbeError::ParseError(format!("not a width: '{}'", value))),
    }
}

fn first_value(stdout: &str) -> Result<&str, ProbeError> {
    stdout
        .lines()
        .map(str::trim)
        .find(|line| !line.is_empty())
        .ok_or_else(|| ProbeError::ParseError("empty output".to_string()))
}
