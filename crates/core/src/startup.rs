//! Binary preflight.
//!
//! Before a batch starts, the encoder and probe binaries must resolve to an
//! executable file. On unix a binary that lost its execute bit is repaired
//! with `chmod +x`.

use std::path::{Path, PathBuf};

use thiserror::Error;
use tracing::{debug, info};

use crate::config::ToolsConfig;

#[derive(Debug, Error)]
pub enum StartupError {
    #[error("{name} not found at '{requested}'. Install it or set its path in the [tools] config section")]
    BinaryMissing { name: &'static str, requested: String },

    #[error("{name} at {path} is not executable: {reason}. Run: chmod +x \"{path}\"")]
    NotExecutable {
        name: &'static str,
        path: PathBuf,
        reason: String,
    },
}

/// Absolute locations of the external tools.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedTools {
    pub ffmpeg: PathBuf,
    pub ffprobe: PathBuf,
}

/// Resolve both binaries and make sure they can be executed.
pub fn check_binaries(tools: &ToolsConfig) -> Result<ResolvedTools, StartupError> {
    let ffmpeg = resolve_binary("ffmpeg", &tools.ffmpeg_path)?;
    let ffprobe = resolve_binary("ffprobe", &tools.ffprobe_path)?;
    debug!(ffmpeg = %ffmpeg.display(), ffprobe = %ffprobe.display(), "Tools resolved");
    Ok(ResolvedTools { ffmpeg, ffprobe })
}

/// Resolve `requested` (an absolute path, a relative path or a bare name on PATH).
pub fn resolve_binary(name: &'static str, requested: &str) -> Result<PathBuf, StartupError> {
    let candidate = Path::new(requested);
    let path = if candidate.components().count() > 1 || candidate.is_absolute() {
        if !candidate.is_file() {
            return Err(StartupError::BinaryMissing {
                name,
                requested: requested.to_string(),
            });
        }
        candidate.to_path_buf()
    } else {
        match which::which(requested) {
            Ok(path) => path,
            Err(_) => {
                // PATH lookup skips files without the execute bit; try the working directory
                let local = std::env::current_dir()
                    .map(|d| d.join(requested))
                    .ok()
                    .filter(|p| p.is_file());
                local.ok_or_else(|| StartupError::BinaryMissing {
                    name,
                    requested: requested.to_string(),
                })?
            }
        }
    };
    ensure_executable(name, &path)?;
    Ok(path)
}

#[cfg(unix)]
fn ensure_executable(name: &'static str, path: &Path) -> Result<(), StartupError> {
    use std::os::unix::fs::PermissionsExt;

    let not_executable = |reason: String| StartupError::NotExecutable {
        name,
        path: path.to_path_buf(),
        reason,
    };
    let metadata = std::fs::metadata(path).map_err(|e| not_executable(e.to_string()))?;
    let mode = metadata.permissions().mode();
    if mode & 0o111 != 0 {
        return Ok(());
    }

    info!(path = %path.display(), "Granting execute permission");
    let mut permissions = metadata.permissions();
    permissions.set_mode(mode | 0o111);
    std::fs::set_permissions(path, permissions).map_err(|e| not_executable(e.to_string()))
}

#[cfg(not(unix))]
fn ensure_executable(_name: &'static str, _path: &Path) -> Result<(), StartupError> {
    Ok(())
}
