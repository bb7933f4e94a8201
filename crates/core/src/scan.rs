//! Folder catalog: discovers candidate videos under a root folder.

use std::path::{Path, PathBuf};

use tracing::debug;
use walkdir::WalkDir;

use crate::item::WorkItem;

/// Video file extensions picked up by default (case-insensitive matching).
pub const VIDEO_EXTENSIONS: &[&str] = &[
    ".mp4", ".mkv", ".mov", ".avi", ".webm", ".m4v", ".flv", ".wmv", ".mpg", ".mpeg", ".ts",
    ".mts", ".m2ts", ".3gp", ".3g2", ".ogv", ".vob", ".asf", ".f4v",
];

/// A candidate video discovered during scanning.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScanCandidate {
    pub path: PathBuf,
    pub size_bytes: u64,
}

/// Result of scanning one folder.
#[derive(Debug, Clone, Default)]
pub struct FolderScan {
    /// Size of every regular file seen, videos or not.
    pub total_bytes: u64,
    pub candidates: Vec<ScanCandidate>,
}

impl FolderScan {
    /// Work items for every candidate, selected by default.
    pub fn work_items(&self) -> Vec<WorkItem> {
        self.candidates
            .iter()
            .map(|c| WorkItem::new(c.path.clone(), c.size_bytes))
            .collect()
    }
}

/// Default extensions plus user-configured ones, lowercased with a leading dot.
pub fn extension_set(custom: &[String]) -> Vec<String> {
    let mut extensions: Vec<String> = VIDEO_EXTENSIONS.iter().map(|e| e.to_string()).collect();
    for ext in custom {
        let ext = ext.trim().to_lowercase();
        if ext.is_empty() {
            continue;
        }
        let ext = if ext.starts_with('.') { ext } else { format!(".{}", ext) };
        if !extensions.contains(&ext) {
            extensions.push(ext);
        }
    }
    extensions
}

/// Checks if a file has one of `extensions` (case-insensitive).
pub fn is_video_file(path: &Path, extensions: &[String]) -> bool {
    path.extension()
        .and_then(|ext| ext.to_str())
        .map(|ext| {
            let ext_lower = format!(".{}", ext.to_lowercase());
            extensions.iter().any(|e| *e == ext_lower)
        })
        .unwrap_or(false)
}

/// Recursively scan `root`.
///
/// Hidden directories (names starting with `.`) below the root are skipped.
/// Candidates are sorted by path.
pub fn scan_folder(root: &Path, extensions: &[String]) -> FolderScan {
    let mut scan = FolderScan::default();
    if !root.exists() {
        return scan;
    }

    let walker = WalkDir::new(root).into_iter().filter_entry(|entry| {
        if entry.file_type().is_dir() && entry.depth() > 0 {
            if let Some(name) = entry.file_name().to_str() {
                return !name.starts_with('.');
            }
        }
        true
    });

    for entry in walker.filter_map(|e| e.ok()) {
        if !entry.file_type().is_file() {
            continue;
        }
        let size_bytes = match entry.metadata() {
            Ok(meta) => meta.len(),
            Err(e) => {
                debug!(path = %entry.path().display(), error = %e, "Skipping unreadable file");
                continue;
            }
        };
        scan.total_bytes = scan.total_bytes.saturating_add(size_bytes);

        if is_video_file(entry.path(), extensions) {
            scan.candidates.push(ScanCandidate {
                path: entry.path().to_path_buf(),
                size_bytes,
            });
        }
    }

    scan.candidates.sort_by(|a, b| a.path.cmp(&b.path));
    scan
}
