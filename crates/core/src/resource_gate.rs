//! Low-disk backpressure.
//!
//! The gate compares free space on the destination volume against a byte
//! threshold. Probe errors count as "not low" so a flaky OS query never stalls
//! a batch.

use std::io;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use sysinfo::Disks;
use tracing::debug;

/// Source of free-space readings.
pub trait FreeSpaceSource: Send + Sync {
    fn available_bytes(&self, path: &Path) -> io::Result<u64>;
}

/// Reads free space from the mounted disk that holds the path.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemDisks;

impl FreeSpaceSource for SystemDisks {
    fn available_bytes(&self, path: &Path) -> io::Result<u64> {
        let path = path.canonicalize()?;
        let disks = Disks::new_with_refreshed_list();
        disks
            .list()
            .iter()
            .filter(|disk| path.starts_with(disk.mount_point()))
            .max_by_key(|disk| disk.mount_point().as_os_str().len())
            .map(|disk| disk.available_space())
            .ok_or_else(|| {
                io::Error::new(
                    io::ErrorKind::NotFound,
                    format!("no mounted disk contains {}", path.display()),
                )
            })
    }
}

/// Result of comparing free space with the threshold.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SpaceCheck {
    Sufficient,
    Low {
        available_bytes: u64,
        threshold_bytes: u64,
    },
    /// The reading failed; treated as sufficient.
    Unknown,
}

impl SpaceCheck {
    pub fn is_low(&self) -> bool {
        matches!(self, SpaceCheck::Low { .. })
    }
}

/// Pure comparison used by [`ResourceGate::check`].
pub fn check_free_space(available_bytes: u64, threshold_bytes: u64) -> SpaceCheck {
    if available_bytes < threshold_bytes {
        SpaceCheck::Low {
            available_bytes,
            threshold_bytes,
        }
    } else {
        SpaceCheck::Sufficient
    }
}

pub struct ResourceGate {
    destination: PathBuf,
    threshold_bytes: AtomicU64,
    source: Arc<dyn FreeSpaceSource>,
}

impl std::fmt::Debug for ResourceGate {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ResourceGate")
            .field("destination", &self.destination)
            .field("threshold_bytes", &self.threshold_bytes())
            .finish()
    }
}

impl ResourceGate {
    pub fn new(
        destination: impl Into<PathBuf>,
        threshold_bytes: u64,
        source: Arc<dyn FreeSpaceSource>,
    ) -> Self {
        Self {
            destination: destination.into(),
            threshold_bytes: AtomicU64::new(threshold_bytes),
            source,
        }
    }

    /// Gate backed by the real disk list.
    pub fn for_system(destination: impl Into<PathBuf>, threshold_bytes: u64) -> Self {
        Self::new(destination, threshold_bytes, Arc::new(SystemDisks))
    }

    pub fn threshold_bytes(&self) -> u64 {
        self.threshold_bytes.load(Ordering::Relaxed)
    }

    /// Each batch brings its own buffer setting.
    pub fn set_threshold_bytes(&self, threshold_bytes: u64) {
        self.threshold_bytes.store(threshold_bytes, Ordering::Relaxed);
    }

    pub fn destination(&self) -> &Path {
        &self.destination
    }

    pub fn check(&self) -> SpaceCheck {
        match self.source.available_bytes(&self.destination) {
            Ok(available) => check_free_space(available, self.threshold_bytes()),
            Err(e) => {
                debug!(path = %self.destination.display(), error = %e, "Free space query failed");
                SpaceCheck::Unknown
            }
        }
    }

    pub fn is_low(&self) -> bool {
        self.check().is_low()
    }
}
