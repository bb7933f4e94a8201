//! Events published while a batch runs.
//!
//! Observers subscribe through [`crate::BatchOrchestrator::subscribe`]. A slow
//! observer may miss events (broadcast lag) but never blocks the batch.

use std::path::PathBuf;

use serde::Serialize;

use crate::control::BatchState;
use crate::orchestrator::BatchResult;
use crate::progress::ConversionProgress;

/// Capacity of the broadcast channel.
pub const EVENT_CHANNEL_CAPACITY: usize = 256;

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum BatchEvent {
    StateChanged(BatchState),
    ItemStarted {
        index: usize,
        path: PathBuf,
    },
    Progress {
        index: usize,
        progress: ConversionProgress,
        eta: String,
    },
    ItemCompleted {
        index: usize,
        output: PathBuf,
        bytes_saved: i64,
    },
    ItemSkipped {
        index: usize,
        reason: String,
    },
    ItemFailed {
        index: usize,
        reason: String,
    },
    Finished(BatchResult),
}
