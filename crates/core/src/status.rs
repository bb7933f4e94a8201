//! Status snapshot shared with observers.
//!
//! The orchestrator writes the snapshot as items progress; readers (the HTTP
//! status endpoint, the CLI) only ever take the read lock.

use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::sync::RwLock;

use crate::control::BatchState;
use crate::item::WorkItem;

/// Per-item row as presented to observers
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ItemRow {
    pub index: usize,
    pub path: String,
    pub file_name: String,
    pub status: String,
    pub progress: f64,
    pub eta: String,
    pub speed: String,
    pub fps: String,
    pub selected: bool,
    pub already_optimized: bool,
    pub custom_settings: String,
}

impl ItemRow {
    pub fn from_item(index: usize, item: &WorkItem) -> Self {
        Self {
            index,
            path: item.path().display().to_string(),
            file_name: item.file_name(),
            status: item.status().as_str().to_string(),
            progress: item.progress(),
            eta: if item.is_processing() { item.eta() } else { String::new() },
            speed: item.speed().to_string(),
            fps: item.fps().to_string(),
            selected: item.selected,
            already_optimized: item.is_already_optimized(),
            custom_settings: item.custom_settings_badge(),
        }
    }
}

/// Host resource readings
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct SystemMetrics {
    pub cpu_usage_percent: f32,
    pub mem_usage_percent: f32,
}

/// Complete batch snapshot
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct BatchSnapshot {
    pub timestamp_unix_ms: i64,
    pub state: BatchState,
    pub items: Vec<ItemRow>,
    pub current_item: Option<usize>,
    pub current_speed: String,
    pub queue_len: usize,
    pub completed_items: u64,
    pub failed_items: u64,
    pub bytes_saved: i64,
    pub system: SystemMetrics,
}

impl Default for BatchSnapshot {
    fn default() -> Self {
        Self {
            timestamp_unix_ms: 0,
            state: BatchState::Idle,
            items: Vec::new(),
            current_item: None,
            current_speed: String::new(),
            queue_len: 0,
            completed_items: 0,
            failed_items: 0,
            bytes_saved: 0,
            system: SystemMetrics::default(),
        }
    }
}

impl BatchSnapshot {
    /// Replace the row for `index`, growing the table if needed.
    pub fn update_row(&mut self, index: usize, item: &WorkItem) {
        let row = ItemRow::from_item(index, item);
        match self.items.iter_mut().find(|r| r.index == index) {
            Some(existing) => *existing = row,
            None => self.items.push(row),
        }
        self.touch();
    }

    /// Clear fields that only mean something while an item is in flight.
    pub fn reset_transient(&mut self) {
        self.current_item = None;
        self.current_speed.clear();
        for row in &mut self.items {
            row.eta.clear();
            row.speed.clear();
            row.fps.clear();
        }
        self.touch();
    }

    pub fn touch(&mut self) {
        self.timestamp_unix_ms = now_unix_ms();
    }
}

/// Shared snapshot for concurrent readers
pub type SharedSnapshot = Arc<RwLock<BatchSnapshot>>;

pub fn new_shared_snapshot() -> SharedSnapshot {
    Arc::new(RwLock::new(BatchSnapshot::default()))
}

/// Collects current cpu and memory usage using sysinfo
pub fn collect_system_metrics() -> SystemMetrics {
    use sysinfo::System;

    let mut sys = System::new();
    sys.refresh_cpu_usage();
    sys.refresh_memory();

    let total_memory = sys.total_memory();
    let mem_usage = if total_memory > 0 {
        (sys.used_memory() as f64 / total_memory as f64 * 100.0) as f32
    } else {
        0.0
    };

    SystemMetrics {
        cpu_usage_percent: sys.global_cpu_usage(),
        mem_usage_percent: mem_usage,
    }
}

fn now_unix_ms() -> i64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_millis() as i64)
        .unwrap_or(0)
}
