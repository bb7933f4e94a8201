//! User-facing notifications.

use async_trait::async_trait;
use tracing::{error, info, warn};

/// Shown when filtering leaves nothing to process.
pub const NO_SELECTION_MESSAGE: &str = "No videos to process. Files may be unselected, already \
completed, or already optimized (their names contain -CRF or -Target). Enable reprocessing to \
include optimized files.";

/// Sink for messages and confirmations aimed at the user.
#[async_trait]
pub trait Notifier: Send + Sync {
    async fn info(&self, title: &str, message: &str);
    async fn error(&self, title: &str, message: &str);
    async fn confirm(&self, title: &str, question: &str) -> bool;
}

/// Writes notifications to the log. Confirmations answer with `auto_confirm`.
#[derive(Debug, Clone, Copy)]
pub struct LogNotifier {
    pub auto_confirm: bool,
}

impl Default for LogNotifier {
    fn default() -> Self {
        Self { auto_confirm: true }
    }
}

#[async_trait]
impl Notifier for LogNotifier {
    async fn info(&self, title: &str, message: &str) {
        info!(title, "{}", message);
    }

    async fn error(&self, title: &str, message: &str) {
        error!(title, "{}", message);
    }

    async fn confirm(&self, title: &str, question: &str) -> bool {
        warn!(title, answer = self.auto_confirm, "{}", question);
        self.auto_confirm
    }
}

/// "12.50 MB", or GB with two decimals above 1024 MB.
pub fn format_saved(bytes: i64) -> String {
    let mb = bytes as f64 / 1024.0 / 1024.0;
    if mb.abs() > 1024.0 {
        format!("{:.2} GB", mb / 1024.0)
    } else {
        format!("{:.2} MB", mb)
    }
}

/// Completion message shown after a batch with at least one success.
pub fn summary_message(completed: usize, bytes_saved: i64) -> String {
    format!(
        "Successfully processed {} videos.\nTotal space saved: {}",
        completed,
        format_saved(bytes_saved)
    )
}
