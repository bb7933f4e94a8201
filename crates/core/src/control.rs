//! Batch state machine and the control handle shared with outside callers.
//!
//! States: `Idle -> Running -> {Paused <-> Running} -> {Completed | Cancelled}`.
//! Cancellation is cooperative: [`BatchControl::cancel`] clears the keep-running
//! flag first and then kills the active encoder; the orchestrator notices the
//! flag at its next checkpoint.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::broadcast;
use tracing::{info, warn};

use crate::events::BatchEvent;
use crate::notify::{format_saved, Notifier};
use crate::resource_gate::{ResourceGate, SpaceCheck};
use crate::supervisor::ProcessSupervisor;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BatchState {
    Idle,
    Running,
    Paused,
    Completed,
    Cancelled,
}

impl BatchState {
    pub fn as_str(&self) -> &'static str {
        match self {
            BatchState::Idle => "idle",
            BatchState::Running => "running",
            BatchState::Paused => "paused",
            BatchState::Completed => "completed",
            BatchState::Cancelled => "cancelled",
        }
    }

    /// Running or paused.
    pub fn is_active(&self) -> bool {
        matches!(self, BatchState::Running | BatchState::Paused)
    }
}

impl std::fmt::Display for BatchState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PauseReason {
    User,
    LowResource,
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ControlError {
    #[error("cannot resume: {available_bytes} bytes free, {threshold_bytes} required")]
    ResumeRefused {
        available_bytes: u64,
        threshold_bytes: u64,
    },

    #[error("cannot {action} while the batch is {state}")]
    InvalidTransition {
        action: &'static str,
        state: BatchState,
    },
}

#[derive(Debug)]
struct ControlState {
    state: BatchState,
    pause_reason: Option<PauseReason>,
}

struct ControlInner {
    current: Mutex<ControlState>,
    keep_running: AtomicBool,
    supervisor: ProcessSupervisor,
    gate: Arc<ResourceGate>,
    notifier: Arc<dyn Notifier>,
    events: broadcast::Sender<BatchEvent>,
}

/// Clonable handle for pausing, resuming and cancelling a batch.
#[derive(Clone)]
pub struct BatchControl {
    inner: Arc<ControlInner>,
}

impl std::fmt::Debug for BatchControl {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BatchControl")
            .field("current", &*self.inner.current.lock())
            .field("keep_running", &self.keep_running())
            .finish()
    }
}

impl BatchControl {
    pub fn new(
        supervisor: ProcessSupervisor,
        gate: Arc<ResourceGate>,
        notifier: Arc<dyn Notifier>,
        events: broadcast::Sender<BatchEvent>,
    ) -> Self {
        Self {
            inner: Arc::new(ControlInner {
                current: Mutex::new(ControlState {
                    state: BatchState::Idle,
                    pause_reason: None,
                }),
                keep_running: AtomicBool::new(false),
                supervisor,
                gate,
                notifier,
                events,
            }),
        }
    }

    pub fn state(&self) -> BatchState {
        self.inner.current.lock().state
    }

    pub fn pause_reason(&self) -> Option<PauseReason> {
        self.inner.current.lock().pause_reason
    }

    pub fn is_paused(&self) -> bool {
        self.state() == BatchState::Paused
    }

    /// Cleared by [`cancel`](Self::cancel); checked by the orchestrator between steps.
    pub fn keep_running(&self) -> bool {
        self.inner.keep_running.load(Ordering::SeqCst)
    }

    /// Pause on user request, suspending the active encoder.
    pub fn pause(&self) -> Result<(), ControlError> {
        {
            let mut current = self.inner.current.lock();
            match current.state {
                BatchState::Running => {
                    current.state = BatchState::Paused;
                    current.pause_reason = Some(PauseReason::User);
                }
                BatchState::Paused => return Ok(()),
                state => {
                    return Err(ControlError::InvalidTransition {
                        action: "pause",
                        state,
                    })
                }
            }
        }
        self.inner.supervisor.suspend();
        info!("Batch paused");
        self.emit_state(BatchState::Paused);
        Ok(())
    }

    /// Resume a paused batch. Refused while the destination is still low on space.
    pub async fn resume(&self) -> Result<(), ControlError> {
        match self.state() {
            BatchState::Paused => {}
            BatchState::Running => return Ok(()),
            state => {
                return Err(ControlError::InvalidTransition {
                    action: "resume",
                    state,
                })
            }
        }

        if let SpaceCheck::Low {
            available_bytes,
            threshold_bytes,
        } = self.inner.gate.check()
        {
            warn!(available_bytes, threshold_bytes, "Resume refused: disk space still low");
            self.inner
                .notifier
                .error(
                    "Low Disk Space",
                    &format!(
                        "Still below the {} buffer. Free up space before resuming.",
                        format_saved(threshold_bytes as i64)
                    ),
                )
                .await;
            return Err(ControlError::ResumeRefused {
                available_bytes,
                threshold_bytes,
            });
        }

        {
            let mut current = self.inner.current.lock();
            if current.state != BatchState::Paused {
                // Cancelled while the gate was checked
                return Ok(());
            }
            current.state = BatchState::Running;
            current.pause_reason = None;
        }
        self.inner.supervisor.resume();
        info!("Batch resumed");
        self.emit_state(BatchState::Running);
        Ok(())
    }

    /// Stop the batch: clear the keep-running flag, then kill the active encoder.
    pub fn cancel(&self) -> Result<(), ControlError> {
        {
            let mut current = self.inner.current.lock();
            match current.state {
                BatchState::Running | BatchState::Paused => {
                    self.inner.keep_running.store(false, Ordering::SeqCst);
                    current.state = BatchState::Cancelled;
                    current.pause_reason = None;
                }
                BatchState::Cancelled => return Ok(()),
                state => {
                    return Err(ControlError::InvalidTransition {
                        action: "cancel",
                        state,
                    })
                }
            }
        }
        self.inner.supervisor.kill();
        info!("Batch cancelled by user");
        self.emit_state(BatchState::Cancelled);
        Ok(())
    }

    /// Ask for confirmation (unless skipped) and cancel. Returns whether the batch was stopped.
    pub async fn request_stop(&self, skip_confirmation: bool) -> bool {
        if !self.state().is_active() {
            return false;
        }
        if !skip_confirmation {
            let confirmed = self
                .inner
                .notifier
                .confirm(
                    "Stop Processing",
                    "Stop the batch? The video currently being processed will be cancelled.",
                )
                .await;
            if !confirmed {
                return false;
            }
        }
        self.cancel().is_ok()
    }

    pub(crate) fn begin(&self) -> Result<(), ControlError> {
        {
            let mut current = self.inner.current.lock();
            if current.state.is_active() {
                return Err(ControlError::InvalidTransition {
                    action: "start",
                    state: current.state,
                });
            }
            current.state = BatchState::Running;
            current.pause_reason = None;
            self.inner.keep_running.store(true, Ordering::SeqCst);
        }
        self.emit_state(BatchState::Running);
        Ok(())
    }

    /// Enter the paused state because the destination is low on space.
    /// Returns false when the batch was not running.
    pub(crate) fn pause_for_low_resource(&self) -> bool {
        {
            let mut current = self.inner.current.lock();
            if current.state != BatchState::Running {
                return false;
            }
            current.state = BatchState::Paused;
            current.pause_reason = Some(PauseReason::LowResource);
        }
        self.inner.supervisor.suspend();
        self.emit_state(BatchState::Paused);
        true
    }

    /// Settle into a terminal state and release any pause.
    pub(crate) fn finish(&self) -> BatchState {
        let final_state = {
            let mut current = self.inner.current.lock();
            let cancelled =
                current.state == BatchState::Cancelled || !self.inner.keep_running.load(Ordering::SeqCst);
            current.state = if cancelled {
                BatchState::Cancelled
            } else {
                BatchState::Completed
            };
            current.pause_reason = None;
            self.inner.keep_running.store(false, Ordering::SeqCst);
            current.state
        };
        self.emit_state(final_state);
        final_state
    }

    fn emit_state(&self, state: BatchState) {
        // No subscribers is fine
        let _ = self.inner.events.send(BatchEvent::StateChanged(state));
    }
}
