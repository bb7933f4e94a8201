//! vidshrink
//!
//! Batch video transcoding orchestrator: drives an external encoder one file at
//! a time, parses its progress stream, plans encode parameters, and supports
//! pause/resume, cancellation and low-disk backpressure.

pub mod control;
pub mod encode;
pub mod events;
pub mod item;
pub mod naming;
pub mod notify;
pub mod orchestrator;
pub mod planner;
pub mod process_control;
pub mod progress;
pub mod request;
pub mod resource_gate;
pub mod scan;
pub mod startup;
pub mod status;
pub mod status_server;
pub mod supervisor;

pub use vidshrink_config as config;
pub use vidshrink_config::Config;
pub use control::{BatchControl, BatchState, ControlError, PauseReason};
pub use encode::{MediaProber, ProbeError};
pub use events::BatchEvent;
pub use item::{ItemOverrides, ItemStatus, WorkItem};
pub use naming::{OutputKind, OutputNamer, SuffixNamer};
pub use notify::{LogNotifier, Notifier};
pub use orchestrator::{BatchError, BatchOrchestrator, BatchResult, ItemError, ItemFailure};
pub use planner::{plan_encode, EncodeMode, EncodePlan, PlanError, PlanInputs, PlanOutcome};
pub use process_control::{platform_control, ProcessControl, ProcessTarget};
pub use progress::{ConversionProgress, PassWindow, ProgressParser};
pub use request::{BatchRequest, FpsChoice, ProcessingMode, ResolutionChoice};
pub use resource_gate::{FreeSpaceSource, ResourceGate, SpaceCheck, SystemDisks};
pub use scan::{scan_folder, FolderScan};
pub use startup::{check_binaries, ResolvedTools, StartupError};
pub use status::{BatchSnapshot, SharedSnapshot};
pub use status_server::{create_status_router, run_status_server, ServerError, StatusState};
pub use supervisor::{ExitOutcome, ProcessSupervisor, SupervisedProcess, SupervisorError};
