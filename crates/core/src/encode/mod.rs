//! Encoder and probe command handling

pub mod ffmpeg;
pub mod probe;

pub use ffmpeg::{
    build_invocations, cleanup_pass_logs, null_device, pass_log_base, EncoderFamily, Invocation,
};
pub use probe::{MediaProber, ProbeError};
