//! Settings for vidshrink
//!
//! Handles loading global batch defaults from TOML files and environment variable overrides.

pub mod config;

pub use config::*;
