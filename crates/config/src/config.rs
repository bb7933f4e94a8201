//! Core settings structures and loading logic

use serde::{Deserialize, Serialize};
use std::env;
use std::fs;
use std::path::Path;

/// Error type for configuration operations
#[derive(Debug)]
pub enum ConfigError {
    /// IO error reading config file
    Io(std::io::Error),
    /// TOML parsing error
    Parse(toml::de::Error),
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigError::Io(e) => write!(f, "Failed to read config file: {}", e),
            ConfigError::Parse(e) => write!(f, "Failed to parse config: {}", e),
        }
    }
}

impl std::error::Error for ConfigError {}

impl From<std::io::Error> for ConfigError {
    fn from(e: std::io::Error) -> Self {
        ConfigError::Io(e)
    }
}

impl From<toml::de::Error> for ConfigError {
    fn from(e: toml::de::Error) -> Self {
        ConfigError::Parse(e)
    }
}

/// Encode defaults applied to every batch unless overridden
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct EncodeConfig {
    /// Constant-quality value (lower = better quality, larger file)
    #[serde(default = "default_crf")]
    pub crf: u32,
    /// Encoder codec id or display label (e.g. "libx265", "NVIDIA GeForce (Fastest)")
    #[serde(default = "default_encoder")]
    pub encoder: String,
    /// Target resolution label or width ("Original", "1920", "HD (720p)")
    #[serde(default = "default_original")]
    pub resolution: String,
    /// Target FPS label ("Original", "60", "30", "24")
    #[serde(default = "default_original")]
    pub fps: String,
    /// Drop container metadata and chapters
    #[serde(default = "default_true")]
    pub strip_metadata: bool,
    /// Output container extension, with leading dot
    #[serde(default = "default_output_format")]
    pub output_format: String,
    /// Global target size for constrained-size mode
    #[serde(default = "default_size_mb")]
    pub target_size_mb: u32,
    /// Target size of each part in split mode
    #[serde(default = "default_size_mb")]
    pub split_size_mb: u32,
    /// Cap CRF encodes at the source's average bitrate
    #[serde(default = "default_true")]
    pub prevent_upsampling: bool,
    /// Encoders offered to the user
    #[serde(default = "default_enabled_encoders")]
    pub enabled_encoders: Vec<String>,
}

fn default_crf() -> u32 {
    28
}

fn default_encoder() -> String {
    "libx265".to_string()
}

fn default_original() -> String {
    "Original".to_string()
}

fn default_true() -> bool {
    true
}

fn default_output_format() -> String {
    ".mp4".to_string()
}

fn default_size_mb() -> u32 {
    25
}

fn default_enabled_encoders() -> Vec<String> {
    vec!["libx265".to_string()]
}

impl Default for EncodeConfig {
    fn default() -> Self {
        Self {
            crf: default_crf(),
            encoder: default_encoder(),
            resolution: default_original(),
            fps: default_original(),
            strip_metadata: true,
            output_format: default_output_format(),
            target_size_mb: default_size_mb(),
            split_size_mb: default_size_mb(),
            prevent_upsampling: true,
            enabled_encoders: default_enabled_encoders(),
        }
    }
}

/// Batch behaviour configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct BatchConfig {
    /// Delete the source file after a successful encode
    #[serde(default)]
    pub delete_original: bool,
    /// Pause the batch when free space on the destination drops below this many GiB
    #[serde(default = "default_low_disk_buffer_gb")]
    pub low_disk_buffer_gb: u64,
    /// Re-encode files whose names already carry an output marker
    #[serde(default)]
    pub process_already_optimized: bool,
    /// Poll interval of the low-disk pause loop
    #[serde(default = "default_pause_poll_interval_ms")]
    pub pause_poll_interval_ms: u64,
    /// Extra extensions picked up by the folder scan (e.g. ".mxf")
    #[serde(default)]
    pub custom_extensions: Vec<String>,
}

fn default_low_disk_buffer_gb() -> u64 {
    5
}

fn default_pause_poll_interval_ms() -> u64 {
    1000
}

impl Default for BatchConfig {
    fn default() -> Self {
        Self {
            delete_original: false,
            low_disk_buffer_gb: default_low_disk_buffer_gb(),
            process_already_optimized: false,
            pause_poll_interval_ms: default_pause_poll_interval_ms(),
            custom_extensions: Vec::new(),
        }
    }
}

/// Locations of the external binaries
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ToolsConfig {
    #[serde(default = "default_ffmpeg_path")]
    pub ffmpeg_path: String,
    #[serde(default = "default_ffprobe_path")]
    pub ffprobe_path: String,
}

fn default_ffmpeg_path() -> String {
    "ffmpeg".to_string()
}

fn default_ffprobe_path() -> String {
    "ffprobe".to_string()
}

impl Default for ToolsConfig {
    fn default() -> Self {
        Self {
            ffmpeg_path: default_ffmpeg_path(),
            ffprobe_path: default_ffprobe_path(),
        }
    }
}

/// Main configuration structure
#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq)]
pub struct Config {
    #[serde(default)]
    pub encode: EncodeConfig,
    #[serde(default)]
    pub batch: BatchConfig,
    #[serde(default)]
    pub tools: ToolsConfig,
}

impl Config {
    /// Load configuration from a TOML file
    pub fn load_from_file<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let content = fs::read_to_string(path)?;
        Self::parse_toml(&content)
    }

    /// Parse configuration from a TOML string
    pub fn parse_toml(content: &str) -> Result<Self, ConfigError> {
        let config: Config = toml::from_str(content)?;
        Ok(config)
    }

    /// Low-disk buffer expressed in bytes
    pub fn low_disk_buffer_bytes(&self) -> u64 {
        self.batch.low_disk_buffer_gb.saturating_mul(1024 * 1024 * 1024)
    }

    /// Apply environment variable overrides to the configuration
    ///
    /// Overrides the following values if environment variables are set:
    /// - VIDSHRINK_CRF -> encode.crf
    /// - VIDSHRINK_ENCODER -> encode.encoder
    /// - VIDSHRINK_LOW_DISK_BUFFER_GB -> batch.low_disk_buffer_gb
    /// - VIDSHRINK_DELETE_ORIGINAL -> batch.delete_original
    /// - VIDSHRINK_FFMPEG_PATH -> tools.ffmpeg_path
    /// - VIDSHRINK_FFPROBE_PATH -> tools.ffprobe_path
    pub fn apply_env_overrides(&mut self) {
        if let Ok(val) = env::var("VIDSHRINK_CRF") {
            if let Ok(crf) = val.parse::<u32>() {
                self.encode.crf = crf;
            }
        }

        if let Ok(val) = env::var("VIDSHRINK_ENCODER") {
            if !val.trim().is_empty() {
                self.encode.encoder = val;
            }
        }

        if let Ok(val) = env::var("VIDSHRINK_LOW_DISK_BUFFER_GB") {
            if let Ok(gb) = val.parse::<u64>() {
                self.batch.low_disk_buffer_gb = gb;
            }
        }

        if let Ok(val) = env::var("VIDSHRINK_DELETE_ORIGINAL") {
            // Accept "true", "1", "yes" as true; "false", "0", "no" as false
            match val.to_lowercase().as_str() {
                "true" | "1" | "yes" => self.batch.delete_original = true,
                "false" | "0" | "no" => self.batch.delete_original = false,
                _ => {} // Invalid value, keep existing
            }
        }

        if let Ok(val) = env::var("VIDSHRINK_FFMPEG_PATH") {
            if !val.trim().is_empty() {
                self.tools.ffmpeg_path = val;
            }
        }

        if let Ok(val) = env::var("VIDSHRINK_FFPROBE_PATH") {
            if !val.trim().is_empty() {
                self.tools.ffprobe_path = val;
            }
        }
    }

    /// Load configuration from file and apply environment overrides
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let mut config = Self::load_from_file(path)?;
        config.apply_env_overrides();
        Ok(config)
    }

    /// Load configuration if the file exists, otherwise start from defaults.
    /// Environment overrides are applied in both cases.
    pub fn load_or_default<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let mut config = if path.as_ref().exists() {
            Self::load_from_file(path)?
        } else {
            Self::default()
        };
        config.apply_env_overrides();
        Ok(config)
    }
}
