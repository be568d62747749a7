// SPDX-License-Identifier: GPL-3.0-only

//! Capture and encoder configuration
//!
//! Configuration is immutable once applied: changing it requires stopping the
//! pipeline and configuring it again. Every struct deserializes with per-field
//! defaults, so a config file only needs to list the values it changes.

use crate::constants::{self, encoder as enc};
use crate::errors::ConfigError;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tracing::debug;

/// Capture device settings
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CameraConfig {
    /// Requested frame width
    pub width: u32,
    /// Requested frame height
    pub height: u32,
    /// Number of memory-mapped buffers to request
    pub buffer_count: u32,
}

impl Default for CameraConfig {
    fn default() -> Self {
        Self {
            width: constants::DEFAULT_WIDTH,
            height: constants::DEFAULT_HEIGHT,
            buffer_count: constants::DEFAULT_BUFFER_COUNT,
        }
    }
}

impl CameraConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.width == 0 || self.height == 0 {
            return Err(ConfigError::Invalid(format!(
                "camera size {}x{} must be non-zero",
                self.width, self.height
            )));
        }
        // The device may round the request up, so only zero is rejected here;
        // the granted count is checked against the minimum after the request.
        if self.buffer_count == 0 {
            return Err(ConfigError::Invalid(
                "camera buffer_count must be non-zero".to_string(),
            ));
        }
        Ok(())
    }
}

/// Compression engine settings
///
/// Optional fields that are `None` leave the engine's own default in effect.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct EncoderConfig {
    /// FFmpeg encoder name (`libx264`, `libx265`, ...)
    pub codec: String,
    /// Frame width, must be even
    pub width: u32,
    /// Frame height, must be even
    pub height: u32,
    /// Frame rate of the incoming stream
    pub fps: u32,
    pub preset: Option<String>,
    pub tune: Option<String>,
    /// Constant rate factor
    pub crf: Option<u32>,
    /// Average bitrate in bits per second
    pub bitrate: Option<u64>,
    /// Pictures per group of pictures, 0 for intra only
    pub gop_size: Option<u32>,
    /// Maximum consecutive B-frames; output is delayed by `b_frames + 1`
    pub b_frames: Option<u32>,
}

impl Default for EncoderConfig {
    fn default() -> Self {
        Self {
            codec: enc::DEFAULT_CODEC.to_string(),
            width: constants::DEFAULT_WIDTH,
            height: constants::DEFAULT_HEIGHT,
            fps: enc::DEFAULT_FPS,
            preset: None,
            tune: None,
            crf: None,
            bitrate: Some(enc::DEFAULT_BITRATE),
            gop_size: Some(enc::DEFAULT_GOP_SIZE),
            b_frames: Some(enc::DEFAULT_B_FRAMES),
        }
    }
}

impl EncoderConfig {
    /// Same settings with the frame size replaced (e.g. by the negotiated one)
    pub fn with_geometry(mut self, width: u32, height: u32) -> Self {
        self.width = width;
        self.height = height;
        self
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.codec.trim().is_empty() {
            return Err(ConfigError::Invalid("encoder codec must be set".to_string()));
        }
        if self.width == 0 || self.height == 0 {
            return Err(ConfigError::Invalid(format!(
                "encoder size {}x{} must be non-zero",
                self.width, self.height
            )));
        }
        if self.width % 2 != 0 || self.height % 2 != 0 {
            return Err(ConfigError::Invalid(format!(
                "encoder size {}x{} must be a multiple of two",
                self.width, self.height
            )));
        }
        if self.fps == 0 {
            return Err(ConfigError::Invalid("encoder fps must be non-zero".to_string()));
        }
        Ok(())
    }
}

/// Application configuration, as stored in the config file
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Capture device node
    pub device: PathBuf,
    pub camera: CameraConfig,
    pub encoder: EncoderConfig,
    /// Output file, directory, or `-` for stdout
    pub output: String,
    /// Log file; logs go to stderr when unset
    pub log_file: Option<PathBuf>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            device: PathBuf::from(constants::DEFAULT_DEVICE_PATH),
            camera: CameraConfig::default(),
            encoder: EncoderConfig::default(),
            output: constants::STDOUT_OUTPUT.to_string(),
            log_file: None,
        }
    }
}

impl Config {
    /// Platform config file location (`~/.config/rawenc/config.json` on Linux)
    pub fn default_path() -> Option<PathBuf> {
        dirs::config_dir().map(|dir| {
            dir.join(constants::CONFIG_DIR_NAME)
                .join(constants::CONFIG_FILE_NAME)
        })
    }

    /// Load and validate a config file
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path).map_err(|e| ConfigError::Read {
            path: path.display().to_string(),
            reason: e.to_string(),
        })?;
        let config = Self::from_json(&text)?;
        debug!(path = %path.display(), "Loaded configuration");
        Ok(config)
    }

    /// Parse and validate a JSON document
    pub fn from_json(text: &str) -> Result<Self, ConfigError> {
        let config: Config =
            serde_json::from_str(text).map_err(|e| ConfigError::Parse(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Load `path` if given, else the default location if it exists, else defaults
    pub fn load_or_default(path: Option<&Path>) -> Result<Self, ConfigError> {
        if let Some(path) = path {
            return Self::load(path);
        }
        match Self::default_path() {
            Some(default) if default.is_file() => Self::load(&default),
            _ => Ok(Self::default()),
        }
    }

    pub fn to_json(&self) -> Result<String, ConfigError> {
        serde_json::to_string_pretty(self).map_err(|e| ConfigError::Parse(e.to_string()))
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        self.camera.validate()?;
        self.encoder.validate()?;
        if self.output.trim().is_empty() {
            return Err(ConfigError::Invalid("output must not be empty".to_string()));
        }
        Ok(())
    }
}
