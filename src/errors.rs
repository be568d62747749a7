// SPDX-License-Identifier: GPL-3.0-only

//! Error types for the capture/encode pipeline
//!
//! Setup operations (`configure`, `start`) return these errors to the caller.
//! Failures inside the worker loops never surface here; they are logged and
//! counted in the component statistics instead.

use std::fmt;
use std::io;

/// Result type alias for capture operations
pub type CaptureResult<T> = Result<T, CaptureError>;

/// Result type alias for encoder operations
pub type EncodeResult<T> = Result<T, EncodeError>;

/// Capture device and buffer pool errors
#[derive(Debug)]
pub enum CaptureError {
    /// The device node could not be opened
    DeviceOpen { path: String, reason: String },
    /// The node exists but is not a video capture device
    NotCaptureDevice(String),
    /// The device cannot do streaming I/O
    StreamingUnsupported(String),
    /// No acceptable pixel format could be negotiated
    FormatNegotiation(String),
    /// The device refuses memory-mapped buffers
    MemoryMappingUnsupported,
    /// The device granted fewer buffers than double buffering needs
    InsufficientBuffers { granted: u32, minimum: u32 },
    /// A granted buffer could not be mapped into the process
    BufferMapping { index: u32, reason: String },
    /// A slot index was used while owned by the other side
    BufferOwnership { index: u32, reason: &'static str },
    /// `start` was called before a successful `configure`
    NotConfigured,
    /// `configure` was called on a configured camera
    AlreadyConfigured,
    /// `start` was called while streaming
    AlreadyStreaming,
    /// The capture thread could not be spawned
    ThreadSpawn(String),
    /// A device request failed at the OS level
    Io { operation: &'static str, source: io::Error },
    /// Invalid configuration
    Config(ConfigError),
}

/// Compression engine errors
#[derive(Debug)]
pub enum EncodeError {
    /// No encoder with the given name exists
    CodecNotFound(String),
    /// The encoder exists but could not be opened with the given settings
    Open(String),
    /// The engine rejected a frame (or the end-of-stream marker)
    Submit(String),
    /// The engine failed while producing a packet
    Receive(String),
    /// The raw frame is smaller than its geometry requires
    FrameTooShort { expected: usize, actual: usize },
    /// Frame geometry the planar layout cannot express
    InvalidGeometry(String),
    /// The frame buffer could not be allocated
    Allocation(usize),
    /// Operation requires a configured encoder
    NotConfigured,
    /// `configure` was called before the previous engine was closed
    AlreadyConfigured,
    /// Operation is not valid in the encoder's current state
    InvalidState(&'static str),
    /// The encode thread could not be spawned
    ThreadSpawn(String),
    /// Invalid configuration
    Config(ConfigError),
}

/// Configuration loading and validation errors
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConfigError {
    /// The config file could not be read
    Read { path: String, reason: String },
    /// The config file is not valid JSON for the expected schema
    Parse(String),
    /// A value is out of range
    Invalid(String),
}

/// Errors reported by the pipeline controller
#[derive(Debug)]
pub enum PipelineError {
    /// Capture side failure
    Capture(CaptureError),
    /// Encoder side failure
    Encode(EncodeError),
    /// Configuration failure
    Config(ConfigError),
    /// Operation is not valid in the pipeline's current state
    InvalidState(&'static str),
}

impl fmt::Display for CaptureError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CaptureError::DeviceOpen { path, reason } => {
                write!(f, "Cannot open {}: {}", path, reason)
            }
            CaptureError::NotCaptureDevice(path) => {
                write!(f, "{} is not a video capture device", path)
            }
            CaptureError::StreamingUnsupported(path) => {
                write!(f, "{} does not support streaming I/O", path)
            }
            CaptureError::FormatNegotiation(msg) => write!(f, "Format negotiation failed: {}", msg),
            CaptureError::MemoryMappingUnsupported => {
                write!(f, "Device does not support memory-mapped buffers")
            }
            CaptureError::InsufficientBuffers { granted, minimum } => write!(
                f,
                "Device granted {} buffers, at least {} are required",
                granted, minimum
            ),
            CaptureError::BufferMapping { index, reason } => {
                write!(f, "Unable to map buffer {}: {}", index, reason)
            }
            CaptureError::BufferOwnership { index, reason } => {
                write!(f, "Buffer {} ownership violation: {}", index, reason)
            }
            CaptureError::NotConfigured => write!(f, "Camera is not configured"),
            CaptureError::AlreadyConfigured => write!(f, "Camera is already configured"),
            CaptureError::AlreadyStreaming => write!(f, "Camera is already streaming"),
            CaptureError::ThreadSpawn(msg) => write!(f, "Unable to spawn capture thread: {}", msg),
            CaptureError::Io { operation, source } => write!(f, "{} failed: {}", operation, source),
            CaptureError::Config(e) => write!(f, "{}", e),
        }
    }
}

impl fmt::Display for EncodeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EncodeError::CodecNotFound(name) => write!(f, "Unable to find encoder <{}>", name),
            EncodeError::Open(msg) => write!(f, "Unable to open encoder: {}", msg),
            EncodeError::Submit(msg) => write!(f, "Error sending frame to encoder: {}", msg),
            EncodeError::Receive(msg) => write!(f, "Error during encoding: {}", msg),
            EncodeError::FrameTooShort { expected, actual } => write!(
                f,
                "Frame holds {} bytes, geometry requires {}",
                actual, expected
            ),
            EncodeError::InvalidGeometry(msg) => write!(f, "Invalid frame geometry: {}", msg),
            EncodeError::Allocation(bytes) => {
                write!(f, "Unable to allocate {} byte frame buffer", bytes)
            }
            EncodeError::NotConfigured => write!(f, "Encoder is not configured"),
            EncodeError::AlreadyConfigured => write!(f, "Encoder is already configured"),
            EncodeError::InvalidState(msg) => write!(f, "Invalid encoder state: {}", msg),
            EncodeError::ThreadSpawn(msg) => write!(f, "Unable to spawn encode thread: {}", msg),
            EncodeError::Config(e) => write!(f, "{}", e),
        }
    }
}

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConfigError::Read { path, reason } => write!(f, "Cannot read {}: {}", path, reason),
            ConfigError::Parse(msg) => write!(f, "Invalid configuration file: {}", msg),
            ConfigError::Invalid(msg) => write!(f, "Invalid configuration: {}", msg),
        }
    }
}

impl fmt::Display for PipelineError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PipelineError::Capture(e) => write!(f, "Camera error: {}", e),
            PipelineError::Encode(e) => write!(f, "Encoder error: {}", e),
            PipelineError::Config(e) => write!(f, "{}", e),
            PipelineError::InvalidState(msg) => write!(f, "Invalid pipeline state: {}", msg),
        }
    }
}

impl std::error::Error for CaptureError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            CaptureError::Io { source, .. } => Some(source),
            CaptureError::Config(e) => Some(e),
            _ => None,
        }
    }
}

impl std::error::Error for EncodeError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            EncodeError::Config(e) => Some(e),
            _ => None,
        }
    }
}

impl std::error::Error for ConfigError {}

impl std::error::Error for PipelineError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            PipelineError::Capture(e) => Some(e),
            PipelineError::Encode(e) => Some(e),
            PipelineError::Config(e) => Some(e),
            PipelineError::InvalidState(_) => None,
        }
    }
}

impl From<ConfigError> for CaptureError {
    fn from(err: ConfigError) -> Self {
        CaptureError::Config(err)
    }
}

impl From<ConfigError> for EncodeError {
    fn from(err: ConfigError) -> Self {
        EncodeError::Config(err)
    }
}

impl From<CaptureError> for PipelineError {
    fn from(err: CaptureError) -> Self {
        PipelineError::Capture(err)
    }
}

impl From<EncodeError> for PipelineError {
    fn from(err: EncodeError) -> Self {
        PipelineError::Encode(err)
    }
}

impl From<ConfigError> for PipelineError {
    fn from(err: ConfigError) -> Self {
        PipelineError::Config(err)
    }
}
