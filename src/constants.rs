// SPDX-License-Identifier: GPL-3.0-only

//! Application-wide constants

use std::time::Duration;

/// Capture device used when neither the config file nor the CLI names one
pub const DEFAULT_DEVICE_PATH: &str = "/dev/video0";

/// Requested capture width (the device may negotiate something else)
pub const DEFAULT_WIDTH: u32 = 640;

/// Requested capture height (the device may negotiate something else)
pub const DEFAULT_HEIGHT: u32 = 480;

/// Number of memory-mapped buffers requested from the device
pub const DEFAULT_BUFFER_COUNT: u32 = 8;

/// Double buffering is the least a streaming capture can work with
pub const MIN_BUFFER_COUNT: u32 = 2;

/// Upper bound on a single device readiness wait.
///
/// The capture thread re-checks its cancel flag at least this often, so it
/// is also the worst-case latency of `Camera::stop`.
pub const DEVICE_POLL_TIMEOUT: Duration = Duration::from_millis(200);

/// Encoder defaults
pub mod encoder {
    /// FFmpeg encoder name (H.264 through libx264)
    pub const DEFAULT_CODEC: &str = "libx264";
    /// Frame rate of the incoming stream
    pub const DEFAULT_FPS: u32 = 30;
    /// Average bitrate in bits per second
    pub const DEFAULT_BITRATE: u64 = 400_000;
    /// Pictures per group of pictures
    pub const DEFAULT_GOP_SIZE: u32 = 10;
    /// Maximum consecutive B-frames (0 keeps output in input order)
    pub const DEFAULT_B_FRAMES: u32 = 0;
}

/// Queue depth above which the encoder is considered to be falling behind
pub const QUEUE_DEPTH_WARNING: usize = 64;

/// Directory name under the platform config dir
pub const CONFIG_DIR_NAME: &str = "rawenc";

/// Config file name inside [`CONFIG_DIR_NAME`]
pub const CONFIG_FILE_NAME: &str = "config.json";

/// Output argument meaning "write the stream to stdout"
pub const STDOUT_OUTPUT: &str = "-";

/// Extension used for raw elementary streams written to a directory
pub const STREAM_FILE_EXTENSION: &str = "h264";

/// Version string stamped by build.rs
pub fn app_version() -> &'static str {
    env!("GIT_VERSION")
}
