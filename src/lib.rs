// SPDX-License-Identifier: GPL-3.0-only

//! rawenc - stream raw V4L2 camera frames through an asynchronous encoder
//!
//! Frames are captured from memory-mapped device buffers on one thread,
//! packed into I420 and queued, then compressed on a second thread. Encoded
//! packets go to a registered callback (stdout or a file in the binary).
//!
//! # Architecture
//!
//! - [`backends`]: capture device seam, V4L2 device, buffer pool, `Camera`
//! - [`media`]: frame packing, codec engine seam, FFmpeg engine, `Encoder`
//! - [`pipelines`]: work queue, worker threads, `CapturePipeline`
//! - [`config`]: camera/encoder settings and the config file
//!
//! # Example
//!
//! ```no_run
//! use rawenc::config::Config;
//! use rawenc::media::PacketSink;
//! use rawenc::pipelines::CapturePipeline;
//!
//! let config = Config::default();
//! let mut pipeline = CapturePipeline::v4l2(&config.device);
//! pipeline.set_packet_handler(PacketSink::stdout().into_handler())?;
//! pipeline.configure(&config.camera, &config.encoder)?;
//! pipeline.start()?;
//! std::thread::sleep(std::time::Duration::from_secs(5));
//! pipeline.shutdown();
//! # Ok::<(), rawenc::errors::PipelineError>(())
//! ```

pub mod backends;
pub mod config;
pub mod constants;
pub mod errors;
pub mod media;
pub mod pipelines;

// Re-export commonly used types
pub use backends::camera::{Camera, CaptureDevice, CapturedFrame, FrameGeometry, PixelLayout};
pub use config::{CameraConfig, Config, EncoderConfig};
pub use errors::{CaptureError, ConfigError, EncodeError, PipelineError};
pub use media::encoders::{CodecEngine, Encoder};
pub use pipelines::{CapturePipeline, PipelineState};
