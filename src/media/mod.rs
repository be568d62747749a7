// SPDX-License-Identifier: GPL-3.0-only

//! Frame packing, encoding and packet output
//!
//! # Modules
//!
//! - [`frame_convert`]: raw capture buffers to owned I420 frames
//! - [`encoders`]: the compression engine seam, FFmpeg engine and encode thread
//! - [`sink`]: writing encoded packets to stdout or a file

pub mod encoders;
pub mod frame_convert;
pub mod sink;

pub use encoders::{CodecEngine, Encoder, EncoderState, FfmpegEngine, FrameSubmitter};
pub use frame_convert::{PlanarFrame, pack_i420};
pub use sink::PacketSink;
