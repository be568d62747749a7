// SPDX-License-Identifier: GPL-3.0-only

//! Video encoding
//!
//! [`Encoder`] drives a [`CodecEngine`] on its own thread: frames come in
//! through a [`FrameSubmitter`] on the capture thread, are queued, submitted
//! to the engine by the encode thread, and every packet the engine produces
//! is handed to the registered packet handler.

pub mod controller;
pub mod ffmpeg;

pub use controller::{
    Encoder, EncoderState, EncoderStats, EncoderStatsSnapshot, FrameSubmitter, PacketHandler,
};
pub use ffmpeg::FfmpegEngine;

use super::frame_convert::PlanarFrame;
use crate::errors::EncodeResult;

/// A stream-oriented compression engine
///
/// Engines may hold any number of submitted frames before producing output,
/// so every submission is followed by pulling packets until
/// [`CodecEngine::receive_packet`] returns `Ok(None)`.
pub trait CodecEngine: Send + 'static {
    /// An encoded packet; only borrowed for the duration of the packet callback
    type Packet: AsRef<[u8]>;

    /// Submit a frame, or `None` to signal end of stream
    fn send_frame(&mut self, frame: Option<&PlanarFrame>) -> EncodeResult<()>;

    /// Next completed packet, `Ok(None)` when nothing is available right now
    fn receive_packet(&mut self) -> EncodeResult<Option<Self::Packet>>;

    /// Encoder name, for logging
    fn name(&self) -> &str;
}
