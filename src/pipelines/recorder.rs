// SPDX-License-Identifier: GPL-3.0-only

//! Capture-to-encoder pipeline
//!
//! Wires the camera's frame callback into the encoder's work queue and owns
//! the ordering between the two sides:
//!
//! - configure: camera first, then the encoder at the *negotiated* size
//! - start: encoder thread first, so no frame arrives without a consumer
//! - stop: camera first, so nothing is submitted after the encoder stops
//! - finalize: flush the encoder on the caller's thread, then close it

use crate::backends::camera::{
    Camera, CaptureDevice, CaptureStatsSnapshot, FrameGeometry, V4l2Device,
};
use crate::config::{CameraConfig, EncoderConfig};
use crate::errors::PipelineError;
use crate::media::encoders::{CodecEngine, Encoder, EncoderStatsSnapshot, FfmpegEngine};
use std::path::PathBuf;
use tracing::{debug, info, warn};

/// Pipeline lifecycle: `Unconfigured → Configured → Streaming → Stopped`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PipelineState {
    Unconfigured,
    Configured,
    Streaming,
    Stopped,
}

/// One capture device feeding one encoder
pub struct CapturePipeline<D: CaptureDevice, E: CodecEngine> {
    camera: Camera<D>,
    encoder: Encoder<E>,
    state: PipelineState,
    geometry: Option<FrameGeometry>,
}

impl CapturePipeline<V4l2Device, FfmpegEngine> {
    /// V4L2 capture from `device` into FFmpeg
    pub fn v4l2(device: impl Into<PathBuf>) -> Self {
        Self::new(Camera::v4l2(device), Encoder::ffmpeg())
    }
}

impl<D: CaptureDevice, E: CodecEngine> CapturePipeline<D, E> {
    pub fn new(camera: Camera<D>, encoder: Encoder<E>) -> Self {
        Self {
            camera,
            encoder,
            state: PipelineState::Unconfigured,
            geometry: None,
        }
    }

    /// Register the callback that receives every encoded packet
    pub fn set_packet_handler(
        &mut self,
        handler: impl FnMut(&[u8]) + Send + 'static,
    ) -> Result<(), PipelineError> {
        self.encoder.set_packet_handler(handler)?;
        Ok(())
    }

    /// Configure the camera, then the encoder at the negotiated frame size.
    ///
    /// On failure both sides are released and the pipeline stays unconfigured.
    pub fn configure(
        &mut self,
        camera_config: &CameraConfig,
        encoder_config: &EncoderConfig,
    ) -> Result<FrameGeometry, PipelineError> {
        match self.state {
            PipelineState::Configured | PipelineState::Streaming => {
                return Err(PipelineError::InvalidState("pipeline is already configured"));
            }
            PipelineState::Stopped => {
                warn!("Reconfiguring without finalize, buffered packets are lost");
                self.encoder.close();
            }
            PipelineState::Unconfigured => {}
        }

        let geometry = self.camera.configure(camera_config)?;
        if let Err(e) = self.configure_encoder(geometry, encoder_config) {
            self.camera.stop();
            self.encoder.close();
            return Err(e);
        }

        info!(geometry = %geometry, codec = %encoder_config.codec, "Pipeline configured");
        self.geometry = Some(geometry);
        self.state = PipelineState::Configured;
        Ok(geometry)
    }

    fn configure_encoder(
        &mut self,
        geometry: FrameGeometry,
        encoder_config: &EncoderConfig,
    ) -> Result<(), PipelineError> {
        if geometry.width != encoder_config.width || geometry.height != encoder_config.height {
            info!(
                width = geometry.width,
                height = geometry.height,
                "Encoding at the negotiated frame size"
            );
        }
        let encoder_config = encoder_config
            .clone()
            .with_geometry(geometry.width, geometry.height);
        self.encoder.configure(&encoder_config)?;

        let submitter = self.encoder.submitter(geometry)?;
        self.camera.set_frame_handler(move |frame| {
            submitter.submit_captured(frame);
        })?;
        Ok(())
    }

    /// Start the encode thread, then capture.
    ///
    /// If capture cannot start, the encoder is closed as well and the
    /// pipeline returns to unconfigured.
    pub fn start(&mut self) -> Result<(), PipelineError> {
        match self.state {
            PipelineState::Configured => {}
            PipelineState::Streaming => {
                return Err(PipelineError::InvalidState("pipeline is already streaming"));
            }
            PipelineState::Unconfigured | PipelineState::Stopped => {
                return Err(PipelineError::InvalidState("pipeline is not configured"));
            }
        }

        self.encoder.start()?;
        if let Err(e) = self.camera.start() {
            warn!(error = %e, "Capture failed to start, releasing encoder");
            self.encoder.close();
            self.camera.stop();
            self.geometry = None;
            self.state = PipelineState::Unconfigured;
            return Err(e.into());
        }

        self.state = PipelineState::Streaming;
        info!("Pipeline streaming");
        Ok(())
    }

    /// Stop capture, then the encode thread. Queued frames are discarded.
    ///
    /// Safe to call in any state, any number of times.
    pub fn stop(&mut self) {
        self.camera.stop();
        self.encoder.stop();
        match self.state {
            PipelineState::Configured | PipelineState::Streaming => {
                self.state = PipelineState::Stopped;
                info!("Pipeline stopped");
            }
            _ => debug!(state = ?self.state, "Pipeline stop ignored"),
        }
    }

    /// Flush the encoder and close it. Returns the number of packets flushed;
    /// calling it again returns 0.
    pub fn finalize(&mut self) -> u64 {
        if matches!(
            self.state,
            PipelineState::Configured | PipelineState::Streaming
        ) {
            // A configured camera still holds its mappings and the open node
            self.stop();
        }
        let flushed = self.encoder.finalize();
        self.encoder.close();
        if self.state != PipelineState::Unconfigured {
            self.state = PipelineState::Unconfigured;
            self.geometry = None;
            info!(packets = flushed, "Pipeline finalized");
        }
        flushed
    }

    /// `stop` then `finalize`
    pub fn shutdown(&mut self) -> u64 {
        self.stop();
        self.finalize()
    }

    pub fn state(&self) -> PipelineState {
        self.state
    }

    /// Negotiated geometry while configured
    pub fn geometry(&self) -> Option<FrameGeometry> {
        self.geometry
    }

    pub fn capture_stats(&self) -> CaptureStatsSnapshot {
        self.camera.stats()
    }

    pub fn encoder_stats(&self) -> EncoderStatsSnapshot {
        self.encoder.stats()
    }
}
