// SPDX-License-Identifier: GPL-3.0-only

//! Memory-mapped camera capture
//!
//! ```text
//! ┌──────────────────────┐
//! │   Camera<D>          │  ← configure / start / stop, handler ownership
//! └──────────┬───────────┘
//!            │ owns (moved onto the capture thread while streaming)
//!            ▼
//! ┌──────────────────────┐
//! │ Session: D + pool    │  ← buffer ownership, ordered teardown
//! └──────────┬───────────┘
//!            │
//!            ▼
//! ┌──────────────────────┐
//! │ CaptureDevice trait  │  ← V4L2 in production, in-memory in tests
//! └──────────────────────┘
//! ```

pub mod buffer_pool;
mod capture_loop;
pub mod types;
pub mod v4l2_device;

pub use capture_loop::{CaptureStats, CaptureStatsSnapshot, FrameHandler};
pub use types::*;
pub use v4l2_device::V4l2Device;

use crate::config::CameraConfig;
use crate::errors::{CaptureError, CaptureResult};
use crate::pipelines::work_queue::CancelToken;
use crate::pipelines::worker::WorkerThread;
use buffer_pool::BufferPool;
use capture_loop::{CaptureLoop, Session};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

/// Operations a memory-mapped streaming capture device provides
///
/// Implementations are driven from one thread at a time: the caller's thread
/// during configuration, the capture thread while streaming.
pub trait CaptureDevice: Send + 'static {
    /// A mapped buffer; dropping it unmaps the memory
    type Region: AsRef<[u8]> + Send + 'static;

    /// Ask for a frame size and return what the device actually chose
    fn negotiate_format(&mut self, width: u32, height: u32) -> CaptureResult<FrameGeometry>;

    /// Request `count` buffers; returns the number granted
    fn request_buffers(&mut self, count: u32) -> CaptureResult<u32>;

    fn map_buffer(&mut self, index: u32) -> CaptureResult<Self::Region>;

    /// Hand every requested buffer back to the driver
    fn release_buffers(&mut self) -> CaptureResult<()>;

    fn queue_buffer(&mut self, index: u32) -> CaptureResult<()>;

    /// Take a completed buffer, or `None` if none is ready yet
    fn dequeue_buffer(&mut self) -> CaptureResult<Option<DequeuedBuffer>>;

    /// Wait at most `timeout` for a completed buffer
    fn wait_readable(&mut self, timeout: Duration) -> CaptureResult<Readiness>;

    fn stream_on(&mut self) -> CaptureResult<()>;

    fn stream_off(&mut self) -> CaptureResult<()>;
}

type DeviceOpener<D> = Box<dyn FnMut() -> CaptureResult<D> + Send>;

enum CameraState<D: CaptureDevice> {
    Unconfigured,
    Configured(Session<D>),
    Streaming {
        worker: WorkerThread<CaptureLoop<D>>,
        geometry: FrameGeometry,
    },
}

/// Capture device lifecycle: `Unconfigured → Configured → Streaming`
///
/// [`Camera::stop`] always returns to `Unconfigured`, releasing every buffer
/// and closing the device, so the camera can be configured again.
pub struct Camera<D: CaptureDevice> {
    opener: DeviceOpener<D>,
    state: CameraState<D>,
    handler: Option<FrameHandler>,
    stats: Arc<CaptureStats>,
}

impl Camera<V4l2Device> {
    /// Camera backed by the V4L2 node at `path`
    pub fn v4l2(path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        Self::new(move || V4l2Device::open(&path))
    }
}

impl<D: CaptureDevice> Camera<D> {
    /// Camera that opens its device through `opener` on every configure
    pub fn new(opener: impl FnMut() -> CaptureResult<D> + Send + 'static) -> Self {
        Self {
            opener: Box::new(opener),
            state: CameraState::Unconfigured,
            handler: None,
            stats: Arc::new(CaptureStats::default()),
        }
    }

    /// Register the callback that receives every captured frame.
    ///
    /// Replaces any previous handler. Must be set before `start`.
    pub fn set_frame_handler(
        &mut self,
        handler: impl FnMut(&CapturedFrame<'_>) + Send + 'static,
    ) -> CaptureResult<()> {
        if self.is_streaming() {
            return Err(CaptureError::AlreadyStreaming);
        }
        self.handler = Some(Box::new(handler));
        Ok(())
    }

    /// Open the device, negotiate the format and map the buffers.
    ///
    /// Returns the negotiated geometry, which may differ from the request.
    /// Any failure releases everything acquired so far.
    pub fn configure(&mut self, config: &CameraConfig) -> CaptureResult<FrameGeometry> {
        if !matches!(self.state, CameraState::Unconfigured) {
            return Err(CaptureError::AlreadyConfigured);
        }
        config.validate()?;

        let mut device = (self.opener)()?;
        let geometry = device.negotiate_format(config.width, config.height)?;
        let pool = BufferPool::allocate(&mut device, config.buffer_count)?;

        info!(
            geometry = %geometry,
            buffers = pool.len(),
            "Camera configured"
        );
        self.state = CameraState::Configured(Session::new(device, pool, geometry));
        Ok(geometry)
    }

    /// Queue all buffers, start streaming and spawn the capture thread
    pub fn start(&mut self) -> CaptureResult<()> {
        let mut session = match std::mem::replace(&mut self.state, CameraState::Unconfigured) {
            CameraState::Configured(session) => session,
            CameraState::Unconfigured => return Err(CaptureError::NotConfigured),
            streaming @ CameraState::Streaming { .. } => {
                self.state = streaming;
                return Err(CaptureError::AlreadyStreaming);
            }
        };

        if let Err(e) = session.begin_streaming() {
            warn!(error = %e, "Failed to start streaming");
            self.state = CameraState::Configured(session);
            return Err(e);
        }

        let geometry = session.geometry();
        self.stats.reset();
        let capture = CaptureLoop::new(session, self.handler.take(), Arc::clone(&self.stats));

        let worker = match WorkerThread::spawn(
            "rawenc-capture",
            CancelToken::new(),
            capture,
            |capture, cancel| capture.run_once(cancel),
        ) {
            Ok(worker) => worker,
            Err(e) => {
                if let Some(capture) = e.state {
                    self.restore_configured(capture);
                }
                return Err(CaptureError::ThreadSpawn(e.error.to_string()));
            }
        };

        info!(geometry = %geometry, "Capture started");
        self.state = CameraState::Streaming { worker, geometry };
        Ok(())
    }

    /// Take back a capture loop that never ran. The buffers stay mapped so
    /// `start` can be called again.
    fn restore_configured(&mut self, capture: CaptureLoop<D>) {
        let (mut session, handler) = capture.into_parts();
        session.end_streaming();
        self.handler = handler;
        self.state = CameraState::Configured(session);
    }

    /// Stop the capture thread, turn streaming off and release the device.
    ///
    /// Safe to call in any state and any number of times.
    pub fn stop(&mut self) {
        match std::mem::replace(&mut self.state, CameraState::Unconfigured) {
            CameraState::Streaming { worker, .. } => {
                match worker.stop() {
                    Some(capture) => {
                        let (mut session, handler) = capture.into_parts();
                        self.handler = handler;
                        session.end_streaming();
                        drop(session);
                    }
                    None => warn!("Capture thread panicked, device released during unwind"),
                }
                let stats = self.stats.snapshot();
                info!(
                    frames = stats.frames_delivered,
                    dequeue_errors = stats.dequeue_errors,
                    requeue_errors = stats.requeue_errors,
                    "Capture stopped"
                );
            }
            CameraState::Configured(session) => {
                drop(session);
                debug!("Camera released without streaming");
            }
            CameraState::Unconfigured => debug!("Camera stop ignored, not configured"),
        }
    }

    /// Negotiated geometry while configured or streaming
    pub fn geometry(&self) -> Option<FrameGeometry> {
        match &self.state {
            CameraState::Unconfigured => None,
            CameraState::Configured(session) => Some(session.geometry()),
            CameraState::Streaming { geometry, .. } => Some(*geometry),
        }
    }

    pub fn is_configured(&self) -> bool {
        !matches!(self.state, CameraState::Unconfigured)
    }

    pub fn is_streaming(&self) -> bool {
        matches!(self.state, CameraState::Streaming { .. })
    }

    pub fn stats(&self) -> CaptureStatsSnapshot {
        self.stats.snapshot()
    }
}

impl<D: CaptureDevice> Drop for Camera<D> {
    fn drop(&mut self) {
        self.stop();
    }
}
