// SPDX-License-Identifier: GPL-3.0-only

//! Streaming session and the per-iteration capture step
//!
//! A [`Session`] bundles an open device with its mapped buffer pool. It is
//! built on the caller's thread by `Camera::configure`, moved onto the
//! capture thread for streaming, and moved back on stop. Dropping it always
//! tears down in the same order: stream off, unmap, release buffers, close.

use super::CaptureDevice;
use super::buffer_pool::BufferPool;
use super::types::{CapturedFrame, FrameGeometry, Readiness};
use crate::constants::DEVICE_POLL_TIMEOUT;
use crate::errors::CaptureResult;
use crate::pipelines::worker::LoopAction;
use crate::pipelines::work_queue::CancelToken;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::thread;
use tracing::{debug, error, trace, warn};

/// Frame callback, invoked on the capture thread
pub type FrameHandler = Box<dyn FnMut(&CapturedFrame<'_>) + Send>;

/// Counters updated by the capture thread
#[derive(Debug, Default)]
pub struct CaptureStats {
    frames_delivered: AtomicU64,
    dequeue_errors: AtomicU64,
    requeue_errors: AtomicU64,
    handler_panics: AtomicU64,
    interrupted_waits: AtomicU64,
    wait_errors: AtomicU64,
}

/// Point-in-time copy of [`CaptureStats`]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CaptureStatsSnapshot {
    pub frames_delivered: u64,
    pub dequeue_errors: u64,
    pub requeue_errors: u64,
    pub handler_panics: u64,
    pub interrupted_waits: u64,
    pub wait_errors: u64,
}

impl CaptureStats {
    pub fn snapshot(&self) -> CaptureStatsSnapshot {
        CaptureStatsSnapshot {
            frames_delivered: self.frames_delivered.load(Ordering::Relaxed),
            dequeue_errors: self.dequeue_errors.load(Ordering::Relaxed),
            requeue_errors: self.requeue_errors.load(Ordering::Relaxed),
            handler_panics: self.handler_panics.load(Ordering::Relaxed),
            interrupted_waits: self.interrupted_waits.load(Ordering::Relaxed),
            wait_errors: self.wait_errors.load(Ordering::Relaxed),
        }
    }

    pub(crate) fn reset(&self) {
        for counter in [
            &self.frames_delivered,
            &self.dequeue_errors,
            &self.requeue_errors,
            &self.handler_panics,
            &self.interrupted_waits,
            &self.wait_errors,
        ] {
            counter.store(0, Ordering::Relaxed);
        }
    }

    fn bump(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }
}

/// Open device plus its mapped buffers
pub(crate) struct Session<D: CaptureDevice> {
    device: D,
    pool: Option<BufferPool<D::Region>>,
    geometry: FrameGeometry,
    streaming: bool,
}

impl<D: CaptureDevice> Session<D> {
    pub(crate) fn new(device: D, pool: BufferPool<D::Region>, geometry: FrameGeometry) -> Self {
        Self {
            device,
            pool: Some(pool),
            geometry,
            streaming: false,
        }
    }

    pub(crate) fn geometry(&self) -> FrameGeometry {
        self.geometry
    }

    /// Queue every buffer and turn streaming on.
    ///
    /// On failure streaming is turned back off and all slots are reclaimed,
    /// leaving the session as it was before the call.
    pub(crate) fn begin_streaming(&mut self) -> CaptureResult<()> {
        let result = self.queue_and_stream_on();
        if result.is_err() {
            self.end_streaming();
        }
        result
    }

    fn queue_and_stream_on(&mut self) -> CaptureResult<()> {
        if let Some(pool) = self.pool.as_mut() {
            pool.queue_all(&mut self.device)?;
        }
        self.streaming = true;
        self.device.stream_on()
    }

    /// Turn streaming off; the device implicitly gives every buffer back.
    ///
    /// Also issued when streaming never started but some slots were
    /// queued, since STREAMOFF is the only way to take them back.
    pub(crate) fn end_streaming(&mut self) {
        let queued = self.pool.as_ref().is_some_and(|pool| pool.device_owned() > 0);
        if self.streaming || queued {
            if let Err(e) = self.device.stream_off() {
                warn!(error = %e, "Failed to stop streaming");
            }
            self.streaming = false;
        }
        if let Some(pool) = self.pool.as_mut() {
            pool.reclaim_all();
        }
    }
}

impl<D: CaptureDevice> Drop for Session<D> {
    fn drop(&mut self) {
        self.end_streaming();
        if let Some(pool) = self.pool.take() {
            pool.release(&mut self.device);
        }
        debug!("Capture session closed");
    }
}

/// State owned by the capture thread for one streaming session
pub(crate) struct CaptureLoop<D: CaptureDevice> {
    session: Session<D>,
    handler: Option<FrameHandler>,
    stats: Arc<CaptureStats>,
    sequence: u32,
}

impl<D: CaptureDevice> CaptureLoop<D> {
    pub(crate) fn new(
        session: Session<D>,
        handler: Option<FrameHandler>,
        stats: Arc<CaptureStats>,
    ) -> Self {
        Self {
            session,
            handler,
            stats,
            sequence: 0,
        }
    }

    pub(crate) fn into_parts(self) -> (Session<D>, Option<FrameHandler>) {
        (self.session, self.handler)
    }

    /// One bounded wait, and at most one frame
    pub(crate) fn run_once(&mut self, _cancel: &CancelToken) -> LoopAction {
        match self.session.device.wait_readable(DEVICE_POLL_TIMEOUT) {
            Ok(Readiness::Ready) => self.capture_one(),
            Ok(Readiness::TimedOut) => trace!("No frame within poll timeout"),
            Ok(Readiness::Interrupted) => {
                CaptureStats::bump(&self.stats.interrupted_waits);
            }
            Err(e) => {
                CaptureStats::bump(&self.stats.wait_errors);
                error!(error = %e, "Waiting for the device failed");
                // Do not spin on a device stuck in an error state
                thread::sleep(DEVICE_POLL_TIMEOUT);
            }
        }
        LoopAction::Continue
    }

    fn capture_one(&mut self) {
        let Session { device, pool, .. } = &mut self.session;
        let Some(pool) = pool.as_mut() else {
            return;
        };

        let buffer = match device.dequeue_buffer() {
            Ok(Some(buffer)) => buffer,
            Ok(None) => return,
            Err(e) => {
                CaptureStats::bump(&self.stats.dequeue_errors);
                warn!(error = %e, "Failed to dequeue buffer");
                return;
            }
        };

        match pool.take_dequeued(buffer) {
            Ok(data) => {
                let frame = CapturedFrame {
                    sequence: self.sequence,
                    data,
                };
                self.sequence = self.sequence.wrapping_add(1);
                CaptureStats::bump(&self.stats.frames_delivered);

                if let Some(handler) = self.handler.as_mut() {
                    let delivered = panic::catch_unwind(AssertUnwindSafe(|| handler(&frame)));
                    if delivered.is_err() {
                        CaptureStats::bump(&self.stats.handler_panics);
                        error!(sequence = frame.sequence, "Frame handler panicked");
                    }
                }
            }
            Err(e) => {
                // The slot is not ours to give back
                CaptureStats::bump(&self.stats.dequeue_errors);
                warn!(index = buffer.index, error = %e, "Device returned an unexpected slot");
                return;
            }
        }

        if let Err(e) = pool.requeue(device, buffer.index) {
            CaptureStats::bump(&self.stats.requeue_errors);
            warn!(index = buffer.index, error = %e, "Failed to re-queue buffer");
        }
    }
}
