// SPDX-License-Identifier: GPL-3.0-only

//! Encoder lifecycle and the encode thread
//!
//! State machine: `Closed → Configured → Running → Stopped → Closed`.
//!
//! The engine lives in exactly one place at a time: in the controller while
//! configured or stopped, on the encode thread while running. `finalize`
//! therefore always joins the encode thread before touching the engine.

use super::CodecEngine;
use super::ffmpeg::FfmpegEngine;
use crate::backends::camera::{CapturedFrame, FrameGeometry, PixelLayout};
use crate::config::EncoderConfig;
use crate::errors::{EncodeError, EncodeResult};
use crate::media::frame_convert::{self, PlanarFrame};
use crate::pipelines::work_queue::{CancelToken, WorkQueue};
use crate::pipelines::worker::{LoopAction, WorkerThread};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use tracing::{debug, info, trace, warn};

/// Packet callback, invoked on the encode thread (or the finalizing thread)
pub type PacketHandler = Box<dyn FnMut(&[u8]) + Send>;

type EngineFactory<E> = Box<dyn FnMut(&EncoderConfig) -> EncodeResult<E> + Send>;

/// Externally visible encoder state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EncoderState {
    Closed,
    Configured,
    Running,
    Stopped,
}

/// Counters shared by the submitters, the encode thread and the controller
#[derive(Debug, Default)]
pub struct EncoderStats {
    frames_queued: AtomicU64,
    frames_dropped: AtomicU64,
    frames_encoded: AtomicU64,
    frames_discarded: AtomicU64,
    packets_emitted: AtomicU64,
    bytes_emitted: AtomicU64,
    submit_errors: AtomicU64,
    receive_errors: AtomicU64,
}

/// Point-in-time copy of [`EncoderStats`]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct EncoderStatsSnapshot {
    /// Frames packed and pushed onto the work queue
    pub frames_queued: u64,
    /// Frames that could not be packed, or arrived while not accepting
    pub frames_dropped: u64,
    /// Frames the engine accepted
    pub frames_encoded: u64,
    /// Frames still queued when the encode thread stopped
    pub frames_discarded: u64,
    pub packets_emitted: u64,
    pub bytes_emitted: u64,
    pub submit_errors: u64,
    pub receive_errors: u64,
}

impl EncoderStats {
    pub fn snapshot(&self) -> EncoderStatsSnapshot {
        EncoderStatsSnapshot {
            frames_queued: self.frames_queued.load(Ordering::Relaxed),
            frames_dropped: self.frames_dropped.load(Ordering::Relaxed),
            frames_encoded: self.frames_encoded.load(Ordering::Relaxed),
            frames_discarded: self.frames_discarded.load(Ordering::Relaxed),
            packets_emitted: self.packets_emitted.load(Ordering::Relaxed),
            bytes_emitted: self.bytes_emitted.load(Ordering::Relaxed),
            submit_errors: self.submit_errors.load(Ordering::Relaxed),
            receive_errors: self.receive_errors.load(Ordering::Relaxed),
        }
    }

    fn reset(&self) {
        for counter in [
            &self.frames_queued,
            &self.frames_dropped,
            &self.frames_encoded,
            &self.frames_discarded,
            &self.packets_emitted,
            &self.bytes_emitted,
            &self.submit_errors,
            &self.receive_errors,
        ] {
            counter.store(0, Ordering::Relaxed);
        }
    }

    fn add(counter: &AtomicU64, value: u64) {
        counter.fetch_add(value, Ordering::Relaxed);
    }
}

/// Producer handle used from the capture thread
///
/// Packs each frame into I420, stamps it with its sequence number and
/// queues it. Frames that cannot be packed are logged and dropped.
#[derive(Clone)]
pub struct FrameSubmitter {
    queue: Arc<WorkQueue<PlanarFrame>>,
    stats: Arc<EncoderStats>,
    accepting: Arc<AtomicBool>,
    geometry: FrameGeometry,
}

impl FrameSubmitter {
    /// Geometry raw frames are expected in
    pub fn geometry(&self) -> FrameGeometry {
        self.geometry
    }

    /// Pack and queue one raw frame. Returns whether it was queued.
    pub fn submit(&self, sequence: u32, raw: &[u8]) -> bool {
        if !self.accepting.load(Ordering::Acquire) {
            EncoderStats::add(&self.stats.frames_dropped, 1);
            trace!(sequence, "Encoder not accepting frames, dropping");
            return false;
        }
        match frame_convert::pack_i420(sequence, raw, &self.geometry) {
            Ok(frame) => {
                self.queue.push(frame);
                EncoderStats::add(&self.stats.frames_queued, 1);
                true
            }
            Err(e) => {
                EncoderStats::add(&self.stats.frames_dropped, 1);
                warn!(sequence, error = %e, "Dropping frame");
                false
            }
        }
    }

    /// Submit a frame straight from the capture callback
    pub fn submit_captured(&self, frame: &CapturedFrame<'_>) -> bool {
        self.submit(frame.sequence, frame.data)
    }
}

/// Engine plus the drain discipline shared by the encode thread and finalize
struct EngineCore<E: CodecEngine> {
    engine: E,
    handler: Option<PacketHandler>,
    stats: Arc<EncoderStats>,
    flushed: bool,
}

impl<E: CodecEngine> EngineCore<E> {
    fn encode_frame(&mut self, frame: &PlanarFrame) {
        if self.flushed {
            warn!(pts = frame.pts, "Frame submitted after end of stream, dropping");
            EncoderStats::add(&self.stats.frames_dropped, 1);
            return;
        }
        if let Err(e) = self.engine.send_frame(Some(frame)) {
            EncoderStats::add(&self.stats.submit_errors, 1);
            warn!(pts = frame.pts, error = %e, "Encoder rejected frame");
            return;
        }
        EncoderStats::add(&self.stats.frames_encoded, 1);
        self.drain();
    }

    /// Pull packets until the engine has nothing more right now
    fn drain(&mut self) -> u64 {
        let mut emitted = 0;
        loop {
            match self.engine.receive_packet() {
                Ok(Some(packet)) => {
                    let data = packet.as_ref();
                    if let Some(handler) = self.handler.as_mut() {
                        handler(data);
                    }
                    EncoderStats::add(&self.stats.packets_emitted, 1);
                    EncoderStats::add(&self.stats.bytes_emitted, data.len() as u64);
                    emitted += 1;
                }
                Ok(None) => break,
                Err(e) => {
                    EncoderStats::add(&self.stats.receive_errors, 1);
                    warn!(error = %e, "Error receiving packet");
                    break;
                }
            }
        }
        emitted
    }

    /// Send end of stream once and drain what the engine was holding
    fn flush(&mut self) -> u64 {
        if self.flushed {
            debug!("Encoder already flushed");
            return 0;
        }
        self.flushed = true;
        if let Err(e) = self.engine.send_frame(None) {
            EncoderStats::add(&self.stats.submit_errors, 1);
            warn!(error = %e, "Failed to signal end of stream");
            return 0;
        }
        self.drain()
    }
}

/// State owned by the encode thread
struct EncodeLoop<E: CodecEngine> {
    core: EngineCore<E>,
    queue: Arc<WorkQueue<PlanarFrame>>,
}

impl<E: CodecEngine> EncodeLoop<E> {
    fn run_once(&mut self, cancel: &CancelToken) -> LoopAction {
        match self.queue.pop(cancel) {
            Some(frame) => {
                self.core.encode_frame(&frame);
                LoopAction::Continue
            }
            None => LoopAction::Stop,
        }
    }
}

enum Stage<E: CodecEngine> {
    Closed,
    Configured(EngineCore<E>),
    Running(WorkerThread<EncodeLoop<E>>),
    Stopped(EngineCore<E>),
}

/// Asynchronous encoder: queue on one thread, compress on another
pub struct Encoder<E: CodecEngine> {
    factory: EngineFactory<E>,
    stage: Stage<E>,
    config: Option<EncoderConfig>,
    handler: Option<PacketHandler>,
    queue: Arc<WorkQueue<PlanarFrame>>,
    stats: Arc<EncoderStats>,
    accepting: Arc<AtomicBool>,
}

impl Encoder<FfmpegEngine> {
    /// Encoder backed by FFmpeg
    pub fn ffmpeg() -> Self {
        Self::new(FfmpegEngine::open)
    }
}

impl<E: CodecEngine> Encoder<E> {
    /// Encoder that opens its engine through `factory` on every configure
    pub fn new(factory: impl FnMut(&EncoderConfig) -> EncodeResult<E> + Send + 'static) -> Self {
        Self {
            factory: Box::new(factory),
            stage: Stage::Closed,
            config: None,
            handler: None,
            queue: Arc::new(WorkQueue::new()),
            stats: Arc::new(EncoderStats::default()),
            accepting: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Register the callback that receives every encoded packet.
    ///
    /// The packet bytes are only valid during the call.
    pub fn set_packet_handler(
        &mut self,
        handler: impl FnMut(&[u8]) + Send + 'static,
    ) -> EncodeResult<()> {
        let handler: PacketHandler = Box::new(handler);
        match &mut self.stage {
            Stage::Running(_) => Err(EncodeError::InvalidState(
                "packet handler cannot change while running",
            )),
            Stage::Configured(core) | Stage::Stopped(core) => {
                core.handler = Some(handler);
                Ok(())
            }
            Stage::Closed => {
                self.handler = Some(handler);
                Ok(())
            }
        }
    }

    /// Validate `config` and open the engine
    pub fn configure(&mut self, config: &EncoderConfig) -> EncodeResult<()> {
        if !matches!(self.stage, Stage::Closed) {
            return Err(EncodeError::AlreadyConfigured);
        }
        config.validate()?;

        let engine = (self.factory)(config)?;
        info!(
            codec = engine.name(),
            width = config.width,
            height = config.height,
            fps = config.fps,
            "Encoder configured"
        );

        self.queue.drain();
        self.stats.reset();
        self.stage = Stage::Configured(EngineCore {
            engine,
            handler: self.handler.take(),
            stats: Arc::clone(&self.stats),
            flushed: false,
        });
        self.config = Some(config.clone());
        self.accepting.store(true, Ordering::Release);
        Ok(())
    }

    /// Spawn the encode thread
    pub fn start(&mut self) -> EncodeResult<()> {
        let core = match std::mem::replace(&mut self.stage, Stage::Closed) {
            Stage::Configured(core) => core,
            other => {
                self.stage = other;
                return Err(EncodeError::InvalidState("start requires a configured encoder"));
            }
        };

        let encode = EncodeLoop {
            core,
            queue: Arc::clone(&self.queue),
        };
        let waker_queue = Arc::clone(&self.queue);
        let worker = match WorkerThread::spawn(
            "rawenc-encode",
            CancelToken::new(),
            encode,
            |encode, cancel| encode.run_once(cancel),
        ) {
            Ok(worker) => worker,
            Err(e) => {
                // Still configured with the same engine and handler
                if let Some(encode) = e.state {
                    self.stage = Stage::Configured(encode.core);
                } else {
                    self.accepting.store(false, Ordering::Release);
                    self.config = None;
                }
                return Err(EncodeError::ThreadSpawn(e.error.to_string()));
            }
        };

        self.stage = Stage::Running(worker.with_waker(move || waker_queue.wake_all()));
        info!("Encoder started");
        Ok(())
    }

    /// Pack and queue a planar frame in the configured size.
    ///
    /// Callable from any thread. A frame that cannot be packed is dropped.
    pub fn encode(&self, sequence: u32, raw: &[u8]) -> EncodeResult<()> {
        let config = self.config.as_ref().ok_or(EncodeError::NotConfigured)?;
        let geometry = FrameGeometry::packed(config.width, config.height, PixelLayout::Yuv420);
        if !self.accepting.load(Ordering::Acquire) {
            EncoderStats::add(&self.stats.frames_dropped, 1);
            return Err(EncodeError::InvalidState("encoder is not accepting frames"));
        }
        match frame_convert::pack_i420(sequence, raw, &geometry) {
            Ok(frame) => {
                self.queue.push(frame);
                EncoderStats::add(&self.stats.frames_queued, 1);
                Ok(())
            }
            Err(e) => {
                EncoderStats::add(&self.stats.frames_dropped, 1);
                warn!(sequence, error = %e, "Dropping frame");
                Err(e)
            }
        }
    }

    /// Producer handle for raw frames laid out as `source`.
    ///
    /// The source size must match the configured encoder size.
    pub fn submitter(&self, source: FrameGeometry) -> EncodeResult<FrameSubmitter> {
        let config = self.config.as_ref().ok_or(EncodeError::NotConfigured)?;
        if source.width != config.width || source.height != config.height {
            return Err(EncodeError::InvalidGeometry(format!(
                "source is {}x{}, encoder is configured for {}x{}",
                source.width, source.height, config.width, config.height
            )));
        }
        Ok(FrameSubmitter {
            queue: Arc::clone(&self.queue),
            stats: Arc::clone(&self.stats),
            accepting: Arc::clone(&self.accepting),
            geometry: source,
        })
    }

    /// Stop the encode thread and discard anything still queued.
    ///
    /// Frames the thread already took off the queue are encoded and their
    /// packets delivered before it exits. Safe to call in any state.
    pub fn stop(&mut self) {
        self.accepting.store(false, Ordering::Release);
        match std::mem::replace(&mut self.stage, Stage::Closed) {
            Stage::Running(worker) => {
                let core = worker.stop();
                self.discard_queued();
                match core {
                    Some(encode) => self.stage = Stage::Stopped(encode.core),
                    None => {
                        warn!("Encode thread panicked, engine released");
                        self.config = None;
                    }
                }
                info!("Encoder stopped");
            }
            Stage::Configured(core) => {
                self.discard_queued();
                self.stage = Stage::Stopped(core);
            }
            other => self.stage = other,
        }
    }

    fn discard_queued(&self) {
        let discarded = self.queue.drain().len() as u64;
        if discarded > 0 {
            EncoderStats::add(&self.stats.frames_discarded, discarded);
            info!(discarded, "Discarded queued frames on stop");
        }
    }

    /// Signal end of stream and deliver every packet the engine still holds.
    ///
    /// Joins the encode thread first if it is running. Returns the number of
    /// packets flushed; a second call returns 0.
    pub fn finalize(&mut self) -> u64 {
        if matches!(self.stage, Stage::Running(_)) {
            self.stop();
        }
        match &mut self.stage {
            Stage::Configured(core) | Stage::Stopped(core) => {
                let flushed = core.flush();
                info!(packets = flushed, "Encoder finalized");
                flushed
            }
            Stage::Closed => {
                debug!("Finalize ignored, encoder is closed");
                0
            }
            Stage::Running(_) => 0,
        }
    }

    /// Stop, release the engine and return to `Closed`
    pub fn close(&mut self) {
        self.stop();
        match std::mem::replace(&mut self.stage, Stage::Closed) {
            Stage::Configured(core) | Stage::Stopped(core) => {
                debug!(codec = core.engine.name(), "Closing encoder");
                self.handler = core.handler;
            }
            _ => {}
        }
        self.config = None;
    }

    pub fn state(&self) -> EncoderState {
        match self.stage {
            Stage::Closed => EncoderState::Closed,
            Stage::Configured(_) => EncoderState::Configured,
            Stage::Running(_) => EncoderState::Running,
            Stage::Stopped(_) => EncoderState::Stopped,
        }
    }

    /// Frames waiting for the encode thread
    pub fn queued(&self) -> usize {
        self.queue.len()
    }

    pub fn stats(&self) -> EncoderStatsSnapshot {
        self.stats.snapshot()
    }
}

impl<E: CodecEngine> Drop for Encoder<E> {
    fn drop(&mut self) {
        self.close();
    }
}
