// SPDX-License-Identifier: GPL-3.0-only

//! Shared test doubles: an in-memory capture device and a scripted codec

#![allow(dead_code)]

use rawenc::backends::camera::{
    Camera, CaptureDevice, DequeuedBuffer, FrameGeometry, PixelLayout, Readiness,
};
use rawenc::config::EncoderConfig;
use rawenc::errors::{CaptureError, CaptureResult, EncodeError, EncodeResult};
use rawenc::media::encoders::{CodecEngine, Encoder};
use rawenc::media::frame_convert::PlanarFrame;
use std::collections::VecDeque;
use std::io;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Condvar, Mutex, MutexGuard};
use std::thread;
use std::time::{Duration, Instant};

/// Poll `condition` until it holds or `timeout` expires
pub fn wait_until(timeout: Duration, mut condition: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if condition() {
            return true;
        }
        thread::sleep(Duration::from_millis(2));
    }
    condition()
}

// ===== Capture device =====

/// Behaviour knobs for [`MockDevice`]
#[derive(Debug, Clone)]
pub struct MockOptions {
    /// Buffers granted regardless of the request
    pub grant: Option<u32>,
    /// Fail mapping this slot index
    pub fail_map_at: Option<u32>,
    /// Size the device substitutes for the request
    pub negotiate: Option<(u32, u32)>,
    pub layout: PixelLayout,
    pub reject_format: bool,
    pub fail_stream_on: bool,
    /// Number of dequeues that fail before frames flow
    pub dequeue_failures: u32,
    /// Fail the Nth queue call (counting from 1) once
    pub fail_queue_at: Option<u64>,
    /// Number of waits that report a signal before the device is polled
    pub interrupted_waits: u32,
}

impl Default for MockOptions {
    fn default() -> Self {
        Self {
            grant: None,
            fail_map_at: None,
            negotiate: None,
            layout: PixelLayout::Yuv420,
            reject_format: false,
            fail_stream_on: false,
            dequeue_failures: 0,
            fail_queue_at: None,
            interrupted_waits: 0,
        }
    }
}

#[derive(Default)]
struct MockState {
    geometry: Option<FrameGeometry>,
    /// `true` while the slot is queued to the device
    device_owned: Vec<bool>,
    /// Queued slots in the order the device will fill them
    ring: VecDeque<u32>,
    streaming: bool,
    pending_frames: u32,
    dequeue_failures: u32,
    interrupted_waits: u32,
    dequeues: u64,
    queues: u64,
    queue_calls: u64,
    violations: Vec<String>,
}

/// State shared between a test and the devices its camera opens
pub struct MockShared {
    options: MockOptions,
    state: Mutex<MockState>,
    frame_ready: Condvar,
    live_mappings: AtomicUsize,
    opened: AtomicUsize,
    closed: AtomicUsize,
    released: AtomicUsize,
}

impl MockShared {
    pub fn new(options: MockOptions) -> Arc<Self> {
        Arc::new(Self {
            state: Mutex::new(MockState {
                dequeue_failures: options.dequeue_failures,
                interrupted_waits: options.interrupted_waits,
                ..MockState::default()
            }),
            options,
            frame_ready: Condvar::new(),
            live_mappings: AtomicUsize::new(0),
            opened: AtomicUsize::new(0),
            closed: AtomicUsize::new(0),
            released: AtomicUsize::new(0),
        })
    }

    fn lock(&self) -> MutexGuard<'_, MockState> {
        self.state.lock().unwrap()
    }

    /// Make the device complete `count` more frames
    pub fn push_frames(&self, count: u32) {
        self.lock().pending_frames += count;
        self.frame_ready.notify_all();
    }

    pub fn live_mappings(&self) -> usize {
        self.live_mappings.load(Ordering::SeqCst)
    }

    pub fn opened(&self) -> usize {
        self.opened.load(Ordering::SeqCst)
    }

    pub fn closed(&self) -> usize {
        self.closed.load(Ordering::SeqCst)
    }

    /// Number of `request_buffers(0)` calls
    pub fn released(&self) -> usize {
        self.released.load(Ordering::SeqCst)
    }

    pub fn violations(&self) -> Vec<String> {
        self.lock().violations.clone()
    }

    pub fn dequeues(&self) -> u64 {
        self.lock().dequeues
    }

    pub fn queues(&self) -> u64 {
        self.lock().queues
    }

    pub fn device_owned(&self) -> usize {
        self.lock().device_owned.iter().filter(|owned| **owned).count()
    }

    pub fn is_streaming(&self) -> bool {
        self.lock().streaming
    }
}

/// Mapped memory of a [`MockDevice`] buffer
pub struct MockRegion {
    bytes: Vec<u8>,
    shared: Arc<MockShared>,
}

impl AsRef<[u8]> for MockRegion {
    fn as_ref(&self) -> &[u8] {
        &self.bytes
    }
}

impl Drop for MockRegion {
    fn drop(&mut self) {
        self.shared.live_mappings.fetch_sub(1, Ordering::SeqCst);
    }
}

/// In-memory streaming device that records every ownership violation
pub struct MockDevice {
    shared: Arc<MockShared>,
}

impl MockDevice {
    pub fn open(shared: &Arc<MockShared>) -> Self {
        shared.opened.fetch_add(1, Ordering::SeqCst);
        let mut state = shared.lock();
        state.device_owned.clear();
        state.ring.clear();
        state.streaming = false;
        drop(state);
        Self {
            shared: Arc::clone(shared),
        }
    }

    fn violation(state: &mut MockState, message: String) {
        state.violations.push(message);
    }

    fn io_error(operation: &'static str) -> CaptureError {
        CaptureError::Io {
            operation,
            source: io::Error::other("injected failure"),
        }
    }
}

impl Drop for MockDevice {
    fn drop(&mut self) {
        if self.shared.live_mappings() != 0 {
            let mut state = self.shared.lock();
            Self::violation(&mut state, "device closed while buffers mapped".to_string());
        }
        self.shared.closed.fetch_add(1, Ordering::SeqCst);
    }
}

impl CaptureDevice for MockDevice {
    type Region = MockRegion;

    fn negotiate_format(&mut self, width: u32, height: u32) -> CaptureResult<FrameGeometry> {
        if self.shared.options.reject_format {
            return Err(CaptureError::FormatNegotiation("no YUV formats".to_string()));
        }
        let (width, height) = self.shared.options.negotiate.unwrap_or((width, height));
        let geometry = FrameGeometry::packed(width, height, self.shared.options.layout);
        self.shared.lock().geometry = Some(geometry);
        Ok(geometry)
    }

    fn request_buffers(&mut self, count: u32) -> CaptureResult<u32> {
        let mut state = self.shared.lock();
        if count == 0 {
            self.shared.released.fetch_add(1, Ordering::SeqCst);
            if self.shared.live_mappings() != 0 {
                Self::violation(&mut state, "buffers released while mapped".to_string());
            }
            state.device_owned.clear();
            return Ok(0);
        }
        let granted = self.shared.options.grant.unwrap_or(count);
        state.device_owned = vec![false; granted as usize];
        Ok(granted)
    }

    fn map_buffer(&mut self, index: u32) -> CaptureResult<MockRegion> {
        if self.shared.options.fail_map_at == Some(index) {
            return Err(CaptureError::BufferMapping {
                index,
                reason: "injected failure".to_string(),
            });
        }
        let len = self
            .shared
            .lock()
            .geometry
            .map(|g| g.frame_len())
            .unwrap_or(0);
        self.shared.live_mappings.fetch_add(1, Ordering::SeqCst);
        Ok(MockRegion {
            bytes: vec![index as u8; len],
            shared: Arc::clone(&self.shared),
        })
    }

    fn release_buffers(&mut self) -> CaptureResult<()> {
        self.request_buffers(0).map(|_| ())
    }

    fn queue_buffer(&mut self, index: u32) -> CaptureResult<()> {
        let mut state = self.shared.lock();
        state.queue_calls += 1;
        if self.shared.options.fail_queue_at == Some(state.queue_calls) {
            return Err(Self::io_error("VIDIOC_QBUF"));
        }
        match state.device_owned.get(index as usize).copied() {
            None => {
                Self::violation(&mut state, format!("queued unknown slot {}", index));
                return Err(Self::io_error("VIDIOC_QBUF"));
            }
            Some(true) => {
                Self::violation(&mut state, format!("slot {} queued twice", index));
                return Err(Self::io_error("VIDIOC_QBUF"));
            }
            Some(false) => {}
        }
        state.device_owned[index as usize] = true;
        state.ring.push_back(index);
        state.queues += 1;
        drop(state);
        self.shared.frame_ready.notify_all();
        Ok(())
    }

    fn dequeue_buffer(&mut self) -> CaptureResult<Option<DequeuedBuffer>> {
        let mut state = self.shared.lock();
        if state.dequeue_failures > 0 {
            state.dequeue_failures -= 1;
            state.pending_frames = state.pending_frames.saturating_sub(1);
            return Err(Self::io_error("VIDIOC_DQBUF"));
        }
        if !state.streaming || state.pending_frames == 0 {
            return Ok(None);
        }
        let Some(index) = state.ring.pop_front() else {
            return Ok(None);
        };
        state.pending_frames -= 1;
        state.device_owned[index as usize] = false;
        state.dequeues += 1;
        let bytes_used = state.geometry.map(|g| g.frame_len()).unwrap_or(0);
        Ok(Some(DequeuedBuffer { index, bytes_used }))
    }

    fn wait_readable(&mut self, timeout: Duration) -> CaptureResult<Readiness> {
        let ready = |state: &MockState| {
            state.streaming && state.pending_frames > 0 && !state.ring.is_empty()
        };
        let mut state = self.shared.lock();
        if state.interrupted_waits > 0 {
            state.interrupted_waits -= 1;
            return Ok(Readiness::Interrupted);
        }
        if ready(&state) {
            return Ok(Readiness::Ready);
        }
        let (state, _) = self
            .shared
            .frame_ready
            .wait_timeout_while(state, timeout, |state| !ready(state))
            .unwrap();
        Ok(if ready(&state) {
            Readiness::Ready
        } else {
            Readiness::TimedOut
        })
    }

    fn stream_on(&mut self) -> CaptureResult<()> {
        if self.shared.options.fail_stream_on {
            return Err(Self::io_error("VIDIOC_STREAMON"));
        }
        self.shared.lock().streaming = true;
        self.shared.frame_ready.notify_all();
        Ok(())
    }

    fn stream_off(&mut self) -> CaptureResult<()> {
        let mut state = self.shared.lock();
        state.streaming = false;
        state.ring.clear();
        for owned in state.device_owned.iter_mut() {
            *owned = false;
        }
        Ok(())
    }
}

/// Camera whose every configure opens a fresh [`MockDevice`]
pub fn mock_camera(options: MockOptions) -> (Camera<MockDevice>, Arc<MockShared>) {
    let shared = MockShared::new(options);
    let opener_shared = Arc::clone(&shared);
    let camera = Camera::new(move || Ok(MockDevice::open(&opener_shared)));
    (camera, shared)
}

// ===== Codec engine =====

/// Behaviour knobs for [`FakeEngine`]
#[derive(Debug, Clone, Default)]
pub struct EngineOptions {
    /// Frames held back before the first packet comes out
    pub delay: usize,
    /// Time spent on every submitted frame
    pub work: Duration,
}

/// What the fake engines have seen, shared with the test
#[derive(Default)]
pub struct EngineProbe {
    live: AtomicUsize,
    opened: AtomicUsize,
    submitted: Mutex<Vec<i64>>,
    configs: Mutex<Vec<EncoderConfig>>,
}

impl EngineProbe {
    pub fn live(&self) -> usize {
        self.live.load(Ordering::SeqCst)
    }

    pub fn opened(&self) -> usize {
        self.opened.load(Ordering::SeqCst)
    }

    /// Presentation timestamps in submission order
    pub fn submitted(&self) -> Vec<i64> {
        self.submitted.lock().unwrap().clone()
    }

    pub fn last_config(&self) -> Option<EncoderConfig> {
        self.configs.lock().unwrap().last().cloned()
    }
}

/// Codec that turns each frame into one packet holding its pts, after a
/// configurable delay
pub struct FakeEngine {
    options: EngineOptions,
    probe: Arc<EngineProbe>,
    held: VecDeque<i64>,
    ready: VecDeque<Vec<u8>>,
    end_of_stream: bool,
}

impl FakeEngine {
    pub fn open(
        config: &EncoderConfig,
        options: &EngineOptions,
        probe: &Arc<EngineProbe>,
    ) -> EncodeResult<Self> {
        if config.codec == "does-not-exist" {
            return Err(EncodeError::CodecNotFound(config.codec.clone()));
        }
        probe.opened.fetch_add(1, Ordering::SeqCst);
        probe.live.fetch_add(1, Ordering::SeqCst);
        probe.configs.lock().unwrap().push(config.clone());
        Ok(Self {
            options: options.clone(),
            probe: Arc::clone(probe),
            held: VecDeque::new(),
            ready: VecDeque::new(),
            end_of_stream: false,
        })
    }
}

impl Drop for FakeEngine {
    fn drop(&mut self) {
        self.probe.live.fetch_sub(1, Ordering::SeqCst);
    }
}

impl CodecEngine for FakeEngine {
    type Packet = Vec<u8>;

    fn send_frame(&mut self, frame: Option<&PlanarFrame>) -> EncodeResult<()> {
        if self.end_of_stream {
            return Err(EncodeError::Submit("end of stream already signalled".into()));
        }
        match frame {
            Some(frame) => {
                if !self.options.work.is_zero() {
                    thread::sleep(self.options.work);
                }
                self.probe.submitted.lock().unwrap().push(frame.pts);
                self.held.push_back(frame.pts);
                while self.held.len() > self.options.delay {
                    if let Some(pts) = self.held.pop_front() {
                        self.ready.push_back(pts.to_le_bytes().to_vec());
                    }
                }
            }
            None => {
                self.end_of_stream = true;
                while let Some(pts) = self.held.pop_front() {
                    self.ready.push_back(pts.to_le_bytes().to_vec());
                }
            }
        }
        Ok(())
    }

    fn receive_packet(&mut self) -> EncodeResult<Option<Vec<u8>>> {
        Ok(self.ready.pop_front())
    }

    fn name(&self) -> &str {
        "fake"
    }
}

/// Encoder whose engines are [`FakeEngine`]s reporting to one probe
pub fn fake_encoder(options: EngineOptions) -> (Encoder<FakeEngine>, Arc<EngineProbe>) {
    let probe = Arc::new(EngineProbe::default());
    let factory_probe = Arc::clone(&probe);
    let encoder = Encoder::new(move |config: &EncoderConfig| {
        FakeEngine::open(config, &options, &factory_probe)
    });
    (encoder, probe)
}

/// Collects packets delivered to a packet handler
#[derive(Clone, Default)]
pub struct PacketLog(Arc<Mutex<Vec<Vec<u8>>>>);

impl PacketLog {
    pub fn handler(&self) -> impl FnMut(&[u8]) + Send + 'static {
        let log = Arc::clone(&self.0);
        move |data: &[u8]| log.lock().unwrap().push(data.to_vec())
    }

    pub fn len(&self) -> usize {
        self.0.lock().unwrap().len()
    }

    /// The pts carried by every packet from a [`FakeEngine`]
    pub fn timestamps(&self) -> Vec<i64> {
        self.0
            .lock()
            .unwrap()
            .iter()
            .map(|packet| {
                let mut bytes = [0u8; 8];
                bytes.copy_from_slice(&packet[..8]);
                i64::from_le_bytes(bytes)
            })
            .collect()
    }
}

/// Planar 4:2:0 frame bytes for a `width`x`height` picture
pub fn i420_frame(width: u32, height: u32) -> Vec<u8> {
    let luma = (width * height) as usize;
    vec![0x80; luma + 2 * (luma / 4)]
}
