// SPDX-License-Identifier: GPL-3.0-only

//! V4L2 memory-mapped streaming device
//!
//! Capabilities and format negotiation go through the `v4l` crate. The
//! streaming ioctls (`REQBUFS`, `QUERYBUF`, `QBUF`, `DQBUF`, `STREAMON`,
//! `STREAMOFF`) are issued one by one through the crate's raw bindings so
//! buffer ownership stays under the control of
//! [`super::buffer_pool::BufferPool`] instead of the crate's own stream type.

use super::CaptureDevice;
use super::types::{DequeuedBuffer, FrameGeometry, PixelLayout, Readiness};
use crate::errors::{CaptureError, CaptureResult};
use std::io;
use std::mem;
use std::os::raw::c_void;
use std::os::unix::fs::FileTypeExt;
use std::os::unix::io::RawFd;
use std::path::Path;
use std::ptr::{self, NonNull};
use std::time::Duration;
use tracing::{debug, info, warn};
use v4l::buffer::Type;
use v4l::capability::Flags;
use v4l::memory::Memory;
use v4l::prelude::*;
use v4l::v4l2::{self, vidioc};
use v4l::v4l_sys::{v4l2_buffer, v4l2_crop, v4l2_cropcap, v4l2_requestbuffers};
use v4l::video::Capture;
use v4l::{Format, FourCC};

fn mmap_capture_buffer(index: u32) -> v4l2_buffer {
    v4l2_buffer {
        index,
        type_: Type::VideoCapture as u32,
        memory: Memory::Mmap as u32,
        // SAFETY: all-zero is a valid bit pattern for this plain C struct
        ..unsafe { mem::zeroed() }
    }
}

/// Issue an ioctl, retrying while it is interrupted by a signal
fn xioctl<T>(fd: RawFd, request: vidioc::_IOC_TYPE, arg: &mut T) -> io::Result<()> {
    let argp = (arg as *mut T).cast::<c_void>();
    loop {
        // SAFETY: `arg` is the v4l_sys struct the request number was built for
        match unsafe { v4l2::ioctl(fd, request, argp) } {
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            result => return result,
        }
    }
}

/// One device buffer mapped into the process; unmapped on drop
pub struct MappedRegion {
    ptr: NonNull<u8>,
    len: usize,
}

// SAFETY: the mapping is plain shared memory with no thread affinity; access is
// serialised by the buffer pool's ownership tracking
unsafe impl Send for MappedRegion {}

impl AsRef<[u8]> for MappedRegion {
    fn as_ref(&self) -> &[u8] {
        // SAFETY: ptr/len describe a live mapping owned by self
        unsafe { std::slice::from_raw_parts(self.ptr.as_ptr(), self.len) }
    }
}

impl Drop for MappedRegion {
    fn drop(&mut self) {
        // SAFETY: ptr/len came from a successful mmap and are unmapped only here
        if let Err(e) = unsafe { v4l2::munmap(self.ptr.as_ptr().cast(), self.len) } {
            warn!(len = self.len, error = %e, "munmap failed");
        }
    }
}

/// A V4L2 capture node opened for memory-mapped streaming
pub struct V4l2Device {
    path: String,
    device: Device,
    fd: RawFd,
}

impl V4l2Device {
    /// Open `path` and check it can do streaming video capture
    pub fn open(path: &Path) -> CaptureResult<Self> {
        let path_str = path.display().to_string();

        let metadata = std::fs::metadata(path).map_err(|e| CaptureError::DeviceOpen {
            path: path_str.clone(),
            reason: e.to_string(),
        })?;
        if !metadata.file_type().is_char_device() {
            return Err(CaptureError::DeviceOpen {
                path: path_str,
                reason: "not a character device".to_string(),
            });
        }

        let device = Device::with_path(path).map_err(|e| CaptureError::DeviceOpen {
            path: path_str.clone(),
            reason: e.to_string(),
        })?;

        let caps = device.query_caps().map_err(|e| CaptureError::Io {
            operation: "VIDIOC_QUERYCAP",
            source: e,
        })?;
        if !caps.capabilities.contains(Flags::VIDEO_CAPTURE) {
            return Err(CaptureError::NotCaptureDevice(path_str));
        }
        if !caps.capabilities.contains(Flags::STREAMING) {
            return Err(CaptureError::StreamingUnsupported(path_str));
        }

        let fd = device.handle().fd();
        info!(
            path = %path_str,
            card = %caps.card,
            driver = %caps.driver,
            "Opened capture device"
        );

        Ok(Self {
            path: path_str,
            device,
            fd,
        })
    }

    pub fn path(&self) -> &str {
        &self.path
    }

    fn stream_ioctl(
        &self,
        request: vidioc::_IOC_TYPE,
        operation: &'static str,
    ) -> CaptureResult<()> {
        let mut buf_type = Type::VideoCapture as libc::c_int;
        xioctl(self.fd, request, &mut buf_type)
            .map_err(|source| CaptureError::Io { operation, source })
    }

    /// Put the crop rectangle back to the driver default so a previous
    /// user's crop does not shrink the frame. Not every driver crops.
    fn reset_crop(&self) {
        let mut cropcap = v4l2_cropcap {
            type_: Type::VideoCapture as u32,
            // SAFETY: all-zero is a valid bit pattern for this plain C struct
            ..unsafe { mem::zeroed() }
        };
        if let Err(e) = xioctl(self.fd, vidioc::VIDIOC_CROPCAP, &mut cropcap) {
            debug!(error = %e, "Device reports no cropping capabilities");
            return;
        }

        let mut crop = v4l2_crop {
            type_: Type::VideoCapture as u32,
            c: cropcap.defrect,
        };
        match xioctl(self.fd, vidioc::VIDIOC_S_CROP, &mut crop) {
            Ok(()) => debug!(
                width = crop.c.width,
                height = crop.c.height,
                "Crop reset to the default rectangle"
            ),
            Err(e) => debug!(error = %e, "Device does not support cropping"),
        }
    }
}

impl CaptureDevice for V4l2Device {
    type Region = MappedRegion;

    fn negotiate_format(&mut self, width: u32, height: u32) -> CaptureResult<FrameGeometry> {
        self.reset_crop();
        let mut offered = Vec::new();

        for layout in PixelLayout::PREFERENCE {
            let request = Format::new(width, height, FourCC::new(layout.fourcc()));
            let actual = match self.device.set_format(&request) {
                Ok(format) => format,
                Err(e) => {
                    debug!(layout = %layout, error = %e, "Device rejected format");
                    continue;
                }
            };

            let Some(negotiated) = PixelLayout::from_fourcc(&actual.fourcc.repr) else {
                offered.push(actual.fourcc.to_string());
                continue;
            };

            let stride = if actual.stride > 0 {
                actual.stride
            } else {
                negotiated.default_stride(actual.width)
            };
            let geometry = FrameGeometry {
                width: actual.width,
                height: actual.height,
                stride,
                layout: negotiated,
            };

            if actual.width != width || actual.height != height {
                info!(
                    requested_width = width,
                    requested_height = height,
                    width = actual.width,
                    height = actual.height,
                    "Device adjusted frame size"
                );
            }
            info!(geometry = %geometry, "Negotiated capture format");
            return Ok(geometry);
        }

        Err(CaptureError::FormatNegotiation(format!(
            "{} offers no planar or packed YUV format (got {})",
            self.path,
            if offered.is_empty() {
                "nothing".to_string()
            } else {
                offered.join(", ")
            }
        )))
    }

    fn request_buffers(&mut self, count: u32) -> CaptureResult<u32> {
        let mut req = v4l2_requestbuffers {
            count,
            type_: Type::VideoCapture as u32,
            memory: Memory::Mmap as u32,
            // SAFETY: all-zero is a valid bit pattern for this plain C struct
            ..unsafe { mem::zeroed() }
        };
        match xioctl(self.fd, vidioc::VIDIOC_REQBUFS, &mut req) {
            Ok(()) => Ok(req.count),
            Err(e) if e.raw_os_error() == Some(libc::EINVAL) => {
                Err(CaptureError::MemoryMappingUnsupported)
            }
            Err(source) => Err(CaptureError::Io {
                operation: "VIDIOC_REQBUFS",
                source,
            }),
        }
    }

    fn map_buffer(&mut self, index: u32) -> CaptureResult<MappedRegion> {
        let mut buffer = mmap_capture_buffer(index);
        xioctl(self.fd, vidioc::VIDIOC_QUERYBUF, &mut buffer).map_err(|e| {
            CaptureError::BufferMapping {
                index,
                reason: format!("VIDIOC_QUERYBUF: {}", e),
            }
        })?;

        let len = buffer.length as usize;
        // SAFETY: the union member written by QUERYBUF for MMAP memory is `offset`
        let offset = unsafe { buffer.m.offset };

        // SAFETY: maps a driver-provided region; validated below before use
        let addr = unsafe {
            v4l2::mmap(
                ptr::null_mut(),
                len,
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_SHARED,
                self.fd,
                offset as libc::off_t,
            )
        }
        .map_err(|e| CaptureError::BufferMapping {
            index,
            reason: e.to_string(),
        })?;
        let ptr = NonNull::new(addr.cast::<u8>()).ok_or(CaptureError::BufferMapping {
            index,
            reason: "mmap returned a null address".to_string(),
        })?;

        debug!(index, len, offset, "Mapped device buffer");
        Ok(MappedRegion { ptr, len })
    }

    fn release_buffers(&mut self) -> CaptureResult<()> {
        self.request_buffers(0).map(|_| ())
    }

    fn queue_buffer(&mut self, index: u32) -> CaptureResult<()> {
        let mut buffer = mmap_capture_buffer(index);
        xioctl(self.fd, vidioc::VIDIOC_QBUF, &mut buffer).map_err(|source| {
            CaptureError::Io {
                operation: "VIDIOC_QBUF",
                source,
            }
        })
    }

    fn dequeue_buffer(&mut self) -> CaptureResult<Option<DequeuedBuffer>> {
        let mut buffer = mmap_capture_buffer(0);
        match xioctl(self.fd, vidioc::VIDIOC_DQBUF, &mut buffer) {
            Ok(()) => Ok(Some(DequeuedBuffer {
                index: buffer.index,
                bytes_used: buffer.bytesused as usize,
            })),
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => Ok(None),
            Err(source) => Err(CaptureError::Io {
                operation: "VIDIOC_DQBUF",
                source,
            }),
        }
    }

    fn wait_readable(&mut self, timeout: Duration) -> CaptureResult<Readiness> {
        let mut pfd = libc::pollfd {
            fd: self.fd,
            events: libc::POLLIN,
            revents: 0,
        };
        let timeout_ms = timeout.as_millis().min(libc::c_int::MAX as u128) as libc::c_int;

        // SAFETY: a single valid pollfd
        let result = unsafe { libc::poll(&mut pfd, 1, timeout_ms) };
        if result < 0 {
            let err = io::Error::last_os_error();
            if err.kind() == io::ErrorKind::Interrupted {
                return Ok(Readiness::Interrupted);
            }
            return Err(CaptureError::Io {
                operation: "poll",
                source: err,
            });
        }
        if result == 0 {
            return Ok(Readiness::TimedOut);
        }
        if pfd.revents & libc::POLLIN != 0 {
            return Ok(Readiness::Ready);
        }
        Err(CaptureError::Io {
            operation: "poll",
            source: io::Error::other(format!(
                "device reported error condition (revents {:#x})",
                pfd.revents
            )),
        })
    }

    fn stream_on(&mut self) -> CaptureResult<()> {
        self.stream_ioctl(vidioc::VIDIOC_STREAMON, "VIDIOC_STREAMON")
    }

    fn stream_off(&mut self) -> CaptureResult<()> {
        self.stream_ioctl(vidioc::VIDIOC_STREAMOFF, "VIDIOC_STREAMOFF")
    }
}
