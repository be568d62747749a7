// SPDX-License-Identifier: GPL-3.0-only

//! Shared types for the capture backend

use std::fmt;

/// Pixel layouts the capture side can negotiate
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PixelLayout {
    /// Planar YUV 4:2:0 (`YU12`): Y plane, then U, then V
    Yuv420,
    /// Packed YUV 4:2:2 (`YUYV`): Y0 U Y1 V per pixel pair
    Yuyv,
}

impl PixelLayout {
    /// Layouts in negotiation order, preferred first
    pub const PREFERENCE: [PixelLayout; 2] = [PixelLayout::Yuv420, PixelLayout::Yuyv];

    pub fn fourcc(&self) -> &'static [u8; 4] {
        match self {
            PixelLayout::Yuv420 => b"YU12",
            PixelLayout::Yuyv => b"YUYV",
        }
    }

    pub fn from_fourcc(code: &[u8; 4]) -> Option<Self> {
        Self::PREFERENCE
            .into_iter()
            .find(|layout| layout.fourcc() == code)
    }

    /// Bytes per line of the first plane when the device reports no stride
    pub fn default_stride(&self, width: u32) -> u32 {
        match self {
            PixelLayout::Yuv420 => width,
            PixelLayout::Yuyv => width * 2,
        }
    }

    /// Bytes a frame of this layout occupies with the given first-plane stride
    pub fn frame_len(&self, stride: u32, height: u32) -> usize {
        let stride = stride as usize;
        let height = height as usize;
        match self {
            PixelLayout::Yuv420 => stride * height + 2 * ((stride / 2) * (height / 2)),
            PixelLayout::Yuyv => stride * height,
        }
    }
}

impl fmt::Display for PixelLayout {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&String::from_utf8_lossy(self.fourcc()))
    }
}

/// Frame format as negotiated with the device.
///
/// These values can differ from the request; everything downstream must use
/// them instead of the requested ones.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameGeometry {
    pub width: u32,
    pub height: u32,
    /// Bytes per line of the first plane
    pub stride: u32,
    pub layout: PixelLayout,
}

impl FrameGeometry {
    /// Tightly packed geometry with the layout's natural stride
    pub fn packed(width: u32, height: u32, layout: PixelLayout) -> Self {
        Self {
            width,
            height,
            stride: layout.default_stride(width),
            layout,
        }
    }

    /// Size of one raw frame as the device delivers it
    pub fn frame_len(&self) -> usize {
        self.layout.frame_len(self.stride, self.height)
    }

    /// Size of the same frame once packed into planar 4:2:0
    pub fn planar_len(&self) -> usize {
        let luma = self.width as usize * self.height as usize;
        luma + 2 * (luma / 4)
    }
}

impl fmt::Display for FrameGeometry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}x{} {} (stride {})",
            self.width, self.height, self.layout, self.stride
        )
    }
}

/// A completed frame, borrowed from a device buffer.
///
/// Only valid for the duration of the frame callback: the buffer goes back to
/// the device as soon as the callback returns, so anything needed later must
/// be copied out.
#[derive(Debug, Clone, Copy)]
pub struct CapturedFrame<'a> {
    /// Per-session frame counter, starting at 0
    pub sequence: u32,
    /// Filled part of the buffer
    pub data: &'a [u8],
}

/// Slot handed back by a dequeue
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DequeuedBuffer {
    pub index: u32,
    /// Bytes the device actually filled
    pub bytes_used: usize,
}

/// Outcome of a bounded wait for device readiness
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Readiness {
    /// A completed buffer can be dequeued
    Ready,
    /// Nothing arrived within the timeout
    TimedOut,
    /// The wait was interrupted by a signal; retry
    Interrupted,
}

/// Which side currently owns a buffer slot
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SlotOwner {
    /// Queued to the device, may be written at any time
    Device,
    /// Dequeued, readable by the process
    Application,
}
