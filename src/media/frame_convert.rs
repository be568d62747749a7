// SPDX-License-Identifier: GPL-3.0-only

//! Raw capture frames to planar I420
//!
//! Encoders take one contiguous buffer: the luma plane (`w*h` bytes), then
//! Cb and Cr (`w*h/4` bytes each). Capture buffers may carry line padding or
//! arrive packed as YUYV, so every frame is copied into that layout before it
//! leaves the capture thread.

use crate::backends::camera::{FrameGeometry, PixelLayout};
use crate::errors::{EncodeError, EncodeResult};

/// An owned I420 frame stamped with its presentation timestamp
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PlanarFrame {
    /// Presentation timestamp in frame-rate units (the capture sequence)
    pub pts: i64,
    pub width: u32,
    pub height: u32,
    data: Vec<u8>,
}

impl PlanarFrame {
    pub fn data(&self) -> &[u8] {
        &self.data
    }

    pub fn luma_len(&self) -> usize {
        self.width as usize * self.height as usize
    }

    pub fn chroma_len(&self) -> usize {
        self.luma_len() / 4
    }

    pub fn y_plane(&self) -> &[u8] {
        &self.data[..self.luma_len()]
    }

    pub fn u_plane(&self) -> &[u8] {
        let start = self.luma_len();
        &self.data[start..start + self.chroma_len()]
    }

    pub fn v_plane(&self) -> &[u8] {
        let start = self.luma_len() + self.chroma_len();
        &self.data[start..start + self.chroma_len()]
    }
}

/// Copy `raw` into a freshly allocated I420 frame.
///
/// Fails on odd or zero dimensions, on input shorter than the geometry
/// requires, and when the frame buffer cannot be allocated.
pub fn pack_i420(sequence: u32, raw: &[u8], geometry: &FrameGeometry) -> EncodeResult<PlanarFrame> {
    let width = geometry.width as usize;
    let height = geometry.height as usize;
    let stride = geometry.stride as usize;

    if width == 0 || height == 0 || width % 2 != 0 || height % 2 != 0 {
        return Err(EncodeError::InvalidGeometry(format!(
            "{}x{} cannot be subsampled to 4:2:0",
            width, height
        )));
    }
    let min_stride = geometry.layout.default_stride(geometry.width) as usize;
    if stride < min_stride {
        return Err(EncodeError::InvalidGeometry(format!(
            "stride {} is shorter than a {} line of {} bytes",
            stride, geometry.layout, min_stride
        )));
    }

    let expected = geometry.frame_len();
    if raw.len() < expected {
        return Err(EncodeError::FrameTooShort {
            expected,
            actual: raw.len(),
        });
    }

    let luma_len = width * height;
    let total = luma_len + 2 * (luma_len / 4);
    let mut data = Vec::new();
    data.try_reserve_exact(total)
        .map_err(|_| EncodeError::Allocation(total))?;
    data.resize(total, 0);

    let (y, chroma) = data.split_at_mut(luma_len);
    let (u, v) = chroma.split_at_mut(luma_len / 4);

    match geometry.layout {
        PixelLayout::Yuv420 => {
            let chroma_stride = stride / 2;
            let u_offset = stride * height;
            let v_offset = u_offset + chroma_stride * (height / 2);
            copy_plane(raw, stride, width, height, y);
            copy_plane(&raw[u_offset..], chroma_stride, width / 2, height / 2, u);
            copy_plane(&raw[v_offset..], chroma_stride, width / 2, height / 2, v);
        }
        PixelLayout::Yuyv => yuyv_to_i420(raw, stride, width, height, y, u, v),
    }

    Ok(PlanarFrame {
        pts: i64::from(sequence),
        width: geometry.width,
        height: geometry.height,
        data,
    })
}

/// Copy `rows` lines of `width` bytes from a padded source into a packed plane
fn copy_plane(source: &[u8], stride: usize, width: usize, rows: usize, destination: &mut [u8]) {
    if stride == width {
        let len = width * rows;
        destination[..len].copy_from_slice(&source[..len]);
        return;
    }
    for (row, line) in destination.chunks_exact_mut(width).take(rows).enumerate() {
        let start = row * stride;
        line.copy_from_slice(&source[start..start + width]);
    }
}

/// De-interleave packed 4:2:2 and average chroma over each pair of lines
fn yuyv_to_i420(
    source: &[u8],
    stride: usize,
    width: usize,
    height: usize,
    y: &mut [u8],
    u: &mut [u8],
    v: &mut [u8],
) {
    let chroma_width = width / 2;

    for pair in 0..height / 2 {
        let top = &source[2 * pair * stride..][..width * 2];
        let bottom = &source[(2 * pair + 1) * stride..][..width * 2];

        let y_top = &mut y[2 * pair * width..][..width];
        for (dst, src) in y_top.iter_mut().zip(top.iter().step_by(2)) {
            *dst = *src;
        }
        let y_bottom = &mut y[(2 * pair + 1) * width..][..width];
        for (dst, src) in y_bottom.iter_mut().zip(bottom.iter().step_by(2)) {
            *dst = *src;
        }

        let u_row = &mut u[pair * chroma_width..][..chroma_width];
        let v_row = &mut v[pair * chroma_width..][..chroma_width];
        let pixel_pairs = top.chunks_exact(4).zip(bottom.chunks_exact(4));
        for (k, (top_px, bottom_px)) in pixel_pairs.enumerate() {
            u_row[k] = average(top_px[1], bottom_px[1]);
            v_row[k] = average(top_px[3], bottom_px[3]);
        }
    }
}

fn average(a: u8, b: u8) -> u8 {
    ((u16::from(a) + u16::from(b) + 1) / 2) as u8
}
