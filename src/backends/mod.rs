// SPDX-License-Identifier: GPL-3.0-only

//! Hardware backends
//!
//! - [`camera`]: memory-mapped V4L2 capture behind the `CaptureDevice` seam

pub mod camera;
