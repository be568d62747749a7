// SPDX-License-Identifier: GPL-3.0-only

//! Threads and the hand-off between them
//!
//! ```text
//! ┌──────────────┐   frame    ┌────────────┐   pop    ┌──────────────┐
//! │ capture      │ ─────────▶ │ WorkQueue  │ ───────▶ │ encode       │ ──▶ packets
//! │ thread       │  callback  │ (Condvar)  │          │ thread       │
//! └──────────────┘            └────────────┘          └──────────────┘
//! ```
//!
//! # Modules
//!
//! - [`work_queue`]: cancellable FIFO between the two threads
//! - [`worker`]: named loop threads that hand their state back on join
//! - [`recorder`]: the capture-to-encoder lifecycle controller

pub mod recorder;
pub mod work_queue;
pub mod worker;

pub use recorder::{CapturePipeline, PipelineState};
pub use work_queue::{CancelToken, WorkQueue};
pub use worker::{LoopAction, WorkerThread};
