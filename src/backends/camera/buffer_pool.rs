// SPDX-License-Identifier: GPL-3.0-only

//! Memory-mapped capture buffers and their ownership
//!
//! Every slot is owned either by the device (queued, may be written at any
//! moment) or by the application (dequeued, safe to read). The pool is the
//! only place that flips that ownership, and it refuses transitions that
//! would let both sides touch the same memory.

use super::CaptureDevice;
use super::types::{DequeuedBuffer, SlotOwner};
use crate::constants::MIN_BUFFER_COUNT;
use crate::errors::{CaptureError, CaptureResult};
use tracing::{debug, info, warn};

struct Slot<R> {
    region: R,
    owner: SlotOwner,
}

/// The set of mapped buffers granted by one buffer request
pub struct BufferPool<R> {
    slots: Vec<Slot<R>>,
}

impl<R: AsRef<[u8]>> BufferPool<R> {
    /// Request `requested` buffers from the device and map every granted one.
    ///
    /// On failure, regions mapped so far are unmapped and the kernel buffers
    /// are handed back before the error is returned.
    pub fn allocate<D>(device: &mut D, requested: u32) -> CaptureResult<Self>
    where
        D: CaptureDevice<Region = R>,
    {
        let granted = device.request_buffers(requested)?;
        if granted < MIN_BUFFER_COUNT {
            Self::release_kernel_buffers(device);
            return Err(CaptureError::InsufficientBuffers {
                granted,
                minimum: MIN_BUFFER_COUNT,
            });
        }
        if granted != requested {
            info!(requested, granted, "Device adjusted buffer count");
        }

        let mut slots = Vec::with_capacity(granted as usize);
        for index in 0..granted {
            match device.map_buffer(index) {
                Ok(region) => slots.push(Slot {
                    region,
                    owner: SlotOwner::Application,
                }),
                Err(e) => {
                    warn!(index, error = %e, "Buffer mapping failed, rolling back");
                    drop(slots);
                    Self::release_kernel_buffers(device);
                    return Err(e);
                }
            }
        }

        debug!(count = granted, "Mapped capture buffers");
        Ok(Self { slots })
    }

    fn release_kernel_buffers<D: CaptureDevice>(device: &mut D) {
        if let Err(e) = device.release_buffers() {
            warn!(error = %e, "Failed to release device buffers");
        }
    }

    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    pub fn owner(&self, index: u32) -> Option<SlotOwner> {
        self.slots.get(index as usize).map(|slot| slot.owner)
    }

    /// Number of slots currently queued to the device
    pub fn device_owned(&self) -> usize {
        self.slots
            .iter()
            .filter(|slot| slot.owner == SlotOwner::Device)
            .count()
    }

    /// Queue every application-owned slot to the device
    pub fn queue_all<D>(&mut self, device: &mut D) -> CaptureResult<()>
    where
        D: CaptureDevice<Region = R>,
    {
        for index in 0..self.slots.len() as u32 {
            if self.owner(index) == Some(SlotOwner::Application) {
                self.requeue(device, index)?;
            }
        }
        Ok(())
    }

    /// Take ownership of a slot the device just handed back.
    ///
    /// Returns the filled part of the buffer.
    pub fn take_dequeued(&mut self, buffer: DequeuedBuffer) -> CaptureResult<&[u8]> {
        let slot = self.slot_mut(buffer.index)?;
        if slot.owner != SlotOwner::Device {
            return Err(CaptureError::BufferOwnership {
                index: buffer.index,
                reason: "dequeued a slot the device does not own",
            });
        }
        slot.owner = SlotOwner::Application;

        let data = slot.region.as_ref();
        let len = buffer.bytes_used.min(data.len());
        if len < buffer.bytes_used {
            warn!(
                index = buffer.index,
                bytes_used = buffer.bytes_used,
                length = data.len(),
                "Device reported more bytes than the buffer holds"
            );
        }
        Ok(&data[..len])
    }

    /// Hand a slot back to the device
    pub fn requeue<D>(&mut self, device: &mut D, index: u32) -> CaptureResult<()>
    where
        D: CaptureDevice<Region = R>,
    {
        let slot = self.slot_mut(index)?;
        if slot.owner == SlotOwner::Device {
            return Err(CaptureError::BufferOwnership {
                index,
                reason: "slot is already queued to the device",
            });
        }
        device.queue_buffer(index)?;
        slot.owner = SlotOwner::Device;
        Ok(())
    }

    /// Mark every slot application-owned. Only valid once streaming is off,
    /// which implicitly dequeues everything.
    pub fn reclaim_all(&mut self) {
        for slot in &mut self.slots {
            slot.owner = SlotOwner::Application;
        }
    }

    /// Unmap every region, then hand the kernel buffers back
    pub fn release<D>(mut self, device: &mut D)
    where
        D: CaptureDevice<Region = R>,
    {
        let count = self.slots.len();
        self.slots.clear();
        Self::release_kernel_buffers(device);
        debug!(count, "Released capture buffers");
    }

    fn slot_mut(&mut self, index: u32) -> CaptureResult<&mut Slot<R>> {
        self.slots
            .get_mut(index as usize)
            .ok_or(CaptureError::BufferOwnership {
                index,
                reason: "index outside the buffer pool",
            })
    }
}
