// PCIe Accelerator DMA Engine
// Copyright 2025 Henk-Jan Lebbink
// SPDX-License-Identifier: MIT

//! DMA buffer pool.
//!
//! Each direction owns a fixed ring of pre-allocated, DMA-capable buffers
//! with device-visible handles, allocated through the backend operation
//! table at engine init and freed in reverse order at exit or on any init
//! failure. Slot `seq % N` is owned exclusively by the chunk holding
//! sequence number `seq`; ownership is gated by the completion counters,
//! never by locking the slot itself.

use crate::backend::DmaBackend;
use crate::chunk::Direction;
use crate::error::DmaResult;
use scopeguard::ScopeGuard;
use std::cell::UnsafeCell;

/// One DMA-capable buffer: host-side storage plus the device-visible
/// handle the backend programs into the hardware.
#[derive(Debug)]
pub struct DmaBuffer {
    host: Box<[u8]>,
    dev_handle: u64,
}

impl DmaBuffer {
    /// Wrap `size` zeroed host bytes with a device handle.
    pub fn new(size: usize, dev_handle: u64) -> Self {
        Self {
            host: vec![0u8; size].into_boxed_slice(),
            dev_handle,
        }
    }

    /// Device-visible handle for this buffer.
    pub fn dev_handle(&self) -> u64 {
        self.dev_handle
    }

    pub fn len(&self) -> usize {
        self.host.len()
    }

    pub fn is_empty(&self) -> bool {
        self.host.is_empty()
    }

    pub fn bytes(&self) -> &[u8] {
        &self.host
    }

    pub fn bytes_mut(&mut self) -> &mut [u8] {
        &mut self.host
    }
}

/// Fixed ring of direction-tagged DMA buffers.
///
/// The pool hands out `&mut DmaBuffer` for a slot index without any
/// per-slot lock; the counter-gated pipeline guarantees at most one
/// in-flight chunk owns a slot at a time.
#[derive(Debug)]
pub struct SlotPool {
    direction: Direction,
    slots: Box<[UnsafeCell<DmaBuffer>]>,
}

// SAFETY: slots are only reached through `SlotPool::slot`, whose caller
// must hold the counter-gated exclusive ownership of that slot index
// (write path: `processed + N > seq` admitted exactly one owner for
// `seq % N`; read path: serialized by the direction's coarse mutex).
unsafe impl Send for SlotPool {}
unsafe impl Sync for SlotPool {}

impl SlotPool {
    /// Allocate `count` buffers of `size` bytes through the backend.
    ///
    /// On any allocation failure the already-allocated buffers are freed
    /// in reverse order and the backend error is returned.
    pub fn allocate(
        backend: &dyn DmaBackend,
        direction: Direction,
        count: usize,
        size: usize,
    ) -> DmaResult<Self> {
        let mut allocated = scopeguard::guard(Vec::with_capacity(count), |bufs: Vec<DmaBuffer>| {
            for buf in bufs.into_iter().rev() {
                backend.free_buffer(direction, buf);
            }
        });
        for _ in 0..count {
            match backend.allocate_buffer(direction, size) {
                Ok(buf) => allocated.push(buf),
                Err(e) => {
                    log::error!(
                        "failed to allocate {size} bytes for {} direction",
                        direction.name()
                    );
                    return Err(e);
                }
            }
        }
        let slots = ScopeGuard::into_inner(allocated)
            .into_iter()
            .map(UnsafeCell::new)
            .collect();
        Ok(Self { direction, slots })
    }

    pub fn direction(&self) -> Direction {
        self.direction
    }

    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    /// Exclusive access to one slot's buffer.
    ///
    /// # Safety
    ///
    /// The caller must be the unique counter-gated owner of `index`: no
    /// other thread may hold a reference to the same slot for the
    /// lifetime of the returned borrow, and the hardware must not be
    /// writing the slot (its completion counter has caught up).
    #[allow(clippy::mut_from_ref)]
    pub(crate) unsafe fn slot(&self, index: usize) -> &mut DmaBuffer {
        &mut *self.slots[index].get()
    }

    /// Free all buffers through the backend, newest first. Idempotent.
    pub fn free(&mut self, backend: &dyn DmaBackend) {
        let slots = std::mem::take(&mut self.slots);
        for cell in Vec::from(slots).into_iter().rev() {
            backend.free_buffer(self.direction, cell.into_inner());
        }
    }
}
