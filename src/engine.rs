// PCIe Accelerator DMA Engine
// Copyright 2025 Henk-Jan Lebbink
// SPDX-License-Identifier: MIT

//! The chunked, pipelined transfer engine.
//!
//! One [`DmaEngine`] per attached device. Transfers of arbitrary length
//! are split into chunks of at most [`CHUNK_SIZE`](crate::CHUNK_SIZE)
//! bytes and streamed through a fixed ring of
//! [`DMA_CHUNKS`](crate::DMA_CHUNKS) pre-allocated DMA buffers per
//! direction, so host copying of chunk `k + 1` overlaps the hardware
//! transfer of chunk `k`.
//!
//! # Write path
//!
//! `copy_to` may be called concurrently; chunks of concurrent transfers
//! interleave through the shared sequence counter while each transfer's
//! own chunks stay in order. Per chunk: claim a sequence number, wait for
//! its ring slot (`processed + N > seq`), fill the slot buffer, wait for
//! the in-order enqueue turn (`enqueued == seq`), program the hardware,
//! advance `enqueued`. The call returns once the transfer's last chunk
//! has completed.
//!
//! # Read path
//!
//! `copy_from` is serialized per device by a coarse mutex and resets the
//! read counters per transfer. Submissions carry a completion token drawn
//! from the enqueue counter by the backend; a slot is recycled only after
//! its previous token is satisfied, and a final pass drains the
//! outstanding slots in ring order.
//!
//! # Aborts
//!
//! A cancelled or faulted write chunk that was admitted but never
//! enqueued is drained synthetically (its `enqueued` and `processed`
//! steps are taken on its behalf) so concurrent transfers sharing the
//! direction never stall. An aborted read waits out every outstanding
//! token before returning, since the hardware still owns those buffers.

use crate::backend::{select_backend, BackendDescriptor};
use crate::buffer::SlotPool;
use crate::chunk::{ChunkExtent, ChunkSplit, DeviceAddress, Direction};
use crate::counters::{CancelToken, TransferCounters};
use crate::error::{DmaError, DmaResult};
use crate::irq::CompletionSink;
use crate::regs::RegisterWindow;
use crate::{CHUNK_SIZE, DMA_CHUNKS};
use std::sync::{Arc, Mutex, PoisonError};

/// Fixed slot of the write-direction interrupt in slot-event numbering.
pub const WRITE_COMPLETION_SLOT: usize = 0;
/// Fixed slot of the read-direction interrupt in slot-event numbering.
pub const READ_COMPLETION_SLOT: usize = 1;

/// One direction's pipeline state: the counter triple and the buffer ring.
struct DirectionLane {
    counters: TransferCounters,
    pool: SlotPool,
}

/// A read submission whose completion is still outstanding: where its
/// bytes go in the caller's span once its token is satisfied.
#[derive(Debug, Clone, Copy)]
struct PendingRead {
    token: u64,
    dst_offset: usize,
    len: usize,
}

/// Chunked, pipelined DMA transfer engine for one device.
pub struct DmaEngine {
    dev_id: u32,
    regs: Arc<RegisterWindow>,
    descriptor: BackendDescriptor,
    alignment: u64,
    write: DirectionLane,
    read: DirectionLane,
    /// Serializes the read path and guards the per-slot pending table.
    read_serial: Mutex<Box<[Option<PendingRead>]>>,
}

impl DmaEngine {
    /// Attach the engine to a device: probe the ordered backend
    /// candidates and pre-allocate both buffer rings.
    ///
    /// All-or-nothing: if the write ring cannot be allocated, the read
    /// ring is freed again before the error is returned.
    pub fn init(
        dev_id: u32,
        regs: Arc<RegisterWindow>,
        candidates: Vec<BackendDescriptor>,
    ) -> DmaResult<Self> {
        let descriptor = select_backend(candidates, &regs)?;
        let alignment = descriptor.ops.alignment();
        log::debug!(
            "dma {dev_id}: allocating {DMA_CHUNKS} chunk buffers of {CHUNK_SIZE} bytes per direction"
        );

        let mut read_pool =
            SlotPool::allocate(&*descriptor.ops, Direction::FromDev, DMA_CHUNKS, CHUNK_SIZE)?;
        let write_pool =
            match SlotPool::allocate(&*descriptor.ops, Direction::ToDev, DMA_CHUNKS, CHUNK_SIZE) {
                Ok(pool) => pool,
                Err(e) => {
                    read_pool.free(&*descriptor.ops);
                    return Err(e);
                }
            };

        log::debug!("dma {dev_id}: engine initialized with backend '{}'", descriptor.name);
        Ok(Self {
            dev_id,
            regs,
            alignment,
            descriptor,
            write: DirectionLane {
                counters: TransferCounters::new(),
                pool: write_pool,
            },
            read: DirectionLane {
                counters: TransferCounters::new(),
                pool: read_pool,
            },
            read_serial: Mutex::new(vec![None; DMA_CHUNKS].into_boxed_slice()),
        })
    }

    /// Return both buffer rings to the backend. Idempotent; also runs on
    /// drop.
    pub fn exit(&mut self) {
        self.write.pool.free(&*self.descriptor.ops);
        self.read.pool.free(&*self.descriptor.ops);
        log::debug!("dma {}: engine deinitialized", self.dev_id);
    }

    pub fn dev_id(&self) -> u32 {
        self.dev_id
    }

    /// The backend descriptor selected at attach.
    pub fn descriptor(&self) -> &BackendDescriptor {
        &self.descriptor
    }

    /// Required device-address alignment, in bytes.
    pub fn alignment(&self) -> u64 {
        self.alignment
    }

    pub fn regs(&self) -> &Arc<RegisterWindow> {
        &self.regs
    }

    /// The counter triple of one direction.
    pub fn counters(&self, direction: Direction) -> &TransferCounters {
        match direction {
            Direction::ToDev => &self.write.counters,
            Direction::FromDev => &self.read.counters,
        }
    }

    /// Write-direction completion interrupt: one chunk reached the device.
    pub fn write_interrupt(&self) {
        let processed = self.write.counters.advance_processed();
        log::trace!("dma {}: write chunk completed, processed={processed}", self.dev_id);
    }

    /// Read-direction completion interrupt: one chunk arrived from the
    /// device.
    pub fn read_interrupt(&self) {
        let processed = self.read.counters.advance_processed();
        log::trace!("dma {}: read chunk completed, processed={processed}", self.dev_id);
    }

    fn check_alignment(&self, dev_addr: DeviceAddress) -> DmaResult<()> {
        if !dev_addr.is_aligned(self.alignment) {
            log::error!(
                "dma {}: transfer address {:#x} not aligned to {} bytes",
                self.dev_id,
                dev_addr.0,
                self.alignment
            );
            return Err(DmaError::Misaligned {
                addr: dev_addr.0,
                alignment: self.alignment,
            });
        }
        Ok(())
    }

    /// Copy `data` to the device at `dev_addr`. Blocks until the last
    /// chunk has completed; returns the number of bytes transferred.
    pub fn copy_to(&self, dev_addr: DeviceAddress, data: &[u8]) -> DmaResult<u64> {
        self.copy_to_cancellable(dev_addr, data, &CancelToken::new())
    }

    /// [`copy_to`](Self::copy_to) with a cancellation point at every
    /// blocking wait. A chunk aborted before its enqueue is drained so
    /// concurrent writers never stall; once all chunks are enqueued the
    /// hardware finishes them regardless of cancellation.
    pub fn copy_to_cancellable(
        &self,
        dev_addr: DeviceAddress,
        data: &[u8],
        cancel: &CancelToken,
    ) -> DmaResult<u64> {
        self.check_alignment(dev_addr)?;
        if data.is_empty() {
            return Ok(0);
        }
        log::debug!(
            "dma {}: copying {} bytes to device address {:#x}",
            self.dev_id,
            data.len(),
            dev_addr.0
        );

        let counters = &self.write.counters;
        let ops = &*self.descriptor.ops;
        let mut last = 0u64;
        for extent in ChunkSplit::new(data.len()) {
            let seq = counters.admit();
            let slot = (seq % DMA_CHUNKS as u64) as usize;

            if let Err(e) = counters.wait_slot_free(seq, DMA_CHUNKS as u64, cancel) {
                counters.abort_drain(seq);
                return Err(e);
            }
            // SAFETY: this thread holds sequence number `seq` and the
            // slot-free gate has passed, so chunk `seq - N` (the slot's
            // previous owner) has completed and released its borrow; no
            // other live chunk maps to `seq % N`.
            let buf = unsafe { self.write.pool.slot(slot) };
            ops.buffer_cpu(Direction::ToDev, buf, extent.len);
            if let Err(e) = copy_into(buf.bytes_mut(), data, &extent) {
                counters.abort_drain(seq);
                return Err(e);
            }
            ops.buffer_dev(Direction::ToDev, buf, extent.len);
            log::trace!(
                "dma {}: write status: requested={} enqueued={} processed={}",
                self.dev_id,
                counters.requested(),
                counters.enqueued(),
                counters.processed()
            );

            if let Err(e) = counters.wait_enqueue_turn(seq, cancel) {
                counters.abort_drain(seq);
                return Err(e);
            }
            if let Err(e) = ops.copy_to(dev_addr.offset(extent.dev_offset), buf, extent.len) {
                counters.abort_drain(seq);
                return Err(e);
            }
            counters.advance_enqueued();
            last = seq;
        }

        counters.wait_processed_past(last, cancel)?;
        Ok(data.len() as u64)
    }

    /// Copy `data.len()` bytes from the device at `dev_addr` into `data`.
    /// Returns the number of bytes transferred.
    pub fn copy_from(&self, dev_addr: DeviceAddress, data: &mut [u8]) -> DmaResult<u64> {
        self.copy_from_cancellable(dev_addr, data, &CancelToken::new())
    }

    /// [`copy_from`](Self::copy_from) with a cancellation point at every
    /// blocking wait. An aborted read first waits out all outstanding
    /// completion tokens, since the hardware still owns those buffers.
    pub fn copy_from_cancellable(
        &self,
        dev_addr: DeviceAddress,
        data: &mut [u8],
        cancel: &CancelToken,
    ) -> DmaResult<u64> {
        self.check_alignment(dev_addr)?;
        if data.is_empty() {
            return Ok(0);
        }
        log::debug!(
            "dma {}: copying {} bytes from device address {:#x}",
            self.dev_id,
            data.len(),
            dev_addr.0
        );

        // One read transfer at a time per device.
        let mut pending = self
            .read_serial
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        let counters = &self.read.counters;
        let ops = &*self.descriptor.ops;
        counters.reset();
        pending.fill(None);

        for extent in ChunkSplit::new(data.len()) {
            let seq = counters.admit();
            let slot = (seq % DMA_CHUNKS as u64) as usize;

            // Recycle the slot: its previous submission must land first.
            if let Some(prev) = pending[slot].take() {
                if let Err(e) = counters.wait_processed_at_least(prev.token, cancel) {
                    pending[slot] = Some(prev);
                    self.read_abort(&mut pending);
                    return Err(e);
                }
                // SAFETY: the read path is serialized by `read_serial`
                // and `prev.token` is satisfied, so neither another
                // thread nor the hardware touches this slot.
                let buf = unsafe { self.read.pool.slot(slot) };
                ops.buffer_cpu(Direction::FromDev, buf, prev.len);
                if let Err(e) = copy_out(data, buf.bytes(), prev.dst_offset, prev.len) {
                    self.read_abort(&mut pending);
                    return Err(e);
                }
            }

            // SAFETY: as above; the slot's pending entry is cleared.
            let buf = unsafe { self.read.pool.slot(slot) };
            ops.buffer_dev(Direction::FromDev, buf, extent.len);
            let token = match ops.copy_from(
                buf,
                dev_addr.offset(extent.dev_offset),
                extent.len,
                &counters.ticket(),
            ) {
                Ok(token) => token,
                Err(e) => {
                    self.read_abort(&mut pending);
                    return Err(e);
                }
            };
            pending[slot] = Some(PendingRead {
                token,
                dst_offset: extent.host_offset,
                len: extent.len,
            });
            log::trace!(
                "dma {}: read status: requested={} enqueued={} processed={}",
                self.dev_id,
                counters.requested(),
                counters.enqueued(),
                counters.processed()
            );
        }

        // Drain the outstanding slots, oldest submission first.
        let start = ChunkSplit::chunk_count(data.len()) % DMA_CHUNKS;
        for i in 0..DMA_CHUNKS {
            let slot = (start + i) % DMA_CHUNKS;
            let Some(p) = pending[slot].take() else {
                continue;
            };
            if let Err(e) = counters.wait_processed_at_least(p.token, cancel) {
                pending[slot] = Some(p);
                self.read_abort(&mut pending);
                return Err(e);
            }
            // SAFETY: as above; `p.token` is satisfied.
            let buf = unsafe { self.read.pool.slot(slot) };
            ops.buffer_cpu(Direction::FromDev, buf, p.len);
            if let Err(e) = copy_out(data, buf.bytes(), p.dst_offset, p.len) {
                self.read_abort(&mut pending);
                return Err(e);
            }
        }
        Ok(data.len() as u64)
    }

    /// Wait out every outstanding read submission after an abort. Not
    /// cancellable: the hardware writes those buffers until their tokens
    /// land, and the next transfer reuses the ring.
    fn read_abort(&self, pending: &mut [Option<PendingRead>]) {
        let outstanding = pending.iter().flatten().count();
        if outstanding > 0 {
            log::warn!(
                "dma {}: aborting read with {outstanding} outstanding chunks",
                self.dev_id
            );
        }
        for p in pending.iter_mut() {
            if let Some(p) = p.take() {
                self.read.counters.drain_token(p.token);
            }
        }
    }
}

impl Drop for DmaEngine {
    fn drop(&mut self) {
        self.exit();
    }
}

/// Slot-event numbering convention of the engine: the first two slot
/// vectors of a device carry the write and read completion interrupts.
impl CompletionSink for DmaEngine {
    fn slot_event(&self, slot: usize) {
        match slot {
            WRITE_COMPLETION_SLOT => self.write_interrupt(),
            READ_COMPLETION_SLOT => self.read_interrupt(),
            other => log::warn!(
                "dma {}: completion event on unassigned slot {other}",
                self.dev_id
            ),
        }
    }

    fn platform_event(&self, irq_no: usize) {
        log::trace!("dma {}: platform event on line {irq_no}", self.dev_id);
    }
}

fn copy_into(dst: &mut [u8], src: &[u8], extent: &ChunkExtent) -> DmaResult<()> {
    let fault = DmaError::HostCopyFault {
        offset: extent.host_offset,
    };
    let Some(src) = src.get(extent.host_offset..extent.host_offset + extent.len) else {
        return Err(fault);
    };
    let Some(dst) = dst.get_mut(..extent.len) else {
        return Err(fault);
    };
    dst.copy_from_slice(src);
    Ok(())
}

fn copy_out(dst: &mut [u8], src: &[u8], offset: usize, len: usize) -> DmaResult<()> {
    let fault = DmaError::HostCopyFault { offset };
    let Some(src) = src.get(..len) else {
        return Err(fault);
    };
    let Some(dst) = dst.get_mut(offset..offset + len) else {
        return Err(fault);
    };
    dst.copy_from_slice(src);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::emu::EmulatedBackend;
    use std::sync::Weak;

    /// Engine on an emulated device, completions delivered straight into
    /// the engine's interrupt entry points.
    fn attach() -> (Arc<EmulatedBackend>, Arc<DmaEngine>) {
        let backend = EmulatedBackend::new(0x10_0000);
        let regs = Arc::new(RegisterWindow::in_memory(0x9000));
        EmulatedBackend::stamp_identity(&regs).unwrap();
        let engine = Arc::new(
            DmaEngine::init(0, regs, vec![backend.descriptor()]).unwrap(),
        );
        let weak: Weak<DmaEngine> = Arc::downgrade(&engine);
        backend.set_completion(Box::new(move |direction| {
            if let Some(engine) = weak.upgrade() {
                match direction {
                    Direction::ToDev => engine.write_interrupt(),
                    Direction::FromDev => engine.read_interrupt(),
                }
            }
        }));
        (backend, engine)
    }

    fn pattern(len: usize) -> Vec<u8> {
        (0..len).map(|i| (i * 31 % 251) as u8).collect()
    }

    #[test]
    fn write_roundtrip_multi_chunk() {
        let (backend, engine) = attach();
        let data = pattern(600 * 1024);
        let written = engine.copy_to(DeviceAddress(0x4000), &data).unwrap();
        assert_eq!(written, data.len() as u64);
        assert_eq!(backend.read_device(0x4000, data.len()), data);

        let c = engine.counters(Direction::ToDev);
        assert_eq!(c.requested(), 3);
        assert_eq!(c.enqueued(), 3);
        assert_eq!(c.processed(), 3);
    }

    #[test]
    fn read_roundtrip_multi_chunk() {
        let (backend, engine) = attach();
        let data = pattern(600 * 1024);
        backend.write_device(0x8000, &data);

        let mut out = vec![0u8; data.len()];
        let read = engine.copy_from(DeviceAddress(0x8000), &mut out).unwrap();
        assert_eq!(read, data.len() as u64);
        assert_eq!(out, data);
    }

    #[test]
    fn misaligned_address_is_rejected_without_side_effects() {
        let (_backend, engine) = attach();
        let data = pattern(1024);
        let err = engine.copy_to(DeviceAddress(0x4001), &data);
        assert!(matches!(err, Err(DmaError::Misaligned { addr: 0x4001, .. })));
        assert_eq!(engine.counters(Direction::ToDev).requested(), 0);

        let mut out = vec![0u8; 1024];
        let err = engine.copy_from(DeviceAddress(0x4001), &mut out);
        assert!(matches!(err, Err(DmaError::Misaligned { .. })));
        assert_eq!(engine.counters(Direction::FromDev).requested(), 0);
    }

    #[test]
    fn empty_transfer_is_a_no_op() {
        let (_backend, engine) = attach();
        assert_eq!(engine.copy_to(DeviceAddress(0), &[]).unwrap(), 0);
        let mut out = [];
        assert_eq!(engine.copy_from(DeviceAddress(0), &mut out).unwrap(), 0);
        assert_eq!(engine.counters(Direction::ToDev).requested(), 0);
        assert_eq!(engine.counters(Direction::FromDev).requested(), 0);
    }

    #[test]
    fn sub_chunk_transfers_roundtrip() {
        let (backend, engine) = attach();
        for len in [1usize, 64, 4096, CHUNK_SIZE - 1, CHUNK_SIZE] {
            let data = pattern(len);
            engine.copy_to(DeviceAddress(0x1_0000), &data).unwrap();
            assert_eq!(backend.read_device(0x1_0000, len), data);

            let mut out = vec![0u8; len];
            engine.copy_from(DeviceAddress(0x1_0000), &mut out).unwrap();
            assert_eq!(out, data);
        }
    }

    #[test]
    fn back_to_back_reads_reset_counters() {
        let (backend, engine) = attach();
        let first = pattern(3 * CHUNK_SIZE);
        backend.write_device(0, &first);
        let mut out = vec![0u8; first.len()];
        engine.copy_from(DeviceAddress(0), &mut out).unwrap();
        assert_eq!(out, first);

        // The second transfer starts from a reset counter triple.
        let second = pattern(CHUNK_SIZE + 11);
        backend.write_device(0x10_0000, &second);
        let mut out = vec![0u8; second.len()];
        engine.copy_from(DeviceAddress(0x10_0000), &mut out).unwrap();
        assert_eq!(out, second);
        let c = engine.counters(Direction::FromDev);
        assert_eq!(c.requested(), 2);
        assert_eq!(c.processed(), 2);
    }

    #[test]
    fn completion_sink_routes_fixed_slots() {
        let backend = EmulatedBackend::new(0x1000);
        let regs = Arc::new(RegisterWindow::in_memory(0x9000));
        EmulatedBackend::stamp_identity(&regs).unwrap();
        let engine = DmaEngine::init(0, regs, vec![backend.descriptor()]).unwrap();

        engine.slot_event(WRITE_COMPLETION_SLOT);
        engine.slot_event(READ_COMPLETION_SLOT);
        engine.slot_event(7); // unassigned, logged and dropped
        assert_eq!(engine.counters(Direction::ToDev).processed(), 1);
        assert_eq!(engine.counters(Direction::FromDev).processed(), 1);
    }

    #[test]
    fn attach_fails_when_no_backend_probes() {
        let backend = EmulatedBackend::new(0x1000);
        let regs = Arc::new(RegisterWindow::in_memory(0x9000));
        // Identity register never stamped: the probe must miss.
        let err = DmaEngine::init(0, regs, vec![backend.descriptor()]);
        assert!(matches!(err, Err(DmaError::BackendUnavailable)));
    }
}
