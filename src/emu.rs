// PCIe Accelerator DMA Engine
// Copyright 2025 Henk-Jan Lebbink
// SPDX-License-Identifier: MIT

//! Software-emulated DMA backend.
//!
//! `EmulatedBackend` drives no hardware: device memory is an in-process
//! byte vector and completions are raised from a background thread, so
//! the full pipeline — chunking, counter gates, interrupt dispatch — can
//! run end to end without a device. It backs the examples, the benches
//! and the integration tests, and doubles as a reference implementation
//! of the backend contract.
//!
//! Probing follows the hardware backends: the device identification
//! register must read back the emulated engine's ID.

use crate::backend::{BackendCaps, BackendDescriptor, DmaBackend, IrqWiring, RegisterLayout};
use crate::buffer::DmaBuffer;
use crate::chunk::{DeviceAddress, Direction};
use crate::counters::EnqueueTicket;
use crate::error::DmaResult;
use crate::regs::RegisterWindow;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::mpsc::{self, Sender};
use std::sync::{Arc, Mutex, OnceLock, PoisonError};
use std::thread::{self, JoinHandle};
use std::time::Duration;

/// Byte offset of the identification register.
pub const EMU_ID_OFFSET: usize = 0x0;
/// Value the identification register reads back for this backend.
pub const EMU_ID: u32 = 0x00E1_0DDA;

/// Acknowledge register offset used by the emulated descriptor.
const EMU_ACK_OFFSET: usize = 0x8120;

/// Called once per completed transfer chunk, with the direction it
/// completed in. Typically wired to raise the matching interrupt vector.
pub type CompletionHook = Box<dyn Fn(Direction) + Send + Sync>;

/// In-process software DMA device.
pub struct EmulatedBackend {
    mem: Mutex<Vec<u8>>,
    next_handle: AtomicU64,
    hook: Arc<OnceLock<CompletionHook>>,
    paused: Arc<AtomicBool>,
    completions: Mutex<Option<Sender<Direction>>>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl EmulatedBackend {
    /// Create an emulated device with `mem_size` bytes of device memory.
    /// Device memory grows on demand if a transfer reaches past the end.
    pub fn new(mem_size: usize) -> Arc<Self> {
        let (tx, rx) = mpsc::channel::<Direction>();
        let hook: Arc<OnceLock<CompletionHook>> = Arc::new(OnceLock::new());
        let paused = Arc::new(AtomicBool::new(false));

        let worker = {
            let hook = Arc::clone(&hook);
            let paused = Arc::clone(&paused);
            thread::spawn(move || {
                for direction in rx {
                    while paused.load(Ordering::SeqCst) {
                        thread::sleep(Duration::from_millis(1));
                    }
                    if let Some(hook) = hook.get() {
                        hook(direction);
                    } else {
                        log::error!("emu: completion dropped, no hook installed");
                    }
                }
            })
        };

        Arc::new(Self {
            mem: Mutex::new(vec![0u8; mem_size]),
            next_handle: AtomicU64::new(0x1000),
            hook,
            paused,
            completions: Mutex::new(Some(tx)),
            worker: Mutex::new(Some(worker)),
        })
    }

    /// Install the completion hook. Must be called before transfers;
    /// completions raised earlier are dropped with an error log.
    pub fn set_completion(&self, hook: CompletionHook) {
        if self.hook.set(hook).is_err() {
            log::error!("emu: completion hook already installed");
        }
    }

    /// Write the identification register so a probe of `regs` matches.
    pub fn stamp_identity(regs: &RegisterWindow) -> DmaResult<()> {
        regs.write32(EMU_ID_OFFSET, EMU_ID)
    }

    /// Descriptor for this device, first-candidate ready.
    pub fn descriptor(self: &Arc<Self>) -> BackendDescriptor {
        BackendDescriptor {
            name: "emu-dma",
            irq_lines: 8,
            platform_irqs: 4,
            wiring: IrqWiring::SlotMapped,
            caps: BackendCaps::COALESCING_STATUS | BackendCaps::COHERENT_BUFFERS,
            layout: RegisterLayout {
                ack_offset: EMU_ACK_OFFSET,
            },
            ops: Arc::clone(self) as Arc<dyn DmaBackend>,
        }
    }

    /// Hold back completion delivery (they queue up) until unpaused.
    /// Lets tests park transfers at their completion waits.
    pub fn pause_completions(&self, paused: bool) {
        self.paused.store(paused, Ordering::SeqCst);
    }

    /// Snapshot of device memory at `addr`.
    pub fn read_device(&self, addr: u64, len: usize) -> Vec<u8> {
        let mut mem = self.mem.lock().unwrap_or_else(PoisonError::into_inner);
        Self::reach(&mut mem, addr, len);
        mem[addr as usize..addr as usize + len].to_vec()
    }

    /// Pre-fill device memory at `addr`.
    pub fn write_device(&self, addr: u64, data: &[u8]) {
        let mut mem = self.mem.lock().unwrap_or_else(PoisonError::into_inner);
        Self::reach(&mut mem, addr, data.len());
        mem[addr as usize..addr as usize + data.len()].copy_from_slice(data);
    }

    fn reach(mem: &mut Vec<u8>, addr: u64, len: usize) {
        let end = addr as usize + len;
        if end > mem.len() {
            mem.resize(end, 0);
        }
    }

    fn queue_completion(&self, direction: Direction) {
        let tx = self.completions.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(tx) = tx.as_ref() {
            // Receiver lives as long as the sender; send cannot fail.
            let _ = tx.send(direction);
        }
    }
}

impl DmaBackend for EmulatedBackend {
    fn probe(&self, regs: &RegisterWindow) -> bool {
        matches!(regs.read32(EMU_ID_OFFSET), Ok(id) if id == EMU_ID)
    }

    fn alignment(&self) -> u64 {
        64
    }

    fn allocate_buffer(&self, _direction: Direction, size: usize) -> DmaResult<DmaBuffer> {
        let handle = self.next_handle.fetch_add(size as u64, Ordering::SeqCst);
        Ok(DmaBuffer::new(size, handle))
    }

    fn free_buffer(&self, _direction: Direction, _buffer: DmaBuffer) {}

    // Device memory is host memory here; the sync hooks are no-ops.
    fn buffer_cpu(&self, _direction: Direction, _buffer: &mut DmaBuffer, _len: usize) {}
    fn buffer_dev(&self, _direction: Direction, _buffer: &mut DmaBuffer, _len: usize) {}

    fn copy_to(&self, dev_addr: DeviceAddress, buffer: &DmaBuffer, len: usize) -> DmaResult<()> {
        {
            let mut mem = self.mem.lock().unwrap_or_else(PoisonError::into_inner);
            Self::reach(&mut mem, dev_addr.0, len);
            let start = dev_addr.0 as usize;
            mem[start..start + len].copy_from_slice(&buffer.bytes()[..len]);
        }
        self.queue_completion(Direction::ToDev);
        Ok(())
    }

    fn copy_from(
        &self,
        buffer: &mut DmaBuffer,
        dev_addr: DeviceAddress,
        len: usize,
        tokens: &EnqueueTicket<'_>,
    ) -> DmaResult<u64> {
        {
            let mut mem = self.mem.lock().unwrap_or_else(PoisonError::into_inner);
            Self::reach(&mut mem, dev_addr.0, len);
            let start = dev_addr.0 as usize;
            buffer.bytes_mut()[..len].copy_from_slice(&mem[start..start + len]);
        }
        // Token before completion: `processed` must never overtake
        // `enqueued`.
        let token = tokens.issue();
        self.queue_completion(Direction::FromDev);
        Ok(token)
    }
}

impl Drop for EmulatedBackend {
    fn drop(&mut self) {
        if let Some(tx) = self
            .completions
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
        {
            drop(tx);
        }
        if let Some(worker) = self
            .worker
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
        {
            let _ = worker.join();
        }
    }
}
