// PCIe Accelerator DMA Engine
// Copyright 2025 Henk-Jan Lebbink
// SPDX-License-Identifier: MIT

//! Chunked, pipelined DMA transfers and interrupt dispatch for
//! PCIe-attached hardware accelerators.
//!
//! The engine splits transfers of arbitrary length into chunks of at most
//! [`CHUNK_SIZE`] bytes and streams them through a fixed ring of
//! [`DMA_CHUNKS`] pre-allocated DMA buffers per direction, overlapping
//! host copying with hardware transfers. Slot ownership is gated entirely
//! by three atomic counters per direction (`requested`, `enqueued`,
//! `processed`); there are no per-slot locks. Completions arrive through
//! the interrupt dispatcher, which supports slot-mapped vectors with
//! deferred, coalescing work items as well as aggregated status-word
//! lines.
//!
//! Device specifics live behind a [`backend::DmaBackend`] operation
//! table; the first candidate whose probe matches the device's register
//! window is selected at attach. A software-emulated backend
//! ([`emu::EmulatedBackend`]) runs the full pipeline without hardware.
//!
//! ```no_run
//! use accel_dma::chunk::DeviceAddress;
//! use accel_dma::emu::EmulatedBackend;
//! use accel_dma::engine::DmaEngine;
//! use accel_dma::regs::RegisterWindow;
//! use std::sync::Arc;
//!
//! # fn main() -> accel_dma::error::DmaResult<()> {
//! let backend = EmulatedBackend::new(0x10_0000);
//! let regs = Arc::new(RegisterWindow::in_memory(0x9000));
//! EmulatedBackend::stamp_identity(&regs)?;
//!
//! let engine = Arc::new(DmaEngine::init(0, regs, vec![backend.descriptor()])?);
//! # let _ = engine;
//! # Ok(())
//! # }
//! ```

pub mod backend;
pub mod buffer;
pub mod chunk;
pub mod counters;
pub mod emu;
pub mod engine;
pub mod error;
pub mod irq;
pub mod regs;

pub use crate::chunk::{DeviceAddress, Direction};
pub use crate::counters::CancelToken;
pub use crate::engine::DmaEngine;
pub use crate::error::{DmaError, DmaResult};

/// Chunk capacity: transfers are split into pieces of at most this many
/// bytes, matching the per-slot DMA buffer size.
pub const CHUNK_SIZE: usize = 256 * 1024;

/// Pipeline depth: number of pre-allocated DMA buffers per direction.
/// At most this many chunks are unprocessed at any time.
pub const DMA_CHUNKS: usize = 16;

/// Size of the fixed out-of-band platform interrupt handler pool.
pub const PLATFORM_IRQ_POOL: usize = 4;
