// PCIe Accelerator DMA Engine
// Copyright 2025 Henk-Jan Lebbink
// SPDX-License-Identifier: MIT

//! Error types for DMA engine operations.

use thiserror::Error;

/// Errors that can occur in the DMA engine and interrupt dispatch.
#[derive(Debug, Error)]
pub enum DmaError {
    /// Device address is not aligned to the backend's requirement.
    /// Rejected before any counter or buffer is touched.
    #[error("device address {addr:#018x} not aligned to {alignment} bytes")]
    Misaligned { addr: u64, alignment: u64 },

    /// A blocked wait was interrupted by external cancellation.
    /// The in-flight chunk was drained before this was returned.
    #[error("transfer cancelled while waiting for the pipeline")]
    Cancelled,

    /// Copying to or from the caller's buffer failed at the given
    /// transfer offset. The faulting chunk is never re-attempted.
    #[error("host buffer copy failed at transfer offset {offset}")]
    HostCopyFault { offset: usize },

    /// No candidate backend's probe succeeded at device attach.
    #[error("no DMA backend matched the device")]
    BackendUnavailable,

    /// Binding one interrupt vector failed. All previously bound
    /// vectors of this attach were released before this was returned.
    #[error("could not request interrupt vector {vector}: {source}")]
    InterruptRequestFailure {
        vector: usize,
        #[source]
        source: std::io::Error,
    },

    /// The out-of-band platform interrupt handler pool is exhausted.
    #[error("no interrupt mapping available")]
    NoMappingAvailable,

    /// Platform interrupt number outside the backend's range.
    #[error("invalid platform interrupt number: {irq_no} (must be < {max})")]
    InvalidInterrupt { irq_no: usize, max: usize },

    /// The platform interrupt number is already bound to a handler.
    #[error("platform interrupt {irq_no} is already mapped")]
    AlreadyMapped { irq_no: usize },

    /// Memory mapping the device register window failed.
    #[error("register window mapping failed: {0}")]
    RegisterMap(String),

    /// Register access outside the mapped window.
    #[error("register offset {offset:#x} outside window of {len:#x} bytes")]
    RegisterRange { offset: usize, len: usize },

    /// I/O error from system calls.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result type alias for DMA operations.
pub type DmaResult<T> = Result<T, DmaError>;
