// PCIe Accelerator DMA Engine
// Copyright 2025 Henk-Jan Lebbink
// SPDX-License-Identifier: MIT

//! Hardware backend abstraction and device-class selection.
//!
//! A [`BackendDescriptor`] bundles everything device-specific the engine
//! needs: the operation table ([`DmaBackend`]), the interrupt wiring
//! variant, the interrupt line counts and the register layout. At device
//! attach the first candidate in a fixed, ordered list whose probe
//! succeeds is selected; the descriptor is immutable afterwards and is
//! the only indirection point for device-specific DMA mechanics.

use crate::buffer::DmaBuffer;
use crate::chunk::{DeviceAddress, Direction};
use crate::counters::EnqueueTicket;
use crate::error::{DmaError, DmaResult};
use crate::regs::RegisterWindow;
use bitflags::bitflags;
use std::sync::Arc;

bitflags! {
    /// Per-backend hardware contract flags.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct BackendCaps: u32 {
        /// The interrupt status hardware re-aggregates events raised
        /// while a work item for the same slot was still unserviced, so
        /// the dispatcher may coalesce duplicate work items without
        /// losing completions. Must be validated per backend; it is not
        /// a universal hardware property.
        const COALESCING_STATUS = 1 << 0;
        /// DMA buffers are cache-coherent; the `buffer_cpu`/`buffer_dev`
        /// hooks are no-ops.
        const COHERENT_BUFFERS = 1 << 1;
        /// The device decodes full 64-bit addresses.
        const ADDR_64 = 1 << 2;
    }
}

/// How the device's physical interrupt lines map to logical completion
/// events.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IrqWiring {
    /// One physical line per logical completion slot; completions are
    /// dispatched through deferred work items.
    SlotMapped,
    /// A few shared lines, each with a 32-bit status word holding one
    /// bit per logical slot; the status word is drained inline.
    Aggregated,
}

/// Register-space layout metadata for interrupt acknowledgment.
#[derive(Debug, Clone, Copy)]
pub struct RegisterLayout {
    /// Byte offset of the interrupt acknowledge register. Slot
    /// completions are acknowledged by writing `slot + platform_irqs`
    /// here; platform interrupts by writing their own number.
    pub ack_offset: usize,
}

impl RegisterLayout {
    /// Byte offset of the aggregated status word for a physical line.
    /// The status words live directly after the acknowledge register.
    pub const fn status_offset(&self, line: usize) -> usize {
        self.ack_offset + 4 * (1 + line)
    }
}

/// The device-specific operation table.
///
/// Implementations drive one hardware platform variant. All methods are
/// called with the engine's counter-gated exclusivity guarantees: a
/// buffer passed in is owned by exactly one in-flight chunk.
pub trait DmaBackend: Send + Sync {
    /// Probe the device through its register window. Returns `true` if
    /// this backend drives the device. A failing probe must not retain
    /// any state.
    fn probe(&self, regs: &RegisterWindow) -> bool;

    /// Required device-address alignment for transfers, in bytes.
    fn alignment(&self) -> u64;

    /// Allocate one DMA-capable buffer with a device-visible handle.
    fn allocate_buffer(&self, direction: Direction, size: usize) -> DmaResult<DmaBuffer>;

    /// Return a buffer obtained from [`allocate_buffer`](Self::allocate_buffer).
    fn free_buffer(&self, direction: Direction, buffer: DmaBuffer);

    /// Make the first `len` buffer bytes coherent for CPU access.
    fn buffer_cpu(&self, direction: Direction, buffer: &mut DmaBuffer, len: usize);

    /// Make the first `len` buffer bytes coherent for device access.
    fn buffer_dev(&self, direction: Direction, buffer: &mut DmaBuffer, len: usize);

    /// Program a host-to-device copy of `len` bytes from the buffer to
    /// `dev_addr`. Completion is signaled through the write-direction
    /// interrupt path.
    fn copy_to(&self, dev_addr: DeviceAddress, buffer: &DmaBuffer, len: usize) -> DmaResult<()>;

    /// Program a device-to-host copy of `len` bytes from `dev_addr` into
    /// the buffer. The implementation draws exactly one completion token
    /// from `tokens` after accepting the submission and returns it; the
    /// read-direction `processed` counter reaches the token when the
    /// copy completes.
    fn copy_from(
        &self,
        buffer: &mut DmaBuffer,
        dev_addr: DeviceAddress,
        len: usize,
        tokens: &EnqueueTicket<'_>,
    ) -> DmaResult<u64>;
}

/// Immutable description of one hardware platform variant, chosen once
/// at device attach.
#[derive(Clone)]
pub struct BackendDescriptor {
    /// Human-readable backend name for logs.
    pub name: &'static str,
    /// Number of slot-completion interrupt lines.
    pub irq_lines: usize,
    /// Number of platform interrupt vectors preceding the slot lines
    /// (the slot lines start at vector `platform_irqs`).
    pub platform_irqs: usize,
    /// Interrupt wiring variant.
    pub wiring: IrqWiring,
    /// Hardware contract flags.
    pub caps: BackendCaps,
    /// Register-space layout.
    pub layout: RegisterLayout,
    /// The operation table.
    pub ops: Arc<dyn DmaBackend>,
}

impl std::fmt::Debug for BackendDescriptor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BackendDescriptor")
            .field("name", &self.name)
            .field("irq_lines", &self.irq_lines)
            .field("platform_irqs", &self.platform_irqs)
            .field("wiring", &self.wiring)
            .field("caps", &self.caps)
            .finish_non_exhaustive()
    }
}

/// Select the backend for a device: probe the ordered candidates and
/// return the first match. Later candidates are not tried once one
/// succeeds; if none match, the attach fails with
/// [`DmaError::BackendUnavailable`] and no partial state is retained.
pub fn select_backend(
    candidates: Vec<BackendDescriptor>,
    regs: &RegisterWindow,
) -> DmaResult<BackendDescriptor> {
    log::debug!("detecting DMA engine type ...");
    for candidate in candidates {
        if candidate.ops.probe(regs) {
            log::info!("selected DMA backend '{}'", candidate.name);
            return Ok(candidate);
        }
        log::debug!("backend '{}' did not match", candidate.name);
    }
    log::error!("unknown DMA engine");
    Err(DmaError::BackendUnavailable)
}
