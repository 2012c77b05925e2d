// PCIe Accelerator DMA Engine
// Copyright 2025 Henk-Jan Lebbink
// SPDX-License-Identifier: MIT

//! Interrupt dispatch.
//!
//! Maps the device's physical interrupt vectors to logical completion
//! events. Top-half work runs in the interrupt delivery context and never
//! blocks beyond a brief bookkeeping lock: it acknowledges the hardware,
//! updates counters and either drains an aggregated status word inline or
//! defers per-slot work to a worker (the bottom half), which invokes the
//! registered [`CompletionSink`].
//!
//! # Wiring variants
//!
//! - [`IrqWiring::SlotMapped`]: one vector per logical completion slot.
//!   If a work item for a slot is still pending when the vector fires
//!   again, the event is counted as coalesced instead of scheduling a
//!   duplicate — valid only where the backend declares
//!   [`BackendCaps::COALESCING_STATUS`](crate::backend::BackendCaps).
//! - [`IrqWiring::Aggregated`]: a few shared vectors, each with a status
//!   word holding one bit per logical slot, drained least-significant
//!   bit first within the top half.
//!
//! Vector numbering follows the device class: vectors
//! `0..platform_irqs` are platform interrupts (bound out-of-band through
//! the fixed handler pool), slot vectors start at `platform_irqs`.

use crate::backend::{BackendCaps, BackendDescriptor, IrqWiring, RegisterLayout};
use crate::error::{DmaError, DmaResult};
use crate::regs::RegisterWindow;
use crate::PLATFORM_IRQ_POOL;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::mpsc::{self, Sender};
use std::sync::{Arc, Mutex, PoisonError};
use std::thread::JoinHandle;

/// Name interrupt vectors are registered under.
const IRQ_NAME: &str = "accel-dma";

/// An installed interrupt handler. Runs in the host's delivery context;
/// must not block.
pub type IrqHandler = Box<dyn Fn() + Send + Sync>;

/// Source of interrupt vectors: the OS binding layer (VFIO eventfds,
/// UIO, ...) or an in-process host for emulation and tests.
pub trait IrqHost: Send + Sync {
    /// Bind `handler` to `vector`. Fails if the vector cannot be bound.
    fn request_irq(&self, vector: usize, name: &str, handler: IrqHandler)
        -> std::io::Result<()>;

    /// Release a vector previously bound with `request_irq`.
    fn free_irq(&self, vector: usize);
}

/// Consumer of logical completion events.
///
/// `slot_event` runs in deferred-work context for slot-mapped wiring and
/// in the top half for aggregated wiring; `platform_event` always runs
/// in the top half and must not block.
pub trait CompletionSink: Send + Sync {
    fn slot_event(&self, slot: usize);
    fn platform_event(&self, irq_no: usize);
}

/// Interrupt accounting. For slot-mapped wiring,
/// `total == scheduled + coalesced` — no event is silently lost.
#[derive(Debug, Default)]
struct IrqStats {
    total: AtomicU64,
    scheduled: AtomicU64,
    coalesced: AtomicU64,
    spurious: AtomicU64,
}

/// Point-in-time copy of the interrupt counters.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IrqStatsSnapshot {
    /// Hardware interrupts received.
    pub total: u64,
    /// Deferred work items scheduled (slot-mapped wiring).
    pub scheduled: u64,
    /// Events folded into an already-pending work item.
    pub coalesced: u64,
    /// Interrupts whose aggregated status word was empty.
    pub spurious: u64,
}

struct DispatchState {
    dev_id: u32,
    platform_irqs: usize,
    layout: RegisterLayout,
    regs: Arc<RegisterWindow>,
    sink: Arc<dyn CompletionSink>,
    stats: IrqStats,
    /// One flag per slot vector: a deferred work item is outstanding.
    pending: Box<[AtomicBool]>,
    work_tx: Mutex<Option<Sender<usize>>>,
}

impl DispatchState {
    /// Slot-mapped top half: defer, count, acknowledge.
    fn slot_top_half(&self, nr: usize) {
        if self.pending[nr].swap(true, Ordering::SeqCst) {
            // Work item still outstanding; the hardware status
            // re-aggregates the event for the next service.
            self.stats.coalesced.fetch_add(1, Ordering::SeqCst);
        } else {
            self.stats.scheduled.fetch_add(1, Ordering::SeqCst);
            let tx = self.work_tx.lock().unwrap_or_else(PoisonError::into_inner);
            if let Some(tx) = tx.as_ref() {
                let _ = tx.send(nr);
            }
        }
        self.stats.total.fetch_add(1, Ordering::SeqCst);
        let ack = (nr + self.platform_irqs) as u32;
        if let Err(e) = self.regs.write32(self.layout.ack_offset, ack) {
            log::error!("dma {}: slot irq {nr} acknowledge failed: {e}", self.dev_id);
        }
    }

    /// Aggregated top half: drain the line's status word inline.
    fn aggregated_top_half(&self, nr: usize) {
        self.stats.total.fetch_add(1, Ordering::SeqCst);
        let isr = match self.regs.read32(self.layout.status_offset(nr)) {
            Ok(isr) => isr,
            Err(e) => {
                log::error!("dma {}: reading ISR {nr} failed: {e}", self.dev_id);
                return;
            }
        };
        if isr == 0 {
            self.stats.spurious.fetch_add(1, Ordering::SeqCst);
            log::error!("dma {}: interrupt received, but ISR {nr} is empty", self.dev_id);
            return;
        }
        // The status word is consumed by the service; clear it before
        // dispatching so events raised afterwards re-arm the line.
        if let Err(e) = self.regs.write32(self.layout.status_offset(nr), 0) {
            log::error!("dma {}: clearing ISR {nr} failed: {e}", self.dev_id);
        }
        let mut isr = isr;
        while isr != 0 {
            let slot = isr.trailing_zeros() as usize;
            self.sink.slot_event(nr * 32 + slot);
            isr ^= 1 << slot;
        }
    }

    /// Platform top half: signal and acknowledge one logical line.
    fn platform_top_half(&self, irq_no: usize) {
        self.sink.platform_event(irq_no);
        if let Err(e) = self.regs.write32(self.layout.ack_offset, irq_no as u32) {
            log::error!(
                "dma {}: platform irq {irq_no} acknowledge failed: {e}",
                self.dev_id
            );
        }
    }
}

/// Owns a device's interrupt vector bindings for one attach.
pub struct InterruptDispatcher {
    dev_id: u32,
    host: Arc<dyn IrqHost>,
    state: Arc<DispatchState>,
    /// Slot vectors bound at init, freed in reverse order.
    lines: Mutex<Vec<usize>>,
    /// Out-of-band platform bindings, by pool index.
    platform: Mutex<[Option<usize>; PLATFORM_IRQ_POOL]>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl InterruptDispatcher {
    /// Claim all slot interrupt vectors of the device.
    ///
    /// All-or-nothing: if any vector fails to bind, every previously
    /// bound vector of this attach is released (in reverse order) before
    /// the error is returned.
    pub fn init(
        dev_id: u32,
        descriptor: &BackendDescriptor,
        regs: Arc<RegisterWindow>,
        host: Arc<dyn IrqHost>,
        sink: Arc<dyn CompletionSink>,
    ) -> DmaResult<Self> {
        if descriptor.wiring == IrqWiring::SlotMapped
            && !descriptor.caps.contains(BackendCaps::COALESCING_STATUS)
        {
            log::warn!(
                "dma {dev_id}: backend '{}' does not declare status coalescing; \
                 slot events raised against a pending work item may be lost",
                descriptor.name
            );
        }

        let pending = (0..descriptor.irq_lines).map(|_| AtomicBool::new(false)).collect();
        let (work_tx, worker) = match descriptor.wiring {
            IrqWiring::SlotMapped => {
                let (tx, rx) = mpsc::channel::<usize>();
                (Some(tx), Some(rx))
            }
            IrqWiring::Aggregated => (None, None),
        };

        let state = Arc::new(DispatchState {
            dev_id,
            platform_irqs: descriptor.platform_irqs,
            layout: descriptor.layout,
            regs,
            sink,
            stats: IrqStats::default(),
            pending,
            work_tx: Mutex::new(work_tx),
        });

        // Bottom half: one deferred-work context draining slot events.
        let mut worker = worker.map(|rx| {
            let state = Arc::clone(&state);
            std::thread::spawn(move || {
                for nr in rx {
                    state.pending[nr].store(false, Ordering::SeqCst);
                    state.sink.slot_event(nr);
                }
            })
        });

        log::debug!(
            "dma {dev_id}: registering {} interrupts ...",
            descriptor.irq_lines
        );
        let mut bound: Vec<usize> = Vec::with_capacity(descriptor.irq_lines);
        for nr in 0..descriptor.irq_lines {
            let vector = descriptor.platform_irqs + nr;
            let st = Arc::clone(&state);
            let handler: IrqHandler = match descriptor.wiring {
                IrqWiring::SlotMapped => Box::new(move || st.slot_top_half(nr)),
                IrqWiring::Aggregated => Box::new(move || st.aggregated_top_half(nr)),
            };
            match host.request_irq(vector, IRQ_NAME, handler) {
                Ok(()) => {
                    log::debug!("dma {dev_id}: interrupt line {nr}/{vector} assigned");
                    bound.push(vector);
                }
                Err(source) => {
                    log::error!("dma {dev_id}: could not request interrupt {vector}: {source}");
                    for v in bound.drain(..).rev() {
                        host.free_irq(v);
                    }
                    if let Some(tx) = state
                        .work_tx
                        .lock()
                        .unwrap_or_else(PoisonError::into_inner)
                        .take()
                    {
                        drop(tx);
                    }
                    if let Some(worker) = worker.take() {
                        let _ = worker.join();
                    }
                    return Err(DmaError::InterruptRequestFailure { vector, source });
                }
            }
        }

        Ok(Self {
            dev_id,
            host,
            state,
            lines: Mutex::new(bound),
            platform: Mutex::new([None; PLATFORM_IRQ_POOL]),
            worker: Mutex::new(worker),
        })
    }

    /// Release all slot vectors in reverse acquisition order and stop
    /// the deferred worker. Idempotent; platform bindings are released
    /// by their owners through [`release_platform_irq`](Self::release_platform_irq).
    pub fn exit(&self) {
        let mut lines = self.lines.lock().unwrap_or_else(PoisonError::into_inner);
        for vector in lines.drain(..).rev() {
            log::debug!("dma {}: freeing interrupt {vector}", self.dev_id);
            self.host.free_irq(vector);
        }
        drop(lines);
        if let Some(tx) = self
            .state
            .work_tx
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
        log::debug!("dma {}: interrupts deactivated", self.dev_id);
    }

    /// Bind a single platform interrupt line out-of-band, drawn from the
    /// fixed handler pool.
    pub fn request_platform_irq(&self, irq_no: usize) -> DmaResult<()> {
        if irq_no >= self.state.platform_irqs {
            log::error!(
                "dma {}: invalid platform interrupt number: {irq_no} (must be < {})",
                self.dev_id,
                self.state.platform_irqs
            );
            return Err(DmaError::InvalidInterrupt {
                irq_no,
                max: self.state.platform_irqs,
            });
        }

        let mut pool = self.platform.lock().unwrap_or_else(PoisonError::into_inner);
        if pool.iter().flatten().any(|&bound| bound == irq_no) {
            return Err(DmaError::AlreadyMapped { irq_no });
        }
        let Some(entry) = pool.iter_mut().find(|entry| entry.is_none()) else {
            log::error!("dma {}: no interrupt mapping available", self.dev_id);
            return Err(DmaError::NoMappingAvailable);
        };

        log::debug!("dma {}: requesting platform irq #{irq_no}", self.dev_id);
        let st = Arc::clone(&self.state);
        let handler: IrqHandler = Box::new(move || st.platform_top_half(irq_no));
        self.host
            .request_irq(irq_no, IRQ_NAME, handler)
            .map_err(|source| {
                log::error!(
                    "dma {}: could not request interrupt #{irq_no}: {source}",
                    self.dev_id
                );
                DmaError::InterruptRequestFailure {
                    vector: irq_no,
                    source,
                }
            })?;
        *entry = Some(irq_no);
        Ok(())
    }

    /// Release a platform interrupt line bound with
    /// [`request_platform_irq`](Self::request_platform_irq). Releasing
    /// an unbound line logs an error and is otherwise a no-op.
    pub fn release_platform_irq(&self, irq_no: usize) {
        if irq_no >= self.state.platform_irqs {
            log::error!(
                "dma {}: invalid platform interrupt number: {irq_no} (must be < {})",
                self.dev_id,
                self.state.platform_irqs
            );
            return;
        }
        let mut pool = self.platform.lock().unwrap_or_else(PoisonError::into_inner);
        let Some(entry) = pool
            .iter_mut()
            .find(|entry| **entry == Some(irq_no))
        else {
            log::error!(
                "dma {}: could not find mapping for interrupt {irq_no}",
                self.dev_id
            );
            return;
        };
        log::debug!("dma {}: freeing platform interrupt #{irq_no}", self.dev_id);
        self.host.free_irq(irq_no);
        *entry = None;
    }

    /// Interrupt accounting snapshot.
    pub fn stats(&self) -> IrqStatsSnapshot {
        let s = &self.state.stats;
        IrqStatsSnapshot {
            total: s.total.load(Ordering::SeqCst),
            scheduled: s.scheduled.load(Ordering::SeqCst),
            coalesced: s.coalesced.load(Ordering::SeqCst),
            spurious: s.spurious.load(Ordering::SeqCst),
        }
    }
}

impl Drop for InterruptDispatcher {
    fn drop(&mut self) {
        self.exit();
    }
}

// ============================================================================
// In-process interrupt host
// ============================================================================

/// In-process [`IrqHost`]: vectors are raised by calling
/// [`raise`](Self::raise), which runs the bound handler synchronously in
/// the caller's thread (the "interrupt context"). Backs emulated devices
/// and tests; failure injection is available per vector.
#[derive(Default)]
pub struct SoftIrqHost {
    handlers: Mutex<HashMap<usize, Arc<dyn Fn() + Send + Sync>>>,
    failing: Mutex<Vec<usize>>,
}

impl SoftIrqHost {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Make future `request_irq` calls for `vector` fail.
    pub fn fail_vector(&self, vector: usize) {
        self.failing
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(vector);
    }

    /// Deliver an interrupt on `vector`. Returns `false` if nothing is
    /// bound to it.
    pub fn raise(&self, vector: usize) -> bool {
        let handler = self
            .handlers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&vector)
            .cloned();
        match handler {
            Some(handler) => {
                handler();
                true
            }
            None => false,
        }
    }

    /// Currently bound vectors, ascending.
    pub fn bound_vectors(&self) -> Vec<usize> {
        let mut vectors: Vec<usize> = self
            .handlers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .keys()
            .copied()
            .collect();
        vectors.sort_unstable();
        vectors
    }
}

impl IrqHost for SoftIrqHost {
    fn request_irq(
        &self,
        vector: usize,
        _name: &str,
        handler: IrqHandler,
    ) -> std::io::Result<()> {
        if self
            .failing
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .contains(&vector)
        {
            return Err(std::io::Error::other("injected request_irq failure"));
        }
        let mut handlers = self.handlers.lock().unwrap_or_else(PoisonError::into_inner);
        if handlers.contains_key(&vector) {
            return Err(std::io::Error::from(std::io::ErrorKind::AddrInUse));
        }
        handlers.insert(vector, Arc::from(handler));
        Ok(())
    }

    fn free_irq(&self, vector: usize) {
        self.handlers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&vector);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::emu::EmulatedBackend;
    use std::sync::atomic::AtomicUsize;
    use std::time::{Duration, Instant};

    #[derive(Default)]
    struct RecordingSink {
        slots: Mutex<Vec<usize>>,
        platform: Mutex<Vec<usize>>,
        slot_count: AtomicUsize,
    }

    impl CompletionSink for RecordingSink {
        fn slot_event(&self, slot: usize) {
            self.slots.lock().unwrap().push(slot);
            self.slot_count.fetch_add(1, Ordering::SeqCst);
        }

        fn platform_event(&self, irq_no: usize) {
            self.platform.lock().unwrap().push(irq_no);
        }
    }

    fn slot_mapped_descriptor() -> BackendDescriptor {
        let backend = EmulatedBackend::new(0);
        backend.descriptor()
    }

    fn aggregated_descriptor() -> BackendDescriptor {
        let mut desc = slot_mapped_descriptor();
        desc.wiring = IrqWiring::Aggregated;
        desc.irq_lines = 2;
        desc
    }

    fn setup(
        descriptor: &BackendDescriptor,
    ) -> (
        Arc<RegisterWindow>,
        Arc<SoftIrqHost>,
        Arc<RecordingSink>,
        InterruptDispatcher,
    ) {
        let regs = Arc::new(RegisterWindow::in_memory(0x9000));
        let host = SoftIrqHost::new();
        let sink = Arc::new(RecordingSink::default());
        let dispatcher = InterruptDispatcher::init(
            0,
            descriptor,
            Arc::clone(&regs),
            Arc::clone(&host) as Arc<dyn IrqHost>,
            Arc::clone(&sink) as Arc<dyn CompletionSink>,
        )
        .unwrap();
        (regs, host, sink, dispatcher)
    }

    fn wait_for(cond: impl Fn() -> bool) {
        let deadline = Instant::now() + Duration::from_secs(2);
        while !cond() {
            assert!(Instant::now() < deadline, "timed out waiting for condition");
            std::thread::sleep(Duration::from_millis(1));
        }
    }

    #[test]
    fn slot_irq_defers_and_acknowledges() {
        let desc = slot_mapped_descriptor();
        let (regs, host, sink, dispatcher) = setup(&desc);

        // Slot vectors start after the platform vectors.
        assert!(host.raise(desc.platform_irqs + 3));
        wait_for(|| sink.slot_count.load(Ordering::SeqCst) == 1);
        assert_eq!(sink.slots.lock().unwrap().as_slice(), &[3]);

        // Acknowledge register carries slot + platform offset.
        assert_eq!(
            regs.read32(desc.layout.ack_offset).unwrap(),
            (3 + desc.platform_irqs) as u32
        );

        let stats = dispatcher.stats();
        assert_eq!(stats.total, 1);
        assert_eq!(stats.scheduled, 1);
        assert_eq!(stats.coalesced, 0);
    }

    #[test]
    fn interrupt_accounting_never_loses_events() {
        let desc = slot_mapped_descriptor();
        let (_regs, host, sink, dispatcher) = setup(&desc);

        let raises = 500usize;
        let vector = desc.platform_irqs;
        let threads: Vec<_> = (0..2)
            .map(|_| {
                let host = Arc::clone(&host);
                std::thread::spawn(move || {
                    for _ in 0..raises {
                        assert!(host.raise(vector));
                    }
                })
            })
            .collect();
        for t in threads {
            t.join().unwrap();
        }

        let stats = dispatcher.stats();
        assert_eq!(stats.total, 2 * raises as u64);
        assert_eq!(
            stats.total,
            stats.scheduled + stats.coalesced,
            "every interrupt is either scheduled or coalesced"
        );

        // Every scheduled work item eventually reaches the sink.
        wait_for(|| sink.slot_count.load(Ordering::SeqCst) as u64 == dispatcher.stats().scheduled);
    }

    #[test]
    fn aggregated_line_drains_status_bits_in_order() {
        let desc = aggregated_descriptor();
        let (regs, host, sink, dispatcher) = setup(&desc);

        let line = 1usize;
        regs.write32(desc.layout.status_offset(line), (1 << 0) | (1 << 3) | (1 << 7))
            .unwrap();
        assert!(host.raise(desc.platform_irqs + line));

        assert_eq!(sink.slots.lock().unwrap().as_slice(), &[32, 35, 39]);
        // Status word consumed by the service.
        assert_eq!(regs.read32(desc.layout.status_offset(line)).unwrap(), 0);
        let stats = dispatcher.stats();
        assert_eq!(stats.total, 1);
        assert_eq!(stats.spurious, 0);
    }

    #[test]
    fn empty_status_word_is_counted_as_spurious() {
        let desc = aggregated_descriptor();
        let (_regs, host, sink, dispatcher) = setup(&desc);

        assert!(host.raise(desc.platform_irqs));
        assert!(sink.slots.lock().unwrap().is_empty());
        let stats = dispatcher.stats();
        assert_eq!(stats.total, 1);
        assert_eq!(stats.spurious, 1);
    }

    #[test]
    fn init_is_all_or_nothing() {
        let desc = slot_mapped_descriptor();
        let regs = Arc::new(RegisterWindow::in_memory(0x9000));
        let host = SoftIrqHost::new();
        let sink = Arc::new(RecordingSink::default());

        // Fail the third slot vector.
        host.fail_vector(desc.platform_irqs + 2);
        let result = InterruptDispatcher::init(
            0,
            &desc,
            regs,
            Arc::clone(&host) as Arc<dyn IrqHost>,
            sink as Arc<dyn CompletionSink>,
        );
        assert!(matches!(
            result,
            Err(DmaError::InterruptRequestFailure { vector, .. }) if vector == desc.platform_irqs + 2
        ));
        assert!(
            host.bound_vectors().is_empty(),
            "partially bound vectors must be released"
        );
    }

    #[test]
    fn exit_frees_all_lines_and_is_idempotent() {
        let desc = slot_mapped_descriptor();
        let (_regs, host, _sink, dispatcher) = setup(&desc);
        assert_eq!(host.bound_vectors().len(), desc.irq_lines);
        dispatcher.exit();
        assert!(host.bound_vectors().is_empty());
        dispatcher.exit();
        assert!(host.bound_vectors().is_empty());
    }

    #[test]
    fn platform_pool_enforces_bounds_and_capacity() {
        let desc = slot_mapped_descriptor();
        let (regs, host, sink, dispatcher) = setup(&desc);

        assert!(matches!(
            dispatcher.request_platform_irq(desc.platform_irqs),
            Err(DmaError::InvalidInterrupt { .. })
        ));

        for irq_no in 0..desc.platform_irqs {
            dispatcher.request_platform_irq(irq_no).unwrap();
        }
        // The pool has PLATFORM_IRQ_POOL entries, all taken now.
        assert!(matches!(
            dispatcher.request_platform_irq(0),
            Err(DmaError::AlreadyMapped { irq_no: 0 })
        ));

        // A raised platform vector signals the sink and acknowledges.
        assert!(host.raise(1));
        assert_eq!(sink.platform.lock().unwrap().as_slice(), &[1]);
        assert_eq!(regs.read32(desc.layout.ack_offset).unwrap(), 1);

        // Release one and rebind it.
        dispatcher.release_platform_irq(1);
        assert!(!host.raise(1));
        dispatcher.request_platform_irq(1).unwrap();
        assert!(host.raise(1));

        // The second release of the same line is a logged no-op.
        dispatcher.release_platform_irq(2);
        dispatcher.release_platform_irq(2);
    }

    #[test]
    fn platform_pool_exhaustion_reports_no_mapping() {
        // Descriptor with more platform lines than pool entries.
        let mut desc = slot_mapped_descriptor();
        desc.platform_irqs = PLATFORM_IRQ_POOL + 2;
        let (_regs, _host, _sink, dispatcher) = setup(&desc);

        for irq_no in 0..PLATFORM_IRQ_POOL {
            dispatcher.request_platform_irq(irq_no).unwrap();
        }
        assert!(matches!(
            dispatcher.request_platform_irq(PLATFORM_IRQ_POOL),
            Err(DmaError::NoMappingAvailable)
        ));
    }
}
