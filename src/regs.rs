// PCIe Accelerator DMA Engine
// Copyright 2025 Henk-Jan Lebbink
// SPDX-License-Identifier: MIT

//! Device register window.
//!
//! The engine and the interrupt dispatcher touch the device only through
//! a [`RegisterWindow`]: either a memory-mapped view of a device resource
//! (Linux, the kernel driver's `ioremap` equivalent) or a plain in-memory
//! register file used by emulated backends and tests.
//!
//! All accesses are 32-bit, offset in bytes, volatile on the mapped
//! variant, and bounds-checked.

use crate::error::{DmaError, DmaResult};
use std::sync::atomic::{AtomicU32, Ordering};

#[cfg(target_os = "linux")]
use std::fs::File;
#[cfg(target_os = "linux")]
use std::os::unix::io::AsRawFd;
#[cfg(target_os = "linux")]
use std::path::Path;

#[derive(Debug)]
enum Window {
    /// Memory-mapped device registers.
    #[cfg(target_os = "linux")]
    Mapped {
        base: *mut u32,
        len: usize,
        /// Keeps the device file open for the lifetime of the mapping.
        _file: File,
    },
    /// In-process register file (emulated devices, tests).
    Memory(Box<[AtomicU32]>),
}

/// A window into the device's register space.
#[derive(Debug)]
pub struct RegisterWindow {
    inner: Window,
}

// SAFETY: the mapped base pointer stays valid until Drop unmaps it, and
// all accesses through it are volatile 32-bit loads/stores the device
// side is specified to tolerate from any thread. The in-memory variant
// is atomic storage.
unsafe impl Send for RegisterWindow {}
unsafe impl Sync for RegisterWindow {}

impl RegisterWindow {
    /// Map `len` bytes of device registers at `offset` within the given
    /// device resource file (e.g. a PCIe BAR resource node).
    #[cfg(target_os = "linux")]
    pub fn map_file(path: &Path, offset: u64, len: usize) -> DmaResult<Self> {
        let file = File::options().read(true).write(true).open(path)?;

        let base = unsafe {
            libc::mmap(
                std::ptr::null_mut(),
                len,
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_SHARED,
                file.as_raw_fd(),
                offset as libc::off_t,
            )
        };
        if base == libc::MAP_FAILED {
            return Err(DmaError::RegisterMap(format!(
                "mmap of {len:#x} bytes at {offset:#x} failed for {}",
                path.display()
            )));
        }

        log::debug!(
            "mapped register window {:#x}..{:#x} of {}",
            offset,
            offset + len as u64,
            path.display()
        );
        Ok(Self {
            inner: Window::Mapped {
                base: base as *mut u32,
                len,
                _file: file,
            },
        })
    }

    /// An in-process register file of `len` zeroed bytes.
    pub fn in_memory(len: usize) -> Self {
        let words = len / 4;
        Self {
            inner: Window::Memory((0..words).map(|_| AtomicU32::new(0)).collect()),
        }
    }

    /// Window length in bytes.
    pub fn len(&self) -> usize {
        match &self.inner {
            #[cfg(target_os = "linux")]
            Window::Mapped { len, .. } => *len,
            Window::Memory(words) => words.len() * 4,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn word_index(&self, offset: usize) -> DmaResult<usize> {
        if offset % 4 != 0 || offset + 4 > self.len() {
            return Err(DmaError::RegisterRange {
                offset,
                len: self.len(),
            });
        }
        Ok(offset / 4)
    }

    /// Read the 32-bit register at byte `offset`.
    pub fn read32(&self, offset: usize) -> DmaResult<u32> {
        let idx = self.word_index(offset)?;
        Ok(match &self.inner {
            #[cfg(target_os = "linux")]
            Window::Mapped { base, .. } => {
                // SAFETY: idx is bounds-checked against the mapping.
                unsafe { base.add(idx).read_volatile() }
            }
            Window::Memory(words) => words[idx].load(Ordering::SeqCst),
        })
    }

    /// Write the 32-bit register at byte `offset`.
    pub fn write32(&self, offset: usize, value: u32) -> DmaResult<()> {
        let idx = self.word_index(offset)?;
        match &self.inner {
            #[cfg(target_os = "linux")]
            Window::Mapped { base, .. } => {
                // SAFETY: idx is bounds-checked against the mapping.
                unsafe { base.add(idx).write_volatile(value) }
            }
            Window::Memory(words) => words[idx].store(value, Ordering::SeqCst),
        }
        Ok(())
    }
}

#[cfg(target_os = "linux")]
impl Drop for RegisterWindow {
    fn drop(&mut self) {
        if let Window::Mapped { base, len, .. } = &self.inner {
            unsafe {
                libc::munmap(*base as *mut libc::c_void, *len);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn in_memory_roundtrip() {
        let regs = RegisterWindow::in_memory(0x100);
        assert_eq!(regs.len(), 0x100);
        regs.write32(0x20, 0xDEAD_BEEF).unwrap();
        assert_eq!(regs.read32(0x20).unwrap(), 0xDEAD_BEEF);
        assert_eq!(regs.read32(0x24).unwrap(), 0);
    }

    #[test]
    fn out_of_range_access_is_rejected() {
        let regs = RegisterWindow::in_memory(0x10);
        assert!(matches!(
            regs.read32(0x10),
            Err(DmaError::RegisterRange { .. })
        ));
        assert!(matches!(
            regs.write32(0x1000, 1),
            Err(DmaError::RegisterRange { .. })
        ));
    }

    #[test]
    fn misaligned_offset_is_rejected() {
        let regs = RegisterWindow::in_memory(0x10);
        assert!(matches!(
            regs.read32(0x2),
            Err(DmaError::RegisterRange { .. })
        ));
    }
}
