// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! CONTEXT: Hardware seams used by the VM core
//! OWNERS: @kernel-mm-team
//! PUBLIC API: PhysMemory, Satp, Tlb, Platform, HostPlatform (backend-host), RiscvPlatform (riscv64)
//! INVARIANTS: Physical accesses are 8-byte aligned words; a TLB flush follows every satp write

use crate::addr::{LogAddr, PhysAddr};

/// Word access to physical memory.
pub trait PhysMemory {
    /// Reads the 64-bit word at `pa`.
    fn read(&self, pa: PhysAddr) -> u64;
    /// Writes the 64-bit word at `pa`.
    fn write(&self, pa: PhysAddr, value: u64);
    /// Zero-fills `bytes` starting at `pa`.
    fn zero(&self, pa: PhysAddr, bytes: usize) {
        let mut offset = 0;
        while offset < bytes {
            self.write(pa.offset(offset), 0);
            offset += core::mem::size_of::<u64>();
        }
    }
}

/// Page-table base register.
pub trait Satp {
    fn satp(&self) -> usize;
    fn set_satp(&self, value: usize);
}

/// TLB management operations.
pub trait Tlb {
    /// Flushes the entire translation cache.
    fn flush_all(&self);
    /// Flushes the translation of a single page.
    fn flush_page(&self, _va: LogAddr) {
        self.flush_all();
    }
}

/// Everything the VM core needs from the machine.
pub trait Platform: PhysMemory + Satp + Tlb + Sync {}

impl<T: PhysMemory + Satp + Tlb + Sync> Platform for T {}

#[cfg(feature = "backend-host")]
pub use host::HostPlatform;

#[cfg(feature = "backend-host")]
mod host {
    use alloc::vec;
    use alloc::vec::Vec;
    use core::sync::atomic::{AtomicUsize, Ordering};

    use spin::Mutex;

    use super::{LogAddr, PhysAddr, PhysMemory, Satp, Tlb};

    /// Simulated machine: a window of RAM plus a `satp` register.
    ///
    /// Accesses outside the window are bus faults and panic.
    pub struct HostPlatform {
        base: PhysAddr,
        words: Mutex<Vec<u64>>,
        satp: AtomicUsize,
        flushes: AtomicUsize,
    }

    impl HostPlatform {
        /// Backs `[base, base + bytes)` with zeroed memory.
        pub fn new(base: PhysAddr, bytes: usize) -> Self {
            let words = bytes / core::mem::size_of::<u64>();
            Self {
                base,
                words: Mutex::new(vec![0; words]),
                satp: AtomicUsize::new(0),
                flushes: AtomicUsize::new(0),
            }
        }

        pub fn base(&self) -> PhysAddr {
            self.base
        }

        pub fn top(&self) -> PhysAddr {
            self.base.offset(self.words.lock().len() * core::mem::size_of::<u64>())
        }

        /// Number of TLB flushes issued so far.
        pub fn flushes(&self) -> usize {
            self.flushes.load(Ordering::Relaxed)
        }

        fn slot(&self, pa: PhysAddr) -> usize {
            assert!(
                pa >= self.base && pa.raw() % core::mem::size_of::<u64>() == 0,
                "bus fault at {}",
                pa
            );
            pa.distance(self.base) / core::mem::size_of::<u64>()
        }
    }

    impl PhysMemory for HostPlatform {
        fn read(&self, pa: PhysAddr) -> u64 {
            let slot = self.slot(pa);
            match self.words.lock().get(slot) {
                Some(word) => *word,
                None => panic!("bus fault at {}", pa),
            }
        }

        fn write(&self, pa: PhysAddr, value: u64) {
            let slot = self.slot(pa);
            match self.words.lock().get_mut(slot) {
                Some(word) => *word = value,
                None => panic!("bus fault at {}", pa),
            }
        }

        fn zero(&self, pa: PhysAddr, bytes: usize) {
            let first = self.slot(pa);
            let count = bytes / core::mem::size_of::<u64>();
            let mut words = self.words.lock();
            match words.get_mut(first..first + count) {
                Some(range) => range.fill(0),
                None => panic!("bus fault at {}", pa),
            }
        }
    }

    impl Satp for HostPlatform {
        fn satp(&self) -> usize {
            self.satp.load(Ordering::Acquire)
        }

        fn set_satp(&self, value: usize) {
            self.satp.store(value, Ordering::Release);
        }
    }

    impl Tlb for HostPlatform {
        fn flush_all(&self) {
            self.flushes.fetch_add(1, Ordering::Relaxed);
        }

        fn flush_page(&self, _va: LogAddr) {
            self.flushes.fetch_add(1, Ordering::Relaxed);
        }
    }
}

#[cfg(all(target_arch = "riscv64", target_os = "none"))]
pub use bare::RiscvPlatform;

#[cfg(all(target_arch = "riscv64", target_os = "none"))]
mod bare {
    use core::ptr::{read_volatile, write_volatile};

    use super::{LogAddr, PhysAddr, PhysMemory, Satp, Tlb};

    /// Bare-metal platform. Physical memory must be reachable at its own
    /// address (translation off, or identity-mapped by the master directory).
    pub struct RiscvPlatform;

    impl PhysMemory for RiscvPlatform {
        fn read(&self, pa: PhysAddr) -> u64 {
            // SAFETY: callers only pass frames owned by the VM core.
            unsafe { read_volatile(pa.raw() as *const u64) }
        }

        fn write(&self, pa: PhysAddr, value: u64) {
            // SAFETY: callers only pass frames owned by the VM core.
            unsafe { write_volatile(pa.raw() as *mut u64, value) }
        }

        fn zero(&self, pa: PhysAddr, bytes: usize) {
            // SAFETY: callers only pass frames owned by the VM core.
            unsafe { core::ptr::write_bytes(pa.raw() as *mut u8, 0, bytes) }
        }
    }

    impl Satp for RiscvPlatform {
        fn satp(&self) -> usize {
            riscv::register::satp::read().bits()
        }

        fn set_satp(&self, value: usize) {
            unsafe {
                core::arch::asm!("csrw satp, {0}", in(reg) value, options(nostack));
            }
        }
    }

    impl Tlb for RiscvPlatform {
        fn flush_all(&self) {
            unsafe {
                core::arch::asm!("sfence.vma x0, x0", options(nostack));
            }
        }

        fn flush_page(&self, va: LogAddr) {
            unsafe {
                core::arch::asm!("sfence.vma {0}, x0", in(reg) va.raw(), options(nostack));
            }
        }
    }
}
