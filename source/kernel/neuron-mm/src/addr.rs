// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! CONTEXT: Physical/logical address newtypes
//! OWNERS: @kernel-mm-team
//! PUBLIC API: PhysAddr, LogAddr
//! INVARIANTS: No implicit numeric coercion; conversion only through named constructors
//!
//! Both wrappers are plain `usize` underneath. Keeping them distinct stops a
//! logical address from being written into a page-table entry (or a physical
//! one being walked as if it were logical) without an explicit conversion.

use core::fmt;

/// Address on the physical bus (RAM, MMIO, page-table storage).
#[derive(Copy, Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[repr(transparent)]
pub struct PhysAddr(usize);

impl PhysAddr {
    #[inline]
    pub const fn new(raw: usize) -> Self {
        Self(raw)
    }

    #[inline]
    pub const fn raw(self) -> usize {
        self.0
    }

    /// Returns `true` when the address is a multiple of `align` (a power of two).
    #[inline]
    pub const fn is_aligned(self, align: usize) -> bool {
        self.0 & (align - 1) == 0
    }

    #[inline]
    pub const fn align_down(self, align: usize) -> Self {
        Self(self.0 & !(align - 1))
    }

    /// Rounds up to `align`, saturating at the highest aligned address.
    #[inline]
    pub const fn align_up(self, align: usize) -> Self {
        match self.0.checked_add(align - 1) {
            Some(v) => Self(v & !(align - 1)),
            None => Self(usize::MAX & !(align - 1)),
        }
    }

    #[inline]
    pub fn checked_add(self, bytes: usize) -> Option<Self> {
        self.0.checked_add(bytes).map(Self)
    }

    #[inline]
    pub const fn offset(self, bytes: usize) -> Self {
        Self(self.0 + bytes)
    }

    /// Distance in bytes from `earlier` to `self`.
    #[inline]
    pub const fn distance(self, earlier: PhysAddr) -> usize {
        self.0 - earlier.0
    }
}

impl fmt::Display for PhysAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "P{:#x}", self.0)
    }
}

/// Address as seen through an address space (a Directory).
#[derive(Copy, Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[repr(transparent)]
pub struct LogAddr(usize);

impl LogAddr {
    #[inline]
    pub const fn new(raw: usize) -> Self {
        Self(raw)
    }

    #[inline]
    pub const fn raw(self) -> usize {
        self.0
    }

    #[inline]
    pub const fn is_aligned(self, align: usize) -> bool {
        self.0 & (align - 1) == 0
    }

    #[inline]
    pub const fn offset(self, bytes: usize) -> Self {
        Self(self.0.wrapping_add(bytes))
    }

    /// Identity view used where physical memory is mapped one-to-one.
    #[inline]
    pub const fn identity(pa: PhysAddr) -> Self {
        Self(pa.raw())
    }
}

impl fmt::Display for LogAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "L{:#x}", self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn alignment_helpers() {
        let pa = PhysAddr::new(0x8000_1234);
        assert!(!pa.is_aligned(0x1000));
        assert_eq!(pa.align_down(0x1000), PhysAddr::new(0x8000_1000));
        assert_eq!(pa.align_up(0x1000), PhysAddr::new(0x8000_2000));
        assert_eq!(PhysAddr::new(usize::MAX).align_up(0x1000), PhysAddr::new(usize::MAX & !0xfff));
    }

    #[test]
    fn distance_and_offset() {
        let base = PhysAddr::new(0x1000);
        assert_eq!(base.offset(0x3000).distance(base), 0x3000);
        assert_eq!(base.checked_add(usize::MAX), None);
    }

    #[test]
    fn identity_keeps_value() {
        assert_eq!(LogAddr::identity(PhysAddr::new(0x1004_0000)).raw(), 0x1004_0000);
    }
}
