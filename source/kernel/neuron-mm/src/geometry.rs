// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! CONTEXT: Page-table tree geometry (depth, fan-out, frame size)
//! OWNERS: @kernel-mm-team
//! PUBLIC API: Geometry, SV39, SV48
//! INVARIANTS: One table fits in one frame; 2 <= levels <= 5; canonical addresses are
//!             sign-extended from bit `va_bits - 1`
//!
//! Level numbering follows the hardware walk: level 0 holds leaf tables, level
//! `levels - 1` is the directory. A directory slot therefore covers
//! `fanout^(levels - 1)` frames.

use static_assertions::const_assert;

use crate::addr::{LogAddr, PhysAddr};
use crate::error::{Result, VmError};

/// Bytes per page-table entry.
pub const PTE_BYTES: usize = core::mem::size_of::<u64>();
/// Bit position of the PPN field inside a PTE.
pub const PTE_PPN_SHIFT: usize = 10;
/// Width of the PPN field in PTEs and `satp`.
pub const PPN_BITS: usize = 44;
const PPN_MASK: usize = (1 << PPN_BITS) - 1;
const SATP_MODE_SHIFT: usize = 60;

/// Sv39: three levels of 512 entries over 4 KiB frames.
pub const SV39: Geometry = Geometry::new(3, 9, 12, 8);
/// Sv48: four levels of 512 entries over 4 KiB frames.
pub const SV48: Geometry = Geometry::new(4, 9, 12, 9);

const_assert!(SV39.fanout() * PTE_BYTES == SV39.page_size());
const_assert!(SV39.va_bits() == 39);
const_assert!(SV48.va_bits() == 48);

/// Shape of the radix tree walked by the MMU.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Geometry {
    levels: usize,
    index_bits: usize,
    page_shift: usize,
    satp_mode: usize,
}

impl Geometry {
    pub const fn new(levels: usize, index_bits: usize, page_shift: usize, satp_mode: usize) -> Self {
        Self { levels, index_bits, page_shift, satp_mode }
    }

    /// Rejects shapes the table code cannot represent.
    pub fn validate(&self) -> Result<()> {
        let fits = self.index_bits >= 1
            && (2..=5).contains(&self.levels)
            // free-list headers need two words inside a frame
            && self.page_shift >= 4
            && self.va_bits() < usize::BITS as usize
            && self.fanout() * PTE_BYTES <= self.page_size();
        if fits {
            Ok(())
        } else {
            log::error!(target: "mm", "GEOMETRY: rejected {:?}", self);
            Err(VmError::InvalidGeometry)
        }
    }

    #[inline]
    pub const fn levels(&self) -> usize {
        self.levels
    }

    #[inline]
    pub const fn index_bits(&self) -> usize {
        self.index_bits
    }

    #[inline]
    pub const fn satp_mode(&self) -> usize {
        self.satp_mode
    }

    #[inline]
    pub const fn page_size(&self) -> usize {
        1 << self.page_shift
    }

    /// Entries per table.
    #[inline]
    pub const fn fanout(&self) -> usize {
        1 << self.index_bits
    }

    #[inline]
    pub const fn va_bits(&self) -> usize {
        self.page_shift + self.index_bits * self.levels
    }

    /// Level of the directory (top-level table).
    #[inline]
    pub const fn top_level(&self) -> usize {
        self.levels - 1
    }

    /// Frames covered by one entry of a table at `level`.
    #[inline]
    pub const fn entry_pages(&self, level: usize) -> usize {
        1 << (self.index_bits * level)
    }

    /// Bytes covered by one entry of a table at `level`.
    #[inline]
    pub const fn entry_bytes(&self, level: usize) -> usize {
        self.page_size() << (self.index_bits * level)
    }

    /// Frames covered by one directory slot.
    #[inline]
    pub const fn slot_pages(&self) -> usize {
        self.entry_pages(self.top_level())
    }

    #[inline]
    pub const fn slot_bytes(&self) -> usize {
        self.entry_bytes(self.top_level())
    }

    /// Bytes of one coarse region used for page-table storage.
    #[inline]
    pub const fn region_bytes(&self) -> usize {
        self.entry_bytes(1)
    }

    /// Frames needed to hold `bytes`, rounded up.
    #[inline]
    pub const fn pages(&self, bytes: usize) -> usize {
        bytes.div_ceil(self.page_size())
    }

    /// Frames addressable through one directory.
    #[inline]
    pub const fn max_pages(&self) -> usize {
        1 << (self.index_bits * self.levels)
    }

    /// Number of `level` tables needed to cover `pages` frames starting at a table boundary.
    #[inline]
    pub const fn tables(&self, pages: usize, level: usize) -> usize {
        let per_table = self.entry_pages(level + 1);
        pages.div_ceil(per_table)
    }

    /// Table index selected by `va` at `level`.
    #[inline]
    pub const fn index(&self, va: LogAddr, level: usize) -> usize {
        (va.raw() >> (self.page_shift + self.index_bits * level)) & (self.fanout() - 1)
    }

    /// Byte offset of `va` inside a region covered by one entry at `level`.
    #[inline]
    pub const fn offset(&self, va: LogAddr, level: usize) -> usize {
        va.raw() & (self.entry_bytes(level) - 1)
    }

    /// Sign-extends `raw` from bit `va_bits - 1`.
    #[inline]
    pub const fn canonical(&self, raw: usize) -> LogAddr {
        let unused = usize::BITS as usize - self.va_bits();
        LogAddr::new((((raw << unused) as isize) >> unused) as usize)
    }

    #[inline]
    pub const fn is_canonical(&self, va: LogAddr) -> bool {
        self.canonical(va.raw()).raw() == va.raw()
    }

    /// Logical base address of directory slot `slot`.
    #[inline]
    pub const fn slot_address(&self, slot: usize) -> LogAddr {
        self.canonical(slot * self.slot_bytes())
    }

    #[inline]
    pub const fn ppn(&self, pa: PhysAddr) -> usize {
        (pa.raw() >> self.page_shift) & PPN_MASK
    }

    #[inline]
    pub const fn frame(&self, ppn: usize) -> PhysAddr {
        PhysAddr::new((ppn & PPN_MASK) << self.page_shift)
    }

    /// `satp` value selecting `table` as the root of translation.
    #[inline]
    pub const fn satp(&self, table: PhysAddr) -> usize {
        (self.satp_mode << SATP_MODE_SHIFT) | self.ppn(table)
    }

    /// Root table named by `satp`, or `None` when translation is off.
    #[inline]
    pub const fn satp_table(&self, satp: usize) -> Option<PhysAddr> {
        if satp >> SATP_MODE_SHIFT == 0 {
            None
        } else {
            Some(self.frame(satp & PPN_MASK))
        }
    }
}
