// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! One level of the page-table radix tree.
//!
//! A `PageTable` is a view over a table frame in physical memory; it owns
//! nothing. Frames written by [`PageTable::map`] belong to whoever asked for
//! the mapping (a [`crate::Chunk`]), and [`PageTable::unmap`] never frees them.

use core::fmt;

use crate::addr::PhysAddr;
use crate::error::{Result, VmError};
use crate::flags::{PteFlags, PTE_FLAG_MASK};
use crate::frame::FrameAllocator;
use crate::geometry::{Geometry, PTE_BYTES, PTE_PPN_SHIFT};
use crate::hal::PhysMemory;

/// Raw page-table entry: `(ppn << 10) | flags`; zero means not present.
#[derive(Clone, Copy, PartialEq, Eq, Default)]
#[repr(transparent)]
pub struct Pte(u64);

impl Pte {
    pub const EMPTY: Pte = Pte(0);

    #[inline]
    pub const fn from_raw(raw: u64) -> Self {
        Self(raw)
    }

    #[inline]
    pub const fn raw(self) -> u64 {
        self.0
    }

    /// Entry mapping the frame at `pa`.
    #[inline]
    pub const fn leaf(geometry: &Geometry, pa: PhysAddr, flags: PteFlags) -> Self {
        Self(((geometry.ppn(pa) as u64) << PTE_PPN_SHIFT) | flags.bits())
    }

    /// Entry pointing at the child table at `pa`.
    #[inline]
    pub const fn table(geometry: &Geometry, pa: PhysAddr) -> Self {
        Self::leaf(geometry, pa, PteFlags::TABLE)
    }

    #[inline]
    pub const fn is_empty(self) -> bool {
        self.0 == 0
    }

    #[inline]
    pub const fn is_valid(self) -> bool {
        self.0 & PteFlags::VALID.bits() != 0
    }

    /// Valid entry carrying R/W/X permissions (as opposed to a table pointer).
    #[inline]
    pub const fn is_leaf(self) -> bool {
        self.is_valid() && self.flags().is_leaf()
    }

    #[inline]
    pub const fn flags(self) -> PteFlags {
        PteFlags::from_bits_truncate(self.0 & PTE_FLAG_MASK)
    }

    /// Physical address encoded in the PPN field.
    #[inline]
    pub const fn address(self, geometry: &Geometry) -> PhysAddr {
        geometry.frame((self.0 >> PTE_PPN_SHIFT) as usize)
    }
}

impl fmt::Debug for Pte {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Pte({:#x})", self.0)
    }
}

/// View over one table frame.
pub struct PageTable<'a, M: PhysMemory + ?Sized> {
    mem: &'a M,
    geometry: Geometry,
    base: PhysAddr,
}

impl<'a, M: PhysMemory + ?Sized> PageTable<'a, M> {
    pub fn at(mem: &'a M, geometry: Geometry, base: PhysAddr) -> Self {
        Self { mem, geometry, base }
    }

    #[inline]
    pub fn base(&self) -> PhysAddr {
        self.base
    }

    #[inline]
    pub fn geometry(&self) -> Geometry {
        self.geometry
    }

    /// Number of entries (the fan-out).
    #[inline]
    pub fn len(&self) -> usize {
        self.geometry.fanout()
    }

    pub fn entry(&self, index: usize) -> Pte {
        debug_assert!(index < self.len());
        Pte(self.mem.read(self.slot(index)))
    }

    pub fn set(&self, index: usize, pte: Pte) {
        debug_assert!(index < self.len());
        self.mem.write(self.slot(index), pte.raw());
    }

    /// Zeroes every entry.
    pub fn clear(&self) {
        self.mem.zero(self.base, self.len() * PTE_BYTES);
    }

    /// Backs `[from, to)` with freshly allocated, zero-filled frames.
    ///
    /// If the allocator runs dry, entries written so far stay in place for the
    /// owner to release.
    pub fn map(&self, frames: &mut FrameAllocator, from: usize, to: usize, flags: PteFlags) -> Result<()> {
        self.check_range(from, to)?;
        for index in from..to {
            let frame = frames.calloc(self.mem, 1)?;
            self.set(index, Pte::leaf(&self.geometry, frame, flags));
        }
        Ok(())
    }

    /// Maps `[from, to)` onto the caller-owned contiguous range starting at `phys`.
    pub fn remap(&self, phys: PhysAddr, flags: PteFlags, from: usize, to: usize) -> Result<()> {
        self.check_range(from, to)?;
        let page = self.geometry.page_size();
        if !phys.is_aligned(page) {
            log::error!(target: "pt", "PT: remap of unaligned {}", phys);
            return Err(VmError::AlignmentViolation(phys.raw()));
        }
        for (n, index) in (from..to).enumerate() {
            self.set(index, Pte::leaf(&self.geometry, phys.offset(n * page), flags));
        }
        Ok(())
    }

    /// Clears `[from, to)`. Frames are not released.
    pub fn unmap(&self, from: usize, to: usize) -> Result<()> {
        self.check_range(from, to)?;
        for index in from..to {
            self.set(index, Pte::EMPTY);
        }
        Ok(())
    }

    /// Points entry `index` at the child table `child`.
    pub fn link(&self, index: usize, child: PhysAddr) -> Result<()> {
        self.check_range(index, index + 1)?;
        self.set(index, Pte::table(&self.geometry, child));
        Ok(())
    }

    pub fn iter(&self) -> impl Iterator<Item = (usize, Pte)> + '_ {
        (0..self.len()).map(move |index| (index, self.entry(index)))
    }

    fn slot(&self, index: usize) -> PhysAddr {
        self.base.offset(index * PTE_BYTES)
    }

    fn check_range(&self, from: usize, to: usize) -> Result<()> {
        if from <= to && to <= self.len() {
            Ok(())
        } else {
            log::error!(target: "pt", "PT: range {}..{} outside {} entries", from, to, self.len());
            Err(VmError::OutOfRange)
        }
    }
}

#[cfg(all(test, feature = "backend-host"))]
mod tests {
    use super::*;
    use crate::geometry::SV39;
    use crate::hal::HostPlatform;

    const BASE: PhysAddr = PhysAddr::new(0x8000_0000);
    const PAGE: usize = 4096;
    const RW: PteFlags = PteFlags::VALID
        .union(PteFlags::READ)
        .union(PteFlags::WRITE)
        .union(PteFlags::ACCESSED)
        .union(PteFlags::DIRTY);

    fn setup(frames: usize) -> (HostPlatform, FrameAllocator) {
        let mem = HostPlatform::new(BASE, (frames + 1) * PAGE);
        let mut pool = FrameAllocator::new(PAGE, PAGE);
        pool.seed(&mem, BASE.offset(PAGE), BASE.offset((frames + 1) * PAGE)).expect("seed");
        (mem, pool)
    }

    #[test]
    fn entry_encoding_round_trips() {
        let pte = Pte::leaf(&SV39, PhysAddr::new(0x8020_3000), RW);
        assert_eq!(pte.raw(), (0x80203 << 10) | RW.bits());
        assert_eq!(pte.address(&SV39), PhysAddr::new(0x8020_3000));
        assert_eq!(pte.flags(), RW);
        assert!(pte.is_leaf());
        let table = Pte::table(&SV39, PhysAddr::new(0x8000_1000));
        assert!(table.is_valid() && !table.is_leaf());
    }

    #[test]
    fn map_consumes_one_frame_per_entry() {
        let (mem, mut pool) = setup(8);
        let table = PageTable::at(&mem, SV39, BASE);
        table.map(&mut pool, 2, 5, RW).expect("map");
        assert_eq!(pool.free_units(&mem), 5);
        assert!(table.entry(1).is_empty());
        for index in 2..5 {
            assert!(table.entry(index).is_leaf());
        }
        assert!(table.entry(5).is_empty());
    }

    #[test]
    fn map_out_of_frames_keeps_partial_entries() {
        let (mem, mut pool) = setup(2);
        let table = PageTable::at(&mem, SV39, BASE);
        assert_eq!(table.map(&mut pool, 0, 3, RW), Err(VmError::OutOfMemory));
        assert!(table.entry(0).is_leaf());
        assert!(table.entry(1).is_leaf());
        assert!(table.entry(2).is_empty());
    }

    #[test]
    fn remap_advances_one_frame_per_index() {
        let (mem, _) = setup(1);
        let table = PageTable::at(&mem, SV39, BASE);
        let phys = PhysAddr::new(0x1004_0000);
        table.remap(phys, RW, 10, 13).expect("remap");
        assert_eq!(table.entry(10).address(&SV39), phys);
        assert_eq!(table.entry(12).address(&SV39), phys.offset(2 * PAGE));
        assert_eq!(table.remap(phys.offset(8), RW, 0, 1), Err(VmError::AlignmentViolation(phys.raw() + 8)));
    }

    #[test]
    fn unmap_leaves_frames_with_their_owner() {
        let (mem, mut pool) = setup(4);
        let table = PageTable::at(&mem, SV39, BASE);
        table.map(&mut pool, 0, 4, RW).expect("map");
        table.unmap(0, 4).expect("unmap");
        assert!(table.iter().all(|(_, pte)| pte.is_empty()));
        assert_eq!(pool.free_units(&mem), 0);
    }

    #[test]
    fn ranges_are_bounded_by_fanout() {
        let (mem, _) = setup(1);
        let table = PageTable::at(&mem, SV39, BASE);
        assert_eq!(table.unmap(0, 513), Err(VmError::OutOfRange));
        assert_eq!(table.link(512, BASE), Err(VmError::OutOfRange));
        assert!(table.unmap(512, 512).is_ok());
    }

    #[test]
    fn clear_zeroes_every_entry() {
        let (mem, mut pool) = setup(4);
        let table = PageTable::at(&mem, SV39, BASE);
        table.map(&mut pool, 0, 2, RW).expect("map");
        table.link(511, BASE.offset(PAGE)).expect("link");
        table.clear();
        assert!(table.iter().all(|(_, pte)| pte.is_empty()));
    }
}
