// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! CONTEXT: Chunk = contiguous logical region + the page-table subtree backing it
//! OWNERS: @kernel-mm-team
//! PUBLIC API: Chunk::{new, wrap, with_table, resize, frame, phy_address, roots, slots}
//! DEPENDS_ON: vm::Vm (frame + table pools), table::PageTable
//! INVARIANTS: Size is a whole number of frames; one subtree root per directory slot spanned;
//!             drop detaches the chunk everywhere, then releases data frames before the
//!             tables that describe them
//!
//! Layout for a chunk of `n` pages:
//!
//! ```text
//! directory slot k   -> root (level = levels - 2)
//!                         -> ... -> leaf table 0 (pages 0 .. fanout)
//!                         -> ... -> leaf table 1 (pages fanout .. 2*fanout)
//! directory slot k+1 -> root for the next fanout^(levels-1) pages
//! ```
//!
//! With Sv39 the root is the "attacher" table and leaves hang directly below
//! it. Only tables that cover mapped pages are built.

use alloc::vec::Vec;

use crate::addr::PhysAddr;
use crate::error::{Result, VmError};
use crate::flags::{Flags, PteFlags};
use crate::frame::FrameAllocator;
use crate::hal::Platform;
use crate::table::{PageTable, Pte};
use crate::vm::Vm;

/// Mapped memory region attachable to a [`crate::Directory`] as one unit.
pub struct Chunk<'vm, P: Platform> {
    vm: &'vm Vm<P>,
    flags: Flags,
    /// Base of the caller-owned backing range for wrapped chunks.
    phys: Option<PhysAddr>,
    /// First entry used in the first leaf table; nonzero only over a caller table.
    from: usize,
    pages: usize,
    roots: Vec<PhysAddr>,
    /// Leaf tables in page order: `leaves[i]` covers pages `i * fanout ..`.
    leaves: Vec<PhysAddr>,
    /// Every table this chunk owns, in allocation order. A caller-given leaf
    /// table is not listed.
    tables: Vec<PhysAddr>,
}

impl<'vm, P: Platform> Chunk<'vm, P> {
    /// Allocates `bytes` (rounded up to frames) of fresh, zero-filled memory.
    pub fn new(vm: &'vm Vm<P>, bytes: usize, flags: Flags) -> Result<Self> {
        Self::build(vm, None, bytes, flags)
    }

    /// Maps `bytes` of caller-owned memory starting at `phys` (MMIO, boot-reserved RAM).
    /// The frames are never released by the chunk.
    pub fn wrap(vm: &'vm Vm<P>, phys: PhysAddr, bytes: usize, flags: Flags) -> Result<Self> {
        if !phys.is_aligned(vm.geometry().page_size()) {
            log::error!(target: "mm", "CHUNK: wrap of unaligned {}", phys);
            return Err(VmError::AlignmentViolation(phys.raw()));
        }
        Self::build(vm, Some(phys), bytes, flags)
    }

    /// Backs entries `[from, to)` of the caller's leaf table `pt` with fresh frames.
    ///
    /// The table stays with the caller. With a two-level tree it is also the
    /// chunk's root and can be attached; deeper trees link it themselves.
    pub fn with_table(vm: &'vm Vm<P>, pt: PhysAddr, from: usize, to: usize, flags: Flags) -> Result<Self> {
        let geometry = vm.geometry();
        if !pt.is_aligned(geometry.page_size()) {
            log::error!(target: "mm", "CHUNK: table {} is not frame aligned", pt);
            return Err(VmError::AlignmentViolation(pt.raw()));
        }
        if from >= to {
            return Err(VmError::InvalidSize);
        }
        if to > geometry.fanout() {
            return Err(VmError::OutOfRange);
        }
        let table = vm.table(pt);
        if let Some(busy) = (from..to).find(|index| !table.entry(*index).is_empty()) {
            log::warn!(target: "mm", "CHUNK: entry {} of {} already in use", busy, pt);
            return Err(VmError::SlotConflict(busy));
        }
        let pte_flags = PteFlags::from(flags);
        if let Err(err) = vm.with_frames(|frames, _| table.map(frames, from, to, pte_flags)) {
            vm.with_frames(|frames, mem| release_entries(&table, frames, mem, from, to));
            return Err(err);
        }
        let roots = if geometry.levels() == 2 { alloc::vec![pt] } else { Vec::new() };
        log::debug!(target: "mm", "CHUNK: {} pages in caller table {}", to - from, pt);
        Ok(Self {
            vm,
            flags,
            phys: None,
            from,
            pages: to - from,
            roots,
            leaves: alloc::vec![pt],
            tables: Vec::new(),
        })
    }

    fn build(vm: &'vm Vm<P>, phys: Option<PhysAddr>, bytes: usize, flags: Flags) -> Result<Self> {
        let geometry = vm.geometry();
        let pages = geometry.pages(bytes);
        if pages == 0 || pages > geometry.max_pages() {
            log::warn!(target: "mm", "CHUNK: {} bytes cannot be mapped", bytes);
            return Err(VmError::InvalidSize);
        }
        let mut chunk = Self {
            vm,
            flags,
            phys,
            from: 0,
            pages: 0,
            roots: Vec::new(),
            leaves: Vec::new(),
            tables: Vec::new(),
        };
        // A failure below drops `chunk`, which releases whatever was built.
        let root_level = geometry.top_level() - 1;
        let mut first = 0;
        while first < pages {
            let count = core::cmp::min(geometry.slot_pages(), pages - first);
            let root = chunk.build_table(root_level, first, count)?;
            chunk.roots.push(root);
            first += count;
        }
        chunk.pages = pages;
        log::debug!(
            target: "mm",
            "CHUNK: {} pages, {} tables, {} slots{}",
            pages,
            chunk.tables.len(),
            chunk.roots.len(),
            if phys.is_some() { " (wrapped)" } else { "" }
        );
        Ok(chunk)
    }

    /// Builds the table at `level` covering `count` pages starting at chunk page `first`.
    fn build_table(&mut self, level: usize, first: usize, count: usize) -> Result<PhysAddr> {
        let vm = self.vm;
        let table = vm.alloc_table()?;
        self.tables.push(table);
        let geometry = vm.geometry();
        let pt = vm.table(table);
        if level == 0 {
            self.leaves.push(table);
            let flags = PteFlags::from(self.flags);
            match self.phys {
                Some(base) => pt.remap(base.offset(first * geometry.page_size()), flags, 0, count)?,
                None => vm.with_frames(|frames, _| pt.map(frames, 0, count, flags))?,
            }
            return Ok(table);
        }
        let per_child = geometry.entry_pages(level);
        let mut done = 0;
        let mut index = 0;
        while done < count {
            let n = core::cmp::min(per_child, count - done);
            let child = self.build_table(level - 1, first + done, n)?;
            pt.link(index, child)?;
            done += n;
            index += 1;
        }
        Ok(table)
    }

    /// Size in bytes (whole frames).
    #[inline]
    pub fn size(&self) -> usize {
        self.pages * self.vm.geometry().page_size()
    }

    #[inline]
    pub fn pages(&self) -> usize {
        self.pages
    }

    #[inline]
    pub fn flags(&self) -> Flags {
        self.flags
    }

    /// First leaf entry used. Zero unless built over a caller table.
    #[inline]
    pub fn from(&self) -> usize {
        self.from
    }

    /// One past the last leaf entry used, counted from the first leaf table.
    #[inline]
    pub fn to(&self) -> usize {
        self.from + self.pages
    }

    /// Number of leaf tables.
    #[inline]
    pub fn pts(&self) -> usize {
        self.leaves.len()
    }

    /// Number of tables owned, intermediate ones included.
    #[inline]
    pub fn tables(&self) -> usize {
        self.tables.len()
    }

    /// Subtree roots, one per directory slot.
    #[inline]
    pub fn roots(&self) -> &[PhysAddr] {
        &self.roots
    }

    /// Directory slots needed to attach this chunk.
    #[inline]
    pub fn slots(&self) -> usize {
        self.roots.len()
    }

    #[inline]
    pub fn is_wrapped(&self) -> bool {
        self.phys.is_some()
    }

    /// `true` while some directory slot points at one of the roots.
    pub fn is_attached(&self) -> bool {
        self.roots.iter().any(|root| self.vm.is_attached(*root))
    }

    /// Built over a caller-given leaf table.
    fn on_caller_table(&self) -> bool {
        self.tables.is_empty() && !self.leaves.is_empty()
    }

    /// Frame backing page `page`, if mapped.
    pub fn frame(&self, page: usize) -> Option<PhysAddr> {
        if page >= self.pages {
            return None;
        }
        let geometry = self.vm.geometry();
        let entry = self.from + page;
        let leaf = *self.leaves.get(entry / geometry.fanout())?;
        let pte = self.vm.table(leaf).entry(entry % geometry.fanout());
        if pte.is_empty() {
            None
        } else {
            Some(pte.address(&geometry))
        }
    }

    /// Physical base of the whole chunk.
    ///
    /// Always known for wrapped chunks. Fresh chunks only report it when the
    /// allocator happened to hand out ascending, physically adjacent frames.
    pub fn phy_address(&self) -> Option<PhysAddr> {
        if let Some(phys) = self.phys {
            return Some(phys);
        }
        let page = self.vm.geometry().page_size();
        let first = self.frame(0)?;
        let contiguous = (1..self.pages).all(|n| self.frame(n) == Some(first.offset(n * page)));
        if contiguous {
            Some(first)
        } else {
            None
        }
    }

    /// Grows a fresh chunk by `bytes` (rounded up to frames) and returns the new size.
    ///
    /// Growth stays inside the last leaf table and only takes empty entries.
    /// Wrapped chunks never grow: their backing range is fixed by the caller.
    pub fn resize(&mut self, bytes: usize) -> Result<usize> {
        if self.phys.is_some() {
            log::warn!(target: "mm", "CHUNK: resize of a wrapped chunk refused");
            return Err(VmError::Unsupported);
        }
        let geometry = self.vm.geometry();
        let extra = geometry.pages(bytes);
        if extra == 0 {
            return Ok(self.size());
        }
        let fanout = geometry.fanout();
        let next = self.from + self.pages;
        let from = next % fanout;
        let leaf = self.leaves.get(next / fanout).copied();
        let (Some(leaf), Some(to)) = (leaf, from.checked_add(extra).filter(|to| *to <= fanout)) else {
            log::warn!(target: "mm", "CHUNK: resize by {} pages needs new tables", extra);
            return Err(VmError::Unsupported);
        };
        let vm = self.vm;
        let pt = vm.table(leaf);
        if let Some(busy) = (from..to).find(|index| !pt.entry(*index).is_empty()) {
            log::warn!(target: "mm", "CHUNK: resize blocked by entry {} of {}", busy, leaf);
            return Err(VmError::Unsupported);
        }
        let flags = PteFlags::from(self.flags);
        if let Err(err) = vm.with_frames(|frames, _| pt.map(frames, from, to, flags)) {
            vm.with_frames(|frames, mem| release_entries(&pt, frames, mem, from, to));
            return Err(err);
        }
        self.pages += extra;
        if self.is_attached() {
            vm.flush_tlb();
        }
        Ok(self.size())
    }
}

impl<P: Platform> Drop for Chunk<'_, P> {
    fn drop(&mut self) {
        let vm = self.vm;
        let revoked: usize = self.roots.iter().map(|root| vm.revoke(*root)).sum();
        if revoked > 0 {
            log::warn!(target: "mm", "CHUNK: dropped while attached, {} slots cleared", revoked);
        }
        if self.phys.is_none() {
            let (from, to) = (self.from, self.from + self.pages);
            let partial = self.on_caller_table();
            let leaves = &self.leaves;
            vm.with_frames(|frames, mem| {
                for leaf in leaves {
                    let pt = vm.table(*leaf);
                    if partial {
                        release_entries(&pt, frames, mem, from, to);
                    } else {
                        release_entries(&pt, frames, mem, 0, pt.len());
                    }
                }
            });
        }
        for table in self.tables.drain(..).rev() {
            vm.free_table(table);
        }
        log::debug!(target: "mm", "CHUNK: released {} pages", self.pages);
    }
}

/// Frees the frames referenced by `[from, to)` of a leaf table and clears the entries.
fn release_entries<P: Platform>(
    pt: &PageTable<'_, P>,
    frames: &mut FrameAllocator,
    mem: &P,
    from: usize,
    to: usize,
) {
    let geometry = pt.geometry();
    for index in from..to {
        let pte = pt.entry(index);
        if pte.is_empty() {
            continue;
        }
        if let Err(err) = frames.free(mem, pte.address(&geometry), 1) {
            log::error!(target: "mm", "CHUNK: frame {} not returned: {}", pte.address(&geometry), err);
        }
        pt.set(index, Pte::EMPTY);
    }
}
