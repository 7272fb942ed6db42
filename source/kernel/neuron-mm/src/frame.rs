// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! CONTEXT: First-fit physical frame allocator with coalescing
//! OWNERS: @kernel-mm-team
//! PUBLIC API: FrameAllocator::{new, seed, alloc, calloc, free, allocable, free_units, regions}
//! DEPENDS_ON: hal::PhysMemory
//! INVARIANTS: Regions are linked in ascending address order, never overlap and are never
//!             physically adjacent (adjacent regions are merged on insertion)
//!
//! Each free region stores its own list node in its first two words:
//!
//! ```text
//! base + 0: physical address of the next region (u64::MAX ends the list)
//! base + 8: number of free units in this region
//! ```
//!
//! Allocation carves from the tail of a region so the node never moves while
//! the region shrinks.

use crate::addr::PhysAddr;
use crate::error::{Result, VmError};
use crate::hal::PhysMemory;

const NIL: u64 = u64::MAX;
const NEXT: usize = 0;
const COUNT: usize = core::mem::size_of::<u64>();

/// Alignment of freed/seeded ranges is verified unless the build is trusted.
const CHECK_ALIGNMENT: bool = cfg!(any(debug_assertions, feature = "checked"));

#[derive(Clone, Copy, Debug)]
struct Node {
    next: Option<PhysAddr>,
    count: usize,
}

/// Address-ordered free list of fixed-size units.
#[derive(Debug)]
pub struct FrameAllocator {
    head: Option<PhysAddr>,
    unit: usize,
    align: usize,
}

impl FrameAllocator {
    /// Creates an empty allocator handing out `unit`-byte units whose bases are
    /// `align`-aligned. `unit` must be a multiple of `align` and hold a list node.
    pub const fn new(unit: usize, align: usize) -> Self {
        Self { head: None, unit, align }
    }

    #[inline]
    pub const fn unit(&self) -> usize {
        self.unit
    }

    #[inline]
    pub const fn is_empty(&self) -> bool {
        self.head.is_none()
    }

    /// Frees the aligned part of `[base, top)` and returns the units added.
    pub fn seed<M: PhysMemory + ?Sized>(
        &mut self,
        mem: &M,
        base: PhysAddr,
        top: PhysAddr,
    ) -> Result<usize> {
        let base = base.align_up(self.align);
        if top <= base {
            return Ok(0);
        }
        let units = top.distance(base) / self.unit;
        if units == 0 {
            return Ok(0);
        }
        self.free(mem, base, units)?;
        log::info!(target: "frame", "FRAME: seeded {} units at {}", units, base);
        Ok(units)
    }

    /// First-fit allocation of `n` contiguous units.
    pub fn alloc<M: PhysMemory + ?Sized>(&mut self, mem: &M, n: usize) -> Result<PhysAddr> {
        if n == 0 {
            return Err(VmError::InvalidSize);
        }
        let mut prev = None;
        let mut cur = self.head;
        while let Some(at) = cur {
            let mut node = load(mem, at);
            if node.count >= n {
                let remaining = node.count - n;
                if remaining == 0 {
                    self.relink(mem, prev, node.next);
                } else {
                    node.count = remaining;
                    store(mem, at, node);
                }
                let base = at.offset(remaining * self.unit);
                log::debug!(target: "frame", "FRAME: alloc {} -> {}", n, base);
                return Ok(base);
            }
            prev = cur;
            cur = node.next;
        }
        log::warn!(target: "frame", "FRAME: alloc {} failed (head holds {})", n, self.allocable(mem));
        Err(VmError::OutOfMemory)
    }

    /// Allocates `n` units and zero-fills them.
    pub fn calloc<M: PhysMemory + ?Sized>(&mut self, mem: &M, n: usize) -> Result<PhysAddr> {
        let base = self.alloc(mem, n)?;
        mem.zero(base, n * self.unit);
        Ok(base)
    }

    /// Returns `n` units at `base` to the free set, merging with neighbours.
    pub fn free<M: PhysMemory + ?Sized>(&mut self, mem: &M, base: PhysAddr, n: usize) -> Result<()> {
        if CHECK_ALIGNMENT && !base.is_aligned(self.align) {
            log::error!(target: "frame", "FRAME: free of unaligned {}", base);
            return Err(VmError::AlignmentViolation(base.raw()));
        }
        if n == 0 {
            return Err(VmError::InvalidSize);
        }
        let end = n
            .checked_mul(self.unit)
            .and_then(|bytes| base.checked_add(bytes))
            .ok_or(VmError::OutOfRange)?;

        let mut prev = None;
        let mut next = self.head;
        while let Some(at) = next {
            if at >= base {
                break;
            }
            prev = next;
            next = load(mem, at).next;
        }

        if let Some(p) = prev {
            if self.end_of(p, load(mem, p)) > base {
                log::error!(target: "frame", "FRAME: double free at {}", base);
                return Err(VmError::DoubleFree(base.raw()));
            }
        }
        if let Some(s) = next {
            if s < end {
                log::error!(target: "frame", "FRAME: double free at {}", base);
                return Err(VmError::DoubleFree(base.raw()));
            }
        }

        match prev {
            Some(p) if self.end_of(p, load(mem, p)) == base => {
                let mut merged = load(mem, p);
                merged.count += n;
                if let Some(s) = next.filter(|s| *s == end) {
                    let succ = load(mem, s);
                    merged.count += succ.count;
                    merged.next = succ.next;
                }
                store(mem, p, merged);
            }
            _ => {
                let mut node = Node { next, count: n };
                if let Some(s) = next.filter(|s| *s == end) {
                    let succ = load(mem, s);
                    node.count += succ.count;
                    node.next = succ.next;
                }
                store(mem, base, node);
                self.relink(mem, prev, Some(base));
            }
        }
        log::debug!(target: "frame", "FRAME: free {} at {}", n, base);
        Ok(())
    }

    /// Capacity of the head region. Advisory: larger regions may exist further on.
    pub fn allocable<M: PhysMemory + ?Sized>(&self, mem: &M) -> usize {
        self.head.map_or(0, |at| load(mem, at).count)
    }

    /// Total free units across every region.
    pub fn free_units<M: PhysMemory + ?Sized>(&self, mem: &M) -> usize {
        self.regions(mem).map(|(_, count)| count).sum()
    }

    /// Free regions as `(base, units)` in ascending address order.
    pub fn regions<'a, M: PhysMemory + ?Sized>(&self, mem: &'a M) -> Regions<'a, M> {
        Regions { mem, cur: self.head }
    }

    fn end_of(&self, at: PhysAddr, node: Node) -> PhysAddr {
        at.offset(node.count * self.unit)
    }

    /// Points `prev` (or the head) at `next`.
    fn relink<M: PhysMemory + ?Sized>(&mut self, mem: &M, prev: Option<PhysAddr>, next: Option<PhysAddr>) {
        match prev {
            None => self.head = next,
            Some(p) => {
                let mut node = load(mem, p);
                node.next = next;
                store(mem, p, node);
            }
        }
    }
}

/// Iterator over the free list.
pub struct Regions<'a, M: PhysMemory + ?Sized> {
    mem: &'a M,
    cur: Option<PhysAddr>,
}

impl<M: PhysMemory + ?Sized> Iterator for Regions<'_, M> {
    type Item = (PhysAddr, usize);

    fn next(&mut self) -> Option<Self::Item> {
        let at = self.cur?;
        let node = load(self.mem, at);
        self.cur = node.next;
        Some((at, node.count))
    }
}

fn load<M: PhysMemory + ?Sized>(mem: &M, at: PhysAddr) -> Node {
    let next = mem.read(at.offset(NEXT));
    let count = mem.read(at.offset(COUNT));
    Node {
        next: if next == NIL { None } else { Some(PhysAddr::new(next as usize)) },
        count: count as usize,
    }
}

fn store<M: PhysMemory + ?Sized>(mem: &M, at: PhysAddr, node: Node) {
    mem.write(at.offset(NEXT), node.next.map_or(NIL, |n| n.raw() as u64));
    mem.write(at.offset(COUNT), node.count as u64);
}

#[cfg(all(test, feature = "backend-host"))]
mod tests {
    use super::*;
    use crate::hal::HostPlatform;
    use alloc::vec::Vec;

    const FRAME: usize = 4096;
    const BASE: PhysAddr = PhysAddr::new(0x8000_0000);

    fn setup(frames: usize) -> (HostPlatform, FrameAllocator) {
        let mem = HostPlatform::new(BASE, frames * FRAME);
        let mut frames_alloc = FrameAllocator::new(FRAME, FRAME);
        frames_alloc.seed(&mem, BASE, BASE.offset(frames * FRAME)).expect("seed");
        (mem, frames_alloc)
    }

    fn at(frame: usize) -> PhysAddr {
        BASE.offset(frame * FRAME)
    }

    #[test]
    fn sixteen_frame_pool() {
        let (mem, mut frames) = setup(16);
        let got = frames.alloc(&mem, 4).expect("alloc 4");
        assert!(got >= BASE && got < at(16));
        assert!(got.is_aligned(FRAME));
        assert!(frames.allocable(&mem) >= 12);
        assert_eq!(frames.alloc(&mem, 20), Err(VmError::OutOfMemory));
    }

    #[test]
    fn carves_from_the_tail() {
        let (mem, mut frames) = setup(16);
        assert_eq!(frames.alloc(&mem, 4), Ok(at(12)));
        assert_eq!(frames.alloc(&mem, 1), Ok(at(11)));
        assert_eq!(frames.regions(&mem).collect::<Vec<_>>(), [(at(0), 11)]);
    }

    #[test]
    fn exhausting_a_region_unlinks_it() {
        let (mem, mut frames) = setup(4);
        assert_eq!(frames.alloc(&mem, 4), Ok(at(0)));
        assert!(frames.is_empty());
        assert_eq!(frames.allocable(&mem), 0);
        assert_eq!(frames.alloc(&mem, 1), Err(VmError::OutOfMemory));
    }

    #[test]
    fn first_fit_skips_small_regions() {
        let mem = HostPlatform::new(BASE, 16 * FRAME);
        let mut frames = FrameAllocator::new(FRAME, FRAME);
        frames.free(&mem, at(0), 2).expect("free");
        frames.free(&mem, at(4), 8).expect("free");
        assert_eq!(frames.alloc(&mem, 3), Ok(at(9)));
        assert_eq!(frames.regions(&mem).collect::<Vec<_>>(), [(at(0), 2), (at(4), 5)]);
    }

    #[test]
    fn free_merges_with_predecessor_and_successor() {
        let mem = HostPlatform::new(BASE, 16 * FRAME);
        let mut frames = FrameAllocator::new(FRAME, FRAME);
        frames.free(&mem, at(0), 2).expect("free");
        frames.free(&mem, at(6), 2).expect("free");
        frames.free(&mem, at(2), 4).expect("free");
        assert_eq!(frames.regions(&mem).collect::<Vec<_>>(), [(at(0), 8)]);
    }

    #[test]
    fn free_merges_with_successor_only() {
        let mem = HostPlatform::new(BASE, 16 * FRAME);
        let mut frames = FrameAllocator::new(FRAME, FRAME);
        frames.free(&mem, at(8), 2).expect("free");
        frames.free(&mem, at(6), 2).expect("free");
        assert_eq!(frames.regions(&mem).collect::<Vec<_>>(), [(at(6), 4)]);
    }

    #[test]
    fn non_adjacent_regions_stay_sorted() {
        let mem = HostPlatform::new(BASE, 16 * FRAME);
        let mut frames = FrameAllocator::new(FRAME, FRAME);
        frames.free(&mem, at(10), 1).expect("free");
        frames.free(&mem, at(2), 1).expect("free");
        frames.free(&mem, at(6), 1).expect("free");
        assert_eq!(
            frames.regions(&mem).collect::<Vec<_>>(),
            [(at(2), 1), (at(6), 1), (at(10), 1)]
        );
        assert_eq!(frames.free_units(&mem), 3);
    }

    #[test]
    fn double_free_is_rejected() {
        let (mem, mut frames) = setup(8);
        let before: Vec<_> = frames.regions(&mem).collect();
        assert_eq!(frames.free(&mem, at(3), 1), Err(VmError::DoubleFree(at(3).raw())));
        let taken = frames.alloc(&mem, 2).expect("alloc");
        frames.free(&mem, taken, 2).expect("free");
        assert_eq!(frames.free(&mem, taken, 2), Err(VmError::DoubleFree(taken.raw())));
        assert_eq!(frames.regions(&mem).collect::<Vec<_>>(), before);
    }

    #[test]
    fn overlap_with_successor_is_rejected() {
        let mem = HostPlatform::new(BASE, 16 * FRAME);
        let mut frames = FrameAllocator::new(FRAME, FRAME);
        frames.free(&mem, at(4), 4).expect("free");
        assert_eq!(frames.free(&mem, at(2), 4), Err(VmError::DoubleFree(at(2).raw())));
        assert_eq!(frames.regions(&mem).collect::<Vec<_>>(), [(at(4), 4)]);
    }

    #[test]
    fn unaligned_free_is_rejected() {
        let (mem, mut frames) = setup(4);
        assert_eq!(
            frames.free(&mem, BASE.offset(12), 1),
            Err(VmError::AlignmentViolation(BASE.raw() + 12))
        );
    }

    #[test]
    fn calloc_zero_fills() {
        let (mem, mut frames) = setup(4);
        let dirty = frames.alloc(&mem, 4).expect("alloc");
        mem.write(dirty.offset(8), 0x55);
        frames.free(&mem, dirty, 4).expect("free");
        let clean = frames.calloc(&mem, 4).expect("calloc");
        assert_eq!(mem.read(clean), 0);
        assert_eq!(mem.read(clean.offset(8)), 0);
    }

    #[test]
    fn coarse_units_share_the_algorithm() {
        let region = 8 * FRAME;
        let mem = HostPlatform::new(BASE, 4 * region);
        let mut regions = FrameAllocator::new(region, FRAME);
        assert_eq!(regions.seed(&mem, BASE, BASE.offset(4 * region)), Ok(4));
        assert_eq!(regions.alloc(&mem, 1), Ok(BASE.offset(3 * region)));
        assert_eq!(regions.allocable(&mem), 3);
    }

    #[test]
    fn zero_sized_requests_fail() {
        let (mem, mut frames) = setup(4);
        assert_eq!(frames.alloc(&mem, 0), Err(VmError::InvalidSize));
        assert_eq!(frames.free(&mem, at(0), 0), Err(VmError::InvalidSize));
    }
}
