// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! CONTEXT: Address space = top-level table + the chunks attached to it
//! OWNERS: @kernel-mm-team
//! PUBLIC API: Directory::{new, borrowed, activate, attach, attach_at, detach, detach_at,
//!             detach_range, physical, lookup}
//! DEPENDS_ON: vm::Vm (table pool, master template, satp), chunk::Chunk
//! INVARIANTS: attach writes either every slot of the run or none; detach never frees frames;
//!             borrowed directories never free their table; every slot pointing at a chunk
//!             root is recorded in the Vm so a dropped chunk can be unmapped
//!
//! Attach searches directory slots, not bytes: a chunk needs `chunk.slots()`
//! consecutive empty slots and each receives one subtree root.

use alloc::vec::Vec;

use crate::addr::{LogAddr, PhysAddr};
use crate::chunk::Chunk;
use crate::error::{Result, VmError};
use crate::flags::Flags;
use crate::hal::Platform;
use crate::table::{PageTable, Pte};
use crate::vm::Vm;

/// One address space.
pub struct Directory<'vm, P: Platform> {
    vm: &'vm Vm<P>,
    table: PhysAddr,
    owned: bool,
}

impl<'vm, P: Platform> Directory<'vm, P> {
    /// Creates an owned directory inheriting every entry of the master template.
    ///
    /// Chunks attached to the master are shared with the new directory, not
    /// copied. Detaching one from the master leaves the inherited slots in
    /// place; tearing the chunk down unmaps it from every inheriting directory.
    pub fn new(vm: &'vm Vm<P>) -> Result<Self> {
        let table = vm.alloc_table()?;
        let directory = Self { vm, table, owned: true };
        let geometry = vm.geometry();
        vm.with_master(|master| {
            if let Some(master) = master {
                let src = vm.table(master);
                let dst = directory.top();
                for (index, pte) in src.iter().filter(|(_, pte)| pte.is_valid()) {
                    dst.set(index, pte);
                    if !pte.is_leaf() {
                        vm.note_inherited(pte.address(&geometry), table, index);
                    }
                }
            }
        });
        log::debug!(target: "mm", "DIR: new {}", table);
        Ok(directory)
    }

    /// Wraps an existing top-level table without taking ownership.
    pub fn borrowed(vm: &'vm Vm<P>, table: PhysAddr) -> Self {
        Self { vm, table, owned: false }
    }

    /// Physical address of the top-level table.
    #[inline]
    pub fn pd(&self) -> PhysAddr {
        self.table
    }

    #[inline]
    pub fn is_owned(&self) -> bool {
        self.owned
    }

    pub fn is_active(&self) -> bool {
        self.vm.is_active(self.table)
    }

    /// `satp` value that selects this directory.
    pub fn satp(&self) -> usize {
        self.vm.geometry().satp(self.table)
    }

    /// Installs this directory in `satp` and flushes the TLB.
    pub fn activate(&self) {
        self.vm.install(self.table);
    }

    /// Attaches `chunk` at the first run of free slots; returns its logical base.
    pub fn attach(&mut self, chunk: &Chunk<'_, P>) -> Result<LogAddr> {
        let need = chunk.slots();
        if need == 0 {
            return Err(VmError::Unsupported);
        }
        let fanout = self.vm.geometry().fanout();
        let top = self.top();
        let mut start = 0;
        while start + need <= fanout {
            match (start..start + need).find(|slot| !top.entry(*slot).is_empty()) {
                None => return Ok(self.install(chunk, start)),
                Some(busy) => start = busy + 1,
            }
        }
        log::warn!(target: "mm", "DIR: no run of {} free slots in {}", need, self.table);
        Err(VmError::OutOfMemory)
    }

    /// Attaches `chunk` at `at`, which must be slot aligned and entirely free.
    pub fn attach_at(&mut self, chunk: &Chunk<'_, P>, at: LogAddr) -> Result<LogAddr> {
        let start = self.slot_of(at)?;
        let need = chunk.slots();
        if need == 0 {
            return Err(VmError::Unsupported);
        }
        if start + need > self.vm.geometry().fanout() {
            return Err(VmError::OutOfRange);
        }
        let top = self.top();
        if let Some(busy) = (start..start + need).find(|slot| !top.entry(*slot).is_empty()) {
            log::warn!(target: "mm", "DIR: slot {} busy, attach at {} refused", busy, at);
            return Err(VmError::SlotConflict(busy));
        }
        Ok(self.install(chunk, start))
    }

    /// Removes `chunk` from wherever it is attached. Its frames stay allocated.
    pub fn detach(&mut self, chunk: &Chunk<'_, P>) -> Result<()> {
        let fanout = self.vm.geometry().fanout();
        match (0..fanout).find(|slot| self.holds(chunk, *slot)) {
            Some(start) => {
                self.clear(start, chunk.slots());
                Ok(())
            }
            None => {
                log::warn!(target: "mm", "DIR: detach of a chunk not attached to {}", self.table);
                Err(VmError::InvalidDetach)
            }
        }
    }

    /// Removes `chunk` from `at`; fails if it is not attached exactly there.
    pub fn detach_at(&mut self, chunk: &Chunk<'_, P>, at: LogAddr) -> Result<()> {
        let start = self.slot_of(at)?;
        if !self.holds(chunk, start) {
            log::warn!(target: "mm", "DIR: chunk not attached at {}", at);
            return Err(VmError::InvalidDetach);
        }
        self.clear(start, chunk.slots());
        Ok(())
    }

    /// Clears every slot covering `[at, at + bytes)`.
    pub fn detach_range(&mut self, at: LogAddr, bytes: usize) -> Result<()> {
        let start = self.slot_of(at)?;
        let geometry = self.vm.geometry();
        let count = bytes.div_ceil(geometry.slot_bytes());
        if start + count > geometry.fanout() {
            return Err(VmError::OutOfRange);
        }
        let top = self.top();
        if (start..start + count).all(|slot| top.entry(slot).is_empty()) {
            return Err(VmError::InvalidDetach);
        }
        self.clear(start, count);
        Ok(())
    }

    /// Translates `addr` to the physical address it is mapped to.
    pub fn physical(&self, addr: LogAddr) -> Result<PhysAddr> {
        self.lookup(addr).map(|(pa, _)| pa)
    }

    /// Walks the tree for `addr`, returning the physical address and permissions.
    ///
    /// A leaf found above level 0 maps a superpage.
    pub fn lookup(&self, addr: LogAddr) -> Result<(PhysAddr, Flags)> {
        let geometry = self.vm.geometry();
        if !geometry.is_canonical(addr) {
            return Err(VmError::UnmappedAccess(addr.raw()));
        }
        let mut table = self.table;
        for level in (0..geometry.levels()).rev() {
            let pte = self.vm.table(table).entry(geometry.index(addr, level));
            if !pte.is_valid() {
                break;
            }
            if pte.is_leaf() {
                let pa = pte.address(&geometry).offset(geometry.offset(addr, level));
                return Ok((pa, Flags::from(pte.flags())));
            }
            if level == 0 {
                log::error!(target: "mm", "DIR: table pointer in a leaf table for {}", addr);
                break;
            }
            table = pte.address(&geometry);
        }
        log::debug!(target: "mm", "DIR: {} unmapped in {}", addr, self.table);
        Err(VmError::UnmappedAccess(addr.raw()))
    }

    /// Indices of occupied directory slots.
    pub fn occupied(&self) -> impl Iterator<Item = usize> + '_ {
        let top = self.top();
        (0..top.len()).filter(move |slot| !top.entry(*slot).is_empty())
    }

    /// Snapshot of every directory entry.
    pub fn entries(&self) -> Vec<Pte> {
        self.top().iter().map(|(_, pte)| pte).collect()
    }

    fn top(&self) -> PageTable<'vm, P> {
        self.vm.table(self.table)
    }

    fn slot_of(&self, at: LogAddr) -> Result<usize> {
        let geometry = self.vm.geometry();
        if !at.is_aligned(geometry.slot_bytes()) {
            log::error!(target: "mm", "DIR: {} is not slot aligned", at);
            return Err(VmError::AlignmentViolation(at.raw()));
        }
        if !geometry.is_canonical(at) {
            return Err(VmError::OutOfRange);
        }
        Ok(geometry.index(at, geometry.top_level()))
    }

    /// `true` if the slots from `start` reference exactly the roots of `chunk`.
    fn holds(&self, chunk: &Chunk<'_, P>, start: usize) -> bool {
        let geometry = self.vm.geometry();
        let top = self.top();
        let roots = chunk.roots();
        !roots.is_empty()
            && start + roots.len() <= top.len()
            && roots.iter().enumerate().all(|(n, root)| {
                let pte = top.entry(start + n);
                pte.is_valid() && !pte.is_leaf() && pte.address(&geometry) == *root
            })
    }

    fn install(&mut self, chunk: &Chunk<'_, P>, start: usize) -> LogAddr {
        let geometry = self.vm.geometry();
        let top = self.top();
        for (n, root) in chunk.roots().iter().enumerate() {
            top.set(start + n, Pte::table(&geometry, *root));
            self.vm.note_attached(*root, self.table, start + n);
        }
        if self.is_active() {
            self.vm.flush_tlb();
        }
        let base = geometry.slot_address(start);
        log::debug!(target: "mm", "DIR: attached {} slots at {} in {}", chunk.slots(), base, self.table);
        base
    }

    fn clear(&mut self, start: usize, count: usize) {
        let geometry = self.vm.geometry();
        let top = self.top();
        for slot in start..start + count {
            let pte = top.entry(slot);
            if pte.is_valid() && !pte.is_leaf() {
                self.vm.note_detached(pte.address(&geometry), self.table, slot);
            }
            top.set(slot, Pte::EMPTY);
        }
        if self.is_active() {
            self.vm.flush_tlb();
        }
        log::debug!(target: "mm", "DIR: cleared slots {}..{} in {}", start, start + count, self.table);
    }
}

impl<P: Platform> Drop for Directory<'_, P> {
    fn drop(&mut self) {
        if !self.owned {
            return;
        }
        if self.is_active() {
            log::warn!(target: "mm", "DIR: releasing the active directory {}", self.table);
        }
        self.vm.forget_directory(self.table);
        self.vm.free_table(self.table);
    }
}
