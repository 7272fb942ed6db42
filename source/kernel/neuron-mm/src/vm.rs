// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! CONTEXT: VM subsystem context created once at boot
//! OWNERS: @kernel-mm-team
//! PUBLIC API: Vm::{new, init, init_regions, alloc, calloc, free, allocable, set_master, current, physical}
//! DEPENDS_ON: frame::FrameAllocator, hal::Platform
//! INVARIANTS: Frame pool and table pool are each guarded for the length of one search/insert;
//!             the master pointer is read-locked while a new directory copies it;
//!             every directory slot referencing a chunk root is recorded until it is cleared
//!
//! Everything that used to be a process-wide singleton (free list, region list,
//! master directory) lives here and is reached through `&Vm`.

use alloc::collections::BTreeMap;
use alloc::vec::Vec;

use spin::{Mutex, RwLock};

use crate::addr::{LogAddr, PhysAddr};
use crate::directory::Directory;
use crate::error::{Result, VmError};
use crate::frame::FrameAllocator;
use crate::geometry::Geometry;
use crate::hal::Platform;
use crate::table::{PageTable, Pte};

/// Storage for page tables: whole coarse regions are broken into table frames
/// on demand. Until `init_regions` runs, tables come from the frame pool.
struct TablePool {
    regions: FrameAllocator,
    spare: FrameAllocator,
    /// Seeded `[base, top)` spans; tables outside them belong to the frame pool.
    spans: Vec<(PhysAddr, PhysAddr)>,
}

impl TablePool {
    fn enabled(&self) -> bool {
        !self.spans.is_empty()
    }

    fn owns(&self, table: PhysAddr) -> bool {
        self.spans.iter().any(|(base, top)| table >= *base && table < *top)
    }
}

/// Chunk root -> `(directory table, slot)` pairs currently pointing at it.
type Attachments = BTreeMap<PhysAddr, Vec<(PhysAddr, usize)>>;

/// The virtual-memory subsystem of one machine.
pub struct Vm<P: Platform> {
    platform: P,
    geometry: Geometry,
    frames: Mutex<FrameAllocator>,
    tables: Mutex<TablePool>,
    master: RwLock<Option<PhysAddr>>,
    attachments: Mutex<Attachments>,
}

impl<P: Platform> Vm<P> {
    /// Creates an empty subsystem. Nothing is allocable until [`Vm::init`].
    pub fn new(platform: P, geometry: Geometry) -> Result<Self> {
        geometry.validate()?;
        let page = geometry.page_size();
        Ok(Self {
            platform,
            geometry,
            frames: Mutex::new(FrameAllocator::new(page, page)),
            tables: Mutex::new(TablePool {
                regions: FrameAllocator::new(geometry.region_bytes(), page),
                spare: FrameAllocator::new(page, page),
                spans: Vec::new(),
            }),
            master: RwLock::new(None),
            attachments: Mutex::new(BTreeMap::new()),
        })
    }

    #[inline]
    pub fn platform(&self) -> &P {
        &self.platform
    }

    #[inline]
    pub fn geometry(&self) -> Geometry {
        self.geometry
    }

    /// Seeds the frame pool with `[free_base, free_top)`; returns the frames added.
    pub fn init(&self, free_base: PhysAddr, free_top: PhysAddr) -> Result<usize> {
        let added = self.frames.lock().seed(&self.platform, free_base, free_top)?;
        log::info!(target: "mm", "MM: {} frames free in {}..{}", added, free_base, free_top);
        Ok(added)
    }

    /// Seeds the coarse region pool used for page-table storage.
    pub fn init_regions(&self, base: PhysAddr, top: PhysAddr) -> Result<usize> {
        let mut pool = self.tables.lock();
        let added = pool.regions.seed(&self.platform, base, top)?;
        if added > 0 {
            pool.spans.push((base, top));
        }
        log::info!(target: "mm", "MM: {} table regions in {}..{}", added, base, top);
        Ok(added)
    }

    pub fn alloc(&self, frames: usize) -> Result<PhysAddr> {
        self.frames.lock().alloc(&self.platform, frames)
    }

    pub fn calloc(&self, frames: usize) -> Result<PhysAddr> {
        self.frames.lock().calloc(&self.platform, frames)
    }

    pub fn free(&self, base: PhysAddr, frames: usize) -> Result<()> {
        self.frames.lock().free(&self.platform, base, frames)
    }

    /// Frames in the head free region (advisory).
    pub fn allocable(&self) -> usize {
        self.frames.lock().allocable(&self.platform)
    }

    /// Total free frames.
    pub fn free_frames(&self) -> usize {
        self.frames.lock().free_units(&self.platform)
    }

    /// Free table frames plus table frames obtainable from unused regions.
    pub fn free_table_frames(&self) -> usize {
        let pool = self.tables.lock();
        if !pool.enabled() {
            return self.free_frames();
        }
        let per_region = self.geometry.region_bytes() / self.geometry.page_size();
        pool.spare.free_units(&self.platform) + pool.regions.free_units(&self.platform) * per_region
    }

    /// Runs `f` with the frame pool locked.
    pub(crate) fn with_frames<R>(&self, f: impl FnOnce(&mut FrameAllocator, &P) -> R) -> R {
        let mut frames = self.frames.lock();
        f(&mut frames, &self.platform)
    }

    /// Allocates one zeroed frame for a page table.
    pub(crate) fn alloc_table(&self) -> Result<PhysAddr> {
        let mut pool = self.tables.lock();
        if !pool.enabled() {
            drop(pool);
            return self.calloc(1);
        }
        if pool.spare.is_empty() {
            let region = pool.regions.alloc(&self.platform, 1)?;
            let frames = self.geometry.region_bytes() / self.geometry.page_size();
            pool.spare.free(&self.platform, region, frames)?;
            log::debug!(target: "mm", "MM: table region {} split into {} frames", region, frames);
        }
        pool.spare.calloc(&self.platform, 1)
    }

    /// Returns `table` to the pool it was taken from.
    pub(crate) fn free_table(&self, table: PhysAddr) {
        let mut pool = self.tables.lock();
        let res = if pool.owns(table) {
            pool.spare.free(&self.platform, table, 1)
        } else {
            drop(pool);
            self.free(table, 1)
        };
        if let Err(err) = res {
            log::error!(target: "mm", "MM: leaking table {}: {}", table, err);
        }
    }

    /// View over the table frame at `base`.
    pub fn table(&self, base: PhysAddr) -> PageTable<'_, P> {
        PageTable::at(&self.platform, self.geometry, base)
    }

    /// Registers `directory` as the template every new directory copies.
    pub fn set_master(&self, directory: &Directory<'_, P>) {
        *self.master.write() = Some(directory.pd());
        log::info!(target: "mm", "MM: master directory {}", directory.pd());
    }

    pub fn master(&self) -> Option<PhysAddr> {
        *self.master.read()
    }

    /// Runs `f` while holding the master read lock.
    pub(crate) fn with_master<R>(&self, f: impl FnOnce(Option<PhysAddr>) -> R) -> R {
        let master = self.master.read();
        f(*master)
    }

    /// Records that `slot` of `directory` now points at the chunk root `root`.
    pub(crate) fn note_attached(&self, root: PhysAddr, directory: PhysAddr, slot: usize) {
        self.attachments.lock().entry(root).or_default().push((directory, slot));
    }

    /// Records a copied entry, if `root` belongs to an attached chunk.
    pub(crate) fn note_inherited(&self, root: PhysAddr, directory: PhysAddr, slot: usize) {
        if let Some(refs) = self.attachments.lock().get_mut(&root) {
            refs.push((directory, slot));
        }
    }

    pub(crate) fn note_detached(&self, root: PhysAddr, directory: PhysAddr, slot: usize) {
        let mut attachments = self.attachments.lock();
        if let Some(refs) = attachments.get_mut(&root) {
            refs.retain(|at| *at != (directory, slot));
            if refs.is_empty() {
                attachments.remove(&root);
            }
        }
    }

    /// Drops every record held by a directory whose table is going away.
    pub(crate) fn forget_directory(&self, directory: PhysAddr) {
        self.attachments.lock().retain(|_, refs| {
            refs.retain(|(dir, _)| *dir != directory);
            !refs.is_empty()
        });
    }

    pub(crate) fn is_attached(&self, root: PhysAddr) -> bool {
        self.attachments.lock().contains_key(&root)
    }

    /// Clears every directory slot still pointing at `root`; returns the count.
    pub(crate) fn revoke(&self, root: PhysAddr) -> usize {
        let refs = self.attachments.lock().remove(&root).unwrap_or_default();
        let mut flush = false;
        for (directory, slot) in &refs {
            self.table(*directory).set(*slot, Pte::EMPTY);
            flush |= self.is_active(*directory);
        }
        if flush {
            self.flush_tlb();
        }
        refs.len()
    }

    /// Borrowed view of the directory loaded in `satp`, if translation is on.
    pub fn current(&self) -> Option<Directory<'_, P>> {
        let table = self.geometry.satp_table(self.platform.satp())?;
        Some(Directory::borrowed(self, table))
    }

    /// Translates `addr` through the active directory.
    pub fn physical(&self, addr: LogAddr) -> Result<PhysAddr> {
        match self.current() {
            Some(directory) => directory.physical(addr),
            None => Err(VmError::UnmappedAccess(addr.raw())),
        }
    }

    pub fn is_active(&self, table: PhysAddr) -> bool {
        self.geometry.satp_table(self.platform.satp()) == Some(table)
    }

    /// Loads `table` into `satp` and flushes the TLB.
    pub(crate) fn install(&self, table: PhysAddr) {
        let satp = self.geometry.satp(table);
        self.platform.set_satp(satp);
        self.platform.flush_all();
        log::debug!(target: "mm", "MM: satp <- {:#x}", satp);
    }

    pub fn flush_tlb(&self) {
        self.platform.flush_all();
    }

    pub fn flush_tlb_page(&self, addr: LogAddr) {
        self.platform.flush_page(addr);
    }
}
