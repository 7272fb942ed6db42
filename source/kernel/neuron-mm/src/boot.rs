// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! CONTEXT: Boot-time construction of the master directory
//! OWNERS: @kernel-mm-team
//! PUBLIC API: BootLayout, BootError, bootstrap()
//! DEPENDS_ON: vm::Vm, table::PageTable
//! INVARIANTS: Runs once, single hart, interrupts off, before any other Vm user;
//!             the table block never overlaps the boot image
//!
//! Physical layout after `bootstrap`:
//!
//! ```text
//! ram_base .. image_top                  boot image (untouched)
//! image_top .. regions_base              frame allocator
//! regions_base .. regions_top            coarse regions for page tables
//! regions_top .. block_base              frame allocator
//! block_base .. ram_top - reserved_top   boot page tables (directory first)
//! ram_top - reserved_top .. ram_top      reserved (firmware, hand-off data)
//! ```

use thiserror::Error;

use crate::addr::{LogAddr, PhysAddr};
use crate::directory::Directory;
use crate::error::VmError;
use crate::flags::{Flags, PteFlags};
use crate::geometry::Geometry;
use crate::hal::Platform;
use crate::table::Pte;
use crate::vm::Vm;

/// Physical memory map handed over by the loader.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct BootLayout {
    pub ram_base: PhysAddr,
    pub ram_top: PhysAddr,
    pub mmio_base: PhysAddr,
    pub mmio_top: PhysAddr,
    /// End of the loaded kernel image; nothing below is touched.
    pub image_top: PhysAddr,
    /// Bytes at the top of RAM kept away from the VM core.
    pub reserved_top: usize,
    /// Coarse regions set aside for page-table storage.
    pub table_regions: usize,
}

/// Boot failures. None of them can be recovered from.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Error)]
pub enum BootError {
    /// The reserved table block or table regions would overwrite the boot image.
    #[error("boot tables at {block_base} overlap the image ending at {image_top}")]
    Overlap { block_base: PhysAddr, image_top: PhysAddr },
    #[error(transparent)]
    Vm(#[from] VmError),
}

/// Hands out zeroed table frames from the reserved block.
struct Bump<'a, P: Platform> {
    platform: &'a P,
    next: PhysAddr,
    top: PhysAddr,
    page: usize,
}

impl<P: Platform> Bump<'_, P> {
    fn take(&mut self) -> Result<PhysAddr, BootError> {
        if self.next.offset(self.page) > self.top {
            log::error!(target: "boot", "BOOT: table block exhausted at {}", self.next);
            return Err(VmError::OutOfMemory.into());
        }
        let frame = self.next;
        self.platform.zero(frame, self.page);
        self.next = frame.offset(self.page);
        Ok(frame)
    }
}

/// Upper bound on the tables needed to identity-map `[base, top)`, directory excluded.
fn tables_for(geometry: &Geometry, base: PhysAddr, top: PhysAddr) -> usize {
    if top <= base {
        return 0;
    }
    (0..geometry.top_level())
        .map(|level| {
            let span = geometry.entry_bytes(level + 1);
            top.align_up(span).distance(base.align_down(span)) / span
        })
        .sum()
}

/// Builds the identity-mapped master directory, activates it and seeds the pools.
///
/// Must run before anything else touches `platform`; an error leaves the
/// machine without translation and the caller halts.
pub fn bootstrap<P: Platform>(
    platform: P,
    geometry: Geometry,
    layout: BootLayout,
) -> Result<Vm<P>, BootError> {
    let vm = Vm::new(platform, geometry)?;
    let page = geometry.page_size();
    if layout.ram_top <= layout.ram_base || layout.reserved_top >= layout.ram_top.distance(layout.ram_base) {
        log::error!(target: "boot", "BOOT: empty RAM window {}..{}", layout.ram_base, layout.ram_top);
        return Err(VmError::OutOfRange.into());
    }

    let count = 1
        + tables_for(&geometry, layout.ram_base, layout.ram_top)
        + tables_for(&geometry, layout.mmio_base, layout.mmio_top);
    let block_top = PhysAddr::new(layout.ram_top.raw() - layout.reserved_top).align_down(page);
    let block_base = PhysAddr::new(block_top.raw().saturating_sub(count * page));
    if block_base < layout.image_top {
        log::error!(target: "boot", "BOOT: {} table frames at {} hit the image", count, block_base);
        return Err(BootError::Overlap { block_base, image_top: layout.image_top });
    }

    let mut bump = Bump { platform: vm.platform(), next: block_base, top: block_top, page };
    let root = bump.take()?;
    identity_map(&vm, &mut bump, root, layout.ram_base, layout.ram_top, Flags::SYS)?;
    identity_map(&vm, &mut bump, root, layout.mmio_base, layout.mmio_top, Flags::IO)?;
    let used = bump.next.distance(block_base) / page;

    {
        let master = Directory::borrowed(&vm, root);
        master.activate();
        vm.set_master(&master);
    }

    let region = geometry.region_bytes();
    let regions_top = block_base.align_down(region);
    let regions_base = PhysAddr::new(regions_top.raw().saturating_sub(layout.table_regions * region));
    let free_top = if layout.table_regions == 0 {
        block_base
    } else {
        if regions_base < layout.image_top {
            log::error!(target: "boot", "BOOT: {} table regions at {} hit the image", layout.table_regions, regions_base);
            return Err(BootError::Overlap { block_base: regions_base, image_top: layout.image_top });
        }
        vm.init_regions(regions_base, regions_top)?;
        vm.init(regions_top, block_base)?;
        regions_base
    };
    vm.init(layout.image_top, free_top)?;

    log::info!(
        target: "boot",
        "BOOT: master {} with {}/{} tables, satp={:#x}",
        root,
        used,
        count,
        vm.platform().satp()
    );
    Ok(vm)
}

/// Identity-maps `[base, top)` into the tree rooted at `root`, one page at a time.
fn identity_map<P: Platform>(
    vm: &Vm<P>,
    bump: &mut Bump<'_, P>,
    root: PhysAddr,
    base: PhysAddr,
    top: PhysAddr,
    flags: Flags,
) -> Result<(), BootError> {
    let geometry = vm.geometry();
    let page = geometry.page_size();
    let leaf_flags = PteFlags::from(flags);
    let mut pa = base.align_down(page);
    while pa < top {
        let va = LogAddr::identity(pa);
        if !geometry.is_canonical(va) {
            log::error!(target: "boot", "BOOT: {} outside the logical address space", pa);
            return Err(VmError::OutOfRange.into());
        }
        let mut table = root;
        for level in (1..geometry.levels()).rev() {
            let pt = vm.table(table);
            let index = geometry.index(va, level);
            let pte = pt.entry(index);
            table = if pte.is_valid() {
                pte.address(&geometry)
            } else {
                let child = bump.take()?;
                pt.link(index, child)?;
                child
            };
        }
        vm.table(table).set(geometry.index(va, 0), Pte::leaf(&geometry, pa, leaf_flags));
        pa = pa.offset(page);
    }
    log::debug!(target: "boot", "BOOT: identity {}..{} as {:?}", base, top, flags);
    Ok(())
}

#[cfg(all(test, feature = "backend-host"))]
mod tests {
    use super::*;
    use crate::geometry::SV39;
    use crate::hal::HostPlatform;

    const RAM: PhysAddr = PhysAddr::new(0x8000_0000);
    const PAGE: usize = 4096;

    fn layout(ram_pages: usize, image_pages: usize) -> BootLayout {
        BootLayout {
            ram_base: RAM,
            ram_top: RAM.offset(ram_pages * PAGE),
            mmio_base: PhysAddr::new(0x1000_0000),
            mmio_top: PhysAddr::new(0x1000_2000),
            image_top: RAM.offset(image_pages * PAGE),
            reserved_top: PAGE,
            table_regions: 0,
        }
    }

    #[test]
    fn table_bound_counts_every_level_below_the_directory() {
        // 64 pages inside one 2 MiB region: one leaf table and one middle table.
        assert_eq!(tables_for(&SV39, RAM, RAM.offset(64 * PAGE)), 2);
        // Straddling a 2 MiB boundary needs a second leaf table.
        let base = RAM.offset(SV39.region_bytes() - PAGE);
        assert_eq!(tables_for(&SV39, base, base.offset(2 * PAGE)), 3);
        assert_eq!(tables_for(&SV39, RAM, RAM), 0);
    }

    #[test]
    fn bootstrap_activates_identity_master() {
        let lay = layout(64, 8);
        let vm = bootstrap(HostPlatform::new(RAM, 64 * PAGE), SV39, lay).expect("boot");
        let master = vm.master().expect("master");
        assert_eq!(vm.current().map(|dir| dir.pd()), Some(master));
        let inside = RAM.offset(20 * PAGE + 0x18);
        assert_eq!(vm.physical(LogAddr::identity(inside)), Ok(inside));
        assert_eq!(vm.physical(LogAddr::new(0x1000_1008)), Ok(PhysAddr::new(0x1000_1008)));
        assert!(vm.physical(LogAddr::new(0x2000_0000)).is_err());
    }

    #[test]
    fn bootstrap_seeds_frames_between_image_and_tables() {
        let lay = layout(64, 8);
        let vm = bootstrap(HostPlatform::new(RAM, 64 * PAGE), SV39, lay).expect("boot");
        // 1 directory + 2 RAM tables + 2 MMIO tables below the reserved page.
        assert_eq!(vm.free_frames(), 64 - 8 - 1 - 5);
        let frame = vm.alloc(1).expect("frame");
        assert!(frame >= lay.image_top && frame < RAM.offset(58 * PAGE));
    }

    #[test]
    fn bootstrap_refuses_to_overwrite_the_image() {
        let lay = layout(16, 12);
        let err = bootstrap(HostPlatform::new(RAM, 16 * PAGE), SV39, lay).err();
        assert!(matches!(err, Some(BootError::Overlap { .. })));
    }

    #[test]
    fn bootstrap_carves_table_regions() {
        let region = SV39.region_bytes();
        let ram = 3 * region;
        let lay = BootLayout {
            ram_top: RAM.offset(ram),
            table_regions: 1,
            ..layout(0, 8)
        };
        let vm = bootstrap(HostPlatform::new(RAM, ram), SV39, lay).expect("boot");
        assert_eq!(vm.free_table_frames(), region / PAGE);
        let dir = Directory::new(&vm).expect("directory");
        assert!(dir.pd() >= RAM.offset(region) && dir.pd() < RAM.offset(2 * region));
    }
}
