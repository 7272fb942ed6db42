// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! CONTEXT: End-to-end VM scenarios on the host platform
//! OWNERS: @kernel-mm-team
//! TEST_COVERAGE: 7 tests
//!
//! TEST_SCENARIOS:
//!   - allocator_reports_and_refuses(): seed 16 frames, alloc 4, oversized alloc fails
//!   - fresh_chunk_resolves_to_first_frame(): attach a 3-frame chunk, translate its base
//!   - wrapped_chunk_resolves_exactly(): MMIO-style chunk translates to the given address
//!   - detached_range_is_unmapped(): translation fails once the chunk is detached
//!   - dropped_chunk_is_unmapped(): freeing an attached chunk never aliases a new one
//!   - task_lifecycle_after_boot(): boot, task directory, app chunk, teardown
//!   - second_address_space_is_isolated(): two directories map the same slot differently

use neuron_mm::boot::{bootstrap, BootLayout};
use neuron_mm::hal::HostPlatform;
use neuron_mm::{Chunk, Directory, Flags, LogAddr, PhysAddr, Vm, VmError, SV39};

const B: PhysAddr = PhysAddr::new(0x8000_0000);
const PAGE: usize = 4096;

fn vm(frames: usize) -> Vm<HostPlatform> {
    let vm = Vm::new(HostPlatform::new(B, frames * PAGE), SV39).unwrap();
    vm.init(B, B.offset(frames * PAGE)).unwrap();
    vm
}

#[test]
fn allocator_reports_and_refuses() {
    let vm = vm(16);
    let base = vm.alloc(4).unwrap();
    assert!(base >= B && base < B.offset(16 * PAGE));
    assert!(vm.allocable() >= 12);
    assert_eq!(vm.alloc(20), Err(VmError::OutOfMemory));
}

#[test]
fn fresh_chunk_resolves_to_first_frame() {
    let vm = vm(32);
    let mut dir = Directory::new(&vm).unwrap();
    let chunk = Chunk::new(&vm, 3 * PAGE, Flags::PRESENT | Flags::WRITE).unwrap();
    let base = dir.attach(&chunk).unwrap();
    assert!(base.is_aligned(PAGE));
    assert_eq!(dir.physical(base), Ok(chunk.frame(0).unwrap()));
}

#[test]
fn wrapped_chunk_resolves_exactly() {
    let vm = vm(16);
    let mut dir = Directory::new(&vm).unwrap();
    let mmio = PhysAddr::new(0x1004_0000);
    let chunk = Chunk::wrap(&vm, mmio, PAGE, Flags::PRESENT | Flags::WRITE).unwrap();
    let base = dir.attach(&chunk).unwrap();
    assert_eq!(dir.physical(base), Ok(mmio));
}

#[test]
fn detached_range_is_unmapped() {
    let vm = vm(32);
    let mut dir = Directory::new(&vm).unwrap();
    let chunk = Chunk::new(&vm, 3 * PAGE, Flags::SYS).unwrap();
    let base = dir.attach(&chunk).unwrap();
    dir.detach(&chunk).unwrap();
    let inside = base.offset(PAGE + 8);
    assert_eq!(dir.physical(inside), Err(VmError::UnmappedAccess(inside.raw())));
}

#[test]
fn dropped_chunk_is_unmapped() {
    let vm = vm(32);
    let mut dir = Directory::new(&vm).unwrap();
    let chunk = Chunk::new(&vm, PAGE, Flags::SYS).unwrap();
    let base = dir.attach(&chunk).unwrap();
    drop(chunk);
    let other = Chunk::new(&vm, 3 * PAGE, Flags::SYS).unwrap();
    assert_eq!(dir.physical(base), Err(VmError::UnmappedAccess(base.raw())));
    assert!((0..3).all(|page| dir.physical(base.offset(page * PAGE)) != Ok(other.frame(page).unwrap())));
}

#[test]
fn task_lifecycle_after_boot() {
    let ram = 2 * SV39.region_bytes();
    let layout = BootLayout {
        ram_base: B,
        ram_top: B.offset(ram),
        mmio_base: PhysAddr::new(0x1000_0000),
        mmio_top: PhysAddr::new(0x1000_1000),
        image_top: B.offset(64 * PAGE),
        reserved_top: 16 * PAGE,
        table_regions: 0,
    };
    let vm = bootstrap(HostPlatform::new(B, ram), SV39, layout).unwrap();
    let idle = vm.free_frames();

    {
        let mut task = Directory::new(&vm).unwrap();
        // Kernel identity map is inherited.
        let kernel = LogAddr::identity(B.offset(3 * PAGE));
        assert_eq!(task.physical(kernel), Ok(B.offset(3 * PAGE)));

        let app = Chunk::new(&vm, 10 * PAGE, Flags::APP).unwrap();
        let base = task.attach(&app).unwrap();
        task.activate();
        assert_eq!(vm.physical(base.offset(9 * PAGE)), Ok(app.frame(9).unwrap()));
        let (_, flags) = task.lookup(base).unwrap();
        assert!(flags.contains(Flags::USER));

        assert_eq!(vm.current().unwrap().pd(), task.pd());
        let master = Directory::borrowed(&vm, vm.master().unwrap());
        master.activate();
    }
    assert_eq!(vm.free_frames(), idle);
}

#[test]
fn second_address_space_is_isolated() {
    let vm = vm(64);
    let mut a = Directory::new(&vm).unwrap();
    let mut b = Directory::new(&vm).unwrap();
    let ca = Chunk::new(&vm, PAGE, Flags::APP).unwrap();
    let cb = Chunk::new(&vm, PAGE, Flags::APP).unwrap();
    let at = LogAddr::new(SV39.slot_bytes());
    a.attach_at(&ca, at).unwrap();
    b.attach_at(&cb, at).unwrap();
    assert_eq!(a.physical(at), Ok(ca.frame(0).unwrap()));
    assert_eq!(b.physical(at), Ok(cb.frame(0).unwrap()));
    assert_ne!(a.physical(at), b.physical(at));
    assert_eq!(a.detach(&cb), Err(VmError::InvalidDetach));
}
