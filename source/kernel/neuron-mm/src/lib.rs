// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! CONTEXT: Virtual-memory core for RISC-V radix-tree page tables
//! OWNERS: @kernel-mm-team
//! PUBLIC API: Vm, FrameAllocator, PageTable, Chunk, Directory, boot::bootstrap
//! DEPENDS_ON: hal::Platform (physical memory, satp, TLB)
//! INVARIANTS: Frames are owned by exactly one of {free list, chunk, table pool};
//!             attach is all-or-nothing; chunk frames are released before chunk tables

#![cfg_attr(not(test), no_std)]
#![forbid(clippy::unwrap_used)]

extern crate alloc;

pub mod addr;
pub mod boot;
pub mod chunk;
pub mod directory;
pub mod error;
pub mod flags;
pub mod frame;
pub mod geometry;
pub mod hal;
pub mod table;
pub mod vm;

pub use addr::{LogAddr, PhysAddr};
pub use chunk::Chunk;
pub use directory::Directory;
pub use error::VmError;
pub use flags::{Flags, PteFlags};
pub use frame::FrameAllocator;
pub use geometry::{Geometry, SV39, SV48};
pub use table::{PageTable, Pte};
pub use vm::Vm;
