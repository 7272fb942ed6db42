// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! Error taxonomy shared by the frame allocator, chunks and directories.

use thiserror::Error;

/// Errors reported by virtual-memory operations.
///
/// Every runtime failure is recoverable; callers decide whether to retry,
/// fall back or escalate.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Error)]
pub enum VmError {
    /// No free region or directory slot run is large enough.
    #[error("out of memory")]
    OutOfMemory,
    /// An address or size is not frame (or slot) aligned.
    #[error("address {0:#x} is not aligned")]
    AlignmentViolation(usize),
    /// Explicit-address attach hit an occupied slot.
    #[error("directory slot {0} is occupied")]
    SlotConflict(usize),
    /// Translation hit an empty entry at some level.
    #[error("logical address {0:#x} is not mapped")]
    UnmappedAccess(usize),
    /// Detach did not find the chunk at the given place.
    #[error("chunk is not attached there")]
    InvalidDetach,
    /// Index or address range falls outside the table or directory.
    #[error("range exceeds the table")]
    OutOfRange,
    /// Freed range overlaps memory that is already free.
    #[error("range at {0:#x} is already free")]
    DoubleFree(usize),
    /// Operation is reserved but not supported for this object.
    #[error("operation not supported")]
    Unsupported,
    /// Zero-sized request.
    #[error("invalid size")]
    InvalidSize,
    /// Geometry parameters cannot describe a page-table tree.
    #[error("invalid page-table geometry")]
    InvalidGeometry,
}

pub type Result<T> = core::result::Result<T, VmError>;
