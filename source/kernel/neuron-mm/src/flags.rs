// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! Architecture-neutral permissions and their Sv39 PTE encoding.

use bitflags::bitflags;

bitflags! {
    #[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
    /// Permissions requested by the segment layer.
    ///
    /// Present memory is always readable; `WRITE`, `USER` and `EXEC` widen it.
    pub struct Flags: u32 {
        const PRESENT = 1 << 0;
        const WRITE = 1 << 1;
        const USER = 1 << 2;
        const EXEC = 1 << 3;
        /// Mapping is shared by every address space (kernel text, MMIO).
        const GLOBAL = 1 << 4;

        /// Kernel RAM.
        const SYS = Self::PRESENT.bits() | Self::WRITE.bits() | Self::EXEC.bits() | Self::GLOBAL.bits();
        /// Device registers.
        const IO = Self::PRESENT.bits() | Self::WRITE.bits() | Self::GLOBAL.bits();
        /// Application code and data.
        const APP = Self::PRESENT.bits() | Self::WRITE.bits() | Self::EXEC.bits() | Self::USER.bits();
    }
}

bitflags! {
    #[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
    /// Flags stored in the low bits of an Sv39 PTE.
    pub struct PteFlags: u64 {
        const VALID = 1 << 0;
        const READ = 1 << 1;
        const WRITE = 1 << 2;
        const EXECUTE = 1 << 3;
        const USER = 1 << 4;
        const GLOBAL = 1 << 5;
        const ACCESSED = 1 << 6;
        const DIRTY = 1 << 7;
    }
}

/// Permission bits that turn an entry into a leaf.
pub const LEAF_PERMS: PteFlags = PteFlags::READ.union(PteFlags::WRITE).union(PteFlags::EXECUTE);
/// Low PTE bits holding flags (including the two RSW bits).
pub const PTE_FLAG_MASK: u64 = (1 << 10) - 1;

impl PteFlags {
    /// Flags of an entry pointing at a child table.
    pub const TABLE: PteFlags = PteFlags::VALID;

    #[inline]
    pub const fn is_leaf(self) -> bool {
        self.intersects(LEAF_PERMS)
    }
}

impl From<Flags> for PteFlags {
    /// A/D are set up front: there is no first-access assist to set them later.
    fn from(flags: Flags) -> Self {
        let mut pte = PteFlags::READ | PteFlags::ACCESSED | PteFlags::DIRTY;
        if flags.contains(Flags::PRESENT) {
            pte |= PteFlags::VALID;
        }
        if flags.contains(Flags::WRITE) {
            pte |= PteFlags::WRITE;
        }
        if flags.contains(Flags::USER) {
            pte |= PteFlags::USER;
        }
        if flags.contains(Flags::EXEC) {
            pte |= PteFlags::EXECUTE;
        }
        if flags.contains(Flags::GLOBAL) {
            pte |= PteFlags::GLOBAL;
        }
        pte
    }
}

impl From<PteFlags> for Flags {
    fn from(pte: PteFlags) -> Self {
        let mut flags = Flags::empty();
        flags.set(Flags::PRESENT, pte.contains(PteFlags::VALID));
        flags.set(Flags::WRITE, pte.contains(PteFlags::WRITE));
        flags.set(Flags::USER, pte.contains(PteFlags::USER));
        flags.set(Flags::EXEC, pte.contains(PteFlags::EXECUTE));
        flags.set(Flags::GLOBAL, pte.contains(PteFlags::GLOBAL));
        flags
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn read_write_translates_with_access_bits() {
        let pte = PteFlags::from(Flags::PRESENT | Flags::WRITE);
        assert_eq!(
            pte,
            PteFlags::VALID | PteFlags::READ | PteFlags::WRITE | PteFlags::ACCESSED | PteFlags::DIRTY
        );
        assert!(pte.is_leaf());
    }

    #[test]
    fn present_only_is_read_only_leaf() {
        let pte = PteFlags::from(Flags::PRESENT);
        assert!(pte.contains(PteFlags::READ));
        assert!(!pte.contains(PteFlags::WRITE));
        assert!(pte.is_leaf());
    }

    #[test]
    fn absent_mapping_is_not_valid() {
        assert!(!PteFlags::from(Flags::WRITE).contains(PteFlags::VALID));
    }

    #[test]
    fn table_entries_are_not_leaves() {
        assert!(!PteFlags::TABLE.is_leaf());
    }

    #[test]
    fn reverse_translation_keeps_permissions() {
        for flags in [Flags::SYS, Flags::IO, Flags::APP, Flags::PRESENT] {
            assert_eq!(Flags::from(PteFlags::from(flags)), flags);
        }
    }
}
