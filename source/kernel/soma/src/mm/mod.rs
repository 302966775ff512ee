// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! CONTEXT: Per-task address-space bookkeeping used by page-payload transfer
//! OWNERS: @kernel-mm-team
//! PUBLIC API: AddressSpace (map/map_range/unmap/unmap_range/resolve), PageFlags, MapError, PAGE_SIZE
//! DEPENDS_ON: types::{VirtAddr, PhysAddr}
//! INVARIANTS: Page-aligned keys; W^X; ranges map all-or-nothing; no overlap
//! ADR: docs/adr/0001-runtime-roles-and-boundaries.md
//!
//! The portable core does not walk hardware page tables. It keeps the
//! authoritative virtual-to-physical map per task and leaves programming the
//! MMU to the architecture layer. Ranges are described by a power-of-two
//! order: order `n` covers `PAGE_SIZE << n` bytes.

extern crate alloc;

use alloc::collections::BTreeMap;

use bitflags::bitflags;

use crate::hal::Arch;
use crate::types::{PhysAddr, TaskId, VirtAddr};
use crate::Kernel;

/// Size of a single page in bytes.
pub const PAGE_SIZE: usize = 4096;
/// Largest order accepted for range operations (4 MiB with 4 KiB pages).
pub const MAX_PAGE_ORDER: u8 = 10;

bitflags! {
    #[derive(Clone, Copy, Debug, PartialEq, Eq)]
    /// Access permissions attached to a mapping.
    pub struct PageFlags: u32 {
        const READ = 1 << 0;
        const WRITE = 1 << 1;
        const EXECUTE = 1 << 2;
        const USER = 1 << 3;
    }
}

impl PageFlags {
    /// Permissions given to pages received through IPC.
    pub const USER_RW: Self = Self::READ.union(Self::WRITE).union(Self::USER);
}

/// Error returned when manipulating an address space.
#[derive(Clone, Copy, Debug, PartialEq, Eq, thiserror::Error)]
pub enum MapError {
    /// Virtual or physical address was not page aligned.
    #[error("address is not page aligned")]
    Unaligned,
    /// Order too large or the range wraps the address space.
    #[error("range is out of bounds")]
    OutOfRange,
    /// Mapping violates the W^X policy.
    #[error("writable and executable mapping rejected")]
    PermissionDenied,
    /// Mapping collides with an existing entry.
    #[error("range overlaps an existing mapping")]
    Overlap,
    /// Nothing is mapped at the requested address.
    #[error("address is not mapped")]
    NotMapped,
    /// Flags grant no access at all.
    #[error("mapping flags grant no access")]
    InvalidFlags,
    /// The task owning the address space does not exist.
    #[error("no such address space")]
    NoAddressSpace,
}

impl MapError {
    /// Stable negative code reported to user space.
    pub const fn as_code(self) -> isize {
        match self {
            Self::Unaligned => -21,
            Self::OutOfRange => -22,
            Self::PermissionDenied => -23,
            Self::Overlap => -24,
            Self::NotMapped => -25,
            Self::InvalidFlags => -26,
            Self::NoAddressSpace => -15,
        }
    }
}

/// One installed page.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Mapping {
    pub pa: PhysAddr,
    pub flags: PageFlags,
}

/// Returns the byte length covered by `order`, if it is in range.
pub const fn order_bytes(order: u8) -> Option<usize> {
    if order > MAX_PAGE_ORDER {
        None
    } else {
        Some(PAGE_SIZE << order)
    }
}

/// Virtual-to-physical map of one task.
#[derive(Debug, Default, Clone)]
pub struct AddressSpace {
    pages: BTreeMap<usize, Mapping>,
}

impl AddressSpace {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of installed 4 KiB pages.
    pub fn len(&self) -> usize {
        self.pages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pages.is_empty()
    }

    /// Installs a single page mapping.
    pub fn map(&mut self, va: VirtAddr, pa: PhysAddr, flags: PageFlags) -> Result<(), MapError> {
        self.map_range(va, pa, 0, flags)
    }

    /// Installs `1 << order` contiguous pages, or nothing at all on error.
    pub fn map_range(
        &mut self,
        va: VirtAddr,
        pa: PhysAddr,
        order: u8,
        flags: PageFlags,
    ) -> Result<(), MapError> {
        check_flags(flags)?;
        let len = range_len(va, order)?;
        if !pa.is_page_aligned() {
            return Err(MapError::Unaligned);
        }
        pa.checked_add(len).ok_or(MapError::OutOfRange)?;
        if !self.is_range_free(va, order) {
            return Err(MapError::Overlap);
        }
        for offset in (0..len).step_by(PAGE_SIZE) {
            self.pages.insert(va.raw() + offset, Mapping { pa: PhysAddr::new(pa.raw() + offset), flags });
        }
        Ok(())
    }

    /// Removes a single page mapping and returns it.
    pub fn unmap(&mut self, va: VirtAddr) -> Result<Mapping, MapError> {
        if !va.is_page_aligned() {
            return Err(MapError::Unaligned);
        }
        self.pages.remove(&va.raw()).ok_or(MapError::NotMapped)
    }

    /// Removes a physically contiguous range installed by [`AddressSpace::map_range`].
    ///
    /// The range must be fully mapped and contiguous; otherwise nothing is removed.
    pub fn unmap_range(&mut self, va: VirtAddr, order: u8) -> Result<Mapping, MapError> {
        let first = self.resolve_range(va, order)?;
        let len = range_len(va, order)?;
        for offset in (0..len).step_by(PAGE_SIZE) {
            self.pages.remove(&(va.raw() + offset));
        }
        Ok(first)
    }

    /// Translates `va` (any offset) to its physical address.
    pub fn resolve(&self, va: VirtAddr) -> Option<PhysAddr> {
        self.pages
            .get(&va.page_base().raw())
            .map(|m| PhysAddr::new(m.pa.raw() + va.page_offset()))
    }

    /// Returns the mapping of the page containing `va`.
    pub fn lookup(&self, va: VirtAddr) -> Option<Mapping> {
        self.pages.get(&va.page_base().raw()).copied()
    }

    /// Validates that a range is fully mapped to contiguous physical memory
    /// and returns the mapping of its first page.
    pub fn resolve_range(&self, va: VirtAddr, order: u8) -> Result<Mapping, MapError> {
        let len = range_len(va, order)?;
        let first = self.pages.get(&va.raw()).copied().ok_or(MapError::NotMapped)?;
        for offset in (PAGE_SIZE..len).step_by(PAGE_SIZE) {
            match self.pages.get(&(va.raw() + offset)) {
                Some(m) if m.pa.raw() == first.pa.raw() + offset => {}
                _ => return Err(MapError::NotMapped),
            }
        }
        Ok(first)
    }

    /// Returns true when no page of the range is mapped.
    pub fn is_range_free(&self, va: VirtAddr, order: u8) -> bool {
        let Ok(len) = range_len(va, order) else {
            return false;
        };
        self.pages.range(va.raw()..va.raw() + len).next().is_none()
    }
}

fn check_flags(flags: PageFlags) -> Result<(), MapError> {
    if !flags.intersects(PageFlags::READ | PageFlags::WRITE | PageFlags::EXECUTE) {
        return Err(MapError::InvalidFlags);
    }
    if flags.contains(PageFlags::WRITE | PageFlags::EXECUTE) {
        return Err(MapError::PermissionDenied);
    }
    Ok(())
}

fn range_len(va: VirtAddr, order: u8) -> Result<usize, MapError> {
    if !va.is_page_aligned() {
        return Err(MapError::Unaligned);
    }
    let len = order_bytes(order).ok_or(MapError::OutOfRange)?;
    va.checked_add(len).ok_or(MapError::OutOfRange)?;
    Ok(len)
}

impl<A: Arch> Kernel<A> {
    /// Installs one page in `task`'s address space.
    pub fn vm_map(&mut self, task: TaskId, va: VirtAddr, pa: PhysAddr, flags: PageFlags) -> Result<(), MapError> {
        self.tasks.get_mut(task).ok_or(MapError::NoAddressSpace)?.vm.map(va, pa, flags)
    }

    /// Removes one page from `task`'s address space, returning what was there.
    pub fn vm_unmap(&mut self, task: TaskId, va: VirtAddr) -> Result<Mapping, MapError> {
        self.tasks.get_mut(task).ok_or(MapError::NoAddressSpace)?.vm.unmap(va)
    }

    /// Translates `va` in `task`'s address space.
    pub fn vm_resolve(&self, task: TaskId, va: VirtAddr) -> Result<PhysAddr, MapError> {
        self.tasks.get(task).ok_or(MapError::NoAddressSpace)?.vm.resolve(va).ok_or(MapError::NotMapped)
    }
}
