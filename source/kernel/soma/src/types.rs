// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! CONTEXT: Identifier and address newtypes shared by every kernel subsystem
//! OWNERS: @kernel-team
//! PUBLIC API: TaskId, ChannelId, TaskRef, ChannelRef, VirtAddr, PhysAddr, Priority
//! DEPENDS_ON: mm::PAGE_SIZE
//! INVARIANTS: ID 0 is reserved (idle task / kernel sender); refs carry a generation
//!
//! ## Identity model
//!
//! User-visible identities (`TaskId`, `ChannelId`) are small integers that are
//! reused once the object is gone. Kernel-internal back-references
//! (`TaskRef`, `ChannelRef`) pair the arena index with the slot generation at
//! the time the reference was taken, so a reference that outlives its target
//! fails to resolve instead of aliasing whatever reused the slot.

use core::fmt;

use crate::mm::PAGE_SIZE;

/// Number of scheduler priority buckets; bucket 0 is the most urgent.
pub const NUM_PRIORITIES: usize = 8;

/// Task identifier.
///
/// **Ownership**: Only `TaskTable` creates task IDs.
/// **Invariant**: ID 0 names the idle task and is never handed to user code as a peer.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[repr(transparent)]
pub struct TaskId(u32);

impl TaskId {
    /// The idle task, created together with the kernel.
    pub const IDLE: Self = Self(0);

    /// Creates a task ID from a raw value (syscall decoding, tests).
    #[inline]
    pub const fn from_raw(raw: u32) -> Self {
        Self(raw)
    }

    #[inline]
    pub const fn as_raw(self) -> u32 {
        self.0
    }

    /// Returns the ID as an index into the task arena.
    #[inline]
    pub const fn as_index(self) -> usize {
        self.0 as usize
    }
}

impl fmt::Display for TaskId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Capability ID naming a channel inside one task's channel table.
///
/// IDs start at 1; 0 is the "sent by the kernel" marker carried in the `from`
/// field of synthesized messages.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Default)]
#[repr(transparent)]
pub struct ChannelId(u32);

impl ChannelId {
    pub const KERNEL: Self = Self(0);

    #[inline]
    pub const fn from_raw(raw: u32) -> Self {
        Self(raw)
    }

    #[inline]
    pub const fn as_raw(self) -> u32 {
        self.0
    }

    /// Maps a table slot index to the ID exposed to user code.
    #[inline]
    pub(crate) const fn from_slot(slot: usize) -> Self {
        Self(slot as u32 + 1)
    }

    /// Inverse of [`ChannelId::from_slot`]; `None` for the kernel marker.
    #[inline]
    pub(crate) const fn slot(self) -> Option<usize> {
        match self.0 {
            0 => None,
            raw => Some(raw as usize - 1),
        }
    }
}

impl fmt::Display for ChannelId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "@{}", self.0)
    }
}

/// Generation-checked reference to a task slot.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TaskRef {
    pub id: TaskId,
    pub generation: u32,
}

/// Generation-checked reference to a slot of the kernel channel arena.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ChannelRef {
    pub(crate) index: u32,
    pub(crate) generation: u32,
}

impl ChannelRef {
    #[inline]
    pub(crate) const fn new(index: usize, generation: u32) -> Self {
        Self { index: index as u32, generation }
    }

    #[inline]
    pub(crate) const fn as_index(self) -> usize {
        self.index as usize
    }
}

/// Scheduler priority bucket index (0 = highest).
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[repr(transparent)]
pub struct Priority(u8);

impl Priority {
    pub const HIGHEST: Self = Self(0);
    pub const LOWEST: Self = Self(NUM_PRIORITIES as u8 - 1);
    /// Bucket used by tasks that do not ask for anything else.
    pub const DEFAULT: Self = Self(NUM_PRIORITIES as u8 / 2);

    /// Validates a raw bucket index.
    #[inline]
    pub const fn new(raw: u8) -> Option<Self> {
        if (raw as usize) < NUM_PRIORITIES {
            Some(Self(raw))
        } else {
            None
        }
    }

    #[inline]
    pub const fn as_index(self) -> usize {
        self.0 as usize
    }
}

impl Default for Priority {
    fn default() -> Self {
        Self::DEFAULT
    }
}

/// User virtual address.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Default)]
#[repr(transparent)]
pub struct VirtAddr(usize);

impl VirtAddr {
    #[inline]
    pub const fn new(addr: usize) -> Self {
        Self(addr)
    }

    #[inline]
    pub const fn raw(self) -> usize {
        self.0
    }

    #[inline]
    pub const fn is_page_aligned(self) -> bool {
        self.0 % PAGE_SIZE == 0
    }

    /// Rounds down to the containing page.
    #[inline]
    pub const fn page_base(self) -> Self {
        Self(self.0 & !(PAGE_SIZE - 1))
    }

    #[inline]
    pub const fn page_offset(self) -> usize {
        self.0 & (PAGE_SIZE - 1)
    }

    #[inline]
    pub fn checked_add(self, bytes: usize) -> Option<Self> {
        self.0.checked_add(bytes).map(Self)
    }
}

impl fmt::Display for VirtAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#x}", self.0)
    }
}

/// Physical address.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Default)]
#[repr(transparent)]
pub struct PhysAddr(usize);

impl PhysAddr {
    #[inline]
    pub const fn new(addr: usize) -> Self {
        Self(addr)
    }

    #[inline]
    pub const fn raw(self) -> usize {
        self.0
    }

    #[inline]
    pub const fn is_page_aligned(self) -> bool {
        self.0 % PAGE_SIZE == 0
    }

    #[inline]
    pub fn checked_add(self, bytes: usize) -> Option<Self> {
        self.0.checked_add(bytes).map(Self)
    }
}

impl fmt::Display for PhysAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#x}", self.0)
    }
}
