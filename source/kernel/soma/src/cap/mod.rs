// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! CONTEXT: Per-task channel capability table and channel life-cycle operations
//! OWNERS: @kernel-cap-team
//! PUBLIC API: ChannelTable, CapError, Kernel::{open, close, link, redirect, transfer, connect}
//! DEPENDS_ON: ipc::channel::ChannelArena, task::TaskTable
//! INVARIANTS: A channel is named by exactly one slot of exactly one table; slots bounded per task;
//!             every lookup is scoped to the caller's own table
//! ADR: docs/adr/0001-runtime-roles-and-boundaries.md

extern crate alloc;

use alloc::vec::Vec;

use log::{debug, info};

use crate::hal::Arch;
use crate::ipc::IpcError;
use crate::types::{ChannelId, ChannelRef, TaskId};
use crate::Kernel;

/// Errors produced when manipulating a channel table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum CapError {
    /// ID does not name an occupied slot.
    #[error("invalid channel slot")]
    InvalidSlot,
    /// No free slots are available in the table.
    #[error("channel table is full")]
    NoSpace,
}

impl From<CapError> for IpcError {
    fn from(value: CapError) -> Self {
        match value {
            CapError::InvalidSlot => Self::InvalidId,
            CapError::NoSpace => Self::OutOfResources,
        }
    }
}

/// Per-task table mapping channel IDs to kernel channels.
#[derive(Debug, Default, Clone)]
pub struct ChannelTable {
    slots: Vec<Option<ChannelRef>>,
}

impl ChannelTable {
    /// Creates an empty table with room for `slots` channels.
    pub fn with_capacity(slots: usize) -> Self {
        let mut table = Vec::with_capacity(slots);
        table.resize(slots, None);
        Self { slots: table }
    }

    /// Installs `ch` in the lowest free slot and returns its ID.
    pub fn allocate(&mut self, ch: ChannelRef) -> Result<ChannelId, CapError> {
        let index = self.slots.iter().position(Option::is_none).ok_or(CapError::NoSpace)?;
        self.slots[index] = Some(ch);
        Ok(ChannelId::from_slot(index))
    }

    pub fn get(&self, id: ChannelId) -> Result<ChannelRef, CapError> {
        let slot = id.slot().ok_or(CapError::InvalidSlot)?;
        self.slots.get(slot).copied().flatten().ok_or(CapError::InvalidSlot)
    }

    /// Removes and returns the channel named by `id`.
    pub fn take(&mut self, id: ChannelId) -> Result<ChannelRef, CapError> {
        let slot = id.slot().ok_or(CapError::InvalidSlot)?;
        self.slots.get_mut(slot).and_then(Option::take).ok_or(CapError::InvalidSlot)
    }

    pub fn has_free_slot(&self) -> bool {
        self.slots.iter().any(Option::is_none)
    }

    /// Number of occupied slots.
    pub fn len(&self) -> usize {
        self.slots.iter().flatten().count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn ids(&self) -> impl Iterator<Item = ChannelId> + '_ {
        self.slots
            .iter()
            .enumerate()
            .filter(|(_, s)| s.is_some())
            .map(|(i, _)| ChannelId::from_slot(i))
    }

    /// Empties the table, returning every channel it named.
    pub fn drain(&mut self) -> Vec<ChannelRef> {
        self.slots.iter_mut().filter_map(Option::take).collect()
    }
}

impl<A: Arch> Kernel<A> {
    /// Resolves `id` in `caller`'s table.
    pub(crate) fn lookup_channel(&self, caller: TaskId, id: ChannelId) -> Result<ChannelRef, IpcError> {
        let task = self.tasks.get(caller).ok_or(IpcError::InvalidId)?;
        Ok(task.channels.get(id)?)
    }

    /// Creates a channel owned by `owner` and installs it in its table.
    pub(crate) fn open_for(&mut self, owner: TaskId) -> Result<(ChannelRef, ChannelId), IpcError> {
        let task = self.tasks.get(owner).ok_or(IpcError::InvalidId)?;
        if !task.channels.has_free_slot() {
            return Err(IpcError::OutOfResources);
        }
        let ch = self.channels.insert(owner)?;
        let cid = self.tasks.live_mut(owner).channels.allocate(ch)?;
        self.channels.live_mut(ch).cid = cid;
        Ok((ch, cid))
    }

    /// Opens a fresh channel owned by `caller`.
    pub fn open(&mut self, caller: TaskId) -> Result<ChannelId, IpcError> {
        let (_, cid) = self.open_for(caller)?;
        debug!(target: "chan", "{} opened {}", caller, cid);
        Ok(cid)
    }

    /// Closes `id`; its receiver and queued senders fail with `ChannelClosed`.
    pub fn close(&mut self, caller: TaskId, id: ChannelId) -> Result<(), IpcError> {
        let task = self.tasks.get_mut(caller).ok_or(IpcError::InvalidId)?;
        let ch = task.channels.take(id)?;
        self.destroy_channel(ch, IpcError::ChannelClosed);
        self.run_continuations();
        debug!(target: "chan", "{} closed {}", caller, id);
        Ok(())
    }

    /// Points `from`'s outgoing route at `to`: `from.linked_to = to`.
    ///
    /// Only `from` is mutated; a bidirectional connection needs two calls.
    pub fn link(&mut self, caller: TaskId, from: ChannelId, to: ChannelId) -> Result<(), IpcError> {
        let src = self.lookup_channel(caller, from)?;
        let dst = self.lookup_channel(caller, to)?;
        self.channels.live_mut(src).linked_to = dst;
        Ok(())
    }

    /// Makes the owner of `src` wait on `dst` instead: `src.transfer_to = dst`.
    pub fn redirect(&mut self, caller: TaskId, src: ChannelId, dst: ChannelId) -> Result<(), IpcError> {
        let src = self.lookup_channel(caller, src)?;
        let dst = self.lookup_channel(caller, dst)?;
        self.channels.live_mut(src).transfer_to = dst;
        Ok(())
    }

    /// Hands `src` to the task owning the channel `dst` is linked to.
    ///
    /// Returns the channel's ID in the new owner's table. The channel keeps its
    /// topology and any queued senders.
    pub fn transfer(&mut self, caller: TaskId, src: ChannelId, dst: ChannelId) -> Result<ChannelId, IpcError> {
        if src == dst {
            return Err(IpcError::InvalidArgument);
        }
        let moving = self.lookup_channel(caller, src)?;
        let via = self.lookup_channel(caller, dst)?;
        let peer = self.channels.live_mut(via).linked_to;
        let new_owner = self.channels.owner_of(peer).ok_or(IpcError::NoLongerLinked)?;
        if new_owner == caller {
            return Err(IpcError::InvalidArgument);
        }
        let new_id = self.tasks.live_mut(new_owner).channels.allocate(moving)?;
        self.tasks.live_mut(caller).channels.take(src)?;
        let channel = self.channels.live_mut(moving);
        channel.owner = new_owner;
        channel.cid = new_id;
        info!(target: "chan", "{} handed {} to {} as {}", caller, src, new_owner, new_id);
        Ok(new_id)
    }

    /// Bootstrap helper: opens one channel in each task and links them to
    /// each other. Returns `(id in a, id in b)`.
    pub fn connect(&mut self, a: TaskId, b: TaskId) -> Result<(ChannelId, ChannelId), IpcError> {
        let (ca, ida) = self.open_for(a)?;
        let (cb, idb) = match self.open_for(b) {
            Ok(opened) => opened,
            Err(err) => {
                self.tasks.live_mut(a).channels.take(ida)?;
                self.channels.remove(ca);
                return Err(err);
            }
        };
        self.channels.live_mut(ca).linked_to = cb;
        self.channels.live_mut(cb).linked_to = ca;
        info!(target: "chan", "connected {}{} <-> {}{}", a, ida, b, idb);
        Ok((ida, idb))
    }

    /// Frees `ch` and fails every task waiting on it with `reason`.
    pub(crate) fn destroy_channel(&mut self, ch: ChannelRef, reason: IpcError) {
        let Some(channel) = self.channels.remove(ch) else {
            return;
        };
        if let Some(receiver) = channel.receiver {
            self.tasks.live_mut(receiver).ipc.accept = None;
            self.complete_blocked(receiver, Err(reason));
        }
        for sender in channel.senders {
            self.tasks.live_mut(sender).ipc.pending = None;
            self.complete_blocked(sender, Err(reason));
        }
    }
}

#[cfg(test)]
mod tests_prop;
