// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! CONTEXT: Kernel-wide channel arena with generation-checked references
//! OWNERS: @kernel-ipc-team
//! PUBLIC API: Channel, ChannelArena
//! DEPENDS_ON: types::{ChannelRef, ChannelId, TaskId}
//! INVARIANTS: Freed slots bump their generation; stale refs never resolve; sender queues are FIFO
//! ADR: docs/adr/0001-runtime-roles-and-boundaries.md

extern crate alloc;

use alloc::collections::VecDeque;
use alloc::vec::Vec;

use super::IpcError;
use crate::types::{ChannelId, ChannelRef, TaskId};

/// An IPC endpoint.
#[derive(Debug, Clone)]
pub struct Channel {
    pub(crate) owner: TaskId,
    /// ID of this channel in the owner's table.
    pub(crate) cid: ChannelId,
    /// Where messages sent through this channel go.
    pub(crate) linked_to: ChannelRef,
    /// Where the owner actually waits when receiving on this channel.
    pub(crate) transfer_to: ChannelRef,
    pub(crate) receiver: Option<TaskId>,
    pub(crate) senders: VecDeque<TaskId>,
}

impl Channel {
    pub fn owner(&self) -> TaskId {
        self.owner
    }

    pub fn id(&self) -> ChannelId {
        self.cid
    }

    pub fn receiver(&self) -> Option<TaskId> {
        self.receiver
    }

    /// Tasks blocked sending to this channel, oldest first.
    pub fn senders(&self) -> impl Iterator<Item = TaskId> + '_ {
        self.senders.iter().copied()
    }
}

#[derive(Debug, Clone, Default)]
struct Slot {
    generation: u32,
    channel: Option<Channel>,
}

/// Backing store of every channel in the kernel.
#[derive(Debug)]
pub struct ChannelArena {
    slots: Vec<Slot>,
    free: Vec<usize>,
    capacity: usize,
}

impl ChannelArena {
    pub fn new(capacity: usize) -> Self {
        Self { slots: Vec::new(), free: Vec::new(), capacity }
    }

    /// Number of live channels.
    pub fn len(&self) -> usize {
        self.slots.len() - self.free.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Creates a channel with identity topology. The caller fills in `cid`
    /// once the owner's table slot is known.
    pub(crate) fn insert(&mut self, owner: TaskId) -> Result<ChannelRef, IpcError> {
        let index = match self.free.pop() {
            Some(index) => index,
            None if self.slots.len() < self.capacity => {
                self.slots.push(Slot::default());
                self.slots.len() - 1
            }
            None => return Err(IpcError::NoMemory),
        };
        let slot = &mut self.slots[index];
        let this = ChannelRef::new(index, slot.generation);
        slot.channel = Some(Channel {
            owner,
            cid: ChannelId::KERNEL,
            linked_to: this,
            transfer_to: this,
            receiver: None,
            senders: VecDeque::new(),
        });
        Ok(this)
    }

    /// Frees the slot and returns the channel; later lookups through `ch` fail.
    pub(crate) fn remove(&mut self, ch: ChannelRef) -> Option<Channel> {
        let slot = self.slots.get_mut(ch.as_index())?;
        if slot.generation != ch.generation {
            return None;
        }
        let channel = slot.channel.take()?;
        slot.generation = slot.generation.wrapping_add(1);
        self.free.push(ch.as_index());
        Some(channel)
    }

    pub fn get(&self, ch: ChannelRef) -> Option<&Channel> {
        let slot = self.slots.get(ch.as_index())?;
        if slot.generation != ch.generation {
            return None;
        }
        slot.channel.as_ref()
    }

    pub(crate) fn get_mut(&mut self, ch: ChannelRef) -> Option<&mut Channel> {
        let slot = self.slots.get_mut(ch.as_index())?;
        if slot.generation != ch.generation {
            return None;
        }
        slot.channel.as_mut()
    }

    /// Mutable access to a channel whose liveness is a kernel invariant.
    pub(crate) fn live_mut(&mut self, ch: ChannelRef) -> &mut Channel {
        match self.get_mut(ch) {
            Some(channel) => channel,
            None => panic!("kernel invariant: channel {:?} is not live", ch),
        }
    }

    /// Every live channel, in slot order.
    pub fn iter(&self) -> impl Iterator<Item = &Channel> {
        self.slots.iter().filter_map(|s| s.channel.as_ref())
    }

    pub fn is_live(&self, ch: ChannelRef) -> bool {
        self.get(ch).is_some()
    }

    pub fn owner_of(&self, ch: ChannelRef) -> Option<TaskId> {
        self.get(ch).map(|c| c.owner)
    }

    /// Resolves `src.linked_to.transfer_to`, the channel a send through `src` lands on.
    pub(crate) fn send_target(&self, src: ChannelRef) -> Result<ChannelRef, IpcError> {
        let linked = self.get(src).ok_or(IpcError::InvalidId)?.linked_to;
        let peer = self.get(linked).ok_or(IpcError::NoLongerLinked)?;
        Ok(if self.is_live(peer.transfer_to) { peer.transfer_to } else { linked })
    }

    /// Resolves `src.transfer_to`, falling back to `src` itself if the target is gone.
    pub(crate) fn recv_target(&self, src: ChannelRef) -> ChannelRef {
        match self.get(src) {
            Some(c) if self.is_live(c.transfer_to) => c.transfer_to,
            _ => src,
        }
    }

    /// The reply address a receiver sees for messages sent through `src`.
    pub(crate) fn reply_id(&self, src: ChannelRef) -> ChannelId {
        self.get(src)
            .and_then(|c| self.get(c.linked_to))
            .map_or(ChannelId::KERNEL, |linked| linked.cid)
    }

    /// Pops the oldest queued sender accepted by `accepts`.
    pub(crate) fn take_sender(
        &mut self,
        ch: ChannelRef,
        accepts: impl Fn(TaskId) -> bool,
    ) -> Option<TaskId> {
        let senders = &mut self.get_mut(ch)?.senders;
        let pos = senders.iter().position(|s| accepts(*s))?;
        senders.remove(pos)
    }

    pub(crate) fn remove_sender(&mut self, ch: ChannelRef, task: TaskId) {
        if let Some(channel) = self.get_mut(ch) {
            channel.senders.retain(|s| *s != task);
        }
    }

    pub(crate) fn clear_receiver(&mut self, ch: ChannelRef, task: TaskId) {
        if let Some(channel) = self.get_mut(ch) {
            if channel.receiver == Some(task) {
                channel.receiver = None;
            }
        }
    }
}
