// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! CONTEXT: Asynchronous notification delivery, listen registrations and IRQ routing
//! OWNERS: @kernel-ipc-team
//! PUBLIC API: Notifications, Kernel::{notify, notify_task, listen, listen_irq, unlisten_irq, handle_irq}
//! DEPENDS_ON: ipc::engine (complete_receive), task (exceptions, listeners)
//! INVARIANTS: Never blocks the caller; bits coalesce; exception records drain before plain bits
//! ADR: docs/adr/0001-runtime-roles-and-boundaries.md

extern crate alloc;

use alloc::vec::Vec;

use bitflags::bitflags;
use log::{debug, info};

use super::{ipc_trace, IpcError, Message, MessageType};
use crate::hal::Arch;
use crate::task::{BlockReason, TaskError, TaskState};
use crate::types::{ChannelId, TaskId};
use crate::Kernel;

bitflags! {
    /// Pending asynchronous events of a task.
    #[derive(Clone, Copy, PartialEq, Eq, Debug, Default)]
    pub struct Notifications: u32 {
        const INTERRUPT = 1 << 0;
        const TIMER = 1 << 1;
        const ABORTED = 1 << 2;
        const ASYNC_REPLY = 1 << 3;
        /// A listened-to task entered a receive wait.
        const READY = 1 << 4;
        /// An exception record is queued (pagers only).
        const EXCEPTION = 1 << 5;
    }
}

impl Notifications {
    /// Bits only the kernel may raise.
    pub const KERNEL_ONLY: Self = Self::EXCEPTION;
}

impl<A: Arch> Kernel<A> {
    /// Raises `bits` on the owner of the receive-on channel behind `channel`.
    pub fn notify(
        &mut self,
        caller: TaskId,
        channel: ChannelId,
        bits: Notifications,
    ) -> Result<(), IpcError> {
        if bits.intersects(Notifications::KERNEL_ONLY) {
            return Err(IpcError::InvalidArgument);
        }
        let src = self.lookup_channel(caller, channel)?;
        let dst = self.channels.send_target(src)?;
        let target = self.channels.owner_of(dst).ok_or(IpcError::NoLongerLinked)?;
        self.notify_task(target, bits);
        Ok(())
    }

    /// Raises `bits` on `target` without blocking.
    ///
    /// A target waiting on any sender is completed immediately with a
    /// notification message; otherwise the bits accumulate. Unknown targets are
    /// ignored (interrupt and timer context may race with destruction).
    pub fn notify_task(&mut self, target: TaskId, bits: Notifications) {
        if bits.is_empty() {
            return;
        }
        let Some(task) = self.tasks.get_mut(target) else {
            debug!(target: "ipc", "notify {:?} to missing task {}", bits, target);
            return;
        };
        task.notifications |= bits;
        let state = task.state;
        self.stats.notifications += 1;
        ipc_trace!("notify {} bits={:?}", target, bits);
        if let TaskState::Blocked(BlockReason::Receiving { channel, filter }) = state {
            if filter.is_any() {
                if let Some(msg) = self.take_notification_message(target) {
                    self.complete_receive(target, channel, msg);
                }
            }
        }
    }

    /// Registers `caller` to be notified with [`Notifications::READY`] whenever
    /// the task behind `channel` starts waiting to receive.
    pub fn listen(&mut self, caller: TaskId, channel: ChannelId) -> Result<(), IpcError> {
        let src = self.lookup_channel(caller, channel)?;
        let dst = self.channels.send_target(src)?;
        let target = self.channels.owner_of(dst).ok_or(IpcError::NoLongerLinked)?;
        let listener = self.tasks.task_ref(caller).ok_or(IpcError::InvalidArgument)?;
        if target == caller {
            return Err(IpcError::InvalidArgument);
        }
        let target_task = self.tasks.live_mut(target);
        target_task.listeners.insert(listener);
        let receiving = matches!(target_task.state, TaskState::Blocked(BlockReason::Receiving { .. }));
        if receiving {
            self.notify_task(caller, Notifications::READY);
        }
        Ok(())
    }

    /// Tells every live listener of `task` that it now waits to receive.
    pub(crate) fn announce_receiving(&mut self, task: TaskId) {
        let listeners: Vec<_> = self.tasks.live_mut(task).listeners.iter().copied().collect();
        for listener in listeners {
            if self.tasks.resolve(listener).is_some() {
                self.notify_task(listener.id, Notifications::READY);
            } else {
                self.tasks.live_mut(task).listeners.remove(&listener);
            }
        }
    }

    /// Builds the kernel message that drains pending notifications of `task`.
    ///
    /// Queued exception records are delivered one per message before the
    /// remaining bits.
    pub(crate) fn take_notification_message(&mut self, task: TaskId) -> Option<Message> {
        let t = self.tasks.live_mut(task);
        if t.notifications.contains(Notifications::EXCEPTION) {
            if let Some(exception) = t.exceptions.pop_front() {
                if t.exceptions.is_empty() {
                    t.notifications.remove(Notifications::EXCEPTION);
                }
                return Some(exception.to_message());
            }
            t.notifications.remove(Notifications::EXCEPTION);
        }
        if t.notifications.is_empty() {
            return None;
        }
        let mut msg = Message::empty(MessageType::NOTIFICATION);
        msg.notifications = core::mem::take(&mut t.notifications);
        Some(msg)
    }

    /// Routes interrupt line `irq` to `task` as [`Notifications::INTERRUPT`].
    pub fn listen_irq(&mut self, task: TaskId, irq: u32) -> Result<(), TaskError> {
        let owner = self.tasks.task_ref(task).ok_or(TaskError::InvalidTask)?;
        if let Some(existing) = self.irqs.get(&irq) {
            if self.tasks.resolve(*existing).is_some() && existing.id != task {
                return Err(TaskError::IrqInUse);
            }
        }
        self.irqs.insert(irq, owner);
        self.arch.enable_irq(irq);
        info!(target: "irq", "irq {} routed to {}", irq, task);
        Ok(())
    }

    /// Drops the routing of `irq` if `task` owns it.
    pub fn unlisten_irq(&mut self, task: TaskId, irq: u32) -> Result<(), TaskError> {
        match self.irqs.get(&irq) {
            Some(owner) if owner.id == task => {
                self.irqs.remove(&irq);
                self.arch.disable_irq(irq);
                Ok(())
            }
            _ => Err(TaskError::NotAllowed),
        }
    }

    /// Interrupt entry: notifies the owner of `irq`, if any.
    pub fn handle_irq(&mut self, irq: u32) {
        let Some(owner) = self.irqs.get(&irq).copied() else {
            debug!(target: "irq", "spurious irq {}", irq);
            return;
        };
        if self.tasks.resolve(owner).is_some() {
            self.notify_task(owner.id, Notifications::INTERRUPT);
        } else {
            self.irqs.remove(&irq);
            self.arch.disable_irq(irq);
        }
    }
}
