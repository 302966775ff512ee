// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! CONTEXT: Two-phase send/receive engine (slow path)
//! OWNERS: @kernel-ipc-team
//! PUBLIC API: Kernel::ipc
//! DEPENDS_ON: ipc::channel (routing, queues), mm::AddressSpace (page payloads), sched (resume/block)
//! INVARIANTS: Every payload check runs before the first mutation; one copy per delivery;
//!             a queued sender is completed exactly once
//! ADR: docs/adr/0001-runtime-roles-and-boundaries.md

use log::debug;

use super::{
    ipc_trace, IpcCompletion, IpcError, IpcFlags, IpcRequest, IpcStatus, Message, Notifications,
    PageWindow, PendingSend, RecvPlan,
};
use crate::hal::Arch;
use crate::mm::order_bytes;
use crate::task::{BlockReason, TaskFlags, TaskState};
use crate::types::{ChannelRef, TaskId, VirtAddr};
use crate::Kernel;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum SendOutcome {
    Delivered,
    Queued,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum RecvStatus {
    Received(Message),
    /// The task now occupies the receiver slot.
    Registered,
}

/// Page payload move decided during the check phase.
struct PageMove {
    src: VirtAddr,
    order: u8,
    /// `None` hands the raw physical address to a kernel-mode receiver.
    dst: Option<VirtAddr>,
}

/// Copies header and inline bytes only; the tail of the buffer stays zeroed.
pub(crate) fn copy_inline(src: &Message) -> Message {
    let mut out = Message::empty(src.ty());
    out.header = src.header;
    let inline = src.inline();
    out.data[..inline.len()].copy_from_slice(inline);
    out.notifications = src.notifications - Notifications::KERNEL_ONLY;
    out
}

impl<A: Arch> Kernel<A> {
    /// Performs one IPC operation on behalf of `caller`.
    ///
    /// `Completed` means the operation finished without blocking. `Pending`
    /// means `caller` is now blocked; the final result is stored by whichever
    /// task completes the exchange and can be collected with
    /// [`Kernel::take_completion`].
    pub fn ipc(&mut self, caller: TaskId, req: &IpcRequest) -> Result<IpcStatus, IpcError> {
        self.stats.calls += 1;
        let result = self.ipc_inner(caller, req);
        self.run_continuations();
        match result {
            Err(err) => {
                self.stats.errors += 1;
                debug!(target: "ipc", "{} ipc {:?} on {} failed: {}", caller, req.flags, req.channel, err);
            }
            Ok(IpcStatus::Pending) => {
                self.stats.blocked += 1;
                self.switch_if_current(caller);
            }
            Ok(IpcStatus::Completed(_)) => {}
        }
        result
    }

    fn ipc_inner(&mut self, caller: TaskId, req: &IpcRequest) -> Result<IpcStatus, IpcError> {
        let flags = req.flags;
        if flags.contains(IpcFlags::LISTEN) {
            if flags != IpcFlags::LISTEN {
                return Err(IpcError::InvalidArgument);
            }
            self.listen(caller, req.channel)?;
            return Ok(IpcStatus::Completed(None));
        }
        if !flags.intersects(IpcFlags::CALL) {
            return Err(IpcError::InvalidArgument);
        }
        let task = self.tasks.get(caller).ok_or(IpcError::InvalidId)?;
        assert!(
            task.is_runnable(),
            "kernel invariant: ipc from blocked task {}",
            caller
        );
        let src = self.lookup_channel(caller, req.channel)?;
        let noblock = flags.contains(IpcFlags::NOBLOCK);
        let plan = flags.contains(IpcFlags::RECV).then(|| RecvPlan {
            channel: self.channels.recv_target(src),
            filter: req.filter,
            accept: req.accept,
        });

        if flags.contains(IpcFlags::SEND) {
            self.check_outgoing(caller, &req.message)?;

            #[cfg(feature = "fast_path")]
            if self.config.fast_path && flags == IpcFlags::CALL {
                if let Some(result) = self.try_fast_call(caller, src, &req.message, plan) {
                    return result;
                }
            }

            let pending = PendingSend {
                message: req.message,
                from: self.channels.reply_id(src),
                then_recv: plan,
            };
            let dst = self.channels.send_target(src)?;
            if self.send_phase(caller, dst, pending, noblock)? == SendOutcome::Queued {
                return Ok(IpcStatus::Pending);
            }
        }

        match plan {
            Some(plan) => self.recv_as_caller(caller, plan, noblock),
            None => Ok(IpcStatus::Completed(None)),
        }
    }

    /// Validation that needs only the sender: header, page ownership, channel ownership.
    fn check_outgoing(&self, sender: TaskId, msg: &Message) -> Result<(), IpcError> {
        msg.header.validate()?;
        if let Some(page) = msg.page_payload() {
            self.tasks
                .live(sender)
                .vm
                .resolve_range(VirtAddr::new(page.addr), page.order)
                .map_err(|_| IpcError::InvalidPayload)?;
        }
        if let Some(id) = msg.channel_payload() {
            self.lookup_channel(sender, id)?;
        }
        Ok(())
    }

    /// The receiver registered on `dst`, if it accepts messages from `sender`.
    pub(crate) fn waiting_receiver_for(&self, dst: ChannelRef, sender: TaskId) -> Option<TaskId> {
        let receiver = self.channels.get(dst)?.receiver?;
        match self.tasks.get(receiver)?.state {
            TaskState::Blocked(BlockReason::Receiving { filter, .. }) if filter.accepts(sender) => {
                Some(receiver)
            }
            _ => None,
        }
    }

    fn send_phase(
        &mut self,
        sender: TaskId,
        dst: ChannelRef,
        pending: PendingSend,
        noblock: bool,
    ) -> Result<SendOutcome, IpcError> {
        if let Some(receiver) = self.waiting_receiver_for(dst, sender) {
            let accept = self.tasks.live(receiver).ipc.accept;
            let msg = self.transfer_message(sender, receiver, &pending, accept)?;
            self.complete_receive(receiver, dst, msg);
            return Ok(SendOutcome::Delivered);
        }
        if noblock {
            return Err(IpcError::WouldBlock);
        }
        self.channels.live_mut(dst).senders.push_back(sender);
        self.tasks.live_mut(sender).ipc.pending = Some(pending);
        self.block(sender, BlockReason::Sending { channel: dst });
        ipc_trace!("{} queued on {:?}", sender, dst);
        Ok(SendOutcome::Queued)
    }

    /// Receive half for the task issuing the call.
    pub(crate) fn recv_as_caller(
        &mut self,
        caller: TaskId,
        plan: RecvPlan,
        noblock: bool,
    ) -> Result<IpcStatus, IpcError> {
        match self.recv_phase(caller, plan, noblock)? {
            RecvStatus::Received(msg) => Ok(IpcStatus::Completed(Some(msg))),
            RecvStatus::Registered => {
                self.enter_receive_wait(caller, plan);
                Ok(IpcStatus::Pending)
            }
        }
    }

    /// Pending notifications, then the oldest matching queued sender, then
    /// the receiver slot.
    pub(crate) fn recv_phase(
        &mut self,
        task: TaskId,
        plan: RecvPlan,
        noblock: bool,
    ) -> Result<RecvStatus, IpcError> {
        if plan.filter.is_any() {
            if let Some(msg) = self.take_notification_message(task) {
                self.stats.receives += 1;
                return Ok(RecvStatus::Received(msg));
            }
        }
        let channel = self.channels.get(plan.channel).ok_or(IpcError::ChannelClosed)?;
        if channel.receiver.is_some() {
            return Err(IpcError::AlreadyReceiving);
        }
        while let Some(sender) = self.channels.take_sender(plan.channel, |s| plan.filter.accepts(s)) {
            let Some(pending) = self.tasks.live_mut(sender).ipc.pending.take() else {
                panic!("kernel invariant: queued sender {} has no message", sender);
            };
            match self.transfer_message(sender, task, &pending, plan.accept) {
                Ok(msg) => {
                    self.continuations.push_back((sender, pending.then_recv));
                    self.stats.receives += 1;
                    return Ok(RecvStatus::Received(msg));
                }
                Err(err) => self.complete_blocked(sender, Err(err)),
            }
        }
        if noblock {
            return Err(IpcError::WouldBlock);
        }
        self.channels.live_mut(plan.channel).receiver = Some(task);
        Ok(RecvStatus::Registered)
    }

    /// Blocks `task` in the receiver slot it just took.
    fn enter_receive_wait(&mut self, task: TaskId, plan: RecvPlan) {
        let reason = BlockReason::Receiving { channel: plan.channel, filter: plan.filter };
        if self.tasks.live(task).is_runnable() {
            self.block(task, reason);
        } else {
            self.tasks.live_mut(task).state = TaskState::Blocked(reason);
        }
        self.tasks.live_mut(task).ipc.accept = plan.accept;
        ipc_trace!("{} receiving on {:?}", task, plan.channel);
        self.announce_receiving(task);
    }

    /// Moves `pending` from `sender` to `receiver`; returns the delivered message.
    ///
    /// On error nothing has changed on either side.
    pub(crate) fn transfer_message(
        &mut self,
        sender: TaskId,
        receiver: TaskId,
        pending: &PendingSend,
        accept: Option<PageWindow>,
    ) -> Result<Message, IpcError> {
        let msg = &pending.message;
        msg.header.validate()?;

        let page_move = match msg.page_payload() {
            None => None,
            Some(page) => {
                let src = VirtAddr::new(page.addr);
                self.tasks
                    .live(sender)
                    .vm
                    .resolve_range(src, page.order)
                    .map_err(|_| IpcError::InvalidPayload)?;
                let receiver_task = self.tasks.live(receiver);
                let dst = if receiver_task.flags.contains(TaskFlags::KERNEL_RECEIVE) {
                    None
                } else {
                    let window = accept.ok_or(IpcError::UnacceptablePagePayload)?;
                    let align = order_bytes(page.order).ok_or(IpcError::UnacceptablePagePayload)?;
                    if window.order < page.order
                        || window.base.raw() % align != 0
                        || !receiver_task.vm.is_range_free(window.base, page.order)
                    {
                        return Err(IpcError::UnacceptablePagePayload);
                    }
                    Some(window.base)
                };
                Some(PageMove { src, order: page.order, dst })
            }
        };

        let handed = match msg.channel_payload() {
            None => None,
            Some(id) => {
                let handed = self.lookup_channel(sender, id)?;
                if !self.tasks.live(receiver).channels.has_free_slot() {
                    return Err(IpcError::OutOfResources);
                }
                Some(handed)
            }
        };

        let mut out = self.deliver_inline(receiver, pending);

        if let Some(PageMove { src, order, dst }) = page_move {
            let mapping = self
                .tasks
                .live_mut(sender)
                .vm
                .unmap_range(src, order)
                .map_err(|_| IpcError::InvalidPayload)?;
            out.page = msg.page;
            out.page.addr = match dst {
                None => mapping.pa.raw(),
                Some(base) => {
                    if let Err(err) =
                        self.tasks.live_mut(receiver).vm.map_range(base, mapping.pa, order, mapping.flags)
                    {
                        panic!("kernel invariant: checked page window rejected mapping: {}", err);
                    }
                    base.raw()
                }
            };
        }

        if let Some(handed) = handed {
            let target = self.channels.get(handed).map_or(handed, |c| c.linked_to);
            let (fresh, id) = self.open_for(receiver)?;
            self.channels.live_mut(fresh).linked_to = target;
            out.channel = id;
        }

        self.stats.sends += 1;
        ipc_trace!("{} -> {} ty={:#x} len={}", sender, receiver, out.ty().0, out.inline().len());
        Ok(out)
    }

    /// Inline copy plus reply address and interim notification bits.
    pub(crate) fn deliver_inline(&mut self, receiver: TaskId, pending: &PendingSend) -> Message {
        let mut out = copy_inline(&pending.message);
        out.from = pending.from;
        let task = self.tasks.live_mut(receiver);
        let interim = task.notifications - Notifications::KERNEL_ONLY;
        task.notifications.remove(interim);
        out.notifications |= interim;
        out
    }

    /// Hands `msg` to the task waiting in `channel`'s receiver slot and resumes it.
    pub(crate) fn complete_receive(&mut self, receiver: TaskId, channel: ChannelRef, msg: Message) {
        self.channels.clear_receiver(channel, receiver);
        self.tasks.live_mut(receiver).ipc.accept = None;
        self.complete_blocked(receiver, Ok(Some(msg)));
    }

    /// Stores the final result of a blocked IPC operation and resumes the task.
    pub(crate) fn complete_blocked(&mut self, task: TaskId, result: IpcCompletion) {
        let t = self.tasks.live_mut(task);
        if let Err(err) = result {
            debug!(target: "ipc", "{} blocked ipc failed: {}", task, err);
        }
        t.ipc.completion = Some(result);
        let waiting = matches!(
            t.state,
            TaskState::Blocked(BlockReason::Sending { .. } | BlockReason::Receiving { .. })
        );
        if waiting {
            self.resume(task);
        }
    }

    /// Finishes senders whose queued message was consumed: either their call
    /// is done, or they move on to their receive half.
    pub(crate) fn run_continuations(&mut self) {
        while let Some((task, plan)) = self.continuations.pop_front() {
            if self.tasks.get(task).is_none() {
                continue;
            }
            let Some(plan) = plan else {
                self.complete_blocked(task, Ok(None));
                continue;
            };
            match self.recv_phase(task, plan, false) {
                Ok(RecvStatus::Received(msg)) => self.complete_blocked(task, Ok(Some(msg))),
                Ok(RecvStatus::Registered) => self.enter_receive_wait(task, plan),
                Err(err) => self.complete_blocked(task, Err(err)),
            }
        }
    }
}
