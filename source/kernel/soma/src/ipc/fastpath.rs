// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! Call shortcut: inline-only message, peer already waiting, nobody queued ahead.
//!
//! Skips payload planning and the sender-queue machinery but goes through the
//! same delivery and receive helpers as the slow path, so receiver message,
//! sender state and counters (apart from `fast_path`) come out the same.
//! Any precondition miss returns `None` and the caller takes the slow path.

use super::{IpcError, IpcStatus, Message, PendingSend, RecvPlan};
use crate::hal::Arch;
use crate::types::{ChannelRef, TaskId};
use crate::Kernel;

impl<A: Arch> Kernel<A> {
    pub(crate) fn try_fast_call(
        &mut self,
        caller: TaskId,
        src: ChannelRef,
        message: &Message,
        plan: Option<RecvPlan>,
    ) -> Option<Result<IpcStatus, IpcError>> {
        let plan = plan?;
        if message.page_payload().is_some() || message.channel_payload().is_some() {
            return None;
        }
        let dst = self.channels.send_target(src).ok()?;
        if !self.channels.get(dst)?.senders.is_empty() {
            return None;
        }
        let receiver = self.waiting_receiver_for(dst, caller)?;

        let pending = PendingSend { message: *message, from: self.channels.reply_id(src), then_recv: None };
        let out = self.deliver_inline(receiver, &pending);
        self.stats.sends += 1;
        self.stats.fast_path += 1;
        self.complete_receive(receiver, dst, out);
        Some(self.recv_as_caller(caller, plan, false))
    }
}
