// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! CONTEXT: Channel-addressed synchronous IPC (send/recv/call, notifications, listen)
//! OWNERS: @kernel-ipc-team
//! PUBLIC API: Kernel::ipc/notify/listen, IpcRequest, IpcStatus, IpcFlags, SrcFilter, IpcError, Message
//! DEPENDS_ON: cap::ChannelTable, sched (resume/block/switch), mm::AddressSpace (page payloads)
//! INVARIANTS: At most one receiver per channel; FIFO sender queues; exactly one copy per delivery;
//!             validation precedes side effects; fast path observably identical to the slow path
//! ADR: docs/adr/0001-runtime-roles-and-boundaries.md
//!
//! ## Protocol
//!
//! A send on channel `c` is routed to `c.linked_to.transfer_to`, the
//! *receive-on* channel. If its owner is registered there as receiver and its
//! filter accepts the sender, the message is copied immediately. Otherwise the
//! sender joins the channel's FIFO sender queue and blocks until a receiver
//! pulls it.
//!
//! A receive on `c` waits on `c.transfer_to`. Pending notifications win over
//! queued senders when the filter is [`SrcFilter::Any`].
//!
//! A task that blocks does not return from [`Kernel::ipc`] with a message; the
//! peer that completes the exchange stores the result in the blocked task and
//! resumes it. [`Kernel::take_completion`] hands that result back to the
//! architecture return path.
//!
//! [`Kernel::ipc`]: crate::Kernel::ipc
//! [`Kernel::take_completion`]: crate::Kernel::take_completion

pub mod channel;
mod engine;
#[cfg(feature = "fast_path")]
mod fastpath;
pub mod header;
pub mod message;
pub mod notify;
pub mod stats;

#[cfg(test)]
mod tests_prop;

use bitflags::bitflags;

pub use header::{MessageHeader, MessageType};
pub use message::{KernelMessage, Message, PageKind, PagePayload, PageWindow};
pub use notify::Notifications;
pub use stats::IpcStats;

use crate::types::{ChannelId, ChannelRef, TaskId};

/// Largest inline payload a message may carry.
pub const INLINE_PAYLOAD_MAX: usize = 120;

macro_rules! ipc_trace {
    ($($arg:tt)*) => {
        #[cfg(feature = "ipc_trace")]
        log::trace!(target: "ipc", $($arg)*);
    };
}
pub(crate) use ipc_trace;

/// Errors returned by channel and IPC operations.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum IpcError {
    #[error("channel id is not owned by the caller")]
    InvalidId,
    #[error("operation would block")]
    WouldBlock,
    #[error("peer was destroyed while waiting")]
    Aborted,
    #[error("another task is already receiving on the channel")]
    AlreadyReceiving,
    #[error("receiver cannot accept the page payload")]
    UnacceptablePagePayload,
    #[error("malformed message header")]
    InvalidHeader,
    #[error("contradictory message payloads")]
    InvalidMessage,
    #[error("page payload is not mapped in the sender")]
    InvalidPayload,
    #[error("channel table is full")]
    OutOfResources,
    #[error("kernel channel arena exhausted")]
    NoMemory,
    #[error("linked channel no longer exists")]
    NoLongerLinked,
    #[error("channel was closed")]
    ChannelClosed,
    #[error("invalid argument")]
    InvalidArgument,
}

impl IpcError {
    /// Stable negative code reported to user space.
    pub const fn as_code(self) -> isize {
        match self {
            Self::InvalidId => -1,
            Self::OutOfResources => -2,
            Self::AlreadyReceiving => -3,
            Self::InvalidHeader => -4,
            Self::InvalidPayload => -5,
            Self::InvalidMessage => -6,
            Self::NoLongerLinked => -7,
            Self::ChannelClosed => -8,
            Self::NoMemory => -9,
            Self::UnacceptablePagePayload => -11,
            Self::InvalidArgument => -12,
            Self::WouldBlock => -13,
            Self::Aborted => -14,
        }
    }
}

bitflags! {
    /// Operation selector for [`crate::Kernel::ipc`].
    #[derive(Clone, Copy, PartialEq, Eq, Debug)]
    pub struct IpcFlags: u32 {
        const SEND = 1 << 8;
        const RECV = 1 << 9;
        const NOBLOCK = 1 << 10;
        const LISTEN = 1 << 11;
        /// Send, then wait for the reply on the same channel.
        const CALL = Self::SEND.bits() | Self::RECV.bits();
    }
}

/// Which senders a receive accepts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SrcFilter {
    #[default]
    Any,
    Task(TaskId),
}

impl SrcFilter {
    /// Decodes the register form: 0 means any sender.
    pub const fn from_raw(raw: u32) -> Self {
        match raw {
            0 => Self::Any,
            id => Self::Task(TaskId::from_raw(id)),
        }
    }

    pub const fn is_any(self) -> bool {
        matches!(self, Self::Any)
    }

    pub fn accepts(self, sender: TaskId) -> bool {
        match self {
            Self::Any => true,
            Self::Task(id) => id == sender,
        }
    }
}

/// One `ipc` invocation.
#[derive(Debug, Clone, Copy)]
pub struct IpcRequest {
    pub channel: ChannelId,
    pub flags: IpcFlags,
    pub filter: SrcFilter,
    pub message: Message,
    /// Where an incoming page payload may be mapped.
    pub accept: Option<PageWindow>,
}

impl IpcRequest {
    pub fn send(channel: ChannelId, message: Message) -> Self {
        Self { channel, flags: IpcFlags::SEND, filter: SrcFilter::Any, message, accept: None }
    }

    pub fn recv(channel: ChannelId) -> Self {
        Self {
            channel,
            flags: IpcFlags::RECV,
            filter: SrcFilter::Any,
            message: Message::default(),
            accept: None,
        }
    }

    pub fn call(channel: ChannelId, message: Message) -> Self {
        Self { channel, flags: IpcFlags::CALL, filter: SrcFilter::Any, message, accept: None }
    }

    pub fn listen(channel: ChannelId) -> Self {
        Self {
            channel,
            flags: IpcFlags::LISTEN,
            filter: SrcFilter::Any,
            message: Message::default(),
            accept: None,
        }
    }

    #[must_use]
    pub fn noblock(mut self) -> Self {
        self.flags |= IpcFlags::NOBLOCK;
        self
    }

    #[must_use]
    pub fn from_task(mut self, sender: TaskId) -> Self {
        self.filter = SrcFilter::Task(sender);
        self
    }

    #[must_use]
    pub fn accepting(mut self, window: PageWindow) -> Self {
        self.accept = Some(window);
        self
    }
}

/// Immediate outcome of [`crate::Kernel::ipc`].
#[must_use = "a pending ipc completes later through take_completion"]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IpcStatus {
    /// Finished without blocking; carries the received message, if any.
    Completed(Option<Message>),
    /// The caller blocked; its result is stored when a peer completes it.
    Pending,
}

/// Final result of an IPC operation that blocked.
pub type IpcCompletion = Result<Option<Message>, IpcError>;

/// Receive half of an operation, kept while the send half is still queued.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct RecvPlan {
    pub(crate) channel: ChannelRef,
    pub(crate) filter: SrcFilter,
    pub(crate) accept: Option<PageWindow>,
}

/// A queued sender's outgoing message.
#[derive(Debug, Clone, Copy)]
pub(crate) struct PendingSend {
    pub(crate) message: Message,
    /// Reply address captured when the send was issued.
    pub(crate) from: ChannelId,
    pub(crate) then_recv: Option<RecvPlan>,
}
