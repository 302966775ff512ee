// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! Message envelope copied between task IPC buffers.
//!
//! A [`Message`] is a plain value. The kernel never keeps one past a single
//! send/receive pairing; only the referent of a page or channel payload changes
//! owner.

use core::fmt;

use super::header::{MessageHeader, MessageType};
use super::notify::Notifications;
use super::{IpcError, INLINE_PAYLOAD_MAX};
use crate::types::{ChannelId, VirtAddr};

impl MessageType {
    /// No-op request; also the zero value of an unused buffer.
    pub const NOP: Self = Self(0);
    /// Synthesized by the kernel to deliver pending notification bits.
    pub const NOTIFICATION: Self = Self(1);
    /// Synthesized by the kernel to report a task exception to its pager.
    pub const EXCEPTION: Self = Self(2);
    /// First type value available to user-space interfaces.
    pub const USER_BASE: Self = Self(0x100);
}

/// Message types the kernel itself produces.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KernelMessage {
    Notification,
    Exception,
}

impl TryFrom<MessageType> for KernelMessage {
    type Error = MessageType;

    fn try_from(ty: MessageType) -> Result<Self, Self::Error> {
        match ty {
            MessageType::NOTIFICATION => Ok(Self::Notification),
            MessageType::EXCEPTION => Ok(Self::Exception),
            other => Err(other),
        }
    }
}

impl From<KernelMessage> for MessageType {
    fn from(kind: KernelMessage) -> Self {
        match kind {
            KernelMessage::Notification => MessageType::NOTIFICATION,
            KernelMessage::Exception => MessageType::EXCEPTION,
        }
    }
}

/// Sharing tag carried with a page payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[repr(u8)]
pub enum PageKind {
    /// Ordinary anonymous memory.
    #[default]
    Anonymous = 0,
    /// Memory the sender expects to be shared with other tasks later.
    Shared = 1,
}

/// Page payload descriptor.
///
/// On send, `addr` is a virtual address in the sender. On delivery it is the
/// receiver's virtual address, or the physical address for kernel-mode
/// receivers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct PagePayload {
    pub addr: usize,
    pub order: u8,
    pub kind: PageKind,
}

impl PagePayload {
    pub const fn new(addr: VirtAddr, order: u8, kind: PageKind) -> Self {
        Self { addr: addr.raw(), order, kind }
    }
}

/// Where a receiver is willing to accept a page payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PageWindow {
    pub base: VirtAddr,
    pub order: u8,
}

/// IPC message.
#[derive(Clone, Copy, PartialEq, Eq)]
pub struct Message {
    pub header: MessageHeader,
    /// The channel the receiver should reply on; [`ChannelId::KERNEL`] for kernel messages.
    pub from: ChannelId,
    pub notifications: Notifications,
    pub page: PagePayload,
    pub channel: ChannelId,
    pub data: [u8; INLINE_PAYLOAD_MAX],
}

impl Message {
    /// Creates a message carrying `payload` inline.
    pub fn new(ty: MessageType, payload: &[u8]) -> Result<Self, IpcError> {
        if payload.len() > INLINE_PAYLOAD_MAX {
            return Err(IpcError::InvalidHeader);
        }
        let mut msg = Self::empty(ty);
        msg.header = MessageHeader::new(ty, payload.len());
        msg.data[..payload.len()].copy_from_slice(payload);
        Ok(msg)
    }

    /// Creates a message with no payload at all.
    pub const fn empty(ty: MessageType) -> Self {
        Self {
            header: MessageHeader::new(ty, 0),
            from: ChannelId::KERNEL,
            notifications: Notifications::empty(),
            page: PagePayload { addr: 0, order: 0, kind: PageKind::Anonymous },
            channel: ChannelId::KERNEL,
            data: [0; INLINE_PAYLOAD_MAX],
        }
    }

    /// Attaches a page payload.
    #[must_use]
    pub fn with_page(mut self, page: PagePayload) -> Self {
        self.header = self.header.with_page_payload();
        self.page = page;
        self
    }

    /// Attaches a channel hand-off payload.
    #[must_use]
    pub fn with_channel(mut self, channel: ChannelId) -> Self {
        self.header = self.header.with_channel_payload();
        self.channel = channel;
        self
    }

    #[must_use]
    pub fn as_reply(mut self) -> Self {
        self.header = self.header.with_reply();
        self
    }

    pub fn ty(&self) -> MessageType {
        self.header.ty()
    }

    /// Inline bytes, capped at the buffer capacity.
    pub fn inline(&self) -> &[u8] {
        &self.data[..self.header.inline_len().min(INLINE_PAYLOAD_MAX)]
    }

    pub fn page_payload(&self) -> Option<PagePayload> {
        self.header.has_page_payload().then_some(self.page)
    }

    pub fn channel_payload(&self) -> Option<ChannelId> {
        self.header.has_channel_payload().then_some(self.channel)
    }

    /// Returns the kernel message kind, if the kernel produced this message.
    pub fn kernel_kind(&self) -> Option<KernelMessage> {
        if self.from != ChannelId::KERNEL {
            return None;
        }
        KernelMessage::try_from(self.ty()).ok()
    }
}

impl Default for Message {
    fn default() -> Self {
        Self::empty(MessageType::NOP)
    }
}

impl fmt::Debug for Message {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut s = f.debug_struct("Message");
        s.field("ty", &self.ty().0)
            .field("from", &self.from)
            .field("reply", &self.header.is_reply())
            .field("inline", &self.inline());
        if !self.notifications.is_empty() {
            s.field("notifications", &self.notifications);
        }
        if let Some(page) = self.page_payload() {
            s.field("page", &page);
        }
        if let Some(channel) = self.channel_payload() {
            s.field("channel", &channel);
        }
        s.finish()
    }
}
