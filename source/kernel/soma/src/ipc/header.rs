// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! IPC message header definition.
//!
//! The header is one 32-bit word:
//!
//! ```text
//!  31            16 15    10  9   8   7   6      0
//! +----------------+--------+---+---+---+--------+
//! |      type      |  rsvd  | C | P | R | inline |
//! +----------------+--------+---+---+---+--------+
//! ```
//!
//! `inline` is the inline payload length, `R` the reply flag, `P` the page
//! payload flag and `C` the channel payload flag. Reserved bits must be zero.

use static_assertions::{assert_eq_size, const_assert};

use super::{IpcError, INLINE_PAYLOAD_MAX};

/// Message type as carried on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[repr(transparent)]
pub struct MessageType(pub u16);

/// IPC header exchanged between tasks.
#[repr(transparent)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct MessageHeader(u32);

assert_eq_size!(MessageHeader, u32);
const_assert!(INLINE_PAYLOAD_MAX <= MessageHeader::INLINE_LEN_MASK as usize);

impl MessageHeader {
    pub const INLINE_LEN_MASK: u32 = 0x7f;
    pub const REPLY: u32 = 1 << 7;
    pub const PAGE_PAYLOAD: u32 = 1 << 8;
    pub const CHANNEL_PAYLOAD: u32 = 1 << 9;
    const RESERVED_MASK: u32 = 0x3f << 10;
    const TYPE_SHIFT: u32 = 16;

    /// Builds a header for a message of type `ty` with `inline_len` bytes.
    ///
    /// Lengths beyond the 7-bit field are truncated; [`MessageHeader::validate`]
    /// rejects lengths beyond [`INLINE_PAYLOAD_MAX`].
    pub const fn new(ty: MessageType, inline_len: usize) -> Self {
        Self(((ty.0 as u32) << Self::TYPE_SHIFT) | (inline_len as u32 & Self::INLINE_LEN_MASK))
    }

    /// Reinterprets a raw header word without validation.
    pub const fn from_raw(raw: u32) -> Self {
        Self(raw)
    }

    pub const fn raw(self) -> u32 {
        self.0
    }

    pub const fn ty(self) -> MessageType {
        MessageType((self.0 >> Self::TYPE_SHIFT) as u16)
    }

    pub const fn inline_len(self) -> usize {
        (self.0 & Self::INLINE_LEN_MASK) as usize
    }

    pub const fn is_reply(self) -> bool {
        self.0 & Self::REPLY != 0
    }

    pub const fn has_page_payload(self) -> bool {
        self.0 & Self::PAGE_PAYLOAD != 0
    }

    pub const fn has_channel_payload(self) -> bool {
        self.0 & Self::CHANNEL_PAYLOAD != 0
    }

    #[must_use]
    pub const fn with_reply(self) -> Self {
        Self(self.0 | Self::REPLY)
    }

    #[must_use]
    pub const fn with_page_payload(self) -> Self {
        Self(self.0 | Self::PAGE_PAYLOAD)
    }

    #[must_use]
    pub const fn with_channel_payload(self) -> Self {
        Self(self.0 | Self::CHANNEL_PAYLOAD)
    }

    /// Rejects reserved bits, oversized inline payloads and contradictory
    /// payload flags.
    pub fn validate(self) -> Result<(), IpcError> {
        if self.has_page_payload() && self.has_channel_payload() {
            return Err(IpcError::InvalidMessage);
        }
        if self.0 & Self::RESERVED_MASK != 0 || self.inline_len() > INLINE_PAYLOAD_MAX {
            return Err(IpcError::InvalidHeader);
        }
        Ok(())
    }

    /// Serialises the header to little-endian bytes.
    pub const fn to_le_bytes(self) -> [u8; 4] {
        self.0.to_le_bytes()
    }

    /// Deserialises little-endian bytes into a [`MessageHeader`].
    pub const fn from_le_bytes(bytes: [u8; 4]) -> Self {
        Self(u32::from_le_bytes(bytes))
    }
}
