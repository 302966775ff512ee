// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! Per-kernel IPC counters.

/// Monotonic counters updated by the IPC engine.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct IpcStats {
    /// `ipc` invocations, including failed ones.
    pub calls: u64,
    /// Messages copied to a receiver.
    pub sends: u64,
    /// Receives that returned a message without blocking.
    pub receives: u64,
    /// Calls served entirely by the fast path.
    pub fast_path: u64,
    /// Times a caller had to block.
    pub blocked: u64,
    pub notifications: u64,
    pub errors: u64,
}

impl IpcStats {
    /// Counters with the fast-path share removed, for comparing runs that
    /// differ only in the fast-path setting.
    pub fn without_fast_path(mut self) -> Self {
        self.fast_path = 0;
        self
    }
}
