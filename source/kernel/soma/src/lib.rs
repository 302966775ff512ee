// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! CONTEXT: Portable microkernel core (channels, IPC engine, scheduler, task life cycle)
//! OWNERS: @kernel-team
//! PUBLIC API: Kernel, KernelConfig, SharedKernel, cap, ipc, sched, task, mm, syscall, types
//! DEPENDS_ON: hal::Arch (context switch, IRQ controller), alloc
//! INVARIANTS: No global mutable state; no architecture code; hosted-testable
//! ADR: docs/adr/0001-runtime-roles-and-boundaries.md

#![cfg_attr(not(test), no_std)]
#![cfg_attr(not(test), forbid(clippy::unwrap_used))]

extern crate alloc;

pub mod cap;
pub mod hal;
pub mod ipc;
mod kernel;
pub mod mm;
pub mod sched;
pub mod syscall;
pub mod task;
pub mod types;

#[cfg(test)]
pub(crate) mod testutil;

pub use kernel::{Kernel, KernelConfig, SharedKernel};
