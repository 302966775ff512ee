// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! Architecture collaborator consumed by the portable core.

use crate::types::TaskId;

/// Failure reported by the architecture layer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum ArchError {
    /// No memory for the initial register context or kernel stack.
    #[error("architecture layer is out of memory")]
    NoMemory,
    /// Entry point rejected (misaligned or outside user space).
    #[error("invalid entry point")]
    InvalidEntry,
}

/// Context-switch and interrupt-controller hooks.
pub trait Arch {
    /// Installs the initial register context of `task`.
    fn task_create(&mut self, task: TaskId, entry: usize) -> Result<(), ArchError>;
    /// Releases everything `task_create` allocated.
    fn task_destroy(&mut self, task: TaskId);
    /// Saves `prev` and restores `next`.
    fn task_switch(&mut self, prev: TaskId, next: TaskId);
    fn enable_irq(&mut self, irq: u32);
    fn disable_irq(&mut self, irq: u32);
}

/// Arch layer that does nothing; used by hosted builds.
#[derive(Debug, Default, Clone, Copy)]
pub struct NullArch;

impl Arch for NullArch {
    fn task_create(&mut self, _task: TaskId, _entry: usize) -> Result<(), ArchError> {
        Ok(())
    }

    fn task_destroy(&mut self, _task: TaskId) {}

    fn task_switch(&mut self, _prev: TaskId, _next: TaskId) {}

    fn enable_irq(&mut self, _irq: u32) {}

    fn disable_irq(&mut self, _irq: u32) {}
}
