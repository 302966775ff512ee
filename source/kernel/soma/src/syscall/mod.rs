// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! CONTEXT: Syscall dispatcher and error handling
//! OWNERS: @kernel-team
//! PUBLIC API: SyscallTable, Args, Error, Handler, SYSCALL_* IDs, Kernel::{syscall, complete_syscall}
//! DEPENDS_ON: cap, ipc, mm, task, syscall::api
//! INVARIANTS: Fixed MAX_SYSCALL window; stable IDs; decode/check/execute discipline;
//!             every failure maps to a stable negative code
//! ADR: docs/adr/0001-runtime-roles-and-boundaries.md

pub mod api;

use log::debug;

use crate::hal::Arch;
use crate::ipc::{IpcError, IpcStatus};
use crate::mm::MapError;
use crate::task::TaskError;
use crate::types::TaskId;
use crate::Kernel;

/// Maximum number of syscalls supported by this increment.
const MAX_SYSCALL: usize = 32;

/// Result type used by syscall handlers.
pub type SysResult<T> = Result<T, Error>;

/// Syscall arguments passed in registers a0-a5.
#[derive(Debug, Default, Clone, Copy)]
pub struct Args {
    regs: [usize; 6],
}

impl Args {
    /// Creates a new argument pack from the provided registers.
    pub const fn new(regs: [usize; 6]) -> Self {
        Self { regs }
    }

    /// Returns the raw register at `index`.
    pub fn get(&self, index: usize) -> usize {
        self.regs[index]
    }
}

/// Public syscall numbers.
pub const SYSCALL_IPC: usize = 0;
pub const SYSCALL_OPEN: usize = 1;
pub const SYSCALL_CLOSE: usize = 2;
pub const SYSCALL_LINK: usize = 3;
pub const SYSCALL_TRANSFER: usize = 4;
/// Never blocks.
pub const SYSCALL_NOTIFY: usize = 5;
pub const SYSCALL_NOP: usize = 6;
pub const SYSCALL_REDIRECT: usize = 7;
/// Graceful exit; the pager receives a `GraceExit` exception.
pub const SYSCALL_EXIT: usize = 8;
pub const SYSCALL_SET_TIMEOUT: usize = 9;
pub const SYSCALL_TASK_SELF: usize = 10;
/// Privileged.
pub const SYSCALL_TASK_DESTROY: usize = 11;
/// Privileged: move a task to another priority bucket.
pub const SYSCALL_SCHEDULE: usize = 12;
/// Privileged: install a page in a task's address space.
pub const SYSCALL_VM_MAP: usize = 13;
/// Privileged.
pub const SYSCALL_VM_UNMAP: usize = 14;
/// Privileged: translate a virtual address of a task.
pub const SYSCALL_VM_RESOLVE: usize = 15;
/// Privileged: replace or drop a task's pager.
pub const SYSCALL_SET_PAGER: usize = 16;
/// Privileged: resume a task suspended on a page fault.
pub const SYSCALL_RESUME_TASK: usize = 17;
/// Privileged: route an interrupt line to the caller.
pub const SYSCALL_LISTEN_IRQ: usize = 18;
pub const SYSCALL_UNLISTEN_IRQ: usize = 19;

/// Error returned by the dispatcher and handler stack.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum Error {
    /// Syscall number not present in the dispatch table.
    #[error("unknown system call")]
    InvalidSyscall,
    /// Caller lacks `TaskFlags::PRIVILEGED`.
    #[error("privileged system call")]
    NotPrivileged,
    #[error(transparent)]
    Ipc(#[from] IpcError),
    #[error(transparent)]
    Task(#[from] TaskError),
    #[error(transparent)]
    Map(#[from] MapError),
    /// The caller blocked; the return value is produced by `complete_syscall`.
    #[error("caller blocked")]
    Blocked,
    /// Current task terminated and should not resume.
    #[error("task exited")]
    TaskExit,
}

impl Error {
    /// Stable negative code reported to user space.
    pub const fn as_code(self) -> isize {
        match self {
            Self::InvalidSyscall => -10,
            Self::NotPrivileged => TaskError::NotAllowed.as_code(),
            Self::Ipc(err) => err.as_code(),
            Self::Task(err) => err.as_code(),
            Self::Map(err) => err.as_code(),
            Self::Blocked | Self::TaskExit => 0,
        }
    }
}

/// Type alias for a syscall handler.
pub type Handler<A> = fn(&mut api::Context<'_, A>, &Args) -> SysResult<usize>;

/// Dispatch table storing handlers by syscall number.
pub struct SyscallTable<A: Arch> {
    handlers: [Option<Handler<A>>; MAX_SYSCALL],
}

impl<A: Arch> SyscallTable<A> {
    /// Creates an empty dispatch table.
    pub fn new() -> Self {
        Self { handlers: [None; MAX_SYSCALL] }
    }

    /// Registers a handler.
    pub fn register(&mut self, number: usize, handler: Handler<A>) {
        if number < MAX_SYSCALL {
            self.handlers[number] = Some(handler);
        }
    }

    /// Returns the handler registered for `number`.
    pub fn lookup(&self, number: usize) -> SysResult<Handler<A>> {
        self.handlers.get(number).and_then(|entry| *entry).ok_or(Error::InvalidSyscall)
    }
}

impl<A: Arch> Default for SyscallTable<A> {
    fn default() -> Self {
        let mut table = Self::new();
        api::install_handlers(&mut table);
        table
    }
}

impl<A: Arch> Kernel<A> {
    /// Runs system call `number` for the current task and returns the value
    /// for its return register. `0` with the task blocked means the real
    /// result arrives through [`Kernel::complete_syscall`].
    pub fn syscall(&mut self, number: usize, args: &Args) -> isize {
        let caller = self.current();
        self.syscall_as(caller, number, args)
    }

    /// Like [`Kernel::syscall`] with an explicit caller.
    pub fn syscall_as(&mut self, caller: TaskId, number: usize, args: &Args) -> isize {
        let result = self.syscalls.lookup(number).and_then(|handler| {
            let mut ctx = api::Context::new(self, caller);
            handler(&mut ctx, args)
        });
        match result {
            Ok(value) => value as isize,
            Err(err) => {
                debug!(target: "task", "{} syscall {}: {}", caller, number, err);
                err.as_code()
            }
        }
    }

    /// Return value of a blocked IPC syscall once the task was completed.
    ///
    /// Writes a delivered message into the task's IPC buffer. `None` while
    /// the task is still waiting.
    pub fn complete_syscall(&mut self, task: TaskId) -> Option<isize> {
        let completion = self.take_completion(task)?;
        Some(match completion {
            Ok(msg) => {
                api::store_received(self, task, IpcStatus::Completed(msg));
                0
            }
            Err(err) => err.as_code(),
        })
    }
}
