// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! CONTEXT: Kernel state context threaded through every core operation
//! OWNERS: @kernel-team
//! PUBLIC API: Kernel, KernelConfig, SharedKernel
//! DEPENDS_ON: task::TaskTable, ipc::channel::ChannelArena, sched::Scheduler, hal::Arch
//! INVARIANTS: No file-scope mutable state; the idle task exists for the whole life of a Kernel;
//!             the caller task is always passed explicitly
//! ADR: docs/adr/0001-runtime-roles-and-boundaries.md

extern crate alloc;

use alloc::collections::{BTreeMap, VecDeque};

use log::info;
use spin::{Mutex, MutexGuard};

use crate::hal::{Arch, NullArch};
use crate::ipc::channel::ChannelArena;
use crate::ipc::{IpcStats, RecvPlan};
use crate::sched::Scheduler;
use crate::syscall::SyscallTable;
use crate::task::TaskTable;
use crate::types::{TaskId, TaskRef};

/// Sizing and policy knobs fixed at kernel construction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct KernelConfig {
    /// Task slots, the idle task included.
    pub max_tasks: usize,
    /// Channel-table slots per task.
    pub channels_per_task: usize,
    /// Timer ticks a task may run before round-robin rotation.
    pub time_slice_ticks: u32,
    /// Serve eligible call-style IPC inline.
    pub fast_path: bool,
}

impl Default for KernelConfig {
    fn default() -> Self {
        Self {
            max_tasks: 64,
            channels_per_task: 64,
            time_slice_ticks: 10,
            fast_path: cfg!(feature = "fast_path"),
        }
    }
}

/// Complete state of one kernel instance.
pub struct Kernel<A: Arch = NullArch> {
    pub(crate) config: KernelConfig,
    pub(crate) tasks: TaskTable,
    pub(crate) channels: ChannelArena,
    pub(crate) sched: Scheduler,
    /// Interrupt line -> owning task.
    pub(crate) irqs: BTreeMap<u32, TaskRef>,
    pub(crate) stats: IpcStats,
    pub(crate) arch: A,
    /// Senders whose queued message was consumed and that still owe their
    /// receive phase or completion.
    pub(crate) continuations: VecDeque<(TaskId, Option<RecvPlan>)>,
    /// Dispatch table, populated once at construction.
    pub(crate) syscalls: SyscallTable<A>,
}

impl<A: Arch> Kernel<A> {
    /// Creates a kernel with only the idle task, which is current.
    pub fn new(config: KernelConfig, arch: A) -> Self {
        let max_tasks = config.max_tasks.max(1);
        let mut kernel = Self {
            config,
            tasks: TaskTable::new(max_tasks),
            channels: ChannelArena::new(max_tasks.saturating_mul(config.channels_per_task)),
            sched: Scheduler::new(max_tasks),
            irqs: BTreeMap::new(),
            stats: IpcStats::default(),
            arch,
            continuations: VecDeque::new(),
            syscalls: SyscallTable::default(),
        };
        kernel.install_idle();
        info!(
            target: "sched",
            "kernel up: tasks={} channels/task={} slice={} fast_path={}",
            max_tasks, config.channels_per_task, config.time_slice_ticks, config.fast_path
        );
        kernel
    }

    pub fn config(&self) -> &KernelConfig {
        &self.config
    }

    /// Toggles the call fast path at run time.
    pub fn set_fast_path(&mut self, enabled: bool) {
        self.config.fast_path = enabled && cfg!(feature = "fast_path");
    }

    pub fn stats(&self) -> IpcStats {
        self.stats
    }

    pub fn syscall_table(&self) -> &SyscallTable<A> {
        &self.syscalls
    }

    pub fn channels(&self) -> &ChannelArena {
        &self.channels
    }

    pub fn arch(&self) -> &A {
        &self.arch
    }

    pub fn arch_mut(&mut self) -> &mut A {
        &mut self.arch
    }
}

impl Default for Kernel<NullArch> {
    fn default() -> Self {
        Self::new(KernelConfig::default(), NullArch)
    }
}

/// Kernel behind a spin lock, for trap and interrupt entry points.
pub struct SharedKernel<A: Arch = NullArch> {
    inner: Mutex<Kernel<A>>,
}

impl<A: Arch> SharedKernel<A> {
    pub fn new(kernel: Kernel<A>) -> Self {
        Self { inner: Mutex::new(kernel) }
    }

    pub fn lock(&self) -> MutexGuard<'_, Kernel<A>> {
        self.inner.lock()
    }

    /// Dispatches a system call of the current task under the lock.
    pub fn syscall(&self, number: usize, args: &crate::syscall::Args) -> isize {
        self.inner.lock().syscall(number, args)
    }

    /// Timer interrupt entry.
    pub fn tick(&self) -> TaskId {
        self.inner.lock().tick()
    }

    /// External interrupt entry.
    pub fn handle_irq(&self, irq: u32) {
        self.inner.lock().handle_irq(irq);
    }
}

static_assertions::assert_impl_all!(Kernel<NullArch>: Send);
static_assertions::assert_impl_all!(SharedKernel<NullArch>: Sync);
