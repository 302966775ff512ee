// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! CONTEXT: Task table and life-cycle helpers (create/destroy/exit, pagers, exceptions)
//! OWNERS: @kernel-sched-team
//! STATUS: Functional
//! API_STABILITY: Unstable
//! TEST_COVERAGE: Unit tests below + tests/lifecycle.rs
//! PUBLIC API: Task, TaskState, BlockReason, TaskSpec, TaskFlags, TaskError, Exception, ExceptionKind
//! DEPENDS_ON: cap::ChannelTable, ipc (pending sends, completions), mm::AddressSpace, sched
//! INVARIANTS: Slot 0 is the idle task; IDs reused only after destroy (generation bumped);
//!             destroy refused while any task names this one as pager; destroyed tasks leave no
//!             queue or receiver-slot references behind
//! ADR: docs/adr/0001-runtime-roles-and-boundaries.md

extern crate alloc;

use alloc::collections::{BTreeSet, VecDeque};
use alloc::string::String;
use alloc::vec::Vec;

use bitflags::bitflags;
use log::{info, warn};

use crate::cap::ChannelTable;
use crate::hal::{Arch, ArchError};
use crate::ipc::{
    IpcCompletion, IpcError, Message, MessageType, Notifications, PageWindow, PendingSend, SrcFilter,
};
use crate::mm::AddressSpace;
use crate::types::{ChannelRef, Priority, TaskId, TaskRef, VirtAddr};
use crate::Kernel;

/// Scheduler-visible state of a live task.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskState {
    /// Running or queued to run.
    Runnable,
    Blocked(BlockReason),
}

/// Why a task is not runnable.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BlockReason {
    /// Freshly created, or stopped for its pager (page fault).
    Suspended,
    /// Queued on `channel` waiting for a receiver.
    Sending { channel: ChannelRef },
    /// Registered as receiver of `channel`.
    Receiving { channel: ChannelRef, filter: SrcFilter },
    /// Waiting for its pager to destroy it.
    Exited(ExceptionKind),
}

bitflags! {
    #[derive(Clone, Copy, PartialEq, Eq, Debug, Default)]
    pub struct TaskFlags: u32 {
        /// May use task-management and address-space system calls.
        const PRIVILEGED = 1 << 0;
        /// Page payloads arrive as raw physical addresses instead of mappings.
        const KERNEL_RECEIVE = 1 << 1;
    }
}

/// Reason a task stopped, reported to its pager.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExceptionKind {
    GraceExit,
    InvalidOp,
    PageFault { addr: VirtAddr },
    InvalidMsgFromPager,
    AbortedKernelIpc,
}

impl ExceptionKind {
    pub const fn code(self) -> u32 {
        match self {
            Self::GraceExit => 1,
            Self::InvalidOp => 2,
            Self::PageFault { .. } => 3,
            Self::InvalidMsgFromPager => 4,
            Self::AbortedKernelIpc => 5,
        }
    }
}

/// Exception record queued on a pager.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Exception {
    pub task: TaskId,
    pub kind: ExceptionKind,
}

impl Exception {
    /// Inline layout: task ID (u32 LE), code (u32 LE), fault address (u64 LE).
    pub const WIRE_LEN: usize = 16;

    pub(crate) fn to_message(self) -> Message {
        let addr = match self.kind {
            ExceptionKind::PageFault { addr } => addr.raw() as u64,
            _ => 0,
        };
        let mut payload = [0u8; Self::WIRE_LEN];
        payload[0..4].copy_from_slice(&self.task.as_raw().to_le_bytes());
        payload[4..8].copy_from_slice(&self.kind.code().to_le_bytes());
        payload[8..16].copy_from_slice(&addr.to_le_bytes());
        let mut msg = Message::empty(MessageType::EXCEPTION);
        msg.header = crate::ipc::MessageHeader::new(MessageType::EXCEPTION, Self::WIRE_LEN);
        msg.data[..Self::WIRE_LEN].copy_from_slice(&payload);
        msg
    }

    /// Decodes an exception message produced by [`Exception::to_message`].
    pub fn decode(msg: &Message) -> Option<(TaskId, u32, u64)> {
        if msg.ty() != MessageType::EXCEPTION || msg.inline().len() != Self::WIRE_LEN {
            return None;
        }
        let bytes = msg.inline();
        let task = u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]);
        let code = u32::from_le_bytes([bytes[4], bytes[5], bytes[6], bytes[7]]);
        let mut addr = [0u8; 8];
        addr.copy_from_slice(&bytes[8..16]);
        Some((TaskId::from_raw(task), code, u64::from_le_bytes(addr)))
    }
}

/// Errors returned by task management.
#[must_use = "task errors must be handled explicitly"]
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum TaskError {
    #[error("no such task")]
    InvalidTask,
    #[error("task table is full")]
    OutOfResources,
    #[error("{count} task(s) still use this task as pager")]
    Referenced { count: usize },
    #[error("operation not permitted")]
    NotAllowed,
    #[error("task has no pager")]
    NoPager,
    #[error("task is not suspended")]
    NotSuspended,
    #[error("interrupt line already routed")]
    IrqInUse,
    #[error(transparent)]
    Arch(#[from] ArchError),
}

impl TaskError {
    /// Stable negative code reported to user space.
    pub const fn as_code(self) -> isize {
        match self {
            Self::OutOfResources => -2,
            Self::Arch(ArchError::NoMemory) => -9,
            Self::Arch(ArchError::InvalidEntry) => -12,
            Self::InvalidTask => -15,
            Self::Referenced { .. } => -16,
            Self::NotAllowed => -17,
            Self::NoPager => -18,
            Self::NotSuspended => -19,
            Self::IrqInUse => -20,
        }
    }
}

/// Parameters of [`Kernel::create_task`].
#[derive(Debug, Clone, Copy)]
pub struct TaskSpec<'a> {
    pub name: &'a str,
    pub entry: usize,
    pub pager: Option<TaskId>,
    pub priority: Priority,
    pub flags: TaskFlags,
}

impl<'a> TaskSpec<'a> {
    pub fn new(name: &'a str) -> Self {
        Self { name, entry: 0, pager: None, priority: Priority::DEFAULT, flags: TaskFlags::empty() }
    }

    #[must_use]
    pub fn entry(mut self, entry: usize) -> Self {
        self.entry = entry;
        self
    }

    #[must_use]
    pub fn pager(mut self, pager: TaskId) -> Self {
        self.pager = Some(pager);
        self
    }

    #[must_use]
    pub fn priority(mut self, priority: Priority) -> Self {
        self.priority = priority;
        self
    }

    #[must_use]
    pub fn flags(mut self, flags: TaskFlags) -> Self {
        self.flags = flags;
        self
    }
}

/// The user-visible IPC buffer of a task (message plus page-acceptance window).
#[derive(Debug, Clone, Copy, Default)]
pub struct IpcBuffer {
    pub message: Message,
    pub accept: Option<PageWindow>,
}

#[derive(Debug, Default)]
pub(crate) struct IpcState {
    /// Outgoing message while blocked sending.
    pub(crate) pending: Option<PendingSend>,
    /// Page window while registered as receiver.
    pub(crate) accept: Option<PageWindow>,
    /// Result stored by the peer that completed a blocked operation.
    pub(crate) completion: Option<IpcCompletion>,
    pub(crate) buffer: IpcBuffer,
}

/// Task control block.
#[derive(Debug)]
pub struct Task {
    pub(crate) id: TaskId,
    pub(crate) name: String,
    pub(crate) state: TaskState,
    pub(crate) flags: TaskFlags,
    pub(crate) priority: Priority,
    pub(crate) quantum: u32,
    pub(crate) timeout: Option<u32>,
    pub(crate) notifications: Notifications,
    pub(crate) pager: Option<TaskRef>,
    /// Tasks naming this one as pager.
    pub(crate) dependents: BTreeSet<TaskId>,
    pub(crate) listeners: BTreeSet<TaskRef>,
    pub(crate) exceptions: VecDeque<Exception>,
    pub(crate) channels: ChannelTable,
    pub(crate) vm: AddressSpace,
    pub(crate) ipc: IpcState,
}

impl Task {
    fn new(id: TaskId, spec: &TaskSpec<'_>, channel_slots: usize, quantum: u32) -> Self {
        Self {
            id,
            name: String::from(spec.name),
            state: TaskState::Blocked(BlockReason::Suspended),
            flags: spec.flags,
            priority: spec.priority,
            quantum,
            timeout: None,
            notifications: Notifications::empty(),
            pager: None,
            dependents: BTreeSet::new(),
            listeners: BTreeSet::new(),
            exceptions: VecDeque::new(),
            channels: ChannelTable::with_capacity(channel_slots),
            vm: AddressSpace::new(),
            ipc: IpcState::default(),
        }
    }

    pub fn id(&self) -> TaskId {
        self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn state(&self) -> TaskState {
        self.state
    }

    pub fn is_runnable(&self) -> bool {
        self.state == TaskState::Runnable
    }

    pub fn is_blocked(&self) -> bool {
        matches!(self.state, TaskState::Blocked(_))
    }

    pub fn block_reason(&self) -> Option<BlockReason> {
        match self.state {
            TaskState::Blocked(reason) => Some(reason),
            TaskState::Runnable => None,
        }
    }

    pub fn flags(&self) -> TaskFlags {
        self.flags
    }

    pub fn priority(&self) -> Priority {
        self.priority
    }

    pub fn quantum(&self) -> u32 {
        self.quantum
    }

    pub fn timeout(&self) -> Option<u32> {
        self.timeout
    }

    pub fn notifications(&self) -> Notifications {
        self.notifications
    }

    pub fn pager(&self) -> Option<TaskId> {
        self.pager.map(|p| p.id)
    }

    pub fn channels(&self) -> &ChannelTable {
        &self.channels
    }

    pub fn address_space(&self) -> &AddressSpace {
        &self.vm
    }

    pub fn address_space_mut(&mut self) -> &mut AddressSpace {
        &mut self.vm
    }

    pub fn has_completion(&self) -> bool {
        self.ipc.completion.is_some()
    }
}

#[derive(Debug, Default)]
struct Slot {
    generation: u32,
    task: Option<Task>,
}

/// Fixed-capacity task arena.
#[derive(Debug)]
pub struct TaskTable {
    slots: Vec<Slot>,
}

impl TaskTable {
    /// Creates a table with `capacity` slots, slot 0 included.
    pub fn new(capacity: usize) -> Self {
        let mut slots = Vec::with_capacity(capacity);
        slots.resize_with(capacity, Slot::default);
        Self { slots }
    }

    /// Lowest free user slot.
    fn vacant(&self) -> Option<TaskId> {
        self.slots
            .iter()
            .enumerate()
            .skip(1)
            .find(|(_, slot)| slot.task.is_none())
            .map(|(index, _)| TaskId::from_raw(index as u32))
    }

    fn install(&mut self, task: Task) {
        let index = task.id.as_index();
        self.slots[index].task = Some(task);
    }

    fn remove(&mut self, id: TaskId) -> Option<Task> {
        let slot = self.slots.get_mut(id.as_index())?;
        let task = slot.task.take()?;
        slot.generation = slot.generation.wrapping_add(1);
        Some(task)
    }

    pub fn get(&self, id: TaskId) -> Option<&Task> {
        self.slots.get(id.as_index()).and_then(|s| s.task.as_ref())
    }

    pub fn get_mut(&mut self, id: TaskId) -> Option<&mut Task> {
        self.slots.get_mut(id.as_index()).and_then(|s| s.task.as_mut())
    }

    /// Mutable access to a task whose liveness is a kernel invariant.
    pub(crate) fn live_mut(&mut self, id: TaskId) -> &mut Task {
        match self.get_mut(id) {
            Some(task) => task,
            None => panic!("kernel invariant: task {} is not live", id),
        }
    }

    pub(crate) fn live(&self, id: TaskId) -> &Task {
        match self.get(id) {
            Some(task) => task,
            None => panic!("kernel invariant: task {} is not live", id),
        }
    }

    /// Takes a generation-checked reference to a live task.
    pub fn task_ref(&self, id: TaskId) -> Option<TaskRef> {
        let slot = self.slots.get(id.as_index())?;
        slot.task.as_ref().map(|_| TaskRef { id, generation: slot.generation })
    }

    /// Follows `r` if the task it was taken from is still alive.
    pub fn resolve(&self, r: TaskRef) -> Option<&Task> {
        let slot = self.slots.get(r.id.as_index())?;
        if slot.generation != r.generation {
            return None;
        }
        slot.task.as_ref()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Task> {
        self.slots.iter().filter_map(|s| s.task.as_ref())
    }

    pub(crate) fn iter_mut(&mut self) -> impl Iterator<Item = &mut Task> {
        self.slots.iter_mut().filter_map(|s| s.task.as_mut())
    }

    /// Number of live tasks, idle included.
    pub fn len(&self) -> usize {
        self.iter().count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl<A: Arch> Kernel<A> {
    pub(crate) fn install_idle(&mut self) {
        let spec = TaskSpec::new("idle").priority(Priority::LOWEST).flags(TaskFlags::PRIVILEGED);
        let mut idle = Task::new(TaskId::IDLE, &spec, 0, self.config.time_slice_ticks);
        idle.state = TaskState::Runnable;
        self.tasks.install(idle);
    }

    /// Creates a task and makes it runnable.
    pub fn create_task(&mut self, spec: TaskSpec<'_>) -> Result<TaskId, TaskError> {
        let pager = match spec.pager {
            Some(pager) => Some(self.tasks.task_ref(pager).ok_or(TaskError::InvalidTask)?),
            None => None,
        };
        let id = self.tasks.vacant().ok_or(TaskError::OutOfResources)?;
        self.arch.task_create(id, spec.entry)?;
        let mut task = Task::new(id, &spec, self.config.channels_per_task, self.config.time_slice_ticks);
        task.pager = pager;
        self.tasks.install(task);
        if let Some(pager) = pager {
            self.tasks.live_mut(pager.id).dependents.insert(id);
        }
        self.resume(id);
        info!(target: "task", "created {} '{}' pager={:?}", id, spec.name, spec.pager);
        Ok(id)
    }

    /// Destroys `id`.
    ///
    /// Fails while other tasks name `id` as their pager. A task blocked in IPC
    /// is withdrawn from its wait first. Tasks waiting on channels owned by
    /// `id` fail with `Aborted`.
    pub fn destroy_task(&mut self, id: TaskId) -> Result<(), TaskError> {
        if id == TaskId::IDLE {
            return Err(TaskError::NotAllowed);
        }
        let task = self.tasks.get(id).ok_or(TaskError::InvalidTask)?;
        if !task.dependents.is_empty() {
            warn!(target: "task", "destroy {} refused; pager of {:?}", id, task.dependents);
            return Err(TaskError::Referenced { count: task.dependents.len() });
        }
        self.revoke_waits(id);
        self.sched.remove(id);
        let task = self.tasks.live_mut(id);
        let pager = task.pager.take();
        let owned = task.channels.drain();
        if let Some(pager) = pager {
            if self.tasks.resolve(pager).is_some() {
                self.tasks.live_mut(pager.id).dependents.remove(&id);
            }
        }
        for ch in owned {
            self.destroy_channel(ch, IpcError::Aborted);
        }
        let irqs: Vec<u32> =
            self.irqs.iter().filter(|(_, owner)| owner.id == id).map(|(irq, _)| *irq).collect();
        for irq in irqs {
            self.irqs.remove(&irq);
            self.arch.disable_irq(irq);
        }
        if let Some(gone) = self.tasks.task_ref(id) {
            for task in self.tasks.iter_mut() {
                task.listeners.remove(&gone);
            }
        }
        let was_current = self.sched.current() == id;
        self.tasks.remove(id);
        self.arch.task_destroy(id);
        self.run_continuations();
        info!(target: "task", "destroyed {}", id);
        if was_current {
            self.switch();
        }
        Ok(())
    }

    /// Withdraws `id` from any IPC wait and drops its in-flight state.
    fn revoke_waits(&mut self, id: TaskId) {
        let task = self.tasks.live_mut(id);
        let state = task.state;
        task.ipc.pending = None;
        task.ipc.accept = None;
        match state {
            TaskState::Blocked(BlockReason::Sending { channel }) => {
                self.channels.remove_sender(channel, id);
            }
            TaskState::Blocked(BlockReason::Receiving { channel, .. }) => {
                self.channels.clear_receiver(channel, id);
            }
            _ => {}
        }
    }

    /// Stops `id` for good and reports `kind` to its pager, which is expected
    /// to destroy it.
    pub fn exit_task(&mut self, id: TaskId, kind: ExceptionKind) -> Result<(), TaskError> {
        if id == TaskId::IDLE {
            return Err(TaskError::NotAllowed);
        }
        let task = self.tasks.get(id).ok_or(TaskError::InvalidTask)?;
        if matches!(task.state, TaskState::Blocked(BlockReason::Exited(_))) {
            return Err(TaskError::NotAllowed);
        }
        if task.is_runnable() {
            self.block(id, BlockReason::Exited(kind));
        } else {
            self.revoke_waits(id);
            self.tasks.live_mut(id).state = TaskState::Blocked(BlockReason::Exited(kind));
        }
        info!(target: "task", "{} exited: {:?}", id, kind);
        if !self.raise_exception(id, kind) {
            warn!(target: "task", "{} exited without a pager", id);
        }
        self.switch_if_current(id);
        Ok(())
    }

    /// Suspends `id` on a fault at `addr` and asks its pager to resolve it.
    pub fn page_fault(&mut self, id: TaskId, addr: VirtAddr) -> Result<(), TaskError> {
        let task = self.tasks.get(id).ok_or(TaskError::InvalidTask)?;
        if !task.is_runnable() {
            return Err(TaskError::NotAllowed);
        }
        if task.pager.and_then(|p| self.tasks.resolve(p)).is_none() {
            return Err(TaskError::NoPager);
        }
        self.block(id, BlockReason::Suspended);
        self.raise_exception(id, ExceptionKind::PageFault { addr });
        self.switch_if_current(id);
        Ok(())
    }

    /// Makes a suspended task runnable again (pager side of a page fault).
    pub fn resume_task(&mut self, id: TaskId) -> Result<(), TaskError> {
        let task = self.tasks.get(id).ok_or(TaskError::InvalidTask)?;
        if task.state != TaskState::Blocked(BlockReason::Suspended) {
            return Err(TaskError::NotSuspended);
        }
        self.resume(id);
        Ok(())
    }

    /// Queues an exception record on the pager of `id`. Returns false if
    /// there is no live pager.
    fn raise_exception(&mut self, id: TaskId, kind: ExceptionKind) -> bool {
        let Some(pager) = self.tasks.live(id).pager else {
            return false;
        };
        if self.tasks.resolve(pager).is_none() {
            return false;
        }
        self.tasks.live_mut(pager.id).exceptions.push_back(Exception { task: id, kind });
        self.notify_task(pager.id, Notifications::EXCEPTION);
        true
    }

    /// Replaces or drops the pager of `id`, moving the keep-alive relation.
    pub fn set_pager(&mut self, id: TaskId, pager: Option<TaskId>) -> Result<(), TaskError> {
        if pager == Some(id) {
            return Err(TaskError::NotAllowed);
        }
        let new_ref = match pager {
            Some(p) => Some(self.tasks.task_ref(p).ok_or(TaskError::InvalidTask)?),
            None => None,
        };
        let task = self.tasks.get_mut(id).ok_or(TaskError::InvalidTask)?;
        let old = core::mem::replace(&mut task.pager, new_ref);
        if let Some(old) = old {
            if self.tasks.resolve(old).is_some() {
                self.tasks.live_mut(old.id).dependents.remove(&id);
            }
        }
        if let Some(new_ref) = new_ref {
            self.tasks.live_mut(new_ref.id).dependents.insert(id);
        }
        Ok(())
    }

    /// Tasks that currently keep `id` alive as their pager.
    pub fn dependents(&self, id: TaskId) -> impl Iterator<Item = TaskId> + '_ {
        self.tasks.get(id).into_iter().flat_map(|t| t.dependents.iter().copied())
    }

    /// Arms (or with 0, cancels) a timer notification `ticks` ticks from now.
    pub fn set_timeout(&mut self, id: TaskId, ticks: u32) -> Result<(), TaskError> {
        let task = self.tasks.get_mut(id).ok_or(TaskError::InvalidTask)?;
        task.timeout = (ticks != 0).then_some(ticks);
        Ok(())
    }

    pub fn task(&self, id: TaskId) -> Option<&Task> {
        self.tasks.get(id)
    }

    pub fn task_mut(&mut self, id: TaskId) -> Option<&mut Task> {
        self.tasks.get_mut(id)
    }

    pub fn tasks(&self) -> &TaskTable {
        &self.tasks
    }

    /// Takes the result a peer stored when it completed `id`'s blocked operation.
    pub fn take_completion(&mut self, id: TaskId) -> Option<IpcCompletion> {
        self.tasks.get_mut(id)?.ipc.completion.take()
    }

    pub fn ipc_buffer(&self, id: TaskId) -> Option<&IpcBuffer> {
        self.tasks.get(id).map(|t| &t.ipc.buffer)
    }

    pub fn ipc_buffer_mut(&mut self, id: TaskId) -> Option<&mut IpcBuffer> {
        self.tasks.get_mut(id).map(|t| &mut t.ipc.buffer)
    }
}
