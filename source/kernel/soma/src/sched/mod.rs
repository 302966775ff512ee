// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! CONTEXT: Priority round-robin scheduler (run queues, resume/block/switch, timer tick)
//! OWNERS: @kernel-sched-team
//! PUBLIC API: Scheduler, EnqueueOutcome, EnqueueRejectReason, Kernel::{resume, block, switch, tick, schedule}
//! DEPENDS_ON: task::TaskTable (states, quanta, timeouts), hal::Arch (task_switch)
//! INVARIANTS: Bounded queue capacity + deterministic reject on saturation; a task is queued at most once
//!             and only while Runnable; the current task is never queued; strict FIFO within a bucket;
//!             lower bucket index always wins
//! ADR: docs/adr/0001-runtime-roles-and-boundaries.md

extern crate alloc;

use alloc::collections::VecDeque;
use alloc::vec::Vec;
use core::array;

use log::trace;

use crate::hal::Arch;
use crate::ipc::Notifications;
use crate::task::{BlockReason, TaskError, TaskState};
use crate::types::{Priority, TaskId, NUM_PRIORITIES};
use crate::Kernel;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(transparent)]
struct QueueCapacity(usize);

impl QueueCapacity {
    const fn new(raw: usize) -> Self {
        Self(raw)
    }

    const fn raw(self) -> usize {
        self.0
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EnqueueRejectReason {
    QueueFull { priority: Priority, capacity: usize },
    AlreadyQueued,
}

#[must_use = "enqueue outcomes must be handled"]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EnqueueOutcome {
    Enqueued,
    Rejected(EnqueueRejectReason),
}

/// Run queues of one core.
///
/// Holds only task IDs; task state lives in the task table. The current task
/// is tracked separately and is not part of any bucket while it runs.
#[derive(Debug)]
pub struct Scheduler {
    buckets: [VecDeque<TaskId>; NUM_PRIORITIES],
    current: TaskId,
    capacity: QueueCapacity,
}

impl Scheduler {
    /// Creates empty run queues holding at most `capacity` tasks per bucket.
    pub fn new(capacity: usize) -> Self {
        let capacity = QueueCapacity::new(capacity);
        Self {
            buckets: array::from_fn(|_| VecDeque::with_capacity(capacity.raw())),
            current: TaskId::IDLE,
            capacity,
        }
    }

    /// Appends `id` to the tail of bucket `priority`.
    pub fn enqueue(&mut self, id: TaskId, priority: Priority) -> EnqueueOutcome {
        if self.is_queued(id) {
            return EnqueueOutcome::Rejected(EnqueueRejectReason::AlreadyQueued);
        }
        let queue = &mut self.buckets[priority.as_index()];
        if queue.len() >= self.capacity.raw() {
            return EnqueueOutcome::Rejected(EnqueueRejectReason::QueueFull {
                priority,
                capacity: self.capacity.raw(),
            });
        }
        queue.push_back(id);
        EnqueueOutcome::Enqueued
    }

    /// Drops `id` from whichever bucket holds it.
    pub fn remove(&mut self, id: TaskId) -> bool {
        for queue in &mut self.buckets {
            if let Some(pos) = queue.iter().position(|t| *t == id) {
                queue.remove(pos);
                return true;
            }
        }
        false
    }

    /// Pops the front of the most urgent non-empty bucket.
    pub fn pop_next(&mut self) -> Option<TaskId> {
        self.buckets.iter_mut().find_map(VecDeque::pop_front)
    }

    pub fn is_queued(&self, id: TaskId) -> bool {
        self.buckets.iter().any(|q| q.contains(&id))
    }

    pub fn has_runnable(&self) -> bool {
        self.buckets.iter().any(|q| !q.is_empty())
    }

    pub fn current(&self) -> TaskId {
        self.current
    }

    pub(crate) fn set_current(&mut self, id: TaskId) {
        self.current = id;
    }

    /// Tasks waiting in bucket `priority`, front first.
    pub fn queued(&self, priority: Priority) -> impl Iterator<Item = TaskId> + '_ {
        self.buckets[priority.as_index()].iter().copied()
    }

    /// Total number of queued tasks.
    pub fn len(&self) -> usize {
        self.buckets.iter().map(VecDeque::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl<A: Arch> Kernel<A> {
    /// Blocked -> Runnable, appended to the tail of the task's bucket.
    ///
    /// Panics if the task is not blocked; only kernel code calls this.
    pub(crate) fn resume(&mut self, id: TaskId) {
        let task = self.tasks.live_mut(id);
        assert!(task.is_blocked(), "kernel invariant: resume of non-blocked task {}", id);
        task.state = TaskState::Runnable;
        let priority = task.priority;
        if id == TaskId::IDLE || id == self.sched.current() {
            return;
        }
        if let EnqueueOutcome::Rejected(reason) = self.sched.enqueue(id, priority) {
            panic!("kernel invariant: cannot enqueue {}: {:?}", id, reason);
        }
        trace!(target: "sched", "resume {} prio={}", id, priority.as_index());
    }

    /// Runnable -> Blocked. Wait-queue bookkeeping must already be done.
    ///
    /// Panics if the task is not runnable.
    pub(crate) fn block(&mut self, id: TaskId, reason: BlockReason) {
        let task = self.tasks.live_mut(id);
        assert!(task.is_runnable(), "kernel invariant: block of non-runnable task {}", id);
        task.state = TaskState::Blocked(reason);
        self.sched.remove(id);
        trace!(target: "sched", "block {} {:?}", id, reason);
    }

    /// Picks the next task to run and returns it.
    ///
    /// A still-runnable current task goes to the tail of its bucket first.
    pub fn switch(&mut self) -> TaskId {
        let prev = self.sched.current();
        if prev != TaskId::IDLE {
            if let Some(task) = self.tasks.get(prev) {
                if task.is_runnable() {
                    let priority = task.priority;
                    if let EnqueueOutcome::Rejected(EnqueueRejectReason::QueueFull { .. }) =
                        self.sched.enqueue(prev, priority)
                    {
                        panic!("kernel invariant: run queue overflow re-queueing {}", prev);
                    }
                }
            }
        }
        let next = self.sched.pop_next().unwrap_or(TaskId::IDLE);
        self.sched.set_current(next);
        let slice = self.config.time_slice_ticks;
        let task = self.tasks.live_mut(next);
        if next != prev || task.quantum == 0 {
            task.quantum = slice;
        }
        if next != prev {
            self.arch.task_switch(prev, next);
            trace!(target: "sched", "switch {} -> {}", prev, next);
        }
        next
    }

    /// Switches away if `id` is the task on the CPU.
    pub(crate) fn switch_if_current(&mut self, id: TaskId) {
        if self.sched.current() == id {
            self.switch();
        }
    }

    /// Timer interrupt: expires timeouts, then charges the current task.
    /// Returns the task that should run afterwards.
    pub fn tick(&mut self) -> TaskId {
        let mut expired = Vec::new();
        for task in self.tasks.iter_mut() {
            if let Some(left) = task.timeout {
                if left <= 1 {
                    task.timeout = None;
                    expired.push(task.id);
                } else {
                    task.timeout = Some(left - 1);
                }
            }
        }
        for id in expired {
            self.notify_task(id, Notifications::TIMER);
        }

        let current = self.sched.current();
        if current == TaskId::IDLE {
            if self.sched.has_runnable() {
                return self.switch();
            }
            return current;
        }
        let task = self.tasks.live_mut(current);
        task.quantum = task.quantum.saturating_sub(1);
        if task.quantum == 0 || !task.is_runnable() {
            return self.switch();
        }
        current
    }

    /// Moves `id` to bucket `priority`; a queued task goes to the new tail.
    pub fn schedule(&mut self, id: TaskId, priority: Priority) -> Result<(), TaskError> {
        let task = self.tasks.get_mut(id).ok_or(TaskError::InvalidTask)?;
        task.priority = priority;
        if self.sched.remove(id) {
            if let EnqueueOutcome::Rejected(reason) = self.sched.enqueue(id, priority) {
                panic!("kernel invariant: cannot re-bucket {}: {:?}", id, reason);
            }
        }
        Ok(())
    }

    pub fn current(&self) -> TaskId {
        self.sched.current()
    }

    pub fn scheduler(&self) -> &Scheduler {
        &self.sched
    }
}
