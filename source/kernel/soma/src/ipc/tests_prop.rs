// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

#![cfg(test)]
//! CONTEXT: Property-based tests for the IPC engine
//! OWNERS: @kernel-ipc-team
//! NOTE: Tests only; no kernel logic.
//!
//! TEST_SCOPE:
//!   - Inline payloads arrive byte-exact
//!   - The call fast path is observably identical to the slow path
//!
//! TEST_SCENARIOS:
//!   - inline_payload_integrity(): arbitrary payloads survive a direct and a queued delivery
//!   - fast_path_is_transparent(): random op sequences on a 3-task mesh agree with the shortcut on and off

extern crate alloc;

use alloc::vec::Vec;

use super::{
    IpcCompletion, IpcError, IpcRequest, IpcStats, IpcStatus, Message, MessageType, Notifications,
    INLINE_PAYLOAD_MAX,
};
use crate::hal::NullArch;
use crate::task::TaskState;
use crate::testutil::{boot, spawn};
use crate::types::{ChannelId, TaskId};
use crate::Kernel;
use proptest::prelude::*;

const TASKS: usize = 3;

#[derive(Debug, Clone)]
enum Op {
    Send { from: usize, to: usize, noblock: bool, bytes: Vec<u8> },
    Call { from: usize, to: usize, bytes: Vec<u8> },
    Recv { task: usize, peer: usize, noblock: bool, filtered: bool },
    Notify { task: usize },
}

fn arb_bytes() -> impl Strategy<Value = Vec<u8>> {
    proptest::collection::vec(any::<u8>(), 0..24)
}

fn arb_op() -> impl Strategy<Value = Op> {
    prop_oneof![
        (0..TASKS, 0..TASKS, any::<bool>(), arb_bytes())
            .prop_map(|(from, to, noblock, bytes)| Op::Send { from, to, noblock, bytes }),
        (0..TASKS, 0..TASKS, arb_bytes()).prop_map(|(from, to, bytes)| Op::Call { from, to, bytes }),
        (0..TASKS, 0..TASKS, any::<bool>(), any::<bool>())
            .prop_map(|(task, peer, noblock, filtered)| Op::Recv { task, peer, noblock, filtered }),
        (0..TASKS).prop_map(|task| Op::Notify { task }),
    ]
}

/// Every pair of tasks connected; `links[i][j]` is task i's end towards j.
struct Mesh {
    kernel: Kernel<NullArch>,
    tasks: [TaskId; TASKS],
    links: [[ChannelId; TASKS]; TASKS],
}

impl Mesh {
    fn new(fast_path: bool) -> Self {
        let mut kernel = boot();
        kernel.set_fast_path(fast_path);
        let tasks = [spawn(&mut kernel, "t0"), spawn(&mut kernel, "t1"), spawn(&mut kernel, "t2")];
        let mut links = [[ChannelId::KERNEL; TASKS]; TASKS];
        for i in 0..TASKS {
            for j in (i + 1)..TASKS {
                let (a, b) = kernel.connect(tasks[i], tasks[j]).unwrap();
                links[i][j] = a;
                links[j][i] = b;
            }
        }
        Self { kernel, tasks, links }
    }

    /// Applies `op`; `None` when nothing was issued (notify, self-addressed
    /// op, or the acting task is blocked).
    fn apply(&mut self, op: &Op) -> Option<Result<IpcStatus, IpcError>> {
        let (actor, peer, req) = match op {
            Op::Notify { task } => {
                self.kernel.notify_task(self.tasks[*task], Notifications::TIMER);
                return None;
            }
            Op::Send { from, to, noblock, bytes } => {
                let req = IpcRequest::send(self.links[*from][*to], message(bytes));
                (*from, *to, if *noblock { req.noblock() } else { req })
            }
            Op::Call { from, to, bytes } => {
                (*from, *to, IpcRequest::call(self.links[*from][*to], message(bytes)))
            }
            Op::Recv { task, peer, noblock, filtered } => {
                let mut req = IpcRequest::recv(self.links[*task][*peer]);
                if *filtered {
                    req = req.from_task(self.tasks[*peer]);
                }
                (*task, *peer, if *noblock { req.noblock() } else { req })
            }
        };
        let caller = self.tasks[actor];
        if actor == peer || !self.kernel.task(caller)?.is_runnable() {
            return None;
        }
        Some(self.kernel.ipc(caller, &req))
    }

    fn snapshot(&mut self) -> Vec<(TaskState, Option<IpcCompletion>)> {
        self.tasks
            .iter()
            .map(|&t| {
                let state = self.kernel.task(t).unwrap().state();
                (state, self.kernel.take_completion(t))
            })
            .collect()
    }

    fn stats(&self) -> IpcStats {
        self.kernel.stats()
    }
}

fn message(bytes: &[u8]) -> Message {
    Message::new(MessageType::USER_BASE, bytes).unwrap()
}

proptest! {
    #[test]
    fn inline_payload_integrity(bytes in proptest::collection::vec(any::<u8>(), 0..=INLINE_PAYLOAD_MAX)) {
        let mut kernel = boot();
        let a = spawn(&mut kernel, "a");
        let b = spawn(&mut kernel, "b");
        let (ca, cb) = kernel.connect(a, b).unwrap();

        // Receiver already waiting.
        prop_assert_eq!(kernel.ipc(b, &IpcRequest::recv(cb)), Ok(IpcStatus::Pending));
        prop_assert_eq!(kernel.ipc(a, &IpcRequest::send(ca, message(&bytes))), Ok(IpcStatus::Completed(None)));
        let direct = kernel.take_completion(b).unwrap().unwrap().unwrap();
        prop_assert_eq!(direct.inline(), &bytes[..]);

        // Sender queued first.
        prop_assert_eq!(kernel.ipc(a, &IpcRequest::send(ca, message(&bytes))), Ok(IpcStatus::Pending));
        let Ok(IpcStatus::Completed(Some(pulled))) = kernel.ipc(b, &IpcRequest::recv(cb)) else {
            return Err(TestCaseError::fail("queued message not pulled"));
        };
        prop_assert_eq!(pulled.inline(), &bytes[..]);
        prop_assert!(pulled.data[bytes.len()..].iter().all(|&byte| byte == 0));
        prop_assert_eq!(direct, pulled);
    }

    #[test]
    fn fast_path_is_transparent(ops in proptest::collection::vec(arb_op(), 1..48)) {
        let mut slow = Mesh::new(false);
        let mut fast = Mesh::new(true);
        for op in &ops {
            let s = slow.apply(op);
            let f = fast.apply(op);
            prop_assert_eq!(s, f, "op {:?}", op);
            prop_assert_eq!(slow.snapshot(), fast.snapshot(), "after {:?}", op);
        }
        prop_assert_eq!(slow.stats(), fast.stats().without_fast_path());
        prop_assert_eq!(slow.stats().fast_path, 0);
    }
}
