// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! Helpers shared by the in-crate unit tests.

use crate::hal::NullArch;
use crate::task::TaskSpec;
use crate::types::TaskId;
use crate::Kernel;

pub(crate) fn boot() -> Kernel<NullArch> {
    Kernel::default()
}

/// Creates a default-priority task with no pager.
pub(crate) fn spawn(kernel: &mut Kernel<NullArch>, name: &str) -> TaskId {
    match kernel.create_task(TaskSpec::new(name)) {
        Ok(id) => id,
        Err(err) => panic!("spawn {name}: {err}"),
    }
}
