// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

#![cfg(test)]
//! CONTEXT: Property-based tests for the per-task channel table
//! OWNERS: @kernel-cap-team
//! NOTE: Tests only; no kernel logic. Ensures slot bookkeeping is sound.
//!
//! TEST_SCOPE:
//!   - IDs handed out are unique among live entries and never zero
//!   - Freed slots are reused lowest-first
//!   - Capacity bound is exact
//!
//! TEST_SCENARIOS:
//!   - allocate_take_model(): random allocate/take sequence agrees with a simple model
//!   - capacity_is_exact(): a table of N slots accepts exactly N channels

extern crate alloc;

use alloc::collections::BTreeMap;
use alloc::vec::Vec;

use super::{CapError, ChannelTable};
use crate::types::{ChannelId, ChannelRef};
use proptest::prelude::*;

#[derive(Debug, Clone)]
enum Op {
    Allocate,
    Take(u32),
}

fn arb_op() -> impl Strategy<Value = Op> {
    prop_oneof![Just(Op::Allocate), (0u32..10).prop_map(Op::Take)]
}

proptest! {
    #[test]
    fn allocate_take_model(ops in proptest::collection::vec(arb_op(), 1..64)) {
        let mut table = ChannelTable::with_capacity(8);
        let mut model: BTreeMap<u32, ChannelRef> = BTreeMap::new();
        for (n, op) in ops.into_iter().enumerate() {
            match op {
                Op::Allocate => {
                    let ch = ChannelRef::new(n, 0);
                    match table.allocate(ch) {
                        Ok(id) => {
                            let expected = (1..=8u32).find(|i| !model.contains_key(i)).unwrap();
                            prop_assert_eq!(id.as_raw(), expected);
                            model.insert(id.as_raw(), ch);
                        }
                        Err(err) => {
                            prop_assert_eq!(err, CapError::NoSpace);
                            prop_assert_eq!(model.len(), 8);
                        }
                    }
                }
                Op::Take(raw) => {
                    let id = ChannelId::from_raw(raw);
                    match model.remove(&raw) {
                        Some(ch) => prop_assert_eq!(table.take(id), Ok(ch)),
                        None => prop_assert_eq!(table.take(id), Err(CapError::InvalidSlot)),
                    }
                }
            }
            prop_assert_eq!(table.len(), model.len());
            let ids: Vec<u32> = table.ids().map(ChannelId::as_raw).collect();
            prop_assert_eq!(ids, model.keys().copied().collect::<Vec<_>>());
        }
    }

    #[test]
    fn capacity_is_exact(capacity in 0usize..16) {
        let mut table = ChannelTable::with_capacity(capacity);
        for i in 0..capacity {
            prop_assert!(table.allocate(ChannelRef::new(i, 0)).is_ok());
        }
        prop_assert!(!table.has_free_slot());
        prop_assert_eq!(table.allocate(ChannelRef::new(capacity, 0)), Err(CapError::NoSpace));
        prop_assert_eq!(table.drain().len(), capacity);
        prop_assert!(table.is_empty());
    }
}
