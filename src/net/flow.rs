/*
 * Copyright (c) Meta Platforms, Inc. and affiliates.
 * All rights reserved.
 *
 * This source code is licensed under the BSD-style license found in the
 * LICENSE file in the root directory of this source tree.
 */

//! The worker-facing handle to the collective primitives.
//!
//! Stage logic does not deal with the group directly; it asks its
//! context for a [`FlowControlChannel`] and calls value-in, value-out
//! collectives on it. Every worker must issue the same sequence of
//! calls; each call is a synchronization point across all workers.

use std::sync::Arc;

use crate::error::Result;
use crate::item::Item;
use crate::net::collective;
use crate::net::group::Group;

/// Typed, blocking collectives over the worker's peer group.
#[derive(Clone)]
pub struct FlowControlChannel {
    group: Arc<dyn Group>,
}

impl FlowControlChannel {
    /// Wrap a peer group.
    pub fn new(group: Arc<dyn Group>) -> Self {
        Self { group }
    }

    /// This worker's rank.
    pub fn my_rank(&self) -> usize {
        self.group.my_rank()
    }

    /// Number of workers in the group.
    pub fn num_hosts(&self) -> usize {
        self.group.num_hosts()
    }

    /// Inclusive prefix sum: returns the fold of the values of ranks
    /// `0..=my_rank`.
    pub fn prefix_sum<T, F>(&self, value: T, op: F) -> Result<T>
    where
        T: Item + Clone,
        F: Fn(&T, &T) -> T,
    {
        let mut value = value;
        collective::prefix_sum(self.group.as_ref(), &mut value, op, true)?;
        Ok(value)
    }

    /// Exclusive prefix sum: returns the fold of the values of ranks
    /// `0..my_rank`, and `initial` at rank 0.
    pub fn ex_prefix_sum<T, F>(&self, value: T, initial: T, op: F) -> Result<T>
    where
        T: Item + Clone,
        F: Fn(&T, &T) -> T,
    {
        let mut value = value;
        collective::prefix_sum(self.group.as_ref(), &mut value, op, false)?;
        Ok(if self.my_rank() == 0 { initial } else { value })
    }

    /// Broadcast rank 0's value to every rank; the input of other ranks
    /// is ignored.
    pub fn broadcast<T: Item>(&self, value: T) -> Result<T> {
        let mut value = value;
        collective::broadcast(self.group.as_ref(), &mut value)?;
        Ok(value)
    }

    /// Fold the values of all ranks; every rank receives the aggregate.
    pub fn all_reduce<T, F>(&self, value: T, op: F) -> Result<T>
    where
        T: Item + Clone,
        F: Fn(&T, &T) -> T,
    {
        let mut value = value;
        collective::all_reduce(self.group.as_ref(), &mut value, op)?;
        Ok(value)
    }

    /// Block until every rank has reached this call.
    pub fn barrier(&self) -> Result<()> {
        self.all_reduce(0u8, |a, b| a.wrapping_add(*b))?;
        Ok(())
    }
}

impl std::fmt::Debug for FlowControlChannel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FlowControlChannel")
            .field("rank", &self.my_rank())
            .field("num_hosts", &self.num_hosts())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::net::local::LocalGroup;

    #[test]
    fn test_flow_collectives() {
        let handles: Vec<_> = LocalGroup::mesh(4)
            .into_iter()
            .map(|group| {
                std::thread::spawn(move || {
                    let flow = FlowControlChannel::new(Arc::new(group));
                    let rank = flow.my_rank() as u64;

                    let inclusive = flow.prefix_sum(rank, |a, b| a + b).unwrap();
                    assert_eq!(inclusive, rank * (rank + 1) / 2);

                    let exclusive = flow.ex_prefix_sum(rank, 0, |a, b| a + b).unwrap();
                    assert_eq!(exclusive, rank.saturating_sub(1) * rank / 2);

                    let root = flow.broadcast(if rank == 0 { 99u64 } else { 0 }).unwrap();
                    assert_eq!(root, 99);

                    let total = flow.all_reduce(rank, |a, b| a + b).unwrap();
                    assert_eq!(total, 6);

                    flow.barrier().unwrap();
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }
    }
}
