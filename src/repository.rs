/*
 * Copyright (c) Meta Platforms, Inc. and affiliates.
 * All rights reserved.
 *
 * This source code is licensed under the BSD-style license found in the
 * LICENSE file in the root directory of this source tree.
 */

//! A repository of objects shared among workers under deterministic ids.
//!
//! Every worker can allocate ids independently but deterministically: the
//! repository keeps one counter lane per local worker, and hands out the
//! same id sequence on every host. As long as all peers execute the same
//! sequence of allocations in the same order, the ids they assign agree
//! cluster-wide without any coordination.

use std::collections::HashMap;
use std::sync::Arc;

/// Deterministic id allocator plus id-to-object map. Callers serialize
/// access externally (the multiplexer holds it under a mutex).
#[derive(Debug)]
pub struct Repository<T> {
    /// Next id to hand out, one counter per local worker.
    next_id: Vec<usize>,
    objects: HashMap<u64, Arc<T>>,
}

impl<T> Repository<T> {
    /// Create a repository with one id lane per local worker.
    pub fn new(num_lanes: usize) -> Self {
        Self {
            next_id: vec![0; num_lanes],
            objects: HashMap::new(),
        }
    }

    /// Allocate the next id in `lane`. Calls mutate the counter, so the
    /// order of calls matters and must be deterministic across peers.
    pub fn allocate_id(&mut self, lane: usize) -> usize {
        let id = self.next_id[lane];
        self.next_id[lane] += 1;
        id
    }

    /// Get the object registered under `id`, creating it with `make` if
    /// absent.
    pub fn get_or_create(&mut self, id: u64, make: impl FnOnce() -> T) -> Arc<T> {
        Arc::clone(
            self.objects
                .entry(id)
                .or_insert_with(|| Arc::new(make())),
        )
    }

    /// Get the object registered under `id`, if any.
    pub fn get(&self, id: u64) -> Option<Arc<T>> {
        self.objects.get(&id).cloned()
    }

    /// Number of registered objects.
    pub fn len(&self) -> usize {
        self.objects.len()
    }

    /// Whether no objects are registered.
    pub fn is_empty(&self) -> bool {
        self.objects.is_empty()
    }

    /// Iterate over the registered objects.
    pub fn values(&self) -> impl Iterator<Item = &Arc<T>> {
        self.objects.values()
    }
}
