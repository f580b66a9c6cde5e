/*
 * Copyright (c) Meta Platforms, Inc. and affiliates.
 * All rights reserved.
 *
 * This source code is licensed under the BSD-style license found in the
 * LICENSE file in the root directory of this source tree.
 */

//! The operator-local pre-reduce combiner.
//!
//! Before items are shuffled, each worker reduces them by key in a
//! partitioned hash table. Every key deterministically maps to one of `P`
//! partitions, and each partition flushes into its own block writer, so
//! that items for the same key always travel to the same destination.
//!
//! Two table layouts are provided with identical external behavior: a
//! linear-probing table ([`probing::ProbingReduceTable`]) storing at most
//! one entry per slot, and a chained table
//! ([`bucket::BucketReduceTable`]) where each slot heads a list of
//! entries. Both spill their largest partition under memory pressure and
//! grow their slot arrays under fill pressure; partition membership never
//! changes across a resize, since it is a function of the key alone.

use std::hash::Hash;
use std::hash::Hasher;

use crate::error::Error;
use crate::error::Result;

pub mod bucket;
pub mod probing;

/// The location an item hashes to: a partition and a slot offset within
/// that partition's slot range.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SlotIndex {
    /// Partition number, in `0..num_partitions`. Must depend on the key
    /// only, never on the current slot count.
    pub partition: usize,
    /// Slot offset within the partition, in `0..slots_per_partition`.
    pub offset: usize,
}

/// Maps keys to slots. The partition component must be a function of the
/// key only; the offset component may (and should) use the current
/// per-partition slot count.
pub trait Partitioner<K> {
    /// Compute the slot for `key` given the current table geometry.
    fn index(&self, key: &K, num_partitions: usize, slots_per_partition: usize) -> SlotIndex;
}

/// The default partitioner: partition by `hash(key) mod P`, offset by
/// `hash(key) mod B`.
#[derive(Debug, Clone, Copy, Default)]
pub struct HashPartition;

impl<K: Hash> Partitioner<K> for HashPartition {
    fn index(&self, key: &K, num_partitions: usize, slots_per_partition: usize) -> SlotIndex {
        let mut hasher = std::collections::hash_map::DefaultHasher::new();
        key.hash(&mut hasher);
        let hashed = hasher.finish() as usize;
        SlotIndex {
            partition: hashed % num_partitions,
            offset: hashed % slots_per_partition,
        }
    }
}

/// Range partitioner for integer keys, used by reduce-to-index style
/// operators: keys in `[begin, end)` map onto partitions in contiguous
/// key ranges, preserving key order across partitions.
#[derive(Debug, Clone, Copy)]
pub struct RangePartition {
    begin: u64,
    end: u64,
}

impl RangePartition {
    /// Partition the key range `[begin, end)`.
    pub fn new(begin: u64, end: u64) -> Self {
        assert!(begin < end);
        Self { begin, end }
    }
}

impl Partitioner<u64> for RangePartition {
    fn index(&self, key: &u64, num_partitions: usize, slots_per_partition: usize) -> SlotIndex {
        let span = self.end - self.begin;
        let rel = key.saturating_sub(self.begin).min(span - 1);
        SlotIndex {
            partition: ((rel as u128 * num_partitions as u128) / span as u128) as usize,
            offset: ((rel as u128 * slots_per_partition as u128) / span as u128) as usize,
        }
    }
}

/// Adapter turning a closure `(key, num_partitions, slots_per_partition)
/// -> SlotIndex` into a [`Partitioner`].
#[derive(Debug, Clone, Copy)]
pub struct FnPartitioner<F>(pub F);

impl<K, F> Partitioner<K> for FnPartitioner<F>
where
    F: Fn(&K, usize, usize) -> SlotIndex,
{
    fn index(&self, key: &K, num_partitions: usize, slots_per_partition: usize) -> SlotIndex {
        (self.0)(key, num_partitions, slots_per_partition)
    }
}

/// Configuration shared by both table layouts.
#[derive(Debug, Clone)]
pub struct ReduceConfig {
    /// Number of partitions; one block writer per partition.
    pub num_partitions: usize,
    /// Initial number of slots per partition.
    pub init_slots_per_partition: usize,
    /// Slot-count multiplier applied on resize.
    pub resize_factor: usize,
    /// Maximum `items_in_partition / slots_per_partition` before a
    /// resize, in `(0, 1]`.
    pub max_fill_ratio: f64,
    /// Maximum live items in the whole table before the largest
    /// partition is spilled.
    pub max_items: usize,
    /// Chained layout only: maximum entries in one chain before a
    /// resize.
    pub max_chain_len: usize,
    /// When the reduce operator preserves the key inside the value, emit
    /// the value alone instead of the `(key, value)` pair.
    pub emit_value_only: bool,
}

impl Default for ReduceConfig {
    fn default() -> Self {
        Self {
            num_partitions: 1,
            init_slots_per_partition: 1024,
            resize_factor: 2,
            max_fill_ratio: 0.5,
            max_items: 1 << 20,
            max_chain_len: 256,
            emit_value_only: false,
        }
    }
}

impl ReduceConfig {
    /// Configuration with `num_partitions` partitions and the remaining
    /// fields at their defaults.
    pub fn with_partitions(num_partitions: usize) -> Self {
        Self {
            num_partitions,
            ..Self::default()
        }
    }

    /// Configuration with an explicit total slot count, which the
    /// partition count must divide evenly.
    pub fn with_total_slots(num_partitions: usize, total_slots: usize) -> Result<Self> {
        if num_partitions == 0 || total_slots % num_partitions != 0 {
            return Err(Error::InvalidConfig(format!(
                "total slot count {total_slots} is not divisible into {num_partitions} partitions"
            )));
        }
        Ok(Self {
            num_partitions,
            init_slots_per_partition: total_slots / num_partitions,
            ..Self::default()
        })
    }

    pub(crate) fn validate(&self, num_writers: usize) -> Result<()> {
        if self.num_partitions == 0 {
            return Err(Error::InvalidConfig("no partitions".into()));
        }
        if num_writers != self.num_partitions {
            return Err(Error::InvalidConfig(format!(
                "{} writers for {} partitions",
                num_writers, self.num_partitions
            )));
        }
        if self.init_slots_per_partition == 0 {
            return Err(Error::InvalidConfig("no slots per partition".into()));
        }
        if self.resize_factor < 2 {
            return Err(Error::InvalidConfig(format!(
                "resize factor {} will not grow the table",
                self.resize_factor
            )));
        }
        if !(self.max_fill_ratio > 0.0 && self.max_fill_ratio <= 1.0) {
            return Err(Error::InvalidConfig(format!(
                "fill ratio {} outside (0, 1]",
                self.max_fill_ratio
            )));
        }
        Ok(())
    }
}
