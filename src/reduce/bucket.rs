/*
 * Copyright (c) Meta Platforms, Inc. and affiliates.
 * All rights reserved.
 *
 * This source code is licensed under the BSD-style license found in the
 * LICENSE file in the root directory of this source tree.
 */

//! Chained pre-reduce table.
//!
//! Each slot heads a chain of `(key, value)` entries. Colliding inserts
//! append to the chain; a chain growing past the configured maximum
//! length triggers a resize. When the configured number of consecutive
//! resizes fails to shorten the offending chain (all of its keys share a
//! slot), the table logs a diagnostic and continues with an unbounded
//! chain.

use crate::error::Result;
use crate::item::Item;
use crate::reduce::Partitioner;
use crate::reduce::ReduceConfig;
use crate::reduce::SlotIndex;
use crate::sink::BlockSink;
use crate::writer::BlockWriter;

/// Consecutive chain-length resizes before giving up on the bound.
const MAX_RESIZE_ATTEMPTS: usize = 8;

/// Partitioned chained hash table with local reduction.
pub struct BucketReduceTable<K, V, E, R, P, S>
where
    K: Item + PartialEq,
    V: Item,
    E: Fn(&V) -> K,
    R: Fn(V, V) -> V,
    P: Partitioner<K>,
    S: BlockSink,
{
    config: ReduceConfig,
    key_extractor: E,
    reduce: R,
    partitioner: P,
    writers: Vec<BlockWriter<S>>,

    /// One chain per slot, `num_partitions * slots_per_partition` total.
    chains: Vec<Vec<(K, V)>>,
    slots_per_partition: usize,
    items_per_partition: Vec<usize>,
    num_items: usize,
    resize_attempts: usize,
}

impl<K, V, E, R, P, S> BucketReduceTable<K, V, E, R, P, S>
where
    K: Item + PartialEq,
    V: Item,
    E: Fn(&V) -> K,
    R: Fn(V, V) -> V,
    P: Partitioner<K>,
    S: BlockSink,
{
    /// Create a table emitting each partition into the writer of the
    /// same index.
    pub fn new(
        config: ReduceConfig,
        key_extractor: E,
        reduce: R,
        partitioner: P,
        writers: Vec<BlockWriter<S>>,
    ) -> Result<Self> {
        config.validate(writers.len())?;
        let slots_per_partition = config.init_slots_per_partition;
        let total = config.num_partitions * slots_per_partition;
        let mut chains = Vec::with_capacity(total);
        chains.resize_with(total, Vec::new);
        Ok(Self {
            items_per_partition: vec![0; config.num_partitions],
            num_items: 0,
            chains,
            slots_per_partition,
            resize_attempts: 0,
            config,
            key_extractor,
            reduce,
            partitioner,
            writers,
        })
    }

    /// Insert an item, reducing it with the stored value when its key is
    /// already present. May spill the largest partition or resize the
    /// table afterwards.
    pub fn insert(&mut self, item: V) -> Result<()> {
        let (partition, chain_len) = self.insert_entry(item);
        if self.num_items > self.config.max_items {
            self.flush_largest_partition()?;
        }
        if self.items_per_partition[partition] as f64 / self.slots_per_partition as f64
            > self.config.max_fill_ratio
        {
            self.resize_up();
        } else if chain_len > self.config.max_chain_len {
            if self.resize_attempts < MAX_RESIZE_ATTEMPTS {
                self.resize_attempts += 1;
                self.resize_up();
            } else {
                tracing::warn!(
                    chain_len,
                    max_chain_len = self.config.max_chain_len,
                    "reduce table chain exceeds bound after repeated resizes; continuing"
                );
            }
        }
        Ok(())
    }

    /// Traverse-and-store without the post-insert pressure checks.
    /// Returns the partition the item landed in and the resulting chain
    /// length.
    fn insert_entry(&mut self, item: V) -> (usize, usize) {
        let key = (self.key_extractor)(&item);
        let per = self.slots_per_partition;
        let SlotIndex { partition, offset } =
            self.partitioner
                .index(&key, self.config.num_partitions, per);
        debug_assert!(partition < self.config.num_partitions && offset < per);

        let chain = &mut self.chains[partition * per + offset];
        for i in 0..chain.len() {
            if chain[i].0 == key {
                let (stored_key, stored_value) = chain.remove(i);
                chain.insert(i, (stored_key, (self.reduce)(stored_value, item)));
                return (partition, chain.len());
            }
        }
        chain.push((key, item));
        let chain_len = chain.len();
        self.items_per_partition[partition] += 1;
        self.num_items += 1;
        (partition, chain_len)
    }

    /// Multiply the slot count per partition by the resize factor and
    /// re-insert every live entry. Partition membership is unchanged.
    pub fn resize_up(&mut self) {
        self.slots_per_partition *= self.config.resize_factor;
        tracing::debug!(
            slots_per_partition = self.slots_per_partition,
            items = self.num_items,
            "resizing bucket reduce table"
        );
        let total = self.config.num_partitions * self.slots_per_partition;
        let mut old = Vec::with_capacity(total);
        old.resize_with(total, Vec::new);
        std::mem::swap(&mut old, &mut self.chains);
        self.items_per_partition.fill(0);
        self.num_items = 0;
        for chain in old {
            for (_, value) in chain {
                self.insert_entry(value);
            }
        }
    }

    /// Emit all entries of partition `partition` in slot order (chain
    /// order within a slot), then clear the partition.
    pub fn flush_partition(&mut self, partition: usize) -> Result<()> {
        let per = self.slots_per_partition;
        for pos in partition * per..(partition + 1) * per {
            for (key, value) in std::mem::take(&mut self.chains[pos]) {
                if self.config.emit_value_only {
                    self.writers[partition].append(&value)?;
                } else {
                    self.writers[partition].append(&(key, value))?;
                }
            }
        }
        self.num_items -= self.items_per_partition[partition];
        self.items_per_partition[partition] = 0;
        self.resize_attempts = 0;
        self.writers[partition].flush()
    }

    /// Flush every partition in index order.
    pub fn flush_all(&mut self) -> Result<()> {
        for partition in 0..self.config.num_partitions {
            self.flush_partition(partition)?;
        }
        Ok(())
    }

    /// Flush the partition currently holding the most items; ties break
    /// towards the smallest index.
    pub fn flush_largest_partition(&mut self) -> Result<()> {
        let mut largest = 0;
        let mut largest_size = 0;
        for (partition, &size) in self.items_per_partition.iter().enumerate() {
            if size > largest_size {
                largest = partition;
                largest_size = size;
            }
        }
        tracing::debug!(
            partition = largest,
            items = largest_size,
            "spilling largest partition"
        );
        self.flush_partition(largest)
    }

    /// Flush all partitions and close every writer.
    pub fn close_emitters(&mut self) -> Result<()> {
        self.flush_all()?;
        for writer in &mut self.writers {
            writer.close()?;
        }
        Ok(())
    }

    /// Drop all entries without emitting them; the slot count is kept.
    pub fn clear(&mut self) {
        for chain in &mut self.chains {
            chain.clear();
        }
        self.items_per_partition.fill(0);
        self.num_items = 0;
    }

    /// Drop all entries without emitting them and shrink back to the
    /// initial capacity.
    pub fn reset(&mut self) {
        self.slots_per_partition = self.config.init_slots_per_partition;
        let total = self.config.num_partitions * self.slots_per_partition;
        self.chains.clear();
        self.chains.resize_with(total, Vec::new);
        self.items_per_partition.fill(0);
        self.num_items = 0;
        self.resize_attempts = 0;
    }

    /// Total number of live items.
    pub fn num_items(&self) -> usize {
        self.num_items
    }

    /// Number of live items in partition `partition`.
    pub fn partition_size(&self, partition: usize) -> usize {
        self.items_per_partition[partition]
    }

    /// Number of partitions.
    pub fn num_partitions(&self) -> usize {
        self.config.num_partitions
    }

    /// Current number of slots per partition.
    pub fn slots_per_partition(&self) -> usize {
        self.slots_per_partition
    }
}
