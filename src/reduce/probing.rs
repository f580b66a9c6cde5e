/*
 * Copyright (c) Meta Platforms, Inc. and affiliates.
 * All rights reserved.
 *
 * This source code is licensed under the BSD-style license found in the
 * LICENSE file in the root directory of this source tree.
 */

//! Linear-probing pre-reduce table.
//!
//! Each slot stores at most one `(key, value)` entry. A colliding insert
//! probes forward within its partition, wrapping at the partition
//! boundary; a probe that returns to its initial slot means the
//! partition is full and forces a resize.

use crate::error::Result;
use crate::item::Item;
use crate::reduce::Partitioner;
use crate::reduce::ReduceConfig;
use crate::reduce::SlotIndex;
use crate::sink::BlockSink;
use crate::writer::BlockWriter;

/// Partitioned linear-probing hash table with local reduction.
pub struct ProbingReduceTable<K, V, E, R, P, S>
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

    slots: Vec<Option<(K, V)>>,
    slots_per_partition: usize,
    items_per_partition: Vec<usize>,
    num_items: usize,
}

impl<K, V, E, R, P, S> ProbingReduceTable<K, V, E, R, P, S>
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
        let mut slots = Vec::with_capacity(total);
        slots.resize_with(total, || None);
        Ok(Self {
            items_per_partition: vec![0; config.num_partitions],
            num_items: 0,
            slots,
            slots_per_partition,
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
        let partition = self.insert_entry(item)?;
        if self.num_items > self.config.max_items {
            self.flush_largest_partition()?;
        }
        if self.items_per_partition[partition] as f64 / self.slots_per_partition as f64
            > self.config.max_fill_ratio
        {
            self.resize_up()?;
        }
        Ok(())
    }

    /// Probe-and-store without the post-insert pressure checks; also the
    /// re-insertion path of [`Self::resize_up`]. Returns the partition
    /// the item landed in.
    fn insert_entry(&mut self, item: V) -> Result<usize> {
        let key = (self.key_extractor)(&item);
        let per = self.slots_per_partition;
        let SlotIndex { partition, offset } =
            self.partitioner
                .index(&key, self.config.num_partitions, per);
        debug_assert!(partition < self.config.num_partitions && offset < per);

        let base = partition * per;
        let mut pos = offset;
        let mut probes = 0;
        loop {
            let slot = &mut self.slots[base + pos];
            match slot.take() {
                Some((stored_key, stored_value)) => {
                    if stored_key == key {
                        *slot = Some((stored_key, (self.reduce)(stored_value, item)));
                        return Ok(partition);
                    }
                    *slot = Some((stored_key, stored_value));
                    pos += 1;
                    if pos == per {
                        pos = 0;
                    }
                    probes += 1;
                    if probes == per {
                        // Wrapped all the way around the partition.
                        self.resize_up()?;
                        return self.insert_entry(item);
                    }
                }
                None => {
                    *slot = Some((key, item));
                    self.items_per_partition[partition] += 1;
                    self.num_items += 1;
                    return Ok(partition);
                }
            }
        }
    }

    /// Multiply the slot count per partition by the resize factor and
    /// re-insert every live entry. Partition membership is unchanged;
    /// only the position within each partition moves.
    pub fn resize_up(&mut self) -> Result<()> {
        self.slots_per_partition *= self.config.resize_factor;
        tracing::debug!(
            slots_per_partition = self.slots_per_partition,
            items = self.num_items,
            "resizing probing reduce table"
        );
        let total = self.config.num_partitions * self.slots_per_partition;
        let mut old = Vec::with_capacity(total);
        old.resize_with(total, || None);
        std::mem::swap(&mut old, &mut self.slots);
        self.items_per_partition.fill(0);
        self.num_items = 0;
        for slot in old {
            if let Some((_, value)) = slot {
                self.insert_entry(value)?;
            }
        }
        Ok(())
    }

    /// Emit all entries of partition `partition` to its writer in slot
    /// order, then clear the partition.
    pub fn flush_partition(&mut self, partition: usize) -> Result<()> {
        let per = self.slots_per_partition;
        let base = partition * per;
        for pos in base..base + per {
            if let Some((key, value)) = self.slots[pos].take() {
                if self.config.emit_value_only {
                    self.writers[partition].append(&value)?;
                } else {
                    self.writers[partition].append(&(key, value))?;
                }
            }
        }
        self.num_items -= self.items_per_partition[partition];
        self.items_per_partition[partition] = 0;
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
        for slot in &mut self.slots {
            *slot = None;
        }
        self.items_per_partition.fill(0);
        self.num_items = 0;
    }

    /// Drop all entries without emitting them and shrink back to the
    /// initial capacity.
    pub fn reset(&mut self) {
        self.slots_per_partition = self.config.init_slots_per_partition;
        let total = self.config.num_partitions * self.slots_per_partition;
        self.slots.clear();
        self.slots.resize_with(total, || None);
        self.items_per_partition.fill(0);
        self.num_items = 0;
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

#[cfg(test)]
mod tests {
    use super::*;
    use crate::block::BlockPool;
    use crate::file::File;
    use crate::reduce::FnPartitioner;
    use crate::reduce::HashPartition;

    fn identity_partitioner() -> FnPartitioner<impl Fn(&u64, usize, usize) -> SlotIndex> {
        FnPartitioner(|key: &u64, partitions: usize, slots: usize| SlotIndex {
            partition: (*key as usize) % partitions,
            offset: (*key as usize) % slots,
        })
    }

    fn partition_files(n: usize) -> (Vec<File>, Vec<BlockWriter<File>>) {
        let pool = BlockPool::unbounded();
        let files: Vec<File> = (0..n).map(|_| File::new()).collect();
        let writers = files
            .iter()
            .map(|f| f.writer(pool.clone(), 512).unwrap())
            .collect();
        (files, writers)
    }

    #[test]
    fn test_sum_by_identity_key() {
        // Keys are the values themselves; reduce adds. Two partitions:
        // even keys to partition 0, odd keys to partition 1.
        let (files, writers) = partition_files(2);
        let mut table = ProbingReduceTable::new(
            ReduceConfig::with_partitions(2),
            |v: &u64| *v,
            |a, b| a + b,
            identity_partitioner(),
            writers,
        )
        .unwrap();
        for i in 0..5u64 {
            table.insert(i).unwrap();
        }
        table.close_emitters().unwrap();

        let mut even = files[0].keep_reader().read_complete::<(u64, u64)>().unwrap();
        even.sort_unstable();
        assert_eq!(even, vec![(0, 0), (2, 2), (4, 4)]);
        let mut odd = files[1].keep_reader().read_complete::<(u64, u64)>().unwrap();
        odd.sort_unstable();
        assert_eq!(odd, vec![(1, 1), (3, 3)]);
    }

    #[test]
    fn test_many_items_per_key() {
        // 2^20 inserts over 500 distinct keys, each contributing a count
        // of one. Values are (key, count) pairs reduced by adding counts.
        let (files, writers) = partition_files(4);
        let mut table = ProbingReduceTable::new(
            ReduceConfig::with_partitions(4),
            |v: &(u64, u64)| v.0,
            |a: (u64, u64), b: (u64, u64)| (a.0, a.1 + b.1),
            HashPartition,
            writers,
        )
        .unwrap();
        table.config.emit_value_only = true;
        let total = 1 << 20;
        for i in 0..total as u64 {
            table.insert((i % 500, 1)).unwrap();
        }
        table.close_emitters().unwrap();

        let mut emitted = Vec::new();
        for file in &files {
            emitted.extend(
                file.keep_reader()
                    .read_complete::<(u64, u64)>()
                    .unwrap(),
            );
        }
        assert_eq!(emitted.len(), 500);
        assert_eq!(emitted.iter().map(|e| e.1).sum::<u64>(), total as u64);
        let mut keys: Vec<u64> = emitted.iter().map(|e| e.0).collect();
        keys.sort_unstable();
        keys.dedup();
        assert_eq!(keys.len(), 500);
    }

    #[test]
    fn test_probe_cycle_triggers_resize() {
        // All keys collide on offset zero of partition zero; once the
        // partition's slots are exhausted the probe wraps around and the
        // table must grow.
        let (files, writers) = partition_files(1);
        let config = ReduceConfig {
            num_partitions: 1,
            init_slots_per_partition: 4,
            max_fill_ratio: 1.0,
            ..ReduceConfig::default()
        };
        let mut table = ProbingReduceTable::new(
            config,
            |v: &u64| *v,
            |a, b| a + b,
            FnPartitioner(|_: &u64, _, _| SlotIndex {
                partition: 0,
                offset: 0,
            }),
            writers,
        )
        .unwrap();
        for i in 0..16u64 {
            table.insert(i).unwrap();
        }
        assert!(table.slots_per_partition() > 4);
        assert_eq!(table.num_items(), 16);
        table.close_emitters().unwrap();
        assert_eq!(files[0].num_items(), 16);
    }

    #[test]
    fn test_spill_largest_partition() {
        let (files, writers) = partition_files(2);
        let config = ReduceConfig {
            num_partitions: 2,
            init_slots_per_partition: 64,
            max_items: 8,
            max_fill_ratio: 1.0,
            ..ReduceConfig::default()
        };
        let mut table = ProbingReduceTable::new(
            config,
            |v: &u64| *v,
            |a, b| a + b,
            identity_partitioner(),
            writers,
        )
        .unwrap();
        // Nine distinct even keys: all in partition 0, exceeding
        // max_items and forcing a spill of that partition.
        for i in 0..9u64 {
            table.insert(i * 2).unwrap();
        }
        assert_eq!(table.partition_size(0), 0);
        assert_eq!(table.num_items(), 0);
        table.close_emitters().unwrap();
        assert_eq!(files[0].num_items(), 9);
        assert_eq!(files[1].num_items(), 0);
    }

    #[test]
    fn test_resize_preserves_partitions() {
        let (files, writers) = partition_files(2);
        let config = ReduceConfig {
            num_partitions: 2,
            init_slots_per_partition: 2,
            max_fill_ratio: 0.5,
            ..ReduceConfig::default()
        };
        let mut table = ProbingReduceTable::new(
            config,
            |v: &u64| *v,
            |a, b| a + b,
            identity_partitioner(),
            writers,
        )
        .unwrap();
        // Enough distinct keys to force several resizes.
        for i in 0..64u64 {
            table.insert(i).unwrap();
        }
        assert!(table.slots_per_partition() > 2);
        assert_eq!(table.partition_size(0), 32);
        assert_eq!(table.partition_size(1), 32);
        table.close_emitters().unwrap();
        // Every even key in partition 0, every odd key in partition 1.
        for (partition, file) in files.iter().enumerate() {
            let entries = file.keep_reader().read_complete::<(u64, u64)>().unwrap();
            assert_eq!(entries.len(), 32);
            assert!(entries.iter().all(|(k, _)| *k as usize % 2 == partition));
        }
    }

    #[test]
    fn test_reset_restores_initial_capacity() {
        let (_files, writers) = partition_files(1);
        let config = ReduceConfig {
            num_partitions: 1,
            init_slots_per_partition: 2,
            max_fill_ratio: 1.0,
            ..ReduceConfig::default()
        };
        let mut table = ProbingReduceTable::new(
            config,
            |v: &u64| *v,
            |a, b| a + b,
            HashPartition,
            writers,
        )
        .unwrap();
        for i in 0..32u64 {
            table.insert(i).unwrap();
        }
        assert!(table.slots_per_partition() > 2);
        table.reset();
        assert_eq!(table.slots_per_partition(), 2);
        assert_eq!(table.num_items(), 0);
    }
}
