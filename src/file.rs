/*
 * Copyright (c) Meta Platforms, Inc. and affiliates.
 * All rights reserved.
 *
 * This source code is licensed under the BSD-style license found in the
 * LICENSE file in the root directory of this source tree.
 */

//! The in-memory file: an append-only ordered sequence of blocks.
//!
//! By composing reference-counted [`Block`] views, a [`File`] can hold a
//! subset of the items of byte blocks it shares with other containers.
//! Alongside the blocks it maintains an inclusive prefix sum of item
//! counts, so a reader can be seeked to any item index in logarithmic
//! time (sequential within the target block).
//!
//! A file is filled through a [`BlockWriter`] obtained from [`File::writer`]
//! and transitions from open to closed exactly once. It can be read any
//! number of times through keep readers, or drained once through a
//! consume reader.

use std::fmt;
use std::sync::Arc;
use std::sync::RwLock;

use crate::block::Block;
use crate::block::BlockPool;
use crate::error::Error;
use crate::error::Result;
use crate::item::Item;
use crate::reader::BlockReader;
use crate::reader::BlockSource;
use crate::sink::BlockSink;
use crate::writer::BlockWriter;

#[derive(Default)]
struct FileInner {
    blocks: Vec<Block>,
    /// Inclusive prefix sum: `nitems_sum[i]` is the number of items
    /// starting in blocks `0..=i`.
    nitems_sum: Vec<usize>,
    size: usize,
    closed: bool,
}

/// An append-only ordered sequence of blocks. Cloning yields another
/// handle to the same file.
#[derive(Clone, Default)]
pub struct File {
    inner: Arc<RwLock<FileInner>>,
}

impl File {
    /// Create an empty, open file.
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of blocks in the file.
    pub fn num_blocks(&self) -> usize {
        self.inner.read().unwrap().blocks.len()
    }

    /// Number of items in the file.
    pub fn num_items(&self) -> usize {
        self.inner.read().unwrap().nitems_sum.last().copied().unwrap_or(0)
    }

    /// Whether the file holds no blocks.
    pub fn is_empty(&self) -> bool {
        self.inner.read().unwrap().blocks.is_empty()
    }

    /// Total bytes of user data in the file.
    pub fn total_size(&self) -> usize {
        self.inner.read().unwrap().size
    }

    /// Whether the writing side has closed the file.
    pub fn closed(&self) -> bool {
        self.inner.read().unwrap().closed
    }

    /// The `i`-th block, if present.
    pub fn block(&self, i: usize) -> Option<Block> {
        self.inner.read().unwrap().blocks.get(i).cloned()
    }

    /// Number of items starting in block `i`.
    pub fn items_start_in(&self, i: usize) -> usize {
        let inner = self.inner.read().unwrap();
        inner.nitems_sum[i] - if i == 0 { 0 } else { inner.nitems_sum[i - 1] }
    }

    /// Get a writer appending blocks of `block_size` bytes to this file.
    pub fn writer(&self, pool: BlockPool, block_size: usize) -> Result<BlockWriter<File>> {
        BlockWriter::new(self.clone(), pool, block_size)
    }

    /// Get a reader over the file's blocks that leaves them in place.
    /// The file may keep growing while the reader runs; it observes the
    /// blocks present at each fetch.
    pub fn keep_reader(&self) -> BlockReader<KeepFileBlockSource> {
        BlockReader::new(KeepFileBlockSource::new(self.clone(), 0, None))
    }

    /// Get a reader that unconditionally drains the file: whether or not
    /// every item is read, the file is empty once the reader is dropped.
    pub fn consume_reader(&self) -> BlockReader<ConsumeFileBlockSource> {
        BlockReader::new(ConsumeFileBlockSource::new(self.clone()))
    }

    /// Get a reader seeked to item `index`, using a binary search over
    /// the item-count prefix sums followed by a skip within the block.
    /// `verify` must match the writer's self-verify setting.
    pub fn reader_at<T: Item>(
        &self,
        index: usize,
        verify: bool,
    ) -> Result<BlockReader<KeepFileBlockSource>> {
        let (begin_block, first_item, items_before) = {
            let inner = self.inner.read().unwrap();
            // First block whose inclusive prefix sum exceeds or reaches
            // the index; skipping inside the block crosses into the next
            // one when the index lands exactly on a block boundary.
            let begin_block = inner.nitems_sum.partition_point(|&sum| sum < index);
            if begin_block == inner.blocks.len() {
                let available = inner.nitems_sum.last().copied().unwrap_or(0);
                return Err(Error::underflow(index, available));
            }
            let items_before = if begin_block == 0 {
                0
            } else {
                inner.nitems_sum[begin_block - 1]
            };
            (
                begin_block,
                inner.blocks[begin_block].first_item(),
                items_before,
            )
        };

        let source = KeepFileBlockSource::new(self.clone(), begin_block, Some(first_item));
        let mut reader = BlockReader::new(source).with_verify(verify);

        debug_assert!(items_before <= index);
        let skip_items = index - items_before;
        if T::IS_FIXED_SIZE {
            let per_item = T::FIXED_SIZE + if verify { 8 } else { 0 };
            reader.skip(skip_items, skip_items * per_item)?;
        } else {
            for _ in 0..skip_items {
                if !reader.has_next() {
                    return Err(Error::underflow(index, items_before));
                }
                reader.next::<T>()?;
            }
        }
        Ok(reader)
    }

    /// Get the item at `index`. Seeks for every call; do not use for
    /// reading successive items.
    pub fn item_at<T: Item>(&self, index: usize, verify: bool) -> Result<T> {
        self.reader_at::<T>(index, verify)?.next::<T>()
    }

    /// Binary-search for `value` in a file ordered with respect to `cmp`
    /// (`cmp(probe, value)` returning `Greater` when the probe comes
    /// after the value). Returns the greatest index whose item does not
    /// compare after `value`.
    ///
    /// Each probe seeks from scratch, so this costs O(log N) seeks. Not
    /// performant; intended for coarse lookups only.
    pub fn index_of<T, F>(&self, value: &T, verify: bool, cmp: F) -> Result<usize>
    where
        T: Item,
        F: Fn(&T, &T) -> std::cmp::Ordering,
    {
        let mut left = 0;
        let mut right = self.num_items();
        while left + 1 < right {
            let mid = (left + right) / 2;
            let probe = self.item_at::<T>(mid, verify)?;
            if cmp(&probe, value) == std::cmp::Ordering::Greater {
                right = mid;
            } else {
                left = mid;
            }
        }
        Ok(left)
    }

    /// Return zero-copy block views covering items `begin..end`.
    pub fn get_item_range<T: Item>(
        &self,
        begin: usize,
        end: usize,
        verify: bool,
    ) -> Result<Vec<Block>> {
        debug_assert!(begin <= end);
        if begin == end {
            return Ok(Vec::new());
        }
        self.reader_at::<T>(begin, verify)?
            .get_item_batch::<T>(end - begin)
    }

    /// Record a block without the open/closed bookkeeping. Used by the
    /// caching queue source, whose cache file is never closed.
    pub(crate) fn cache_block(&self, block: Block) {
        if block.is_empty() {
            return;
        }
        let mut inner = self.inner.write().unwrap();
        let total = inner.nitems_sum.last().copied().unwrap_or(0);
        inner.nitems_sum.push(total + block.nitems());
        inner.size += block.len();
        inner.blocks.push(block);
    }
}

impl BlockSink for File {
    fn append_block(&mut self, block: Block) -> Result<()> {
        if block.is_empty() {
            return Ok(());
        }
        let mut inner = self.inner.write().unwrap();
        if inner.closed {
            return Err(Error::Closed("file"));
        }
        let total = inner.nitems_sum.last().copied().unwrap_or(0);
        inner.nitems_sum.push(total + block.nitems());
        inner.size += block.len();
        inner.blocks.push(block);
        Ok(())
    }

    fn close(&mut self) -> Result<()> {
        let mut inner = self.inner.write().unwrap();
        if inner.closed {
            return Err(Error::Closed("file"));
        }
        inner.closed = true;
        Ok(())
    }
}

impl fmt::Debug for File {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let inner = self.inner.read().unwrap();
        f.debug_struct("File")
            .field("num_blocks", &inner.blocks.len())
            .field("num_items", &inner.nitems_sum.last().copied().unwrap_or(0))
            .field("size", &inner.size)
            .field("closed", &inner.closed)
            .finish()
    }
}

/// A block source reading a file front to back, leaving it intact.
#[derive(Debug)]
pub struct KeepFileBlockSource {
    file: File,
    next_block: usize,
    first_block: usize,
    /// When set, the data range of the first delivered block is advanced
    /// to this offset, dropping the partial item continued from the
    /// preceding block.
    first_item: Option<usize>,
}

impl KeepFileBlockSource {
    /// Start reading `file` at `first_block`, optionally shortening the
    /// first block's range to begin at `first_item`.
    pub fn new(file: File, first_block: usize, first_item: Option<usize>) -> Self {
        Self {
            file,
            next_block: first_block,
            first_block,
            first_item,
        }
    }
}

impl BlockSource for KeepFileBlockSource {
    fn next_block(&mut self) -> Option<Block> {
        let mut block = self.file.block(self.next_block)?;
        if self.next_block == self.first_block {
            if let Some(first_item) = self.first_item {
                block.set_begin(first_item);
            }
        }
        self.next_block += 1;
        Some(block)
    }
}

/// A block source that removes every delivered block from the file, and
/// clears the file when dropped.
#[derive(Debug)]
pub struct ConsumeFileBlockSource {
    file: File,
}

impl ConsumeFileBlockSource {
    /// Start consuming `file`.
    pub fn new(file: File) -> Self {
        Self { file }
    }
}

impl BlockSource for ConsumeFileBlockSource {
    fn next_block(&mut self) -> Option<Block> {
        let mut inner = self.file.inner.write().unwrap();
        if inner.blocks.is_empty() {
            return None;
        }
        Some(inner.blocks.remove(0))
    }
}

impl Drop for ConsumeFileBlockSource {
    fn drop(&mut self) {
        let mut inner = self.file.inner.write().unwrap();
        inner.blocks.clear();
        inner.nitems_sum.clear();
        inner.size = 0;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::block::BlockPool;

    fn file_of<T: Item>(values: &[T], block_size: usize, verify: bool) -> File {
        let file = File::new();
        let mut writer = file
            .writer(BlockPool::unbounded(), block_size)
            .unwrap()
            .with_verify(verify);
        for value in values {
            writer.append(value).unwrap();
        }
        writer.close().unwrap();
        file
    }

    #[test]
    fn test_string_round_trip() {
        let file = file_of(&[String::from("foo")], 1024, false);
        assert_eq!(file.num_items(), 1);
        let mut reader = file.keep_reader();
        assert_eq!(reader.next::<String>().unwrap(), "foo");
        assert!(!reader.has_next());
    }

    #[test]
    fn test_mixed_sequence() {
        let words: Vec<String> = ["what", "a", "wonderful", "world", "this", "could", "be"]
            .iter()
            .map(|s| s.to_string())
            .collect();
        let file = File::new();
        let mut writer = file.writer(BlockPool::unbounded(), 1024).unwrap();
        writer.append(&words).unwrap();
        writer.append(&42u32).unwrap();
        writer.close().unwrap();
        assert_eq!(file.num_items(), 2);

        let mut reader = file.keep_reader();
        assert_eq!(reader.next::<Vec<String>>().unwrap(), words);
        assert_eq!(reader.next::<u32>().unwrap(), 42);
        assert!(!reader.has_next());
    }

    #[test]
    fn test_keep_reader_rereads() {
        let values: Vec<u64> = (0..100).collect();
        let file = file_of(&values, 64, false);
        for _ in 0..2 {
            assert_eq!(file.keep_reader().read_complete::<u64>().unwrap(), values);
        }
        assert_eq!(file.num_items(), 100);
    }

    #[test]
    fn test_consume_reader_drains() {
        let values: Vec<u64> = (0..10).collect();
        let file = file_of(&values, 64, false);
        {
            let mut reader = file.consume_reader();
            assert_eq!(reader.next::<u64>().unwrap(), 0);
        }
        assert!(file.is_empty());
        assert_eq!(file.num_items(), 0);
    }

    #[test]
    fn test_seek_correctness() {
        // Fixed-size items, every index, across several block sizes that
        // force items to straddle boundaries.
        let values: Vec<u64> = (0..200).map(|i| i * 3).collect();
        for block_size in [5, 8, 23, 64, 4096] {
            let file = file_of(&values, block_size, false);
            for (k, expected) in values.iter().enumerate() {
                assert_eq!(file.item_at::<u64>(k, false).unwrap(), *expected);
            }
            assert!(file.item_at::<u64>(values.len(), false).is_err());
        }
    }

    #[test]
    fn test_seek_variable_size_items() {
        let values: Vec<String> = (0..60).map(|i| "x".repeat(i % 17)).collect();
        let file = file_of(&values, 32, false);
        for (k, expected) in values.iter().enumerate() {
            assert_eq!(&file.item_at::<String>(k, false).unwrap(), expected);
        }
    }

    #[test]
    fn test_seek_with_verify() {
        let values: Vec<u32> = (0..50).collect();
        let file = file_of(&values, 16, true);
        for (k, expected) in values.iter().enumerate() {
            assert_eq!(file.item_at::<u32>(k, true).unwrap(), *expected);
        }
    }

    #[test]
    fn test_type_mismatch_detected() {
        let file = file_of(&[7u64], 1024, true);
        let mut reader = file.keep_reader().with_verify(true);
        assert!(matches!(
            reader.next::<i64>(),
            Err(Error::TypeMismatch { .. })
        ));
    }

    #[test]
    fn test_index_of() {
        let values: Vec<u64> = (0..128).map(|i| i * 2).collect();
        let file = file_of(&values, 32, false);
        let index = file
            .index_of::<u64, _>(&86, false, |probe, value| probe.cmp(value))
            .unwrap();
        assert_eq!(index, 43);
        // A probe between two items lands on the next smaller one.
        let index = file
            .index_of::<u64, _>(&87, false, |probe, value| probe.cmp(value))
            .unwrap();
        assert_eq!(index, 43);
    }

    #[test]
    fn test_get_item_range() {
        let values: Vec<u64> = (0..100).collect();
        let file = file_of(&values, 24, false);
        let blocks = file.get_item_range::<u64>(13, 87, false).unwrap();
        assert_eq!(blocks.iter().map(Block::nitems).sum::<usize>(), 74);

        struct VecSource(std::collections::VecDeque<Block>);
        impl BlockSource for VecSource {
            fn next_block(&mut self) -> Option<Block> {
                self.0.pop_front()
            }
        }
        let mut reader = BlockReader::new(VecSource(blocks.into()));
        assert_eq!(
            reader.read_complete::<u64>().unwrap(),
            (13..87).collect::<Vec<u64>>()
        );
    }

    #[test]
    fn test_randomized_round_trip_and_seek() {
        use rand::Rng;
        use rand::SeedableRng;

        let mut rng = rand::rngs::StdRng::seed_from_u64(0x5eed);
        let values: Vec<(u64, String)> = (0..200)
            .map(|_| {
                let len = rng.gen_range(0..40);
                let text: String = (0..len).map(|_| rng.gen_range('a'..='z')).collect();
                (rng.gen(), text)
            })
            .collect();
        for block_size in [7, 33, 256] {
            let file = file_of(&values, block_size, false);
            assert_eq!(
                file.keep_reader()
                    .read_complete::<(u64, String)>()
                    .unwrap(),
                values
            );
            for _ in 0..20 {
                let index = rng.gen_range(0..values.len());
                assert_eq!(
                    file.item_at::<(u64, String)>(index, false).unwrap(),
                    values[index]
                );
            }
        }
    }

    #[test]
    fn test_append_after_close_fails() {
        let file = file_of(&[1u8], 16, false);
        assert!(file.closed());
        let mut handle = file.clone();
        let pool = BlockPool::unbounded();
        let mut bytes = pool.allocate(4).unwrap();
        bytes.extend_from_slice(&[0, 0, 0, 0]);
        let block = Block::new(bytes.freeze(), 0, 4, 0, 1);
        assert!(matches!(
            handle.append_block(block),
            Err(Error::Closed("file"))
        ));
    }
}
