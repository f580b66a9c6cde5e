/*
 * Copyright (c) Meta Platforms, Inc. and affiliates.
 * All rights reserved.
 *
 * This source code is licensed under the BSD-style license found in the
 * LICENSE file in the root directory of this source tree.
 */

//! The block queue: ordered hand-over of blocks between threads.
//!
//! A [`BlockQueue`] carries blocks from one producer to one consumer.
//! The producer side is a [`BlockSink`] (so a writer can emit into it);
//! the consumer side blocks on [`BlockQueue::pop`] until a block arrives
//! or the writing side closes. The multiplexer uses these queues to park
//! received blocks until the destination worker picks them up.
//!
//! The caching variant tees every block into a companion [`File`], so
//! that the stream can be replayed after the queue is drained.

use std::collections::VecDeque;
use std::sync::atomic::AtomicBool;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::sync::Condvar;
use std::sync::Mutex;

use crate::block::Block;
use crate::block::BlockPool;
use crate::error::Result;
use crate::file::File;
use crate::file::KeepFileBlockSource;
use crate::reader::BlockReader;
use crate::reader::BlockSource;
use crate::sink::BlockSink;
use crate::writer::BlockWriter;

#[derive(Default)]
struct QueueState {
    blocks: VecDeque<Block>,
    write_closed: bool,
}

#[derive(Default)]
struct QueueInner {
    state: Mutex<QueueState>,
    available: Condvar,
    /// Set once a pop has observed the close sentinel.
    read_closed: AtomicBool,
}

/// An ordered queue of blocks with a write-closed flag. One producer and
/// one consumer expected. Cloning yields another handle to the same
/// queue.
#[derive(Clone, Default)]
pub struct BlockQueue {
    inner: Arc<QueueInner>,
}

impl BlockQueue {
    /// Create an empty, open queue.
    pub fn new() -> Self {
        Self::default()
    }

    /// Enqueue a block and wake a waiting reader.
    pub fn append(&self, block: Block) {
        let mut state = self.inner.state.lock().unwrap();
        debug_assert!(!state.write_closed);
        state.blocks.push_back(block);
        self.inner.available.notify_one();
    }

    /// Mark the writing side closed and wake all waiting readers.
    /// Idempotent.
    pub fn close_write(&self) {
        let mut state = self.inner.state.lock().unwrap();
        state.write_closed = true;
        self.inner.available.notify_all();
    }

    /// Dequeue the next block, blocking while the queue is empty and not
    /// write-closed. Returns `None` once the queue is drained and closed.
    pub fn pop(&self) -> Option<Block> {
        let mut state = self.inner.state.lock().unwrap();
        loop {
            if let Some(block) = state.blocks.pop_front() {
                return Some(block);
            }
            if state.write_closed {
                self.inner.read_closed.store(true, Ordering::Relaxed);
                return None;
            }
            state = self.inner.available.wait(state).unwrap();
        }
    }

    /// Whether the writing side has closed the queue.
    pub fn write_closed(&self) -> bool {
        self.inner.state.lock().unwrap().write_closed
    }

    /// Whether a pop has already observed the end of the queue.
    pub fn read_closed(&self) -> bool {
        self.inner.read_closed.load(Ordering::Relaxed)
    }

    /// Whether the queue currently holds no blocks.
    pub fn is_empty(&self) -> bool {
        self.inner.state.lock().unwrap().blocks.is_empty()
    }

    /// Number of queued blocks. Debugging aid; racy by nature.
    pub fn len(&self) -> usize {
        self.inner.state.lock().unwrap().blocks.len()
    }

    /// Get a writer emitting into this queue.
    pub fn writer(&self, pool: BlockPool, block_size: usize) -> Result<BlockWriter<BlockQueue>> {
        BlockWriter::new(self.clone(), pool, block_size)
    }

    /// Get a reader consuming this queue. Each block is delivered only
    /// once.
    pub fn reader(&self) -> BlockReader<BlockQueueSource> {
        BlockReader::new(BlockQueueSource::new(self.clone()))
    }
}

impl BlockSink for BlockQueue {
    fn append_block(&mut self, block: Block) -> Result<()> {
        self.append(block);
        Ok(())
    }

    fn close(&mut self) -> Result<()> {
        self.close_write();
        Ok(())
    }
}

impl std::fmt::Debug for BlockQueue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.inner.state.lock().unwrap();
        f.debug_struct("BlockQueue")
            .field("len", &state.blocks.len())
            .field("write_closed", &state.write_closed)
            .finish()
    }
}

/// A block source taking blocks out of a queue; the queue can be read
/// only once.
#[derive(Debug)]
pub struct BlockQueueSource {
    queue: BlockQueue,
    done: bool,
}

impl BlockQueueSource {
    /// Start reading from `queue`.
    pub fn new(queue: BlockQueue) -> Self {
        Self { queue, done: false }
    }
}

impl BlockSource for BlockQueueSource {
    fn next_block(&mut self) -> Option<Block> {
        if self.done {
            return None;
        }
        match self.queue.pop() {
            Some(block) => Some(block),
            None => {
                self.done = true;
                None
            }
        }
    }
}

/// A block source that drains a queue while caching every block into a
/// file. If the queue was already fully consumed when the source is
/// created, blocks are replayed from the file instead.
#[derive(Debug)]
pub struct CachingBlockQueueSource {
    from_queue: bool,
    queue: BlockQueueSource,
    file_source: KeepFileBlockSource,
    cache: File,
}

impl CachingBlockQueueSource {
    /// Read from `queue`, caching into `cache`; replay from `cache` when
    /// the queue has already been consumed.
    pub fn new(queue: BlockQueue, cache: File) -> Self {
        let from_queue = !queue.read_closed();
        Self {
            from_queue,
            queue: BlockQueueSource::new(queue),
            file_source: KeepFileBlockSource::new(cache.clone(), 0, None),
            cache,
        }
    }
}

impl BlockSource for CachingBlockQueueSource {
    fn next_block(&mut self) -> Option<Block> {
        if self.from_queue {
            let block = self.queue.next_block()?;
            self.cache.cache_block(block.clone());
            Some(block)
        } else {
            self.file_source.next_block()
        }
    }
}
