/*
 * Copyright (c) Meta Platforms, Inc. and affiliates.
 * All rights reserved.
 *
 * This source code is licensed under the BSD-style license found in the
 * LICENSE file in the root directory of this source tree.
 */

//! Byte blocks and the item-aware views over them.
//!
//! A [`ByteBlock`] is an immutable, reference-counted run of bytes,
//! written once by a [`crate::writer::BlockWriter`] and then shared
//! read-only between files, queues, and channels. A [`Block`] is a view
//! `(byte_block, begin, end, first_item, nitems)` annotating a sub-range
//! of a byte block with item boundary metadata:
//!
//! ```text
//!     +--+---------+---------+-------------+---------+-----+
//!     |  |Item1    |Item2    |Item3        |Item4    |Item5| (partial)
//!     +--+---------+---------+-------------+---------+-----+
//!        ^         ^                                       ^
//!        begin     first_item        nitems=5              end
//! ```
//!
//! Items may span past `end` into the following block; `nitems` counts
//! the items whose first byte lies in `[first_item, end)`. Multiple
//! blocks can share one byte block with different book-keeping.
//!
//! Allocation goes through a [`BlockPool`], which tracks the total bytes
//! of live blocks and can enforce an upper bound.

use std::fmt;
use std::sync::atomic::AtomicUsize;
use std::sync::atomic::Ordering;
use std::sync::Arc;

use bytes::Bytes;
use bytes::BytesMut;

use crate::error::Error;
use crate::error::Result;

/// Default size of byte blocks in files, queues, and channels.
pub const DEFAULT_BLOCK_SIZE: usize = 2 * 1024 * 1024;

struct PoolInner {
    limit: Option<usize>,
    in_use: AtomicUsize,
}

/// Tracks the total size of live byte blocks and hands out new ones.
/// Cloning yields another handle onto the same accounting state.
#[derive(Clone)]
pub struct BlockPool {
    inner: Arc<PoolInner>,
}

impl BlockPool {
    /// Create a pool enforcing the given byte limit, or unbounded when
    /// `limit` is `None`.
    pub fn new(limit: Option<usize>) -> Self {
        Self {
            inner: Arc::new(PoolInner {
                limit,
                in_use: AtomicUsize::new(0),
            }),
        }
    }

    /// Create a pool without a byte limit.
    pub fn unbounded() -> Self {
        Self::new(None)
    }

    /// Total bytes of live blocks allocated from this pool.
    pub fn in_use(&self) -> usize {
        self.inner.in_use.load(Ordering::Relaxed)
    }

    /// Allocate a writable byte block of `size` bytes. Fails with
    /// [`Error::OutOfMemory`] when the allocation would exceed the pool
    /// limit.
    pub fn allocate(&self, size: usize) -> Result<ByteBlockMut> {
        let guard = self.reserve(size)?;
        Ok(ByteBlockMut {
            buf: BytesMut::with_capacity(size),
            capacity: size,
            guard,
        })
    }

    /// Take ownership of an externally produced byte buffer, accounting
    /// it against this pool. Used for payloads read off the network.
    pub fn adopt(&self, data: Bytes) -> Result<ByteBlockPtr> {
        let guard = self.reserve(data.len())?;
        Ok(Arc::new(ByteBlock {
            data,
            _guard: guard,
        }))
    }

    fn reserve(&self, size: usize) -> Result<AllocGuard> {
        let previous = self.inner.in_use.fetch_add(size, Ordering::Relaxed);
        if let Some(limit) = self.inner.limit {
            if previous + size > limit {
                self.inner.in_use.fetch_sub(size, Ordering::Relaxed);
                return Err(Error::OutOfMemory {
                    requested: size,
                    limit,
                });
            }
        }
        Ok(AllocGuard {
            pool: Arc::clone(&self.inner),
            size,
        })
    }
}

impl Default for BlockPool {
    fn default() -> Self {
        Self::unbounded()
    }
}

impl fmt::Debug for BlockPool {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BlockPool")
            .field("limit", &self.inner.limit)
            .field("in_use", &self.in_use())
            .finish()
    }
}

/// Releases the accounted bytes when the owning block is dropped.
struct AllocGuard {
    pool: Arc<PoolInner>,
    size: usize,
}

impl Drop for AllocGuard {
    fn drop(&mut self) {
        self.pool.in_use.fetch_sub(self.size, Ordering::Relaxed);
    }
}

/// The writer-private, mutable stage of a byte block. Frozen into an
/// immutable [`ByteBlock`] when the producing writer flushes it.
pub struct ByteBlockMut {
    buf: BytesMut,
    capacity: usize,
    guard: AllocGuard,
}

impl ByteBlockMut {
    /// The fixed capacity this block was allocated with.
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Number of bytes written so far.
    pub fn len(&self) -> usize {
        self.buf.len()
    }

    /// Whether no bytes have been written yet.
    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    /// Remaining writable bytes.
    pub fn remaining(&self) -> usize {
        self.capacity - self.buf.len()
    }

    /// Append bytes. The caller must not exceed the remaining capacity.
    pub fn extend_from_slice(&mut self, data: &[u8]) {
        debug_assert!(data.len() <= self.remaining());
        self.buf.extend_from_slice(data);
    }

    /// Freeze into an immutable, shareable byte block.
    pub fn freeze(self) -> ByteBlockPtr {
        Arc::new(ByteBlock {
            data: self.buf.freeze(),
            _guard: self.guard,
        })
    }
}

impl fmt::Debug for ByteBlockMut {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ByteBlockMut")
            .field("len", &self.len())
            .field("capacity", &self.capacity)
            .finish()
    }
}

/// An immutable run of bytes with shared ownership. Destroying the last
/// holder releases the bytes back to the pool's accounting.
pub struct ByteBlock {
    data: Bytes,
    _guard: AllocGuard,
}

/// Shared handle to a [`ByteBlock`].
pub type ByteBlockPtr = Arc<ByteBlock>;

impl ByteBlock {
    /// The block's bytes.
    pub fn data(&self) -> &[u8] {
        &self.data
    }

    /// The block's size in bytes.
    pub fn len(&self) -> usize {
        self.data.len()
    }

    /// Whether the block is empty.
    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    pub(crate) fn slice(&self, begin: usize, end: usize) -> Bytes {
        self.data.slice(begin..end)
    }
}

impl fmt::Debug for ByteBlock {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ByteBlock")
            .field("len", &self.len())
            .finish()
    }
}

/// A view over a shared [`ByteBlock`] annotated with item boundaries.
#[derive(Clone)]
pub struct Block {
    bytes: ByteBlockPtr,
    begin: usize,
    end: usize,
    first_item: usize,
    nitems: usize,
}

impl Block {
    /// Build a view over `bytes`. `begin..end` is the valid byte range,
    /// `first_item` the absolute offset of the first item that starts in
    /// the range, and `nitems` the number of items starting in
    /// `[first_item, end)`.
    pub fn new(
        bytes: ByteBlockPtr,
        begin: usize,
        end: usize,
        first_item: usize,
        nitems: usize,
    ) -> Self {
        debug_assert!(begin <= first_item);
        debug_assert!(first_item <= end);
        debug_assert!(end <= bytes.len());
        Self {
            bytes,
            begin,
            end,
            first_item,
            nitems,
        }
    }

    /// The underlying shared byte block.
    pub fn byte_block(&self) -> &ByteBlockPtr {
        &self.bytes
    }

    /// Consume the view, returning the underlying byte block.
    pub fn into_byte_block(self) -> ByteBlockPtr {
        self.bytes
    }

    /// The valid bytes of this view.
    pub fn data(&self) -> &[u8] {
        &self.bytes.data()[self.begin..self.end]
    }

    /// The view's payload as a cheaply cloned byte handle.
    pub fn payload(&self) -> Bytes {
        self.bytes.slice(self.begin, self.end)
    }

    /// Length of the valid byte range.
    pub fn len(&self) -> usize {
        self.end - self.begin
    }

    /// Whether the valid byte range is empty.
    pub fn is_empty(&self) -> bool {
        self.begin == self.end
    }

    /// Absolute begin offset of the valid range.
    pub fn begin(&self) -> usize {
        self.begin
    }

    /// Absolute end offset of the valid range.
    pub fn end(&self) -> usize {
        self.end
    }

    /// Number of items starting in this view.
    pub fn nitems(&self) -> usize {
        self.nitems
    }

    /// Absolute offset of the first item starting in this view.
    pub fn first_item(&self) -> usize {
        self.first_item
    }

    /// Offset of the first item relative to `begin`.
    pub fn first_item_relative(&self) -> usize {
        self.first_item - self.begin
    }

    /// Move the begin of the valid range forward, e.g. to drop the
    /// partial tail of an item continued from the previous block.
    pub fn set_begin(&mut self, begin: usize) {
        debug_assert!(begin <= self.first_item);
        self.begin = begin;
    }
}

impl fmt::Debug for Block {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Block")
            .field("begin", &self.begin)
            .field("end", &self.end)
            .field("first_item", &self.first_item)
            .field("nitems", &self.nitems)
            .finish()
    }
}
