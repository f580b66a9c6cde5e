/*
 * Copyright (c) Meta Platforms, Inc. and affiliates.
 * All rights reserved.
 *
 * This source code is licensed under the BSD-style license found in the
 * LICENSE file in the root directory of this source tree.
 */

//! The block reader.
//!
//! A [`BlockReader`] pulls [`Block`]s from a [`BlockSource`] and
//! reassembles items from them, fetching the next block when the current
//! one underruns and stitching together items split across block
//! boundaries. For fixed-size item types with a known position it can
//! skip items without deserializing them, and it can hand out ranges of
//! items as zero-copy block views for direct forwarding.

use std::collections::VecDeque;
use std::sync::Arc;

use crate::block::Block;
use crate::block::ByteBlockPtr;
use crate::error::Error;
use crate::error::Result;
use crate::item::Item;
use crate::item::ItemReader;

/// A producer of blocks, one at a time. `None` signals end-of-stream.
pub trait BlockSource {
    /// Produce the next block, or `None` at end-of-stream.
    fn next_block(&mut self) -> Option<Block>;
}

/// Reads items from a sequence of blocks delivered by a source.
#[derive(Debug)]
pub struct BlockReader<S: BlockSource> {
    source: S,

    /// Byte block backing the current cursor position.
    block: Option<ByteBlockPtr>,
    /// Cursor, absolute within the current byte block.
    current: usize,
    /// End of the valid range, absolute within the current byte block.
    end: usize,
    /// Absolute offset of the first item of the current block.
    first_item: usize,
    /// Items starting at or after the cursor in the current block.
    nitems: usize,

    verify: bool,
}

impl<S: BlockSource> BlockReader<S> {
    /// Start reading from `source`.
    pub fn new(source: S) -> Self {
        Self {
            source,
            block: None,
            current: 0,
            end: 0,
            first_item: 0,
            nitems: 0,
            verify: false,
        }
    }

    /// Enable or disable checking of self-verify fingerprints. Must match
    /// the writer's setting.
    pub fn with_verify(mut self, verify: bool) -> Self {
        self.verify = verify;
        self
    }

    /// Access the enclosed source.
    pub fn source(&self) -> &S {
        &self.source
    }

    /// Returns true if at least one more byte is available, transparently
    /// advancing over empty continuation blocks.
    pub fn has_next(&mut self) -> bool {
        while self.current == self.end {
            if !self.fetch_next_block() {
                return false;
            }
        }
        true
    }

    /// Consume exactly one item. In self-verify mode, the item's
    /// fingerprint is read first and checked against `T`.
    pub fn next<T: Item>(&mut self) -> Result<T> {
        if !self.has_next() {
            return Err(Error::underflow(1, 0));
        }
        self.nitems = self.nitems.saturating_sub(1);
        if self.verify {
            let mut bytes = [0u8; 8];
            self.read_raw(&mut bytes)?;
            let found = u64::from_ne_bytes(bytes);
            if found != T::typehash() {
                return Err(Error::TypeMismatch {
                    expected_type: T::typename(),
                    expected: T::typehash(),
                    found,
                });
            }
        }
        T::deserialize(self)
    }

    /// Drain the remaining items into a vector. Test and debugging aid;
    /// the result must fit in memory.
    pub fn read_complete<T: Item>(&mut self) -> Result<Vec<T>> {
        let mut out = Vec::new();
        while self.has_next() {
            out.push(self.next::<T>()?);
        }
        Ok(out)
    }

    /// Skip `items` items occupying exactly `bytes` bytes. Fast path for
    /// fixed-size item types; the cursor must sit on an item boundary.
    pub fn skip(&mut self, items: usize, bytes: usize) -> Result<()> {
        let mut remaining = bytes;
        let mut items = items;
        while self.current + remaining > self.end {
            remaining -= self.end - self.current;
            // Every item starting in the rest of this block is skipped.
            items = items.saturating_sub(self.nitems);
            self.nitems = 0;
            if !self.fetch_next_block() {
                return Err(Error::underflow(remaining, 0));
            }
        }
        self.current += remaining;
        self.nitems = self.nitems.saturating_sub(items);
        Ok(())
    }

    /// Take out up to `n` items as zero-copy [`Block`] views sharing the
    /// source's byte blocks, advancing the cursor past them. Fewer views
    /// cover fewer items only when the stream ends early.
    pub fn get_item_batch<T: Item>(&mut self, n: usize) -> Result<Vec<Block>> {
        let mut out = Vec::new();
        let mut n = n;
        if n == 0 {
            return Ok(out);
        }
        while self.current == self.end {
            if !self.fetch_next_block() {
                return Ok(out);
            }
        }

        let mut begin_output = self.current;
        let mut first_output = self.current;

        if n >= self.nitems {
            // Emit the remainder of the current block as a partial view;
            // the cursor sits on an item boundary, so the first item is
            // right at it.
            out.push(Block::new(
                self.byte_block()?,
                self.current,
                self.end,
                self.current,
                self.nitems,
            ));
            n -= self.nitems;
            self.nitems = 0;
            if !self.fetch_next_block() {
                return Ok(out);
            }

            // Forward whole blocks without touching their items.
            while n >= self.nitems {
                out.push(Block::new(
                    self.byte_block()?,
                    self.current,
                    self.end,
                    self.first_item,
                    self.nitems,
                ));
                n -= self.nitems;
                self.nitems = 0;
                if !self.fetch_next_block() {
                    return Ok(out);
                }
            }

            // The final view must include the partial item continued at
            // the front of this block; items are consumed from the first
            // whole one.
            begin_output = self.current;
            first_output = self.first_item;
            self.current = self.first_item;
        }

        // Deserialize-and-drop the last items to find their byte extent.
        let last_items = n;
        let block = self.byte_block()?;
        while n > 0 {
            self.next::<T>()?;
            n -= 1;
        }
        debug_assert!(Arc::ptr_eq(&block, &self.byte_block()?));
        out.push(Block::new(
            block,
            begin_output,
            self.current,
            first_output,
            last_items,
        ));
        Ok(out)
    }

    fn byte_block(&self) -> Result<ByteBlockPtr> {
        match &self.block {
            Some(block) => Ok(Arc::clone(block)),
            None => Err(Error::underflow(1, 0)),
        }
    }

    fn fetch_next_block(&mut self) -> bool {
        match self.source.next_block() {
            Some(block) => {
                self.current = block.begin();
                self.end = block.end();
                self.first_item = block.first_item();
                self.nitems = block.nitems();
                self.block = Some(block.into_byte_block());
                true
            }
            None => {
                self.block = None;
                self.current = 0;
                self.end = 0;
                false
            }
        }
    }
}

impl<S: BlockSource> ItemReader for BlockReader<S> {
    fn read_raw(&mut self, out: &mut [u8]) -> Result<()> {
        let mut pos = 0;
        while pos < out.len() {
            if self.current == self.end {
                if !self.fetch_next_block() {
                    return Err(Error::underflow(out.len(), pos));
                }
                continue;
            }
            let take = (out.len() - pos).min(self.end - self.current);
            let Some(block) = &self.block else {
                return Err(Error::underflow(out.len(), pos));
            };
            out[pos..pos + take].copy_from_slice(&block.data()[self.current..self.current + take]);
            self.current += take;
            pos += take;
        }
        Ok(())
    }
}

/// Chains several block sources, exhausting each in turn.
#[derive(Debug)]
pub struct ConcatBlockSource<S: BlockSource> {
    sources: VecDeque<S>,
}

impl<S: BlockSource> ConcatBlockSource<S> {
    /// Concatenate `sources` in order.
    pub fn new(sources: Vec<S>) -> Self {
        Self {
            sources: sources.into(),
        }
    }
}

impl<S: BlockSource> BlockSource for ConcatBlockSource<S> {
    fn next_block(&mut self) -> Option<Block> {
        while let Some(source) = self.sources.front_mut() {
            if let Some(block) = source.next_block() {
                return Some(block);
            }
            self.sources.pop_front();
        }
        None
    }
}

/// A reader with one item of lookahead, for merge-style consumers that
/// need to inspect the next item before committing to consume it.
#[derive(Debug)]
pub struct BufferedBlockReader<T: Item, S: BlockSource> {
    reader: BlockReader<S>,
    current: Option<T>,
}

impl<T: Item, S: BlockSource> BufferedBlockReader<T, S> {
    /// Start reading from `source`, buffering the first item.
    pub fn new(source: S, verify: bool) -> Result<Self> {
        let mut buffered = Self {
            reader: BlockReader::new(source).with_verify(verify),
            current: None,
        };
        buffered.advance()?;
        Ok(buffered)
    }

    /// Whether an item is buffered.
    pub fn has_value(&self) -> bool {
        self.current.is_some()
    }

    /// The buffered item, if any.
    pub fn value(&self) -> Option<&T> {
        self.current.as_ref()
    }

    /// Move to the next item. Returns whether one is available.
    pub fn advance(&mut self) -> Result<bool> {
        self.current = if self.reader.has_next() {
            Some(self.reader.next::<T>()?)
        } else {
            None
        };
        Ok(self.has_value())
    }
}
