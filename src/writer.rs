/*
 * Copyright (c) Meta Platforms, Inc. and affiliates.
 * All rights reserved.
 *
 * This source code is licensed under the BSD-style license found in the
 * LICENSE file in the root directory of this source tree.
 */

//! The block writer.
//!
//! A [`BlockWriter`] accumulates serialized items (or raw bytes) into its
//! current byte block. It counts the items begun in the block and the
//! offset of the first one; when the block runs full it is emitted to the
//! attached [`BlockSink`] and a fresh block is allocated. Items are
//! segmented across block boundaries transparently.

use crate::block::Block;
use crate::block::BlockPool;
use crate::block::ByteBlockMut;
use crate::error::Error;
use crate::error::Result;
use crate::item::Item;
use crate::item::ItemWriter;
use crate::sink::BlockSink;

/// Writes items into blocks and emits completed blocks to a sink.
#[derive(Debug)]
pub struct BlockWriter<S: BlockSink> {
    sink: S,
    pool: BlockPool,
    block_size: usize,
    verify: bool,

    /// The block under construction. `Some` until the writer is closed.
    bytes: Option<ByteBlockMut>,
    /// Number of items begun in the current block.
    nitems: usize,
    /// Offset of the first item begun in the current block.
    first_offset: usize,
    closed: bool,
}

impl<S: BlockSink> BlockWriter<S> {
    /// Start writing blocks of `block_size` bytes into `sink`.
    pub fn new(sink: S, pool: BlockPool, block_size: usize) -> Result<Self> {
        assert!(block_size > 0);
        let bytes = pool.allocate(block_size)?;
        Ok(Self {
            sink,
            pool,
            block_size,
            verify: false,
            bytes: Some(bytes),
            nitems: 0,
            first_offset: 0,
            closed: false,
        })
    }

    /// Enable or disable the self-verify fingerprint prefix on appended
    /// items.
    pub fn with_verify(mut self, verify: bool) -> Self {
        self.verify = verify;
        self
    }

    /// Whether the writer has been closed.
    pub fn closed(&self) -> bool {
        self.closed
    }

    /// Access the attached sink.
    pub fn sink(&self) -> &S {
        &self.sink
    }

    /// Append a complete item: marks the boundary, optionally writes the
    /// type fingerprint, then the item's encoding.
    pub fn append<T: Item>(&mut self, value: &T) -> Result<()> {
        self.mark_item()?;
        if self.verify {
            self.put_raw(&T::typehash().to_ne_bytes())?;
        }
        value.serialize(self)
    }

    /// Mark the boundary between two items. Must be called exactly once
    /// before each item's bytes.
    pub fn mark_item(&mut self) -> Result<()> {
        let Some(bytes) = self.bytes.as_ref() else {
            return Err(Error::Closed("block writer"));
        };
        if bytes.remaining() == 0 {
            self.flush()?;
        }
        // Invariant: self.bytes is Some after a successful flush.
        if let Some(bytes) = self.bytes.as_ref() {
            if self.nitems == 0 {
                self.first_offset = bytes.len();
            }
        }
        self.nitems += 1;
        Ok(())
    }

    /// Emit the current block (if it holds any bytes) and start a new
    /// one. Only really meaningful for network sinks, which transmit a
    /// block per flush.
    pub fn flush(&mut self) -> Result<()> {
        let Some(bytes) = self.bytes.take() else {
            return Err(Error::Closed("block writer"));
        };
        if !bytes.is_empty() || self.nitems > 0 {
            let len = bytes.len();
            let block = Block::new(bytes.freeze(), 0, len, self.first_offset, self.nitems);
            self.sink.append_block(block)?;
        }
        self.nitems = 0;
        self.first_offset = 0;
        self.bytes = Some(self.pool.allocate(self.block_size)?);
        Ok(())
    }

    /// Forward pre-built blocks directly to the sink, after flushing the
    /// block under construction. Used for zero-copy forwarding of item
    /// ranges.
    pub fn append_blocks(&mut self, blocks: impl IntoIterator<Item = Block>) -> Result<()> {
        if self.bytes.is_none() {
            return Err(Error::Closed("block writer"));
        }
        self.flush()?;
        for block in blocks {
            self.sink.append_block(block)?;
        }
        Ok(())
    }

    /// Flush the final partial block (even one holding only the
    /// continuation of a previous item) and close the sink. Further
    /// operations fail with [`Error::Closed`].
    pub fn close(&mut self) -> Result<()> {
        if self.closed {
            return Err(Error::Closed("block writer"));
        }
        self.closed = true;
        if let Some(bytes) = self.bytes.take() {
            if !bytes.is_empty() || self.nitems > 0 {
                let len = bytes.len();
                let block = Block::new(bytes.freeze(), 0, len, self.first_offset, self.nitems);
                self.sink.append_block(block)?;
            }
        }
        self.nitems = 0;
        self.sink.close()
    }
}

impl<S: BlockSink> ItemWriter for BlockWriter<S> {
    fn put_raw(&mut self, data: &[u8]) -> Result<()> {
        let mut data = data;
        loop {
            let Some(bytes) = self.bytes.as_mut() else {
                return Err(Error::Closed("block writer"));
            };
            let remaining = bytes.remaining();
            if data.len() <= remaining {
                bytes.extend_from_slice(data);
                return Ok(());
            }
            // Partial copy up to the block boundary, then spill.
            bytes.extend_from_slice(&data[..remaining]);
            data = &data[remaining..];
            self.flush()?;
        }
    }
}

impl<S: BlockSink> Drop for BlockWriter<S> {
    fn drop(&mut self) {
        if !self.closed {
            // Flush the trailing partial block on destruction.
            if let Err(err) = self.close() {
                tracing::warn!(error = %err, "failed to close block writer on drop");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sink::DiscardSink;

    #[test]
    fn test_append_and_close() {
        let pool = BlockPool::unbounded();
        let mut writer = BlockWriter::new(DiscardSink::new(), pool, 16).unwrap();
        for i in 0..100u64 {
            writer.append(&i).unwrap();
        }
        writer.close().unwrap();
        // 100 items of 8 bytes in 16-byte blocks.
        assert_eq!(writer.sink().num_items(), 100);
        assert_eq!(writer.sink().num_blocks(), 50);
        assert_eq!(writer.sink().num_bytes(), 800);
        assert!(writer.sink().closed());
    }

    #[test]
    fn test_items_span_blocks() {
        let pool = BlockPool::unbounded();
        // Block size 5 forces every u64 to straddle a boundary.
        let mut writer = BlockWriter::new(DiscardSink::new(), pool, 5).unwrap();
        writer.append(&0x0102030405060708u64).unwrap();
        writer.append(&0x1112131415161718u64).unwrap();
        writer.close().unwrap();
        assert_eq!(writer.sink().num_bytes(), 16);
        assert_eq!(writer.sink().num_items(), 2);
    }

    #[test]
    fn test_closed_writer_rejects_appends() {
        let pool = BlockPool::unbounded();
        let mut writer = BlockWriter::new(DiscardSink::new(), pool, 16).unwrap();
        writer.close().unwrap();
        assert!(matches!(writer.append(&1u32), Err(Error::Closed(_))));
        assert!(matches!(writer.close(), Err(Error::Closed(_))));
    }

    #[test]
    fn test_out_of_memory_surfaces() {
        #[derive(Default)]
        struct KeepSink {
            blocks: Vec<Block>,
        }
        impl BlockSink for KeepSink {
            fn append_block(&mut self, block: Block) -> Result<()> {
                self.blocks.push(block);
                Ok(())
            }
            fn close(&mut self) -> Result<()> {
                Ok(())
            }
        }

        let pool = BlockPool::new(Some(16));
        let mut writer = BlockWriter::new(KeepSink::default(), pool, 16).unwrap();
        for i in 0..2u64 {
            writer.append(&i).unwrap();
        }
        // The sink retains the emitted block, so allocating the next one
        // exceeds the pool limit.
        assert!(matches!(
            writer.append(&2u64),
            Err(Error::OutOfMemory { .. })
        ));
        assert_eq!(writer.sink().blocks.len(), 1);
    }
}
