/*
 * Copyright (c) Meta Platforms, Inc. and affiliates.
 * All rights reserved.
 *
 * This source code is licensed under the BSD-style license found in the
 * LICENSE file in the root directory of this source tree.
 */

//! Channels: per-destination block streams bundled under one id.
//!
//! A [`Channel`] is a worker's view of one data exchange with every
//! other worker. Outbound, it provides one [`crate::writer::BlockWriter`]
//! per destination: the writers for remote workers frame each flushed
//! block with a [`StreamBlockHeader`] and hand it to the peer
//! connection, while writers for workers on the same host short-circuit
//! into the destination endpoint's inbound queue. Inbound, the channel
//! owns one [`BlockQueue`] per source worker, filled by the multiplexer
//! as framed blocks arrive.
//!
//! Closing is a barrier: the worker closes all outbound sinks (each
//! emitting the end-of-stream sentinel), then waits until every inbound
//! queue has observed its sender's sentinel.

use std::sync::atomic::AtomicBool;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;

use crate::block::Block;
use crate::block::BlockPool;
use crate::config::Config;
use crate::error::Result;
use crate::file::File;
use crate::item::Item;
use crate::mux::header::StreamBlockHeader;
use crate::mux::MuxInner;
use crate::net::dispatcher::Connection;
use crate::queue::BlockQueue;
use crate::queue::BlockQueueSource;
use crate::queue::CachingBlockQueueSource;
use crate::reader::BlockReader;
use crate::reader::ConcatBlockSource;
use crate::sink::BlockSink;
use crate::writer::BlockWriter;

/// The host-side state of a channel wire id: the inbound block queues
/// (indexed by global source worker rank) and the per-source cache files
/// backing replayable readers.
pub(crate) struct ChannelEndpoint {
    pub(crate) id: u64,
    pub(crate) queues: Vec<BlockQueue>,
    pub(crate) cache_files: Vec<File>,
}

impl ChannelEndpoint {
    pub(crate) fn new(id: u64, num_workers: usize) -> Self {
        Self {
            id,
            queues: (0..num_workers).map(|_| BlockQueue::new()).collect(),
            cache_files: (0..num_workers).map(|_| File::new()).collect(),
        }
    }
}

/// Block sink sending framed blocks to one remote worker over the
/// host's connection to that worker's host.
#[derive(Clone, Debug)]
pub struct ChannelSink {
    connection: Connection,
    channel_id: u64,
    sender_rank: u64,
    closed: Arc<AtomicBool>,
}

impl ChannelSink {
    fn new(connection: Connection, channel_id: u64, sender_rank: u64) -> Self {
        Self {
            connection,
            channel_id,
            sender_rank,
            closed: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Frame and transmit `block`. Transmission is asynchronous; the
    /// bytes are shared with the caller until the write drains.
    fn append(&self, block: &Block) {
        if block.is_empty() {
            return;
        }
        let header = StreamBlockHeader::for_block(self.channel_id, self.sender_rank, block);
        tracing::trace!(
            channel = self.channel_id,
            sender = self.sender_rank,
            bytes = header.bytes,
            nitems = header.nitems,
            "sending block"
        );
        self.connection
            .async_write(vec![header.encode(), block.payload()]);
    }

    /// Emit the end-of-stream sentinel, once.
    fn close(&self) {
        if !self.closed.swap(true, Ordering::AcqRel) {
            tracing::trace!(
                channel = self.channel_id,
                sender = self.sender_rank,
                "sending end of stream"
            );
            self.connection
                .async_write(vec![
                    StreamBlockHeader::end_of_stream(self.channel_id, self.sender_rank).encode(),
                ]);
        }
    }

    fn closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }
}

/// The per-destination outbound sink of a channel: either a direct link
/// to a local inbound queue, or a framing sink onto a peer connection.
#[derive(Clone, Debug)]
pub enum ChannelWriterSink {
    /// Destination worker lives on this host; blocks go straight into
    /// its endpoint's queue for our rank.
    Loopback(BlockQueue),
    /// Destination worker lives on a peer host.
    Net(ChannelSink),
}

impl ChannelWriterSink {
    fn close_if_open(&self) {
        match self {
            ChannelWriterSink::Loopback(queue) => queue.close_write(),
            ChannelWriterSink::Net(sink) => sink.close(),
        }
    }

    fn is_closed(&self) -> bool {
        match self {
            ChannelWriterSink::Loopback(queue) => queue.write_closed(),
            ChannelWriterSink::Net(sink) => sink.closed(),
        }
    }
}

impl BlockSink for ChannelWriterSink {
    fn append_block(&mut self, block: Block) -> Result<()> {
        match self {
            ChannelWriterSink::Loopback(queue) => queue.append(block),
            ChannelWriterSink::Net(sink) => sink.append(&block),
        }
        Ok(())
    }

    fn close(&mut self) -> Result<()> {
        self.close_if_open();
        Ok(())
    }
}

/// A worker's handle to one data exchange with all workers.
pub struct Channel {
    exchange: usize,
    /// Global rank of the owning worker.
    my_rank: usize,
    endpoint: Arc<ChannelEndpoint>,
    /// Outbound sinks by destination worker rank. Shared with the
    /// writers handed out by [`Channel::open_writers`].
    sinks: Vec<ChannelWriterSink>,
    pool: BlockPool,
    config: Config,
}

impl Channel {
    pub(crate) fn new(inner: &Arc<MuxInner>, exchange: usize, local_worker: usize) -> Self {
        let workers_per_host = inner.workers_per_host;
        let my_rank = inner.my_host_rank * workers_per_host + local_worker;
        let endpoint = inner.endpoint((exchange * workers_per_host + local_worker) as u64);

        let mut sinks = Vec::with_capacity(inner.num_workers());
        for dest in 0..inner.num_workers() {
            let dest_host = dest / workers_per_host;
            let dest_lane = dest % workers_per_host;
            let wire_id = (exchange * workers_per_host + dest_lane) as u64;
            if dest_host == inner.my_host_rank {
                let dest_endpoint = inner.endpoint(wire_id);
                sinks.push(ChannelWriterSink::Loopback(
                    dest_endpoint.queues[my_rank].clone(),
                ));
            } else {
                // Peer connections exist for every host but our own.
                let connection = inner.connections[dest_host]
                    .clone()
                    .unwrap_or_else(|| panic!("no connection to host {dest_host}"));
                sinks.push(ChannelWriterSink::Net(ChannelSink::new(
                    connection,
                    wire_id,
                    my_rank as u64,
                )));
            }
        }

        Self {
            exchange,
            my_rank,
            endpoint,
            sinks,
            pool: inner.pool.clone(),
            config: inner.config.clone(),
        }
    }

    /// The channel's sequence number.
    pub fn id(&self) -> usize {
        self.exchange
    }

    /// Global rank of the owning worker.
    pub fn my_rank(&self) -> usize {
        self.my_rank
    }

    /// Number of workers reachable through this channel.
    pub fn num_workers(&self) -> usize {
        self.sinks.len()
    }

    /// Open one block writer per destination worker. Writers buffer
    /// items into blocks of `block_size` bytes and transmit a block per
    /// flush. Open the writers only once per channel, or the block
    /// sequence would interleave; close every writer when done.
    pub fn open_writers(
        &self,
        block_size: usize,
    ) -> Result<Vec<BlockWriter<ChannelWriterSink>>> {
        self.sinks
            .iter()
            .map(|sink| {
                Ok(BlockWriter::new(sink.clone(), self.pool.clone(), block_size)?
                    .with_verify(self.config.self_verify))
            })
            .collect()
    }

    /// Open one reader per source worker, attached to the channel's
    /// inbound queues. Blocks until data arrives or the source closes.
    pub fn open_readers(&self) -> Vec<BlockReader<BlockQueueSource>> {
        self.endpoint
            .queues
            .iter()
            .map(|queue| {
                BlockReader::new(BlockQueueSource::new(queue.clone()))
                    .with_verify(self.config.self_verify)
            })
            .collect()
    }

    /// Open a single reader over all sources, delivering the items of
    /// each source in order, source by source in rank order.
    pub fn open_reader(&self) -> BlockReader<ConcatBlockSource<BlockQueueSource>> {
        let sources = self
            .endpoint
            .queues
            .iter()
            .map(|queue| BlockQueueSource::new(queue.clone()))
            .collect();
        BlockReader::new(ConcatBlockSource::new(sources)).with_verify(self.config.self_verify)
    }

    /// Like [`Channel::open_reader`], but every received block is also
    /// cached, so the call can be repeated to read the items again.
    pub fn open_caching_reader(
        &self,
    ) -> BlockReader<ConcatBlockSource<CachingBlockQueueSource>> {
        let sources = self
            .endpoint
            .queues
            .iter()
            .zip(&self.endpoint.cache_files)
            .map(|(queue, cache)| CachingBlockQueueSource::new(queue.clone(), cache.clone()))
            .collect();
        BlockReader::new(ConcatBlockSource::new(sources)).with_verify(self.config.self_verify)
    }

    /// Scatter a file: destination `d` receives the items
    /// `offsets[d-1]..offsets[d]` (with an implicit leading zero) as
    /// zero-copy block views. Offsets must be non-decreasing and cover
    /// every destination; all writers are closed afterwards.
    pub fn scatter<T: Item>(&self, source: &File, offsets: &[usize]) -> Result<()> {
        debug_assert_eq!(offsets.len(), self.num_workers());
        let mut writers = self.open_writers(self.config.block_size)?;
        let mut begin = 0;
        for (dest, writer) in writers.iter_mut().enumerate() {
            let end = offsets[dest];
            debug_assert!(begin <= end);
            if end > begin {
                let blocks = source.get_item_range::<T>(begin, end, self.config.self_verify)?;
                writer.append_blocks(blocks)?;
                begin = end;
            }
            writer.close()?;
        }
        Ok(())
    }

    /// Close the channel: emit the end-of-stream sentinel on every
    /// outbound sink not already closed by its writer, then wait until
    /// every inbound queue has observed its sender's sentinel.
    pub fn close(&self) {
        for sink in &self.sinks {
            if !sink.is_closed() {
                sink.close_if_open();
            }
        }
        for (source, queue) in self.endpoint.queues.iter().enumerate() {
            while !queue.write_closed() {
                tracing::trace!(
                    channel = self.exchange,
                    source,
                    "waiting for end of stream"
                );
                std::thread::sleep(Duration::from_millis(10));
            }
        }
    }

    /// Whether every inbound queue has observed its sender's sentinel.
    pub fn closed(&self) -> bool {
        self.endpoint.queues.iter().all(BlockQueue::write_closed)
    }
}

impl std::fmt::Debug for Channel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Channel")
            .field("exchange", &self.exchange)
            .field("my_rank", &self.my_rank)
            .field("endpoint", &self.endpoint.id)
            .field("num_workers", &self.sinks.len())
            .finish()
    }
}
