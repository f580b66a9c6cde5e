/*
 * Copyright (c) Meta Platforms, Inc. and affiliates.
 * All rights reserved.
 *
 * This source code is licensed under the BSD-style license found in the
 * LICENSE file in the root directory of this source tree.
 */

//! The multiplexer: logical channels over one connection per peer host.
//!
//! Workers exchange large amounts of data over a single ordered byte
//! stream per pair of hosts. Since several exchanges are in flight at
//! the same time, blocks are framed with a [`StreamBlockHeader`] naming
//! their logical channel; the multiplexer keeps one header read armed
//! per peer connection, and on arrival routes the following payload into
//! the channel's inbound queue for the sending worker — creating the
//! channel on first contact, since a peer's data may arrive before the
//! local worker asked for the channel.
//!
//! Channel ids are allocated deterministically: every worker holds a
//! lane in the [`Repository`] and the workers of all hosts execute the
//! same allocation sequence, so ids agree cluster-wide without
//! coordination. The wire id folds the owning worker's lane into the
//! allocated sequence number (`id = seq * workers_per_host + lane`),
//! keeping ids unique across the lanes of one host.

use std::sync::Arc;
use std::sync::Mutex;

use bytes::BytesMut;

use crate::block::Block;
use crate::block::BlockPool;
use crate::config::Config;
use crate::error::Error;
use crate::error::Result;
use crate::mux::channel::Channel;
use crate::mux::channel::ChannelEndpoint;
use crate::mux::header::StreamBlockHeader;
use crate::net::dispatcher::Connection;
use crate::net::transport_fatal;
use crate::repository::Repository;

pub mod channel;
pub mod header;

pub(crate) struct MuxInner {
    pub(crate) pool: BlockPool,
    pub(crate) config: Config,
    /// Connection to each peer host, `None` at our own rank.
    pub(crate) connections: Vec<Option<Connection>>,
    pub(crate) my_host_rank: usize,
    pub(crate) workers_per_host: usize,
    /// Channel endpoints by wire id, plus the per-lane id counters.
    pub(crate) endpoints: Mutex<Repository<ChannelEndpoint>>,
}

impl MuxInner {
    pub(crate) fn num_hosts(&self) -> usize {
        self.connections.len()
    }

    pub(crate) fn num_workers(&self) -> usize {
        self.num_hosts() * self.workers_per_host
    }

    /// Look up the endpoint registered under `wire_id`, creating it on
    /// first contact.
    pub(crate) fn endpoint(&self, wire_id: u64) -> Arc<ChannelEndpoint> {
        let num_workers = self.num_workers();
        self.endpoints
            .lock()
            .unwrap()
            .get_or_create(wire_id, || ChannelEndpoint::new(wire_id, num_workers))
    }
}

/// Multiplexes logical channels over the host's peer connections.
/// Cloning yields another handle onto the same multiplexer; all workers
/// of a host share one.
#[derive(Clone)]
pub struct Multiplexer {
    inner: Arc<MuxInner>,
}

impl Multiplexer {
    /// Create the host's multiplexer and arm a header read on every peer
    /// connection. `connections[h]` is the connection to host `h`, and
    /// must be `None` exactly at `my_host_rank`.
    pub fn new(
        pool: BlockPool,
        config: Config,
        connections: Vec<Option<Connection>>,
        my_host_rank: usize,
        workers_per_host: usize,
    ) -> Self {
        assert!(my_host_rank < connections.len());
        assert!(connections[my_host_rank].is_none());
        assert!(workers_per_host > 0);
        let inner = Arc::new(MuxInner {
            pool,
            config,
            connections,
            my_host_rank,
            workers_per_host,
            endpoints: Mutex::new(Repository::new(workers_per_host)),
        });
        for host in 0..inner.num_hosts() {
            if inner.connections[host].is_some() {
                arm_header_read(Arc::clone(&inner), host);
            }
        }
        Self { inner }
    }

    /// Total number of hosts.
    pub fn num_hosts(&self) -> usize {
        self.inner.num_hosts()
    }

    /// Our rank among the hosts.
    pub fn my_host_rank(&self) -> usize {
        self.inner.my_host_rank
    }

    /// Number of workers per host.
    pub fn workers_per_host(&self) -> usize {
        self.inner.workers_per_host
    }

    /// Total number of workers.
    pub fn num_workers(&self) -> usize {
        self.inner.num_workers()
    }

    /// The byte block pool shared by this host's data plane.
    pub fn pool(&self) -> &BlockPool {
        &self.inner.pool
    }

    /// The data-plane configuration.
    pub fn config(&self) -> &Config {
        &self.inner.config
    }

    /// Allocate the next channel sequence number for `local_worker`.
    /// Every worker must allocate in the same order on every host.
    pub fn allocate_channel(&self, local_worker: usize) -> usize {
        self.inner.endpoints.lock().unwrap().allocate_id(local_worker)
    }

    /// Get `local_worker`'s view of the channel with sequence number
    /// `exchange`, creating its endpoint if needed. Call once per
    /// exchange per worker: the returned channel owns the outbound
    /// writers' sinks.
    pub fn get_or_create_channel(&self, exchange: usize, local_worker: usize) -> Result<Channel> {
        if local_worker >= self.inner.workers_per_host {
            return Err(Error::InvalidConfig(format!(
                "local worker {local_worker} of {}",
                self.inner.workers_per_host
            )));
        }
        Ok(Channel::new(&self.inner, exchange, local_worker))
    }
}

impl std::fmt::Debug for Multiplexer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Multiplexer")
            .field("my_host_rank", &self.inner.my_host_rank)
            .field("num_hosts", &self.inner.num_hosts())
            .field("workers_per_host", &self.inner.workers_per_host)
            .finish()
    }
}

/// Arm the next header read on the connection to `host`. The callback
/// chain re-arms itself after every dispatched block; a clean
/// end-of-stream before a header stops the pump.
fn arm_header_read(inner: Arc<MuxInner>, host: usize) {
    let Some(connection) = inner.connections[host].clone() else {
        return;
    };
    let pump = Arc::clone(&inner);
    connection.async_read(
        StreamBlockHeader::SIZE,
        Box::new(move |bytes| match bytes {
            None => tracing::trace!(host, "peer connection closed"),
            Some(buf) => on_header(pump, host, buf),
        }),
    );
}

/// Parse a header and dispatch: end-of-stream closes the sender's
/// inbound queue; otherwise the payload is read into a fresh byte block
/// and enqueued. Runs on the dispatcher thread.
fn on_header(inner: Arc<MuxInner>, host: usize, buf: BytesMut) {
    let header = match StreamBlockHeader::decode(&buf) {
        Ok(header) => header,
        Err(err) => fatal_protocol(host, err),
    };
    let sender = header.sender_rank as usize;
    if sender >= inner.num_workers() {
        fatal_protocol(
            host,
            Error::protocol(format!("sender rank {sender} out of range")),
        );
    }
    let endpoint = inner.endpoint(header.channel_id);

    if header.is_end() {
        tracing::trace!(
            channel = header.channel_id,
            sender,
            "end of stream"
        );
        endpoint.queues[sender].close_write();
        arm_header_read(inner, host);
        return;
    }

    tracing::trace!(
        channel = header.channel_id,
        sender,
        bytes = header.bytes,
        nitems = header.nitems,
        "stream block header"
    );
    let Some(connection) = inner.connections[host].clone() else {
        return;
    };
    let pump = Arc::clone(&inner);
    connection.async_read(
        header.bytes as usize,
        Box::new(move |bytes| {
            let Some(payload) = bytes else {
                fatal_protocol(
                    host,
                    Error::protocol("peer closed with a block payload outstanding"),
                );
            };
            let byte_block = match pump.pool.adopt(payload.freeze()) {
                Ok(byte_block) => byte_block,
                Err(err) => fatal_protocol(host, err),
            };
            let block = Block::new(
                byte_block,
                0,
                header.bytes as usize,
                header.first_item as usize,
                header.nitems as usize,
            );
            endpoint.queues[sender].append(block);
            arm_header_read(pump, host);
        }),
    );
}

fn fatal_protocol(host: usize, err: Error) -> ! {
    match err {
        Error::TransportFatal(io) => transport_fatal("multiplexer", io),
        other => transport_fatal(
            "multiplexer",
            std::io::Error::new(std::io::ErrorKind::InvalidData, format!("host {host}: {other}")),
        ),
    }
}
