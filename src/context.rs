/*
 * Copyright (c) Meta Platforms, Inc. and affiliates.
 * All rights reserved.
 *
 * This source code is licensed under the BSD-style license found in the
 * LICENSE file in the root directory of this source tree.
 */

//! The per-worker context: identity plus access to the host's shared
//! data-plane services.
//!
//! Each worker thread owns a [`Context`]. Through it the worker
//! allocates channels (in lockstep with its peers on other hosts),
//! reaches the collective primitives, and obtains the block pool and
//! configuration for local files and queues.

use std::sync::Arc;

use crate::block::BlockPool;
use crate::config::Config;
use crate::error::Result;
use crate::file::File;
use crate::mux::channel::Channel;
use crate::mux::Multiplexer;
use crate::net::flow::FlowControlChannel;
use crate::net::group::Group;
use crate::writer::BlockWriter;

/// A worker's identity and its handles to the host's data plane.
#[derive(Clone)]
pub struct Context {
    multiplexer: Multiplexer,
    flow: FlowControlChannel,
    local_worker_id: usize,
}

impl Context {
    /// Create the context of worker `local_worker_id` on this host.
    /// `flow_group` is the worker-level peer group used by the
    /// collectives; its size must equal the total worker count.
    pub fn new(
        multiplexer: Multiplexer,
        flow_group: Arc<dyn Group>,
        local_worker_id: usize,
    ) -> Self {
        assert!(local_worker_id < multiplexer.workers_per_host());
        assert_eq!(flow_group.num_hosts(), multiplexer.num_workers());
        Self {
            flow: FlowControlChannel::new(flow_group),
            multiplexer,
            local_worker_id,
        }
    }

    /// This host's rank among the hosts.
    pub fn my_host_rank(&self) -> usize {
        self.multiplexer.my_host_rank()
    }

    /// This worker's id on its host.
    pub fn local_worker_id(&self) -> usize {
        self.local_worker_id
    }

    /// This worker's global rank.
    pub fn my_rank(&self) -> usize {
        self.my_host_rank() * self.multiplexer.workers_per_host() + self.local_worker_id
    }

    /// Total number of hosts.
    pub fn num_hosts(&self) -> usize {
        self.multiplexer.num_hosts()
    }

    /// Number of workers per host.
    pub fn workers_per_host(&self) -> usize {
        self.multiplexer.workers_per_host()
    }

    /// Total number of workers.
    pub fn num_workers(&self) -> usize {
        self.multiplexer.num_workers()
    }

    /// The host's shared multiplexer.
    pub fn multiplexer(&self) -> &Multiplexer {
        &self.multiplexer
    }

    /// The host's byte block pool.
    pub fn pool(&self) -> &BlockPool {
        self.multiplexer.pool()
    }

    /// The data-plane configuration.
    pub fn config(&self) -> &Config {
        self.multiplexer.config()
    }

    /// Allocate and create the next channel. Workers must call this in
    /// the same order on every host, which makes the ids agree.
    pub fn new_channel(&self) -> Result<Channel> {
        let exchange = self.multiplexer.allocate_channel(self.local_worker_id);
        self.multiplexer
            .get_or_create_channel(exchange, self.local_worker_id)
    }

    /// This worker's view of the channel with sequence number
    /// `exchange`.
    pub fn get_or_create_channel(&self, exchange: usize) -> Result<Channel> {
        self.multiplexer
            .get_or_create_channel(exchange, self.local_worker_id)
    }

    /// The worker's typed collectives handle.
    pub fn flow_control(&self) -> &FlowControlChannel {
        &self.flow
    }

    /// Create an empty file using the context's pool and block size.
    pub fn new_file(&self) -> File {
        File::new()
    }

    /// Create a file writer with the context's pool, block size, and
    /// self-verify mode.
    pub fn new_file_writer(&self, file: &File) -> Result<BlockWriter<File>> {
        Ok(file
            .writer(self.pool().clone(), self.config().block_size)?
            .with_verify(self.config().self_verify))
    }
}

impl std::fmt::Debug for Context {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Context")
            .field("my_rank", &self.my_rank())
            .field("host", &self.my_host_rank())
            .field("local_worker", &self.local_worker_id)
            .finish()
    }
}
