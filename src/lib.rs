/*
 * Copyright (c) Meta Platforms, Inc. and affiliates.
 * All rights reserved.
 *
 * This source code is licensed under the BSD-style license found in the
 * LICENSE file in the root directory of this source tree.
 */

//! Blockmesh is the data plane of a distributed batch-processing
//! runtime: reference-counted byte blocks, typed item serialization,
//! block writers and readers, in-memory files with seek-by-index,
//! producer/consumer block queues, an operator-local pre-reduce hash
//! table, a channel multiplexer shuffling blocks between workers over
//! one connection per peer host, and blocking collective communication
//! primitives.
//!
//! # Data model
//!
//! Items are serialized into fixed-size [`block::ByteBlock`]s, shared
//! read-only once their producing writer releases them. A
//! [`block::Block`] annotates a byte range with item boundaries, so
//! containers can exchange and re-slice data without copying or
//! deserializing it. Containers of blocks — [`file::File`],
//! [`queue::BlockQueue`], and the inbound side of a
//! [`mux::channel::Channel`] — all speak the same
//! [`sink::BlockSink`]/[`reader::BlockSource`] contracts, so a
//! [`writer::BlockWriter`] and [`reader::BlockReader`] work against any
//! of them.
//!
//! # Shuffle path
//!
//! A typical reduce stage flows: source file → reader → pre-reduce
//! table ([`reduce`]) → per-destination writers → channel sinks (or the
//! loop-back queue) → framed bytes on the peer connection → the remote
//! [`mux::Multiplexer`] → per-source inbound queues → reader →
//! post-reduce consumer.
//!
//! # Threads
//!
//! Workers are OS threads; each owns a [`context::Context`] and blocks
//! on queues and collectives. All network I/O is submitted to a single
//! [`net::dispatcher::Dispatcher`] event-loop thread per host.

#![deny(missing_docs)]

pub mod block;
pub mod config;
pub mod context;
pub mod error;
pub mod file;
pub mod item;
pub mod mux;
pub mod net;
pub mod queue;
pub mod reader;
pub mod reduce;
pub mod repository;
pub mod sink;
pub mod writer;

pub use block::Block;
pub use block::BlockPool;
pub use block::ByteBlock;
pub use block::DEFAULT_BLOCK_SIZE;
pub use config::Config;
pub use context::Context;
pub use error::Error;
pub use error::Result;
pub use file::File;
pub use item::Item;
pub use mux::Multiplexer;
pub use queue::BlockQueue;
pub use reader::BlockReader;
pub use writer::BlockWriter;
